//! SQLite-backed ledger store, one database per daemon instance.
//!
//! Holds three tables: `addr` (receiving addresses and their owner
//! contexts), `tx` (the local mirror of daemon-reported transactions), and
//! `withdrawal` (outbound payments). All writes are single-statement
//! transactional upserts so concurrent reconciliation passes for the same
//! instance cannot lose updates. Amounts are stored as decimal text and
//! summed in Rust; they never pass through a float.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;

use chrono::Utc;
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::daemon::types::WalletTransaction;
use crate::ledger::types::{TxRecord, WithdrawalRecord};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("corrupt ledger record: {0}")]
    Corrupt(String),
}

/// Digest used to index addresses by owner context without storing the raw
/// context in the lookup column.
pub fn hash_context(context: &[u8]) -> String {
    hex::encode(Sha256::digest(context))
}

#[derive(Clone)]
pub struct LedgerStore {
    pool: SqlitePool,
}

impl LedgerStore {
    /// Open (or create) the instance's database file.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePool::connect(&url).await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// In-memory store. All data is lost on drop; meant for tests.
    pub async fn in_memory() -> Result<Self, StoreError> {
        // A single pooled connection, kept alive: every pooled connection to
        // `sqlite::memory:` would otherwise be its own empty database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS addr (
                id          INTEGER PRIMARY KEY,
                address     TEXT    NOT NULL UNIQUE,
                context     BLOB    NULL,
                contexthash TEXT    NULL,
                active      INTEGER NOT NULL DEFAULT 1,
                created     TEXT    NOT NULL,
                modified    TEXT    NOT NULL
            );",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS tx (
                uuid          TEXT    NOT NULL,
                txid          TEXT    NOT NULL,
                addrid        INTEGER NOT NULL REFERENCES addr(id),
                amount        TEXT    NOT NULL,
                confirmations INTEGER NOT NULL,
                orig          TEXT    NOT NULL,
                silenced      INTEGER NOT NULL DEFAULT 0,
                created       TEXT    NOT NULL,
                modified      TEXT    NOT NULL
            );",
        )
        .execute(&self.pool)
        .await?;

        // One transaction record per (daemon txid, address).
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_tx_txid_addr ON tx (txid, addrid);",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS withdrawal (
                uuid      TEXT    NOT NULL UNIQUE,
                owner     TEXT    NOT NULL,
                address   TEXT    NOT NULL,
                amount    TEXT    NOT NULL,
                token     TEXT    NULL,
                confirmed INTEGER NOT NULL DEFAULT 0,
                txid      TEXT    NULL,
                created   TEXT    NOT NULL,
                modified  TEXT    NOT NULL
            );",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ── Addresses ────────────────────────────────────────────────────────

    /// Upsert an address, binding it to a context. An existing unused
    /// address is upgraded in place; the address string itself is immutable.
    pub async fn store_address(
        &self,
        address: &str,
        context: Option<&[u8]>,
    ) -> Result<(), StoreError> {
        let contexthash = context.map(hash_context);
        let now = now();
        sqlx::query(
            "INSERT INTO addr (address, context, contexthash, active, created, modified)
             VALUES (?, ?, ?, 1, ?, ?)
             ON CONFLICT(address) DO UPDATE SET
                 context = excluded.context,
                 contexthash = excluded.contexthash,
                 modified = excluded.modified",
        )
        .bind(address)
        .bind(context.map(<[u8]>::to_vec))
        .bind(contexthash)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Resolve an address string to its row id, inserting a bare row (no
    /// context) when the address has never been seen.
    async fn ensure_address(&self, address: &str) -> Result<i64, StoreError> {
        let now = now();
        sqlx::query(
            "INSERT INTO addr (address, context, contexthash, active, created, modified)
             VALUES (?, NULL, NULL, 1, ?, ?)
             ON CONFLICT(address) DO NOTHING",
        )
        .bind(address)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT id FROM addr WHERE address = ?")
            .bind(address)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("id"))
    }

    /// An address bound to this context that no transaction references yet,
    /// if one exists.
    pub async fn lookup_unused_address(
        &self,
        context: &[u8],
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query(
            "SELECT addr.address FROM addr
             LEFT JOIN tx ON tx.addrid = addr.id
             WHERE addr.contexthash = ? AND addr.active = 1 AND tx.addrid IS NULL
             LIMIT 1",
        )
        .bind(hash_context(context))
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("address")))
    }

    /// The owner context bound to an address, if any.
    pub async fn lookup_context(&self, address: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let row = sqlx::query("SELECT context FROM addr WHERE address = ?")
            .bind(address)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.get::<Option<Vec<u8>>, _>("context")))
    }

    /// Deactivate an address once it has received funds, so the allocator
    /// never hands it out again. Addresses are deactivated, not deleted.
    pub async fn deactivate_address(&self, address: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE addr SET active = 0, modified = ? WHERE address = ?")
            .bind(now())
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ── Transactions ─────────────────────────────────────────────────────

    /// Bulk-fetch stored transactions keyed by (daemon txid, address),
    /// joined with the owning address. One daemon transaction legitimately
    /// produces one record per receiving address; a second row for the same
    /// pair violates the unique index and is logged and skipped.
    pub async fn load_transactions(
        &self,
        txids: &[String],
    ) -> Result<HashMap<(String, String), TxRecord>, StoreError> {
        if txids.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = vec!["?"; txids.len()].join(", ");
        let sql = format!(
            "SELECT tx.uuid, tx.txid, tx.addrid, tx.amount, tx.confirmations, tx.silenced,
                    addr.address, addr.context
             FROM tx JOIN addr ON addr.id = tx.addrid
             WHERE tx.txid IN ({placeholders})"
        );

        let mut query = sqlx::query(&sql);
        for txid in txids {
            query = query.bind(txid);
        }

        let mut records = HashMap::new();
        for row in query.fetch_all(&self.pool).await? {
            let txid: String = row.get("txid");
            let address: String = row.get("address");
            if records.contains_key(&(txid.clone(), address.clone())) {
                warn!(%txid, %address, "multiple stored records for one (txid, address), skipping extra");
                continue;
            }
            let amount: String = row.get("amount");
            let amount = Decimal::from_str(&amount)
                .map_err(|e| StoreError::Corrupt(format!("tx {txid} amount: {e}")))?;
            records.insert(
                (txid.clone(), address.clone()),
                TxRecord {
                    uuid: row.get("uuid"),
                    txid,
                    addr_id: row.get("addrid"),
                    address,
                    context: row.get::<Option<Vec<u8>>, _>("context"),
                    amount,
                    confirmations: row.get("confirmations"),
                    applied: row.get("silenced"),
                },
            );
        }
        Ok(records)
    }

    /// Upsert a daemon-reported transaction. The synthetic uuid is assigned
    /// on insert and never rewritten; updates only touch amount,
    /// confirmations, the raw payload, and the modified stamp.
    pub async fn store_transaction(&self, tx: &WalletTransaction) -> Result<(), StoreError> {
        let addr_id = self.ensure_address(&tx.address).await?;
        let now = now();
        sqlx::query(
            "INSERT INTO tx (uuid, txid, addrid, amount, confirmations, orig, silenced, created, modified)
             VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?)
             ON CONFLICT(txid, addrid) DO UPDATE SET
                 amount = excluded.amount,
                 confirmations = excluded.confirmations,
                 orig = excluded.orig,
                 modified = excluded.modified",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&tx.txid)
        .bind(addr_id)
        .bind(tx.amount.to_string())
        .bind(tx.confirmations)
        .bind(tx.orig.to_string())
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Flip the applied flag false→true for one (txid, address) record.
    /// Returns whether this call performed the transition; a second call is
    /// a no-op and returns false, which is what makes deposit crediting
    /// exactly-once.
    pub async fn mark_applied(&self, txid: &str, address: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE tx SET silenced = 1, modified = ?
             WHERE txid = ?
               AND addrid = (SELECT id FROM addr WHERE address = ?)
               AND silenced = 0",
        )
        .bind(now())
        .bind(txid)
        .bind(address)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ── Balances ─────────────────────────────────────────────────────────

    /// Available balance for an owner (context hash): credited deposits
    /// minus confirmed withdrawals. Summed in Rust to keep decimals exact.
    pub async fn balance(&self, owner: &str) -> Result<Decimal, StoreError> {
        let mut balance = Decimal::ZERO;

        let deposits = sqlx::query(
            "SELECT tx.amount FROM tx
             JOIN addr ON addr.rowid = tx.addrid
             WHERE addr.contexthash = ? AND tx.silenced = 1",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        for row in deposits {
            let amount: String = row.get("amount");
            balance += Decimal::from_str(&amount)
                .map_err(|e| StoreError::Corrupt(format!("deposit amount: {e}")))?;
        }

        let withdrawals =
            sqlx::query("SELECT amount FROM withdrawal WHERE owner = ? AND confirmed = 1")
                .bind(owner)
                .fetch_all(&self.pool)
                .await?;
        for row in withdrawals {
            let amount: String = row.get("amount");
            balance -= Decimal::from_str(&amount)
                .map_err(|e| StoreError::Corrupt(format!("withdrawal amount: {e}")))?;
        }

        debug!(%owner, %balance, "computed balance");
        Ok(balance)
    }

    // ── Withdrawals ──────────────────────────────────────────────────────

    pub async fn create_withdrawal(
        &self,
        owner: &str,
        address: &str,
        amount: Decimal,
        token: &str,
    ) -> Result<WithdrawalRecord, StoreError> {
        let record = WithdrawalRecord {
            uuid: Uuid::new_v4().to_string(),
            owner: owner.to_string(),
            address: address.to_string(),
            amount,
            token: Some(token.to_string()),
            confirmed: false,
            txid: None,
        };
        let now = now();
        sqlx::query(
            "INSERT INTO withdrawal (uuid, owner, address, amount, token, confirmed, txid, created, modified)
             VALUES (?, ?, ?, ?, ?, 0, NULL, ?, ?)",
        )
        .bind(&record.uuid)
        .bind(owner)
        .bind(address)
        .bind(amount.to_string())
        .bind(token)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(record)
    }

    pub async fn load_withdrawal(
        &self,
        uuid: &str,
    ) -> Result<Option<WithdrawalRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT uuid, owner, address, amount, token, confirmed, txid
             FROM withdrawal WHERE uuid = ?",
        )
        .bind(uuid)
        .fetch_optional(&self.pool)
        .await?;
        row.map(withdrawal_from_row).transpose()
    }

    /// Every withdrawal for this owner with a live token and no
    /// confirmation.
    pub async fn outstanding_withdrawals(
        &self,
        owner: &str,
    ) -> Result<Vec<WithdrawalRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT uuid, owner, address, amount, token, confirmed, txid
             FROM withdrawal
             WHERE owner = ? AND token IS NOT NULL AND confirmed = 0",
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(withdrawal_from_row).collect()
    }

    /// Clear the token. Terminal for that token; a denied withdrawal can
    /// never be confirmed afterwards.
    pub async fn deny_withdrawal(&self, uuid: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE withdrawal SET token = NULL, modified = ? WHERE uuid = ?")
            .bind(now())
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Consume the token and mark confirmed. The confirmed row is the
    /// balance debit. Returns false when the withdrawal was already
    /// processed.
    pub async fn confirm_withdrawal(&self, uuid: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE withdrawal SET token = NULL, confirmed = 1, modified = ?
             WHERE uuid = ? AND confirmed = 0 AND token IS NOT NULL",
        )
        .bind(now())
        .bind(uuid)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn record_withdrawal_txid(&self, uuid: &str, txid: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE withdrawal SET txid = ?, modified = ? WHERE uuid = ?")
            .bind(txid)
            .bind(now())
            .bind(uuid)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

fn withdrawal_from_row(row: sqlx::sqlite::SqliteRow) -> Result<WithdrawalRecord, StoreError> {
    let uuid: String = row.get("uuid");
    let amount: String = row.get("amount");
    let amount = Decimal::from_str(&amount)
        .map_err(|e| StoreError::Corrupt(format!("withdrawal {uuid} amount: {e}")))?;
    Ok(WithdrawalRecord {
        uuid,
        owner: row.get("owner"),
        address: row.get("address"),
        amount,
        token: row.get("token"),
        confirmed: row.get("confirmed"),
        txid: row.get("txid"),
    })
}

fn now() -> String {
    Utc::now().to_rfc3339()
}
