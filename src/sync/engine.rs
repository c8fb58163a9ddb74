//! Reconciliation engine.
//!
//! Compares what the daemon's wallet reports against the stored ledger and
//! resolves every difference: new transactions are recorded, changed ones
//! updated, and first-time receives credited to their owner exactly once.
//! The engine is deliberately idempotent end to end, so a full rescan is
//! always a safe answer to any uncertainty (missed notification, sequence
//! gap, restart).

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::daemon::rpc::{RpcError, WalletRpc};
use crate::daemon::types::WalletTransaction;
use crate::ledger::store::LedgerStore;
use crate::ledger::types::TxRecord;
use crate::sync::SyncError;
use crate::sync::events::{DiffKind, DiffSink, TxDiff};

/// How many recent wallet transactions a rescan pulls.
const RESCAN_WINDOW: usize = 100;

/// Transactions at or above this confirmation depth are settled and no
/// longer diffed during rescans.
const LOW_CONF_THRESHOLD: i64 = 10;

pub struct ReconcileEngine {
    rpc: Arc<dyn WalletRpc>,
    store: LedgerStore,
    sink: Arc<dyn DiffSink>,
}

impl ReconcileEngine {
    pub fn new(rpc: Arc<dyn WalletRpc>, store: LedgerStore, sink: Arc<dyn DiffSink>) -> Self {
        Self { rpc, store, sink }
    }

    /// React to a single transaction notification. The named transaction is
    /// diffed directly, then a rescan sweeps up anything else that moved in
    /// the same block or was missed earlier.
    pub async fn handle_tx_hash(&self, txid: &str) -> Result<(), SyncError> {
        let value = match self.rpc.get_transaction(txid).await {
            Ok(value) => value,
            // The daemon saw a transaction that does not touch this wallet.
            Err(RpcError::NotWalletTransaction(_)) => {
                debug!(%txid, "not a wallet transaction");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let entries = match WalletTransaction::from_get_transaction(&value) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(%txid, error = %e, "unreadable gettransaction payload, skipping");
                Vec::new()
            }
        };
        let txs: Vec<WalletTransaction> = entries
            .into_iter()
            .filter_map(|entry| match entry {
                Ok(tx) => Some(tx),
                Err(e) => {
                    debug!(%txid, error = %e, "skipping transaction detail");
                    None
                }
            })
            .collect();
        self.diff_batch(&txs).await?;

        self.rescan().await
    }

    /// Diff the daemon's recent transaction window against the ledger.
    pub async fn rescan(&self) -> Result<(), SyncError> {
        let entries = self.rpc.list_transactions(RESCAN_WINDOW, 0).await?;

        let txs: Vec<WalletTransaction> = entries
            .iter()
            .filter_map(|entry| match WalletTransaction::from_value(entry) {
                Ok(tx) => Some(tx),
                Err(e) => {
                    warn!(error = %e, "skipping malformed wallet transaction");
                    None
                }
            })
            .filter(|tx| tx.confirmations < LOW_CONF_THRESHOLD)
            .collect();

        debug!(count = txs.len(), "rescanning unsettled transactions");
        self.diff_batch(&txs).await
    }

    async fn diff_batch(&self, txs: &[WalletTransaction]) -> Result<(), SyncError> {
        if txs.is_empty() {
            return Ok(());
        }

        let txids: Vec<String> = txs.iter().map(|tx| tx.txid.clone()).collect();
        let stored = self.store.load_transactions(&txids).await?;

        for tx in txs {
            if let Some(diff) = self.diff_tx(tx, &stored).await? {
                if let Err(e) = self.sink.emit(&diff).await {
                    warn!(txid = %diff.txid, error = %e, "diff sink delivery failed");
                }
            }
        }
        Ok(())
    }

    /// Diff one daemon transaction against its stored record, which is
    /// keyed by (txid, address) since one transaction pays each receiving
    /// address separately. Returns the event to publish, or `None` when
    /// nothing changed.
    async fn diff_tx(
        &self,
        tx: &WalletTransaction,
        stored: &HashMap<(String, String), TxRecord>,
    ) -> Result<Option<TxDiff>, SyncError> {
        let kind = match stored.get(&(tx.txid.clone(), tx.address.clone())) {
            None => DiffKind::New,
            Some(record)
                if record.amount != tx.amount || record.confirmations != tx.confirmations =>
            {
                DiffKind::Modified
            }
            Some(_) => return Ok(None),
        };

        self.store.store_transaction(tx).await?;

        if tx.category == "receive" {
            // Credits exactly once no matter how often the same receive is
            // rediffed.
            if self.store.mark_applied(&tx.txid, &tx.address).await? {
                self.store.deactivate_address(&tx.address).await?;
                info!(txid = %tx.txid, address = %tx.address, amount = %tx.amount, "deposit credited");
            }
        }

        let context = self.store.lookup_context(&tx.address).await?;
        Ok(Some(TxDiff {
            uuid: TxDiff::new_event_id(),
            kind,
            txid: tx.txid.clone(),
            category: tx.category.clone(),
            address: tx.address.clone(),
            context,
            amount: tx.amount,
            confirmations: tx.confirmations,
            orig: tx.orig.clone(),
        }))
    }
}
