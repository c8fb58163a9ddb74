//! Two-step withdrawal flow: create an outstanding request carrying a
//! one-time token, then confirm it with that token before any funds move.
//!
//! Creating a new request denies every outstanding one for the same owner,
//! so at most one token per owner is ever live. The confirm step debits the
//! ledger before asking the wallet to send; a send failure after the debit
//! is reported but never rolled back, because the daemon may have broadcast
//! the payment before the error reached us.

use std::sync::Arc;

use rand::Rng;
use rand::distr::Alphanumeric;
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::daemon::rpc::WalletRpc;
use crate::ledger::LedgerError;
use crate::ledger::store::LedgerStore;
use crate::ledger::types::WithdrawalRecord;

const TOKEN_LEN: usize = 32;

/// Result of a confirmation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmOutcome {
    /// The ledger was debited. `txid` is absent when the daemon send failed
    /// after the debit; the discrepancy is left for operator review.
    Confirmed { txid: Option<String> },
    /// The withdrawal was (or has now been) denied.
    Denied(DenyReason),
    /// The withdrawal carries no token, so it can never be confirmed.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    AlreadyProcessed,
    InsufficientBalance,
}

pub struct WithdrawalConfirmer {
    rpc: Arc<dyn WalletRpc>,
    store: LedgerStore,
}

impl WithdrawalConfirmer {
    pub fn new(rpc: Arc<dyn WalletRpc>, store: LedgerStore) -> Self {
        Self { rpc, store }
    }

    /// Register a withdrawal request. Any outstanding request for the same
    /// owner is denied first, so the returned token is the only live one.
    pub async fn create(
        &self,
        owner: &str,
        address: &str,
        amount: Decimal,
    ) -> Result<WithdrawalRecord, LedgerError> {
        for stale in self.store.outstanding_withdrawals(owner).await? {
            warn!(uuid = %stale.uuid, %owner, "denying superseded withdrawal");
            self.store.deny_withdrawal(&stale.uuid).await?;
        }

        let token: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(TOKEN_LEN)
            .map(char::from)
            .collect();
        let record = self
            .store
            .create_withdrawal(owner, address, amount, &token)
            .await?;
        info!(uuid = %record.uuid, %owner, %amount, "withdrawal created");
        Ok(record)
    }

    /// Confirm a withdrawal by uuid. On success the ledger is debited and
    /// the daemon asked to send.
    pub async fn confirm(&self, uuid: &str) -> Result<ConfirmOutcome, LedgerError> {
        let record = self
            .store
            .load_withdrawal(uuid)
            .await?
            .ok_or_else(|| LedgerError::UnknownWithdrawal(uuid.to_string()))?;

        if record.confirmed {
            self.store.deny_withdrawal(uuid).await?;
            return Ok(ConfirmOutcome::Denied(DenyReason::AlreadyProcessed));
        }
        if record.token.is_none() {
            return Ok(ConfirmOutcome::Rejected);
        }

        let balance = self.store.balance(&record.owner).await?;
        if balance < record.amount {
            warn!(%uuid, %balance, amount = %record.amount, "withdrawal exceeds balance, denying");
            self.store.deny_withdrawal(uuid).await?;
            return Ok(ConfirmOutcome::Denied(DenyReason::InsufficientBalance));
        }

        // The debit. A concurrent confirm loses here and is reported as
        // already processed.
        if !self.store.confirm_withdrawal(uuid).await? {
            return Ok(ConfirmOutcome::Denied(DenyReason::AlreadyProcessed));
        }

        match self.rpc.send(&record.address, record.amount).await {
            Ok(txid) => {
                self.store.record_withdrawal_txid(uuid, &txid).await?;
                info!(%uuid, %txid, "withdrawal sent");
                Ok(ConfirmOutcome::Confirmed { txid: Some(txid) })
            }
            Err(e) => {
                error!(%uuid, error = %e, "send failed after ledger debit");
                Ok(ConfirmOutcome::Confirmed { txid: None })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use crate::daemon::rpc::RpcError;
    use crate::daemon::types::WalletTransaction;
    use crate::ledger::store::hash_context;

    struct SendingWallet {
        sends: AtomicUsize,
        fail: bool,
        last: Mutex<Option<(String, Decimal)>>,
    }

    impl SendingWallet {
        fn new(fail: bool) -> Self {
            Self {
                sends: AtomicUsize::new(0),
                fail,
                last: Mutex::new(None),
            }
        }
    }

    #[async_trait]
    impl WalletRpc for SendingWallet {
        async fn create_address(&self) -> Result<String, RpcError> {
            unimplemented!()
        }

        async fn list_transactions(&self, _: usize, _: usize) -> Result<Vec<Value>, RpcError> {
            unimplemented!()
        }

        async fn get_transaction(&self, _: &str) -> Result<Value, RpcError> {
            unimplemented!()
        }

        async fn send(&self, address: &str, amount: Decimal) -> Result<String, RpcError> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            *self.last.lock().unwrap() = Some((address.to_string(), amount));
            if self.fail {
                Err(RpcError::Daemon {
                    code: -6,
                    message: "Insufficient funds".into(),
                })
            } else {
                Ok("sent-txid".to_string())
            }
        }
    }

    async fn funded_store(owner_ctx: &[u8], amount: &str) -> LedgerStore {
        let store = LedgerStore::in_memory().await.unwrap();
        store.store_address("addr1", Some(owner_ctx)).await.unwrap();
        store
            .store_transaction(&WalletTransaction {
                txid: "t1".into(),
                category: "receive".into(),
                address: "addr1".into(),
                amount: Decimal::from_str(amount).unwrap(),
                confirmations: 1,
                orig: json!({}),
            })
            .await
            .unwrap();
        store.mark_applied("t1", "addr1").await.unwrap();
        store
    }

    #[tokio::test]
    async fn creating_denies_previous_outstanding_requests() {
        let store = LedgerStore::in_memory().await.unwrap();
        let confirmer = WithdrawalConfirmer::new(Arc::new(SendingWallet::new(false)), store.clone());

        let first = confirmer.create("owner1", "dest", Decimal::ONE).await.unwrap();
        let second = confirmer.create("owner1", "dest", Decimal::ONE).await.unwrap();

        let outstanding = store.outstanding_withdrawals("owner1").await.unwrap();
        assert_eq!(outstanding.len(), 1);
        assert_eq!(outstanding[0].uuid, second.uuid);

        // The superseded request is dead.
        assert_eq!(
            confirmer.confirm(&first.uuid).await.unwrap(),
            ConfirmOutcome::Rejected
        );
    }

    #[tokio::test]
    async fn confirm_debits_then_sends() {
        let owner = hash_context(b"ctx-a");
        let store = funded_store(b"ctx-a", "1.0").await;
        let wallet = Arc::new(SendingWallet::new(false));
        let confirmer = WithdrawalConfirmer::new(wallet.clone(), store.clone());

        let w = confirmer
            .create(&owner, "dest", Decimal::from_str("0.4").unwrap())
            .await
            .unwrap();
        let outcome = confirmer.confirm(&w.uuid).await.unwrap();

        assert_eq!(
            outcome,
            ConfirmOutcome::Confirmed {
                txid: Some("sent-txid".to_string())
            }
        );
        assert_eq!(wallet.sends.load(Ordering::SeqCst), 1);
        assert_eq!(
            *wallet.last.lock().unwrap(),
            Some(("dest".to_string(), Decimal::from_str("0.4").unwrap()))
        );
        assert_eq!(
            store.balance(&owner).await.unwrap(),
            Decimal::from_str("0.6").unwrap()
        );
        let loaded = store.load_withdrawal(&w.uuid).await.unwrap().unwrap();
        assert_eq!(loaded.txid.as_deref(), Some("sent-txid"));
    }

    #[tokio::test]
    async fn insufficient_balance_denies_without_sending() {
        let owner = hash_context(b"ctx-a");
        let store = funded_store(b"ctx-a", "0.1").await;
        let wallet = Arc::new(SendingWallet::new(false));
        let confirmer = WithdrawalConfirmer::new(wallet.clone(), store.clone());

        let w = confirmer.create(&owner, "dest", Decimal::ONE).await.unwrap();
        let outcome = confirmer.confirm(&w.uuid).await.unwrap();

        assert_eq!(
            outcome,
            ConfirmOutcome::Denied(DenyReason::InsufficientBalance)
        );
        assert_eq!(wallet.sends.load(Ordering::SeqCst), 0);
        // Denied is terminal.
        assert_eq!(
            confirmer.confirm(&w.uuid).await.unwrap(),
            ConfirmOutcome::Rejected
        );
    }

    #[tokio::test]
    async fn second_confirm_is_already_processed() {
        let owner = hash_context(b"ctx-a");
        let store = funded_store(b"ctx-a", "1.0").await;
        let wallet = Arc::new(SendingWallet::new(false));
        let confirmer = WithdrawalConfirmer::new(wallet.clone(), store);

        let w = confirmer
            .create(&owner, "dest", Decimal::from_str("0.4").unwrap())
            .await
            .unwrap();
        confirmer.confirm(&w.uuid).await.unwrap();
        let outcome = confirmer.confirm(&w.uuid).await.unwrap();

        assert_eq!(outcome, ConfirmOutcome::Denied(DenyReason::AlreadyProcessed));
        assert_eq!(wallet.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn send_failure_keeps_the_debit() {
        let owner = hash_context(b"ctx-a");
        let store = funded_store(b"ctx-a", "1.0").await;
        let wallet = Arc::new(SendingWallet::new(true));
        let confirmer = WithdrawalConfirmer::new(wallet, store.clone());

        let w = confirmer
            .create(&owner, "dest", Decimal::from_str("0.4").unwrap())
            .await
            .unwrap();
        let outcome = confirmer.confirm(&w.uuid).await.unwrap();

        assert_eq!(outcome, ConfirmOutcome::Confirmed { txid: None });
        assert_eq!(
            store.balance(&owner).await.unwrap(),
            Decimal::from_str("0.6").unwrap()
        );
        let loaded = store.load_withdrawal(&w.uuid).await.unwrap().unwrap();
        assert!(loaded.confirmed);
        assert_eq!(loaded.txid, None);
    }

    #[tokio::test]
    async fn unknown_uuid_is_an_error() {
        let store = LedgerStore::in_memory().await.unwrap();
        let confirmer = WithdrawalConfirmer::new(Arc::new(SendingWallet::new(false)), store);
        let err = confirmer.confirm("nope").await.unwrap_err();
        assert!(matches!(err, LedgerError::UnknownWithdrawal(_)));
    }
}
