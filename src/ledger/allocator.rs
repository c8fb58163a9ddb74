//! Deposit address allocation.
//!
//! Addresses are reused for the same owner context until they have seen a
//! transaction; only then does a fresh one come from the wallet. This keeps
//! the wallet keypool small without ever handing the same address to two
//! owners.

use std::sync::Arc;

use tracing::{debug, info};

use crate::daemon::rpc::WalletRpc;
use crate::ledger::LedgerError;
use crate::ledger::store::LedgerStore;

pub struct AddressAllocator {
    rpc: Arc<dyn WalletRpc>,
    store: LedgerStore,
}

impl AddressAllocator {
    pub fn new(rpc: Arc<dyn WalletRpc>, store: LedgerStore) -> Self {
        Self { rpc, store }
    }

    /// The deposit address for this context. Returns the existing unused
    /// address when one is on record, otherwise asks the wallet for a new
    /// one and binds it.
    pub async fn get_address(&self, context: &[u8]) -> Result<String, LedgerError> {
        if let Some(address) = self.store.lookup_unused_address(context).await? {
            debug!(%address, "reusing unused deposit address");
            return Ok(address);
        }

        let address = self.rpc.create_address().await?;
        self.store.store_address(&address, Some(context)).await?;
        info!(%address, "allocated fresh deposit address");
        Ok(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use rust_decimal::Decimal;
    use serde_json::Value;

    use crate::daemon::rpc::RpcError;

    struct ScriptedWallet {
        addresses: Mutex<VecDeque<String>>,
        created: AtomicUsize,
    }

    impl ScriptedWallet {
        fn new(addresses: Vec<&str>) -> Self {
            Self {
                addresses: Mutex::new(addresses.into_iter().map(String::from).collect()),
                created: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl WalletRpc for ScriptedWallet {
        async fn create_address(&self) -> Result<String, RpcError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(self.addresses.lock().unwrap().pop_front().unwrap())
        }

        async fn list_transactions(&self, _: usize, _: usize) -> Result<Vec<Value>, RpcError> {
            unimplemented!()
        }

        async fn get_transaction(&self, _: &str) -> Result<Value, RpcError> {
            unimplemented!()
        }

        async fn send(&self, _: &str, _: Decimal) -> Result<String, RpcError> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn unused_address_is_reused_without_touching_the_wallet() {
        let store = LedgerStore::in_memory().await.unwrap();
        let wallet = Arc::new(ScriptedWallet::new(vec!["addr1"]));
        let allocator = AddressAllocator::new(wallet.clone(), store);

        let first = allocator.get_address(b"ctx-a").await.unwrap();
        let second = allocator.get_address(b"ctx-a").await.unwrap();

        assert_eq!(first, "addr1");
        assert_eq!(second, "addr1");
        assert_eq!(wallet.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn contexts_never_share_an_address() {
        let store = LedgerStore::in_memory().await.unwrap();
        let wallet = Arc::new(ScriptedWallet::new(vec!["addr1", "addr2"]));
        let allocator = AddressAllocator::new(wallet, store);

        let a = allocator.get_address(b"ctx-a").await.unwrap();
        let b = allocator.get_address(b"ctx-b").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn used_address_forces_a_fresh_allocation() {
        let store = LedgerStore::in_memory().await.unwrap();
        let wallet = Arc::new(ScriptedWallet::new(vec!["addr1", "addr2"]));
        let allocator = AddressAllocator::new(wallet.clone(), store.clone());

        let first = allocator.get_address(b"ctx-a").await.unwrap();
        store
            .store_transaction(&crate::daemon::types::WalletTransaction {
                txid: "t1".into(),
                category: "receive".into(),
                address: first.clone(),
                amount: Decimal::ONE,
                confirmations: 0,
                orig: serde_json::json!({}),
            })
            .await
            .unwrap();

        let second = allocator.get_address(b"ctx-a").await.unwrap();
        assert_ne!(first, second);
        assert_eq!(wallet.created.load(Ordering::SeqCst), 2);
    }
}
