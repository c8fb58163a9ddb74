//! The local ledger: persistent address/transaction/withdrawal records,
//! address allocation, and withdrawal confirmation.
//!
//! The [`store::LedgerStore`] is the only component that mutates persisted
//! state; the allocator and confirmer (and the reconciliation engine over in
//! `sync`) only request mutations through it.

pub mod allocator;
pub mod store;
pub mod types;
pub mod withdraw;

pub use allocator::AddressAllocator;
pub use store::{LedgerStore, StoreError, hash_context};
pub use types::{TxRecord, WithdrawalRecord};
pub use withdraw::{ConfirmOutcome, DenyReason, WithdrawalConfirmer};

use thiserror::Error;

use crate::daemon::rpc::RpcError;

/// Failures from ledger operations that also touch the daemon.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    #[error("rpc failure: {0}")]
    Rpc(#[from] RpcError),

    #[error("unknown withdrawal: {0}")]
    UnknownWithdrawal(String),
}
