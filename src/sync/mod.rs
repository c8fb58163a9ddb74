//! Daemon-driven reconciliation: the ZMQ notification subscriber, the
//! reconciliation engine that diffs daemon state against the ledger, and the
//! sink through which resulting diffs are published.

pub mod engine;
pub mod events;
pub mod subscriber;

pub use engine::ReconcileEngine;
pub use events::{DiffKind, DiffSink, LogSink, TxDiff};
pub use subscriber::{EventSubscriber, FeedError, NotificationFeed, ZmqFeed};

use thiserror::Error;

use crate::daemon::rpc::RpcError;
use crate::ledger::store::StoreError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("rpc failure: {0}")]
    Rpc(#[from] RpcError),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    #[error("notification feed failure: {0}")]
    Feed(#[from] FeedError),
}
