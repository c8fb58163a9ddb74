//! Transaction diff events and the sink they are published through.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;
use tracing::info;
use uuid::Uuid;

/// How a daemon-reported transaction differs from the stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffKind {
    /// No stored record existed.
    New,
    /// A stored record existed with a different amount or confirmation
    /// count.
    Modified,
}

/// One observed difference between daemon state and the ledger. Unchanged
/// transactions produce no event.
#[derive(Debug, Clone, PartialEq)]
pub struct TxDiff {
    /// Event identifier, unique per emission.
    pub uuid: String,
    pub kind: DiffKind,
    pub txid: String,
    pub category: String,
    pub address: String,
    /// Owner context of the receiving address, when one is bound.
    pub context: Option<Vec<u8>>,
    pub amount: Decimal,
    pub confirmations: i64,
    /// Raw daemon payload the diff was computed from.
    pub orig: Value,
}

impl TxDiff {
    pub fn new_event_id() -> String {
        Uuid::new_v4().to_string()
    }
}

pub type SinkError = Box<dyn std::error::Error + Send + Sync>;

/// Consumer of diff events. Delivery failures are logged by the engine and
/// never abort a reconciliation pass.
#[async_trait]
pub trait DiffSink: Send + Sync {
    async fn emit(&self, diff: &TxDiff) -> Result<(), SinkError>;
}

/// Default sink: structured log output only.
pub struct LogSink;

#[async_trait]
impl DiffSink for LogSink {
    async fn emit(&self, diff: &TxDiff) -> Result<(), SinkError> {
        info!(
            uuid = %diff.uuid,
            kind = ?diff.kind,
            txid = %diff.txid,
            category = %diff.category,
            address = %diff.address,
            amount = %diff.amount,
            confirmations = diff.confirmations,
            "transaction diff"
        );
        Ok(())
    }
}
