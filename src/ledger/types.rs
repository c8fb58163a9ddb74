//! Persisted record types for the ledger store.

use rust_decimal::Decimal;

/// One stored wallet transaction, joined with its owning address.
#[derive(Debug, Clone, PartialEq)]
pub struct TxRecord {
    /// Synthetic identifier, assigned once and stable across updates.
    pub uuid: String,
    /// Daemon transaction id.
    pub txid: String,
    pub addr_id: i64,
    pub address: String,
    /// Owning context of the address, when one is bound.
    pub context: Option<Vec<u8>>,
    pub amount: Decimal,
    pub confirmations: i64,
    /// Whether the deposit has been credited. Transitions false→true exactly
    /// once and never reverts.
    pub applied: bool,
}

/// A pending or completed outbound payment.
#[derive(Debug, Clone, PartialEq)]
pub struct WithdrawalRecord {
    pub uuid: String,
    pub owner: String,
    pub address: String,
    pub amount: Decimal,
    /// Confirmation token. Present only while the withdrawal is outstanding;
    /// cleared by both confirm and deny.
    pub token: Option<String>,
    pub confirmed: bool,
    /// Daemon transaction id of the send, once one exists.
    pub txid: Option<String>,
}

impl WithdrawalRecord {
    /// Outstanding means a token is present and the withdrawal is not yet
    /// confirmed.
    pub fn is_outstanding(&self) -> bool {
        self.token.is_some() && !self.confirmed
    }
}
