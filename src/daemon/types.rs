//! Typed views over daemon RPC responses.
//!
//! The daemon answers with loosely-shaped JSON; every response the engine
//! relies on is validated into an explicit structure here. Validation
//! failures are data-quality errors: callers log and skip the record, they
//! never crash a reconciliation pass. Amounts are parsed from the exact
//! decimal text of the JSON number, never through a float.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

/// A daemon payload that cannot be interpreted.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload missing field `{0}`")]
    MissingField(&'static str),

    #[error("payload field `{field}` is malformed: {reason}")]
    Malformed { field: &'static str, reason: String },

    #[error("unexpected payload shape: {0}")]
    Shape(String),
}

/// One wallet transaction entry as reported by `listtransactions`, or one
/// detail of a `gettransaction` response flattened to its owning address.
#[derive(Debug, Clone, PartialEq)]
pub struct WalletTransaction {
    pub txid: String,
    pub category: String,
    pub address: String,
    pub amount: Decimal,
    pub confirmations: i64,
    /// The raw daemon payload, retained verbatim for audit and replay.
    pub orig: Value,
}

impl WalletTransaction {
    /// Validate one `listtransactions` entry.
    pub fn from_value(value: &Value) -> Result<Self, PayloadError> {
        Ok(Self {
            txid: string_field(value, "txid")?,
            category: string_field(value, "category")?,
            address: string_field(value, "address")?,
            amount: decimal_field(value, "amount")?,
            confirmations: integer_field(value, "confirmations")?,
            orig: value.clone(),
        })
    }

    /// Flatten a `gettransaction` response into per-address entries. The
    /// txid and confirmation count live on the envelope while category,
    /// address and amount live on each detail. Malformed details are
    /// returned as errors in place so the caller can skip them one by one.
    pub fn from_get_transaction(value: &Value) -> Result<Vec<Result<Self, PayloadError>>, PayloadError> {
        let txid = string_field(value, "txid")?;
        let confirmations = integer_field(value, "confirmations")?;
        let details = value
            .get("details")
            .and_then(Value::as_array)
            .ok_or(PayloadError::MissingField("details"))?;

        Ok(details
            .iter()
            .map(|detail| {
                Ok(Self {
                    txid: txid.clone(),
                    category: string_field(detail, "category")?,
                    address: string_field(detail, "address")?,
                    amount: decimal_field(detail, "amount")?,
                    confirmations,
                    orig: value.clone(),
                })
            })
            .collect())
    }
}

/// Summary of `getblockchaininfo`.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockchainInfo {
    pub chain: String,
    pub blocks: u64,
    #[serde(rename = "bestblockhash")]
    pub best_block_hash: Option<String>,
}

/// Summary of `getblock`.
#[derive(Debug, Clone, Deserialize)]
pub struct BlockInfo {
    pub hash: String,
    pub height: u64,
    pub confirmations: i64,
    #[serde(default)]
    pub tx: Vec<String>,
}

fn string_field(value: &Value, field: &'static str) -> Result<String, PayloadError> {
    match value.get(field) {
        None | Some(Value::Null) => Err(PayloadError::MissingField(field)),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(other) => Err(PayloadError::Malformed {
            field,
            reason: format!("expected string, got {other}"),
        }),
    }
}

fn integer_field(value: &Value, field: &'static str) -> Result<i64, PayloadError> {
    match value.get(field) {
        None | Some(Value::Null) => Err(PayloadError::MissingField(field)),
        Some(Value::Number(n)) => n.as_i64().ok_or_else(|| PayloadError::Malformed {
            field,
            reason: format!("not an integer: {n}"),
        }),
        Some(other) => Err(PayloadError::Malformed {
            field,
            reason: format!("expected integer, got {other}"),
        }),
    }
}

/// Parse a decimal field from the number's own text so `0.50000000` survives
/// exactly as written. Accepts a string form as well since some daemons
/// report amounts that way.
fn decimal_field(value: &Value, field: &'static str) -> Result<Decimal, PayloadError> {
    let raw = match value.get(field) {
        None | Some(Value::Null) => return Err(PayloadError::MissingField(field)),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => {
            return Err(PayloadError::Malformed {
                field,
                reason: format!("expected number, got {other}"),
            });
        }
    };
    Decimal::from_str(&raw).map_err(|e| PayloadError::Malformed {
        field,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn list_entry_parses_exact_amount() {
        let value = json!({
            "txid": "abc",
            "category": "receive",
            "address": "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa",
            "amount": 0.50000000,
            "confirmations": 0
        });
        let tx = WalletTransaction::from_value(&value).unwrap();
        assert_eq!(tx.amount, Decimal::from_str("0.5").unwrap());
        assert_eq!(tx.confirmations, 0);
        assert_eq!(tx.orig, value);
    }

    #[test]
    fn missing_field_is_a_payload_error() {
        let value = json!({ "txid": "abc", "category": "receive" });
        let err = WalletTransaction::from_value(&value).unwrap_err();
        assert!(matches!(err, PayloadError::MissingField("address")));
    }

    #[test]
    fn get_transaction_flattens_details() {
        let value = json!({
            "txid": "abc",
            "confirmations": 2,
            "details": [
                { "category": "receive", "address": "addr1", "amount": 0.25 },
                { "category": "send", "amount": -0.25 }
            ]
        });
        let entries = WalletTransaction::from_get_transaction(&value).unwrap();
        assert_eq!(entries.len(), 2);

        let first = entries[0].as_ref().unwrap();
        assert_eq!(first.txid, "abc");
        assert_eq!(first.address, "addr1");
        assert_eq!(first.confirmations, 2);

        // The send detail has no address and must fail on its own, not
        // poison its siblings.
        assert!(entries[1].is_err());
    }
}
