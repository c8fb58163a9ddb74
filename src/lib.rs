//! Ledger reconciliation for bitcoind-style wallet daemons.
//!
//! Keeps a local SQLite ledger of deposit addresses, wallet transactions and
//! withdrawals in sync with one or more daemons. Daemon state is followed
//! through ZMQ notifications and reconciled through the wallet RPC; the
//! embedding application allocates deposit addresses and confirms
//! withdrawals through the `ledger` module.

pub mod daemon;
pub mod ledger;
pub mod sync;
