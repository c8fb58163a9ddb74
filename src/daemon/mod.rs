//! Everything that talks to one wallet-node daemon instance: its
//! configuration record, the retrying RPC gateway, and the registry that
//! hands out one gateway per instance.

pub mod config;
pub mod registry;
pub mod rpc;
pub mod types;

pub use config::{ConfigError, DaemonConfig};
pub use registry::GatewayRegistry;
pub use rpc::{HttpTransport, RpcError, RpcGateway, WalletRpc};
pub use types::WalletTransaction;
