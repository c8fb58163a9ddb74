//! Per-instance gateway registry.
//!
//! One logical connection exists per daemon instance, keyed by the instance
//! identifier. The registry is built once at startup and passed by handle
//! into every component that needs a gateway; nothing reaches for ambient
//! global state. Entries are created lazily on first use and shared
//! thereafter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::daemon::config::DaemonConfig;
use crate::daemon::rpc::{RpcError, RpcGateway};

pub struct GatewayRegistry {
    gateways: Mutex<HashMap<String, Arc<RpcGateway>>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self {
            gateways: Mutex::new(HashMap::new()),
        }
    }

    /// The gateway for this instance, created on first use.
    pub fn gateway(&self, conf: &DaemonConfig) -> Result<Arc<RpcGateway>, RpcError> {
        let mut gateways = self.gateways.lock().unwrap();
        if let Some(gateway) = gateways.get(&conf.instance) {
            return Ok(gateway.clone());
        }
        let gateway = Arc::new(RpcGateway::connect(conf)?);
        gateways.insert(conf.instance.clone(), gateway.clone());
        Ok(gateway)
    }
}

impl Default for GatewayRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(instance: &str) -> DaemonConfig {
        DaemonConfig::parse(
            instance,
            "rpcuser=u\nrpcpassword=p\nrpcbind=127.0.0.1\nrpcport=18443\n",
        )
    }

    #[test]
    fn same_instance_reuses_the_connection() {
        let registry = GatewayRegistry::new();
        let a = registry.gateway(&conf("miner.conf")).unwrap();
        let b = registry.gateway(&conf("miner.conf")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn instances_get_independent_connections() {
        let registry = GatewayRegistry::new();
        let a = registry.gateway(&conf("miner.conf")).unwrap();
        let b = registry.gateway(&conf("regtest.conf")).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn broken_conf_is_reported_not_cached() {
        let registry = GatewayRegistry::new();
        let bad = DaemonConfig::parse("bad.conf", "rpcuser=u\n");
        assert!(registry.gateway(&bad).is_err());
        assert!(registry.gateways.lock().unwrap().is_empty());
    }
}
