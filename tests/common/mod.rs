//! Shared fixtures: a scripted daemon and gateway startup helpers

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use rune_gateway::config::{GatewayConfig, Protocol};
use rune_gateway::gateway::{Gateway, RunningGateway};
use rune_gateway::rpc::RpcBackend;
use rune_gateway::{Error, Result};

/// Rune accepted for every method
pub const ADMIN_RUNE: &str = "admin-rune";

/// Rune accepted only for `getinfo`
pub const GETINFO_RUNE: &str = "getinfo-only-rune";

/// Rune accepted only for `listfunds`
pub const LISTFUNDS_RUNE: &str = "listfunds-only-rune";

/// Backend scope-violation code
pub const NOT_PERMITTED: i64 = 1502;

/// Backend unknown-rune code
pub const NOT_AUTHORIZED: i64 = 1501;

/// In-memory stand-in for the daemon
#[derive(Default)]
pub struct ScriptedBackend {
    /// Every call received, in order
    pub calls: Mutex<Vec<(String, Value)>>,
}

impl ScriptedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn methods_called(&self) -> Vec<String> {
        self.calls.lock().iter().map(|(m, _)| m.clone()).collect()
    }

    fn check_rune(params: &Value) -> Result<Value> {
        let method = params["method"].as_str().unwrap_or_default();
        let allowed = match params["rune"].as_str() {
            Some(ADMIN_RUNE) => true,
            Some(GETINFO_RUNE) => method == "getinfo",
            Some(LISTFUNDS_RUNE) => method == "listfunds",
            _ => {
                return Err(Error::json_rpc(
                    NOT_AUTHORIZED,
                    "Not authorized: Not derived from master",
                ));
            }
        };

        if allowed {
            Ok(json!({"valid": true}))
        } else {
            Err(Error::JsonRpc {
                code: NOT_PERMITTED,
                message: format!("Not permitted: method is not permitted ({method})"),
                data: Some(json!({"method": method})),
            })
        }
    }
}

#[async_trait]
impl RpcBackend for ScriptedBackend {
    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.calls.lock().push((method.to_string(), params.clone()));
        match method {
            "checkrune" => Self::check_rune(&params),
            "getinfo" => Ok(json!({
                "id": "02eec7245d6b7d2ccb30380bfbe2a3648cd7a942653f5aa340edcea1f283686619",
                "alias": "gateway-test-node",
                "num_peers": 3
            })),
            "listfunds" => Ok(json!({"outputs": [], "channels": []})),
            "echo" => Ok(params),
            "help" => Ok(json!({"help": [
                {"command": "getinfo", "category": "utility", "description": "Show node info", "verbose": "getinfo"},
                {"command": "listfunds", "category": "wallet", "description": "List funds", "verbose": "listfunds"}
            ]})),
            other => Err(Error::json_rpc(-32601, format!("Unknown command '{other}'"))),
        }
    }
}

/// Plain HTTP config on an ephemeral port
pub fn http_config() -> GatewayConfig {
    GatewayConfig {
        rest_port: Some(0),
        rest_protocol: Protocol::Http,
        drain_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

/// Start a gateway and return it with its base URL
pub async fn start(config: GatewayConfig, backend: Arc<ScriptedBackend>) -> (RunningGateway, String) {
    let protocol = config.rest_protocol;
    let running = Gateway::new(config, backend).start().await.unwrap();
    let url = format!("{protocol}://{}", running.local_addr());
    (running, url)
}
