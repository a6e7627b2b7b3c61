//! Backend daemon RPC client contract

mod unix;

pub use self::unix::UnixSocketRpc;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::Result;

/// Backend method that validates a rune for a method/params pair
pub const CHECK_RUNE_METHOD: &str = "checkrune";

/// Backend introspection method listing available commands
pub const HELP_METHOD: &str = "help";

/// Narrow view of the backend daemon used by the gateway.
///
/// Application errors come back as [`crate::Error::JsonRpc`] carrying the
/// backend's code, message and data untouched; connection failures as
/// [`crate::Error::Transport`].
#[async_trait]
pub trait RpcBackend: Send + Sync {
    /// Invoke `method` with `params` and wait for the result
    async fn call(&self, method: &str, params: Value) -> Result<Value>;

    /// Ask the backend whether `rune` authorizes `method` with `params`
    async fn check_rune(&self, rune: &str, method: &str, params: &Value) -> Result<Value> {
        self.call(
            CHECK_RUNE_METHOD,
            json!({ "rune": rune, "method": method, "params": params }),
        )
        .await
    }
}
