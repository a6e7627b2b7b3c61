//! JSON-RPC 2.0 wire types shared by the backend client and the notification feed

mod messages;

pub use messages::*;

/// JSON-RPC version string
pub const JSONRPC_VERSION: &str = "2.0";
