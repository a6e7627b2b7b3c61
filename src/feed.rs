//! Backend notification feed
//!
//! Reads line-delimited JSON-RPC notifications and hands their `params` to
//! the broadcaster. A `shutdown` notification closes the broadcaster for good.

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use crate::Result;
use crate::gateway::NotificationSender;
use crate::protocol::JsonRpcNotification;

/// Notification that stops the broadcaster
pub const SHUTDOWN_METHOD: &str = "shutdown";

/// Why the feed ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedEnd {
    /// Input closed; the broadcaster keeps running
    Eof,
    /// A `shutdown` notification was relayed as the close sentinel
    Shutdown,
}

/// Relay notifications from `reader` until EOF or `shutdown`.
///
/// Lines that are not JSON-RPC notifications are logged and skipped. An event
/// dropped because the queue stayed full does not end the feed.
///
/// # Errors
///
/// Returns an error if reading fails or the close sentinel cannot be queued.
pub async fn run_feed<R>(reader: R, sender: NotificationSender) -> Result<FeedEnd>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let notification: JsonRpcNotification = match serde_json::from_str(line) {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Skipping malformed notification");
                continue;
            }
        };

        if notification.method == SHUTDOWN_METHOD {
            info!("Shutdown notification received");
            sender.close().await?;
            return Ok(FeedEnd::Shutdown);
        }

        debug!(method = %notification.method, "Queueing notification");
        let _ = sender
            .enqueue(notification.params.unwrap_or(Value::Null))
            .await;
    }

    debug!("Notification feed closed");
    Ok(FeedEnd::Eof)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::gateway::{BroadcasterState, NotificationBroadcaster, SessionRegistry};

    async fn frames(input: &str) -> (FeedEnd, Vec<Value>, BroadcasterState) {
        let sessions = Arc::new(SessionRegistry::new());
        let (_id, mut rx) = sessions.register("r");
        let broadcaster =
            NotificationBroadcaster::spawn(Arc::clone(&sessions), 16, Duration::from_millis(20));

        let end = run_feed(input.as_bytes(), broadcaster.sender()).await.unwrap();
        if end == FeedEnd::Shutdown {
            tokio::time::timeout(Duration::from_secs(2), broadcaster.stopped())
                .await
                .unwrap();
        } else {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let mut out = Vec::new();
        while let Ok(Some(frame)) =
            tokio::time::timeout(Duration::from_millis(20), rx.recv()).await
        {
            out.push(serde_json::from_str::<Value>(frame.as_str()).unwrap()["data"].clone());
        }
        (end, out, broadcaster.state())
    }

    #[tokio::test]
    async fn params_are_relayed_in_order() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","method":"invoice_payment","params":{"label":"a"}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"connect","params":{"id":"02ab"}}"#,
            "\n",
        );
        let (end, data, state) = frames(input).await;
        assert_eq!(end, FeedEnd::Eof);
        assert_eq!(data, vec![json!({"label": "a"}), json!({"id": "02ab"})]);
        assert_ne!(state, BroadcasterState::Stopped);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let input = "not json\n\n{\"jsonrpc\":\"2.0\",\"method\":\"ping\"}\n";
        let (end, data, _) = frames(input).await;
        assert_eq!(end, FeedEnd::Eof);
        assert_eq!(data, vec![Value::Null]);
    }

    #[tokio::test]
    async fn shutdown_stops_broadcaster_and_feed() {
        let input = concat!(
            r#"{"jsonrpc":"2.0","method":"block_added","params":{"height":1}}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"shutdown"}"#,
            "\n",
            r#"{"jsonrpc":"2.0","method":"block_added","params":{"height":2}}"#,
            "\n",
        );
        let (end, data, state) = frames(input).await;
        assert_eq!(end, FeedEnd::Shutdown);
        assert_eq!(data, vec![json!({"height": 1})]);
        assert_eq!(state, BroadcasterState::Stopped);
    }
}
