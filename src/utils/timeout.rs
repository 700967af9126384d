//! Timeout defaults and async timeout wrappers.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default bound for request/response style waits (pong replies)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between keepalive pings
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Silence after which a connection is considered dead
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// How long a closing connection waits for the peer's close reply
pub const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the accept loop waits for connections to drain on shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Run `future`, mapping an elapsed deadline to [`ProtocolError::Timeout`].
pub async fn with_timeout<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| ProtocolError::Timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn elapsed_maps_to_timeout() {
        let result = with_timeout(tokio::time::sleep(Duration::from_secs(5)), Duration::from_millis(10)).await;
        assert!(matches!(result, Err(ProtocolError::Timeout)));
    }

    #[tokio::test]
    async fn ready_future_passes_through() {
        let result = with_timeout(async { 7 }, Duration::from_secs(1)).await;
        assert_eq!(result.unwrap(), 7);
    }
}
