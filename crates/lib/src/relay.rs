//! Outbound streaming relay: runtime output -> the originating client's transport.

use crate::agent::OutputUnit;
use crate::registry::ConnectionRegistry;
use crate::router::OutputStream;
use tokio_util::sync::CancellationToken;

/// How a relayed stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEnd {
    Completed,
    Failed(String),
    /// The client was no longer registered, or its queue was closed.
    ClientGone,
    /// `cancel` fired before the stream finished.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayOutcome {
    pub delivered: usize,
    pub end: RelayEnd,
}

/// Text sent to the client when the runtime fails.
pub fn failure_notice(reason: &str) -> String {
    format!("server error: {}", reason)
}

/// Deliver every token of `stream` to `client_id` in order.
///
/// If the client is gone the rest of the stream is dropped and `cancel` is fired so
/// the runtime can stop. `Done` sends nothing extra.
pub async fn relay(
    registry: &ConnectionRegistry,
    client_id: &str,
    mut stream: OutputStream,
    cancel: &CancellationToken,
) -> RelayOutcome {
    let mut delivered = 0usize;
    loop {
        let unit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                log::debug!("relay: {} cancelled after {} token(s)", client_id, delivered);
                return RelayOutcome { delivered, end: RelayEnd::Cancelled };
            }
            unit = stream.next() => unit,
        };
        match unit {
            Some(OutputUnit::Token(text)) => {
                if let Err(e) = registry.send_to(client_id, text).await {
                    log::info!("relay: dropping rest of stream: {}", e);
                    cancel.cancel();
                    return RelayOutcome {
                        delivered,
                        end: RelayEnd::ClientGone,
                    };
                }
                delivered += 1;
            }
            Some(OutputUnit::Done) | None => {
                log::debug!("relay: {} received {} token(s)", client_id, delivered);
                return RelayOutcome {
                    delivered,
                    end: RelayEnd::Completed,
                };
            }
            Some(OutputUnit::Failed(reason)) => {
                log::warn!("relay: agent failed for {}: {}", client_id, reason);
                if let Err(e) = registry.send_to(client_id, failure_notice(&reason)).await {
                    log::info!("relay: failure notice not delivered: {}", e);
                }
                return RelayOutcome {
                    delivered,
                    end: RelayEnd::Failed(reason),
                };
            }
        }
    }
}
