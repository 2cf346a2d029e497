pub mod server;

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{trace, warn};

use crate::pipeline::event::Payload;

pub use self::server::DeliveryServer;

/// Outbound seam of the dispatcher.
///
/// `publish` must not block: the dispatcher calls it inline for every
/// payload, in order.
pub trait Transport: Send + Sync + 'static {
    fn publish(&self, payload: Payload);
}

/// A payload serialized once for every subscriber.
#[derive(Debug, Clone)]
pub struct Published {
    /// The payload's `status` tag, used as the event name.
    pub status: &'static str,
    pub json: Arc<str>,
}

impl Published {
    pub fn encode(payload: &Payload) -> Result<Self, serde_json::Error> {
        Ok(Self {
            status: payload.status(),
            json: serde_json::to_string(payload)?.into(),
        })
    }
}

/// Fan-out of payloads to live subscribers.
///
/// Each subscriber has `capacity` slots; one that falls further behind skips
/// the oldest payloads instead of slowing the dispatcher down.
pub struct BroadcastTransport {
    tx: broadcast::Sender<Published>,
}

impl BroadcastTransport {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Published> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Transport for BroadcastTransport {
    fn publish(&self, payload: Payload) {
        let published = match Published::encode(&payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(status = payload.status(), error = %e, "failed to encode payload");
                return;
            }
        };

        if self.tx.send(published).is_err() {
            trace!(status = payload.status(), "no subscribers for payload");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_subscriber_receives_payload() {
        let transport = BroadcastTransport::new(8);
        let mut a = transport.subscribe();
        let mut b = transport.subscribe();
        assert_eq!(transport.subscriber_count(), 2);

        transport.publish(Payload::snapshot(&[]));

        for rx in [&mut a, &mut b] {
            let published = rx.recv().await.unwrap();
            assert_eq!(published.status, "CIRC_BUILT");
            assert_eq!(&*published.json, r#"{"status":"CIRC_BUILT","data":[]}"#);
        }
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let transport = BroadcastTransport::new(1);
        transport.publish(Payload::snapshot(&[]));
        assert_eq!(transport.subscriber_count(), 0);
    }
}
