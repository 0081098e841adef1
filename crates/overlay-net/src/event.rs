//! Fire-and-forget connection lifecycle events, consumed by observability
//! layers above this crate. Never on the critical path: every send is
//! best-effort and drops silently rather than blocking or erroring.

use overlay_core::OverlayAddress;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub enum ConnEvent {
    Opened {
        local: OverlayAddress,
        remote: OverlayAddress,
        initiator: bool,
    },
    Closed {
        local: OverlayAddress,
        remote: OverlayAddress,
    },
}

/// Receives connection lifecycle events without ever blocking the caller
/// that emits them.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ConnEvent);
}

/// Default sink: fans events out to zero or more `broadcast` subscribers.
/// A full or absent subscriber channel is not an error -- the event is just
/// dropped for that subscriber, matching `broadcast::Sender::send`'s
/// existing semantics of counting receivers rather than blocking.
pub struct EventBroadcaster {
    tx: broadcast::Sender<ConnEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for EventBroadcaster {
    fn emit(&self, event: ConnEvent) {
        // Err means no subscribers are currently listening; that's fine.
        let _ = self.tx.send(event);
    }
}

/// No-op sink for tests and for demos that don't care about observability.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: ConnEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_with_no_subscribers_does_not_panic() {
        let broadcaster = EventBroadcaster::new();
        let (pk, _sk) = overlay_core::SecretKey::generate();
        let addr = OverlayAddress::new(pk, 1);
        broadcaster.emit(ConnEvent::Opened {
            local: addr,
            remote: addr,
            initiator: true,
        });
    }

    #[tokio::test]
    async fn subscriber_receives_emitted_event() {
        let broadcaster = EventBroadcaster::new();
        let mut rx = broadcaster.subscribe();
        let (pk, _sk) = overlay_core::SecretKey::generate();
        let addr = OverlayAddress::new(pk, 1);
        broadcaster.emit(ConnEvent::Closed { local: addr, remote: addr });
        let event = rx.recv().await.unwrap();
        assert!(matches!(event, ConnEvent::Closed { .. }));
    }
}
