//! Link status events for an external indicator (LEDs, a UI, a log line).

use tokio::sync::broadcast;

/// What an indicator should show.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected,
    TransferStarted,
    TransferDone,
    TransferError,
}

/// Fan-out of link events. Publishing never blocks and never fails when
/// nobody is listening.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LinkEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(32);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: LinkEvent) {
        tracing::trace!(?event, "link event");
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
