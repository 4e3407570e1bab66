use crate::domain::event::IntentEvent;
use crate::domain::intent::InternalId;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Fan-out of [`IntentEvent`]s to the surrounding application.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IntentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, event: IntentEvent) {
        // No receivers is fine: nobody is watching yet.
        if self.tx.send(event.clone()).is_err() {
            debug!(
                internal_id = %event.internal_id,
                status = %event.status,
                "no subscribers for intent event"
            );
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IntentEvent> {
        self.tx.subscribe()
    }

    pub fn subscribe_to(&self, internal_id: InternalId) -> IntentSubscription {
        IntentSubscription {
            internal_id,
            rx: self.tx.subscribe(),
        }
    }
}

/// Events of a single payment intent.
#[derive(Debug)]
pub struct IntentSubscription {
    internal_id: InternalId,
    rx: broadcast::Receiver<IntentEvent>,
}

impl IntentSubscription {
    /// Next event for this intent, or `None` once the bus is gone.
    ///
    /// Lagging drops the missed events and carries on with the oldest retained one.
    pub async fn recv(&mut self) -> Option<IntentEvent> {
        loop {
            match self.rx.recv().await {
                Ok(event) if event.internal_id == self.internal_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(internal_id = %self.internal_id, skipped, "intent subscription lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
