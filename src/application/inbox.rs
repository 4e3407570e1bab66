use crate::application::engine::PaymentEngine;
use crate::domain::event::{GatewayDecision, GatewayEvent};
use crate::error::{PaymentError, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

type Reply = oneshot::Sender<Result<Option<GatewayDecision>>>;

struct InboundEvent {
    event: GatewayEvent,
    reply: Option<Reply>,
}

/// Sending side of the channel through which the wallet gateway adapter delivers events.
#[derive(Clone)]
pub struct GatewayInbox {
    tx: mpsc::Sender<InboundEvent>,
}

impl GatewayInbox {
    /// Delivers `event` and waits for the engine's answer.
    pub async fn deliver(&self, event: GatewayEvent) -> Result<Option<GatewayDecision>> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(InboundEvent {
                event,
                reply: Some(reply),
            })
            .await
            .map_err(|_| PaymentError::ChannelClosed("gateway inbox"))?;
        rx.await
            .map_err(|_| PaymentError::ChannelClosed("gateway reply"))?
    }

    /// Delivers `event` without waiting for it to be handled.
    pub async fn post(&self, event: GatewayEvent) -> Result<()> {
        self.tx
            .send(InboundEvent { event, reply: None })
            .await
            .map_err(|_| PaymentError::ChannelClosed("gateway inbox"))
    }
}

impl PaymentEngine {
    /// Starts consuming gateway events from a bounded channel.
    ///
    /// Each event is handled on its own task, so a slow approval for one payment never
    /// holds up events for another. The listener stops once every `GatewayInbox` clone
    /// has been dropped.
    pub fn spawn_inbox(&self, capacity: usize) -> (GatewayInbox, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<InboundEvent>(capacity.max(1));
        let engine = self.clone();
        let listener = tokio::spawn(async move {
            info!("gateway inbox listening");
            while let Some(InboundEvent { event, reply }) = rx.recv().await {
                let engine = engine.clone();
                tokio::spawn(async move {
                    let kind = event.kind();
                    let result = engine.dispatch(event).await;
                    if let Err(e) = &result {
                        warn!(event = kind, error = %e, "gateway event rejected");
                    }
                    if let Some(reply) = reply
                        && reply.send(result).is_err()
                    {
                        debug!(event = kind, "gateway stopped waiting for reply");
                    }
                });
            }
            info!("gateway inbox closed");
        });
        (GatewayInbox { tx }, listener)
    }
}
