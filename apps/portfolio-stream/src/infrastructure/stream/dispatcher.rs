//! Update Dispatcher
//!
//! Pure routing of decoded wire messages to a pluggable handler set. Each
//! message invokes exactly one handler based on its tag; the only message
//! the dispatcher answers itself is an inbound `Heartbeat`, which produces
//! an immediate `HeartbeatAck` reply for the session loop to send.
//!
//! Handlers must not block: price and chain updates are expected to be
//! enqueued (coalescing queue) rather than applied synchronously, and error
//! handlers only surface the event to observers.

use std::sync::Arc;

use crate::domain::streaming::{ChainUpdate, PriceTick};

use super::messages::{ErrorPayload, HeartbeatPayload, WireMessage};

/// Typed handlers for decoded stream messages.
///
/// All methods default to no-ops so implementations only override the events
/// they care about. Implementations must be infallible; an error observed
/// while handling is reported through the observer surface, never thrown
/// back into the session loop.
pub trait UpdateHandlers: Send + Sync {
    /// A batch of price ticks arrived.
    fn on_price_updates(&self, ticks: Vec<PriceTick>) {
        let _ = ticks;
    }

    /// An option chain refresh arrived.
    fn on_chain_update(&self, update: ChainUpdate) {
        let _ = update;
    }

    /// The server reported an application-level error. Non-fatal to the
    /// connection.
    fn on_stream_error(&self, error: &ErrorPayload) {
        let _ = error;
    }

    /// The server confirmed a subscription change.
    fn on_subscription_confirmed(&self, data: &serde_json::Value) {
        let _ = data;
    }

    /// The server rejected a subscription change.
    fn on_subscription_error(&self, error: &ErrorPayload) {
        let _ = error;
    }

    /// The remote side answered one of our heartbeats.
    fn on_heartbeat_ack(&self) {}
}

/// Routes decoded messages to the handler set.
#[derive(Clone)]
pub struct Dispatcher {
    handlers: Arc<dyn UpdateHandlers>,
}

impl Dispatcher {
    /// Create a dispatcher over a handler set.
    #[must_use]
    pub fn new(handlers: Arc<dyn UpdateHandlers>) -> Self {
        Self { handlers }
    }

    /// Route one decoded message.
    ///
    /// Returns a reply message the session loop should send immediately
    /// (currently only `HeartbeatAck` in answer to a remote `Heartbeat`).
    pub fn dispatch(&self, message: WireMessage) -> Option<WireMessage> {
        match message {
            WireMessage::PriceUpdate(payload) => {
                let ticks: Vec<PriceTick> = payload
                    .updates
                    .into_iter()
                    .map(|entry| PriceTick::new(entry.symbol, entry.price, entry.timestamp))
                    .collect();
                tracing::trace!(count = ticks.len(), "dispatching price updates");
                self.handlers.on_price_updates(ticks);
                None
            }
            WireMessage::ChainUpdate(payload) => {
                self.handlers.on_chain_update(ChainUpdate {
                    underlying: payload.underlying,
                    chain: payload.option_chain,
                });
                None
            }
            WireMessage::Heartbeat(_) => {
                // Immediate reply, not deferred to the next outbound tick.
                Some(WireMessage::HeartbeatAck(HeartbeatPayload::now()))
            }
            WireMessage::HeartbeatAck(_) => {
                self.handlers.on_heartbeat_ack();
                None
            }
            WireMessage::Error(payload) => {
                tracing::warn!(code = payload.code, message = %payload.message, "stream error");
                self.handlers.on_stream_error(&payload);
                None
            }
            WireMessage::SubscriptionAck(data) => {
                self.handlers.on_subscription_confirmed(&data);
                None
            }
            WireMessage::SubscriptionError(payload) => {
                tracing::warn!(
                    code = payload.code,
                    message = %payload.message,
                    "subscription rejected"
                );
                self.handlers.on_subscription_error(&payload);
                None
            }
            // Client-originated messages echoed back are ignored.
            WireMessage::Subscribe(_) | WireMessage::Unsubscribe(_) => None,
        }
    }
}
