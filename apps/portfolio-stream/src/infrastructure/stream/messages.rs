//! Wire Message Types
//!
//! The closed set of envelopes exchanged with the market data server. Every
//! frame is a JSON object carrying a `type` tag; payload fields live either
//! at the top level (outbound control messages) or under a `data` key
//! (inbound events).
//!
//! # Wire Format
//!
//! Outbound:
//! ```json
//! {"type": "subscribe", "symbols": ["AAPL"], "dataType": "stock_prices", "timestamp": "..."}
//! {"type": "heartbeat", "timestamp": "..."}
//! {"type": "heartbeat_response", "timestamp": "..."}
//! ```
//!
//! Inbound:
//! ```json
//! {"type": "price_update", "data": {"updates": [{"symbol": "AAPL", "price": 150.25}]}}
//! {"type": "option_chain_update", "data": {"underlying": "AAPL", "optionChain": {...}}}
//! {"type": "error", "data": {"code": 500, "message": "..."}}
//! {"type": "subscription_confirmed", "data": {...}}
//! {"type": "heartbeat", "data": {"timestamp": "..."}}
//! ```

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::subscription::{DataKind, Symbol};

// =============================================================================
// Payloads
// =============================================================================

/// Body of a subscribe or unsubscribe request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    /// Symbols the request covers.
    pub symbols: Vec<Symbol>,

    /// Kind of data requested.
    #[serde(rename = "dataType")]
    pub data_type: DataKind,

    /// Client-side request timestamp.
    pub timestamp: DateTime<Utc>,
}

impl SubscriptionRequest {
    /// Create a request timestamped now.
    #[must_use]
    pub fn new(symbols: Vec<Symbol>, data_type: DataKind) -> Self {
        Self {
            symbols,
            data_type,
            timestamp: Utc::now(),
        }
    }
}

/// A single symbol/price pair inside a price update.
///
/// Servers may attach extra per-symbol fields (volume, day change); only the
/// fields the core consumes are modeled, the rest are ignored on decode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceEntry {
    /// Symbol the price belongs to.
    pub symbol: Symbol,

    /// Absolute last price.
    pub price: Decimal,

    /// Server-side observation timestamp; defaults to receipt time when the
    /// server omits it.
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

/// Payload of a `price_update` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceUpdatePayload {
    /// Batched per-symbol updates.
    pub updates: Vec<PriceEntry>,
}

/// Payload of an `option_chain_update` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainUpdatePayload {
    /// Underlying symbol.
    pub underlying: Symbol,

    /// Opaque chain payload, forwarded to observers without interpretation.
    #[serde(rename = "optionChain")]
    pub option_chain: serde_json::Value,
}

/// Payload of an `error` or `subscription_error` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Server-assigned error code.
    pub code: i64,

    /// Human-readable description.
    pub message: String,
}

/// Payload of a heartbeat or heartbeat response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatPayload {
    /// Sender-side timestamp.
    pub timestamp: DateTime<Utc>,
}

impl HeartbeatPayload {
    /// Create a payload timestamped now.
    #[must_use]
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Tagged Union
// =============================================================================

/// The closed tagged union of wire messages.
///
/// Unknown tags are a recoverable decode error
/// ([`CodecError::UnknownMessageType`](super::codec::CodecError::UnknownMessageType)),
/// never a panic or a dropped connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    /// Request to start receiving data for symbols.
    Subscribe(SubscriptionRequest),
    /// Request to stop receiving data for symbols.
    Unsubscribe(SubscriptionRequest),
    /// Batched price ticks from the server.
    PriceUpdate(PriceUpdatePayload),
    /// Option chain refresh for one underlying.
    ChainUpdate(ChainUpdatePayload),
    /// Liveness probe (either direction).
    Heartbeat(HeartbeatPayload),
    /// Reply to a heartbeat.
    HeartbeatAck(HeartbeatPayload),
    /// Application-level error from the server; non-fatal to the connection.
    Error(ErrorPayload),
    /// Server confirmation of a subscription change.
    SubscriptionAck(serde_json::Value),
    /// Server rejection of a subscription change.
    SubscriptionError(ErrorPayload),
}

impl WireMessage {
    /// Wire tag for this message.
    #[must_use]
    pub const fn tag(&self) -> &'static str {
        match self {
            Self::Subscribe(_) => "subscribe",
            Self::Unsubscribe(_) => "unsubscribe",
            Self::PriceUpdate(_) => "price_update",
            Self::ChainUpdate(_) => "option_chain_update",
            Self::Heartbeat(_) => "heartbeat",
            Self::HeartbeatAck(_) => "heartbeat_response",
            Self::Error(_) => "error",
            Self::SubscriptionAck(_) => "subscription_confirmed",
            Self::SubscriptionError(_) => "subscription_error",
        }
    }
}
