//! Streaming Types and the Coalescing Price Queue
//!
//! Normalized market data types plus the burst-absorbing buffer that sits
//! between the transport and the portfolio recalculation engine.
//!
//! # Coalescing
//!
//! Tick bursts (market open, volatile names) can arrive far faster than any
//! consumer needs to observe distinct valuations. The queue keeps only the
//! most recent tick per symbol; a periodic flush drains the whole buffer as
//! one batch, so recomputation frequency is bounded by the flush cadence and
//! not by the tick rate. Ticks carry absolute prices, so dropping superseded
//! values loses nothing.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use crate::domain::subscription::Symbol;

// =============================================================================
// Types
// =============================================================================

/// A single price observation for one symbol at one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PriceTick {
    /// Symbol the price belongs to.
    pub symbol: Symbol,
    /// Absolute last price (not a delta).
    pub price: Decimal,
    /// Server-side observation timestamp.
    pub timestamp: DateTime<Utc>,
}

impl PriceTick {
    /// Create a new tick.
    #[must_use]
    pub const fn new(symbol: Symbol, price: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol,
            price,
            timestamp,
        }
    }
}

/// An option chain update for one underlying.
///
/// The chain payload is opaque to the core; it is forwarded to observers
/// without interpretation (option pricing lives behind the injected metric
/// function, not here).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainUpdate {
    /// Underlying symbol.
    pub underlying: Symbol,
    /// Raw chain payload as received.
    pub chain: serde_json::Value,
}

/// One flush window's worth of coalesced ticks, at most one per symbol.
pub type PriceBatch = Vec<PriceTick>;

// =============================================================================
// Coalescing Queue
// =============================================================================

/// Coalescing buffer keyed by symbol.
///
/// `enqueue` overwrites any pending tick for the same symbol
/// (last-write-wins); `drain` empties the buffer as a batch. Both operations
/// are non-blocking and safe to call from the transport task and the flush
/// timer concurrently.
///
/// # Example
///
/// ```rust
/// use chrono::Utc;
/// use portfolio_stream::domain::streaming::{PriceTick, PriceUpdateQueue};
/// use rust_decimal::Decimal;
///
/// let queue = PriceUpdateQueue::new();
/// queue.enqueue(PriceTick::new("AAPL".into(), Decimal::new(100, 0), Utc::now()));
/// queue.enqueue(PriceTick::new("AAPL".into(), Decimal::new(101, 0), Utc::now()));
///
/// let batch = queue.drain();
/// assert_eq!(batch.len(), 1);
/// assert_eq!(batch[0].price, Decimal::new(101, 0));
/// assert!(queue.drain().is_empty());
/// ```
#[derive(Debug, Default)]
pub struct PriceUpdateQueue {
    pending: Mutex<HashMap<Symbol, PriceTick>>,
}

impl PriceUpdateQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a tick, superseding any pending tick for the same symbol.
    pub fn enqueue(&self, tick: PriceTick) {
        self.pending.lock().insert(tick.symbol.clone(), tick);
    }

    /// Drain all pending ticks as one batch.
    ///
    /// Returns an empty batch when nothing is pending; callers treat that as
    /// a no-op rather than a zero-delta event.
    #[must_use]
    pub fn drain(&self) -> PriceBatch {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return Vec::new();
        }
        pending.drain().map(|(_, tick)| tick).collect()
    }

    /// Number of symbols with a pending tick.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// Check whether any tick is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
