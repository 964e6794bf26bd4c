//! Subscription Registry
//!
//! Domain types for tracking which market data streams the session wants.
//!
//! # Design
//!
//! The registry is the authoritative set of `(symbol, kind)` pairs. It is
//! deliberately independent of the transport: a dropped connection never
//! clears it, only an explicit [`SubscriptionRegistry::remove`] does. After
//! every successful (re)connect the full registry is replayed to the server
//! as subscribe messages, so subscription state survives at a layer above
//! the socket.

use std::collections::BTreeSet;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

// =============================================================================
// Types
// =============================================================================

/// A symbol string (stock ticker or underlying).
pub type Symbol = String;

/// Kind of market data a subscription covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DataKind {
    /// Price ticks for the symbol.
    #[serde(rename = "stock_prices")]
    Price,
    /// Option chain updates for the underlying.
    #[serde(rename = "option_chain")]
    Chain,
    /// Both prices and option chains.
    #[serde(rename = "all")]
    All,
}

impl DataKind {
    /// All subscription kinds, in replay order.
    #[must_use]
    pub const fn all_kinds() -> &'static [Self] {
        &[Self::Price, Self::Chain, Self::All]
    }

    /// Wire name for this kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Price => "stock_prices",
            Self::Chain => "option_chain",
            Self::All => "all",
        }
    }
}

/// A single subscription entry, keyed by `(symbol, kind)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Subscription {
    /// Subscribed symbol.
    pub symbol: Symbol,
    /// Kind of data wanted for the symbol.
    pub kind: DataKind,
}

impl Subscription {
    /// Create a new subscription entry.
    #[must_use]
    pub const fn new(symbol: Symbol, kind: DataKind) -> Self {
        Self { symbol, kind }
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Thread-safe set of active subscriptions.
///
/// `add` and `remove` are idempotent and report whether membership actually
/// changed, so callers can decide whether an outbound wire message is due.
///
/// # Example
///
/// ```rust
/// use portfolio_stream::domain::subscription::{DataKind, SubscriptionRegistry};
///
/// let registry = SubscriptionRegistry::new();
///
/// assert!(registry.add("AAPL", DataKind::Price));
/// // Second add of the same pair is a no-op.
/// assert!(!registry.add("AAPL", DataKind::Price));
///
/// assert!(registry.remove("AAPL", DataKind::Price));
/// assert!(!registry.remove("AAPL", DataKind::Price));
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    entries: RwLock<BTreeSet<Subscription>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a subscription. Returns `true` if it was not already present.
    pub fn add(&self, symbol: impl Into<Symbol>, kind: DataKind) -> bool {
        self.entries
            .write()
            .insert(Subscription::new(symbol.into(), kind))
    }

    /// Remove a subscription. Returns `true` if it was present.
    pub fn remove(&self, symbol: &str, kind: DataKind) -> bool {
        self.entries.write().remove(&Subscription {
            symbol: symbol.to_string(),
            kind,
        })
    }

    /// All active subscriptions, ordered by `(symbol, kind)`.
    #[must_use]
    pub fn all(&self) -> Vec<Subscription> {
        self.entries.read().iter().cloned().collect()
    }

    /// Symbols subscribed for a given kind.
    #[must_use]
    pub fn symbols_for(&self, kind: DataKind) -> Vec<Symbol> {
        self.entries
            .read()
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| s.symbol.clone())
            .collect()
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check whether the registry is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Check whether a specific subscription is present.
    #[must_use]
    pub fn contains(&self, symbol: &str, kind: DataKind) -> bool {
        self.entries.read().contains(&Subscription {
            symbol: symbol.to_string(),
            kind,
        })
    }

    /// Group the registry into per-kind symbol lists for resubscription.
    ///
    /// Kinds with no entries are omitted, so an empty registry produces an
    /// empty replay (no outbound messages after connect).
    #[must_use]
    pub fn replay_groups(&self) -> Vec<(DataKind, Vec<Symbol>)> {
        let entries = self.entries.read();
        DataKind::all_kinds()
            .iter()
            .filter_map(|kind| {
                let symbols: Vec<Symbol> = entries
                    .iter()
                    .filter(|s| s.kind == *kind)
                    .map(|s| s.symbol.clone())
                    .collect();
                if symbols.is_empty() {
                    None
                } else {
                    Some((*kind, symbols))
                }
            })
            .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
