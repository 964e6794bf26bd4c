//! Portfolio Positions, Snapshots, and Recalculation
//!
//! The recalculation engine applies a batch of coalesced price updates to the
//! current position set and produces a new immutable [`PortfolioSnapshot`].
//! Readers always observe a complete snapshot; a new one replaces the old via
//! a single `Arc` swap at the publishing layer, never by in-place mutation.
//!
//! # Purity and idempotence
//!
//! Per-position metrics are recomputed from `(quantity, average_cost,
//! current_price)` via an injected [`PositionMetricFn`], never adjusted
//! incrementally. Ticks carry absolute prices, so applying the same batch
//! twice yields an identical snapshot, and tick order within one batch does
//! not matter.
//!
//! # Cost model
//!
//! Positions untouched by a batch are carried into the next snapshot by
//! cloning their `Arc`, so the per-flush rebuild cost is O(batch size). The
//! aggregate metrics are recomputed from the full updated set, the one
//! unavoidable O(portfolio size) pass per flush.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::streaming::PriceBatch;
use crate::domain::subscription::Symbol;

// =============================================================================
// Errors
// =============================================================================

/// Error from an injected per-position metric function.
#[derive(Debug, Clone, thiserror::Error)]
pub enum MetricError {
    /// The metric function could not produce a result for these inputs.
    #[error("metric computation failed: {0}")]
    Computation(String),
}

/// Errors from snapshot recalculation.
///
/// Any error leaves the input snapshot untouched; a batch either applies
/// fully or not at all.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RecalcError {
    /// The injected metric function failed for one position.
    #[error("metric recomputation failed for {symbol}: {source}")]
    Metric {
        /// Position the failure occurred on.
        symbol: Symbol,
        /// Underlying metric error.
        #[source]
        source: MetricError,
    },

    /// A sell fill exceeds the currently held quantity.
    #[error("fill for {symbol} sells {requested} but only {held} held")]
    OverClose {
        /// Symbol of the over-closed position.
        symbol: Symbol,
        /// Quantity the fill tried to sell.
        requested: Decimal,
        /// Quantity actually held.
        held: Decimal,
    },

    /// A sell fill references a symbol with no open position.
    #[error("fill sells {symbol} but no position is open")]
    UnknownPosition {
        /// Symbol with no open position.
        symbol: Symbol,
    },
}

// =============================================================================
// Positions and Metrics
// =============================================================================

/// Inputs to the per-position metric function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionInputs {
    /// Held quantity (shares or contracts).
    pub quantity: Decimal,
    /// Average acquisition cost per unit.
    pub average_cost: Decimal,
    /// Most recent observed price per unit.
    pub current_price: Decimal,
}

/// Derived metrics for a single position.
///
/// Always recomputed wholesale from [`PositionInputs`]; never patched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionMetrics {
    /// `quantity * current_price`.
    pub market_value: Decimal,
    /// `quantity * average_cost`.
    pub cost_basis: Decimal,
    /// `market_value - cost_basis`.
    pub unrealized_pnl: Decimal,
    /// P&L as a percentage of cost basis, rounded to 2 decimal places.
    pub unrealized_pnl_pct: Decimal,
}

/// Pure function recomputing a position's derived metrics.
///
/// Injected by the embedding application; options positions plug their
/// pricing model in here. The engine only requires purity: same inputs,
/// same outputs, no side effects.
pub type PositionMetricFn =
    Arc<dyn Fn(&PositionInputs) -> Result<PositionMetrics, MetricError> + Send + Sync>;

/// Default linear valuation metric function.
///
/// Suitable for stock positions: value is quantity times price, P&L is value
/// against cost basis.
#[must_use]
pub fn linear_metrics() -> PositionMetricFn {
    Arc::new(|inputs: &PositionInputs| {
        let market_value = inputs.quantity * inputs.current_price;
        let cost_basis = inputs.quantity * inputs.average_cost;
        let unrealized_pnl = market_value - cost_basis;
        let unrealized_pnl_pct = if cost_basis.is_zero() {
            Decimal::ZERO
        } else {
            (unrealized_pnl / cost_basis * Decimal::ONE_HUNDRED).round_dp(2)
        };

        Ok(PositionMetrics {
            market_value,
            cost_basis,
            unrealized_pnl,
            unrealized_pnl_pct,
        })
    })
}

/// A single open position.
///
/// Owned by the recalculation engine; the transport layer never touches
/// positions directly. Quantity and cost change only through trade fills,
/// `current_price` only through price batches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Position {
    /// Position symbol.
    pub symbol: Symbol,
    /// Held quantity.
    pub quantity: Decimal,
    /// Average acquisition cost per unit.
    pub average_cost: Decimal,
    /// Most recent observed price.
    pub current_price: Decimal,
    /// Derived metrics for the current inputs.
    pub metrics: PositionMetrics,
}

impl Position {
    /// Build a position, computing its metrics via `metric_fn`.
    ///
    /// # Errors
    ///
    /// Returns the metric function's error unchanged.
    pub fn build(
        symbol: Symbol,
        quantity: Decimal,
        average_cost: Decimal,
        current_price: Decimal,
        metric_fn: &PositionMetricFn,
    ) -> Result<Self, MetricError> {
        let metrics = metric_fn(&PositionInputs {
            quantity,
            average_cost,
            current_price,
        })?;

        Ok(Self {
            symbol,
            quantity,
            average_cost,
            current_price,
            metrics,
        })
    }
}

// =============================================================================
// Trade Fills
// =============================================================================

/// Direction of a trade fill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TradeSide {
    /// Opens or adds to a position.
    Buy,
    /// Reduces or closes a position.
    Sell,
}

/// An executed trade reported by the external trade executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeFill {
    /// Symbol traded.
    pub symbol: Symbol,
    /// Fill direction.
    pub side: TradeSide,
    /// Filled quantity (positive).
    pub quantity: Decimal,
    /// Fill price per unit.
    pub price: Decimal,
    /// Execution timestamp.
    pub timestamp: DateTime<Utc>,
}

// =============================================================================
// Snapshot
// =============================================================================

/// Best/worst position by unrealized P&L percentage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionRanking {
    /// Symbol of the ranked position.
    pub symbol: Symbol,
    /// Its unrealized P&L percentage.
    pub unrealized_pnl_pct: Decimal,
}

/// Aggregate metrics over the full position set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateMetrics {
    /// Sum of position market values.
    pub total_value: Decimal,
    /// Sum of position cost bases.
    pub total_cost: Decimal,
    /// Sum of position unrealized P&L.
    pub total_pnl: Decimal,
    /// Total P&L as a percentage of total cost, rounded to 2 decimal places.
    pub total_pnl_pct: Decimal,
    /// Percentage of positions with positive P&L, rounded to 2 decimal places.
    pub win_rate: Decimal,
    /// Position with the highest P&L percentage, if any positions exist.
    pub best: Option<PositionRanking>,
    /// Position with the lowest P&L percentage, if any positions exist.
    pub worst: Option<PositionRanking>,
}

impl AggregateMetrics {
    /// Aggregates of an empty portfolio.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            total_value: Decimal::ZERO,
            total_cost: Decimal::ZERO,
            total_pnl: Decimal::ZERO,
            total_pnl_pct: Decimal::ZERO,
            win_rate: Decimal::ZERO,
            best: None,
            worst: None,
        }
    }

    /// Compute aggregates from a position set.
    ///
    /// This is a pure function of the positions passed in; no external state
    /// participates, so a snapshot's aggregates can always be re-derived from
    /// its own position set.
    fn compute(positions: &BTreeMap<Symbol, Arc<Position>>) -> Self {
        if positions.is_empty() {
            return Self::empty();
        }

        let mut total_value = Decimal::ZERO;
        let mut total_cost = Decimal::ZERO;
        let mut total_pnl = Decimal::ZERO;
        let mut winners = 0usize;
        let mut best: Option<&Arc<Position>> = None;
        let mut worst: Option<&Arc<Position>> = None;

        for position in positions.values() {
            total_value += position.metrics.market_value;
            total_cost += position.metrics.cost_basis;
            total_pnl += position.metrics.unrealized_pnl;

            if position.metrics.unrealized_pnl > Decimal::ZERO {
                winners += 1;
            }

            let pct = position.metrics.unrealized_pnl_pct;
            if best.is_none_or(|b| pct > b.metrics.unrealized_pnl_pct) {
                best = Some(position);
            }
            if worst.is_none_or(|w| pct < w.metrics.unrealized_pnl_pct) {
                worst = Some(position);
            }
        }

        let total_pnl_pct = if total_cost.is_zero() {
            Decimal::ZERO
        } else {
            (total_pnl / total_cost * Decimal::ONE_HUNDRED).round_dp(2)
        };

        let win_rate = (Decimal::from(winners) / Decimal::from(positions.len())
            * Decimal::ONE_HUNDRED)
            .round_dp(2);

        let rank = |p: &Arc<Position>| PositionRanking {
            symbol: p.symbol.clone(),
            unrealized_pnl_pct: p.metrics.unrealized_pnl_pct,
        };

        Self {
            total_value,
            total_cost,
            total_pnl,
            total_pnl_pct,
            win_rate,
            best: best.map(rank),
            worst: worst.map(rank),
        }
    }
}

/// An immutable point-in-time view of the portfolio.
///
/// Replaced wholesale on every flush or trade; never mutated. Cloning is
/// cheap (the position set is `Arc`-shared).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortfolioSnapshot {
    positions: BTreeMap<Symbol, Arc<Position>>,
    aggregates: AggregateMetrics,
}

impl Default for PortfolioSnapshot {
    fn default() -> Self {
        Self::empty()
    }
}

impl PortfolioSnapshot {
    /// An empty portfolio.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            positions: BTreeMap::new(),
            aggregates: AggregateMetrics::empty(),
        }
    }

    /// Build a snapshot from a position set, computing aggregates.
    #[must_use]
    pub fn from_positions(positions: BTreeMap<Symbol, Arc<Position>>) -> Self {
        let aggregates = AggregateMetrics::compute(&positions);
        Self {
            positions,
            aggregates,
        }
    }

    /// Look up one position.
    #[must_use]
    pub fn position(&self, symbol: &str) -> Option<&Arc<Position>> {
        self.positions.get(symbol)
    }

    /// Iterate over all positions in symbol order.
    pub fn positions(&self) -> impl Iterator<Item = &Arc<Position>> {
        self.positions.values()
    }

    /// Aggregate metrics for this snapshot.
    #[must_use]
    pub const fn aggregates(&self) -> &AggregateMetrics {
        &self.aggregates
    }

    /// Number of open positions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    /// Check whether the portfolio is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

// =============================================================================
// Recalculation
// =============================================================================

/// Apply a batch of coalesced price ticks to a snapshot.
///
/// Positions whose symbol appears in the batch are rebuilt with the new
/// `current_price` and freshly computed metrics; all others are carried over
/// by `Arc` clone. Ticks for symbols with no open position are ignored, so
/// an all-unknown batch returns a snapshot equal to the input.
///
/// # Errors
///
/// Fails atomically with [`RecalcError::Metric`] if the metric function
/// rejects any position; the input snapshot is left untouched.
pub fn apply_batch(
    snapshot: &PortfolioSnapshot,
    batch: &PriceBatch,
    metric_fn: &PositionMetricFn,
) -> Result<PortfolioSnapshot, RecalcError> {
    let mut positions = snapshot.positions.clone();
    let mut changed = false;

    for tick in batch {
        let Some(existing) = positions.get(&tick.symbol) else {
            continue;
        };

        // Same absolute price means identical inputs, hence identical
        // metrics; skipping the rebuild preserves idempotence for free.
        if existing.current_price == tick.price {
            continue;
        }

        let updated = Position::build(
            existing.symbol.clone(),
            existing.quantity,
            existing.average_cost,
            tick.price,
            metric_fn,
        )
        .map_err(|source| RecalcError::Metric {
            symbol: tick.symbol.clone(),
            source,
        })?;

        positions.insert(tick.symbol.clone(), Arc::new(updated));
        changed = true;
    }

    if !changed {
        return Ok(snapshot.clone());
    }

    Ok(PortfolioSnapshot::from_positions(positions))
}

/// Apply an executed trade fill to a snapshot.
///
/// A buy opens a new position at the fill price or adds to an existing one
/// with a weighted average cost. A sell reduces the held quantity (cost basis
/// per unit unchanged) and removes the position when it reaches zero.
///
/// # Errors
///
/// - [`RecalcError::UnknownPosition`] for a sell with no open position.
/// - [`RecalcError::OverClose`] for a sell exceeding the held quantity.
/// - [`RecalcError::Metric`] if metric recomputation fails; the input
///   snapshot is left untouched.
pub fn apply_trade(
    snapshot: &PortfolioSnapshot,
    fill: &TradeFill,
    metric_fn: &PositionMetricFn,
) -> Result<PortfolioSnapshot, RecalcError> {
    let mut positions = snapshot.positions.clone();
    let existing = positions.get(&fill.symbol).cloned();

    let build = |quantity: Decimal, average_cost: Decimal, current_price: Decimal| {
        Position::build(
            fill.symbol.clone(),
            quantity,
            average_cost,
            current_price,
            metric_fn,
        )
        .map_err(|source| RecalcError::Metric {
            symbol: fill.symbol.clone(),
            source,
        })
    };

    match (fill.side, existing) {
        (TradeSide::Buy, None) => {
            let opened = build(fill.quantity, fill.price, fill.price)?;
            positions.insert(fill.symbol.clone(), Arc::new(opened));
        }
        (TradeSide::Buy, Some(held)) => {
            let new_quantity = held.quantity + fill.quantity;
            let new_cost = (held.quantity * held.average_cost + fill.quantity * fill.price)
                / new_quantity;
            let updated = build(new_quantity, new_cost, held.current_price)?;
            positions.insert(fill.symbol.clone(), Arc::new(updated));
        }
        (TradeSide::Sell, None) => {
            return Err(RecalcError::UnknownPosition {
                symbol: fill.symbol.clone(),
            });
        }
        (TradeSide::Sell, Some(held)) => {
            if fill.quantity > held.quantity {
                return Err(RecalcError::OverClose {
                    symbol: fill.symbol.clone(),
                    requested: fill.quantity,
                    held: held.quantity,
                });
            }

            let remaining = held.quantity - fill.quantity;
            if remaining.is_zero() {
                positions.remove(&fill.symbol);
            } else {
                let updated = build(remaining, held.average_cost, held.current_price)?;
                positions.insert(fill.symbol.clone(), Arc::new(updated));
            }
        }
    }

    Ok(PortfolioSnapshot::from_positions(positions))
}

// =============================================================================
// Tests
// =============================================================================
