#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::default_trait_access,
        clippy::items_after_statements
    )
)]

//! Portfolio Stream - Real-Time Price Distribution and Portfolio State
//!
//! Maintains one WebSocket connection to a market data server, keeps
//! subscriptions alive across reconnects, coalesces high-frequency price
//! ticks, and reconciles a derived portfolio valuation that readers can
//! always observe as a complete, immutable snapshot.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Pure types and state
//!   - `portfolio`: Positions, snapshots, and the recalculation engine
//!   - `streaming`: Price ticks and the coalescing update queue
//!   - `subscription`: The reconnect-surviving subscription registry
//!
//! - **Application**:
//!   - `services`: The `MarketDataService` facade wiring it all together
//!
//! - **Infrastructure**:
//!   - `stream`: WebSocket transport, codec, heartbeat, reconnect, dispatch
//!   - `config`: Environment-driven configuration
//!   - `telemetry`: Tracing subscriber setup
//!
//! # Data Flow
//!
//! ```text
//! WebSocket ──► Codec ──► Dispatcher ──┬──► Coalescing Queue ──► flush ──┐
//!                                      │                                 ▼
//!                                      └──► chain/error observers   Recalc Engine
//!                                                                        │
//!                                            published snapshot ◄────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types and state with no transport dependencies.
pub mod domain;

/// Application layer - Service orchestration.
pub mod application;

/// Infrastructure layer - Transport, configuration, and telemetry.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::portfolio::{
    AggregateMetrics, MetricError, PortfolioSnapshot, Position, PositionInputs, PositionMetricFn,
    PositionMetrics, RecalcError, TradeFill, TradeSide, apply_batch, apply_trade, linear_metrics,
};
pub use domain::streaming::{ChainUpdate, PriceBatch, PriceTick, PriceUpdateQueue};
pub use domain::subscription::{DataKind, Subscription, SubscriptionRegistry, Symbol};

// Application facade
pub use application::services::MarketDataService;

// Infrastructure config
pub use infrastructure::config::{ConfigError, ConnectionSettings, PipelineSettings, ServiceConfig};

// Stream transport (for integration tests)
pub use infrastructure::stream::{
    CodecError, ConnectionHandle, ConnectionManager, ConnectionState, Dispatcher, JsonCodec,
    NullObserver, ReconnectConfig, StreamConfig, StreamError, StreamObserver, UpdateHandlers,
    WireMessage,
};

// Telemetry
pub use infrastructure::telemetry::init as init_telemetry;
