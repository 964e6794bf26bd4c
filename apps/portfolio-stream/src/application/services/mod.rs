//! Application Services
//!
//! - `market_data`: the public facade wiring the connection manager,
//!   subscription registry, coalescing queue, and recalculation engine into
//!   one service.

pub mod market_data;

pub use market_data::MarketDataService;
