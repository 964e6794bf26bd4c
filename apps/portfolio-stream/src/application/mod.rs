//! Application layer - Orchestration between the transport and the domain.

/// Services wiring the stream pipeline to the portfolio engine.
pub mod services;
