//! Infrastructure layer - Transport, configuration, and telemetry.

/// Environment-driven configuration.
pub mod config;

/// WebSocket transport: codec, reconnect policy, heartbeat, dispatch, and
/// the connection manager.
pub mod stream;

/// Tracing subscriber setup.
pub mod telemetry;
