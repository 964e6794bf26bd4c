//! Stream Transport Module
//!
//! Everything between the raw WebSocket and the domain layer:
//!
//! - [`messages`]: the closed set of wire message envelopes
//! - [`codec`]: JSON (de)serialization with tag-based validation
//! - [`reconnect`]: exponential backoff policy
//! - [`heartbeat`]: liveness monitoring for silently-dead connections
//! - [`dispatcher`]: routing of decoded messages to typed handlers
//! - [`manager`]: the connection state machine and session loop

pub mod codec;
pub mod dispatcher;
pub mod heartbeat;
pub mod manager;
pub mod messages;
pub mod reconnect;

pub use codec::{CodecError, JsonCodec};
pub use dispatcher::{Dispatcher, UpdateHandlers};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
pub use manager::{
    ConnectionHandle, ConnectionManager, ConnectionState, NullObserver, StreamConfig, StreamError,
    StreamObserver,
};
pub use messages::WireMessage;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
