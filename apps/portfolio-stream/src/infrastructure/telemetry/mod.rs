//! Tracing Subscriber Setup
//!
//! Structured logging to stdout with `RUST_LOG`-style filtering.
//!
//! # Usage
//!
//! ```ignore
//! use portfolio_stream::infrastructure::telemetry;
//!
//! // Initialize once at startup.
//! telemetry::init();
//! ```

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Initialize the tracing subscriber.
///
/// Defaults the crate to `info` and the WebSocket stack to `warn` unless
/// overridden through `RUST_LOG`.
#[allow(clippy::expect_used)]
pub fn init() {
    let env_filter = EnvFilter::from_default_env()
        .add_directive(
            "portfolio_stream=info"
                .parse()
                .expect("static directive 'portfolio_stream=info' is valid"),
        )
        .add_directive(
            "tungstenite=warn"
                .parse()
                .expect("static directive 'tungstenite=warn' is valid"),
        )
        .add_directive(
            "tokio_tungstenite=warn"
                .parse()
                .expect("static directive 'tokio_tungstenite=warn' is valid"),
        );

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
