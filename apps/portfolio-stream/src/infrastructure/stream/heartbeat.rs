//! Heartbeat Manager
//!
//! Detects silently-dead connections. Every interval the manager asks the
//! session loop to send an application-level heartbeat frame; liveness
//! requires at least one inbound frame (of any kind) within twice the
//! interval, otherwise a timeout event tells the session to force-close the
//! transport and take the abnormal-closure path.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between outbound heartbeat frames.
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with a custom interval.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Silence longer than this declares the connection dead.
    #[must_use]
    pub const fn liveness_timeout(&self) -> Duration {
        // Twice the interval: one missed inbound heartbeat is tolerated,
        // two is a dead peer.
        self.interval.saturating_mul(2)
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone)]
pub enum HeartbeatEvent {
    /// Request to send an outbound heartbeat frame.
    SendPing,
    /// Liveness timeout; the connection should be force-closed.
    Timeout,
}

/// Inbound-activity tracker shared between the session loop and the manager.
#[derive(Debug)]
pub struct HeartbeatState {
    last_inbound: RwLock<Instant>,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            last_inbound: RwLock::new(Instant::now()),
        }
    }

    /// Record that any inbound frame arrived.
    pub fn record_inbound(&self) {
        *self.last_inbound.write() = Instant::now();
    }

    /// Time since the last inbound frame.
    #[must_use]
    pub fn time_since_inbound(&self) -> Duration {
        self.last_inbound.read().elapsed()
    }

    /// Reset state for a new connection.
    pub fn reset(&self) {
        *self.last_inbound.write() = Instant::now();
    }
}

/// Heartbeat manager that monitors connection liveness.
///
/// Spawned once per connection session with a session-scoped cancellation
/// token and event channel, so a manager from a superseded session can never
/// deliver events into the current one.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run the heartbeat monitoring loop until cancelled or timed out.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick fires immediately; skip it so the initial heartbeat
        // goes out one full interval after connect.
        interval.tick().await;

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("heartbeat manager cancelled");
                    break;
                }
                _ = interval.tick() => {
                    if self.check_and_ping().await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    /// Check liveness and request an outbound heartbeat.
    ///
    /// Returns `Err(())` when the loop should exit.
    async fn check_and_ping(&self) -> Result<(), ()> {
        let elapsed = self.state.time_since_inbound();
        if elapsed > self.config.liveness_timeout() {
            tracing::warn!(
                elapsed_ms = elapsed.as_millis(),
                timeout_ms = self.config.liveness_timeout().as_millis(),
                "heartbeat liveness timeout"
            );
            let _ = self.event_tx.send(HeartbeatEvent::Timeout).await;
            return Err(());
        }

        if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
            tracing::debug!("event channel closed, stopping heartbeat");
            return Err(());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn liveness_timeout_is_twice_interval() {
        let config = HeartbeatConfig::new(Duration::from_secs(30));
        assert_eq!(config.liveness_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn state_tracks_inbound_activity() {
        let state = HeartbeatState::new();
        assert!(state.time_since_inbound() < Duration::from_millis(100));

        std::thread::sleep(Duration::from_millis(20));
        state.record_inbound();
        assert!(state.time_since_inbound() < Duration::from_millis(20));
    }

    #[tokio::test]
    async fn manager_sends_ping_events() {
        let config = HeartbeatConfig::new(Duration::from_millis(50));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let manager = HeartbeatManager::new(config, Arc::clone(&state), event_tx, cancel.clone());
        let handle = tokio::spawn(manager.run());

        // Keep the connection alive while waiting for the ping request.
        state.record_inbound();
        let event = tokio::time::timeout(Duration::from_millis(300), event_rx.recv())
            .await
            .expect("should receive event")
            .expect("channel should not close");

        assert!(matches!(event, HeartbeatEvent::SendPing));

        cancel.cancel();
        handle.await.expect("task should complete");
    }

    #[tokio::test]
    async fn manager_detects_silence() {
        let config = HeartbeatConfig::new(Duration::from_millis(50));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, mut event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let manager = HeartbeatManager::new(config, Arc::clone(&state), event_tx, cancel.clone());

        // Backdate the last inbound frame past the liveness window.
        *state.last_inbound.write() = Instant::now() - Duration::from_millis(500);

        let handle = tokio::spawn(manager.run());

        let mut received_timeout = false;
        while let Ok(Some(event)) =
            tokio::time::timeout(Duration::from_millis(500), event_rx.recv()).await
        {
            if matches!(event, HeartbeatEvent::Timeout) {
                received_timeout = true;
                break;
            }
        }

        assert!(received_timeout, "should receive timeout event");
        cancel.cancel();
        let _ = tokio::time::timeout(Duration::from_millis(100), handle).await;
    }

    #[tokio::test]
    async fn manager_stops_on_cancellation() {
        let config = HeartbeatConfig::new(Duration::from_secs(10));
        let state = Arc::new(HeartbeatState::new());
        let (event_tx, _event_rx) = mpsc::channel(10);
        let cancel = CancellationToken::new();

        let manager = HeartbeatManager::new(config, state, event_tx, cancel.clone());
        let handle = tokio::spawn(manager.run());

        cancel.cancel();

        let result = tokio::time::timeout(Duration::from_millis(100), handle).await;
        assert!(result.is_ok(), "manager should shut down on cancellation");
    }
}
