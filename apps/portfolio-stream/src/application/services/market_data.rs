//! Market Data Service
//!
//! The facade external collaborators (presentation layer, trade executor)
//! talk to. It owns the full pipeline: connection manager → codec →
//! dispatcher → coalescing queue → recalculation engine → published
//! snapshot.
//!
//! # Snapshot publication
//!
//! Both price-driven (`applyBatch` on flush) and trade-driven
//! (`submit_trade`) recalculation are serialized behind one mutex, and the
//! resulting immutable snapshot is published through a watch channel, so
//! readers always observe a complete snapshot via a single reference swap.
//!
//! # Flush cadence
//!
//! The flush timer runs independently of the connection state; while
//! disconnected it simply finds the queue empty and does nothing.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::domain::portfolio::{
    PortfolioSnapshot, PositionMetricFn, RecalcError, TradeFill, apply_batch, apply_trade,
};
use crate::domain::streaming::{ChainUpdate, PriceTick, PriceUpdateQueue};
use crate::domain::subscription::{DataKind, Subscription, SubscriptionRegistry, Symbol};
use crate::infrastructure::config::ServiceConfig;
use crate::infrastructure::stream::dispatcher::{Dispatcher, UpdateHandlers};
use crate::infrastructure::stream::manager::{
    ConnectionHandle, ConnectionManager, ConnectionState, StreamError, StreamObserver,
};
use crate::infrastructure::stream::messages::{ErrorPayload, SubscriptionRequest, WireMessage};

/// Capacity of the chain update broadcast channel.
const CHAIN_CHANNEL_CAPACITY: usize = 256;

// =============================================================================
// Stream Bridge
// =============================================================================

/// Handler set bridging decoded stream messages into the domain pipeline.
///
/// Price ticks go into the coalescing queue (never applied synchronously);
/// chain updates and server errors are fanned out to subscribers.
struct StreamBridge {
    queue: Arc<PriceUpdateQueue>,
    chain_tx: broadcast::Sender<ChainUpdate>,
}

impl UpdateHandlers for StreamBridge {
    fn on_price_updates(&self, ticks: Vec<PriceTick>) {
        for tick in ticks {
            self.queue.enqueue(tick);
        }
    }

    fn on_chain_update(&self, update: ChainUpdate) {
        // No receivers is fine; chain data is optional for consumers.
        let _ = self.chain_tx.send(update);
    }

    fn on_stream_error(&self, error: &ErrorPayload) {
        tracing::warn!(code = error.code, message = %error.message, "server reported error");
    }

    fn on_subscription_error(&self, error: &ErrorPayload) {
        tracing::warn!(
            code = error.code,
            message = %error.message,
            "server rejected subscription"
        );
    }
}

// =============================================================================
// Service
// =============================================================================

/// Public facade over the market data pipeline.
///
/// Cheap to share behind an `Arc`; all methods take `&self`.
pub struct MarketDataService {
    registry: Arc<SubscriptionRegistry>,
    queue: Arc<PriceUpdateQueue>,
    connection: ConnectionHandle,
    snapshot: Arc<Mutex<PortfolioSnapshot>>,
    snapshot_tx: watch::Sender<PortfolioSnapshot>,
    chain_tx: broadcast::Sender<ChainUpdate>,
    metric_fn: PositionMetricFn,
    cancel: CancellationToken,
}

impl MarketDataService {
    /// Start the service: spawn the connection manager, the flush timer, and
    /// (when configured) the snapshot refresh timer.
    ///
    /// The connection is not opened; call [`MarketDataService::connect`].
    #[must_use]
    pub fn start(
        config: &ServiceConfig,
        initial: PortfolioSnapshot,
        metric_fn: PositionMetricFn,
        observer: Arc<dyn StreamObserver>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let registry = Arc::new(SubscriptionRegistry::new());
        let queue = Arc::new(PriceUpdateQueue::new());
        let (chain_tx, _) = broadcast::channel(CHAIN_CHANNEL_CAPACITY);
        let (snapshot_tx, _) = watch::channel(initial.clone());
        let snapshot = Arc::new(Mutex::new(initial));

        let bridge = Arc::new(StreamBridge {
            queue: Arc::clone(&queue),
            chain_tx: chain_tx.clone(),
        });

        let connection = ConnectionManager::spawn(
            config.stream_config(),
            Arc::clone(&registry),
            Dispatcher::new(bridge),
            observer,
            cancel.clone(),
        );

        let service = Arc::new(Self {
            registry,
            queue,
            connection,
            snapshot,
            snapshot_tx,
            chain_tx,
            metric_fn,
            cancel: cancel.clone(),
        });

        service.spawn_flush_task(config.pipeline.flush_interval, cancel.clone());
        if !config.pipeline.snapshot_refresh_interval.is_zero() {
            service.spawn_refresh_task(config.pipeline.snapshot_refresh_interval, cancel);
        }

        service
    }

    // =========================================================================
    // Connection Lifecycle
    // =========================================================================

    /// Open the connection; resolves once subscriptions are replayed.
    ///
    /// # Errors
    ///
    /// See [`ConnectionHandle::connect`].
    pub async fn connect(&self) -> Result<(), StreamError> {
        self.connection.connect().await
    }

    /// Close the connection intentionally (close code 1000).
    ///
    /// # Errors
    ///
    /// See [`ConnectionHandle::disconnect`].
    pub async fn disconnect(&self) -> Result<(), StreamError> {
        self.connection.disconnect().await
    }

    /// Current connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Shut the service down: close the connection intentionally, then stop
    /// the connection manager and all background timers.
    pub async fn shutdown(&self) {
        let _ = self.disconnect().await;
        self.cancel.cancel();
    }

    /// Watch channel of connection state changes.
    #[must_use]
    pub fn connection_states(&self) -> watch::Receiver<ConnectionState> {
        self.connection.state_changes()
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Subscribe symbols for a data kind.
    ///
    /// The registry change is immediate and survives reconnects; when
    /// currently connected, a subscribe message is also sent right away.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::ChannelClosed`] when the manager is gone.
    pub async fn subscribe(
        &self,
        symbols: Vec<Symbol>,
        kind: DataKind,
    ) -> Result<(), StreamError> {
        let added: Vec<Symbol> = symbols
            .into_iter()
            .filter(|symbol| self.registry.add(symbol.clone(), kind))
            .collect();

        if added.is_empty() || self.connection.state() != ConnectionState::Connected {
            return Ok(());
        }

        self.connection
            .send(WireMessage::Subscribe(SubscriptionRequest::new(added, kind)))
            .await
    }

    /// Unsubscribe symbols for a data kind.
    ///
    /// # Errors
    ///
    /// Returns [`StreamError::ChannelClosed`] when the manager is gone.
    pub async fn unsubscribe(
        &self,
        symbols: Vec<Symbol>,
        kind: DataKind,
    ) -> Result<(), StreamError> {
        let removed: Vec<Symbol> = symbols
            .into_iter()
            .filter(|symbol| self.registry.remove(symbol, kind))
            .collect();

        if removed.is_empty() || self.connection.state() != ConnectionState::Connected {
            return Ok(());
        }

        self.connection
            .send(WireMessage::Unsubscribe(SubscriptionRequest::new(
                removed, kind,
            )))
            .await
    }

    /// All active subscriptions.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.registry.all()
    }

    // =========================================================================
    // Portfolio
    // =========================================================================

    /// Current published snapshot.
    #[must_use]
    pub fn snapshot(&self) -> PortfolioSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Watch channel of snapshot publications.
    #[must_use]
    pub fn snapshot_changes(&self) -> watch::Receiver<PortfolioSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Broadcast channel of option chain updates.
    #[must_use]
    pub fn chain_updates(&self) -> broadcast::Receiver<ChainUpdate> {
        self.chain_tx.subscribe()
    }

    /// Apply an executed trade fill and publish the resulting snapshot.
    ///
    /// Serialized with the flush-driven batch application, so the two
    /// writers can never interleave on the snapshot.
    ///
    /// # Errors
    ///
    /// See [`apply_trade`]; on error the published snapshot is unchanged.
    pub fn submit_trade(&self, fill: &TradeFill) -> Result<PortfolioSnapshot, RecalcError> {
        let mut current = self.snapshot.lock();
        let updated = apply_trade(&current, fill, &self.metric_fn)?;
        *current = updated.clone();
        let _ = self.snapshot_tx.send(updated.clone());
        Ok(updated)
    }

    // =========================================================================
    // Background Tasks
    // =========================================================================

    fn spawn_flush_task(self: &Arc<Self>, flush_interval: Duration, cancel: CancellationToken) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => service.flush_once(),
                }
            }
            tracing::debug!("flush task stopped");
        });
    }

    fn spawn_refresh_task(self: &Arc<Self>, refresh_interval: Duration, cancel: CancellationToken) {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(refresh_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        // Republish without recomputing, for late subscribers.
                        let current = service.snapshot.lock().clone();
                        let _ = service.snapshot_tx.send(current);
                    }
                }
            }
        });
    }

    /// Drain the coalescing queue and apply it as one batch. An empty queue
    /// is a no-op, not a zero-delta publication.
    fn flush_once(&self) {
        let batch = self.queue.drain();
        if batch.is_empty() {
            return;
        }

        let mut current = self.snapshot.lock();
        match apply_batch(&current, &batch, &self.metric_fn) {
            Ok(updated) => {
                tracing::debug!(batch = batch.len(), "applied price batch");
                *current = updated.clone();
                let _ = self.snapshot_tx.send(updated);
            }
            Err(error) => {
                // Batch dropped atomically; the published snapshot is intact.
                tracing::error!(error = %error, "price batch rejected");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::portfolio::{Position, TradeSide, linear_metrics};
    use crate::infrastructure::config::settings::{ConnectionSettings, PipelineSettings};
    use crate::infrastructure::stream::manager::NullObserver;
    use tokio_test::assert_ok;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::collections::BTreeMap;

    fn dec(value: i64) -> Decimal {
        Decimal::new(value, 0)
    }

    fn test_config(flush_ms: u64) -> ServiceConfig {
        ServiceConfig {
            connection: ConnectionSettings {
                url: "ws://127.0.0.1:1/stream".to_string(),
                reconnect_attempts: 1,
                reconnect_base_delay: Duration::from_millis(10),
                reconnect_cap_delay: Duration::from_millis(10),
                heartbeat_interval: Duration::from_secs(30),
                connection_timeout: Duration::from_secs(1),
            },
            pipeline: PipelineSettings {
                flush_interval: Duration::from_millis(flush_ms),
                snapshot_refresh_interval: Duration::ZERO,
            },
        }
    }

    fn seeded_snapshot() -> PortfolioSnapshot {
        let metric_fn = linear_metrics();
        let position =
            Position::build("ABC".to_string(), dec(10), dec(100), dec(100), &metric_fn).unwrap();
        let mut positions = BTreeMap::new();
        positions.insert("ABC".to_string(), Arc::new(position));
        PortfolioSnapshot::from_positions(positions)
    }

    #[tokio::test]
    async fn flush_applies_queued_ticks_and_publishes() {
        let cancel = CancellationToken::new();
        let service = MarketDataService::start(
            &test_config(20),
            seeded_snapshot(),
            linear_metrics(),
            Arc::new(NullObserver),
            cancel.clone(),
        );

        let mut changes = service.snapshot_changes();
        service
            .queue
            .enqueue(PriceTick::new("ABC".to_string(), dec(110), Utc::now()));

        tokio::time::timeout(Duration::from_millis(500), changes.changed())
            .await
            .expect("flush should publish")
            .expect("watch should stay open");

        let snapshot = service.snapshot();
        let position = snapshot.position("ABC").unwrap();
        assert_eq!(position.current_price, dec(110));
        assert_eq!(position.metrics.unrealized_pnl, dec(100));

        cancel.cancel();
    }

    #[tokio::test]
    async fn empty_flush_publishes_nothing() {
        let cancel = CancellationToken::new();
        let service = MarketDataService::start(
            &test_config(10),
            seeded_snapshot(),
            linear_metrics(),
            Arc::new(NullObserver),
            cancel.clone(),
        );

        let mut changes = service.snapshot_changes();
        let result =
            tokio::time::timeout(Duration::from_millis(100), changes.changed()).await;
        assert!(result.is_err(), "no publication expected without ticks");

        cancel.cancel();
    }

    #[tokio::test]
    async fn submit_trade_publishes_new_snapshot() {
        let cancel = CancellationToken::new();
        let service = MarketDataService::start(
            &test_config(1000),
            PortfolioSnapshot::empty(),
            linear_metrics(),
            Arc::new(NullObserver),
            cancel.clone(),
        );

        let fill = TradeFill {
            symbol: "DEF".to_string(),
            side: TradeSide::Buy,
            quantity: dec(5),
            price: dec(40),
            timestamp: Utc::now(),
        };

        let updated = service.submit_trade(&fill).unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(service.snapshot().aggregates().total_value, dec(200));

        cancel.cancel();
    }

    #[tokio::test]
    async fn subscribe_updates_registry_while_disconnected() {
        let cancel = CancellationToken::new();
        let service = MarketDataService::start(
            &test_config(1000),
            PortfolioSnapshot::empty(),
            linear_metrics(),
            Arc::new(NullObserver),
            cancel.clone(),
        );

        tokio_test::assert_ok!(
            service
                .subscribe(vec!["AAPL".to_string(), "MSFT".to_string()], DataKind::Price)
                .await
        );

        assert_eq!(service.subscriptions().len(), 2);
        assert_eq!(service.connection_state(), ConnectionState::Disconnected);

        tokio_test::assert_ok!(
            service
                .unsubscribe(vec!["AAPL".to_string()], DataKind::Price)
                .await
        );
        assert_eq!(service.subscriptions().len(), 1);

        cancel.cancel();
    }

    #[tokio::test]
    async fn shutdown_stops_the_connection_manager() {
        let cancel = CancellationToken::new();
        let service = MarketDataService::start(
            &test_config(1000),
            PortfolioSnapshot::empty(),
            linear_metrics(),
            Arc::new(NullObserver),
            cancel,
        );

        service.shutdown().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        // The manager actor is gone; lifecycle calls now fail fast.
        assert!(service.connect().await.is_err());
    }

    #[tokio::test]
    async fn failed_batch_leaves_published_snapshot_intact() {
        let failing: PositionMetricFn = Arc::new(|_| {
            Err(crate::domain::portfolio::MetricError::Computation(
                "model rejected inputs".into(),
            ))
        });

        let cancel = CancellationToken::new();
        let service = MarketDataService::start(
            &test_config(10),
            seeded_snapshot(),
            failing,
            Arc::new(NullObserver),
            cancel.clone(),
        );

        service
            .queue
            .enqueue(PriceTick::new("ABC".to_string(), dec(110), Utc::now()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Rejected batch; old snapshot still published.
        let snapshot = service.snapshot();
        assert_eq!(snapshot.position("ABC").unwrap().current_price, dec(100));

        cancel.cancel();
    }
}
