//! Portfolio Pipeline Integration Tests
//!
//! Drives the full pipeline end to end against a local WebSocket server:
//! price frames in, coalesced flush, recalculation, and published immutable
//! snapshots out.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use portfolio_stream::{
    ConnectionSettings, DataKind, MarketDataService, NullObserver, PipelineSettings,
    PortfolioSnapshot, Position, ServiceConfig, TradeFill, TradeSide, linear_metrics,
};

// =============================================================================
// Test Helpers
// =============================================================================

fn dec(value: i64) -> Decimal {
    Decimal::new(value, 0)
}

fn service_config(url: String, flush_ms: u64) -> ServiceConfig {
    ServiceConfig {
        connection: ConnectionSettings {
            url,
            reconnect_attempts: 2,
            reconnect_base_delay: Duration::from_millis(20),
            reconnect_cap_delay: Duration::from_millis(100),
            heartbeat_interval: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(2),
        },
        pipeline: PipelineSettings {
            flush_interval: Duration::from_millis(flush_ms),
            snapshot_refresh_interval: Duration::ZERO,
        },
    }
}

/// Snapshot holding 10 shares of ABC at an average cost of 100.
fn seeded_snapshot() -> PortfolioSnapshot {
    let metric_fn = linear_metrics();
    let position =
        Position::build("ABC".to_string(), dec(10), dec(100), dec(100), &metric_fn).unwrap();
    let mut positions = BTreeMap::new();
    positions.insert("ABC".to_string(), Arc::new(position));
    PortfolioSnapshot::from_positions(positions)
}

async fn bind_server() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept_ws(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

/// Read text frames until one with the given type tag arrives.
async fn expect_frame(ws: &mut WebSocketStream<TcpStream>, tag: &str) -> serde_json::Value {
    loop {
        let message = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("frame expected")
            .expect("stream open")
            .expect("valid frame");
        if let Message::Text(text) = message {
            let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
            if value["type"] == tag {
                return value;
            }
        }
    }
}

async fn send_json(ws: &mut WebSocketStream<TcpStream>, value: &serde_json::Value) {
    ws.send(Message::text(value.to_string())).await.unwrap();
}

fn price_update(entries: &[(&str, i64)]) -> serde_json::Value {
    let updates: Vec<serde_json::Value> = entries
        .iter()
        .map(|(symbol, price)| {
            serde_json::json!({
                "symbol": symbol,
                "price": price,
                "timestamp": Utc::now().to_rfc3339(),
            })
        })
        .collect();
    serde_json::json!({ "type": "price_update", "data": { "updates": updates } })
}

async fn next_snapshot(
    changes: &mut tokio::sync::watch::Receiver<PortfolioSnapshot>,
) -> PortfolioSnapshot {
    timeout(Duration::from_secs(2), changes.changed())
        .await
        .expect("snapshot publication expected")
        .expect("watch channel open");
    changes.borrow().clone()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn price_tick_flows_through_flush_into_snapshot() {
    let (listener, url) = bind_server().await;

    let cancel = CancellationToken::new();
    let service = MarketDataService::start(
        &service_config(url, 20),
        seeded_snapshot(),
        linear_metrics(),
        Arc::new(NullObserver),
        cancel.clone(),
    );

    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let subscribe = expect_frame(&mut ws, "subscribe").await;
        assert_eq!(subscribe["symbols"][0], "ABC");

        send_json(&mut ws, &price_update(&[("ABC", 110)])).await;
        // Keep the connection open until the test is done.
        while ws.next().await.is_some() {}
    });

    service
        .subscribe(vec!["ABC".to_string()], DataKind::Price)
        .await
        .unwrap();

    let mut changes = service.snapshot_changes();
    service.connect().await.unwrap();

    let snapshot = next_snapshot(&mut changes).await;
    let position = snapshot.position("ABC").unwrap();
    assert_eq!(position.current_price, dec(110));
    assert_eq!(position.metrics.market_value, dec(1100));
    assert_eq!(position.metrics.cost_basis, dec(1000));
    assert_eq!(position.metrics.unrealized_pnl, dec(100));
    assert_eq!(position.metrics.unrealized_pnl_pct, dec(10));

    let aggregates = snapshot.aggregates();
    assert_eq!(aggregates.total_value, dec(1100));
    assert_eq!(aggregates.total_pnl, dec(100));

    cancel.cancel();
    server.abort();
}

#[tokio::test]
async fn rapid_ticks_coalesce_to_latest_price() {
    let (listener, url) = bind_server().await;

    let cancel = CancellationToken::new();
    // Slow flush so both frames land in the same window.
    let service = MarketDataService::start(
        &service_config(url, 200),
        seeded_snapshot(),
        linear_metrics(),
        Arc::new(NullObserver),
        cancel.clone(),
    );

    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let _ = expect_frame(&mut ws, "subscribe").await;

        send_json(&mut ws, &price_update(&[("ABC", 105)])).await;
        send_json(&mut ws, &price_update(&[("ABC", 112)])).await;
        while ws.next().await.is_some() {}
    });

    service
        .subscribe(vec!["ABC".to_string()], DataKind::Price)
        .await
        .unwrap();

    let mut changes = service.snapshot_changes();
    service.connect().await.unwrap();

    // One publication carrying only the latest price, not two.
    let snapshot = next_snapshot(&mut changes).await;
    assert_eq!(snapshot.position("ABC").unwrap().current_price, dec(112));

    let quiet = timeout(Duration::from_millis(300), changes.changed()).await;
    assert!(quiet.is_err(), "stale coalesced tick must not republish");

    cancel.cancel();
    server.abort();
}

#[tokio::test]
async fn ticks_for_unheld_symbols_publish_nothing() {
    let (listener, url) = bind_server().await;

    let cancel = CancellationToken::new();
    let service = MarketDataService::start(
        &service_config(url, 20),
        seeded_snapshot(),
        linear_metrics(),
        Arc::new(NullObserver),
        cancel.clone(),
    );

    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let _ = expect_frame(&mut ws, "subscribe").await;
        send_json(&mut ws, &price_update(&[("ZZZ", 42)])).await;
        while ws.next().await.is_some() {}
    });

    service
        .subscribe(vec!["ZZZ".to_string()], DataKind::Price)
        .await
        .unwrap();

    let mut changes = service.snapshot_changes();
    service.connect().await.unwrap();

    let quiet = timeout(Duration::from_millis(300), changes.changed()).await;
    assert!(quiet.is_err(), "unheld symbol must not move the portfolio");
    assert_eq!(service.snapshot().position("ABC").unwrap().current_price, dec(100));

    cancel.cancel();
    server.abort();
}

#[tokio::test]
async fn chain_updates_fan_out_to_subscribers() {
    let (listener, url) = bind_server().await;

    let cancel = CancellationToken::new();
    let service = MarketDataService::start(
        &service_config(url, 1000),
        PortfolioSnapshot::empty(),
        linear_metrics(),
        Arc::new(NullObserver),
        cancel.clone(),
    );

    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let subscribe = expect_frame(&mut ws, "subscribe").await;
        assert_eq!(subscribe["dataType"], "option_chain");

        send_json(
            &mut ws,
            &serde_json::json!({
                "type": "option_chain_update",
                "data": {
                    "underlying": "SPY",
                    "optionChain": { "expirations": ["2026-09-18"] }
                }
            }),
        )
        .await;
        while ws.next().await.is_some() {}
    });

    service
        .subscribe(vec!["SPY".to_string()], DataKind::Chain)
        .await
        .unwrap();

    let mut chains = service.chain_updates();
    service.connect().await.unwrap();

    let update = timeout(Duration::from_secs(2), chains.recv())
        .await
        .expect("chain update expected")
        .unwrap();
    assert_eq!(update.underlying, "SPY");
    assert_eq!(update.chain["expirations"][0], "2026-09-18");

    cancel.cancel();
    server.abort();
}

#[tokio::test]
async fn trade_fill_then_tick_reconciles_in_order() {
    let (listener, url) = bind_server().await;

    let cancel = CancellationToken::new();
    let service = MarketDataService::start(
        &service_config(url, 20),
        PortfolioSnapshot::empty(),
        linear_metrics(),
        Arc::new(NullObserver),
        cancel.clone(),
    );

    let server = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let _ = expect_frame(&mut ws, "subscribe").await;
        send_json(&mut ws, &price_update(&[("DEF", 50)])).await;
        while ws.next().await.is_some() {}
    });

    // Open the position before any market data arrives.
    let fill = TradeFill {
        symbol: "DEF".to_string(),
        side: TradeSide::Buy,
        quantity: dec(5),
        price: dec(40),
        timestamp: Utc::now(),
    };
    let opened = service.submit_trade(&fill).unwrap();
    assert_eq!(opened.aggregates().total_value, dec(200));

    service
        .subscribe(vec!["DEF".to_string()], DataKind::Price)
        .await
        .unwrap();

    let mut changes = service.snapshot_changes();
    service.connect().await.unwrap();

    let snapshot = next_snapshot(&mut changes).await;
    let position = snapshot.position("DEF").unwrap();
    assert_eq!(position.current_price, dec(50));
    assert_eq!(position.metrics.market_value, dec(250));
    assert_eq!(position.metrics.unrealized_pnl, dec(50));
    assert_eq!(snapshot.aggregates().total_pnl_pct, dec(25));

    cancel.cancel();
    server.abort();
}

#[tokio::test]
async fn subscriptions_survive_a_dropped_connection() {
    let (listener, url) = bind_server().await;

    let cancel = CancellationToken::new();
    let service = MarketDataService::start(
        &service_config(url, 20),
        seeded_snapshot(),
        linear_metrics(),
        Arc::new(NullObserver),
        cancel.clone(),
    );

    let server = tokio::spawn(async move {
        // First session dies right after the replay.
        let mut ws = accept_ws(&listener).await;
        let _ = expect_frame(&mut ws, "subscribe").await;
        drop(ws);

        // Second session gets the same replay and delivers the tick.
        let mut ws = accept_ws(&listener).await;
        let replay = expect_frame(&mut ws, "subscribe").await;
        assert_eq!(replay["symbols"][0], "ABC");
        send_json(&mut ws, &price_update(&[("ABC", 130)])).await;
        while ws.next().await.is_some() {}
    });

    service
        .subscribe(vec!["ABC".to_string()], DataKind::Price)
        .await
        .unwrap();

    let mut changes = service.snapshot_changes();
    service.connect().await.unwrap();

    // The tick arrives through the second session, without re-subscribing.
    let snapshot = next_snapshot(&mut changes).await;
    assert_eq!(snapshot.position("ABC").unwrap().current_price, dec(130));
    assert_eq!(service.subscriptions().len(), 1);

    cancel.cancel();
    server.abort();
}
