//! Connection health monitoring.
//!
//! A sampler task records a healthy/unhealthy boolean every sample period
//! into three ring windows (1 hour, 1 day, 1 week). A sample is healthy
//! when the terminal link, broker link and synchronization flag are all
//! up, quotes are streaming for the subscribed symbols, and the server has
//! not reported itself unhealthy.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::debug;

use termlink_common::SymbolPrice;
use termlink_wire::SyncListener;

use crate::state::TerminalState;

/// Quotes older than this stop counting as streaming.
const QUOTE_FRESHNESS: Duration = Duration::from_secs(60);

/// One bounded boolean window.
#[derive(Debug)]
struct RingWindow {
    capacity: usize,
    samples: VecDeque<bool>,
}

impl RingWindow {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity.min(4096)),
        }
    }

    fn push(&mut self, healthy: bool) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(healthy);
    }

    /// Mean of recorded samples; an empty window reports 1.0.
    fn ratio(&self) -> f64 {
        if self.samples.is_empty() {
            return 1.0;
        }
        let healthy = self.samples.iter().filter(|sample| **sample).count();
        healthy as f64 / self.samples.len() as f64
    }
}

#[derive(Debug)]
struct UptimeWindows {
    hour: RingWindow,
    day: RingWindow,
    week: RingWindow,
}

impl UptimeWindows {
    fn new(sample_period: Duration) -> Self {
        let period_ms = sample_period.as_millis().max(1) as u64;
        let capacity = |window: Duration| ((window.as_millis() as u64 / period_ms).max(1)) as usize;
        Self {
            hour: RingWindow::new(capacity(Duration::from_secs(60 * 60))),
            day: RingWindow::new(capacity(Duration::from_secs(24 * 60 * 60))),
            week: RingWindow::new(capacity(Duration::from_secs(7 * 24 * 60 * 60))),
        }
    }

    fn push(&mut self, healthy: bool) {
        self.hour.push(healthy);
        self.day.push(healthy);
        self.week.push(healthy);
    }
}

struct HealthInner {
    state: TerminalState,
    synchronized: Arc<AtomicBool>,
    subscriptions: Arc<RwLock<HashSet<String>>>,
    last_quote_at: RwLock<Option<Instant>>,
    server_health: RwLock<Option<Value>>,
    windows: Mutex<UptimeWindows>,
    shutdown_tx: broadcast::Sender<()>,
    stopped: AtomicBool,
}

impl HealthInner {
    /// Computes the current health sample.
    fn is_healthy(&self) -> bool {
        let quote_streaming = {
            if self.subscriptions.read().is_empty() {
                true
            } else {
                self.last_quote_at
                    .read()
                    .map(|at| at.elapsed() < QUOTE_FRESHNESS)
                    .unwrap_or(false)
            }
        };
        let server_healthy = self
            .server_health
            .read()
            .as_ref()
            .and_then(|health| health.get("healthy"))
            .and_then(Value::as_bool)
            .unwrap_or(true);
        self.state.connected()
            && self.state.connected_to_broker()
            && self.synchronized.load(Ordering::Acquire)
            && quote_streaming
            && server_healthy
    }
}

/// Tracks connection uptime over rolling 1h/1d/1w windows and mirrors the
/// server-reported health object.
#[derive(Clone)]
pub struct ConnectionHealthMonitor {
    inner: Arc<HealthInner>,
}

impl ConnectionHealthMonitor {
    /// Creates the monitor and spawns its sampler task.
    ///
    /// `synchronized` and `subscriptions` are shared with the owning
    /// connection so samples reflect the engine's live view.
    pub fn new(
        state: TerminalState,
        synchronized: Arc<AtomicBool>,
        subscriptions: Arc<RwLock<HashSet<String>>>,
        sample_period: Duration,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(4);
        let inner = Arc::new(HealthInner {
            state,
            synchronized,
            subscriptions,
            last_quote_at: RwLock::new(None),
            server_health: RwLock::new(None),
            windows: Mutex::new(UptimeWindows::new(sample_period)),
            shutdown_tx,
            stopped: AtomicBool::new(false),
        });
        let monitor = Self { inner };
        monitor.spawn_sampler(sample_period, shutdown_rx);
        monitor
    }

    fn spawn_sampler(&self, sample_period: Duration, mut shutdown_rx: broadcast::Receiver<()>) {
        let inner = self.inner.clone();
        tokio::spawn(async move {
            let mut ticker = interval(sample_period);
            // The first tick fires immediately; skip it so the first real
            // sample lands one period in.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let healthy = inner.is_healthy();
                        inner.windows.lock().push(healthy);
                    }
                    _ = shutdown_rx.recv() => {
                        debug!("Health sampler shutting down");
                        return;
                    }
                }
            }
        });
    }

    /// Current health sample.
    pub fn is_healthy(&self) -> bool {
        self.inner.is_healthy()
    }

    /// Uptime ratios over the rolling windows, keyed `1h`/`1d`/`1w`.
    pub fn uptime(&self) -> HashMap<String, f64> {
        let windows = self.inner.windows.lock();
        HashMap::from([
            ("1h".to_string(), windows.hour.ratio()),
            ("1d".to_string(), windows.day.ratio()),
            ("1w".to_string(), windows.week.ratio()),
        ])
    }

    /// Latest server-reported health object, if any.
    pub fn server_health_status(&self) -> Option<Value> {
        self.inner.server_health.read().clone()
    }

    /// Cancels the sampler. The monitor never holds the process open
    /// after this returns.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.shutdown_tx.send(());
    }
}

#[async_trait]
impl SyncListener for ConnectionHealthMonitor {
    async fn on_symbol_prices_updated(
        &self,
        _prices: Vec<SymbolPrice>,
        _equity: Option<Decimal>,
        _margin: Option<Decimal>,
        _free_margin: Option<Decimal>,
        _margin_level: Option<Decimal>,
    ) {
        *self.inner.last_quote_at.write() = Some(Instant::now());
    }

    async fn on_server_health_status(&self, health_status: Value) {
        *self.inner.server_health.write() = Some(health_status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn monitor_parts() -> (TerminalState, Arc<AtomicBool>, Arc<RwLock<HashSet<String>>>) {
        (
            TerminalState::new(Duration::from_secs(60)),
            Arc::new(AtomicBool::new(false)),
            Arc::new(RwLock::new(HashSet::new())),
        )
    }

    #[test]
    fn test_ring_window_ratio() {
        let mut window = RingWindow::new(4);
        assert_eq!(window.ratio(), 1.0);
        window.push(true);
        window.push(true);
        window.push(false);
        window.push(false);
        assert_eq!(window.ratio(), 0.5);
        // Overflow evicts the oldest sample.
        window.push(false);
        assert_eq!(window.ratio(), 0.25);
    }

    #[test]
    fn test_window_capacities_scale_with_period() {
        let windows = UptimeWindows::new(Duration::from_secs(1));
        assert_eq!(windows.hour.capacity, 3_600);
        assert_eq!(windows.day.capacity, 86_400);
        assert_eq!(windows.week.capacity, 604_800);
    }

    #[tokio::test]
    async fn test_healthy_requires_all_signals() {
        let (state, synchronized, subscriptions) = monitor_parts();
        let monitor = ConnectionHealthMonitor::new(
            state.clone(),
            synchronized.clone(),
            subscriptions.clone(),
            Duration::from_millis(10),
        );
        assert!(!monitor.is_healthy());

        state.on_connected().await;
        state.on_broker_connection_status_changed(true).await;
        synchronized.store(true, Ordering::Release);
        // No subscriptions: quote streaming is vacuously true.
        assert!(monitor.is_healthy());

        // A subscribed symbol with no quotes yet turns health off.
        subscriptions.write().insert("EURUSD".to_string());
        assert!(!monitor.is_healthy());
        monitor
            .on_symbol_prices_updated(Vec::new(), None, None, None, None)
            .await;
        assert!(monitor.is_healthy());
        monitor.stop();
    }

    #[tokio::test]
    async fn test_server_health_report_is_mirrored() {
        let (state, synchronized, subscriptions) = monitor_parts();
        let monitor = ConnectionHealthMonitor::new(
            state.clone(),
            synchronized.clone(),
            subscriptions,
            Duration::from_millis(10),
        );
        state.on_connected().await;
        state.on_broker_connection_status_changed(true).await;
        synchronized.store(true, Ordering::Release);
        assert!(monitor.is_healthy());

        monitor
            .on_server_health_status(json!({"healthy": false, "restIpAddress": "node-3"}))
            .await;
        assert!(!monitor.is_healthy());
        assert_eq!(
            monitor.server_health_status().unwrap()["restIpAddress"],
            "node-3"
        );
        monitor.stop();
    }

    #[tokio::test]
    async fn test_sampler_records_and_stop_cancels() {
        let (state, synchronized, subscriptions) = monitor_parts();
        let monitor = ConnectionHealthMonitor::new(
            state.clone(),
            synchronized.clone(),
            subscriptions,
            Duration::from_millis(10),
        );
        state.on_connected().await;
        state.on_broker_connection_status_changed(true).await;
        synchronized.store(true, Ordering::Release);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let uptime = monitor.uptime();
        assert_eq!(uptime["1h"], 1.0);
        assert_eq!(uptime["1d"], 1.0);
        assert_eq!(uptime["1w"], 1.0);

        monitor.stop();
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Sampler is gone; a degraded link no longer produces samples.
        state.on_disconnected().await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(monitor.uptime()["1h"], 1.0);
    }
}
