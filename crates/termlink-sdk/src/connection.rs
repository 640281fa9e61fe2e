//! Per-account terminal connection and synchronization engine.
//!
//! `TerminalConnection` owns the account's terminal state mirror, history
//! storage and health monitor, wires them into the transport's event
//! stream, and drives the synchronization state machine: a fresh sync on
//! every authentication, doubling retry back-off on failure, re-subscribe
//! on socket reconnect, and a forced resync when the packet orderer gives
//! up on a sequence gap.
//!
//! A retry attempt only acts while its key is still the current one and
//! the connection is not closed, so a queued timer firing after `close()`
//! (or after a newer connect superseded it) is a no-op.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::time::{sleep, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;

use termlink_common::{
    AccountInformation, ApiError, Order, Position, SymbolPrice, SymbolSpecification,
};
use termlink_wire::{ReconnectListener, SyncListener};

use crate::client::{DealsResult, HistoryOrdersResult, TerminalClient};
use crate::config::ClientOptions;
use crate::health::ConnectionHealthMonitor;
use crate::history::{HistoryStorage, MemoryHistoryStorage};
use crate::registry::ConnectionRegistry;
use crate::state::TerminalState;
use crate::trade::{
    MarketTradeOptions, PendingTradeOptions, TradeError, TradeRequest, TradeResponse,
};

/// Descriptor of the account a connection is opened for.
#[derive(Debug, Clone)]
pub struct Account {
    /// Account id. One live connection exists per id.
    pub id: String,
    /// Application the account belongs to, when it differs from the
    /// SDK-wide one. Influences the `wait_synchronized` pattern.
    pub application: Option<String>,
}

impl Account {
    /// Descriptor with no application override.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            application: None,
        }
    }
}

/// Options for [`TerminalConnection::wait_synchronized`].
#[derive(Debug, Clone)]
pub struct SynchronizationOptions {
    /// Synchronization pass to wait for; defaults to the most recent one.
    pub synchronization_id: Option<String>,
    /// Overall deadline in seconds.
    pub timeout_in_seconds: u64,
    /// Poll interval in milliseconds.
    pub interval_in_milliseconds: u64,
    /// Application regex for the server-side handshake.
    pub application_pattern: Option<String>,
}

impl Default for SynchronizationOptions {
    fn default() -> Self {
        Self {
            synchronization_id: None,
            timeout_in_seconds: 300,
            interval_in_milliseconds: 1_000,
            application_pattern: None,
        }
    }
}

#[derive(Debug, Default)]
struct SyncIdState {
    last: Option<String>,
    last_disconnected: Option<String>,
}

pub(crate) struct ConnectionInner {
    client: Arc<dyn TerminalClient>,
    account: Account,
    history_start_time: Option<DateTime<Utc>>,
    terminal_state: TerminalState,
    history_storage: Arc<dyn HistoryStorage>,
    health_monitor: ConnectionHealthMonitor,
    registry: Weak<ConnectionRegistry>,
    subscriptions: Arc<RwLock<HashSet<String>>>,
    orders_synchronized: Mutex<HashSet<String>>,
    deals_synchronized: Mutex<HashSet<String>>,
    sync_ids: Mutex<SyncIdState>,
    should_synchronize: Mutex<Option<String>>,
    retry_interval_seconds: AtomicU64,
    retry_initial_seconds: u64,
    retry_max_seconds: u64,
    synchronized: Arc<AtomicBool>,
    closed: AtomicBool,
    // Handle back to the owning Arc so event callbacks can spawn
    // synchronization tasks.
    self_ref: Weak<ConnectionInner>,
    // Keep the listener allocations alive; the transport only holds weak
    // references to them.
    _state_listener: Arc<dyn SyncListener>,
    _health_listener: Arc<dyn SyncListener>,
}

/// A live connection to one account's terminal.
#[derive(Clone)]
pub struct TerminalConnection {
    inner: Arc<ConnectionInner>,
}

impl TerminalConnection {
    pub(crate) fn new(
        client: Arc<dyn TerminalClient>,
        account: Account,
        history_storage: Option<Arc<dyn HistoryStorage>>,
        registry: Weak<ConnectionRegistry>,
        history_start_time: Option<DateTime<Utc>>,
        options: &ClientOptions,
    ) -> Self {
        let terminal_state = TerminalState::new(options.status_timer_timeout());
        let history_storage: Arc<dyn HistoryStorage> =
            history_storage.unwrap_or_else(|| Arc::new(MemoryHistoryStorage::new()));
        let synchronized = Arc::new(AtomicBool::new(false));
        let subscriptions = Arc::new(RwLock::new(HashSet::new()));
        let health_monitor = ConnectionHealthMonitor::new(
            terminal_state.clone(),
            synchronized.clone(),
            subscriptions.clone(),
            options.health_sample_period(),
        );
        let state_listener: Arc<dyn SyncListener> = Arc::new(terminal_state.clone());
        let health_listener: Arc<dyn SyncListener> = Arc::new(health_monitor.clone());

        let inner = Arc::new_cyclic(|self_ref| ConnectionInner {
            client,
            account,
            history_start_time,
            terminal_state,
            history_storage,
            health_monitor,
            registry,
            subscriptions,
            orders_synchronized: Mutex::new(HashSet::new()),
            deals_synchronized: Mutex::new(HashSet::new()),
            sync_ids: Mutex::new(SyncIdState::default()),
            should_synchronize: Mutex::new(None),
            retry_interval_seconds: AtomicU64::new(
                options.synchronization_retry_interval_in_seconds.initial,
            ),
            retry_initial_seconds: options.synchronization_retry_interval_in_seconds.initial,
            retry_max_seconds: options.synchronization_retry_interval_in_seconds.max,
            synchronized,
            closed: AtomicBool::new(false),
            self_ref: self_ref.clone(),
            _state_listener: state_listener,
            _health_listener: health_listener,
        });

        let account_id = inner.account.id.clone();
        let inner_as_sync_listener: Arc<dyn SyncListener> = inner.clone();
        let engine_listener: Weak<dyn SyncListener> = Arc::downgrade(&inner_as_sync_listener);
        inner.client.add_listener(&account_id, engine_listener);
        inner
            .client
            .add_listener(&account_id, Arc::downgrade(&inner._state_listener));
        let storage_listener: Arc<dyn SyncListener> = inner.history_storage.clone();
        inner
            .client
            .add_listener(&account_id, Arc::downgrade(&storage_listener));
        inner
            .client
            .add_listener(&account_id, Arc::downgrade(&inner._health_listener));
        let inner_as_reconnect_listener: Arc<dyn ReconnectListener> = inner.clone();
        let reconnect_listener: Weak<dyn ReconnectListener> = Arc::downgrade(&inner_as_reconnect_listener);
        inner.client.add_reconnect_listener(reconnect_listener);

        Self { inner }
    }

    /// The account this connection serves.
    pub fn account(&self) -> &Account {
        &self.inner.account
    }

    /// The local terminal state mirror.
    pub fn terminal_state(&self) -> &TerminalState {
        &self.inner.terminal_state
    }

    /// The local history storage.
    pub fn history_storage(&self) -> &Arc<dyn HistoryStorage> {
        &self.inner.history_storage
    }

    /// The connection health monitor.
    pub fn health_monitor(&self) -> &ConnectionHealthMonitor {
        &self.inner.health_monitor
    }

    /// Whether `close` ran.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Whether the engine believes the last requested sync went through.
    pub fn synchronized(&self) -> bool {
        self.inner.synchronized.load(Ordering::Acquire)
    }

    /// Loads the history storage. Runs once during registry setup.
    pub async fn initialize(&self) -> Result<(), ApiError> {
        self.inner.history_storage.load().await
    }

    /// Subscribes to the account's event stream.
    ///
    /// A timeout is not a failure here: the server finishes subscription
    /// asynchronously and announces it with an `authenticated` event.
    pub async fn subscribe(&self) -> Result<(), ApiError> {
        match self.inner.client.subscribe(&self.inner.account.id).await {
            Err(error) if error.is_timeout() => {
                warn!(account_id = %self.inner.account.id, "Subscribe acknowledgement timed out");
                Ok(())
            }
            other => other,
        }
    }

    /// Requests a fresh synchronization pass from the history watermarks.
    pub async fn synchronize(&self) -> Result<(), ApiError> {
        self.inner.synchronize_once().await
    }

    /// Subscribes to streaming quotes for a symbol and re-applies the
    /// subscription after every reconnect.
    pub async fn subscribe_to_market_data(&self, symbol: &str) -> Result<(), ApiError> {
        self.inner.subscriptions.write().insert(symbol.to_string());
        self.inner
            .client
            .subscribe_to_market_data(&self.inner.account.id, symbol)
            .await
    }

    /// Symbols with live market-data subscriptions.
    pub fn subscribed_symbols(&self) -> Vec<String> {
        self.inner.subscriptions.read().iter().cloned().collect()
    }

    /// Whether the given synchronization pass fully finished (both the
    /// order and the deal leg).
    ///
    /// Without an explicit id, the most recent pass is checked, falling
    /// back to the last one before a disconnect.
    pub fn is_synchronized(&self, synchronization_id: Option<&str>) -> bool {
        self.inner.is_synchronized(synchronization_id)
    }

    /// Waits until synchronization completes, then runs the server-side
    /// handshake for the application pattern.
    pub async fn wait_synchronized(
        &self,
        options: Option<SynchronizationOptions>,
    ) -> Result<(), ApiError> {
        let options = options.unwrap_or_default();
        let interval = Duration::from_millis(options.interval_in_milliseconds);
        let deadline = Instant::now() + Duration::from_secs(options.timeout_in_seconds);

        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(ApiError::ConnectionClosed(format!(
                    "connection to account {} was closed",
                    self.inner.account.id
                )));
            }
            if self
                .inner
                .is_synchronized(options.synchronization_id.as_deref())
            {
                break;
            }
            if Instant::now() >= deadline {
                return Err(ApiError::Timeout(format!(
                    "timed out waiting for account {} to synchronize",
                    self.inner.account.id
                )));
            }
            sleep(interval).await;
        }

        let pattern = options.application_pattern.clone().unwrap_or_else(|| {
            if self.inner.account.application.as_deref() == Some("CopyFactory") {
                "CopyFactory.*|RPC".to_string()
            } else {
                "RPC".to_string()
            }
        });
        let remaining = deadline
            .saturating_duration_since(Instant::now())
            .as_secs()
            .max(1);
        self.inner
            .client
            .wait_synchronized(&self.inner.account.id, &pattern, remaining)
            .await
    }

    /// Closes the connection: unsubscribes, detaches every listener,
    /// fails in-flight requests, stops the health monitor and leaves the
    /// registry. The instance must not be used afterwards.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        *self.inner.should_synchronize.lock() = None;
        self.inner.synchronized.store(false, Ordering::Release);
        if let Err(error) = self.inner.client.unsubscribe(&self.inner.account.id).await {
            warn!(account_id = %self.inner.account.id, %error, "Unsubscribe on close failed");
        }
        self.inner
            .client
            .remove_account_listeners(&self.inner.account.id);
        self.inner
            .client
            .cancel_account_requests(&self.inner.account.id);
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.remove(&self.inner.account.id).await;
        }
        self.inner.health_monitor.stop();
        info!(account_id = %self.inner.account.id, "Connection closed");
    }

    /// Registers an application-side listener on this account's stream.
    pub fn add_listener(&self, listener: Weak<dyn SyncListener>) {
        self.inner
            .client
            .add_listener(&self.inner.account.id, listener);
    }

    /// Removes an application-side listener.
    pub fn remove_listener(&self, listener: &Weak<dyn SyncListener>) {
        self.inner
            .client
            .remove_listener(&self.inner.account.id, listener);
    }

    // ----- queries ---------------------------------------------------

    pub async fn get_account_information(&self) -> Result<AccountInformation, ApiError> {
        self.inner
            .client
            .get_account_information(&self.inner.account.id)
            .await
    }

    pub async fn get_positions(&self) -> Result<Vec<Position>, ApiError> {
        self.inner.client.get_positions(&self.inner.account.id).await
    }

    pub async fn get_position(&self, position_id: &str) -> Result<Position, ApiError> {
        self.inner
            .client
            .get_position(&self.inner.account.id, position_id)
            .await
    }

    pub async fn get_orders(&self) -> Result<Vec<Order>, ApiError> {
        self.inner.client.get_orders(&self.inner.account.id).await
    }

    pub async fn get_order(&self, order_id: &str) -> Result<Order, ApiError> {
        self.inner
            .client
            .get_order(&self.inner.account.id, order_id)
            .await
    }

    pub async fn get_history_orders_by_ticket(
        &self,
        ticket: &str,
    ) -> Result<HistoryOrdersResult, ApiError> {
        self.inner
            .client
            .get_history_orders_by_ticket(&self.inner.account.id, ticket)
            .await
    }

    pub async fn get_history_orders_by_position(
        &self,
        position_id: &str,
    ) -> Result<HistoryOrdersResult, ApiError> {
        self.inner
            .client
            .get_history_orders_by_position(&self.inner.account.id, position_id)
            .await
    }

    pub async fn get_history_orders_by_time_range(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<HistoryOrdersResult, ApiError> {
        self.inner
            .client
            .get_history_orders_by_time_range(
                &self.inner.account.id,
                start_time,
                end_time,
                offset,
                limit,
            )
            .await
    }

    pub async fn get_deals_by_ticket(&self, ticket: &str) -> Result<DealsResult, ApiError> {
        self.inner
            .client
            .get_deals_by_ticket(&self.inner.account.id, ticket)
            .await
    }

    pub async fn get_deals_by_position(
        &self,
        position_id: &str,
    ) -> Result<DealsResult, ApiError> {
        self.inner
            .client
            .get_deals_by_position(&self.inner.account.id, position_id)
            .await
    }

    pub async fn get_deals_by_time_range(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<DealsResult, ApiError> {
        self.inner
            .client
            .get_deals_by_time_range(&self.inner.account.id, start_time, end_time, offset, limit)
            .await
    }

    /// Clears local and server-side history for an application so it can
    /// synchronize from scratch.
    pub async fn remove_history(&self, application: Option<&str>) -> Result<(), ApiError> {
        self.inner.history_storage.reset().await;
        self.inner
            .client
            .remove_history(&self.inner.account.id, application)
            .await
    }

    /// Clears history and removes the application server-side.
    pub async fn remove_application(&self) -> Result<(), ApiError> {
        self.inner.history_storage.reset().await;
        self.inner
            .client
            .remove_application(&self.inner.account.id)
            .await
    }

    pub async fn get_symbol_specification(
        &self,
        symbol: &str,
    ) -> Result<SymbolSpecification, ApiError> {
        self.inner
            .client
            .get_symbol_specification(&self.inner.account.id, symbol)
            .await
    }

    pub async fn get_symbol_price(&self, symbol: &str) -> Result<SymbolPrice, ApiError> {
        self.inner
            .client
            .get_symbol_price(&self.inner.account.id, symbol)
            .await
    }

    /// Reports the health monitor's uptime ratios to the server.
    pub async fn save_uptime(&self, uptime: HashMap<String, f64>) -> Result<(), ApiError> {
        self.inner
            .client
            .save_uptime(&self.inner.account.id, uptime)
            .await
    }

    /// Asks the server to reconnect the remote terminal.
    pub async fn reconnect_terminal(&self) -> Result<(), ApiError> {
        self.inner
            .client
            .reconnect_terminal(&self.inner.account.id)
            .await
    }

    // ----- trading ---------------------------------------------------

    pub async fn create_market_buy_order(
        &self,
        symbol: &str,
        volume: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
        options: Option<MarketTradeOptions>,
    ) -> Result<TradeResponse, TradeError> {
        let mut request = TradeRequest::market_buy(symbol, volume).with_stops(stop_loss, take_profit);
        if let Some(options) = &options {
            options.apply_to(&mut request);
        }
        self.inner.client.trade(&self.inner.account.id, request).await
    }

    pub async fn create_market_sell_order(
        &self,
        symbol: &str,
        volume: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
        options: Option<MarketTradeOptions>,
    ) -> Result<TradeResponse, TradeError> {
        let mut request =
            TradeRequest::market_sell(symbol, volume).with_stops(stop_loss, take_profit);
        if let Some(options) = &options {
            options.apply_to(&mut request);
        }
        self.inner.client.trade(&self.inner.account.id, request).await
    }

    pub async fn create_limit_buy_order(
        &self,
        symbol: &str,
        volume: Decimal,
        open_price: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
        options: Option<PendingTradeOptions>,
    ) -> Result<TradeResponse, TradeError> {
        let mut request =
            TradeRequest::limit_buy(symbol, volume, open_price).with_stops(stop_loss, take_profit);
        if let Some(options) = &options {
            options.apply_to(&mut request);
        }
        self.inner.client.trade(&self.inner.account.id, request).await
    }

    pub async fn create_limit_sell_order(
        &self,
        symbol: &str,
        volume: Decimal,
        open_price: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
        options: Option<PendingTradeOptions>,
    ) -> Result<TradeResponse, TradeError> {
        let mut request =
            TradeRequest::limit_sell(symbol, volume, open_price).with_stops(stop_loss, take_profit);
        if let Some(options) = &options {
            options.apply_to(&mut request);
        }
        self.inner.client.trade(&self.inner.account.id, request).await
    }

    pub async fn create_stop_buy_order(
        &self,
        symbol: &str,
        volume: Decimal,
        open_price: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
        options: Option<PendingTradeOptions>,
    ) -> Result<TradeResponse, TradeError> {
        let mut request =
            TradeRequest::stop_buy(symbol, volume, open_price).with_stops(stop_loss, take_profit);
        if let Some(options) = &options {
            options.apply_to(&mut request);
        }
        self.inner.client.trade(&self.inner.account.id, request).await
    }

    pub async fn create_stop_sell_order(
        &self,
        symbol: &str,
        volume: Decimal,
        open_price: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
        options: Option<PendingTradeOptions>,
    ) -> Result<TradeResponse, TradeError> {
        let mut request =
            TradeRequest::stop_sell(symbol, volume, open_price).with_stops(stop_loss, take_profit);
        if let Some(options) = &options {
            options.apply_to(&mut request);
        }
        self.inner.client.trade(&self.inner.account.id, request).await
    }

    pub async fn create_stop_limit_buy_order(
        &self,
        symbol: &str,
        volume: Decimal,
        open_price: Decimal,
        stop_limit_price: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
        options: Option<PendingTradeOptions>,
    ) -> Result<TradeResponse, TradeError> {
        let mut request = TradeRequest::stop_limit_buy(symbol, volume, open_price, stop_limit_price)
            .with_stops(stop_loss, take_profit);
        if let Some(options) = &options {
            options.apply_to(&mut request);
        }
        self.inner.client.trade(&self.inner.account.id, request).await
    }

    pub async fn create_stop_limit_sell_order(
        &self,
        symbol: &str,
        volume: Decimal,
        open_price: Decimal,
        stop_limit_price: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
        options: Option<PendingTradeOptions>,
    ) -> Result<TradeResponse, TradeError> {
        let mut request =
            TradeRequest::stop_limit_sell(symbol, volume, open_price, stop_limit_price)
                .with_stops(stop_loss, take_profit);
        if let Some(options) = &options {
            options.apply_to(&mut request);
        }
        self.inner.client.trade(&self.inner.account.id, request).await
    }

    pub async fn modify_position(
        &self,
        position_id: &str,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<TradeResponse, TradeError> {
        let request = TradeRequest::position_modify(position_id, stop_loss, take_profit);
        self.inner.client.trade(&self.inner.account.id, request).await
    }

    pub async fn close_position_partially(
        &self,
        position_id: &str,
        volume: Decimal,
        options: Option<MarketTradeOptions>,
    ) -> Result<TradeResponse, TradeError> {
        let mut request = TradeRequest::position_partial(position_id, volume);
        if let Some(options) = &options {
            options.apply_to(&mut request);
        }
        self.inner.client.trade(&self.inner.account.id, request).await
    }

    pub async fn close_position(
        &self,
        position_id: &str,
        options: Option<MarketTradeOptions>,
    ) -> Result<TradeResponse, TradeError> {
        let mut request = TradeRequest::position_close(position_id);
        if let Some(options) = &options {
            options.apply_to(&mut request);
        }
        self.inner.client.trade(&self.inner.account.id, request).await
    }

    pub async fn close_by(
        &self,
        position_id: &str,
        opposite_position_id: &str,
        options: Option<MarketTradeOptions>,
    ) -> Result<TradeResponse, TradeError> {
        let mut request = TradeRequest::position_close_by(position_id, opposite_position_id);
        if let Some(options) = &options {
            options.apply_to(&mut request);
        }
        self.inner.client.trade(&self.inner.account.id, request).await
    }

    pub async fn close_positions_by_symbol(
        &self,
        symbol: &str,
        options: Option<MarketTradeOptions>,
    ) -> Result<TradeResponse, TradeError> {
        let mut request = TradeRequest::positions_close_symbol(symbol);
        if let Some(options) = &options {
            options.apply_to(&mut request);
        }
        self.inner.client.trade(&self.inner.account.id, request).await
    }

    pub async fn modify_order(
        &self,
        order_id: &str,
        open_price: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<TradeResponse, TradeError> {
        let request = TradeRequest::order_modify(order_id, open_price, stop_loss, take_profit);
        self.inner.client.trade(&self.inner.account.id, request).await
    }

    pub async fn cancel_order(&self, order_id: &str) -> Result<TradeResponse, TradeError> {
        let request = TradeRequest::order_cancel(order_id);
        self.inner.client.trade(&self.inner.account.id, request).await
    }
}

impl ConnectionInner {
    fn is_synchronized(&self, synchronization_id: Option<&str>) -> bool {
        let resolved = match synchronization_id {
            Some(id) => Some(id.to_string()),
            None => {
                let ids = self.sync_ids.lock();
                ids.last.clone().or_else(|| ids.last_disconnected.clone())
            }
        };
        let Some(id) = resolved else { return false };
        self.orders_synchronized.lock().contains(&id)
            && self.deals_synchronized.lock().contains(&id)
    }

    /// One synchronization request from the current history watermarks.
    async fn synchronize_once(&self) -> Result<(), ApiError> {
        let last_history_order_time = self.history_storage.last_history_order_time().await;
        let starting_history_order_time = match self.history_start_time {
            Some(start) if start > last_history_order_time => start,
            _ => last_history_order_time,
        };
        let last_deal_time = self.history_storage.last_deal_time().await;
        let starting_deal_time = match self.history_start_time {
            Some(start) if start > last_deal_time => start,
            _ => last_deal_time,
        };
        let synchronization_id = Uuid::new_v4().to_string();
        self.sync_ids.lock().last = Some(synchronization_id.clone());
        self.client
            .synchronize(
                &self.account.id,
                &synchronization_id,
                starting_history_order_time,
                starting_deal_time,
            )
            .await
    }

    async fn synchronize_with_subscriptions(&self) -> Result<(), ApiError> {
        self.synchronize_once().await?;
        let symbols: Vec<String> = self.subscriptions.read().iter().cloned().collect();
        for symbol in symbols {
            if let Err(error) = self
                .client
                .subscribe_to_market_data(&self.account.id, &symbol)
                .await
            {
                warn!(
                    account_id = %self.account.id,
                    symbol = %symbol,
                    %error,
                    "Failed to re-subscribe to market data"
                );
            }
        }
        Ok(())
    }

    /// Starts a fresh synchronization generation and returns its key.
    fn begin_synchronization(&self) -> String {
        let key = Uuid::new_v4().simple().to_string();
        *self.should_synchronize.lock() = Some(key.clone());
        self.retry_interval_seconds
            .store(self.retry_initial_seconds, Ordering::Release);
        self.synchronized.store(false, Ordering::Release);
        key
    }

    /// Drives one synchronization attempt and schedules a retry on
    /// failure.
    ///
    /// The attempt aborts silently when `key` is no longer the current
    /// generation or the connection closed; this is what makes queued
    /// retry timers harmless after `close()`.
    fn ensure_synchronized(self: Arc<Self>, key: String) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            if self.should_synchronize.lock().as_deref() != Some(key.as_str()) {
                return;
            }
            match self.synchronize_with_subscriptions().await {
                Ok(()) => {
                    self.synchronized.store(true, Ordering::Release);
                    self.retry_interval_seconds
                        .store(self.retry_initial_seconds, Ordering::Release);
                    info!(account_id = %self.account.id, "Terminal synchronization requested");
                }
                Err(error) => {
                    error!(account_id = %self.account.id, %error, "Failed to synchronize account");
                    let still_wanted = !self.closed.load(Ordering::Acquire)
                        && self.should_synchronize.lock().as_deref() == Some(key.as_str());
                    if still_wanted {
                        let delay = self.retry_interval_seconds.load(Ordering::Acquire);
                        self.retry_interval_seconds
                            .store((delay * 2).min(self.retry_max_seconds), Ordering::Release);
                        let inner = self.clone();
                        tokio::spawn(async move {
                            sleep(Duration::from_secs(delay)).await;
                            inner.ensure_synchronized(key).await;
                        });
                    }
                }
            }
        })
    }
}

#[async_trait]
impl SyncListener for ConnectionInner {
    async fn on_connected(&self) {
        let Some(inner) = self.self_ref.upgrade() else { return };
        let key = inner.begin_synchronization();
        tokio::spawn(inner.ensure_synchronized(key));
    }

    async fn on_disconnected(&self) {
        let mut ids = self.sync_ids.lock();
        ids.last_disconnected = ids.last.take();
        drop(ids);
        *self.should_synchronize.lock() = None;
        self.synchronized.store(false, Ordering::Release);
    }

    async fn on_order_synchronization_finished(&self, synchronization_id: String) {
        self.orders_synchronized.lock().insert(synchronization_id);
    }

    async fn on_deal_synchronization_finished(&self, synchronization_id: String) {
        self.deals_synchronized.lock().insert(synchronization_id);
        if let Err(error) = self.history_storage.update_storage().await {
            warn!(account_id = %self.account.id, %error, "History storage commit failed");
        }
    }

    async fn on_packet_gap_detected(&self, first_missing: u64, last_missing: u64) {
        warn!(
            account_id = %self.account.id,
            first_missing,
            last_missing,
            "Events lost, forcing a fresh synchronization"
        );
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let Some(inner) = self.self_ref.upgrade() else { return };
        let key = inner.begin_synchronization();
        tokio::spawn(inner.ensure_synchronized(key));
    }
}

#[async_trait]
impl ReconnectListener for ConnectionInner {
    async fn on_reconnected(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        match self.client.subscribe(&self.account.id).await {
            Ok(()) => {}
            Err(error) if error.is_timeout() => {}
            Err(error) => {
                warn!(account_id = %self.account.id, %error, "Re-subscribe after reconnect failed");
            }
        }
    }
}
