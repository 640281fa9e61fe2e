//! Shared WebSocket transport to the terminal gateway.
//!
//! One transport serves every account connection on a host. It owns the
//! socket lifecycle (connect, ping keepalive, reconnect with exponential
//! backoff), correlates request/response frames, and fans decoded events
//! out to per-account listeners through the packet orderer.
//!
//! The transport does NOT replay events missed while the socket was down;
//! reconnect listeners are told to re-subscribe and re-synchronize.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{interval, sleep, timeout, timeout_at};
use tokio_tungstenite::{
    connect_async,
    tungstenite::{protocol::Message, Error as WsError},
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use termlink_common::ApiError;

use crate::listener::{ReconnectListener, SyncListener};
use crate::orderer::PacketOrderer;
use crate::protocol::{classify, response_error, stamp_request, EventPacket, EventPayload, InboundFrame};

/// Outbound message channel depth per session.
const OUTBOUND_BUFFER: usize = 256;

/// Errors internal to the socket session loop.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("WebSocket connection failed: {0}")]
    Connection(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] WsError),

    #[error("Connection timeout")]
    Timeout,

    #[error("Stream ended unexpectedly")]
    StreamEnded,

    #[error("Outbound channel closed")]
    ChannelClosed,
}

/// Configuration for the transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Gateway WebSocket URL.
    pub url: String,
    /// Auth token appended to the connect URL, if any.
    pub token: Option<String>,
    /// Application tag stamped onto every request.
    pub application: String,
    /// Deadline for a request/response round trip.
    pub request_timeout: Duration,
    /// Deadline for the initial socket connect.
    pub connect_timeout: Duration,
    /// How long the packet orderer waits on a sequence gap.
    pub packet_ordering_timeout: Duration,
    /// Ping keepalive interval.
    pub ping_interval: Duration,
    /// First reconnect delay; doubles per attempt.
    pub initial_reconnect_delay: Duration,
    /// Reconnect delay cap.
    pub max_reconnect_delay: Duration,
    /// How often expired sequence gaps are swept.
    pub gap_check_interval: Duration,
}

impl TransportConfig {
    /// Creates a config for the given gateway URL with default timings.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            application: "MetaApi".to_string(),
            request_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(60),
            packet_ordering_timeout: Duration::from_secs(60),
            ping_interval: Duration::from_secs(30),
            initial_reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            gap_check_interval: Duration::from_secs(5),
        }
    }

    fn connect_url(&self) -> String {
        match &self.token {
            Some(token) => format!("{}?auth-token={}", self.url, token),
            None => self.url.clone(),
        }
    }
}

struct PendingRequest {
    account_id: String,
    response_tx: oneshot::Sender<Result<Value, ApiError>>,
}

struct TransportShared {
    config: TransportConfig,
    pending: DashMap<String, PendingRequest>,
    listeners: DashMap<String, Vec<Weak<dyn SyncListener>>>,
    reconnect_listeners: parking_lot::Mutex<Vec<Weak<dyn ReconnectListener>>>,
    orderer: PacketOrderer,
    connected_tx: watch::Sender<bool>,
    outbound: parking_lot::Mutex<Option<mpsc::Sender<Message>>>,
    shutdown_tx: broadcast::Sender<()>,
    started: AtomicBool,
    closed: AtomicBool,
}

/// The shared terminal-gateway channel.
///
/// Cheap to clone; all clones share one socket.
#[derive(Clone)]
pub struct WsTransport {
    shared: Arc<TransportShared>,
}

impl WsTransport {
    /// Creates a transport. The socket is not opened until [`start`].
    ///
    /// [`start`]: WsTransport::start
    pub fn new(config: TransportConfig) -> Self {
        let (connected_tx, _) = watch::channel(false);
        let (shutdown_tx, _) = broadcast::channel(16);
        let orderer = PacketOrderer::new(config.packet_ordering_timeout);
        Self {
            shared: Arc::new(TransportShared {
                config,
                pending: DashMap::new(),
                listeners: DashMap::new(),
                reconnect_listeners: parking_lot::Mutex::new(Vec::new()),
                orderer,
                connected_tx,
                outbound: parking_lot::Mutex::new(None),
                shutdown_tx,
                started: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Spawns the connection loop. Idempotent.
    pub fn start(&self) {
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return;
        }
        let shared = self.shared.clone();
        tokio::spawn(async move {
            run_connection_loop(shared).await;
        });
    }

    /// Whether the socket is currently up.
    pub fn is_connected(&self) -> bool {
        *self.shared.connected_tx.borrow()
    }

    /// Shuts the transport down and fails every in-flight request.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shared.shutdown_tx.send(());
        self.shared.connected_tx.send_replace(false);
        *self.shared.outbound.lock() = None;
        let request_ids: Vec<String> = self
            .shared
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for request_id in request_ids {
            if let Some((_, pending)) = self.shared.pending.remove(&request_id) {
                let _ = pending
                    .response_tx
                    .send(Err(ApiError::ConnectionClosed("transport closed".to_string())));
            }
        }
        info!("Transport closed");
    }

    /// Sends a request for an account and awaits the matching response.
    ///
    /// Fails with `Timeout` when the deadline expires while connected and
    /// with `NotConnected` when the channel is down at the deadline.
    pub async fn request(&self, account_id: &str, payload: Value) -> Result<Value, ApiError> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(ApiError::ConnectionClosed("transport closed".to_string()));
        }
        let deadline = tokio::time::Instant::now() + self.shared.config.request_timeout;

        // Wait out a down channel until the deadline; the server cannot
        // receive anything we write before the socket is up.
        let mut connected_rx = self.shared.connected_tx.subscribe();
        while !*connected_rx.borrow() {
            match timeout_at(deadline, connected_rx.changed()).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    return Err(ApiError::ConnectionClosed("transport closed".to_string()))
                }
                Err(_) => {
                    return Err(ApiError::NotConnected(format!(
                        "channel down while requesting for account {account_id}"
                    )))
                }
            }
        }

        let request_id = Uuid::new_v4().to_string();
        let (response_tx, response_rx) = oneshot::channel();
        self.shared.pending.insert(
            request_id.clone(),
            PendingRequest {
                account_id: account_id.to_string(),
                response_tx,
            },
        );
        let frame = stamp_request(
            payload,
            account_id,
            &request_id,
            &self.shared.config.application,
        );

        let sender = self.shared.outbound.lock().clone();
        let sent = match sender {
            Some(sender) => sender.send(Message::Text(frame.to_string())).await.is_ok(),
            None => false,
        };
        if !sent {
            self.shared.pending.remove(&request_id);
            return Err(ApiError::NotConnected(format!(
                "channel went down while sending request for account {account_id}"
            )));
        }

        match timeout_at(deadline, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ApiError::ConnectionClosed(
                "connection closed while awaiting response".to_string(),
            )),
            Err(_) => {
                self.shared.pending.remove(&request_id);
                if self.is_connected() {
                    Err(ApiError::Timeout(format!(
                        "no response within {:?} for account {account_id}",
                        self.shared.config.request_timeout
                    )))
                } else {
                    Err(ApiError::NotConnected(format!(
                        "channel down while awaiting response for account {account_id}"
                    )))
                }
            }
        }
    }

    /// Registers an event listener for an account.
    ///
    /// Only a weak reference is held; a dropped listener is pruned on the
    /// next dispatch.
    pub fn add_listener(&self, account_id: &str, listener: Weak<dyn SyncListener>) {
        self.shared
            .listeners
            .entry(account_id.to_string())
            .or_default()
            .push(listener);
    }

    /// Removes one listener for an account by identity.
    pub fn remove_listener(&self, account_id: &str, listener: &Weak<dyn SyncListener>) {
        if let Some(mut entry) = self.shared.listeners.get_mut(account_id) {
            entry.retain(|candidate| !candidate.ptr_eq(listener));
        }
    }

    /// Drops every listener and the ordering stream for an account.
    pub fn remove_account_listeners(&self, account_id: &str) {
        self.shared.listeners.remove(account_id);
        self.shared.orderer.drop_stream(account_id);
    }

    /// Registers a reconnect listener.
    pub fn add_reconnect_listener(&self, listener: Weak<dyn ReconnectListener>) {
        self.shared.reconnect_listeners.lock().push(listener);
    }

    /// Fails every in-flight request for one account.
    ///
    /// Used by the connection close path so callers are not left waiting
    /// out their full deadlines.
    pub fn fail_account_requests(&self, account_id: &str, error: ApiError) {
        let request_ids: Vec<String> = self
            .shared
            .pending
            .iter()
            .filter(|entry| entry.value().account_id == account_id)
            .map(|entry| entry.key().clone())
            .collect();
        for request_id in request_ids {
            if let Some((_, pending)) = self.shared.pending.remove(&request_id) {
                let _ = pending.response_tx.send(Err(error.clone()));
            }
        }
    }
}

async fn run_connection_loop(shared: Arc<TransportShared>) {
    let mut shutdown_rx = shared.shutdown_tx.subscribe();
    let mut reconnect_delay = shared.config.initial_reconnect_delay;
    let mut first_session = true;

    loop {
        if shared.closed.load(Ordering::Acquire) {
            return;
        }
        match run_session(&shared, &mut shutdown_rx, &mut first_session).await {
            Ok(()) => {
                info!("Transport connection loop: clean shutdown");
                mark_disconnected(&shared).await;
                return;
            }
            Err(error) => {
                warn!(%error, delay = ?reconnect_delay, "Gateway session ended, reconnecting");
            }
        }
        mark_disconnected(&shared).await;

        tokio::select! {
            _ = sleep(reconnect_delay) => {}
            _ = shutdown_rx.recv() => {
                info!("Transport connection loop: shutdown during reconnect");
                return;
            }
        }
        reconnect_delay = (reconnect_delay * 2).min(shared.config.max_reconnect_delay);
    }
}

async fn run_session(
    shared: &Arc<TransportShared>,
    shutdown_rx: &mut broadcast::Receiver<()>,
    first_session: &mut bool,
) -> Result<(), TransportError> {
    info!(url = %shared.config.url, "Connecting to terminal gateway");
    let connect_result = timeout(
        shared.config.connect_timeout,
        connect_async(shared.config.connect_url()),
    )
    .await;
    let (ws_stream, _) = match connect_result {
        Ok(Ok(pair)) => pair,
        Ok(Err(error)) => return Err(TransportError::Connection(error.to_string())),
        Err(_) => return Err(TransportError::Timeout),
    };
    info!("Connected to terminal gateway");

    let (mut write, mut read) = ws_stream.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(OUTBOUND_BUFFER);
    *shared.outbound.lock() = Some(outbound_tx);
    shared.connected_tx.send_replace(true);

    let was_reconnect = !*first_session;
    *first_session = false;
    if was_reconnect {
        // Off the session task: reconnect listeners issue requests whose
        // responses this loop must stay free to read.
        let shared = shared.clone();
        tokio::spawn(async move {
            dispatch_reconnected(&shared).await;
        });
    }

    let mut ping_timer = interval(shared.config.ping_interval);
    let mut gap_timer = interval(shared.config.gap_check_interval);

    loop {
        tokio::select! {
            message = read.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => handle_frame(shared, &text).await,
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) => return Err(TransportError::StreamEnded),
                    Some(Err(error)) => return Err(TransportError::WebSocket(error)),
                    None => return Err(TransportError::StreamEnded),
                    _ => {}
                }
            }
            outbound = outbound_rx.recv() => {
                match outbound {
                    Some(message) => write.send(message).await?,
                    None => return Err(TransportError::ChannelClosed),
                }
            }
            _ = ping_timer.tick() => {
                write.send(Message::Ping(Vec::new())).await?;
            }
            _ = gap_timer.tick() => {
                sweep_gaps(shared).await;
            }
            _ = shutdown_rx.recv() => {
                let _ = write.send(Message::Close(None)).await;
                return Ok(());
            }
        }
    }
}

/// Marks the channel down and tells every account's listeners.
async fn mark_disconnected(shared: &Arc<TransportShared>) {
    let was_connected = *shared.connected_tx.borrow();
    shared.connected_tx.send_replace(false);
    *shared.outbound.lock() = None;
    if !was_connected {
        return;
    }
    let account_ids: Vec<String> = shared
        .listeners
        .iter()
        .map(|entry| entry.key().clone())
        .collect();
    for account_id in account_ids {
        for listener in active_listeners(shared, &account_id) {
            listener.on_disconnected().await;
        }
    }
}

async fn dispatch_reconnected(shared: &Arc<TransportShared>) {
    let listeners: Vec<Arc<dyn ReconnectListener>> = {
        let mut registered = shared.reconnect_listeners.lock();
        registered.retain(|candidate| candidate.strong_count() > 0);
        registered.iter().filter_map(Weak::upgrade).collect()
    };
    for listener in listeners {
        listener.on_reconnected().await;
    }
}

async fn handle_frame(shared: &Arc<TransportShared>, text: &str) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(error) => {
            warn!(%error, "Dropping malformed frame");
            return;
        }
    };
    match classify(value) {
        Ok(InboundFrame::Response { request_id, body }) => {
            match shared.pending.remove(&request_id) {
                Some((_, pending)) => {
                    let result = match response_error(&body) {
                        Some(error) => Err(error),
                        None => Ok(body),
                    };
                    let _ = pending.response_tx.send(result);
                }
                None => warn!(%request_id, "Dropping response with unknown correlation id"),
            }
        }
        Ok(InboundFrame::Event(packet)) => {
            debug!(account_id = %packet.account_id, sequence = ?packet.sequence_number, "Event packet");
            for released in shared.orderer.restore_order(packet) {
                dispatch_event(shared, released).await;
            }
        }
        Err(error) => warn!(%error, "Dropping undecodable frame"),
    }
}

/// Snapshots the live listeners for an account, pruning dead ones.
fn active_listeners(shared: &Arc<TransportShared>, account_id: &str) -> Vec<Arc<dyn SyncListener>> {
    match shared.listeners.get_mut(account_id) {
        Some(mut entry) => {
            entry.retain(|candidate| candidate.strong_count() > 0);
            entry.iter().filter_map(Weak::upgrade).collect()
        }
        None => Vec::new(),
    }
}

async fn sweep_gaps(shared: &Arc<TransportShared>) {
    for (gap, released) in shared.orderer.check_gaps() {
        warn!(
            account_id = %gap.account_id,
            first_missing = gap.first_missing,
            last_missing = gap.last_missing,
            "Sequence gap timed out, skipping ahead"
        );
        for listener in active_listeners(shared, &gap.account_id) {
            listener
                .on_packet_gap_detected(gap.first_missing, gap.last_missing)
                .await;
        }
        for packet in released {
            dispatch_event(shared, packet).await;
        }
    }
}

async fn dispatch_event(shared: &Arc<TransportShared>, packet: EventPacket) {
    let listeners = active_listeners(shared, &packet.account_id);
    if listeners.is_empty() {
        return;
    }
    match packet.payload {
        EventPayload::Authenticated {} => {
            for listener in &listeners {
                listener.on_connected().await;
            }
        }
        EventPayload::Disconnected {} => {
            for listener in &listeners {
                listener.on_disconnected().await;
            }
        }
        EventPayload::AccountInformation {
            account_information,
        } => {
            if let Some(information) = account_information {
                for listener in &listeners {
                    listener
                        .on_account_information_updated(information.clone())
                        .await;
                }
            }
        }
        EventPayload::Positions { positions } => {
            for listener in &listeners {
                listener.on_positions_replaced(positions.clone()).await;
            }
        }
        EventPayload::Orders { orders } => {
            for listener in &listeners {
                listener.on_orders_replaced(orders.clone()).await;
            }
        }
        EventPayload::Update { position, order } => {
            if let Some(position) = position {
                for listener in &listeners {
                    listener.on_position_updated(position.clone()).await;
                }
            }
            if let Some(order) = order {
                for listener in &listeners {
                    listener.on_order_updated(order.clone()).await;
                }
            }
        }
        EventPayload::PositionRemoved { position_id } => {
            for listener in &listeners {
                listener.on_position_removed(position_id.clone()).await;
            }
        }
        EventPayload::OrderCompleted { order_id } => {
            for listener in &listeners {
                listener.on_order_completed(order_id.clone()).await;
            }
        }
        EventPayload::Deals { deals } => {
            for deal in deals {
                for listener in &listeners {
                    listener.on_deal_added(deal.clone()).await;
                }
            }
        }
        EventPayload::HistoryOrders { history_orders } => {
            for order in history_orders {
                for listener in &listeners {
                    listener.on_history_order_added(order.clone()).await;
                }
            }
        }
        EventPayload::SymbolSpecifications { specifications } => {
            for specification in specifications {
                for listener in &listeners {
                    listener
                        .on_symbol_specification_updated(specification.clone())
                        .await;
                }
            }
        }
        EventPayload::Prices {
            prices,
            equity,
            margin,
            free_margin,
            margin_level,
        } => {
            for listener in &listeners {
                listener
                    .on_symbol_prices_updated(prices.clone(), equity, margin, free_margin, margin_level)
                    .await;
            }
        }
        EventPayload::SynchronizationStarted { synchronization_id } => {
            for listener in &listeners {
                listener
                    .on_synchronization_started(synchronization_id.clone())
                    .await;
            }
        }
        EventPayload::OrderSynchronizationFinished { synchronization_id } => {
            for listener in &listeners {
                listener
                    .on_order_synchronization_finished(synchronization_id.clone())
                    .await;
            }
        }
        EventPayload::DealSynchronizationFinished { synchronization_id } => {
            for listener in &listeners {
                listener
                    .on_deal_synchronization_finished(synchronization_id.clone())
                    .await;
            }
        }
        EventPayload::Status { connected } => {
            for listener in &listeners {
                listener.on_broker_connection_status_changed(connected).await;
            }
        }
        EventPayload::ServerHealthStatus { health_status } => {
            for listener in &listeners {
                listener.on_server_health_status(health_status.clone()).await;
            }
        }
    }
}
