//! Typed request surface over the terminal gateway.
//!
//! `TerminalClient` is the seam between the synchronization engine and the
//! wire: the engine, registry and connection all talk to this trait, and
//! tests substitute a recording mock. `WsTerminalClient` is the production
//! implementation over the shared WebSocket transport.

use std::collections::HashMap;
use std::sync::Weak;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use termlink_common::{
    AccountInformation, ApiError, Deal, Order, Position, SymbolPrice, SymbolSpecification,
};
use termlink_wire::{ReconnectListener, SyncListener, WsTransport};

use crate::trade::{TradeError, TradeRequest, TradeResponse};

/// History orders query result.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryOrdersResult {
    /// Matching history order records.
    pub history_orders: Vec<Order>,
    /// Whether the account is still synchronizing; results may be partial.
    #[serde(default)]
    pub synchronizing: bool,
}

/// Deals query result.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealsResult {
    /// Matching deal records.
    pub deals: Vec<Deal>,
    /// Whether the account is still synchronizing; results may be partial.
    #[serde(default)]
    pub synchronizing: bool,
}

/// Typed request/response operations against the terminal gateway.
#[async_trait]
pub trait TerminalClient: Send + Sync {
    async fn get_account_information(&self, account_id: &str)
        -> Result<AccountInformation, ApiError>;

    async fn get_positions(&self, account_id: &str) -> Result<Vec<Position>, ApiError>;

    async fn get_position(&self, account_id: &str, position_id: &str)
        -> Result<Position, ApiError>;

    async fn get_orders(&self, account_id: &str) -> Result<Vec<Order>, ApiError>;

    async fn get_order(&self, account_id: &str, order_id: &str) -> Result<Order, ApiError>;

    async fn get_history_orders_by_ticket(
        &self,
        account_id: &str,
        ticket: &str,
    ) -> Result<HistoryOrdersResult, ApiError>;

    async fn get_history_orders_by_position(
        &self,
        account_id: &str,
        position_id: &str,
    ) -> Result<HistoryOrdersResult, ApiError>;

    async fn get_history_orders_by_time_range(
        &self,
        account_id: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<HistoryOrdersResult, ApiError>;

    async fn get_deals_by_ticket(
        &self,
        account_id: &str,
        ticket: &str,
    ) -> Result<DealsResult, ApiError>;

    async fn get_deals_by_position(
        &self,
        account_id: &str,
        position_id: &str,
    ) -> Result<DealsResult, ApiError>;

    async fn get_deals_by_time_range(
        &self,
        account_id: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<DealsResult, ApiError>;

    /// Clears server-side history for an application so it can
    /// re-synchronize from scratch.
    async fn remove_history(
        &self,
        account_id: &str,
        application: Option<&str>,
    ) -> Result<(), ApiError>;

    /// Clears server-side history and removes the application.
    async fn remove_application(&self, account_id: &str) -> Result<(), ApiError>;

    async fn get_symbol_specification(
        &self,
        account_id: &str,
        symbol: &str,
    ) -> Result<SymbolSpecification, ApiError>;

    async fn get_symbol_price(
        &self,
        account_id: &str,
        symbol: &str,
    ) -> Result<SymbolPrice, ApiError>;

    /// Reports client uptime ratios to the server.
    async fn save_uptime(
        &self,
        account_id: &str,
        uptime: HashMap<String, f64>,
    ) -> Result<(), ApiError>;

    /// Asks the terminal to start a synchronization pass from the given
    /// history watermarks.
    async fn synchronize(
        &self,
        account_id: &str,
        synchronization_id: &str,
        starting_history_order_time: DateTime<Utc>,
        starting_deal_time: DateTime<Utc>,
    ) -> Result<(), ApiError>;

    /// Subscribes to the account's event stream.
    async fn subscribe(&self, account_id: &str) -> Result<(), ApiError>;

    /// Unsubscribes from the account's event stream.
    async fn unsubscribe(&self, account_id: &str) -> Result<(), ApiError>;

    /// Subscribes to streaming quotes for a symbol.
    async fn subscribe_to_market_data(
        &self,
        account_id: &str,
        symbol: &str,
    ) -> Result<(), ApiError>;

    /// Asks the server to reconnect the remote terminal.
    async fn reconnect_terminal(&self, account_id: &str) -> Result<(), ApiError>;

    /// Server-side synchronization handshake: resolves once streams
    /// matching the application pattern report synchronized.
    async fn wait_synchronized(
        &self,
        account_id: &str,
        application_pattern: &str,
        timeout_in_seconds: u64,
    ) -> Result<(), ApiError>;

    /// Executes a trade. Never retried implicitly.
    async fn trade(
        &self,
        account_id: &str,
        request: TradeRequest,
    ) -> Result<TradeResponse, TradeError>;

    fn add_listener(&self, account_id: &str, listener: Weak<dyn SyncListener>);

    fn remove_listener(&self, account_id: &str, listener: &Weak<dyn SyncListener>);

    fn remove_account_listeners(&self, account_id: &str);

    fn add_reconnect_listener(&self, listener: Weak<dyn ReconnectListener>);

    /// Fails the account's in-flight requests with `ConnectionClosed`.
    fn cancel_account_requests(&self, account_id: &str);

    /// The application tag this client stamps onto requests.
    fn application(&self) -> &str;
}

/// Production `TerminalClient` over the shared WebSocket transport.
#[derive(Clone)]
pub struct WsTerminalClient {
    transport: WsTransport,
    application: String,
}

impl WsTerminalClient {
    /// Wraps a transport. `application` must match the transport's tag.
    pub fn new(transport: WsTransport, application: impl Into<String>) -> Self {
        Self {
            transport,
            application: application.into(),
        }
    }

    /// The underlying transport.
    pub fn transport(&self) -> &WsTransport {
        &self.transport
    }

    async fn request_field<T: DeserializeOwned>(
        &self,
        account_id: &str,
        payload: Value,
        field: &str,
    ) -> Result<T, ApiError> {
        let body = self.transport.request(account_id, payload).await?;
        extract_field(body, field)
    }

    async fn request_unit(&self, account_id: &str, payload: Value) -> Result<(), ApiError> {
        self.transport.request(account_id, payload).await?;
        Ok(())
    }
}

fn extract_field<T: DeserializeOwned>(mut body: Value, field: &str) -> Result<T, ApiError> {
    let value = body
        .get_mut(field)
        .map(Value::take)
        .ok_or_else(|| ApiError::Internal(format!("response is missing field {field}")))?;
    serde_json::from_value(value)
        .map_err(|error| ApiError::Internal(format!("malformed response field {field}: {error}")))
}

fn extract_result<T: DeserializeOwned>(body: Value) -> Result<T, ApiError> {
    serde_json::from_value(body)
        .map_err(|error| ApiError::Internal(format!("malformed response: {error}")))
}

#[async_trait]
impl TerminalClient for WsTerminalClient {
    async fn get_account_information(
        &self,
        account_id: &str,
    ) -> Result<AccountInformation, ApiError> {
        self.request_field(
            account_id,
            json!({"type": "getAccountInformation"}),
            "accountInformation",
        )
        .await
    }

    async fn get_positions(&self, account_id: &str) -> Result<Vec<Position>, ApiError> {
        self.request_field(account_id, json!({"type": "getPositions"}), "positions")
            .await
    }

    async fn get_position(
        &self,
        account_id: &str,
        position_id: &str,
    ) -> Result<Position, ApiError> {
        self.request_field(
            account_id,
            json!({"type": "getPosition", "positionId": position_id}),
            "position",
        )
        .await
    }

    async fn get_orders(&self, account_id: &str) -> Result<Vec<Order>, ApiError> {
        self.request_field(account_id, json!({"type": "getOrders"}), "orders")
            .await
    }

    async fn get_order(&self, account_id: &str, order_id: &str) -> Result<Order, ApiError> {
        self.request_field(
            account_id,
            json!({"type": "getOrder", "orderId": order_id}),
            "order",
        )
        .await
    }

    async fn get_history_orders_by_ticket(
        &self,
        account_id: &str,
        ticket: &str,
    ) -> Result<HistoryOrdersResult, ApiError> {
        let body = self
            .transport
            .request(
                account_id,
                json!({"type": "getHistoryOrdersByTicket", "ticket": ticket}),
            )
            .await?;
        extract_result(body)
    }

    async fn get_history_orders_by_position(
        &self,
        account_id: &str,
        position_id: &str,
    ) -> Result<HistoryOrdersResult, ApiError> {
        let body = self
            .transport
            .request(
                account_id,
                json!({"type": "getHistoryOrdersByPosition", "positionId": position_id}),
            )
            .await?;
        extract_result(body)
    }

    async fn get_history_orders_by_time_range(
        &self,
        account_id: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<HistoryOrdersResult, ApiError> {
        let body = self
            .transport
            .request(
                account_id,
                json!({
                    "type": "getHistoryOrdersByTimeRange",
                    "startTime": start_time,
                    "endTime": end_time,
                    "offset": offset,
                    "limit": limit,
                }),
            )
            .await?;
        extract_result(body)
    }

    async fn get_deals_by_ticket(
        &self,
        account_id: &str,
        ticket: &str,
    ) -> Result<DealsResult, ApiError> {
        let body = self
            .transport
            .request(account_id, json!({"type": "getDealsByTicket", "ticket": ticket}))
            .await?;
        extract_result(body)
    }

    async fn get_deals_by_position(
        &self,
        account_id: &str,
        position_id: &str,
    ) -> Result<DealsResult, ApiError> {
        let body = self
            .transport
            .request(
                account_id,
                json!({"type": "getDealsByPosition", "positionId": position_id}),
            )
            .await?;
        extract_result(body)
    }

    async fn get_deals_by_time_range(
        &self,
        account_id: &str,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<DealsResult, ApiError> {
        let body = self
            .transport
            .request(
                account_id,
                json!({
                    "type": "getDealsByTimeRange",
                    "startTime": start_time,
                    "endTime": end_time,
                    "offset": offset,
                    "limit": limit,
                }),
            )
            .await?;
        extract_result(body)
    }

    async fn remove_history(
        &self,
        account_id: &str,
        application: Option<&str>,
    ) -> Result<(), ApiError> {
        let mut payload = json!({"type": "removeHistory"});
        if let Some(application) = application {
            payload["application"] = Value::String(application.to_string());
        }
        self.request_unit(account_id, payload).await
    }

    async fn remove_application(&self, account_id: &str) -> Result<(), ApiError> {
        self.request_unit(account_id, json!({"type": "removeApplication"}))
            .await
    }

    async fn get_symbol_specification(
        &self,
        account_id: &str,
        symbol: &str,
    ) -> Result<SymbolSpecification, ApiError> {
        self.request_field(
            account_id,
            json!({"type": "getSymbolSpecification", "symbol": symbol}),
            "specification",
        )
        .await
    }

    async fn get_symbol_price(
        &self,
        account_id: &str,
        symbol: &str,
    ) -> Result<SymbolPrice, ApiError> {
        self.request_field(
            account_id,
            json!({"type": "getSymbolPrice", "symbol": symbol}),
            "price",
        )
        .await
    }

    async fn save_uptime(
        &self,
        account_id: &str,
        uptime: HashMap<String, f64>,
    ) -> Result<(), ApiError> {
        self.request_unit(account_id, json!({"type": "saveUptime", "uptime": uptime}))
            .await
    }

    async fn synchronize(
        &self,
        account_id: &str,
        synchronization_id: &str,
        starting_history_order_time: DateTime<Utc>,
        starting_deal_time: DateTime<Utc>,
    ) -> Result<(), ApiError> {
        debug!(
            account_id,
            synchronization_id, "Requesting terminal synchronization"
        );
        self.request_unit(
            account_id,
            json!({
                "type": "synchronize",
                "synchronizationId": synchronization_id,
                "startingHistoryOrderTime": starting_history_order_time,
                "startingDealTime": starting_deal_time,
            }),
        )
        .await
    }

    async fn subscribe(&self, account_id: &str) -> Result<(), ApiError> {
        self.request_unit(account_id, json!({"type": "subscribe"}))
            .await
    }

    async fn unsubscribe(&self, account_id: &str) -> Result<(), ApiError> {
        self.request_unit(account_id, json!({"type": "unsubscribe"}))
            .await
    }

    async fn subscribe_to_market_data(
        &self,
        account_id: &str,
        symbol: &str,
    ) -> Result<(), ApiError> {
        self.request_unit(
            account_id,
            json!({"type": "subscribeToMarketData", "symbol": symbol}),
        )
        .await
    }

    async fn reconnect_terminal(&self, account_id: &str) -> Result<(), ApiError> {
        self.request_unit(account_id, json!({"type": "reconnect"}))
            .await
    }

    async fn wait_synchronized(
        &self,
        account_id: &str,
        application_pattern: &str,
        timeout_in_seconds: u64,
    ) -> Result<(), ApiError> {
        self.request_unit(
            account_id,
            json!({
                "type": "waitSynchronized",
                "applicationPattern": application_pattern,
                "timeoutInSeconds": timeout_in_seconds,
            }),
        )
        .await
    }

    async fn trade(
        &self,
        account_id: &str,
        request: TradeRequest,
    ) -> Result<TradeResponse, TradeError> {
        request.validate()?;
        let trade = serde_json::to_value(&request)
            .map_err(|error| ApiError::Validation(format!("unserializable trade: {error}")))?;
        let body = self
            .transport
            .request(account_id, json!({"type": "trade", "trade": trade}))
            .await?;
        let response: TradeResponse = extract_field(body, "response")?;
        if response.is_success() {
            Ok(response)
        } else {
            Err(TradeError::from_response(response))
        }
    }

    fn add_listener(&self, account_id: &str, listener: Weak<dyn SyncListener>) {
        self.transport.add_listener(account_id, listener);
    }

    fn remove_listener(&self, account_id: &str, listener: &Weak<dyn SyncListener>) {
        self.transport.remove_listener(account_id, listener);
    }

    fn remove_account_listeners(&self, account_id: &str) {
        self.transport.remove_account_listeners(account_id);
    }

    fn add_reconnect_listener(&self, listener: Weak<dyn ReconnectListener>) {
        self.transport.add_reconnect_listener(listener);
    }

    fn cancel_account_requests(&self, account_id: &str) {
        self.transport.fail_account_requests(
            account_id,
            ApiError::ConnectionClosed("connection closed".to_string()),
        );
    }

    fn application(&self) -> &str {
        &self.application
    }
}
