//! Terminal data model.
//!
//! These types mirror the JSON the terminal gateway speaks: camelCase
//! field names, SCREAMING_SNAKE enum constants, RFC-3339 timestamps.
//! Unknown fields are tolerated on deserialization so server-side model
//! growth does not break older clients.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Direction of an open position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PositionType {
    #[serde(rename = "POSITION_TYPE_BUY")]
    Buy,
    #[serde(rename = "POSITION_TYPE_SELL")]
    Sell,
}

impl PositionType {
    /// Direction sign used in profit derivation: +1 for buy, -1 for sell.
    pub fn sign(&self) -> Decimal {
        match self {
            PositionType::Buy => Decimal::ONE,
            PositionType::Sell => -Decimal::ONE,
        }
    }
}

impl std::fmt::Display for PositionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionType::Buy => write!(f, "BUY"),
            PositionType::Sell => write!(f, "SELL"),
        }
    }
}

/// Kind of a pending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderType {
    #[serde(rename = "ORDER_TYPE_BUY_LIMIT")]
    BuyLimit,
    #[serde(rename = "ORDER_TYPE_SELL_LIMIT")]
    SellLimit,
    #[serde(rename = "ORDER_TYPE_BUY_STOP")]
    BuyStop,
    #[serde(rename = "ORDER_TYPE_SELL_STOP")]
    SellStop,
    #[serde(rename = "ORDER_TYPE_BUY_STOP_LIMIT")]
    BuyStopLimit,
    #[serde(rename = "ORDER_TYPE_SELL_STOP_LIMIT")]
    SellStopLimit,
}

impl OrderType {
    /// Whether this is a sell-side pending order.
    ///
    /// Sell-side orders track the bid, buy-side orders the ask.
    pub fn is_sell(&self) -> bool {
        matches!(
            self,
            OrderType::SellLimit | OrderType::SellStop | OrderType::SellStopLimit
        )
    }
}

/// Lifecycle state of a pending order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    #[serde(rename = "ORDER_STATE_STARTED")]
    Started,
    #[serde(rename = "ORDER_STATE_PLACED")]
    Placed,
    #[serde(rename = "ORDER_STATE_CANCELED")]
    Canceled,
    #[serde(rename = "ORDER_STATE_PARTIAL")]
    Partial,
    #[serde(rename = "ORDER_STATE_FILLED")]
    Filled,
    #[serde(rename = "ORDER_STATE_REJECTED")]
    Rejected,
    #[serde(rename = "ORDER_STATE_EXPIRED")]
    Expired,
}

/// Kind of a history deal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DealType {
    #[serde(rename = "DEAL_TYPE_BUY")]
    Buy,
    #[serde(rename = "DEAL_TYPE_SELL")]
    Sell,
    #[serde(rename = "DEAL_TYPE_BALANCE")]
    Balance,
}

/// Pending-order expiration policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpirationType {
    #[serde(rename = "ORDER_TIME_GTC")]
    GoodTillCancel,
    #[serde(rename = "ORDER_TIME_DAY")]
    Day,
    #[serde(rename = "ORDER_TIME_SPECIFIED")]
    Specified,
    #[serde(rename = "ORDER_TIME_SPECIFIED_DAY")]
    SpecifiedDay,
}

/// Order filling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillingMode {
    #[serde(rename = "ORDER_FILLING_FOK")]
    FillOrKill,
    #[serde(rename = "ORDER_FILLING_IOC")]
    ImmediateOrCancel,
    #[serde(rename = "ORDER_FILLING_RETURN")]
    Return,
}

/// Account margin calculation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarginMode {
    #[serde(rename = "ACCOUNT_MARGIN_MODE_EXCHANGE")]
    Exchange,
    #[serde(rename = "ACCOUNT_MARGIN_MODE_RETAIL_NETTING")]
    RetailNetting,
    #[serde(rename = "ACCOUNT_MARGIN_MODE_RETAIL_HEDGING")]
    RetailHedging,
}

/// Account information snapshot.
///
/// The derived fields (`equity`, `margin`, `free_margin`, `margin_level`)
/// are recomputed locally on price ticks and may be overridden wholesale
/// by server-provided values on a price packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountInformation {
    /// Broker display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker: Option<String>,
    /// Account deposit currency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    /// Broker server name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Trading platform identifier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Account holder name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Account login.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub login: Option<u64>,
    /// Account balance.
    pub balance: Decimal,
    /// Account equity (balance plus floating profit).
    pub equity: Decimal,
    /// Margin currently in use.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin: Option<Decimal>,
    /// Margin available for new trades.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub free_margin: Option<Decimal>,
    /// Margin level percentage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin_level: Option<Decimal>,
    /// Account leverage.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leverage: Option<u32>,
    /// Margin calculation mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin_mode: Option<MarginMode>,
    /// Whether trading is allowed on the account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_allowed: Option<bool>,
    /// Whether the account is connected in investor (read-only) mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub investor_mode: Option<bool>,
}

/// An open position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    /// Position id (ticket number).
    pub id: String,
    /// Symbol the position is held in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Position direction.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub position_type: Option<PositionType>,
    /// Position volume in lots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,
    /// Price the position was opened at.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_price: Option<Decimal>,
    /// Latest quoted price for the position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_price: Option<Decimal>,
    /// Tick value at the latest quote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_tick_value: Option<Decimal>,
    /// Stop loss price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    /// Take profit price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    /// Total position profit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit: Option<Decimal>,
    /// Profit of the unrealized part of the position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unrealized_profit: Option<Decimal>,
    /// Profit of the realized part of the position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realized_profit: Option<Decimal>,
    /// Accumulated swap.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap: Option<Decimal>,
    /// Accumulated commission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commission: Option<Decimal>,
    /// Time the position was opened.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Time of the last position change.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_time: Option<DateTime<Utc>>,
    /// Client-assigned magic number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magic: Option<i64>,
    /// Position comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Client correlation id echoed back by the terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Position opening reason reported by the terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Comment as originally submitted, before broker truncation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_comment: Option<String>,
}

/// A pending order, or a history order record when `done_time` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    /// Order id (ticket number).
    pub id: String,
    /// Symbol the order is placed in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Order kind.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub order_type: Option<OrderType>,
    /// Order lifecycle state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<OrderState>,
    /// Requested volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,
    /// Volume still unfilled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_volume: Option<Decimal>,
    /// Order trigger price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub open_price: Option<Decimal>,
    /// Latest quoted price for the order's symbol.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_price: Option<Decimal>,
    /// Limit price of a stop-limit order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_limit_price: Option<Decimal>,
    /// Stop loss price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    /// Take profit price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    /// Expiration policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_type: Option<ExpirationType>,
    /// Expiration time for `Specified`/`SpecifiedDay` policies.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<DateTime<Utc>>,
    /// Filling policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filling_mode: Option<FillingMode>,
    /// Time the order was placed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Completion time; set only on history records.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_time: Option<DateTime<Utc>>,
    /// Client-assigned magic number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magic: Option<i64>,
    /// Order comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Client correlation id echoed back by the terminal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    /// Position id this order belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_id: Option<String>,
}

/// A history deal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deal {
    /// Deal id (ticket number).
    pub id: String,
    /// Deal kind.
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub deal_type: Option<DealType>,
    /// Symbol the deal was executed in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    /// Executed volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,
    /// Execution price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Decimal>,
    /// Deal profit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit: Option<Decimal>,
    /// Commission charged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commission: Option<Decimal>,
    /// Swap charged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub swap: Option<Decimal>,
    /// Position the deal affected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_id: Option<String>,
    /// Order that produced the deal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    /// Client-assigned magic number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub magic: Option<i64>,
    /// Deal comment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Server-assigned completion time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_time: Option<DateTime<Utc>>,
}

/// Trading session schedule entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolSession {
    /// Session open time, broker timezone, "HH:MM:SS.SSS" format.
    pub from: String,
    /// Session close time, broker timezone, "HH:MM:SS.SSS" format.
    pub to: String,
}

/// Symbol specification.
///
/// An update replaces the prior value for the symbol in its entirety.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolSpecification {
    /// Symbol name.
    pub symbol: String,
    /// Minimal price change.
    pub tick_size: Decimal,
    /// Minimum order volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_volume: Option<Decimal>,
    /// Maximum order volume.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_volume: Option<Decimal>,
    /// Order volume step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_step: Option<Decimal>,
    /// Contract size.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_size: Option<Decimal>,
    /// Price digits after the decimal point.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digits: Option<u32>,
    /// Margin currency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub margin_currency: Option<String>,
    /// Initial margin per lot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_margin: Option<Decimal>,
    /// Hedged-position margin per lot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hedged_margin: Option<Decimal>,
    /// Quote session schedule, keyed by weekday.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote_sessions: Option<std::collections::HashMap<String, Vec<SymbolSession>>>,
    /// Trade session schedule, keyed by weekday.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trade_sessions: Option<std::collections::HashMap<String, Vec<SymbolSession>>>,
}

/// Latest quote for a symbol. Monotonically replaced, never merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolPrice {
    /// Symbol name.
    pub symbol: String,
    /// Bid price.
    pub bid: Decimal,
    /// Ask price.
    pub ask: Decimal,
    /// Tick value for a profitable position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub profit_tick_value: Option<Decimal>,
    /// Tick value for a losing position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss_tick_value: Option<Decimal>,
    /// Exchange rate from profit currency into account currency.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_currency_exchange_rate: Option<Decimal>,
    /// Quote time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<DateTime<Utc>>,
    /// Quote time in broker timezone, broker format.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broker_time: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_type_sign() {
        assert_eq!(PositionType::Buy.sign(), Decimal::ONE);
        assert_eq!(PositionType::Sell.sign(), -Decimal::ONE);
    }

    #[test]
    fn test_order_type_side() {
        assert!(OrderType::SellLimit.is_sell());
        assert!(OrderType::SellStopLimit.is_sell());
        assert!(!OrderType::BuyLimit.is_sell());
        assert!(!OrderType::BuyStop.is_sell());
    }

    #[test]
    fn test_position_deserializes_wire_shape() {
        let json = r#"{
            "id": "46214692",
            "type": "POSITION_TYPE_BUY",
            "symbol": "GBPUSD",
            "magic": 1000,
            "time": "2020-04-15T02:45:06.521Z",
            "openPrice": 1.26101,
            "currentPrice": 1.24883,
            "currentTickValue": 1,
            "volume": 0.07,
            "swap": 0,
            "profit": -85.25999999999966,
            "commission": -0.25,
            "stopLoss": 1.17721,
            "unrealizedProfit": -85.25999999999901,
            "realizedProfit": -6.536993168992922e-13
        }"#;
        let position: Position = serde_json::from_str(json).expect("position should parse");
        assert_eq!(position.id, "46214692");
        assert_eq!(position.position_type, Some(PositionType::Buy));
        assert_eq!(position.volume, Some(dec!(0.07)));
        assert_eq!(position.stop_loss, Some(dec!(1.17721)));
        assert_eq!(position.take_profit, None);
    }

    #[test]
    fn test_order_roundtrips_type_rename() {
        let order = Order {
            id: "1".to_string(),
            symbol: Some("EURUSD".to_string()),
            order_type: Some(OrderType::BuyLimit),
            state: Some(OrderState::Placed),
            volume: Some(dec!(0.1)),
            current_volume: Some(dec!(0.1)),
            open_price: Some(dec!(1.1)),
            current_price: None,
            stop_limit_price: None,
            stop_loss: None,
            take_profit: None,
            expiration_type: Some(ExpirationType::GoodTillCancel),
            expiration_time: None,
            filling_mode: None,
            time: None,
            done_time: None,
            magic: None,
            comment: None,
            client_id: None,
            position_id: None,
        };
        let json = serde_json::to_value(&order).expect("order should serialize");
        assert_eq!(json["type"], "ORDER_TYPE_BUY_LIMIT");
        assert_eq!(json["expirationType"], "ORDER_TIME_GTC");
        assert!(json.get("stopLoss").is_none());
        let back: Order = serde_json::from_value(json).expect("order should parse");
        assert_eq!(back, order);
    }

    #[test]
    fn test_account_information_accepts_numbers_and_strings() {
        let json = r#"{
            "broker": "True ECN Trading Ltd",
            "currency": "USD",
            "server": "ICMarketsSC-Demo",
            "balance": 7319.9,
            "equity": 7306.649913200001,
            "margin": 184.1,
            "freeMargin": 7120.22,
            "leverage": 100,
            "marginLevel": 3967.58283542,
            "marginMode": "ACCOUNT_MARGIN_MODE_RETAIL_HEDGING"
        }"#;
        let info: AccountInformation = serde_json::from_str(json).expect("info should parse");
        assert_eq!(info.balance, dec!(7319.9));
        assert_eq!(info.margin_mode, Some(MarginMode::RetailHedging));
        assert_eq!(info.leverage, Some(100));
    }

    #[test]
    fn test_symbol_price_optional_fields() {
        let json = r#"{"symbol": "EURUSD", "bid": 1.18, "ask": 1.19}"#;
        let price: SymbolPrice = serde_json::from_str(json).expect("price should parse");
        assert_eq!(price.bid, dec!(1.18));
        assert!(price.profit_tick_value.is_none());
        assert!(price.time.is_none());
    }
}
