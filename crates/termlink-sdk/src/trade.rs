//! Trade request construction and response mapping.
//!
//! Each trade action has a typed constructor so required fields cannot be
//! forgotten; optional trade options merge into the request through
//! explicit `apply_to` methods. Trade calls are never retried implicitly.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use termlink_common::{ApiError, ExpirationType, FillingMode};

/// Trade retcodes the server reports as success.
const SUCCESS_CODES: &[&str] = &[
    "ERR_NO_ERROR",
    "TRADE_RETCODE_PLACED",
    "TRADE_RETCODE_DONE",
    "TRADE_RETCODE_DONE_PARTIAL",
    "TRADE_RETCODE_NO_CHANGES",
];

/// Trade action kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TradeActionType {
    OrderTypeBuy,
    OrderTypeSell,
    OrderTypeBuyLimit,
    OrderTypeSellLimit,
    OrderTypeBuyStop,
    OrderTypeSellStop,
    OrderTypeBuyStopLimit,
    OrderTypeSellStopLimit,
    PositionModify,
    PositionPartial,
    PositionCloseId,
    PositionCloseBy,
    PositionsCloseSymbol,
    OrderModify,
    OrderCancel,
}

impl TradeActionType {
    /// Whether this action opens a market position.
    pub fn is_market(&self) -> bool {
        matches!(self, TradeActionType::OrderTypeBuy | TradeActionType::OrderTypeSell)
    }

    /// Whether this action places a pending order.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            TradeActionType::OrderTypeBuyLimit
                | TradeActionType::OrderTypeSellLimit
                | TradeActionType::OrderTypeBuyStop
                | TradeActionType::OrderTypeSellStop
                | TradeActionType::OrderTypeBuyStopLimit
                | TradeActionType::OrderTypeSellStopLimit
        )
    }
}

/// A fully specified trade request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeRequest {
    /// What the terminal should do.
    pub action_type: TradeActionType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub open_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_limit_price: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop_loss: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub take_profit: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub close_by_position_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub magic: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slippage: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filling_mode: Option<FillingMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_type: Option<ExpirationType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_time: Option<DateTime<Utc>>,
}

impl TradeRequest {
    fn empty(action_type: TradeActionType) -> Self {
        Self {
            action_type,
            symbol: None,
            volume: None,
            open_price: None,
            stop_limit_price: None,
            stop_loss: None,
            take_profit: None,
            position_id: None,
            close_by_position_id: None,
            order_id: None,
            comment: None,
            client_id: None,
            magic: None,
            slippage: None,
            filling_mode: None,
            expiration_type: None,
            expiration_time: None,
        }
    }

    /// Market buy.
    pub fn market_buy(symbol: impl Into<String>, volume: Decimal) -> Self {
        let mut request = Self::empty(TradeActionType::OrderTypeBuy);
        request.symbol = Some(symbol.into());
        request.volume = Some(volume);
        request
    }

    /// Market sell.
    pub fn market_sell(symbol: impl Into<String>, volume: Decimal) -> Self {
        let mut request = Self::empty(TradeActionType::OrderTypeSell);
        request.symbol = Some(symbol.into());
        request.volume = Some(volume);
        request
    }

    /// Pending limit buy at `open_price`.
    pub fn limit_buy(symbol: impl Into<String>, volume: Decimal, open_price: Decimal) -> Self {
        let mut request = Self::empty(TradeActionType::OrderTypeBuyLimit);
        request.symbol = Some(symbol.into());
        request.volume = Some(volume);
        request.open_price = Some(open_price);
        request
    }

    /// Pending limit sell at `open_price`.
    pub fn limit_sell(symbol: impl Into<String>, volume: Decimal, open_price: Decimal) -> Self {
        let mut request = Self::empty(TradeActionType::OrderTypeSellLimit);
        request.symbol = Some(symbol.into());
        request.volume = Some(volume);
        request.open_price = Some(open_price);
        request
    }

    /// Pending stop buy triggered at `open_price`.
    pub fn stop_buy(symbol: impl Into<String>, volume: Decimal, open_price: Decimal) -> Self {
        let mut request = Self::empty(TradeActionType::OrderTypeBuyStop);
        request.symbol = Some(symbol.into());
        request.volume = Some(volume);
        request.open_price = Some(open_price);
        request
    }

    /// Pending stop sell triggered at `open_price`.
    pub fn stop_sell(symbol: impl Into<String>, volume: Decimal, open_price: Decimal) -> Self {
        let mut request = Self::empty(TradeActionType::OrderTypeSellStop);
        request.symbol = Some(symbol.into());
        request.volume = Some(volume);
        request.open_price = Some(open_price);
        request
    }

    /// Stop-limit buy: stop at `open_price`, limit leg at `stop_limit_price`.
    pub fn stop_limit_buy(
        symbol: impl Into<String>,
        volume: Decimal,
        open_price: Decimal,
        stop_limit_price: Decimal,
    ) -> Self {
        let mut request = Self::empty(TradeActionType::OrderTypeBuyStopLimit);
        request.symbol = Some(symbol.into());
        request.volume = Some(volume);
        request.open_price = Some(open_price);
        request.stop_limit_price = Some(stop_limit_price);
        request
    }

    /// Stop-limit sell: stop at `open_price`, limit leg at `stop_limit_price`.
    pub fn stop_limit_sell(
        symbol: impl Into<String>,
        volume: Decimal,
        open_price: Decimal,
        stop_limit_price: Decimal,
    ) -> Self {
        let mut request = Self::empty(TradeActionType::OrderTypeSellStopLimit);
        request.symbol = Some(symbol.into());
        request.volume = Some(volume);
        request.open_price = Some(open_price);
        request.stop_limit_price = Some(stop_limit_price);
        request
    }

    /// Change stop loss / take profit on a position.
    pub fn position_modify(
        position_id: impl Into<String>,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Self {
        let mut request = Self::empty(TradeActionType::PositionModify);
        request.position_id = Some(position_id.into());
        request.stop_loss = stop_loss;
        request.take_profit = take_profit;
        request
    }

    /// Close part of a position.
    pub fn position_partial(position_id: impl Into<String>, volume: Decimal) -> Self {
        let mut request = Self::empty(TradeActionType::PositionPartial);
        request.position_id = Some(position_id.into());
        request.volume = Some(volume);
        request
    }

    /// Close a position fully.
    pub fn position_close(position_id: impl Into<String>) -> Self {
        let mut request = Self::empty(TradeActionType::PositionCloseId);
        request.position_id = Some(position_id.into());
        request
    }

    /// Close a position against an opposite one.
    pub fn position_close_by(
        position_id: impl Into<String>,
        opposite_position_id: impl Into<String>,
    ) -> Self {
        let mut request = Self::empty(TradeActionType::PositionCloseBy);
        request.position_id = Some(position_id.into());
        request.close_by_position_id = Some(opposite_position_id.into());
        request
    }

    /// Close every position in a symbol.
    pub fn positions_close_symbol(symbol: impl Into<String>) -> Self {
        let mut request = Self::empty(TradeActionType::PositionsCloseSymbol);
        request.symbol = Some(symbol.into());
        request
    }

    /// Move a pending order's prices.
    pub fn order_modify(
        order_id: impl Into<String>,
        open_price: Decimal,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Self {
        let mut request = Self::empty(TradeActionType::OrderModify);
        request.order_id = Some(order_id.into());
        request.open_price = Some(open_price);
        request.stop_loss = stop_loss;
        request.take_profit = take_profit;
        request
    }

    /// Cancel a pending order.
    pub fn order_cancel(order_id: impl Into<String>) -> Self {
        let mut request = Self::empty(TradeActionType::OrderCancel);
        request.order_id = Some(order_id.into());
        request
    }

    /// Attaches stop loss / take profit prices.
    pub fn with_stops(mut self, stop_loss: Option<Decimal>, take_profit: Option<Decimal>) -> Self {
        self.stop_loss = stop_loss;
        self.take_profit = take_profit;
        self
    }

    /// Checks the local preconditions for this action.
    pub fn validate(&self) -> Result<(), ApiError> {
        let missing = |field: &str| {
            Err(ApiError::Validation(format!(
                "{field} is required for {:?}",
                self.action_type
            )))
        };
        if self.action_type.is_market() || self.action_type.is_pending() {
            if self.symbol.is_none() {
                return missing("symbol");
            }
            if self.volume.is_none() {
                return missing("volume");
            }
        }
        if self.action_type.is_pending() && self.open_price.is_none() {
            return missing("openPrice");
        }
        match self.action_type {
            TradeActionType::OrderTypeBuyStopLimit | TradeActionType::OrderTypeSellStopLimit
                if self.stop_limit_price.is_none() =>
            {
                missing("stopLimitPrice")
            }
            TradeActionType::PositionModify
            | TradeActionType::PositionPartial
            | TradeActionType::PositionCloseId
            | TradeActionType::PositionCloseBy
                if self.position_id.is_none() =>
            {
                missing("positionId")
            }
            TradeActionType::PositionCloseBy if self.close_by_position_id.is_none() => {
                missing("closeByPositionId")
            }
            TradeActionType::PositionsCloseSymbol if self.symbol.is_none() => missing("symbol"),
            TradeActionType::OrderModify | TradeActionType::OrderCancel
                if self.order_id.is_none() =>
            {
                missing("orderId")
            }
            _ => Ok(()),
        }
    }
}

/// Options recognized on market and close actions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MarketTradeOptions {
    /// Free-text tag returned with the trade response.
    pub comment: Option<String>,
    /// Echoed in future events for client correlation.
    pub client_id: Option<String>,
    /// Overrides the connection-level magic number.
    pub magic: Option<i64>,
    /// Max allowed slippage in price points.
    pub slippage: Option<u32>,
    /// Filling policy.
    pub filling_mode: Option<FillingMode>,
}

impl MarketTradeOptions {
    /// Merges these options into a trade request.
    pub fn apply_to(&self, request: &mut TradeRequest) {
        request.comment.clone_from(&self.comment);
        request.client_id.clone_from(&self.client_id);
        request.magic = self.magic;
        request.slippage = self.slippage;
        request.filling_mode = self.filling_mode;
    }
}

/// Options recognized on pending-order actions.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PendingTradeOptions {
    /// Free-text tag returned with the trade response.
    pub comment: Option<String>,
    /// Echoed in future events for client correlation.
    pub client_id: Option<String>,
    /// Overrides the connection-level magic number.
    pub magic: Option<i64>,
    /// Expiration policy.
    pub expiration_type: Option<ExpirationType>,
    /// Expiration time for `Specified`/`SpecifiedDay` policies.
    pub expiration_time: Option<DateTime<Utc>>,
}

impl PendingTradeOptions {
    /// Merges these options into a trade request.
    pub fn apply_to(&self, request: &mut TradeRequest) {
        request.comment.clone_from(&self.comment);
        request.client_id.clone_from(&self.client_id);
        request.magic = self.magic;
        request.expiration_type = self.expiration_type;
        request.expiration_time = self.expiration_time;
    }
}

/// Server response to a trade request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeResponse {
    /// Numeric trade retcode.
    pub numeric_code: i64,
    /// Symbolic trade retcode.
    pub string_code: String,
    /// Human-readable result description.
    pub message: String,
    /// Id of the order created or affected, if any.
    #[serde(default)]
    pub order_id: Option<String>,
    /// Id of the position created or affected, if any.
    #[serde(default)]
    pub position_id: Option<String>,
}

impl TradeResponse {
    /// Whether the retcode is one of the success codes.
    pub fn is_success(&self) -> bool {
        SUCCESS_CODES.contains(&self.string_code.as_str())
    }
}

/// Errors from trade calls.
#[derive(Debug, Error)]
pub enum TradeError {
    /// The server answered with a failure retcode.
    #[error("Trade rejected with code {numeric_code} ({string_code}): {message}")]
    Rejected {
        numeric_code: i64,
        string_code: String,
        message: String,
    },

    /// The request itself failed before a trade retcode was produced.
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl TradeError {
    /// Builds the rejection from a failed trade response.
    pub fn from_response(response: TradeResponse) -> Self {
        TradeError::Rejected {
            numeric_code: response.numeric_code,
            string_code: response.string_code,
            message: response.message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_market_buy_serializes_required_fields_only() {
        let request = TradeRequest::market_buy("EURUSD", dec!(0.1));
        let json = serde_json::to_value(&request).expect("request should serialize");
        assert_eq!(json["actionType"], "ORDER_TYPE_BUY");
        assert_eq!(json["symbol"], "EURUSD");
        assert!(json.get("openPrice").is_none());
        assert!(json.get("comment").is_none());
    }

    #[test]
    fn test_stop_limit_carries_both_prices() {
        let request =
            TradeRequest::stop_limit_sell("GBPUSD", dec!(0.5), dec!(1.3), dec!(1.29));
        let json = serde_json::to_value(&request).expect("request should serialize");
        assert_eq!(json["actionType"], "ORDER_TYPE_SELL_STOP_LIMIT");
        assert_eq!(json["openPrice"], "1.3");
        assert_eq!(json["stopLimitPrice"], "1.29");
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_market_options_apply() {
        let mut request = TradeRequest::market_buy("EURUSD", dec!(0.1));
        let options = MarketTradeOptions {
            comment: Some("scalp".to_string()),
            client_id: Some("TE_EURUSD_7h".to_string()),
            magic: Some(42),
            slippage: Some(3),
            filling_mode: Some(FillingMode::ImmediateOrCancel),
        };
        options.apply_to(&mut request);
        assert_eq!(request.comment.as_deref(), Some("scalp"));
        assert_eq!(request.magic, Some(42));
        assert_eq!(request.slippage, Some(3));
        assert_eq!(request.filling_mode, Some(FillingMode::ImmediateOrCancel));
    }

    #[test]
    fn test_pending_options_apply() {
        let mut request = TradeRequest::limit_buy("EURUSD", dec!(0.1), dec!(1.0));
        let options = PendingTradeOptions {
            expiration_type: Some(ExpirationType::Day),
            ..Default::default()
        };
        options.apply_to(&mut request);
        assert_eq!(request.expiration_type, Some(ExpirationType::Day));
        assert!(request.slippage.is_none());
    }

    #[test]
    fn test_validate_flags_missing_fields() {
        let mut request = TradeRequest::market_buy("EURUSD", dec!(0.1));
        request.volume = None;
        assert!(matches!(request.validate(), Err(ApiError::Validation(_))));

        let mut request = TradeRequest::limit_buy("EURUSD", dec!(0.1), dec!(1.0));
        request.open_price = None;
        assert!(matches!(request.validate(), Err(ApiError::Validation(_))));

        let mut request = TradeRequest::position_close_by("1", "2");
        request.close_by_position_id = None;
        assert!(matches!(request.validate(), Err(ApiError::Validation(_))));
    }

    #[test]
    fn test_trade_response_success_codes() {
        let mut response = TradeResponse {
            numeric_code: 10009,
            string_code: "TRADE_RETCODE_DONE".to_string(),
            message: "done".to_string(),
            order_id: Some("46870472".to_string()),
            position_id: None,
        };
        assert!(response.is_success());
        response.string_code = "TRADE_RETCODE_INVALID_PRICE".to_string();
        assert!(!response.is_success());
    }

    #[test]
    fn test_trade_error_carries_all_codes() {
        let error = TradeError::from_response(TradeResponse {
            numeric_code: 10016,
            string_code: "TRADE_RETCODE_INVALID_STOPS".to_string(),
            message: "Invalid stops".to_string(),
            order_id: None,
            position_id: None,
        });
        match error {
            TradeError::Rejected {
                numeric_code,
                string_code,
                message,
            } => {
                assert_eq!(numeric_code, 10016);
                assert_eq!(string_code, "TRADE_RETCODE_INVALID_STOPS");
                assert_eq!(message, "Invalid stops");
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }
}
