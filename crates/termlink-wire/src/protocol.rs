//! JSON frame classification and typed event payloads.
//!
//! Every frame on the socket is a JSON object. Frames carrying a
//! `requestId` are responses to client requests; everything else is a
//! server event tagged by `type`. Unknown event types and malformed
//! frames are reported as errors so the transport can log and drop them.

use serde::Deserialize;
use serde_json::Value;

use rust_decimal::Decimal;
use termlink_common::{
    AccountInformation, ApiError, Deal, Order, Position, SymbolPrice, SymbolSpecification,
};

/// A decoded inbound frame.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    /// Response to a client request, matched by correlation id.
    Response { request_id: String, body: Value },
    /// Server event for one account's stream.
    Event(EventPacket),
}

/// A server event with its delivery envelope.
#[derive(Debug, Clone)]
pub struct EventPacket {
    /// Account whose stream this event belongs to.
    pub account_id: String,
    /// Per-account monotonic sequence number, when the server assigns one.
    pub sequence_number: Option<u64>,
    /// The decoded payload.
    pub payload: EventPayload,
}

/// The server event set.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventPayload {
    Authenticated {},
    Disconnected {},
    #[serde(rename_all = "camelCase")]
    AccountInformation {
        account_information: Option<AccountInformation>,
    },
    Positions {
        positions: Vec<Position>,
    },
    Orders {
        orders: Vec<Order>,
    },
    Update {
        #[serde(default)]
        position: Option<Position>,
        #[serde(default)]
        order: Option<Order>,
    },
    #[serde(rename_all = "camelCase")]
    PositionRemoved {
        position_id: String,
    },
    #[serde(rename_all = "camelCase")]
    OrderCompleted {
        order_id: String,
    },
    Deals {
        deals: Vec<Deal>,
    },
    #[serde(rename_all = "camelCase")]
    HistoryOrders {
        history_orders: Vec<Order>,
    },
    SymbolSpecifications {
        specifications: Vec<SymbolSpecification>,
    },
    #[serde(rename_all = "camelCase")]
    Prices {
        prices: Vec<SymbolPrice>,
        #[serde(default)]
        equity: Option<Decimal>,
        #[serde(default)]
        margin: Option<Decimal>,
        #[serde(default)]
        free_margin: Option<Decimal>,
        #[serde(default)]
        margin_level: Option<Decimal>,
    },
    #[serde(rename_all = "camelCase")]
    SynchronizationStarted {
        synchronization_id: String,
    },
    #[serde(rename_all = "camelCase")]
    OrderSynchronizationFinished {
        synchronization_id: String,
    },
    #[serde(rename_all = "camelCase")]
    DealSynchronizationFinished {
        synchronization_id: String,
    },
    Status {
        connected: bool,
    },
    #[serde(rename_all = "camelCase")]
    ServerHealthStatus {
        health_status: Value,
    },
}

/// Frame-level decode failures. The transport logs these and drops the
/// offending frame; they never reach request callers.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("event frame is missing accountId")]
    MissingAccountId,
    #[error("unknown or malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Classifies a raw frame into a response or a typed event.
pub fn classify(value: Value) -> Result<InboundFrame, FrameError> {
    let object = value.as_object().ok_or(FrameError::NotAnObject)?;
    if let Some(request_id) = object
        .get("requestId")
        .and_then(Value::as_str)
        .map(str::to_string)
    {
        return Ok(InboundFrame::Response {
            request_id,
            body: value,
        });
    }
    let account_id = object
        .get("accountId")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingAccountId)?
        .to_string();
    let sequence_number = object.get("sequenceNumber").and_then(Value::as_u64);
    let payload: EventPayload = serde_json::from_value(value)?;
    Ok(InboundFrame::Event(EventPacket {
        account_id,
        sequence_number,
        payload,
    }))
}

/// Stamps an outbound request payload with its delivery envelope.
///
/// The payload must already carry its `type`; the transport adds the
/// account, correlation id and application tag.
pub fn stamp_request(mut payload: Value, account_id: &str, request_id: &str, application: &str) -> Value {
    if let Some(object) = payload.as_object_mut() {
        object.insert("accountId".to_string(), Value::String(account_id.to_string()));
        object.insert("requestId".to_string(), Value::String(request_id.to_string()));
        object.insert("application".to_string(), Value::String(application.to_string()));
    }
    payload
}

/// Extracts a server-reported error from a response body, if present.
pub fn response_error(body: &Value) -> Option<ApiError> {
    if body.get("type").and_then(Value::as_str) != Some("error") {
        return None;
    }
    let error_id = body.get("error").and_then(Value::as_str).unwrap_or("InternalError");
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown server error")
        .to_string();
    let retry_after = body.get("retryAfterSeconds").and_then(Value::as_u64);
    Some(ApiError::from_server(error_id, message, retry_after))
}
