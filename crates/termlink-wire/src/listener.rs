//! Synchronization listener capability set.
//!
//! Components that mirror terminal state (the state mirror, history
//! storage, health monitor and the synchronization engine itself) each
//! implement the subset of callbacks they care about; everything else
//! falls through to the default no-ops. The transport invokes callbacks
//! for one account strictly in packet-orderer release order.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;

use termlink_common::{AccountInformation, Deal, Order, Position, SymbolPrice, SymbolSpecification};

/// Receives the decoded per-account event stream.
///
/// All methods default to no-ops so implementors declare only the
/// capabilities they use.
#[async_trait]
pub trait SyncListener: Send + Sync {
    /// The terminal authenticated this account's event stream.
    async fn on_connected(&self) {}

    /// The event stream for this account went down.
    async fn on_disconnected(&self) {}

    /// Account information was replaced wholesale.
    async fn on_account_information_updated(&self, _account_information: AccountInformation) {}

    /// The full position set was replaced.
    async fn on_positions_replaced(&self, _positions: Vec<Position>) {}

    /// A single position was created or updated.
    async fn on_position_updated(&self, _position: Position) {}

    /// A position was closed or otherwise removed.
    async fn on_position_removed(&self, _position_id: String) {}

    /// The full pending-order set was replaced.
    async fn on_orders_replaced(&self, _orders: Vec<Order>) {}

    /// A single pending order was created or updated.
    async fn on_order_updated(&self, _order: Order) {}

    /// A pending order reached a terminal state.
    async fn on_order_completed(&self, _order_id: String) {}

    /// A history order record arrived.
    async fn on_history_order_added(&self, _order: Order) {}

    /// A deal record arrived.
    async fn on_deal_added(&self, _deal: Deal) {}

    /// A symbol specification was replaced.
    async fn on_symbol_specification_updated(&self, _specification: SymbolSpecification) {}

    /// A batch of symbol prices arrived, optionally carrying explicit
    /// account margin figures that override locally derived ones.
    async fn on_symbol_prices_updated(
        &self,
        _prices: Vec<SymbolPrice>,
        _equity: Option<Decimal>,
        _margin: Option<Decimal>,
        _free_margin: Option<Decimal>,
        _margin_level: Option<Decimal>,
    ) {
    }

    /// The terminal began a synchronization pass.
    async fn on_synchronization_started(&self, _synchronization_id: String) {}

    /// The order leg of a synchronization pass finished.
    async fn on_order_synchronization_finished(&self, _synchronization_id: String) {}

    /// The deal leg of a synchronization pass finished.
    async fn on_deal_synchronization_finished(&self, _synchronization_id: String) {}

    /// The terminal-to-broker link changed state.
    async fn on_broker_connection_status_changed(&self, _connected: bool) {}

    /// The server published a health report.
    async fn on_server_health_status(&self, _health_status: Value) {}

    /// The packet orderer gave up on a sequence gap and skipped it.
    async fn on_packet_gap_detected(&self, _first_missing: u64, _last_missing: u64) {}
}

/// Notified when the transport re-establishes its socket.
///
/// Missed events are NOT replayed; it is the receiver's job to
/// re-subscribe and re-synchronize.
#[async_trait]
pub trait ReconnectListener: Send + Sync {
    /// The socket was re-established after a loss.
    async fn on_reconnected(&self);
}
