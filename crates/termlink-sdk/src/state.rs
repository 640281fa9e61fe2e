//! Local mirror of the remote terminal's state.
//!
//! The mirror is written only by the event stream (one event at a time,
//! under a single write lock), so readers always observe a complete event
//! application, never a partial one. Profit, equity and order quote
//! derivations run inside the same lock scope as the price upsert that
//! triggered them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::debug;

use termlink_common::{
    AccountInformation, Order, Position, PositionType, SymbolPrice, SymbolSpecification,
};
use termlink_wire::SyncListener;

#[derive(Debug, Default)]
struct StateData {
    account_information: Option<AccountInformation>,
    positions: HashMap<String, Position>,
    removed_positions: HashSet<String>,
    orders: HashMap<String, Order>,
    completed_orders: HashSet<String>,
    specifications: HashMap<String, SymbolSpecification>,
    prices: HashMap<String, SymbolPrice>,
}

#[derive(Debug)]
struct StateInner {
    status_timer_timeout: Duration,
    connected: AtomicBool,
    connected_to_broker: AtomicBool,
    status_generation: AtomicU64,
    data: RwLock<StateData>,
}

/// The terminal state mirror.
///
/// Cheap to clone; all clones share the same mirror.
#[derive(Debug, Clone)]
pub struct TerminalState {
    inner: Arc<StateInner>,
}

impl TerminalState {
    /// Creates an empty mirror with the given broker-status watchdog
    /// timeout.
    pub fn new(status_timer_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(StateInner {
                status_timer_timeout,
                connected: AtomicBool::new(false),
                connected_to_broker: AtomicBool::new(false),
                status_generation: AtomicU64::new(0),
                data: RwLock::new(StateData::default()),
            }),
        }
    }

    /// Whether the event stream is authenticated.
    pub fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// Whether the terminal reports a live broker link.
    pub fn connected_to_broker(&self) -> bool {
        self.inner.connected_to_broker.load(Ordering::Acquire)
    }

    /// Latest account information, if any arrived yet.
    pub fn account_information(&self) -> Option<AccountInformation> {
        self.inner.data.read().account_information.clone()
    }

    /// Snapshot of all open positions.
    pub fn positions(&self) -> Vec<Position> {
        self.inner.data.read().positions.values().cloned().collect()
    }

    /// One position by id.
    pub fn position(&self, position_id: &str) -> Option<Position> {
        self.inner.data.read().positions.get(position_id).cloned()
    }

    /// Snapshot of all pending orders.
    pub fn orders(&self) -> Vec<Order> {
        self.inner.data.read().orders.values().cloned().collect()
    }

    /// One pending order by id.
    pub fn order(&self, order_id: &str) -> Option<Order> {
        self.inner.data.read().orders.get(order_id).cloned()
    }

    /// Snapshot of all known symbol specifications.
    pub fn specifications(&self) -> Vec<SymbolSpecification> {
        self.inner
            .data
            .read()
            .specifications
            .values()
            .cloned()
            .collect()
    }

    /// One symbol specification.
    pub fn specification(&self, symbol: &str) -> Option<SymbolSpecification> {
        self.inner.data.read().specifications.get(symbol).cloned()
    }

    /// Latest price for a symbol.
    pub fn price(&self, symbol: &str) -> Option<SymbolPrice> {
        self.inner.data.read().prices.get(symbol).cloned()
    }

    /// Arms the broker-status watchdog for the current status signal.
    ///
    /// If no newer signal arrives within the timeout, the terminal is
    /// considered disconnected.
    fn arm_status_watchdog(&self) {
        let generation = self.inner.status_generation.fetch_add(1, Ordering::AcqRel) + 1;
        let timeout = self.inner.status_timer_timeout;
        let weak: Weak<StateInner> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else { return };
            if inner.status_generation.load(Ordering::Acquire) == generation {
                debug!("Broker status signal timed out");
                inner.connected_to_broker.store(false, Ordering::Release);
                inner.connected.store(false, Ordering::Release);
            }
        });
    }
}

/// Applies a quote to one position per the profit delta contract.
fn update_position_from_price(position: &mut Position, price: &SymbolPrice, tick_size: Decimal) {
    let Some(position_type) = position.position_type else {
        return;
    };
    let Some(volume) = position.volume else { return };
    let Some(open_price) = position.open_price else {
        return;
    };
    if tick_size.is_zero() {
        return;
    }
    let previous_price = position.current_price.unwrap_or(open_price);

    // First quote for a record without a profit split: derive the
    // baseline at the previous price before applying the delta.
    if position.unrealized_profit.is_none() || position.realized_profit.is_none() {
        let tick_value = position.current_tick_value.unwrap_or_default();
        let unrealized = tick_value * (previous_price - open_price) * volume / tick_size;
        position.unrealized_profit = Some(unrealized);
        position.realized_profit = Some(position.profit.unwrap_or_default() - unrealized);
    }

    let new_price = match position_type {
        PositionType::Buy => price.bid,
        PositionType::Sell => price.ask,
    };
    let price_change = new_price - previous_price;
    let ticks = price_change / tick_size;
    let tick_value = if price_change >= Decimal::ZERO {
        price.profit_tick_value
    } else {
        price.loss_tick_value
    }
    .unwrap_or_default();
    let profit_delta = position_type.sign() * ticks * tick_value * volume;

    position.profit = Some(position.profit.unwrap_or_default() + profit_delta);
    position.unrealized_profit = Some(position.unrealized_profit.unwrap_or_default() + profit_delta);
    position.current_price = Some(new_price);
    position.current_tick_value = Some(tick_value);
}

#[async_trait]
impl SyncListener for TerminalState {
    async fn on_connected(&self) {
        self.inner.connected.store(true, Ordering::Release);
    }

    async fn on_disconnected(&self) {
        self.inner.connected.store(false, Ordering::Release);
        self.inner.connected_to_broker.store(false, Ordering::Release);
    }

    async fn on_broker_connection_status_changed(&self, connected: bool) {
        self.inner
            .connected_to_broker
            .store(connected, Ordering::Release);
        self.arm_status_watchdog();
    }

    async fn on_account_information_updated(&self, account_information: AccountInformation) {
        self.inner.data.write().account_information = Some(account_information);
    }

    async fn on_positions_replaced(&self, positions: Vec<Position>) {
        let mut data = self.inner.data.write();
        data.positions = positions
            .into_iter()
            .map(|position| (position.id.clone(), position))
            .collect();
        data.removed_positions.clear();
    }

    async fn on_position_updated(&self, position: Position) {
        let mut data = self.inner.data.write();
        if data.removed_positions.contains(&position.id) {
            debug!(position_id = %position.id, "Ignoring update for removed position");
            return;
        }
        data.positions.insert(position.id.clone(), position);
    }

    async fn on_position_removed(&self, position_id: String) {
        let mut data = self.inner.data.write();
        data.positions.remove(&position_id);
        data.removed_positions.insert(position_id);
    }

    async fn on_orders_replaced(&self, orders: Vec<Order>) {
        let mut data = self.inner.data.write();
        data.orders = orders
            .into_iter()
            .map(|order| (order.id.clone(), order))
            .collect();
        data.completed_orders.clear();
    }

    async fn on_order_updated(&self, order: Order) {
        let mut data = self.inner.data.write();
        if data.completed_orders.contains(&order.id) {
            debug!(order_id = %order.id, "Ignoring update for completed order");
            return;
        }
        data.orders.insert(order.id.clone(), order);
    }

    async fn on_order_completed(&self, order_id: String) {
        let mut data = self.inner.data.write();
        data.orders.remove(&order_id);
        data.completed_orders.insert(order_id);
    }

    async fn on_symbol_specification_updated(&self, specification: SymbolSpecification) {
        self.inner
            .data
            .write()
            .specifications
            .insert(specification.symbol.clone(), specification);
    }

    async fn on_symbol_prices_updated(
        &self,
        prices: Vec<SymbolPrice>,
        equity: Option<Decimal>,
        margin: Option<Decimal>,
        free_margin: Option<Decimal>,
        margin_level: Option<Decimal>,
    ) {
        let mut guard = self.inner.data.write();
        let data = &mut *guard;

        for price in prices {
            let tick_size = data
                .specifications
                .get(&price.symbol)
                .map(|specification| specification.tick_size);
            if let Some(tick_size) = tick_size {
                for position in data
                    .positions
                    .values_mut()
                    .filter(|position| position.symbol.as_deref() == Some(price.symbol.as_str()))
                {
                    update_position_from_price(position, &price, tick_size);
                }
                for order in data
                    .orders
                    .values_mut()
                    .filter(|order| order.symbol.as_deref() == Some(price.symbol.as_str()))
                {
                    if let Some(order_type) = order.order_type {
                        order.current_price = Some(if order_type.is_sell() {
                            price.bid
                        } else {
                            price.ask
                        });
                    }
                }
            }
            data.prices.insert(price.symbol.clone(), price);
        }

        let total_profit: Decimal = data
            .positions
            .values()
            .filter_map(|position| position.profit)
            .sum();
        if let Some(information) = data.account_information.as_mut() {
            information.equity = information.balance + total_profit;
            // Explicit server figures override the derived ones.
            if let Some(equity) = equity {
                information.equity = equity;
            }
            if margin.is_some() {
                information.margin = margin;
            }
            if free_margin.is_some() {
                information.free_margin = free_margin;
            }
            if margin_level.is_some() {
                information.margin_level = margin_level;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use serde_json::{from_value, json};

    fn state() -> TerminalState {
        TerminalState::new(Duration::from_secs(60))
    }

    fn account_info(equity: Decimal, balance: Decimal) -> AccountInformation {
        from_value(json!({"equity": equity, "balance": balance})).unwrap()
    }

    fn buy_position(id: &str, symbol: &str) -> Position {
        from_value(json!({
            "id": id,
            "symbol": symbol,
            "type": "POSITION_TYPE_BUY",
            "currentPrice": 9,
            "currentTickValue": 0.5,
            "openPrice": 8,
            "profit": 100,
            "volume": 2
        }))
        .unwrap()
    }

    fn spec(symbol: &str, tick_size: Decimal) -> SymbolSpecification {
        from_value(json!({"symbol": symbol, "tickSize": tick_size})).unwrap()
    }

    fn quote(symbol: &str) -> SymbolPrice {
        from_value(json!({
            "symbol": symbol,
            "profitTickValue": 0.5,
            "lossTickValue": 0.5,
            "bid": 10,
            "ask": 11
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_returns_connection_state() {
        let state = state();
        assert!(!state.connected());
        state.on_connected().await;
        assert!(state.connected());
        state.on_disconnected().await;
        assert!(!state.connected());
    }

    #[tokio::test]
    async fn test_returns_broker_connection_state() {
        let state = state();
        assert!(!state.connected_to_broker());
        state.on_broker_connection_status_changed(true).await;
        assert!(state.connected_to_broker());
        state.on_broker_connection_status_changed(false).await;
        assert!(!state.connected_to_broker());
        state.on_broker_connection_status_changed(true).await;
        state.on_disconnected().await;
        assert!(!state.connected_to_broker());
    }

    #[tokio::test]
    async fn test_status_watchdog_invalidates_stale_broker_link() {
        let state = TerminalState::new(Duration::from_millis(200));
        state.on_connected().await;
        state.on_broker_connection_status_changed(true).await;
        assert!(state.connected_to_broker());
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!state.connected_to_broker());
        assert!(!state.connected());
    }

    #[tokio::test]
    async fn test_fresh_status_signal_rearms_watchdog() {
        let state = TerminalState::new(Duration::from_millis(300));
        state.on_broker_connection_status_changed(true).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        state.on_broker_connection_status_changed(true).await;
        tokio::time::sleep(Duration::from_millis(200)).await;
        // Second signal renewed the timer; link is still up.
        assert!(state.connected_to_broker());
    }

    #[tokio::test]
    async fn test_returns_account_information() {
        let state = state();
        assert!(state.account_information().is_none());
        state
            .on_account_information_updated(account_info(dec!(1000), dec!(800)))
            .await;
        assert_eq!(state.account_information().unwrap().balance, dec!(800));
    }

    #[tokio::test]
    async fn test_returns_positions() {
        let state = state();
        assert!(state.positions().is_empty());
        state
            .on_position_updated(from_value(json!({"id": "1", "profit": 10})).unwrap())
            .await;
        state
            .on_position_updated(from_value(json!({"id": "2"})).unwrap())
            .await;
        state
            .on_position_updated(from_value(json!({"id": "1", "profit": 11})).unwrap())
            .await;
        state.on_position_removed("2".to_string()).await;
        let positions = state.positions();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].id, "1");
        assert_eq!(positions[0].profit, Some(dec!(11)));
    }

    #[tokio::test]
    async fn test_removed_position_stays_removed_until_replace() {
        let state = state();
        state
            .on_position_updated(from_value(json!({"id": "1"})).unwrap())
            .await;
        state.on_position_removed("1".to_string()).await;
        // A straggling update must not resurrect the position.
        state
            .on_position_updated(from_value(json!({"id": "1", "profit": 5})).unwrap())
            .await;
        assert!(state.positions().is_empty());
        // A full replacement carrying the id brings it back.
        state
            .on_positions_replaced(vec![from_value(json!({"id": "1"})).unwrap()])
            .await;
        assert_eq!(state.positions().len(), 1);
    }

    #[tokio::test]
    async fn test_returns_orders_and_completion_is_terminal() {
        let state = state();
        assert!(state.orders().is_empty());
        state
            .on_order_updated(from_value(json!({"id": "1", "openPrice": 10})).unwrap())
            .await;
        state
            .on_order_updated(from_value(json!({"id": "2"})).unwrap())
            .await;
        state
            .on_order_updated(from_value(json!({"id": "1", "openPrice": 11})).unwrap())
            .await;
        state.on_order_completed("2".to_string()).await;
        let orders = state.orders();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].id, "1");
        assert_eq!(orders[0].open_price, Some(dec!(11)));
        // Updates after completion are ignored.
        state
            .on_order_updated(from_value(json!({"id": "2", "openPrice": 12})).unwrap())
            .await;
        assert_eq!(state.orders().len(), 1);
    }

    #[tokio::test]
    async fn test_returns_specifications() {
        let state = state();
        assert!(state.specifications().is_empty());
        state
            .on_symbol_specification_updated(spec("EURUSD", dec!(0.00001)))
            .await;
        state
            .on_symbol_specification_updated(spec("GBPUSD", dec!(0.00001)))
            .await;
        state
            .on_symbol_specification_updated(spec("EURUSD", dec!(0.0001)))
            .await;
        assert_eq!(state.specifications().len(), 2);
        assert_eq!(
            state.specification("EURUSD").unwrap().tick_size,
            dec!(0.0001)
        );
    }

    #[tokio::test]
    async fn test_returns_latest_price() {
        let state = state();
        assert!(state.price("EURUSD").is_none());
        state
            .on_symbol_prices_updated(
                vec![from_value(json!({"symbol": "EURUSD", "bid": 1, "ask": 1.1})).unwrap()],
                None,
                None,
                None,
                None,
            )
            .await;
        state
            .on_symbol_prices_updated(
                vec![from_value(json!({"symbol": "EURUSD", "bid": 1, "ask": 1.2})).unwrap()],
                None,
                None,
                None,
                None,
            )
            .await;
        assert_eq!(state.price("EURUSD").unwrap().ask, dec!(1.2));
    }

    #[tokio::test]
    async fn test_price_update_derives_profit_and_equity() {
        let state = state();
        state
            .on_account_information_updated(account_info(dec!(1000), dec!(800)))
            .await;
        state
            .on_positions_replaced(vec![buy_position("1", "EURUSD")])
            .await;
        state.on_position_updated(buy_position("2", "AUDUSD")).await;
        state
            .on_symbol_specification_updated(spec("EURUSD", dec!(0.01)))
            .await;
        state
            .on_symbol_specification_updated(spec("AUDUSD", dec!(0.01)))
            .await;
        state
            .on_symbol_prices_updated(
                vec![quote("EURUSD"), quote("AUDUSD")],
                None,
                None,
                None,
                None,
            )
            .await;

        let mut positions = state.positions();
        positions.sort_by(|a, b| a.id.cmp(&b.id));
        for position in &positions {
            assert_eq!(position.profit, Some(dec!(200)));
            assert_eq!(position.unrealized_profit, Some(dec!(200)));
            assert_eq!(position.current_price, Some(dec!(10)));
        }
        assert_eq!(state.account_information().unwrap().equity, dec!(1200));
    }

    #[tokio::test]
    async fn test_explicit_margin_figures_override_derived() {
        let state = state();
        state
            .on_account_information_updated(account_info(dec!(1000), dec!(800)))
            .await;
        state
            .on_symbol_prices_updated(
                Vec::new(),
                Some(dec!(100)),
                Some(dec!(200)),
                Some(dec!(400)),
                Some(dec!(40000)),
            )
            .await;
        let information = state.account_information().unwrap();
        assert_eq!(information.equity, dec!(100));
        assert_eq!(information.margin, Some(dec!(200)));
        assert_eq!(information.free_margin, Some(dec!(400)));
        assert_eq!(information.margin_level, Some(dec!(40000)));
    }

    #[tokio::test]
    async fn test_price_update_moves_order_quotes() {
        let state = state();
        state
            .on_order_updated(
                from_value(json!({
                    "id": "1",
                    "symbol": "EURUSD",
                    "type": "ORDER_TYPE_BUY_LIMIT",
                    "currentPrice": 9
                }))
                .unwrap(),
            )
            .await;
        state
            .on_order_updated(
                from_value(json!({
                    "id": "2",
                    "symbol": "AUDUSD",
                    "type": "ORDER_TYPE_SELL_LIMIT",
                    "currentPrice": 9
                }))
                .unwrap(),
            )
            .await;
        state
            .on_symbol_specification_updated(spec("EURUSD", dec!(0.01)))
            .await;
        state
            .on_symbol_prices_updated(vec![quote("EURUSD")], None, None, None, None)
            .await;

        // Buy-side order tracks the ask; the unquoted symbol is untouched.
        assert_eq!(state.order("1").unwrap().current_price, Some(dec!(11)));
        assert_eq!(state.order("2").unwrap().current_price, Some(dec!(9)));
    }

    #[tokio::test]
    async fn test_position_without_specification_keeps_profit() {
        let state = state();
        state
            .on_account_information_updated(account_info(dec!(1000), dec!(800)))
            .await;
        state.on_position_updated(buy_position("1", "EURUSD")).await;
        // No specification for the symbol: the quote is stored but the
        // position is left untouched.
        state
            .on_symbol_prices_updated(vec![quote("EURUSD")], None, None, None, None)
            .await;
        let position = state.position("1").unwrap();
        assert_eq!(position.profit, Some(dec!(100)));
        assert_eq!(position.current_price, Some(dec!(9)));
        // Equity still reflects the sum of held profits.
        assert_eq!(state.account_information().unwrap().equity, dec!(900));
    }
}
