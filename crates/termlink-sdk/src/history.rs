//! Append-only order/deal history with time watermarks.
//!
//! The storage is a synchronization listener: the engine feeds it history
//! records from the event stream, and reads the watermarks back to request
//! incremental syncs. `MemoryHistoryStorage` is the default; a disk-backed
//! variant implements the same trait and uses `load`/`update_storage` as
//! its commit points.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use termlink_common::{ApiError, Deal, Order};
use termlink_wire::SyncListener;

/// Order/deal history contract.
///
/// Watermarks are monotonically non-decreasing across the life of the
/// storage except across `reset()`.
#[async_trait]
pub trait HistoryStorage: SyncListener {
    /// Loads previously persisted records. No-op for in-memory storage.
    async fn load(&self) -> Result<(), ApiError> {
        Ok(())
    }

    /// Commits buffered records. No-op for in-memory storage.
    async fn update_storage(&self) -> Result<(), ApiError> {
        Ok(())
    }

    /// Empties both logs and resets the watermarks to the epoch.
    async fn reset(&self);

    /// `max(done_time)` over merged history orders.
    async fn last_history_order_time(&self) -> DateTime<Utc>;

    /// `max(done_time)` over merged deals.
    async fn last_deal_time(&self) -> DateTime<Utc>;

    /// History orders ordered by `(done_time, id)`.
    fn history_orders(&self) -> Vec<Order>;

    /// Deals ordered by `(done_time, id)`.
    fn deals(&self) -> Vec<Deal>;
}

#[derive(Debug)]
struct HistoryData {
    orders: HashMap<String, Order>,
    deals: HashMap<String, Deal>,
    last_history_order_time: DateTime<Utc>,
    last_deal_time: DateTime<Utc>,
}

impl HistoryData {
    fn empty() -> Self {
        Self {
            orders: HashMap::new(),
            deals: HashMap::new(),
            last_history_order_time: DateTime::UNIX_EPOCH,
            last_deal_time: DateTime::UNIX_EPOCH,
        }
    }
}

/// In-memory history storage.
#[derive(Debug)]
pub struct MemoryHistoryStorage {
    data: RwLock<HistoryData>,
}

impl MemoryHistoryStorage {
    /// Creates an empty storage.
    pub fn new() -> Self {
        Self {
            data: RwLock::new(HistoryData::empty()),
        }
    }
}

impl Default for MemoryHistoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Duplicate ids collapse: the incoming record's fields win, the earliest
/// `done_time` wins.
fn merged_done_time(
    existing: Option<DateTime<Utc>>,
    incoming: Option<DateTime<Utc>>,
) -> Option<DateTime<Utc>> {
    match (existing, incoming) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (Some(a), None) => Some(a),
        (None, b) => b,
    }
}

#[async_trait]
impl SyncListener for MemoryHistoryStorage {
    async fn on_history_order_added(&self, mut order: Order) {
        let mut data = self.data.write();
        if let Some(existing) = data.orders.get(&order.id) {
            order.done_time = merged_done_time(existing.done_time, order.done_time);
        }
        if let Some(done_time) = order.done_time {
            if done_time > data.last_history_order_time {
                data.last_history_order_time = done_time;
            }
        }
        data.orders.insert(order.id.clone(), order);
    }

    async fn on_deal_added(&self, mut deal: Deal) {
        let mut data = self.data.write();
        if let Some(existing) = data.deals.get(&deal.id) {
            deal.done_time = merged_done_time(existing.done_time, deal.done_time);
        }
        if let Some(done_time) = deal.done_time {
            if done_time > data.last_deal_time {
                data.last_deal_time = done_time;
            }
        }
        data.deals.insert(deal.id.clone(), deal);
    }
}

#[async_trait]
impl HistoryStorage for MemoryHistoryStorage {
    async fn reset(&self) {
        *self.data.write() = HistoryData::empty();
    }

    async fn last_history_order_time(&self) -> DateTime<Utc> {
        self.data.read().last_history_order_time
    }

    async fn last_deal_time(&self) -> DateTime<Utc> {
        self.data.read().last_deal_time
    }

    fn history_orders(&self) -> Vec<Order> {
        let data = self.data.read();
        let mut orders: Vec<Order> = data.orders.values().cloned().collect();
        orders.sort_by_key(|order| (order.done_time.unwrap_or(DateTime::UNIX_EPOCH), order.id.clone()));
        orders
    }

    fn deals(&self) -> Vec<Deal> {
        let data = self.data.read();
        let mut deals: Vec<Deal> = data.deals.values().cloned().collect();
        deals.sort_by_key(|deal| (deal.done_time.unwrap_or(DateTime::UNIX_EPOCH), deal.id.clone()));
        deals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).unwrap()
    }

    fn history_order(id: &str, done_at: i64) -> Order {
        Order {
            done_time: Some(at(done_at)),
            ..serde_json::from_value(serde_json::json!({"id": id})).unwrap()
        }
    }

    fn deal(id: &str, done_at: i64) -> Deal {
        Deal {
            done_time: Some(at(done_at)),
            ..serde_json::from_value(serde_json::json!({"id": id})).unwrap()
        }
    }

    #[tokio::test]
    async fn test_orders_merge_by_id() {
        let storage = MemoryHistoryStorage::new();
        storage.on_history_order_added(history_order("1", 100)).await;
        storage.on_history_order_added(history_order("2", 200)).await;
        storage.on_history_order_added(history_order("1", 150)).await;
        let orders = storage.history_orders();
        assert_eq!(orders.len(), 2);
        // Earliest done time wins for the duplicate.
        assert_eq!(orders[0].id, "1");
        assert_eq!(orders[0].done_time, Some(at(100)));
        assert_eq!(orders[1].id, "2");
    }

    #[tokio::test]
    async fn test_duplicate_fields_last_write_wins() {
        let storage = MemoryHistoryStorage::new();
        let mut first = history_order("1", 100);
        first.profit = Some(dec!(5));
        let mut second = history_order("1", 100);
        second.profit = Some(dec!(9));
        storage.on_history_order_added(first).await;
        storage.on_history_order_added(second).await;
        assert_eq!(storage.history_orders()[0].profit, Some(dec!(9)));
    }

    #[tokio::test]
    async fn test_watermarks_are_monotonic() {
        let storage = MemoryHistoryStorage::new();
        assert_eq!(storage.last_history_order_time().await, DateTime::UNIX_EPOCH);

        storage.on_history_order_added(history_order("1", 300)).await;
        assert_eq!(storage.last_history_order_time().await, at(300));

        // Older record arrives late; the watermark must not regress.
        storage.on_history_order_added(history_order("2", 100)).await;
        assert_eq!(storage.last_history_order_time().await, at(300));

        storage.on_deal_added(deal("d1", 50)).await;
        storage.on_deal_added(deal("d2", 75)).await;
        assert_eq!(storage.last_deal_time().await, at(75));
    }

    #[tokio::test]
    async fn test_reset_clears_logs_and_watermarks() {
        let storage = MemoryHistoryStorage::new();
        storage.on_history_order_added(history_order("1", 300)).await;
        storage.on_deal_added(deal("d1", 200)).await;
        storage.reset().await;
        assert!(storage.history_orders().is_empty());
        assert!(storage.deals().is_empty());
        assert_eq!(storage.last_history_order_time().await, DateTime::UNIX_EPOCH);
        assert_eq!(storage.last_deal_time().await, DateTime::UNIX_EPOCH);
    }

    #[tokio::test]
    async fn test_records_sorted_by_done_time_then_id() {
        let storage = MemoryHistoryStorage::new();
        storage.on_deal_added(deal("b", 100)).await;
        storage.on_deal_added(deal("a", 100)).await;
        storage.on_deal_added(deal("c", 50)).await;
        let ids: Vec<String> = storage.deals().into_iter().map(|d| d.id).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }
}
