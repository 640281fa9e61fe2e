//! Per-account packet sequence restoration.
//!
//! The server numbers event packets per account. Packets can arrive out
//! of order; this module buffers ahead-of-sequence packets and releases
//! them contiguously. A gap that persists past the configured timeout is
//! reported and skipped so the stream does not stall forever — the
//! synchronization engine reacts by forcing a fresh sync.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::protocol::{EventPacket, EventPayload};

/// Default cap on buffered out-of-order packets per account.
const DEFAULT_BUFFER_CAPACITY: usize = 500;

/// A sequence gap the orderer gave up waiting on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GapInfo {
    /// Account whose stream the gap occurred in.
    pub account_id: String,
    /// First sequence number that was never delivered.
    pub first_missing: u64,
    /// Last sequence number that was never delivered.
    pub last_missing: u64,
}

#[derive(Debug)]
struct StreamState {
    next_expected: u64,
    buffer: BTreeMap<u64, EventPacket>,
    gap_since: Option<Instant>,
}

impl StreamState {
    fn new() -> Self {
        Self {
            next_expected: 1,
            buffer: BTreeMap::new(),
            gap_since: None,
        }
    }

    /// Releases every buffered packet that continues the sequence.
    fn drain_contiguous(&mut self, released: &mut Vec<EventPacket>) {
        while let Some(packet) = self.buffer.remove(&self.next_expected) {
            self.next_expected += 1;
            released.push(packet);
        }
        self.gap_since = if self.buffer.is_empty() {
            None
        } else {
            // Progress was made; restart the clock on the remaining gap.
            Some(Instant::now())
        };
    }
}

/// Restores per-account packet order.
pub struct PacketOrderer {
    streams: DashMap<String, StreamState>,
    out_of_order_timeout: Duration,
    buffer_capacity: usize,
}

impl PacketOrderer {
    /// Creates an orderer with the given gap timeout.
    pub fn new(out_of_order_timeout: Duration) -> Self {
        Self {
            streams: DashMap::new(),
            out_of_order_timeout,
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
        }
    }

    /// Overrides the out-of-order buffer capacity.
    pub fn with_buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Feeds one packet in; returns the packets releasable in order.
    ///
    /// Packets without a sequence number bypass ordering entirely. A
    /// `synchronizationStarted` packet resets the stream to the
    /// server-declared base.
    pub fn restore_order(&self, packet: EventPacket) -> Vec<EventPacket> {
        let sequence = match packet.sequence_number {
            Some(sequence) => sequence,
            None => return vec![packet],
        };
        let mut stream = self
            .streams
            .entry(packet.account_id.clone())
            .or_insert_with(StreamState::new);

        if matches!(packet.payload, EventPayload::SynchronizationStarted { .. }) {
            stream.next_expected = sequence + 1;
            stream.buffer.clear();
            stream.gap_since = None;
            return vec![packet];
        }

        if sequence < stream.next_expected {
            debug!(
                account_id = %packet.account_id,
                sequence,
                next_expected = stream.next_expected,
                "Discarding already-delivered packet"
            );
            return Vec::new();
        }

        if sequence > stream.next_expected {
            if stream.buffer.len() >= self.buffer_capacity {
                if let Some((dropped, _)) = stream.buffer.pop_first() {
                    warn!(
                        account_id = %packet.account_id,
                        dropped_sequence = dropped,
                        "Packet buffer overflow, dropping oldest buffered packet"
                    );
                }
            }
            stream.buffer.insert(sequence, packet);
            if stream.gap_since.is_none() {
                stream.gap_since = Some(Instant::now());
            }
            return Vec::new();
        }

        let mut released = vec![packet];
        stream.next_expected += 1;
        stream.drain_contiguous(&mut released);
        released
    }

    /// Sweeps streams whose gap outlived the timeout.
    ///
    /// For each expired gap the stream skips ahead to the first buffered
    /// packet; the skipped range is reported together with the packets
    /// that become releasable.
    pub fn check_gaps(&self) -> Vec<(GapInfo, Vec<EventPacket>)> {
        let mut results = Vec::new();
        for mut entry in self.streams.iter_mut() {
            let account_id = entry.key().clone();
            let stream = entry.value_mut();
            let expired = stream
                .gap_since
                .map(|since| since.elapsed() >= self.out_of_order_timeout)
                .unwrap_or(false);
            if !expired {
                continue;
            }
            let Some((&first_buffered, _)) = stream.buffer.first_key_value() else {
                stream.gap_since = None;
                continue;
            };
            let gap = GapInfo {
                account_id,
                first_missing: stream.next_expected,
                last_missing: first_buffered - 1,
            };
            stream.next_expected = first_buffered;
            let mut released = Vec::new();
            stream.drain_contiguous(&mut released);
            results.push((gap, released));
        }
        results
    }

    /// Forgets an account's stream entirely.
    pub fn drop_stream(&self, account_id: &str) {
        self.streams.remove(account_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(account_id: &str, sequence: u64) -> EventPacket {
        EventPacket {
            account_id: account_id.to_string(),
            sequence_number: Some(sequence),
            payload: EventPayload::Status { connected: true },
        }
    }

    fn sync_started(account_id: &str, sequence: u64) -> EventPacket {
        EventPacket {
            account_id: account_id.to_string(),
            sequence_number: Some(sequence),
            payload: EventPayload::SynchronizationStarted {
                synchronization_id: "sync-1".to_string(),
            },
        }
    }

    fn sequences(packets: &[EventPacket]) -> Vec<u64> {
        packets.iter().filter_map(|p| p.sequence_number).collect()
    }

    #[test]
    fn test_in_order_packets_release_immediately() {
        let orderer = PacketOrderer::new(Duration::from_secs(60));
        assert_eq!(sequences(&orderer.restore_order(packet("a", 1))), vec![1]);
        assert_eq!(sequences(&orderer.restore_order(packet("a", 2))), vec![2]);
    }

    #[test]
    fn test_out_of_order_packets_are_reordered() {
        let orderer = PacketOrderer::new(Duration::from_secs(60));
        assert!(orderer.restore_order(packet("a", 2)).is_empty());
        assert_eq!(sequences(&orderer.restore_order(packet("a", 1))), vec![1, 2]);
        assert!(orderer.restore_order(packet("a", 4)).is_empty());
        assert_eq!(sequences(&orderer.restore_order(packet("a", 3))), vec![3, 4]);
    }

    #[test]
    fn test_duplicate_packets_are_discarded() {
        let orderer = PacketOrderer::new(Duration::from_secs(60));
        assert_eq!(sequences(&orderer.restore_order(packet("a", 1))), vec![1]);
        assert!(orderer.restore_order(packet("a", 1)).is_empty());
    }

    #[test]
    fn test_accounts_have_independent_streams() {
        let orderer = PacketOrderer::new(Duration::from_secs(60));
        assert_eq!(sequences(&orderer.restore_order(packet("a", 1))), vec![1]);
        assert!(orderer.restore_order(packet("b", 2)).is_empty());
        assert_eq!(sequences(&orderer.restore_order(packet("b", 1))), vec![1, 2]);
    }

    #[test]
    fn test_unsequenced_packets_bypass_ordering() {
        let orderer = PacketOrderer::new(Duration::from_secs(60));
        let unsequenced = EventPacket {
            account_id: "a".to_string(),
            sequence_number: None,
            payload: EventPayload::Status { connected: false },
        };
        assert_eq!(orderer.restore_order(unsequenced).len(), 1);
    }

    #[test]
    fn test_synchronization_started_resets_base() {
        let orderer = PacketOrderer::new(Duration::from_secs(60));
        assert_eq!(sequences(&orderer.restore_order(packet("a", 1))), vec![1]);
        // Server restarts numbering from a new base.
        assert_eq!(
            sequences(&orderer.restore_order(sync_started("a", 100))),
            vec![100]
        );
        assert_eq!(sequences(&orderer.restore_order(packet("a", 101))), vec![101]);
        // Pre-reset stragglers are now behind the stream.
        assert!(orderer.restore_order(packet("a", 2)).is_empty());
    }

    #[test]
    fn test_expired_gap_is_reported_and_skipped() {
        let orderer = PacketOrderer::new(Duration::from_millis(0));
        assert!(orderer.restore_order(packet("a", 3)).is_empty());
        assert!(orderer.restore_order(packet("a", 4)).is_empty());
        let gaps = orderer.check_gaps();
        assert_eq!(gaps.len(), 1);
        let (gap, released) = &gaps[0];
        assert_eq!(
            *gap,
            GapInfo {
                account_id: "a".to_string(),
                first_missing: 1,
                last_missing: 2,
            }
        );
        assert_eq!(sequences(released), vec![3, 4]);
        // Stream continues from past the gap.
        assert_eq!(sequences(&orderer.restore_order(packet("a", 5))), vec![5]);
    }

    #[test]
    fn test_gap_not_reported_before_timeout() {
        let orderer = PacketOrderer::new(Duration::from_secs(60));
        assert!(orderer.restore_order(packet("a", 3)).is_empty());
        assert!(orderer.check_gaps().is_empty());
    }

    #[test]
    fn test_buffer_overflow_drops_oldest() {
        let orderer = PacketOrderer::new(Duration::from_secs(60)).with_buffer_capacity(2);
        assert!(orderer.restore_order(packet("a", 2)).is_empty());
        assert!(orderer.restore_order(packet("a", 3)).is_empty());
        // Capacity reached: buffering 5 evicts 2.
        assert!(orderer.restore_order(packet("a", 5)).is_empty());
        // Releasing 1 now only drains 1 and 3 is still stranded behind 2.
        assert_eq!(sequences(&orderer.restore_order(packet("a", 1))), vec![1]);
    }
}
