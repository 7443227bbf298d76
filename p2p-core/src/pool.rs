//! Reassembly pool: merge split messages back into whole messages, per protocol version.

use std::collections::{HashMap, VecDeque};

use tracing::{debug, warn};

use crate::header::{Header, ProtocolVersion, TfCombination, V1Flags};
use crate::message::Message;

/// Largest V1 message the pool will allocate a reassembly buffer for.
pub const MAX_REASSEMBLY_SIZE: u64 = 16 * 1024 * 1024; // 16 MiB
/// Open reassemblies kept per version; the oldest is evicted beyond this.
pub const MAX_PENDING_REASSEMBLIES: usize = 64;

/// Why a V1 fragment was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ReassemblyInconsistency {
    #[error("fragment total {got} does not match buffer total {expected}")]
    TotalSizeMismatch { expected: u64, got: u64 },
    #[error("fragment at {offset}+{size} exceeds total {total}")]
    OutOfBounds { offset: u64, size: u64, total: u64 },
    #[error("total size {0} exceeds reassembly limit")]
    TooLarge(u64),
}

struct V1Partial {
    first: Message,
    buffer: Vec<u8>,
    /// Disjoint, sorted `[start, end)` byte ranges copied so far.
    ranges: Vec<(u64, u64)>,
    received: u64,
}

struct V2Partial {
    first: Message,
    payload: Vec<u8>,
    package_number: u16,
}

struct Slot<P> {
    opened: u64,
    partial: P,
}

struct Queue<P> {
    ready: VecDeque<Message>,
    partial: HashMap<u32, Slot<P>>,
    next_seq: u64,
}

impl<P> Default for Queue<P> {
    fn default() -> Self {
        Self {
            ready: VecDeque::new(),
            partial: HashMap::new(),
            next_seq: 0,
        }
    }
}

impl<P> Queue<P> {
    /// Open a new reassembly. Returns the key of an evicted one when the queue was full.
    fn open(&mut self, key: u32, partial: P) -> Option<u32> {
        let mut evicted = None;
        if !self.partial.contains_key(&key) && self.partial.len() >= MAX_PENDING_REASSEMBLIES {
            evicted = self
                .partial
                .iter()
                .min_by_key(|(_, slot)| slot.opened)
                .map(|(k, _)| *k);
            if let Some(k) = evicted {
                self.partial.remove(&k);
            }
        }
        let opened = self.next_seq;
        self.next_seq += 1;
        self.partial.insert(key, Slot { opened, partial });
        evicted
    }
}

/// Record `[start, end)` as received and return how many of its bytes were new.
fn mark_received(ranges: &mut Vec<(u64, u64)>, start: u64, end: u64) -> u64 {
    let mut fresh = end - start;
    let (mut lo, mut hi) = (start, end);
    ranges.retain(|&(s, e)| {
        if e < start || s > end {
            return true;
        }
        fresh -= end.min(e).saturating_sub(start.max(s));
        lo = lo.min(s);
        hi = hi.max(e);
        false
    });
    let at = ranges.partition_point(|&(s, _)| s < lo);
    ranges.insert(at, (lo, hi));
    fresh
}

/// Buffers fragments until whole messages are available.
#[derive(Default)]
pub struct MessagePool {
    v1: Queue<V1Partial>,
    v2: Queue<V2Partial>,
    dropped: u64,
    passed_through: u64,
    evicted: u64,
}

impl MessagePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a fragment, or queue it as ready if it is already whole.
    pub fn buffer(&mut self, message: Message) {
        match message.version() {
            ProtocolVersion::V1 => self.buffer_v1(message),
            ProtocolVersion::V2 => self.buffer_v2(message),
        }
    }

    pub fn message_available(&self, version: ProtocolVersion) -> bool {
        match version {
            ProtocolVersion::V1 => !self.v1.ready.is_empty(),
            ProtocolVersion::V2 => !self.v2.ready.is_empty(),
        }
    }

    pub fn dequeue(&mut self, version: ProtocolVersion) -> Option<Message> {
        match version {
            ProtocolVersion::V1 => self.v1.ready.pop_front(),
            ProtocolVersion::V2 => self.v2.ready.pop_front(),
        }
    }

    pub fn pending_reassemblies(&self) -> usize {
        self.v1.partial.len() + self.v2.partial.len()
    }

    /// V1 fragments dropped for inconsistent offset or total size.
    pub fn dropped_fragments(&self) -> u64 {
        self.dropped
    }

    /// V2 fragments delivered as-is because no matching slot was open.
    pub fn passed_through(&self) -> u64 {
        self.passed_through
    }

    /// Incomplete reassemblies discarded to make room for newer ones.
    pub fn evicted_reassemblies(&self) -> u64 {
        self.evicted
    }

    pub fn clear(&mut self) {
        self.v1 = Queue::default();
        self.v2 = Queue::default();
    }

    fn note_eviction(&mut self, evicted: Option<u32>) {
        if let Some(identifier) = evicted {
            self.evicted += 1;
            warn!(identifier, "evicting stale reassembly");
        }
    }

    fn buffer_v1(&mut self, message: Message) {
        let Header::V1(h) = message.header() else { return };
        let size = u64::from(h.message_size);
        if size == 0 || size == h.total_size || h.flags.contains(V1Flags::DATA) {
            self.v1.ready.push_back(message);
            return;
        }
        let (identifier, offset, total) = (h.identifier, h.offset, h.total_size);

        if let Err(reason) = self.copy_v1_fragment(identifier, offset, total, &message) {
            self.dropped += 1;
            warn!(identifier, offset, size, total, %reason, "dropping fragment");
            return;
        }

        let complete = self
            .v1
            .partial
            .get(&identifier)
            .is_some_and(|slot| slot.partial.received >= total);
        if complete {
            if let Some(slot) = self.v1.partial.remove(&identifier) {
                let mut whole = slot.partial.first;
                whole.update_header(|h| {
                    if let Header::V1(h) = h {
                        h.offset = 0;
                    }
                });
                whole.set_payload(slot.partial.buffer);
                debug!(identifier, total, "reassembled message");
                self.v1.ready.push_back(whole);
            }
        }
    }

    fn copy_v1_fragment(&mut self, identifier: u32, offset: u64, total: u64, message: &Message) -> Result<(), ReassemblyInconsistency> {
        let size = message.payload().len() as u64;
        let Some(end) = offset.checked_add(size).filter(|&end| end <= total) else {
            return Err(ReassemblyInconsistency::OutOfBounds { offset, size, total });
        };
        match self.v1.partial.get(&identifier) {
            Some(slot) if slot.partial.buffer.len() as u64 != total => {
                return Err(ReassemblyInconsistency::TotalSizeMismatch {
                    expected: slot.partial.buffer.len() as u64,
                    got: total,
                });
            }
            Some(_) => {}
            None if total > MAX_REASSEMBLY_SIZE => return Err(ReassemblyInconsistency::TooLarge(total)),
            None => {
                let evicted = self.v1.open(
                    identifier,
                    V1Partial {
                        first: message.clone(),
                        buffer: vec![0; total as usize],
                        ranges: Vec::new(),
                        received: 0,
                    },
                );
                self.note_eviction(evicted);
            }
        }
        let Some(slot) = self.v1.partial.get_mut(&identifier) else {
            return Ok(());
        };
        let partial = &mut slot.partial;
        let start = offset as usize;
        partial.buffer[start..start + size as usize].copy_from_slice(message.payload());
        partial.received += mark_received(&mut partial.ranges, offset, end);
        if offset == 0 {
            partial.first = message.clone();
        }
        Ok(())
    }

    fn buffer_v2(&mut self, message: Message) {
        let Header::V2(h) = message.header() else { return };
        let tf = h.tf_combination;
        if h.message_size == 0 || (tf == TfCombination::FIRST && h.data_remaining == 0) || tf.is_data() {
            self.v2.ready.push_back(message);
            return;
        }
        let key = h.identifier.wrapping_add(h.message_size);
        let (remaining, package_number) = (h.data_remaining, h.package_number);

        if tf == TfCombination::FIRST {
            let evicted = self.v2.open(
                key,
                V2Partial {
                    payload: message.payload().to_vec(),
                    first: message,
                    package_number,
                },
            );
            self.note_eviction(evicted);
            return;
        }

        let mut slot = match self.v2.partial.remove(&h.identifier) {
            Some(slot) if tf.is_empty() && slot.partial.package_number == package_number => slot,
            other => {
                if let Some(slot) = other {
                    self.v2.partial.insert(h.identifier, slot);
                }
                self.passed_through += 1;
                debug!(identifier = h.identifier, package_number, "no reassembly slot, passing fragment through");
                self.v2.ready.push_back(message);
                return;
            }
        };

        slot.partial.payload.extend_from_slice(message.payload());
        if remaining == 0 {
            let mut whole = slot.partial.first;
            whole.update_header(|h| {
                if let Header::V2(h) = h {
                    h.data_remaining = 0;
                }
            });
            whole.set_payload(slot.partial.payload);
            debug!(identifier = whole.identifier(), "reassembled message");
            self.v2.ready.push_back(whole);
        } else {
            // Re-keyed under the next expected identifier; keeps its age.
            self.v2.partial.insert(key, slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::OperationCode;

    fn v1_message(len: usize) -> Message {
        let mut m = Message::new(ProtocolVersion::V1);
        m.update_header(|h| h.set_identifier(10));
        m.set_payload((0..len).map(|i| (i % 251) as u8).collect());
        m
    }

    fn v2_message(len: usize) -> Message {
        let mut m = Message::new(ProtocolVersion::V2);
        m.update_header(|h| {
            if let Header::V2(h) = h {
                h.identifier = 5000;
                h.operation_code = OperationCode::RAK;
                h.tf_combination = TfCombination::FIRST;
                h.package_number = 9;
            }
        });
        m.set_payload((0..len).map(|i| (i % 13) as u8).collect());
        m
    }

    #[test]
    fn whole_v1_message_is_ready() {
        let mut pool = MessagePool::new();
        pool.buffer(v1_message(100));
        assert!(pool.message_available(ProtocolVersion::V1));
        assert!(!pool.message_available(ProtocolVersion::V2));
        assert_eq!(pool.dequeue(ProtocolVersion::V1).unwrap().payload().len(), 100);
        assert!(pool.dequeue(ProtocolVersion::V1).is_none());
    }

    #[test]
    fn v1_split_reassembles() {
        let original = v1_message(4096);
        let mut pool = MessagePool::new();
        let parts = original.split(1202);
        let first_ack_key = parts[0].expected_ack_key();
        for p in parts {
            pool.buffer(p);
        }
        let whole = pool.dequeue(ProtocolVersion::V1).unwrap();
        assert_eq!(whole.payload(), original.payload());
        assert_eq!(whole.offset(), 0);
        assert_eq!(whole.header().message_size(), 4096);
        assert_eq!(whole.expected_ack_key(), first_ack_key);
        assert_eq!(pool.pending_reassemblies(), 0);
    }

    #[test]
    fn v1_data_flag_skips_reassembly() {
        let mut m = v1_message(100);
        m.update_header(|h| {
            if let Header::V1(h) = h {
                h.flags = V1Flags::FILE_DATA;
                h.total_size = 5000;
            }
        });
        let mut pool = MessagePool::new();
        pool.buffer(m);
        assert!(pool.message_available(ProtocolVersion::V1));
    }

    #[test]
    fn v1_overflow_is_dropped() {
        let original = v1_message(3000);
        let parts = original.split(1202);
        let mut pool = MessagePool::new();
        pool.buffer(parts[0].clone());

        let mut bad = parts[2].clone();
        bad.update_header(|h| {
            if let Header::V1(h) = h {
                h.offset = 2900;
            }
        });
        pool.buffer(bad);
        assert_eq!(pool.dropped_fragments(), 1);

        let mut wrong_total = parts[1].clone();
        wrong_total.update_header(|h| {
            if let Header::V1(h) = h {
                h.total_size = 2999;
            }
        });
        pool.buffer(wrong_total);
        assert_eq!(pool.dropped_fragments(), 2);

        pool.buffer(parts[1].clone());
        pool.buffer(parts[2].clone());
        let whole = pool.dequeue(ProtocolVersion::V1).unwrap();
        assert_eq!(whole.payload(), original.payload());
    }

    #[test]
    fn repeated_fragment_counts_once() {
        let original = v1_message(3000);
        let parts = original.split(1202);
        let mut pool = MessagePool::new();
        pool.buffer(parts[0].clone());
        pool.buffer(parts[0].clone());
        pool.buffer(parts[1].clone());
        // 1202 + 1202 + 1202 would reach 3000 if the repeat were counted.
        assert!(!pool.message_available(ProtocolVersion::V1));
        assert_eq!(pool.pending_reassemblies(), 1);

        pool.buffer(parts[2].clone());
        let whole = pool.dequeue(ProtocolVersion::V1).unwrap();
        assert_eq!(whole.payload(), original.payload());
    }

    #[test]
    fn overlapping_ranges_merge() {
        let mut ranges = Vec::new();
        assert_eq!(mark_received(&mut ranges, 10, 20), 10);
        assert_eq!(mark_received(&mut ranges, 30, 40), 10);
        assert_eq!(mark_received(&mut ranges, 15, 35), 10);
        assert_eq!(ranges, vec![(10, 40)]);
        assert_eq!(mark_received(&mut ranges, 0, 10), 10);
        assert_eq!(mark_received(&mut ranges, 5, 25), 0);
        assert_eq!(ranges, vec![(0, 40)]);
    }

    #[test]
    fn oldest_reassembly_is_evicted_at_capacity() {
        let mut pool = MessagePool::new();
        let mut firsts = Vec::new();
        for id in 0..=MAX_PENDING_REASSEMBLIES as u32 {
            let mut m = v1_message(3000);
            m.update_header(|h| h.set_identifier(100 + id));
            firsts.push(m.split(1202));
        }
        for parts in &firsts {
            pool.buffer(parts[0].clone());
        }
        assert_eq!(pool.pending_reassemblies(), MAX_PENDING_REASSEMBLIES);
        assert_eq!(pool.evicted_reassemblies(), 1);

        // The evicted identifier starts over; the newest still completes.
        let newest = firsts.last().unwrap();
        pool.buffer(newest[1].clone());
        pool.buffer(newest[2].clone());
        assert_eq!(pool.dequeue(ProtocolVersion::V1).unwrap().identifier(), 100 + MAX_PENDING_REASSEMBLIES as u32);

        pool.buffer(firsts[0][1].clone());
        pool.buffer(firsts[0][2].clone());
        assert!(!pool.message_available(ProtocolVersion::V1));
    }

    #[test]
    fn v2_reassembly_keeps_its_age_when_rekeyed() {
        let mut pool = MessagePool::new();
        let old = v2_message(3000).split(1202);
        pool.buffer(old[0].clone());
        for id in 1..MAX_PENDING_REASSEMBLIES as u32 {
            let mut m = v2_message(3000);
            m.update_header(|h| h.set_identifier(100_000 * id));
            pool.buffer(m.split(1202)[0].clone());
        }
        // Progress on the oldest does not make it the newest.
        pool.buffer(old[1].clone());
        let mut extra = v2_message(3000);
        extra.update_header(|h| h.set_identifier(90_000_000));
        pool.buffer(extra.split(1202)[0].clone());
        assert_eq!(pool.evicted_reassemblies(), 1);
        pool.buffer(old[2].clone());
        assert_eq!(pool.passed_through(), 1);
    }

    #[test]
    fn clear_discards_pending_and_ready() {
        let mut pool = MessagePool::new();
        pool.buffer(v1_message(100));
        pool.buffer(v1_message(3000).split(1202)[0].clone());
        pool.buffer(v2_message(3000).split(1202)[0].clone());
        assert_eq!(pool.pending_reassemblies(), 2);
        pool.clear();
        assert_eq!(pool.pending_reassemblies(), 0);
        assert!(pool.dequeue(ProtocolVersion::V1).is_none());
    }

    #[test]
    fn v2_split_reassembles() {
        let original = v2_message(3000);
        let parts = original.split(1202);
        assert_eq!(parts.len(), 3);
        let mut pool = MessagePool::new();
        for p in parts {
            pool.buffer(p);
        }
        let whole = pool.dequeue(ProtocolVersion::V2).unwrap();
        assert!(pool.dequeue(ProtocolVersion::V2).is_none());
        assert_eq!(whole.payload(), original.payload());
        assert_eq!(whole.data_remaining(), 0);
        assert_eq!(whole.identifier(), 5000);
        assert_eq!(whole.header(), original.header());
        assert_eq!(pool.passed_through(), 0);
    }

    #[test]
    fn v2_package_mismatch_passes_through() {
        let parts = v2_message(3000).split(1202);
        let mut pool = MessagePool::new();
        pool.buffer(parts[0].clone());
        let mut stray = parts[1].clone();
        stray.update_header(|h| {
            if let Header::V2(h) = h {
                h.package_number = 1;
            }
        });
        pool.buffer(stray);
        assert_eq!(pool.passed_through(), 1);
        assert!(pool.message_available(ProtocolVersion::V2));
        assert_eq!(pool.pending_reassemblies(), 1);

        pool.dequeue(ProtocolVersion::V2);
        pool.buffer(parts[1].clone());
        pool.buffer(parts[2].clone());
        assert_eq!(pool.dequeue(ProtocolVersion::V2).unwrap().payload().len(), 3000);
    }

    #[test]
    fn v2_unknown_continuation_passes_through() {
        let parts = v2_message(3000).split(1202);
        let mut pool = MessagePool::new();
        pool.buffer(parts[2].clone());
        assert_eq!(pool.passed_through(), 1);
        assert_eq!(pool.dequeue(ProtocolVersion::V2).unwrap(), parts[2]);
    }
}
