//! Bounded per-category record ring
//!
//! A `Series` holds the ordered history for one category. It is bounded both
//! by record count and by age; eviction happens inside the same mutation that
//! inserts, so a series never exceeds its bounds after any call returns.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use rustc_hash::FxHashMap;

use super::record::{MetricRecord, RecordIdentity};

pub struct Series {
    capacity: usize,
    retention: Duration,
    records: VecDeque<MetricRecord>,
    /// Refcounted identity index for fleet deduplication. Counts, not a set:
    /// the plain append path may legitimately insert identical records.
    identities: FxHashMap<RecordIdentity, u32>,
}

impl Series {
    pub fn new(capacity: usize, retention_days: i64) -> Self {
        Self {
            capacity: capacity.max(1),
            retention: Duration::days(retention_days.max(1)),
            records: VecDeque::new(),
            identities: FxHashMap::default(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &MetricRecord> {
        self.records.iter()
    }

    pub fn contains_identity(&self, identity: &RecordIdentity) -> bool {
        self.identities.contains_key(identity)
    }

    /// Insert a record keeping timestamp order (ties keep insertion order),
    /// then evict until both the capacity and retention bounds hold.
    pub fn insert(&mut self, record: MetricRecord) {
        *self.identities.entry(record.identity()).or_insert(0) += 1;

        let pos = self
            .records
            .partition_point(|r| r.timestamp <= record.timestamp);
        if pos == self.records.len() {
            self.records.push_back(record);
        } else {
            self.records.insert(pos, record);
        }

        self.evict(Utc::now());
    }

    /// Evict oldest-first until bounds hold
    fn evict(&mut self, now: DateTime<Utc>) {
        let cutoff = now - self.retention;
        while let Some(front) = self.records.front() {
            if self.records.len() > self.capacity || front.timestamp < cutoff {
                let evicted = self.records.pop_front().expect("front checked");
                self.remove_identity(&evicted.identity());
            } else {
                break;
            }
        }
    }

    fn remove_identity(&mut self, identity: &RecordIdentity) {
        if let Some(count) = self.identities.get_mut(identity) {
            *count -= 1;
            if *count == 0 {
                self.identities.remove(identity);
            }
        }
    }
}
