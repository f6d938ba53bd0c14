//! Bounded in-memory time-series store
//!
//! Single source of truth for current telemetry state. All mutation goes
//! through [`MetricStore::append`]; everything else is a read view. The one
//! critical section (eviction + insert, or snapshot copy) is short and does
//! no I/O; live fan-out happens after the lock is released.

pub mod record;
mod series;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use crate::live::LiveHub;
pub use record::{AttrValue, MetricCategory, MetricRecord, RecordError, RecordIdentity};
use series::Series;

/// Half-open time window `[start, end)`; `None` means unbounded on that side
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn since(start: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self {
            start: Some(start),
            end: Some(end),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        if let Some(start) = self.start
            && ts < start
        {
            return false;
        }
        if let Some(end) = self.end
            && ts >= end
        {
            return false;
        }
        true
    }
}

/// Record predicate for queries
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    pub source_node_id: Option<String>,
    /// Attribute equality on canonical string form
    pub attr: Option<(String, String)>,
}

impl RecordFilter {
    pub fn matches(&self, record: &MetricRecord) -> bool {
        if let Some(ref node) = self.source_node_id
            && &record.source_node_id != node
        {
            return false;
        }
        if let Some((ref key, ref want)) = self.attr {
            match record.attr_str(key) {
                Some(ref have) if have == want => {}
                _ => return false,
            }
        }
        true
    }
}

/// Aggregation bucketing
#[derive(Debug, Clone)]
pub enum GroupBy {
    /// Single bucket named "total"
    Total,
    /// One bucket per UTC day, keyed `YYYY-MM-DD`
    Day,
    /// One bucket per canonical value of the named attribute; records without
    /// the attribute land in "unknown"
    Attribute(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct AggregateBucket {
    pub count: u64,
    pub sum: f64,
}

pub type AggregateMap = BTreeMap<String, AggregateBucket>;

/// The store. One bounded series per category behind a single short lock.
pub struct MetricStore {
    inner: RwLock<[Series; 5]>,
    hub: Arc<LiveHub>,
    capacity: usize,
    retention_days: i64,
    /// Epoch micros of the last accepted record, 0 = never
    last_received: AtomicI64,
}

impl MetricStore {
    pub fn new(capacity: usize, retention_days: i64, hub: Arc<LiveHub>) -> Self {
        Self {
            inner: RwLock::new(Self::empty_series(capacity, retention_days)),
            hub,
            capacity,
            retention_days,
            last_received: AtomicI64::new(0),
        }
    }

    fn empty_series(capacity: usize, retention_days: i64) -> [Series; 5] {
        std::array::from_fn(|_| Series::new(capacity, retention_days))
    }

    /// Append one record: the single mutation entry point.
    ///
    /// Never fails on capacity; eviction absorbs it. Fails only when the
    /// record itself is structurally invalid. Live subscribers are notified
    /// after the lock is released.
    pub fn append(&self, record: MetricRecord) -> Result<(), RecordError> {
        record.validate()?;
        {
            let mut inner = self.inner.write();
            inner[record.category.index()].insert(record.clone());
        }
        self.mark_received();
        self.hub.publish(record);
        Ok(())
    }

    /// Identity-deduplicated append, used by the fleet path.
    ///
    /// Returns `false` (without error or storage) when an identical record is
    /// already present, making duplicate submissions idempotent.
    pub fn append_if_new(&self, record: MetricRecord) -> Result<bool, RecordError> {
        record.validate()?;
        let identity = record.identity();
        {
            let mut inner = self.inner.write();
            let series = &mut inner[record.category.index()];
            if series.contains_identity(&identity) {
                return Ok(false);
            }
            series.insert(record.clone());
        }
        self.mark_received();
        self.hub.publish(record);
        Ok(true)
    }

    /// Snapshot of records matching the range and filter, consistent at the
    /// moment of the call (copy-on-read)
    pub fn query(
        &self,
        category: MetricCategory,
        range: TimeRange,
        filter: &RecordFilter,
    ) -> Vec<MetricRecord> {
        let inner = self.inner.read();
        inner[category.index()]
            .iter()
            .filter(|r| range.contains(r.timestamp) && filter.matches(r))
            .cloned()
            .collect()
    }

    /// The most recent records of a category, newest last
    pub fn tail(&self, category: MetricCategory, limit: usize) -> Vec<MetricRecord> {
        let inner = self.inner.read();
        let series = &inner[category.index()];
        let skip = series.len().saturating_sub(limit);
        series.iter().skip(skip).cloned().collect()
    }

    /// Sum/count aggregation over a category
    pub fn aggregate(
        &self,
        category: MetricCategory,
        range: TimeRange,
        group_by: GroupBy,
    ) -> AggregateMap {
        let inner = self.inner.read();
        let mut out = AggregateMap::new();
        for record in inner[category.index()].iter() {
            if !range.contains(record.timestamp) {
                continue;
            }
            let key = match &group_by {
                GroupBy::Total => "total".to_string(),
                GroupBy::Day => record.timestamp.format("%Y-%m-%d").to_string(),
                GroupBy::Attribute(attr) => record
                    .attr_str(attr)
                    .unwrap_or_else(|| "unknown".to_string()),
            };
            let bucket = out.entry(key).or_default();
            bucket.count += 1;
            bucket.sum += record.value;
        }
        out
    }

    /// Convenience: summed value over the range
    pub fn sum(&self, category: MetricCategory, range: TimeRange) -> f64 {
        self.aggregate(category, range, GroupBy::Total)
            .get("total")
            .map(|b| b.sum)
            .unwrap_or(0.0)
    }

    pub fn len(&self, category: MetricCategory) -> usize {
        self.inner.read()[category.index()].len()
    }

    pub fn total_len(&self) -> usize {
        let inner = self.inner.read();
        inner.iter().map(Series::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().iter().all(Series::is_empty)
    }

    /// Consistent full copy for persistence, taken under the same short lock
    /// used for appends. Serialization happens outside.
    pub fn snapshot(&self) -> Vec<(MetricCategory, Vec<MetricRecord>)> {
        let inner = self.inner.read();
        MetricCategory::ALL
            .iter()
            .map(|&c| (c, inner[c.index()].iter().cloned().collect()))
            .collect()
    }

    /// Rebuild series from persisted records. Bounds are re-enforced on the
    /// way in, so an oversized or stale snapshot self-repairs.
    pub fn restore(&self, records: Vec<MetricRecord>) {
        let mut restored = 0usize;
        let mut skipped = 0usize;
        {
            let mut inner = self.inner.write();
            *inner = Self::empty_series(self.capacity, self.retention_days);
            for record in records {
                if record.validate().is_ok() {
                    inner[record.category.index()].insert(record);
                    restored += 1;
                } else {
                    skipped += 1;
                }
            }
        }
        if skipped > 0 {
            tracing::warn!(restored, skipped, "Skipped invalid records during restore");
        }
    }

    fn mark_received(&self) {
        self.last_received
            .store(Utc::now().timestamp_micros(), Ordering::Relaxed);
    }

    /// When the last record was accepted, if ever
    pub fn last_received(&self) -> Option<DateTime<Utc>> {
        match self.last_received.load(Ordering::Relaxed) {
            0 => None,
            micros => DateTime::from_timestamp_micros(micros),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> MetricStore {
        MetricStore::new(100, 14, Arc::new(LiveHub::new(16)))
    }

    fn cost(offset_secs: i64, value: f64) -> MetricRecord {
        MetricRecord::new(
            MetricCategory::Cost,
            Utc::now() - Duration::seconds(offset_secs),
            value,
        )
    }

    #[test]
    fn test_append_and_query() {
        let store = store();
        store.append(cost(30, 1.0)).unwrap();
        store.append(cost(10, 2.0)).unwrap();
        let all = store.query(MetricCategory::Cost, TimeRange::all(), &RecordFilter::default());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].value, 1.0);
        assert_eq!(all[1].value, 2.0);
    }

    #[test]
    fn test_append_rejects_invalid_record() {
        let store = store();
        let err = store.append(cost(0, f64::INFINITY)).unwrap_err();
        assert!(matches!(err, RecordError::InvalidRecord(_)));
        assert!(store.is_empty());
    }

    #[test]
    fn test_capacity_never_exceeded() {
        let hub = Arc::new(LiveHub::new(16));
        let store = MetricStore::new(10, 14, hub);
        for i in 0..50 {
            store.append(cost(100 - i, 1.0)).unwrap();
            assert!(store.len(MetricCategory::Cost) <= 10);
        }
    }

    #[test]
    fn test_append_if_new_is_idempotent() {
        let store = store();
        let rec = cost(10, 4.2).with_source("node-1");
        assert!(store.append_if_new(rec.clone()).unwrap());
        assert!(!store.append_if_new(rec).unwrap());
        assert_eq!(store.len(MetricCategory::Cost), 1);
    }

    #[test]
    fn test_query_filters_by_node_and_attr() {
        let store = store();
        store
            .append(cost(30, 1.0).with_source("a").with_attr("model", "opus"))
            .unwrap();
        store
            .append(cost(20, 2.0).with_source("b").with_attr("model", "opus"))
            .unwrap();
        store
            .append(cost(10, 3.0).with_source("a").with_attr("model", "sonnet"))
            .unwrap();

        let filter = RecordFilter {
            source_node_id: Some("a".to_string()),
            attr: Some(("model".to_string(), "opus".to_string())),
        };
        let hits = store.query(MetricCategory::Cost, TimeRange::all(), &filter);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].value, 1.0);
    }

    #[test]
    fn test_aggregate_total_and_by_attribute() {
        let store = store();
        store.append(cost(30, 1.0).with_attr("model", "opus")).unwrap();
        store.append(cost(20, 2.0).with_attr("model", "opus")).unwrap();
        store.append(cost(10, 3.0)).unwrap();

        let total = store.sum(MetricCategory::Cost, TimeRange::all());
        assert!((total - 6.0).abs() < 1e-9);

        let by_model = store.aggregate(
            MetricCategory::Cost,
            TimeRange::all(),
            GroupBy::Attribute("model".to_string()),
        );
        assert_eq!(by_model["opus"].count, 2);
        assert!((by_model["opus"].sum - 3.0).abs() < 1e-9);
        assert_eq!(by_model["unknown"].count, 1);
    }

    #[test]
    fn test_aggregate_by_day_buckets() {
        let store = store();
        let now = Utc::now();
        store.append(MetricRecord::new(MetricCategory::Cost, now, 1.0)).unwrap();
        store
            .append(MetricRecord::new(
                MetricCategory::Cost,
                now - Duration::seconds(5),
                2.0,
            ))
            .unwrap();
        let by_day = store.aggregate(MetricCategory::Cost, TimeRange::all(), GroupBy::Day);
        let today = now.format("%Y-%m-%d").to_string();
        // Both records land within the last five seconds; at worst they split
        // across a midnight boundary but the totals still sum to 3.0
        let sum: f64 = by_day.values().map(|b| b.sum).sum();
        assert!((sum - 3.0).abs() < 1e-9);
        assert!(by_day.contains_key(&today));
    }

    #[test]
    fn test_time_range_bounds_are_half_open() {
        let store = store();
        let now = Utc::now();
        store
            .append(MetricRecord::new(MetricCategory::Cost, now, 1.0))
            .unwrap();
        let range = TimeRange::between(now, now);
        assert!(store.query(MetricCategory::Cost, range, &RecordFilter::default()).is_empty());
        let range = TimeRange::between(now, now + Duration::seconds(1));
        assert_eq!(
            store.query(MetricCategory::Cost, range, &RecordFilter::default()).len(),
            1
        );
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let store = store();
        store.append(cost(30, 1.0).with_attr("model", "opus")).unwrap();
        store
            .append(
                MetricRecord::new(
                    MetricCategory::TokenUsage,
                    Utc::now() - Duration::seconds(10),
                    128.0,
                )
                .with_attr("model", "opus"),
            )
            .unwrap();

        let snapshot = store.snapshot();
        let records: Vec<MetricRecord> = snapshot.into_iter().flat_map(|(_, recs)| recs).collect();

        let other = self::store();
        other.restore(records);
        assert_eq!(other.len(MetricCategory::Cost), 1);
        assert_eq!(other.len(MetricCategory::TokenUsage), 1);
        assert_eq!(
            other.tail(MetricCategory::Cost, 10),
            store.tail(MetricCategory::Cost, 10)
        );
    }

    #[test]
    fn test_concurrent_append_and_query() {
        let store = Arc::new(store());
        let mut handles = Vec::new();
        for t in 0..4 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    store.append(cost(60, (t * 100 + i) as f64)).unwrap();
                    let seen =
                        store.query(MetricCategory::Cost, TimeRange::all(), &RecordFilter::default());
                    assert!(seen.len() <= 100);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(store.len(MetricCategory::Cost), 100);
    }
}
