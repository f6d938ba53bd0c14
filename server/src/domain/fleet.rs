//! Fleet aggregation
//!
//! Accepts metric batches pushed by remote collector nodes so one instance
//! can present a combined view. Submissions are authenticated with a shared
//! key, attributed to the submitting node, deduplicated by record identity,
//! and sanity-checked against the local clock.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::core::constants::{FLEET_MAX_CLOCK_SKEW_SECS, LOCAL_NODE_ID};
use crate::store::{MetricRecord, MetricStore};
use crate::utils::crypto::constant_time_eq;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("Invalid fleet key")]
    Unauthorized,
    #[error("Node '{0}' is not registered")]
    UnknownNode(String),
    #[error("Report timestamp is {0}s ahead of local time, max is {FLEET_MAX_CLOCK_SKEW_SECS}s")]
    ClockSkew(i64),
    #[error("Fleet aggregation is not enabled")]
    Disabled,
}

/// One batch pushed by a remote node
#[derive(Debug, Clone, Deserialize)]
pub struct NodeReport {
    pub node_id: String,
    pub reported_at: DateTime<Utc>,
    pub records: Vec<MetricRecord>,
}

/// Per-record accounting for a processed report
#[derive(Debug, Default, Serialize, PartialEq)]
pub struct SubmitOutcome {
    pub stored: usize,
    pub duplicates: usize,
    pub rejected: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub registered_at: DateTime<Utc>,
    pub last_report_at: Option<DateTime<Utc>>,
    pub records_stored: u64,
}

/// Collects reports from remote nodes into the shared store
pub struct FleetAggregator {
    store: Arc<MetricStore>,
    shared_key: Option<String>,
    allowlist: Option<Vec<String>>,
    nodes: DashMap<String, NodeInfo>,
}

impl FleetAggregator {
    pub fn new(
        store: Arc<MetricStore>,
        shared_key: Option<String>,
        allowlist: Option<Vec<String>>,
    ) -> Self {
        Self {
            store,
            shared_key,
            allowlist,
            nodes: DashMap::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.shared_key.is_some()
    }

    fn check_key(&self, presented: &str) -> Result<(), FleetError> {
        let expected = self.shared_key.as_deref().ok_or(FleetError::Disabled)?;
        if constant_time_eq(presented, expected) {
            Ok(())
        } else {
            Err(FleetError::Unauthorized)
        }
    }

    /// Register a node by name. Idempotent: re-registering keeps the
    /// existing entry. Returns a registration token for the caller's logs.
    pub fn register(&self, key: &str, node_id: &str) -> Result<Uuid, FleetError> {
        self.check_key(key)?;
        self.nodes
            .entry(node_id.to_string())
            .or_insert_with(|| NodeInfo {
                node_id: node_id.to_string(),
                registered_at: Utc::now(),
                last_report_at: None,
                records_stored: 0,
            });
        let token = Uuid::new_v4();
        tracing::info!(node = node_id, %token, "Fleet node registered");
        Ok(token)
    }

    fn node_allowed(&self, node_id: &str) -> bool {
        if let Some(allow) = &self.allowlist {
            return allow.iter().any(|n| n == node_id);
        }
        self.nodes.contains_key(node_id)
    }

    /// Ingest one node report. Records are re-attributed to the reporting
    /// node, deduplicated against the store, and dropped individually when
    /// their timestamps sit ahead of the local clock beyond the skew bound.
    pub fn submit(&self, key: &str, report: NodeReport) -> Result<SubmitOutcome, FleetError> {
        self.check_key(key)?;
        if report.node_id.is_empty() || report.node_id == LOCAL_NODE_ID {
            return Err(FleetError::UnknownNode(report.node_id));
        }
        if !self.node_allowed(&report.node_id) {
            return Err(FleetError::UnknownNode(report.node_id));
        }

        // Only a fast clock is fatal for the whole report; a node retrying a
        // delayed batch reports a past timestamp and must still get through
        let now = Utc::now();
        let skew = (report.reported_at - now).num_seconds();
        if skew > FLEET_MAX_CLOCK_SKEW_SECS {
            return Err(FleetError::ClockSkew(skew));
        }

        let future_cutoff = now + Duration::seconds(FLEET_MAX_CLOCK_SKEW_SECS);
        let mut outcome = SubmitOutcome::default();
        for mut record in report.records {
            if record.timestamp > future_cutoff {
                tracing::warn!(
                    node = %report.node_id,
                    timestamp = %record.timestamp,
                    "Record from the future rejected"
                );
                outcome.rejected += 1;
                continue;
            }
            record.source_node_id = report.node_id.clone();
            match self.store.append_if_new(record) {
                Ok(true) => outcome.stored += 1,
                Ok(false) => outcome.duplicates += 1,
                Err(e) => {
                    tracing::warn!(node = %report.node_id, error = %e, "Record rejected");
                    outcome.rejected += 1;
                }
            }
        }

        if let Some(mut node) = self.nodes.get_mut(&report.node_id) {
            node.last_report_at = Some(now);
            node.records_stored += outcome.stored as u64;
        } else {
            // Allow-listed node that never called register
            self.nodes.insert(
                report.node_id.clone(),
                NodeInfo {
                    node_id: report.node_id.clone(),
                    registered_at: now,
                    last_report_at: Some(now),
                    records_stored: outcome.stored as u64,
                },
            );
        }

        tracing::debug!(
            node = %report.node_id,
            stored = outcome.stored,
            duplicates = outcome.duplicates,
            rejected = outcome.rejected,
            "Fleet report processed"
        );
        Ok(outcome)
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        let mut nodes: Vec<NodeInfo> = self.nodes.iter().map(|e| e.value().clone()).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::LiveHub;
    use crate::store::MetricCategory;

    const KEY: &str = "fleet-secret";

    fn aggregator(allowlist: Option<Vec<String>>) -> FleetAggregator {
        let store = Arc::new(MetricStore::new(100, 14, Arc::new(LiveHub::new(16))));
        FleetAggregator::new(store, Some(KEY.to_string()), allowlist)
    }

    fn report(node_id: &str, records: Vec<MetricRecord>) -> NodeReport {
        NodeReport {
            node_id: node_id.to_string(),
            reported_at: Utc::now(),
            records,
        }
    }

    fn record(value: f64) -> MetricRecord {
        MetricRecord::new(MetricCategory::Cost, Utc::now(), value).with_attr("model", "opus")
    }

    #[test]
    fn test_register_then_submit() {
        let agg = aggregator(None);
        agg.register(KEY, "worker-1").unwrap();
        let outcome = agg
            .submit(KEY, report("worker-1", vec![record(1.0), record(2.0)]))
            .unwrap();
        assert_eq!(outcome.stored, 2);
        assert_eq!(outcome.rejected, 0);

        let nodes = agg.nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].records_stored, 2);
        assert!(nodes[0].last_report_at.is_some());
    }

    #[test]
    fn test_wrong_key_rejected() {
        let agg = aggregator(None);
        agg.register(KEY, "worker-1").unwrap();
        let err = agg
            .submit("wrong", report("worker-1", vec![record(1.0)]))
            .unwrap_err();
        assert!(matches!(err, FleetError::Unauthorized));
    }

    #[test]
    fn test_unregistered_node_rejected() {
        let agg = aggregator(None);
        let err = agg
            .submit(KEY, report("stranger", vec![record(1.0)]))
            .unwrap_err();
        assert!(matches!(err, FleetError::UnknownNode(_)));
    }

    #[test]
    fn test_allowlisted_node_needs_no_registration() {
        let agg = aggregator(Some(vec!["worker-2".to_string()]));
        let outcome = agg
            .submit(KEY, report("worker-2", vec![record(1.0)]))
            .unwrap();
        assert_eq!(outcome.stored, 1);
        assert_eq!(agg.nodes().len(), 1);
    }

    #[test]
    fn test_allowlist_excludes_other_nodes() {
        let agg = aggregator(Some(vec!["worker-2".to_string()]));
        agg.register(KEY, "worker-1").unwrap();
        let err = agg
            .submit(KEY, report("worker-1", vec![record(1.0)]))
            .unwrap_err();
        assert!(matches!(err, FleetError::UnknownNode(_)));
    }

    #[test]
    fn test_identical_records_from_two_nodes_both_kept() {
        let agg = aggregator(None);
        agg.register(KEY, "worker-1").unwrap();
        agg.register(KEY, "worker-2").unwrap();

        let ts = Utc::now();
        let shared = MetricRecord::new(MetricCategory::Cost, ts, 1.0).with_attr("model", "opus");
        let a = agg.submit(KEY, report("worker-1", vec![shared.clone()])).unwrap();
        let b = agg.submit(KEY, report("worker-2", vec![shared])).unwrap();
        // Node id is part of record identity, so these are distinct records
        assert_eq!(a.stored, 1);
        assert_eq!(b.stored, 1);
    }

    #[test]
    fn test_resubmitted_report_deduplicated() {
        let agg = aggregator(None);
        agg.register(KEY, "worker-1").unwrap();

        let ts = Utc::now();
        let r = MetricRecord::new(MetricCategory::Cost, ts, 1.0).with_attr("model", "opus");
        let first = agg.submit(KEY, report("worker-1", vec![r.clone()])).unwrap();
        let second = agg.submit(KEY, report("worker-1", vec![r])).unwrap();
        assert_eq!(first.stored, 1);
        assert_eq!(second.stored, 0);
        assert_eq!(second.duplicates, 1);
    }

    #[test]
    fn test_fast_clock_report_rejected_whole() {
        let agg = aggregator(None);
        agg.register(KEY, "worker-1").unwrap();
        let mut rep = report("worker-1", vec![record(1.0)]);
        rep.reported_at = Utc::now() + Duration::seconds(FLEET_MAX_CLOCK_SKEW_SECS + 60);
        let err = agg.submit(KEY, rep).unwrap_err();
        assert!(matches!(err, FleetError::ClockSkew(_)));
    }

    #[test]
    fn test_delayed_report_still_accepted() {
        let agg = aggregator(None);
        agg.register(KEY, "worker-1").unwrap();
        // A node flushing a backlog reports well in the past; only a fast
        // clock rejects the whole batch
        let mut rep = report("worker-1", vec![record(1.0)]);
        rep.reported_at = Utc::now() - Duration::minutes(30);
        let outcome = agg.submit(KEY, rep).unwrap();
        assert_eq!(outcome.stored, 1);
        assert_eq!(outcome.rejected, 0);
    }

    #[test]
    fn test_future_record_skipped_individually() {
        let agg = aggregator(None);
        agg.register(KEY, "worker-1").unwrap();
        let mut far = record(1.0);
        far.timestamp = Utc::now() + Duration::hours(2);
        let outcome = agg
            .submit(KEY, report("worker-1", vec![far, record(2.0)]))
            .unwrap();
        assert_eq!(outcome.stored, 1);
        assert_eq!(outcome.rejected, 1);
    }

    #[test]
    fn test_local_node_id_refused() {
        let agg = aggregator(None);
        let err = agg
            .submit(KEY, report(LOCAL_NODE_ID, vec![record(1.0)]))
            .unwrap_err();
        assert!(matches!(err, FleetError::UnknownNode(_)));
    }

    #[test]
    fn test_disabled_without_key() {
        let store = Arc::new(MetricStore::new(100, 14, Arc::new(LiveHub::new(16))));
        let agg = FleetAggregator::new(store, None, None);
        assert!(!agg.enabled());
        let err = agg.register("anything", "worker-1").unwrap_err();
        assert!(matches!(err, FleetError::Disabled));
    }
}
