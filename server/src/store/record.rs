//! Canonical telemetry record types
//!
//! Every inbound telemetry fact, whatever its source, is normalized into one
//! immutable [`MetricRecord`] before it reaches the store.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::constants::LOCAL_NODE_ID;

/// Telemetry category. Each category backs one bounded series in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetricCategory {
    TokenUsage,
    Cost,
    SessionEvent,
    CronEvent,
    HealthSample,
}

impl MetricCategory {
    pub const ALL: [MetricCategory; 5] = [
        MetricCategory::TokenUsage,
        MetricCategory::Cost,
        MetricCategory::SessionEvent,
        MetricCategory::CronEvent,
        MetricCategory::HealthSample,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricCategory::TokenUsage => "token-usage",
            MetricCategory::Cost => "cost",
            MetricCategory::SessionEvent => "session-event",
            MetricCategory::CronEvent => "cron-event",
            MetricCategory::HealthSample => "health-sample",
        }
    }

    /// Stable index into per-category storage
    pub const fn index(&self) -> usize {
        match self {
            MetricCategory::TokenUsage => 0,
            MetricCategory::Cost => 1,
            MetricCategory::SessionEvent => 2,
            MetricCategory::CronEvent => 3,
            MetricCategory::HealthSample => 4,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.as_str() == s)
    }
}

impl fmt::Display for MetricCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Scalar attribute value. Attributes never nest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl AttrValue {
    /// Canonical string form, used for grouping and identity hashing
    pub fn canonical(&self) -> String {
        match self {
            AttrValue::Bool(b) => b.to_string(),
            AttrValue::Int(i) => i.to_string(),
            AttrValue::Float(f) => format!("{:?}", f),
            AttrValue::Str(s) => s.clone(),
        }
    }

}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Str(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Str(s)
    }
}

impl From<i64> for AttrValue {
    fn from(i: i64) -> Self {
        AttrValue::Int(i)
    }
}

impl From<f64> for AttrValue {
    fn from(f: f64) -> Self {
        AttrValue::Float(f)
    }
}

/// Content identity of a record, used for fleet deduplication.
/// Derived from (category, timestamp, source node, attributes).
pub type RecordIdentity = [u8; 32];

/// One observed telemetry fact. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub category: MetricCategory,
    pub timestamp: DateTime<Utc>,
    pub source_node_id: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, AttrValue>,
    pub value: f64,
}

/// Structural validation failure for a single record
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RecordError {
    #[error("invalid record: {0}")]
    InvalidRecord(&'static str),
}

impl MetricRecord {
    /// Create a record attributed to the local agent
    pub fn new(category: MetricCategory, timestamp: DateTime<Utc>, value: f64) -> Self {
        Self {
            category,
            timestamp,
            source_node_id: LOCAL_NODE_ID.to_string(),
            attributes: BTreeMap::new(),
            value,
        }
    }

    pub fn with_source(mut self, node_id: impl Into<String>) -> Self {
        self.source_node_id = node_id.into();
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Structural validation performed by the store before insertion
    pub fn validate(&self) -> Result<(), RecordError> {
        if !self.value.is_finite() {
            return Err(RecordError::InvalidRecord("value must be finite"));
        }
        if self.source_node_id.is_empty() {
            return Err(RecordError::InvalidRecord("source_node_id must not be empty"));
        }
        if self.timestamp.timestamp_micros() < 0 {
            return Err(RecordError::InvalidRecord("timestamp predates the epoch"));
        }
        if self.attributes.keys().any(|k| k.is_empty()) {
            return Err(RecordError::InvalidRecord("attribute keys must not be empty"));
        }
        Ok(())
    }

    /// Content identity for deduplication.
    ///
    /// The value is intentionally excluded: two reports of the same fact may
    /// disagree on rounding, and the first accepted value wins.
    pub fn identity(&self) -> RecordIdentity {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.category.as_str().as_bytes());
        hasher.update(&self.timestamp.timestamp_micros().to_le_bytes());
        hasher.update(self.source_node_id.as_bytes());
        for (key, value) in &self.attributes {
            hasher.update(&(key.len() as u64).to_le_bytes());
            hasher.update(key.as_bytes());
            let canonical = value.canonical();
            hasher.update(&(canonical.len() as u64).to_le_bytes());
            hasher.update(canonical.as_bytes());
        }
        *hasher.finalize().as_bytes()
    }

    /// Attribute value in canonical string form, if present
    pub fn attr_str(&self, key: &str) -> Option<String> {
        self.attributes.get(key).map(AttrValue::canonical)
    }
}
