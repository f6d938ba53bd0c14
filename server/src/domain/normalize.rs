//! Inbound telemetry normalization
//!
//! Converts heterogeneous telemetry (OTLP metric/trace exports, JSONL agent
//! log lines) into canonical [`MetricRecord`]s. Classification happens up
//! front; each payload kind has a fixed decoder. Rejection is per record, so
//! a batch with one bad data point still yields the good ones.

use chrono::{DateTime, Utc};
use opentelemetry_proto::tonic::collector::metrics::v1::ExportMetricsServiceRequest;
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{AnyValue, KeyValue, any_value};
use opentelemetry_proto::tonic::metrics::v1::{metric, number_data_point};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::core::constants::metric_names;
use crate::store::{AttrValue, MetricCategory, MetricRecord};
use crate::utils::time::{nanos_to_datetime, parse_iso_timestamp};

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),
}

/// Result of normalizing one batch: the usable records plus how many inputs
/// were dropped (unknown kind or failed numeric coercion)
#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub records: Vec<MetricRecord>,
    pub dropped: usize,
}

impl NormalizedBatch {
    /// Total data points the batch attempted to carry
    pub fn attempted(&self) -> usize {
        self.records.len() + self.dropped
    }

    fn drop_one(&mut self) {
        self.dropped += 1;
    }
}

// =============================================================================
// OTLP metrics
// =============================================================================

/// Map metric names to record categories. Prefix names contribute the suffix
/// as an `event` attribute.
fn classify_metric(name: &str) -> Option<(MetricCategory, Option<(&'static str, String)>)> {
    match name {
        metric_names::TOKENS => Some((MetricCategory::TokenUsage, None)),
        metric_names::CONTEXT_TOKENS => Some((
            MetricCategory::TokenUsage,
            Some(("kind", "context".to_string())),
        )),
        metric_names::COST_USD => Some((MetricCategory::Cost, None)),
        metric_names::RUN_DURATION_MS => Some((
            MetricCategory::SessionEvent,
            Some(("event", "run".to_string())),
        )),
        _ => {
            if let Some(suffix) = name.strip_prefix(metric_names::MESSAGE_PREFIX) {
                Some((MetricCategory::SessionEvent, Some(("event", suffix.to_string()))))
            } else if let Some(suffix) = name.strip_prefix(metric_names::CRON_PREFIX) {
                Some((MetricCategory::CronEvent, Some(("event", suffix.to_string()))))
            } else {
                name.strip_prefix(metric_names::HEALTH_PREFIX).map(|suffix| {
                    (MetricCategory::HealthSample, Some(("probe", suffix.to_string())))
                })
            }
        }
    }
}

/// Normalize an OTLP metrics export into canonical records
pub fn normalize_metrics(request: &ExportMetricsServiceRequest) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();

    for resource in &request.resource_metrics {
        for scope in &resource.scope_metrics {
            for m in &scope.metrics {
                let Some((category, extra_attr)) = classify_metric(&m.name) else {
                    tracing::warn!(metric = %m.name, "Unknown metric name dropped");
                    batch.drop_one();
                    continue;
                };

                let points = match &m.data {
                    Some(metric::Data::Gauge(g)) => &g.data_points,
                    Some(metric::Data::Sum(s)) => &s.data_points,
                    other => {
                        tracing::warn!(
                            metric = %m.name,
                            kind = if other.is_some() { "unsupported" } else { "missing" },
                            "Unsupported metric data kind dropped"
                        );
                        batch.drop_one();
                        continue;
                    }
                };

                for point in points {
                    let value = match point.value {
                        Some(number_data_point::Value::AsDouble(v)) => v,
                        Some(number_data_point::Value::AsInt(v)) => v as f64,
                        None => {
                            tracing::warn!(metric = %m.name, "Data point without value dropped");
                            batch.drop_one();
                            continue;
                        }
                    };
                    if !value.is_finite() {
                        tracing::warn!(metric = %m.name, "Non-finite data point dropped");
                        batch.drop_one();
                        continue;
                    }

                    let mut record = MetricRecord::new(
                        category,
                        nanos_to_datetime(point.time_unix_nano),
                        value,
                    );
                    for (key, attr) in convert_attributes(&point.attributes) {
                        record = record.with_attr(key, attr);
                    }
                    if let Some((key, val)) = &extra_attr {
                        record = record.with_attr(*key, val.clone());
                    }
                    batch.records.push(record);
                }
            }
        }
    }

    batch
}

// =============================================================================
// OTLP traces
// =============================================================================

/// Normalize an OTLP trace export. Spans named after agent runs or
/// completions become session events carrying the span duration; cron spans
/// become cron events. Everything else is dropped.
pub fn normalize_traces(request: &ExportTraceServiceRequest) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();

    for resource in &request.resource_spans {
        for scope in &resource.scope_spans {
            for span in &scope.spans {
                let lower = span.name.to_lowercase();
                let (category, event) = if lower.contains("run") || lower.contains("completion") {
                    (MetricCategory::SessionEvent, "run")
                } else if lower.contains("message") {
                    (MetricCategory::SessionEvent, "message")
                } else if lower.contains("cron") {
                    (MetricCategory::CronEvent, "fired")
                } else {
                    tracing::debug!(span = %span.name, "Span not mapped to any category");
                    batch.drop_one();
                    continue;
                };

                let duration_ms =
                    span.end_time_unix_nano.saturating_sub(span.start_time_unix_nano) as f64
                        / 1_000_000.0;

                let mut record = MetricRecord::new(
                    category,
                    nanos_to_datetime(span.end_time_unix_nano),
                    duration_ms,
                )
                .with_attr("event", event)
                .with_attr("span", span.name.clone());
                for (key, attr) in convert_attributes(&span.attributes) {
                    record = record.with_attr(key, attr);
                }
                batch.records.push(record);
            }
        }
    }

    batch
}

fn convert_attributes(attrs: &[KeyValue]) -> Vec<(String, AttrValue)> {
    attrs
        .iter()
        .filter_map(|kv| {
            kv.value
                .as_ref()
                .map(|v| (kv.key.clone(), any_value_to_attr(v)))
        })
        .collect()
}

fn any_value_to_attr(value: &AnyValue) -> AttrValue {
    match &value.value {
        Some(any_value::Value::StringValue(s)) => AttrValue::Str(s.clone()),
        Some(any_value::Value::BoolValue(b)) => AttrValue::Bool(*b),
        Some(any_value::Value::IntValue(i)) => AttrValue::Int(*i),
        Some(any_value::Value::DoubleValue(d)) => AttrValue::Float(*d),
        Some(any_value::Value::BytesValue(b)) => AttrValue::Str(hex::encode(b)),
        // Nested shapes are flattened to their JSON text form
        Some(other) => AttrValue::Str(
            serde_json::to_string(&AnyValue {
                value: Some(other.clone()),
            })
            .unwrap_or_default(),
        ),
        None => AttrValue::Str(String::new()),
    }
}

// =============================================================================
// Log-line fallback
// =============================================================================

/// Normalize one JSONL line from the agent's own log file.
///
/// The line must be a JSON object; anything else is `MalformedPayload`. A
/// well-formed object with no recognized numeric field normalizes to zero
/// records (dropped with a warning, never an error).
pub fn normalize_log_line(line: &str) -> Result<Vec<MetricRecord>, NormalizeError> {
    let value: JsonValue = serde_json::from_str(line.trim())
        .map_err(|e| NormalizeError::MalformedPayload(e.to_string()))?;
    let obj = value
        .as_object()
        .ok_or_else(|| NormalizeError::MalformedPayload("expected a JSON object".to_string()))?;

    let timestamp = obj
        .get("timestamp")
        .and_then(|v| v.as_str())
        .and_then(parse_iso_timestamp)
        .unwrap_or_else(Utc::now);

    let model = obj.get("model").and_then(|v| v.as_str());

    let mut records = Vec::new();
    let mut push = |category: MetricCategory, value: f64, ts: DateTime<Utc>| {
        let mut record = MetricRecord::new(category, ts, value);
        if let Some(model) = model {
            record = record.with_attr("model", model);
        }
        records.push(record);
    };

    for (field, category) in [
        ("tokens", MetricCategory::TokenUsage),
        ("cost_usd", MetricCategory::Cost),
        ("duration_ms", MetricCategory::SessionEvent),
    ] {
        if let Some(v) = obj.get(field) {
            match v.as_f64() {
                Some(n) if n.is_finite() => push(category, n, timestamp),
                _ => {
                    tracing::warn!(field, "Non-numeric log field dropped");
                }
            }
        }
    }

    if records.is_empty() {
        tracing::warn!("Log line carried no recognized telemetry fields");
    }
    Ok(records)
}
