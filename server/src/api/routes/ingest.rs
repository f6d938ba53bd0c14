//! OTLP ingestion endpoints
//!
//! POST /v1/metrics and /v1/traces in either protobuf or JSON encoding.
//! Batches are normalized into canonical records; a payload that decodes
//! but yields nothing usable is a 400, partial batches are accepted with
//! a partial_success count.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderName, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use opentelemetry_proto::tonic::collector::metrics::v1::{
    ExportMetricsPartialSuccess, ExportMetricsServiceRequest, ExportMetricsServiceResponse,
};
use opentelemetry_proto::tonic::collector::trace::v1::{
    ExportTracePartialSuccess, ExportTraceServiceRequest, ExportTraceServiceResponse,
};

use super::encoding::{OtlpContentType, accepted_response, decode_request};
use crate::core::constants::INGEST_RETRY_AFTER_SECS;
use crate::domain::budget::UpstreamControl;
use crate::domain::normalize::{NormalizedBatch, normalize_metrics, normalize_traces};
use crate::store::MetricStore;

/// Ingestion on/off switch, flipped by the budget monitor's pause-upstream
/// action. Stays paused until the budget config is replaced or the server
/// restarts.
#[derive(Default)]
pub struct IngestGate {
    paused: AtomicBool,
}

impl IngestGate {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::Relaxed) {
            tracing::info!("Ingestion resumed");
        }
    }
}

impl UpstreamControl for IngestGate {
    fn pause(&self) -> anyhow::Result<()> {
        self.paused.store(true, Ordering::Relaxed);
        tracing::warn!("Ingestion paused by budget monitor");
        Ok(())
    }
}

#[derive(Clone)]
pub struct IngestState {
    pub store: Arc<MetricStore>,
    pub gate: Arc<IngestGate>,
}

pub fn routes(store: Arc<MetricStore>, gate: Arc<IngestGate>) -> Router<()> {
    Router::new()
        .route("/metrics", post(export_metrics))
        .route("/traces", post(export_traces))
        .with_state(IngestState { store, gate })
}

fn paused_response() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        [(
            HeaderName::from_static("retry-after"),
            INGEST_RETRY_AFTER_SECS.to_string(),
        )],
        "Ingestion is paused",
    )
        .into_response()
}

fn unusable_batch_response() -> Response {
    (
        StatusCode::BAD_REQUEST,
        [(header::CONTENT_TYPE, "text/plain")],
        "No usable records in payload",
    )
        .into_response()
}

/// Store a normalized batch, folding store rejections into the dropped count
fn store_batch(store: &MetricStore, batch: NormalizedBatch) -> (usize, usize) {
    let mut stored = 0;
    let mut rejected = batch.dropped;
    for record in batch.records {
        match store.append(record) {
            Ok(()) => stored += 1,
            Err(e) => {
                tracing::warn!(error = %e, "Record rejected by store");
                rejected += 1;
            }
        }
    }
    (stored, rejected)
}

pub async fn export_metrics(
    State(state): State<IngestState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if state.gate.is_paused() {
        return paused_response();
    }

    let content_type = OtlpContentType::from_headers(&headers);
    let request: ExportMetricsServiceRequest = match decode_request(&body, content_type) {
        Ok(req) => req,
        Err(e) => return e.into_response(content_type),
    };

    let batch = normalize_metrics(&request);
    let attempted = batch.attempted();
    let (stored, rejected) = store_batch(&state.store, batch);
    if attempted > 0 && stored == 0 {
        return unusable_batch_response();
    }

    tracing::debug!(stored, rejected, "Metrics batch ingested");
    let response = ExportMetricsServiceResponse {
        partial_success: (rejected > 0).then(|| ExportMetricsPartialSuccess {
            rejected_data_points: rejected as i64,
            error_message: "some data points were not recognized".to_string(),
        }),
    };
    accepted_response(&response, content_type)
}

pub async fn export_traces(
    State(state): State<IngestState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if state.gate.is_paused() {
        return paused_response();
    }

    let content_type = OtlpContentType::from_headers(&headers);
    let request: ExportTraceServiceRequest = match decode_request(&body, content_type) {
        Ok(req) => req,
        Err(e) => return e.into_response(content_type),
    };

    let batch = normalize_traces(&request);
    let attempted = batch.attempted();
    let (stored, rejected) = store_batch(&state.store, batch);
    if attempted > 0 && stored == 0 {
        return unusable_batch_response();
    }

    tracing::debug!(stored, rejected, "Trace batch ingested");
    let response = ExportTraceServiceResponse {
        partial_success: (rejected > 0).then(|| ExportTracePartialSuccess {
            rejected_spans: rejected as i64,
            error_message: "some spans were not recognized".to_string(),
        }),
    };
    accepted_response(&response, content_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::metric_names;
    use crate::live::LiveHub;
    use crate::store::{MetricCategory, RecordFilter, TimeRange};
    use opentelemetry_proto::tonic::metrics::v1::{
        Gauge, Metric, NumberDataPoint, ResourceMetrics, ScopeMetrics, metric, number_data_point,
    };
    use prost::Message;

    fn state() -> IngestState {
        IngestState {
            store: Arc::new(MetricStore::new(100, 14, Arc::new(LiveHub::new(16)))),
            gate: Arc::new(IngestGate::default()),
        }
    }

    fn now_nanos() -> u64 {
        chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0) as u64
    }

    fn tokens_request(value: i64) -> ExportMetricsServiceRequest {
        ExportMetricsServiceRequest {
            resource_metrics: vec![ResourceMetrics {
                resource: None,
                scope_metrics: vec![ScopeMetrics {
                    scope: None,
                    metrics: vec![Metric {
                        name: metric_names::TOKENS.to_string(),
                        description: String::new(),
                        unit: String::new(),
                        metadata: vec![],
                        data: Some(metric::Data::Gauge(Gauge {
                            data_points: vec![NumberDataPoint {
                                attributes: vec![],
                                start_time_unix_nano: 0,
                                time_unix_nano: now_nanos(),
                                exemplars: vec![],
                                flags: 0,
                                value: Some(number_data_point::Value::AsInt(value)),
                            }],
                        })),
                    }],
                    schema_url: String::new(),
                }],
                schema_url: String::new(),
            }],
        }
    }

    #[tokio::test]
    async fn test_metrics_batch_accepted() {
        let state = state();
        let body = Bytes::from(tokens_request(42).encode_to_vec());
        let resp = export_metrics(State(state.clone()), HeaderMap::new(), body).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let stored = state.store.query(
            MetricCategory::TokenUsage,
            TimeRange::all(),
            &RecordFilter::default(),
        );
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].value, 42.0);
    }

    #[tokio::test]
    async fn test_undecodable_body_is_bad_request() {
        let resp = export_metrics(
            State(state()),
            HeaderMap::new(),
            Bytes::from("garbage bytes"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_batch_with_nothing_usable_is_bad_request() {
        let mut request = tokens_request(1);
        request.resource_metrics[0].scope_metrics[0].metrics[0].name =
            "unrelated.metric".to_string();
        let body = Bytes::from(request.encode_to_vec());
        let resp = export_metrics(State(state()), HeaderMap::new(), body).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_empty_batch_accepted() {
        let body = Bytes::from(
            ExportMetricsServiceRequest {
                resource_metrics: vec![],
            }
            .encode_to_vec(),
        );
        let resp = export_metrics(State(state()), HeaderMap::new(), body).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_paused_gate_returns_503() {
        let state = state();
        state.gate.pause().unwrap();
        let body = Bytes::from(tokens_request(1).encode_to_vec());
        let resp = export_metrics(State(state.clone()), HeaderMap::new(), body).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(resp.headers().contains_key("retry-after"));

        state.gate.resume();
        let body = Bytes::from(tokens_request(1).encode_to_vec());
        let resp = export_metrics(State(state), HeaderMap::new(), body).await;
        assert_eq!(resp.status(), StatusCode::ACCEPTED);
    }
}
