//! Live metric stream over Server-Sent Events.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::routing::get;
use axum::Router;
use futures::Stream;
use serde::Deserialize;
use tokio::sync::watch;

use crate::core::constants::{STREAM_KEEP_ALIVE_SECS, STREAM_MAX_BACKFILL};
use crate::live::{LiveHub, StreamEnd};
use crate::store::{MetricCategory, MetricRecord, MetricStore};

#[derive(Clone)]
pub struct StreamState {
    pub store: Arc<MetricStore>,
    pub hub: Arc<LiveHub>,
    pub shutdown_rx: watch::Receiver<bool>,
}

pub fn routes(
    store: Arc<MetricStore>,
    hub: Arc<LiveHub>,
    shutdown_rx: watch::Receiver<bool>,
) -> Router<()> {
    let state = StreamState {
        store,
        hub,
        shutdown_rx,
    };
    Router::new()
        .route("/stream", get(stream_records))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    /// Number of recent records to replay before going live.
    pub backfill: Option<usize>,
    /// Restrict the stream to a single category.
    pub category: Option<String>,
}

/// Most recent records across all categories, oldest first.
fn collect_backfill(
    store: &MetricStore,
    category: Option<MetricCategory>,
    limit: usize,
) -> Vec<MetricRecord> {
    let limit = limit.min(STREAM_MAX_BACKFILL);
    if limit == 0 {
        return Vec::new();
    }
    let mut records = match category {
        Some(cat) => store.tail(cat, limit),
        None => {
            let mut all: Vec<MetricRecord> = MetricCategory::ALL
                .iter()
                .flat_map(|cat| store.tail(*cat, limit))
                .collect();
            all.sort_by_key(|r| r.timestamp);
            all
        }
    };
    if records.len() > limit {
        records.drain(..records.len() - limit);
    }
    records
}

fn record_event(record: &MetricRecord) -> Event {
    match serde_json::to_string(record) {
        Ok(data) => Event::default().event("record").data(data),
        Err(e) => {
            tracing::error!("Failed to serialize record for stream: {}", e);
            Event::default().event("error").data("serialization failed")
        }
    }
}

/// GET /api/v1/stream - live feed of accepted records as SSE.
///
/// The subscription is taken before the backfill snapshot so records
/// published in between are delivered rather than lost.
pub async fn stream_records(
    State(state): State<StreamState>,
    Query(params): Query<StreamParams>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut subscription = state.hub.subscribe();
    let category = params
        .category
        .as_deref()
        .and_then(MetricCategory::parse);
    let backfill = collect_backfill(&state.store, category, params.backfill.unwrap_or(0));
    let mut shutdown_rx = state.shutdown_rx.clone();

    tracing::debug!(
        subscriber = %subscription.id(),
        backfill = backfill.len(),
        "Live stream connected"
    );

    let stream = async_stream::stream! {
        for record in &backfill {
            yield Ok(record_event(record));
        }

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        yield Ok(Event::default().event("terminate").data("shutdown"));
                        break;
                    }
                }
                result = subscription.next() => match result {
                    Ok(record) => {
                        let matches = category.is_none_or(|cat| record.category == cat);
                        if matches {
                            yield Ok(record_event(&record));
                        }
                    }
                    Err(StreamEnd::MaxDurationReached) => {
                        yield Ok(Event::default().event("terminate").data("max-duration"));
                        break;
                    }
                    Err(StreamEnd::SubscriberTimeout) => {
                        yield Ok(Event::default().event("terminate").data("subscriber-timeout"));
                        break;
                    }
                    Err(StreamEnd::HubClosed) => {
                        break;
                    }
                },
            }
        }
    };

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(STREAM_KEEP_ALIVE_SECS))
            .text("keep-alive"),
    )
}
