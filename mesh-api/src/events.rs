//! Server-sent event stream of registry events.

use std::convert::Infallible;

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::Stream;
use tracing::debug;

use mesh_cluster::registry::EventFilter;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    /// Restrict the stream to one service.
    #[serde(default)]
    pub service: Option<String>,
    /// Comma-separated event types (`registered,status_changed,...`).
    #[serde(default)]
    pub types: Option<String>,
}

/// GET /events
///
/// Each SSE message carries the JSON-encoded registry event; the SSE event
/// name mirrors the `type` tag. The subscription (and its bounded queue)
/// ends when the client disconnects.
pub async fn stream(
    State(state): State<AppState>,
    Query(query): Query<EventQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let mut filter = EventFilter {
        service: query.service,
        ..EventFilter::default()
    };
    if let Some(types) = query.types {
        filter.event_types = types
            .split(',')
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToString::to_string)
            .collect();
    }

    let subscription = state.registry.subscribe(filter);
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<Event, Infallible>>(64);

    tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            let Ok(payload) = serde_json::to_string(&event) else {
                continue;
            };
            let sse_event = Event::default().event(event.event_type()).data(payload);
            if tx.send(Ok(sse_event)).await.is_err() {
                debug!("SSE client disconnected, dropping subscription");
                return;
            }
        }
    });

    Sse::new(ReceiverStream::new(rx)).keep_alive(KeepAlive::default())
}
