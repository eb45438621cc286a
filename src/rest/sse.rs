// rest/sse.rs — SSE bridge over the stream gateway.
//
// GET /api/v1/requests/{id}/events
//
// Opens a gateway stream for the request id and forwards its events as
// Server-Sent Events. Axum drops the stream when the client disconnects,
// which drops the broker subscription with it — delivery-side cancellation
// only; the task itself keeps running.

use axum::{
    extract::{Path, State},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse,
    },
};
use futures_util::stream;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use crate::AppContext;

pub async fn request_events_sse(
    State(ctx): State<Arc<AppContext>>,
    Path(request_id): Path<String>,
) -> impl IntoResponse {
    let events = ctx.gateway.open(&request_id);

    let s = stream::unfold(events, move |mut events| async move {
        let event = events.next_event().await?;
        let sse_event = Event::default()
            .event(event.name())
            .data(serde_json::to_string(&event).unwrap_or_default());
        Some((Ok::<Event, Infallible>(sse_event), events))
    });

    Sse::new(s).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}
