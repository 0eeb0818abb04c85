//! Server-Sent Events gateway
//!
//! Each connection owns one bus subscription. It first receives the current
//! snapshot of every category, then live events. Frames are named after the
//! event category, carry the bus sequence number as `id` and a JSON body
//! `{data, timestamp}`. The subscription is released when the client goes
//! away and axum drops the stream.

use crate::api::ApiState;
use crate::bus::Subscription;

use axum::extract::State;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use futures::Stream;
use modelhost_core::Event;
use std::convert::Infallible;
use tracing::{debug, warn};

/// `GET /events`
pub async fn events(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let subscription = state.bus.subscribe();
    debug!(
        "SSE client connected ({} subscribers)",
        state.bus.subscriber_count()
    );

    let keep_alive = KeepAlive::new()
        .interval(state.keep_alive)
        .text("keep-alive");
    Sse::new(event_stream(subscription)).keep_alive(keep_alive)
}

fn event_stream(mut subscription: Subscription) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    async_stream::stream! {
        while let Some(event) = subscription.recv().await {
            match encode(&event) {
                Ok(frame) => yield Ok(frame),
                Err(e) => warn!("Dropping unencodable {} event {}: {}", event.category(), event.seq, e),
            }
        }
    }
}

fn encode(event: &Event) -> modelhost_core::Result<SseEvent> {
    let wire = event.to_wire()?;
    SseEvent::default()
        .event(event.category().as_str())
        .id(event.seq.to_string())
        .json_data(wire)
        .map_err(|e| modelhost_core::Error::internal(format!("SSE encoding failed: {}", e)))
}
