use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;

use crate::state::AppState;

/// `GET /api/events/stream`: the dashboard's SSE feed.
///
/// Each subscriber pulls from its own bounded buffer; the keep-alive comment
/// holds NAT and proxy connections open. The response terminates on the
/// first failed write to the client.
pub async fn events_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let subscription = state.broadcaster.subscribe();
    tracing::debug!(subscribers = state.broadcaster.subscriber_count(), "sse client attached");

    let stream = futures::stream::unfold(subscription, |mut subscription| async move {
        let message = subscription.next().await?;
        let event = Event::default()
            .event(message.kind)
            .data(message.payload.to_string());
        Some((Ok(event), subscription))
    });

    let heartbeat = Duration::from_secs(state.config.sse.heartbeat_interval_seconds.max(1));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(heartbeat).text("heartbeat"))
}
