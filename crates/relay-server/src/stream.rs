//! Per-connection stream multiplexer.
//!
//! One instance serves one connection for its whole life, merging three
//! event sources into a single ordered SSE output: the outbound queue, the
//! idle-timeout heartbeat, and the queue-closed signal. The peer-disconnect
//! case is the stream being dropped by the transport, which the drop guard
//! turns into a registry close.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::response::sse::Event;
use futures::stream::Stream;
use futures::StreamExt;
use relay_core::{ConnectionId, SseMessage};
use tokio::sync::mpsc;
use tracing::debug;

use crate::connections::ConnectionRegistry;

/// Closes the registry entry when the stream is dropped, however it ends.
/// Closing is idempotent, so the normal queue-closed exit is a no-op here.
struct CloseOnDrop {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
}

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        debug!(connection_id = %self.id, "stream ended");
        self.registry.close(&self.id);
    }
}

struct StreamState {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
    client_id: String,
    rx: mpsc::Receiver<SseMessage>,
    idle_timeout: Duration,
    greeted: bool,
    _close: CloseOnDrop,
}

/// The multiplexer as a message stream. Emits the `connected` greeting
/// first, then whichever of queued-message / idle-heartbeat resolves first,
/// and ends when the queue is closed.
fn message_stream(
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
    client_id: String,
    rx: mpsc::Receiver<SseMessage>,
    idle_timeout: Duration,
) -> impl Stream<Item = SseMessage> {
    let state = StreamState {
        _close: CloseOnDrop {
            registry: Arc::clone(&registry),
            id: id.clone(),
        },
        registry,
        id,
        client_id,
        rx,
        idle_timeout,
        greeted: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        if !state.greeted {
            state.greeted = true;
            let greeting = SseMessage::connected(&state.id, &state.client_id);
            return Some((greeting, state));
        }

        match tokio::time::timeout(state.idle_timeout, state.rx.recv()).await {
            Ok(Some(message)) => {
                state.registry.touch(&state.id);
                Some((message, state))
            }
            // Queue closed: the registry already tore this connection down.
            Ok(None) => None,
            // Nothing emitted for a full idle window.
            Err(_) => Some((SseMessage::heartbeat(), state)),
        }
    })
}

/// SSE-ready view of the multiplexer for the HTTP layer.
pub fn connection_stream(
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
    client_id: String,
    rx: mpsc::Receiver<SseMessage>,
    idle_timeout: Duration,
) -> impl Stream<Item = Result<Event, Infallible>> {
    message_stream(registry, id, client_id, rx, idle_timeout).map(|message| Ok(to_event(&message)))
}

fn to_event(message: &SseMessage) -> Event {
    let mut event = Event::default();
    if let Some(id) = &message.id {
        event = event.id(id);
    }
    if let Some(name) = &message.event {
        event = event.event(name);
    }
    if let Some(retry) = message.retry_ms {
        event = event.retry(Duration::from_millis(retry));
    }
    event.data(serde_json::to_string(&message.data).unwrap_or_else(|_| "null".into()))
}
