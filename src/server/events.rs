//! WebSocket event feed.
//!
//! Streams the aggregate pipeline event bus to subscribers as JSON
//! envelopes. A `types` query parameter narrows the feed to a
//! comma-separated set of event types.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::broadcast;

use crate::state::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct EventsQuery {
    types: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> impl IntoResponse {
    let filter: Option<HashSet<String>> = query.types.map(|raw| {
        raw.split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect()
    });
    ws.on_upgrade(move |socket| stream_events(socket, state, filter))
}

async fn stream_events(socket: WebSocket, state: Arc<AppState>, filter: Option<HashSet<String>>) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = state.pipelines.events().subscribe();

    // Drain client frames so close handshakes are honoured.
    let mut client_closed = tokio::spawn(async move {
        while let Some(Ok(message)) = receiver.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    loop {
        tokio::select! {
            _ = &mut client_closed => break,
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(filter) = &filter {
                        if !filter.contains(event.kind.as_str()) {
                            continue;
                        }
                    }
                    let Ok(payload) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if sender.send(Message::Text(payload)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Event feed lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}
