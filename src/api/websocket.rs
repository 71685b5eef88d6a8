//! WebSocket transport for the live event relay
//!
//! `GET /v2/socket?channels=transactions,blocks` upgrades to a WebSocket that
//! receives one text frame per decoded event on the selected channels. Each
//! connection is one registry subscriber; its bounded queue is drained into
//! the socket by a dedicated send task.

use super::handlers::AppState;
use crate::feed::{ChannelSet, SubscriberHandle};
use axum::{
    extract::{
        ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::{borrow::Cow, sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// Interval between keep-alive pings
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Query parameters of the socket endpoint
#[derive(Debug, Default, Deserialize)]
pub struct LiveQuery {
    /// Comma separated channel names; all channels when absent
    #[serde(default)]
    pub channels: Option<String>,
}

impl LiveQuery {
    fn channel_set(&self) -> ChannelSet {
        self.channels
            .as_deref()
            .and_then(ChannelSet::parse_list)
            .unwrap_or_default()
    }
}

/// GET /v2/socket
pub async fn live_socket_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<LiveQuery>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let channels = query.channel_set();
    ws.on_upgrade(move |socket| handle_connection(socket, state, channels))
}

async fn handle_connection(mut socket: WebSocket, state: Arc<AppState>, channels: ChannelSet) {
    let (handle, mut queue) = match state.registry.register(channels) {
        Ok(registered) => registered,
        Err(e) => {
            warn!(error = %e, "Refusing live subscriber");
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code: close_code::AGAIN,
                    reason: Cow::Owned(e.to_string()),
                })))
                .await;
            return;
        }
    };

    info!(
        "🔌 Live subscriber {} connected (total: {})",
        handle,
        state.registry.count()
    );

    let (mut sender, mut receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;
        loop {
            tokio::select! {
                message = queue.recv() => {
                    let Some(message) = message else { break };
                    if sender.send(Message::Text(message.to_string())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let mut receive_task = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!(error = %e, "Live socket read error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => receive_task.abort(),
        _ = &mut receive_task => send_task.abort(),
    }

    disconnect(&state, handle);
}

fn disconnect(state: &AppState, handle: SubscriberHandle) {
    state.registry.unregister(handle);
    info!(
        "🔌 Live subscriber {} disconnected (remaining: {})",
        handle,
        state.registry.count()
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::LiveChannel;

    #[test]
    fn test_query_defaults_to_all_channels() {
        assert_eq!(LiveQuery::default().channel_set(), ChannelSet::all());
        let query = LiveQuery {
            channels: Some("nonsense".into()),
        };
        assert_eq!(query.channel_set(), ChannelSet::all());
    }

    #[test]
    fn test_query_selects_channels() {
        let query = LiveQuery {
            channels: Some("blocks".into()),
        };
        assert_eq!(query.channel_set(), ChannelSet::only(LiveChannel::Blocks));
    }
}
