//! WebSocket signaling endpoint
//!
//! Frames are JSON text in both directions. Outbound events are queued on a
//! bounded channel drained by a writer task, so a slow client only loses its
//! own events.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use confab_sfu::SignalingChannel;
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info};

use super::{AppState, TrustedUser};
use crate::session::SignalingSession;

pub async fn websocket_handler(
    State(state): State<AppState>,
    user: TrustedUser,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(state.signaling.max_message_size)
        .on_upgrade(move |socket| handle_socket(socket, state, user))
}

async fn handle_socket(socket: WebSocket, state: AppState, user: TrustedUser) {
    let connection_id = nanoid::nanoid!(12);
    info!(
        connection_id = %connection_id,
        participant_id = %user.id,
        "WebSocket connection established"
    );

    let (channel, mut events) =
        SignalingChannel::pair(user.id.clone(), state.signaling.channel_capacity);
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!(event = event.name(), error = %e, "Failed to encode signaling event");
                    continue;
                }
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!(error = %e, "Failed to send WebSocket message");
                break;
            }
        }
    });

    let mut session = SignalingSession::new(state.sfu, user.user_info, channel);
    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if !session.handle_text(text.as_str()).await {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(Message::Binary(_)) => {
                debug!(connection_id = %connection_id, "Ignoring binary frame");
            }
            Ok(_) => {}
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "WebSocket receive error");
                break;
            }
        }
    }

    session.disconnect().await;
    writer.abort();

    info!(
        connection_id = %connection_id,
        participant_id = %user.id,
        "WebSocket connection closed"
    );
}
