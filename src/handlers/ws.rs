//! Hub socket endpoint. One task per connection drives three sources:
//! inbound frames, outbound hub events and server shutdown.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;

use crate::middleware::auth::{bearer_token, AuthError};
use crate::models::events::{ClientEvent, ServerEvent};
use crate::models::position::Identity;
use crate::services::AppState;

#[derive(Deserialize)]
pub struct ConnectQuery {
    pub token: Option<String>,
}

pub async fn upgrade(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ConnectQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, AuthError> {
    let token = query
        .token
        .as_deref()
        .or_else(|| bearer_token(&headers))
        .ok_or(AuthError::Missing)?;
    let identity = state.verifier.verify(token).await.map_err(|e| {
        tracing::warn!(error = %e, "hub connection refused");
        e
    })?;

    Ok(ws
        .on_upgrade(move |socket| handle_socket(state, identity, socket))
        .into_response())
}

async fn handle_socket(state: Arc<AppState>, identity: Identity, socket: WebSocket) {
    let mut connection = state.hub.connect(identity);
    let conn_id = connection.id;
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            inbound = stream.next() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::debug!(%conn_id, error = %e, "socket read failed");
                        break;
                    }
                };
                let reply = match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => {
                        let name = event.name();
                        match state.hub.dispatch(conn_id, event).await {
                            Ok(()) => None,
                            Err(e) => {
                                tracing::warn!(%conn_id, event = name, error = %e, "event rejected");
                                Some(ServerEvent::Error { message: e.to_string() })
                            }
                        }
                    }
                    Err(e) => Some(ServerEvent::Error {
                        message: format!("malformed event: {}", e),
                    }),
                };
                if let Some(reply) = reply {
                    if send(&mut sink, &reply).await.is_err() {
                        break;
                    }
                }
            }
            outbound = connection.outbound.recv() => {
                let Some(event) = outbound else { break };
                if send(&mut sink, &event).await.is_err() {
                    break;
                }
            }
            _ = state.shutdown.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
        }
    }

    state.hub.disconnect(conn_id);
}

async fn send<S>(sink: &mut S, event: &ServerEvent) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let frame = serde_json::to_string(event).map_err(|e| {
        tracing::error!(error = %e, "server event not serializable");
    })?;
    sink.send(Message::Text(frame)).await.map_err(|_| ())
}
