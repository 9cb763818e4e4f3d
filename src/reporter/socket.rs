//! Primary channel: `position-update` frames over the hub websocket.
//!
//! The socket is opened on the first send and reopened on the first send
//! after it drops. A send while it is closed answers `Offline` so the
//! reporter queues the sample instead of waiting.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::queue::DeliveryError;
use super::PositionSink;
use crate::models::events::{ClientEvent, ServerEvent};
use crate::models::position::PositionReport;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct Link {
    writer: SplitSink<Socket, Message>,
    /// Cleared by the reader once the hub closes the socket.
    open: Arc<AtomicBool>,
}

pub struct SocketSink {
    url: String,
    token: String,
    connect_timeout: Duration,
    link: Mutex<Option<Link>>,
    inbound: Option<mpsc::Sender<ServerEvent>>,
}

impl SocketSink {
    /// `ws_url` is the hub endpoint, e.g. `ws://host:8080/ws`.
    pub fn new(ws_url: &str, token: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: ws_url.to_string(),
            token: token.into(),
            connect_timeout,
            link: Mutex::new(None),
            inbound: None,
        }
    }

    /// Events pushed by the hub (reassignments, error replies) are forwarded
    /// here. Without a receiver they are read and discarded.
    pub fn with_inbound(mut self, inbound: mpsc::Sender<ServerEvent>) -> Self {
        self.inbound = Some(inbound);
        self
    }

    pub async fn is_connected(&self) -> bool {
        self.link
            .lock()
            .await
            .as_ref()
            .map_or(false, |link| link.open.load(Ordering::Acquire))
    }

    /// Sends a close frame and forgets the socket.
    pub async fn close(&self) {
        if let Some(mut link) = self.link.lock().await.take() {
            if let Err(e) = link.writer.close().await {
                tracing::debug!(error = %e, "position socket close failed");
            }
        }
    }

    async fn connect(&self) -> Result<Link, DeliveryError> {
        let url = format!("{}?token={}", self.url, self.token);
        let socket = match tokio::time::timeout(self.connect_timeout, connect_async(url.as_str())).await {
            Ok(Ok((socket, _))) => socket,
            Ok(Err(WsError::Http(response))) => {
                return Err(DeliveryError::Rejected {
                    status: response.status().as_u16(),
                    message: "socket upgrade refused".to_string(),
                });
            }
            Ok(Err(e)) => {
                tracing::debug!(url = %self.url, error = %e, "position socket unavailable");
                return Err(DeliveryError::Offline);
            }
            Err(_) => {
                tracing::debug!(url = %self.url, "position socket connect timed out");
                return Err(DeliveryError::Offline);
            }
        };

        let (writer, reader) = socket.split();
        let open = Arc::new(AtomicBool::new(true));
        tokio::spawn(read_events(reader, open.clone(), self.inbound.clone()));
        tracing::info!(url = %self.url, "position socket connected");
        Ok(Link { writer, open })
    }
}

async fn read_events(
    mut reader: SplitStream<Socket>,
    open: Arc<AtomicBool>,
    inbound: Option<mpsc::Sender<ServerEvent>>,
) {
    while let Some(frame) = reader.next().await {
        let text = match frame {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::debug!(error = %e, "position socket read failed");
                break;
            }
        };
        match serde_json::from_str::<ServerEvent>(&text) {
            Ok(ServerEvent::Error { message }) => {
                tracing::warn!(%message, "hub refused an event");
            }
            Ok(event) => {
                if let Some(inbound) = &inbound {
                    if inbound.try_send(event).is_err() {
                        tracing::debug!("hub event dropped, receiver full or gone");
                    }
                }
            }
            Err(e) => tracing::debug!(error = %e, "unrecognised hub frame"),
        }
    }
    open.store(false, Ordering::Release);
    tracing::info!("position socket closed");
}

#[async_trait]
impl PositionSink for SocketSink {
    async fn send(&self, report: &PositionReport) -> Result<(), DeliveryError> {
        let frame = serde_json::to_string(&ClientEvent::PositionUpdate(report.clone()))
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let mut link = self.link.lock().await;
        if link
            .as_ref()
            .map_or(false, |current| !current.open.load(Ordering::Acquire))
        {
            *link = None;
            return Err(DeliveryError::Offline);
        }
        if link.is_none() {
            *link = Some(self.connect().await?);
        }
        let Some(current) = link.as_mut() else {
            return Err(DeliveryError::Offline);
        };

        if let Err(e) = current.writer.send(Message::Text(frame)).await {
            tracing::debug!(error = %e, "position socket send failed");
            *link = None;
            return Err(DeliveryError::Offline);
        }
        Ok(())
    }
}
