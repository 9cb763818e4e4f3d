use async_trait::async_trait;
use std::time::Duration;

use super::queue::{DeliveryError, ItemKind, OutboundItem, OutboundSender};
use super::PositionSink;
use crate::models::position::PositionReport;

/// Request/response delivery to the tracking service. Used as the backup
/// channel and as the replay target of the outbound queue.
pub struct HttpOutbound {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpOutbound {
    pub fn new(base_url: &str, token: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn path_for(kind: ItemKind) -> &'static str {
        match kind {
            ItemKind::Gps => "/api/positions",
            ItemKind::PointCompletion => "/api/points/completions",
            ItemKind::Photo => "/api/points/photos",
        }
    }

    async fn post<T: serde::Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<(), DeliveryError> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    DeliveryError::Offline
                } else {
                    DeliveryError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        Err(DeliveryError::Rejected {
            status: status.as_u16(),
            message: message.chars().take(200).collect(),
        })
    }
}

#[async_trait]
impl PositionSink for HttpOutbound {
    async fn send(&self, report: &PositionReport) -> Result<(), DeliveryError> {
        self.post(Self::path_for(ItemKind::Gps), report).await
    }
}

#[async_trait]
impl OutboundSender for HttpOutbound {
    async fn deliver(&self, item: &OutboundItem) -> Result<(), DeliveryError> {
        self.post(Self::path_for(item.kind), &item.payload).await
    }
}
