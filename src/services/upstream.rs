//! Shared HTTP plumbing for the routing engines.

use reqwest::{RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::error::RoutingError;

pub(crate) struct UpstreamResponse {
    pub status: StatusCode,
    pub body: String,
}

pub(crate) fn build_client(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Sends the request and reads the body. Only transport failures are
/// errors here; status interpretation is left to the engine-specific caller.
pub(crate) async fn execute(
    request: RequestBuilder,
    upstream: &'static str,
) -> Result<UpstreamResponse, RoutingError> {
    let response = request.send().await.map_err(|e| {
        let reason = if e.is_timeout() {
            "timed out"
        } else if e.is_connect() {
            "connection failed"
        } else {
            "request failed"
        };
        RoutingError::Unreachable(format!("{} {}: {}", upstream, reason, e))
    })?;

    let status = response.status();
    let body = response.text().await.map_err(|e| {
        RoutingError::Unreachable(format!("{} body read failed: {}", upstream, e))
    })?;

    Ok(UpstreamResponse { status, body })
}

pub(crate) fn decode<T: DeserializeOwned>(
    body: &str,
    upstream: &'static str,
) -> Result<T, RoutingError> {
    serde_json::from_str(body).map_err(|e| {
        RoutingError::InvalidResponse(format!(
            "{} returned unparseable body ({}): {}",
            upstream,
            e,
            snippet(body)
        ))
    })
}

/// First 200 characters of an upstream body, for error messages.
pub(crate) fn snippet(body: &str) -> String {
    let mut out: String = body.chars().take(200).collect();
    if body.chars().count() > 200 {
        out.push('…');
    }
    out
}
