//! HTTP implementation of the core's `SyncTransport` capability, used
//! when this server acts as a sync client toward configured peers.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

use basalt_core::sync::{SyncTransport, TransportMethod, TransportRequest, TransportResponse};
use basalt_core::{Error, Result};

/// Request timeout for peer calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// `SyncTransport` over HTTP(S) via reqwest.
pub struct HttpTransport {
    client: Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Transport(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl SyncTransport for HttpTransport {
    async fn request(&self, request: TransportRequest) -> Result<TransportResponse> {
        let url = format!("{}{}", self.base_url, request.path);
        let mut builder = match request.method {
            TransportMethod::Get => self.client.get(&url),
            TransportMethod::Post => self.client.post(&url),
        };
        if let Some(token) = &request.token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = request.body {
            builder = builder
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(format!("request to {} timed out", url))
            } else {
                Error::Transport(format!("request to {} failed: {}", url, e))
            }
        })?;

        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| Error::Transport(format!("failed to read response body: {}", e)))?;
        Ok(TransportResponse {
            status,
            body: body.to_vec(),
        })
    }
}
