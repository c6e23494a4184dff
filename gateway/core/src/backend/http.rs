//! HTTP Connector
//!
//! Production [`Connector`] backed by a shared `reqwest::Client`. The body of
//! a successful response is handed back as a byte stream; dropping that
//! stream drops the response and closes the vendor connection.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use super::traits::{ByteStream, Connector, GenerationRequest};
use super::{upstream_error_message, ProviderAdapter};
use crate::error::{GatewayError, Result};
use crate::messages::ProviderConfig;

/// Default time allowed to establish the vendor connection
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// reqwest-backed connector
#[derive(Clone, Debug)]
pub struct HttpConnector {
    http_client: reqwest::Client,
}

impl HttpConnector {
    /// Create a connector with the default connect timeout
    #[must_use]
    pub fn new() -> Self {
        Self::with_connect_timeout(DEFAULT_CONNECT_TIMEOUT)
    }

    /// Create a connector with a custom connect timeout
    ///
    /// No overall request timeout is set: streams legitimately run for
    /// minutes. Stalls are caught by the dispatcher's idle timeout instead.
    #[must_use]
    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self { http_client }
    }

    /// Wrap an existing client
    #[must_use]
    pub fn from_client(http_client: reqwest::Client) -> Self {
        Self { http_client }
    }

    /// The underlying client, shared with other HTTP collaborators
    #[must_use]
    pub fn client(&self) -> &reqwest::Client {
        &self.http_client
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for HttpConnector {
    async fn connect(
        &self,
        provider: &ProviderConfig,
        adapter: &ProviderAdapter,
        request: &GenerationRequest,
    ) -> Result<ByteStream> {
        let url = adapter.endpoint_url(&provider.endpoint);
        tracing::debug!(provider = adapter.name(), url = %url, model = %request.model, "Connecting to provider");

        let response = adapter
            .build_request(&self.http_client, provider, request)
            .send()
            .await
            .map_err(|e| GatewayError::Transport(format!("{} request failed: {e}", adapter.name())))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::Upstream {
                status: status.as_u16(),
                message: upstream_error_message(&body),
            });
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(GatewayError::from))
            .boxed())
    }
}
