//! HTTP plumbing for chat completion endpoints

pub mod openai;

use std::pin::Pin;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_stream::Stream;

use crate::error::{Error, Result};
use crate::provider::Endpoint;

/// Raw response body chunks
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// Sends one request to an endpoint. A non-success status is an
/// `Error::Status` carrying the response body.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn send(&self, endpoint: &Endpoint, body: &serde_json::Value) -> Result<ByteStream>;
}

/// `reqwest`-based backend
#[derive(Debug, Clone, Default)]
pub struct HttpBackend {
    client: reqwest::Client,
}

impl HttpBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn send(&self, endpoint: &Endpoint, body: &serde_json::Value) -> Result<ByteStream> {
        let mut request = self.client.post(&endpoint.url).json(body);
        for (name, value) in &endpoint.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Status {
                status: status.as_u16(),
                body,
            });
        }

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map(|bytes| bytes.to_vec()).map_err(Error::from));
        Ok(Box::pin(stream))
    }
}
