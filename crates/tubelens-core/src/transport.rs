//! HTTP transport for the analysis endpoints
//!
//! The session talks to the server only through `AnalysisTransport`, so tests
//! can script responses without a network.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{AnalysisKind, Config, Endpoints};
use crate::error::{ConfigError, TransportError};
use crate::fallback::FallbackResponse;
use crate::request::AnalysisRequest;

/// Body of a streaming response, chunked however the network delivers it
pub type ByteStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Outcome of opening the streaming endpoint
pub enum StreamOpen {
    /// 2xx with a readable body
    Body(ByteStream),
    /// 404: the server has no streaming route, use the fallback
    NotFound,
}

impl std::fmt::Debug for StreamOpen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamOpen::Body(_) => write!(f, "StreamOpen::Body(..)"),
            StreamOpen::NotFound => write!(f, "StreamOpen::NotFound"),
        }
    }
}

/// The two requests a session can issue
#[async_trait]
pub trait AnalysisTransport: Send + Sync {
    /// POST the request to the streaming endpoint
    async fn open_stream(&self, request: &AnalysisRequest) -> Result<StreamOpen, TransportError>;

    /// POST the same request to the non-streaming endpoint
    async fn fetch_fallback(
        &self,
        request: &AnalysisRequest,
    ) -> Result<FallbackResponse, TransportError>;
}

/// reqwest-backed transport for one analysis kind
pub struct HttpTransport {
    client: reqwest::Client,
    endpoints: Endpoints,
    fallback_timeout: Duration,
}

impl HttpTransport {
    pub fn new(
        endpoints: Endpoints,
        connect_timeout: Duration,
        fallback_timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(ConfigError::Client)?;
        Ok(Self {
            client,
            endpoints,
            fallback_timeout,
        })
    }

    pub fn from_config(config: &Config, kind: AnalysisKind) -> Result<Self, ConfigError> {
        Self::new(
            config.endpoints(kind)?,
            config.connect_timeout(),
            config.fallback_timeout(),
        )
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }
}

#[async_trait]
impl AnalysisTransport for HttpTransport {
    async fn open_stream(&self, request: &AnalysisRequest) -> Result<StreamOpen, TransportError> {
        debug!("Opening analysis stream: {}", self.endpoints.stream);
        let response = self
            .client
            .post(self.endpoints.stream.clone())
            .header(ACCEPT, "text/event-stream")
            .json(request.body())
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            info!("Streaming endpoint {} not found", self.endpoints.stream);
            return Ok(StreamOpen::NotFound);
        }
        if !status.is_success() {
            warn!("Streaming endpoint returned {}", status);
            return Err(TransportError::Status {
                status: status.as_u16(),
            });
        }
        if response.content_length() == Some(0) {
            return Err(TransportError::MissingBody);
        }

        Ok(StreamOpen::Body(
            response.bytes_stream().map_err(TransportError::from).boxed(),
        ))
    }

    async fn fetch_fallback(
        &self,
        request: &AnalysisRequest,
    ) -> Result<FallbackResponse, TransportError> {
        debug!("Calling fallback endpoint: {}", self.endpoints.fallback);
        let response = self
            .client
            .post(self.endpoints.fallback.clone())
            .timeout(self.fallback_timeout)
            .json(request.body())
            .send()
            .await?;

        let status = response.status();
        let body = response.bytes().await?;

        // Error statuses may still carry `{ success: false, error }`
        match serde_json::from_slice::<FallbackResponse>(&body) {
            Ok(parsed) => Ok(parsed),
            Err(_) if !status.is_success() => Err(TransportError::Status {
                status: status.as_u16(),
            }),
            Err(e) => Err(TransportError::Decode(e.to_string())),
        }
    }
}
