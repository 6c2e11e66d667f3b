//! Contains the remote call client used to invoke processing functions over HTTP.
//!
//! The [`Transport`] moves bytes, the [`FunctionClient`] measures the call and decodes the
//! response. Network failures are fatal, while undecodable bodies degrade to a zero-valued
//! response.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::model::{ResponseStatus, StageResponse, StageResult};

/// The raw reply of a function.
#[derive(Clone, Debug)]
pub struct Reply {
    pub status: StatusCode,
    /// The response body, cut off at the requested maximum size.
    pub body: Bytes,
    /// Whether the body was longer than the requested maximum size.
    pub truncated: bool,
}

/// Sends a request body to a function endpoint and returns its reply.
#[async_trait]
pub trait Transport: fmt::Debug + Send + Sync + 'static {
    /// Posts the JSON `body` to `endpoint`, reading at most `max_size` bytes of the response.
    async fn post(&self, endpoint: &str, body: Bytes, max_size: usize) -> Result<Reply>;
}

/// A [`Transport`] using a shared [`reqwest::Client`].
///
/// No timeouts are configured, so a stalled function stalls the calling task.
#[derive(Clone, Debug, Default)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, endpoint: &str, body: Bytes, max_size: usize) -> Result<Reply> {
        let request_error = |source| Error::Request {
            endpoint: endpoint.to_owned(),
            source,
        };

        let mut response = self
            .client
            .post(endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(request_error)?;

        let status = response.status();
        let mut buf = BytesMut::new();
        let mut truncated = false;
        while let Some(chunk) = response.chunk().await.map_err(request_error)? {
            let remaining = max_size - buf.len();
            if chunk.len() > remaining {
                buf.extend_from_slice(&chunk[..remaining]);
                truncated = true;
                break;
            }
            buf.extend_from_slice(&chunk);
        }

        Ok(Reply {
            status,
            body: buf.freeze(),
            truncated,
        })
    }
}

/// Invokes functions and turns their replies into [`StageResult`]s.
#[derive(Clone, Debug)]
pub struct FunctionClient {
    transport: Arc<dyn Transport>,
    max_response_size: usize,
}

impl FunctionClient {
    pub fn new(transport: Arc<dyn Transport>, max_response_size: usize) -> Self {
        Self {
            transport,
            max_response_size,
        }
    }

    /// Calls the function at `endpoint` with `request` as JSON body.
    ///
    /// The returned duration spans from just before sending the request until the response body
    /// has been read.
    pub async fn invoke<Req, Res>(&self, endpoint: &str, request: &Req) -> Result<StageResult<Res>>
    where
        Req: Serialize + Sync + ?Sized,
        Res: StageResponse,
    {
        let body = serde_json::to_vec(request)?;

        let start = Instant::now();
        let reply = self
            .transport
            .post(endpoint, body.into(), self.max_response_size)
            .await?;
        let duration = start.elapsed().as_secs_f64();

        if !reply.status.is_success() {
            tracing::warn!(endpoint, status = %reply.status, "function returned error status");
        }

        let (response, status) = decode(endpoint, &reply);
        Ok(StageResult {
            duration,
            response,
            status,
        })
    }
}

fn decode<R: StageResponse>(endpoint: &str, reply: &Reply) -> (R, ResponseStatus) {
    if reply.truncated {
        tracing::warn!(
            endpoint,
            body = %String::from_utf8_lossy(&reply.body),
            "function response exceeds maximum size"
        );
        return (R::default(), ResponseStatus::Truncated);
    }

    match serde_json::from_slice(&reply.body) {
        Ok(response) => (response, ResponseStatus::Ok),
        Err(error) => {
            tracing::warn!(
                endpoint,
                error = &error as &dyn std::error::Error,
                body = %String::from_utf8_lossy(&reply.body),
                "malformed function response"
            );
            (R::default(), ResponseStatus::Malformed)
        }
    }
}
