// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Remote destinations for encoded batches.
//!
//! Every payload becomes one new object keyed by the hour it was written in. Object
//! storage goes through [`S3Sink`]; [`HttpSink`] writes to any store that accepts a
//! plain `PUT`.

use std::future::Future;
use std::io::Write;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::{debug, warn};
use uuid::Uuid;
use zstd::stream::write::Encoder;

use crate::error::ShippingError;
use crate::payload::DispatchUnit;

mod s3;

pub use s3::{S3Sink, S3SinkConfig};

/// Object key prefix used when no environment tag is configured.
pub const DEFAULT_KEY_PREFIX: &str = "logs";

const CONTENT_TYPE_JSON: &str = "application/json";

#[async_trait]
pub trait Sink: Send + Sync {
    /// Delivers one payload. An `Err` means the payload was not accepted.
    async fn put(&self, unit: &DispatchUnit) -> Result<(), ShippingError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Up to `n` attempts back to back.
    Immediate(u64),
    /// Up to `n` attempts, sleeping `attempt * ms` milliseconds after each failure.
    LinearBackoff(u64, u64),
}

impl RetryStrategy {
    fn max_attempts(self) -> u64 {
        match self {
            RetryStrategy::Immediate(n) | RetryStrategy::LinearBackoff(n, _) => n.max(1),
        }
    }

    fn delay_after(self, attempt: u64) -> Option<Duration> {
        match self {
            RetryStrategy::Immediate(_) => None,
            RetryStrategy::LinearBackoff(_, ms) => Some(Duration::from_millis(ms * attempt)),
        }
    }
}

/// Outcome of one failed delivery attempt.
#[derive(Debug)]
enum Failure {
    /// The destination answered with a 4xx; sending again will not help.
    Rejected(StatusCode),
    /// Worth another attempt: 5xx, timeout or transport error.
    Transient(Option<StatusCode>, Option<String>),
}

impl Failure {
    fn from_status(status: StatusCode) -> Self {
        if status.is_client_error() {
            Failure::Rejected(status)
        } else {
            Failure::Transient(Some(status), None)
        }
    }
}

/// Calls `attempt` until it succeeds, is rejected, or `strategy` runs out of attempts.
async fn send_with_retry<F, Fut>(
    strategy: RetryStrategy,
    target: &str,
    mut attempt: F,
) -> Result<(), ShippingError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), Failure>>,
{
    let max_attempts = strategy.max_attempts();
    let mut attempts = 0;
    loop {
        attempts += 1;
        let error = match attempt().await {
            Ok(()) => {
                debug!("SINK | Stored {target} after {attempts} attempts");
                return Ok(());
            }
            Err(Failure::Rejected(status)) => {
                return Err(ShippingError::Destination(
                    Some(status),
                    format!("Destination rejected the payload with {status}"),
                ));
            }
            Err(Failure::Transient(status, None)) => ShippingError::Destination(
                status,
                format!("Failed to send request after {attempts} attempts"),
            ),
            Err(Failure::Transient(status, Some(detail))) => ShippingError::Destination(
                status,
                format!("Failed to send request after {attempts} attempts: {detail}"),
            ),
        };

        if attempts >= max_attempts {
            return Err(error);
        }
        warn!("SINK | Attempt {attempts}/{max_attempts} failed: {error}");
        if let Some(delay) = strategy.delay_after(attempts) {
            tokio::time::sleep(delay).await;
        }
    }
}

/// Key layout and body encoding shared by every sink.
#[derive(Debug, Clone)]
struct ObjectLayout {
    key_prefix: String,
    /// zstd level; `None` stores payloads uncompressed.
    compression_level: Option<i32>,
}

impl ObjectLayout {
    /// `<prefix>/<YYYY>/<MM>/<DD>/<HH>/<uuid>.json`
    fn object_key(&self, at: DateTime<Utc>) -> String {
        format!(
            "{}/{}/{}.json",
            self.key_prefix,
            at.format("%Y/%m/%d/%H"),
            Uuid::new_v4()
        )
    }

    fn content_encoding(&self) -> Option<&'static str> {
        self.compression_level.map(|_| "zstd")
    }

    fn prepare_body(&self, body: &str) -> Result<Bytes, ShippingError> {
        let Some(level) = self.compression_level else {
            return Ok(Bytes::copy_from_slice(body.as_bytes()));
        };
        let compress = || -> std::io::Result<Vec<u8>> {
            let mut encoder = Encoder::new(Vec::new(), level)?;
            encoder.write_all(body.as_bytes())?;
            encoder.finish()
        };
        compress()
            .map(Bytes::from)
            .map_err(|e| ShippingError::Payload(format!("zstd compression failed: {e}")))
    }
}

#[derive(Debug, Clone)]
pub struct HttpSinkConfig {
    /// Base URL objects are written under, without a trailing slash.
    pub endpoint: String,
    pub key_prefix: String,
    pub https_proxy: Option<String>,
    pub timeout: Duration,
    pub retry_strategy: RetryStrategy,
    /// zstd level; `None` sends payloads uncompressed.
    pub compression_level: Option<i32>,
}

/// Writes every payload as a new object with an unsigned HTTP `PUT`.
#[derive(Debug, Clone)]
pub struct HttpSink {
    client: reqwest::Client,
    endpoint: String,
    layout: ObjectLayout,
    retry_strategy: RetryStrategy,
}

impl HttpSink {
    pub fn new(config: HttpSinkConfig) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);
        if let Some(proxy) = &config.https_proxy {
            builder = builder.proxy(reqwest::Proxy::https(proxy)?);
        }
        Ok(HttpSink {
            client: builder.build()?,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            layout: ObjectLayout {
                key_prefix: config.key_prefix,
                compression_level: config.compression_level,
            },
            retry_strategy: config.retry_strategy,
        })
    }

    async fn send_once(&self, url: &str, body: Bytes) -> Result<(), Failure> {
        let mut request = self
            .client
            .put(url)
            .header(CONTENT_TYPE, CONTENT_TYPE_JSON)
            .body(body);
        if let Some(encoding) = self.layout.content_encoding() {
            request = request.header(CONTENT_ENCODING, encoding);
        }
        match request.send().await {
            Ok(response) if response.status().is_success() => Ok(()),
            Ok(response) => Err(Failure::from_status(response.status())),
            Err(e) => Err(Failure::Transient(e.status(), Some(e.to_string()))),
        }
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn put(&self, unit: &DispatchUnit) -> Result<(), ShippingError> {
        let url = format!("{}/{}", self.endpoint, self.layout.object_key(Utc::now()));
        let body = self.layout.prepare_body(&unit.body)?;
        send_with_retry(self.retry_strategy, &url, || {
            self.send_once(&url, body.clone())
        })
        .await
    }
}
