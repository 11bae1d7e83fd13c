// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::Utc;
use reqwest::StatusCode;
use tracing::info;

use super::{send_with_retry, Failure, ObjectLayout, RetryStrategy, Sink, CONTENT_TYPE_JSON};
use crate::error::ShippingError;
use crate::payload::DispatchUnit;

#[derive(Debug, Clone)]
pub struct S3SinkConfig {
    pub bucket: String,
    pub region: String,
    /// S3 compatible endpoint (MinIO, localstack). Switches to path style addressing.
    pub endpoint: Option<String>,
    /// Static credentials; the default AWS provider chain is used when unset.
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub key_prefix: String,
    pub timeout: Duration,
    pub retry_strategy: RetryStrategy,
    pub compression_level: Option<i32>,
}

/// Writes every payload as a new object with a signed `PutObject`.
#[derive(Debug, Clone)]
pub struct S3Sink {
    client: Client,
    bucket: String,
    layout: ObjectLayout,
    timeout: Duration,
    retry_strategy: RetryStrategy,
}

impl S3Sink {
    pub async fn new(config: S3SinkConfig) -> Self {
        let region = Region::new(config.region.clone());
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(region.clone())
            .load()
            .await;

        // retries are driven by `retry_strategy`, like every other sink
        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config)
            .region(region)
            .retry_config(RetryConfig::disabled());

        if let Some(endpoint) = &config.endpoint {
            s3_config_builder = s3_config_builder
                .endpoint_url(endpoint)
                .force_path_style(true);
        }

        if let (Some(access_key), Some(secret_key)) =
            (&config.access_key_id, &config.secret_access_key)
        {
            let credentials = Credentials::new(access_key, secret_key, None, None, "log-collector");
            s3_config_builder = s3_config_builder.credentials_provider(credentials);
        }

        info!(
            "SINK | S3 client initialized for bucket {} in {}",
            config.bucket, config.region
        );

        S3Sink {
            client: Client::from_conf(s3_config_builder.build()),
            bucket: config.bucket,
            layout: ObjectLayout {
                key_prefix: config.key_prefix,
                compression_level: config.compression_level,
            },
            timeout: config.timeout,
            retry_strategy: config.retry_strategy,
        }
    }

    async fn put_once(&self, key: &str, body: Bytes) -> Result<(), Failure> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(CONTENT_TYPE_JSON)
            .body(ByteStream::from(body));
        if let Some(encoding) = self.layout.content_encoding() {
            request = request.content_encoding(encoding);
        }

        match tokio::time::timeout(self.timeout, request.send()).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(failure(&e)),
            Err(_) => Err(Failure::Transient(
                None,
                Some(format!("no answer within {:?}", self.timeout)),
            )),
        }
    }
}

fn failure(err: &SdkError<PutObjectError>) -> Failure {
    let status = match err {
        SdkError::ServiceError(e) => Some(e.raw().status().as_u16()),
        SdkError::ResponseError(e) => Some(e.raw().status().as_u16()),
        _ => None,
    }
    .and_then(|code| StatusCode::from_u16(code).ok());

    match status {
        Some(status) if status.is_client_error() => Failure::Rejected(status),
        status => Failure::Transient(status, Some(err.to_string())),
    }
}

#[async_trait]
impl Sink for S3Sink {
    async fn put(&self, unit: &DispatchUnit) -> Result<(), ShippingError> {
        let key = self.layout.object_key(Utc::now());
        let body = self.layout.prepare_body(&unit.body)?;
        let target = format!("s3://{}/{key}", self.bucket);
        send_with_retry(self.retry_strategy, &target, || {
            self.put_once(&key, body.clone())
        })
        .await
    }
}
