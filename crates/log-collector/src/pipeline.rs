// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Assembles the collector from a validated [`Config`].

use std::sync::Arc;

use tokio::io::AsyncRead;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{Config, InputFormat, SinkTarget};
use crate::dispatcher::Dispatcher;
use crate::error::{ConfigError, PipelineError};
use crate::filter::LogFilter;
use crate::forwarder::{Forwarder, ForwarderSummary};
use crate::liveness::{ClusterLiveness, DnsClusterLiveness, NoLiveness, SystemResolver};
use crate::payload::PayloadEncoder;
use crate::sink::{HttpSink, S3Sink, Sink};
use crate::source::{EventSource, FilteredSource, LineSource};

/// DNS backed liveness refreshed until `cancel` fires, or a collaborator that never
/// knows when no failover address is configured.
pub fn start_liveness(config: &Config, cancel: &CancellationToken) -> Arc<dyn ClusterLiveness> {
    let (Some(dns_address), Some(env)) = (&config.dns_address, &config.env) else {
        return Arc::new(NoLiveness);
    };
    let resolver = match SystemResolver::from_system_conf() {
        Ok(resolver) => resolver,
        Err(e) => {
            warn!("PIPELINE | Cluster liveness disabled, no usable resolver: {e}");
            return Arc::new(NoLiveness);
        }
    };
    let liveness = Arc::new(DnsClusterLiveness::new(
        dns_address.clone(),
        env.clone(),
        Arc::new(resolver),
    ));
    Arc::clone(&liveness).spawn_refresh(config.liveness_refresh(), cancel.child_token());
    info!("PIPELINE | Tracking cluster liveness via {dns_address}");
    liveness as Arc<dyn ClusterLiveness>
}

pub async fn sink(config: &Config) -> Result<Arc<dyn Sink>, PipelineError> {
    let sink: Arc<dyn Sink> = match config.sink_target()? {
        SinkTarget::Http(http) => {
            Arc::new(HttpSink::new(http).map_err(|e| PipelineError::Sink(e.to_string()))?)
        }
        SinkTarget::S3(s3) => Arc::new(S3Sink::new(s3).await),
    };
    Ok(sink)
}

pub fn event_source<R>(
    config: &Config,
    input: R,
    liveness: Arc<dyn ClusterLiveness>,
) -> Result<Box<dyn EventSource>, ConfigError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let source: Box<dyn EventSource> = match config.input_format {
        InputFormat::Json => {
            let filter = LogFilter::new(config.filter_rules()?, config.env.clone(), liveness)?;
            Box::new(FilteredSource::new(input, filter, config.malformed_policy()))
        }
        InputFormat::Lines => Box::new(LineSource::new(input)),
    };
    Ok(source)
}

/// Runs the collector over `input` until it ends or `cancel` fires, then drains.
pub async fn run<R>(
    config: &Config,
    input: R,
    sink: Arc<dyn Sink>,
    liveness: Arc<dyn ClusterLiveness>,
    cancel: CancellationToken,
) -> Result<ForwarderSummary, PipelineError>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let source = event_source(config, input, liveness)?;
    let encoder = PayloadEncoder::new()
        .map_err(|e| ConfigError::InvalidConfig(format!("timestamp pattern: {e}")))?;
    let dispatcher = Dispatcher::start(sink, encoder, config.workers, config.queue_capacity);

    info!(
        "PIPELINE | Reading {} input, {} workers",
        config.input_format, config.workers
    );
    Forwarder::new(
        source,
        dispatcher,
        config.batch_size,
        config.batch_interval(),
        cancel,
    )
    .run()
    .await
}
