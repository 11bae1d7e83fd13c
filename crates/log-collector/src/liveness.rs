// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracks whether this cluster is the active one, used to annotate monitoring events.
//!
//! The filter runs synchronously on the intake task, so it only ever reads a cached
//! answer. [`DnsClusterLiveness`] keeps that cache fresh from a background task.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hickory_resolver::error::ResolveError;
use hickory_resolver::proto::rr::RData;
use hickory_resolver::TokioAsyncResolver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub trait ClusterLiveness: Send + Sync {
    /// `Some(true)` when this cluster currently serves traffic, `None` when unknown.
    fn is_active(&self) -> Option<bool>;
}

/// Always unknown. Used when no DNS address is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoLiveness;

impl ClusterLiveness for NoLiveness {
    fn is_active(&self) -> Option<bool> {
        None
    }
}

/// Fixed answer, handy in tests and for single-cluster setups.
#[derive(Debug, Clone, Copy)]
pub struct FixedLiveness(pub Option<bool>);

impl ClusterLiveness for FixedLiveness {
    fn is_active(&self) -> Option<bool> {
        self.0
    }
}

#[async_trait]
pub trait NameResolver: Send + Sync {
    /// Name `host` ends up at after following CNAME records, `host` itself when there
    /// are none. `None` when the lookup fails.
    async fn canonical_name(&self, host: &str) -> Option<String>;
}

/// Resolver configured from the host's `resolv.conf`.
pub struct SystemResolver(TokioAsyncResolver);

impl SystemResolver {
    pub fn from_system_conf() -> Result<Self, ResolveError> {
        Ok(SystemResolver(TokioAsyncResolver::tokio_from_system_conf()?))
    }
}

#[async_trait]
impl NameResolver for SystemResolver {
    async fn canonical_name(&self, host: &str) -> Option<String> {
        match self.0.lookup_ip(host).await {
            Ok(lookup) => {
                let target = lookup
                    .as_lookup()
                    .record_iter()
                    .filter_map(|record| match record.data() {
                        Some(RData::CNAME(cname)) => Some(cname.0.to_utf8()),
                        _ => None,
                    })
                    .last();
                Some(target.unwrap_or_else(|| host.to_string()))
            }
            Err(e) => {
                warn!("LIVENESS | Failed to resolve {host}: {e}");
                None
            }
        }
    }
}

const UNKNOWN: u8 = 0;
const INACTIVE: u8 = 1;
const ACTIVE: u8 = 2;

/// The failover DNS name points at the active cluster. This cluster is active when
/// that canonical name carries its environment tag.
pub struct DnsClusterLiveness {
    dns_address: String,
    environment: String,
    resolver: Arc<dyn NameResolver>,
    state: AtomicU8,
}

impl DnsClusterLiveness {
    #[must_use]
    pub fn new(dns_address: String, environment: String, resolver: Arc<dyn NameResolver>) -> Self {
        DnsClusterLiveness {
            dns_address,
            environment,
            resolver,
            state: AtomicU8::new(UNKNOWN),
        }
    }

    fn store(&self, active: Option<bool>) {
        let value = match active {
            None => UNKNOWN,
            Some(false) => INACTIVE,
            Some(true) => ACTIVE,
        };
        self.state.store(value, Ordering::Relaxed);
    }

    /// Resolves the DNS address and updates the cached answer. A failed lookup resets
    /// the cache to unknown.
    pub async fn refresh(&self) -> Option<bool> {
        let active = self
            .resolver
            .canonical_name(&self.dns_address)
            .await
            .map(|name| points_at(&name, &self.environment));
        debug!(
            "LIVENESS | {} for environment {}: {:?}",
            self.dns_address, self.environment, active
        );
        self.store(active);
        active
    }

    /// Refreshes the cache every `period` until `cancel` fires. The first lookup runs
    /// immediately.
    pub fn spawn_refresh(
        self: Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.refresh().await;
                    }
                }
            }
            debug!("LIVENESS | Refresh task stopped");
        })
    }
}

impl ClusterLiveness for DnsClusterLiveness {
    fn is_active(&self) -> Option<bool> {
        match self.state.load(Ordering::Relaxed) {
            ACTIVE => Some(true),
            INACTIVE => Some(false),
            _ => None,
        }
    }
}

fn points_at(canonical_name: &str, environment: &str) -> bool {
    canonical_name
        .to_ascii_lowercase()
        .contains(&environment.to_ascii_lowercase())
}
