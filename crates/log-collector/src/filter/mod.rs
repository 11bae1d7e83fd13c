// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-record filtering and enrichment.
//!
//! [`LogFilter::process`] screens a record against the blacklists in a fixed order and
//! stops at the first match. Nothing is written to the record until it has passed
//! every check, so a dropped record comes back exactly as it went in. Survivors are
//! redacted, tagged and reshaped; enrichment never drops a record.

pub mod rules;
pub mod transform;

use std::sync::Arc;

use tracing::trace;

use crate::error::ConfigError;
use crate::liveness::ClusterLiveness;
use crate::record::Record;
use rules::{derived, fields, FilterRules};
use transform::{parse_json_object, repair_message, unescape_newlines, ContainerName, Patterns};

/// Outcome of filtering one record.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterDecision {
    pub keep: bool,
    pub record: Record,
}

/// What survived screening and still has to be written back.
struct Screened {
    service: Option<String>,
    pod: Option<String>,
    message: Option<String>,
}

pub struct LogFilter {
    rules: FilterRules,
    environment: Option<String>,
    liveness: Arc<dyn ClusterLiveness>,
    patterns: Patterns,
}

impl LogFilter {
    pub fn new(
        rules: FilterRules,
        environment: Option<String>,
        liveness: Arc<dyn ClusterLiveness>,
    ) -> Result<Self, ConfigError> {
        let patterns =
            Patterns::new().map_err(|e| ConfigError::InvalidConfig(format!("filter pattern: {e}")))?;
        Ok(LogFilter {
            rules,
            environment: environment.filter(|env| !env.is_empty()),
            liveness,
            patterns,
        })
    }

    pub fn rules(&self) -> &FilterRules {
        &self.rules
    }

    pub fn process(&self, mut record: Record) -> FilterDecision {
        match self.screen(&record) {
            Some(screened) => {
                self.enrich(&mut record, screened);
                FilterDecision { keep: true, record }
            }
            None => FilterDecision {
                keep: false,
                record,
            },
        }
    }

    fn screen(&self, record: &Record) -> Option<Screened> {
        if let Some(unit) = record.get_str(fields::SYSTEMD_UNIT) {
            if self.rules.is_unit_blacklisted(unit) {
                trace!("FILTER | Dropping record from unit {unit}");
                return None;
            }
        }

        let container = ContainerName::parse(record.get(fields::CONTAINER_NAME));
        if self.rules.is_service_blacklisted(container.service) {
            trace!("FILTER | Dropping record from service {}", container.service);
            return None;
        }

        if let Some(syslog_id) = record.get_str(fields::SYSLOG_IDENTIFIER) {
            if self.rules.is_syslog_id_blacklisted(syslog_id) {
                trace!("FILTER | Dropping record with syslog identifier {syslog_id}");
                return None;
            }
        }

        if let Some(tag) = record.get_str(fields::CONTAINER_TAG) {
            if self.rules.is_container_tag_blacklisted(tag) {
                trace!("FILTER | Dropping record with container tag {tag}");
                return None;
            }
        }

        let message = repair_message(record.get(fields::MESSAGE));
        if message
            .as_deref()
            .is_some_and(|m| self.rules.is_content_blacklisted(m))
        {
            trace!("FILTER | Dropping record with blacklisted content");
            return None;
        }

        Some(Screened {
            service: container.recordable_service().map(str::to_string),
            pod: (!container.pod.is_empty()).then(|| container.pod.to_string()),
            message: message.map(|m| m.into_owned()),
        })
    }

    fn enrich(&self, record: &mut Record, screened: Screened) {
        record.insert(derived::PLATFORM, self.rules.platform.as_str());
        if let Some(env) = &self.environment {
            record.insert(derived::ENVIRONMENT, env.as_str());
        }
        if let Some(service) = screened.service {
            record.insert(derived::SERVICE_NAME, service);
        }
        if let Some(pod) = screened.pod {
            record.insert(derived::POD_NAME, pod);
        }

        if let Some(message) = screened.message {
            let message = unescape_newlines(&self.patterns.redact_api_keys(&message));
            if let Some(tid) = self.patterns.transaction_id(&message) {
                record.insert(derived::TRANSACTION_ID, tid);
            }
            let nested = parse_json_object(&message);
            record.insert(fields::MESSAGE, message);
            if let Some(nested) = nested {
                record.merge(nested);
                record.remove(fields::MESSAGE);
            }
        }

        if record.get_str(fields::MONITORING_EVENT) == Some("true") {
            if let Some(active) = self.liveness.is_active() {
                record.insert(derived::ACTIVE_CLUSTER, active);
            }
        }

        self.strip_and_rename(record);
    }

    /// Removes blacklisted fields, then applies the rename table. Running it twice
    /// leaves the record as running it once does.
    pub fn strip_and_rename(&self, record: &mut Record) {
        for field in &self.rules.blacklisted_fields {
            if self.rules.is_field_blacklisted(field) {
                record.remove(field);
            }
        }
        for (from, to) in &self.rules.renamed_fields {
            record.rename(from, to);
        }
    }
}
