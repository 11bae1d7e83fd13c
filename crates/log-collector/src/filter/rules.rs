// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Blacklist and rename tables driving the [`super::LogFilter`].
//!
//! The defaults reproduce the tables the collector has always shipped with. A JSON
//! file can override any subset of them; missing keys fall back to the defaults.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// Journald fields the filter reads.
pub mod fields {
    pub const SYSTEMD_UNIT: &str = "_SYSTEMD_UNIT";
    pub const CONTAINER_NAME: &str = "CONTAINER_NAME";
    pub const SYSLOG_IDENTIFIER: &str = "SYSLOG_IDENTIFIER";
    pub const CONTAINER_TAG: &str = "CONTAINER_TAG";
    pub const MESSAGE: &str = "MESSAGE";
    pub const MONITORING_EVENT: &str = "monitoring_event";
}

/// Fields the filter writes.
pub mod derived {
    pub const PLATFORM: &str = "platform";
    pub const ENVIRONMENT: &str = "environment";
    pub const SERVICE_NAME: &str = "SERVICE_NAME";
    pub const POD_NAME: &str = "POD_NAME";
    pub const TRANSACTION_ID: &str = "transaction_id";
    pub const ACTIVE_CLUSTER: &str = "active_cluster";
}

pub const DEFAULT_PLATFORM: &str = "up-k8s";

/// Container name token that never counts as a service.
pub const POD_SENTINEL: &str = "POD";

const DEFAULT_BLACKLISTED_FIELDS: &[&str] = &[
    "_GID",
    "_CAP_EFFECTIVE",
    "SYSLOG_FACILITY",
    "PRIORITY",
    "SYSLOG_IDENTIFIER",
    "_BOOT_ID",
    "_CMDLINE",
    "_COMM",
    "_EXE",
    "_SYSTEMD_CGROUP",
    "_SYSTEMD_SLICE",
    "_TRANSPORT",
    "_UID",
    "__CURSOR",
    "__MONOTONIC_TIMESTAMP",
    "_SELINUX_CONTEXT",
    "__REALTIME_TIMESTAMP",
    "_PID",
    "CONTAINER_ID",
    "CONTAINER_ID_FULL",
    "CONTAINER_NAME",
    "CONTAINER_TAG",
    "MACHINE_ID",
    "_SOURCE_REALTIME_TIMESTAMP",
    "_SYSTEMD_INVOCATION_ID",
];

const DEFAULT_BLACKLISTED_UNITS: &[&str] = &[
    "log-collector.service",
    "logstash-forwarder.service",
    "flanneld.service",
];

const DEFAULT_BLACKLISTED_SERVICES: &[&str] = &[
    "main",
    "cluster-autoscaler",
    "kube-resources-autosave-pusher",
    "kube-resources-autosave-dumper",
    "resilient-splunk-forwarder",
    "coco-diamond",
];

const DEFAULT_BLACKLISTED_CONTENT: &[&str] = &[
    "transaction_id=SYNTHETIC-REQ",
    r#""transaction_id":"SYNTHETIC-REQ"#,
    "__health",
    "__gtg",
    // kubelet logs this for every service account token mount
    "MountVolume.SetUp succeeded for volume",
];

const DEFAULT_BLACKLISTED_SYSLOG_IDS: &[&str] = &["dockerd"];

const DEFAULT_BLACKLISTED_CONTAINER_TAGS: &[&str] = &[
    "gcr.io/google_containers/heapster",
    "gcr.io/google_containers/kubedns-amd64",
    "gcr.io/google_containers/addon-resizer",
];

const DEFAULT_RENAMED_FIELDS: &[(&str, &str)] = &[
    ("_SYSTEMD_UNIT", "SYSTEMD_UNIT"),
    ("_MACHINE_ID", "MACHINE_ID"),
    ("_HOSTNAME", "HOSTNAME"),
];

fn to_set(items: &[&str]) -> HashSet<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

fn to_vec(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

/// Tables consulted by the filter. Exact-match tables are sets, substring tables are
/// scanned in order.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FilterRules {
    pub platform: String,
    pub blacklisted_units: HashSet<String>,
    pub blacklisted_services: HashSet<String>,
    pub blacklisted_syslog_ids: HashSet<String>,
    pub blacklisted_container_tags: Vec<String>,
    pub blacklisted_content: Vec<String>,
    pub blacklisted_fields: HashSet<String>,
    pub renamed_fields: BTreeMap<String, String>,
}

impl Default for FilterRules {
    fn default() -> Self {
        FilterRules {
            platform: DEFAULT_PLATFORM.to_string(),
            blacklisted_units: to_set(DEFAULT_BLACKLISTED_UNITS),
            blacklisted_services: to_set(DEFAULT_BLACKLISTED_SERVICES),
            blacklisted_syslog_ids: to_set(DEFAULT_BLACKLISTED_SYSLOG_IDS),
            blacklisted_container_tags: to_vec(DEFAULT_BLACKLISTED_CONTAINER_TAGS),
            blacklisted_content: to_vec(DEFAULT_BLACKLISTED_CONTENT),
            blacklisted_fields: to_set(DEFAULT_BLACKLISTED_FIELDS),
            renamed_fields: DEFAULT_RENAMED_FIELDS
                .iter()
                .map(|(from, to)| ((*from).to_string(), (*to).to_string()))
                .collect(),
        }
    }
}

impl FilterRules {
    /// Loads rules from a JSON file. Keys absent from the file keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Rules {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Self::from_json(&raw).map_err(|e| ConfigError::Rules {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn is_unit_blacklisted(&self, unit: &str) -> bool {
        self.blacklisted_units.contains(unit)
    }

    pub fn is_service_blacklisted(&self, service: &str) -> bool {
        self.blacklisted_services.contains(service)
    }

    pub fn is_syslog_id_blacklisted(&self, syslog_id: &str) -> bool {
        self.blacklisted_syslog_ids.contains(syslog_id)
    }

    pub fn is_container_tag_blacklisted(&self, tag: &str) -> bool {
        contains_any(tag, &self.blacklisted_container_tags)
    }

    pub fn is_content_blacklisted(&self, message: &str) -> bool {
        contains_any(message, &self.blacklisted_content)
    }

    /// Whether the field blacklist removes `field`. Rename targets are exempt so that
    /// running blacklist then rename twice gives the same record as running it once.
    pub fn is_field_blacklisted(&self, field: &str) -> bool {
        self.blacklisted_fields.contains(field)
            && !self.renamed_fields.values().any(|target| target == field)
    }
}

fn contains_any(haystack: &str, needles: &[String]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle.as_str()))
}
