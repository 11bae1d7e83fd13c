// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::constants::{
    DEFAULT_AWS_REGION, DEFAULT_BATCH_INTERVAL_SECS, DEFAULT_BATCH_SIZE,
    DEFAULT_LIVENESS_REFRESH_SECS, DEFAULT_QUEUE_CAPACITY, DEFAULT_SINK_RETRIES,
    DEFAULT_SINK_TIMEOUT_SECS, DEFAULT_WORKERS,
};
use crate::decoder::MalformedPolicy;
use crate::error::ConfigError;
use crate::filter::rules::FilterRules;
use crate::sink::{HttpSinkConfig, RetryStrategy, S3SinkConfig, DEFAULT_KEY_PREFIX};

const ENV_PREFIX: &str = "LOG_COLLECTOR_";

/// Delay unit between two delivery attempts.
const RETRY_BACKOFF_MS: u64 = 100;

/// How stdin is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputFormat {
    /// JSON records, decoded and filtered.
    #[default]
    Json,
    /// Newline-delimited events forwarded untouched.
    Lines,
}

impl FromStr for InputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(InputFormat::Json),
            "lines" => Ok(InputFormat::Lines),
            _ => Err(ConfigError::InvalidValue {
                key: format!("{ENV_PREFIX}INPUT_FORMAT"),
                value: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for InputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputFormat::Json => f.write_str("json"),
            InputFormat::Lines => f.write_str("lines"),
        }
    }
}

/// Where batches are written.
#[derive(Debug, Clone)]
pub enum SinkTarget {
    /// Plain `PUT` under an explicit URL.
    Http(HttpSinkConfig),
    /// Signed `PutObject` into a bucket.
    S3(S3SinkConfig),
}

/// Collector configuration, read once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Environment tag written to records and used as object key prefix
    pub env: Option<String>,
    pub workers: usize,
    pub queue_capacity: usize,
    pub batch_size: usize,
    pub batch_interval_secs: u64,
    pub bucket: Option<String>,
    pub aws_region: String,
    /// S3 compatible endpoint for the bucket, e.g. MinIO
    pub s3_endpoint: Option<String>,
    pub s3_access_key_id: Option<String>,
    pub s3_secret_access_key: Option<String>,
    /// Unsigned HTTP destination used instead of the bucket
    pub sink_url: Option<String>,
    pub sink_timeout_secs: u64,
    pub sink_retries: u64,
    pub compression_level: Option<i32>,
    pub https_proxy: Option<String>,
    /// Failover DNS name; this cluster is active when it resolves to a name carrying `env`
    pub dns_address: Option<String>,
    pub liveness_refresh_secs: u64,
    pub input_format: InputFormat,
    pub skip_malformed: bool,
    pub filter_rules_path: Option<PathBuf>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            env: None,
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            batch_interval_secs: DEFAULT_BATCH_INTERVAL_SECS,
            bucket: None,
            aws_region: DEFAULT_AWS_REGION.to_string(),
            s3_endpoint: None,
            s3_access_key_id: None,
            s3_secret_access_key: None,
            sink_url: None,
            sink_timeout_secs: DEFAULT_SINK_TIMEOUT_SECS,
            sink_retries: DEFAULT_SINK_RETRIES,
            compression_level: None,
            https_proxy: None,
            dns_address: None,
            liveness_refresh_secs: DEFAULT_LIVENESS_REFRESH_SECS,
            input_format: InputFormat::default(),
            skip_malformed: false,
            filter_rules_path: None,
            log_level: "info".to_string(),
        }
    }
}

fn parse<T: FromStr>(key: &str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}{key}"),
            value: raw,
        }),
    }
}

fn parse_bool(key: &str, value: Option<String>) -> Result<bool, ConfigError> {
    let Some(raw) = value else {
        return Ok(false);
    };
    match raw.trim().to_lowercase().as_str() {
        "" | "false" | "0" | "no" => Ok(false),
        "true" | "1" | "yes" => Ok(true),
        _ => Err(ConfigError::InvalidValue {
            key: format!("{ENV_PREFIX}{key}"),
            value: raw,
        }),
    }
}

impl Config {
    /// Reads `LOG_COLLECTOR_*` variables from the process environment and validates them.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`Config::from_env`], with `lookup` standing in for the environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(&format!("{ENV_PREFIX}{key}")).filter(|value| !value.trim().is_empty())
        };

        let config = Self {
            env: var("ENV"),
            workers: parse("WORKERS", var("WORKERS"), DEFAULT_WORKERS)?,
            queue_capacity: parse("QUEUE_CAPACITY", var("QUEUE_CAPACITY"), DEFAULT_QUEUE_CAPACITY)?,
            batch_size: parse("BATCH_SIZE", var("BATCH_SIZE"), DEFAULT_BATCH_SIZE)?,
            batch_interval_secs: parse(
                "BATCH_INTERVAL_SECS",
                var("BATCH_INTERVAL_SECS"),
                DEFAULT_BATCH_INTERVAL_SECS,
            )?,
            bucket: var("BUCKET"),
            aws_region: var("AWS_REGION").unwrap_or_else(|| DEFAULT_AWS_REGION.to_string()),
            s3_endpoint: var("S3_ENDPOINT"),
            s3_access_key_id: var("S3_ACCESS_KEY_ID"),
            s3_secret_access_key: var("S3_SECRET_ACCESS_KEY"),
            sink_url: var("SINK_URL"),
            sink_timeout_secs: parse(
                "SINK_TIMEOUT_SECS",
                var("SINK_TIMEOUT_SECS"),
                DEFAULT_SINK_TIMEOUT_SECS,
            )?,
            sink_retries: parse("SINK_RETRIES", var("SINK_RETRIES"), DEFAULT_SINK_RETRIES)?,
            compression_level: var("COMPRESSION_LEVEL")
                .map(|raw| parse("COMPRESSION_LEVEL", Some(raw), 0))
                .transpose()?,
            https_proxy: var("HTTPS_PROXY").or_else(|| lookup("HTTPS_PROXY")),
            dns_address: var("DNS_ADDRESS"),
            liveness_refresh_secs: parse(
                "LIVENESS_REFRESH_SECS",
                var("LIVENESS_REFRESH_SECS"),
                DEFAULT_LIVENESS_REFRESH_SECS,
            )?,
            input_format: var("INPUT_FORMAT")
                .map(|raw| raw.parse::<InputFormat>())
                .transpose()?
                .unwrap_or_default(),
            skip_malformed: parse_bool("SKIP_MALFORMED", var("SKIP_MALFORMED"))?,
            filter_rules_path: var("FILTER_RULES").map(PathBuf::from),
            log_level: var("LOG_LEVEL")
                .map(|val| val.to_lowercase())
                .unwrap_or_else(|| "info".to_string()),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("worker count", self.workers as u64),
            ("queue capacity", self.queue_capacity as u64),
            ("batch size", self.batch_size as u64),
            ("batch interval", self.batch_interval_secs),
            ("sink timeout", self.sink_timeout_secs),
            ("sink retries", self.sink_retries),
            ("liveness refresh interval", self.liveness_refresh_secs),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.sink_url.is_none() && self.bucket.is_none() {
            return Err(ConfigError::InvalidConfig(format!(
                "one of {ENV_PREFIX}BUCKET or {ENV_PREFIX}SINK_URL must be set"
            )));
        }

        if self.dns_address.is_some() && self.env.is_none() {
            return Err(ConfigError::InvalidConfig(format!(
                "{ENV_PREFIX}ENV is required when {ENV_PREFIX}DNS_ADDRESS is set"
            )));
        }

        if self.s3_access_key_id.is_some() != self.s3_secret_access_key.is_some() {
            return Err(ConfigError::InvalidConfig(format!(
                "{ENV_PREFIX}S3_ACCESS_KEY_ID and {ENV_PREFIX}S3_SECRET_ACCESS_KEY must be set together"
            )));
        }

        if let Some(level) = self.compression_level {
            let range = zstd::compression_level_range();
            if !range.contains(&level) {
                return Err(ConfigError::InvalidConfig(format!(
                    "compression level {level} is outside {}..={}",
                    range.start(),
                    range.end()
                )));
            }
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.log_level.as_str()) {
            return Err(ConfigError::InvalidConfig(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    pub fn batch_interval(&self) -> Duration {
        Duration::from_secs(self.batch_interval_secs)
    }

    pub fn liveness_refresh(&self) -> Duration {
        Duration::from_secs(self.liveness_refresh_secs)
    }

    pub fn malformed_policy(&self) -> MalformedPolicy {
        if self.skip_malformed {
            MalformedPolicy::Skip
        } else {
            MalformedPolicy::Abort
        }
    }

    fn key_prefix(&self) -> String {
        self.env
            .clone()
            .unwrap_or_else(|| DEFAULT_KEY_PREFIX.to_string())
    }

    fn retry_strategy(&self) -> RetryStrategy {
        RetryStrategy::LinearBackoff(self.sink_retries, RETRY_BACKOFF_MS)
    }

    /// `SINK_URL` when set, the bucket otherwise.
    pub fn sink_target(&self) -> Result<SinkTarget, ConfigError> {
        if let Some(endpoint) = &self.sink_url {
            return Ok(SinkTarget::Http(HttpSinkConfig {
                endpoint: endpoint.clone(),
                key_prefix: self.key_prefix(),
                https_proxy: self.https_proxy.clone(),
                timeout: Duration::from_secs(self.sink_timeout_secs),
                retry_strategy: self.retry_strategy(),
                compression_level: self.compression_level,
            }));
        }
        let bucket = self.bucket.clone().ok_or_else(|| {
            ConfigError::InvalidConfig("no sink destination configured".to_string())
        })?;
        Ok(SinkTarget::S3(S3SinkConfig {
            bucket,
            region: self.aws_region.clone(),
            endpoint: self.s3_endpoint.clone(),
            access_key_id: self.s3_access_key_id.clone(),
            secret_access_key: self.s3_secret_access_key.clone(),
            key_prefix: self.key_prefix(),
            timeout: Duration::from_secs(self.sink_timeout_secs),
            retry_strategy: self.retry_strategy(),
            compression_level: self.compression_level,
        }))
    }

    /// Rules from the configured file, or the built-in tables.
    pub fn filter_rules(&self) -> Result<FilterRules, ConfigError> {
        match &self.filter_rules_path {
            Some(path) => FilterRules::from_file(path),
            None => Ok(FilterRules::default()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    fn valid() -> Config {
        Config {
            bucket: Some("logs-bucket".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("LOG_COLLECTOR_BUCKET", "logs-bucket")])).unwrap();
        assert_eq!(config, valid());
        assert_eq!(config.batch_interval(), Duration::from_secs(10));
        assert_eq!(config.malformed_policy(), MalformedPolicy::Abort);

        let SinkTarget::S3(sink) = config.sink_target().unwrap() else {
            panic!("bucket without SINK_URL should write to S3");
        };
        assert_eq!(sink.bucket, "logs-bucket");
        assert_eq!(sink.region, "eu-west-1");
        assert_eq!(sink.endpoint, None);
        assert_eq!(sink.access_key_id, None);
        assert_eq!(sink.key_prefix, "logs");
        assert_eq!(sink.retry_strategy, RetryStrategy::LinearBackoff(3, 100));
    }

    #[test]
    fn test_reads_every_variable() {
        let config = Config::from_lookup(lookup(&[
            ("LOG_COLLECTOR_ENV", "prod"),
            ("LOG_COLLECTOR_WORKERS", "2"),
            ("LOG_COLLECTOR_QUEUE_CAPACITY", "16"),
            ("LOG_COLLECTOR_BATCH_SIZE", "10"),
            ("LOG_COLLECTOR_BATCH_INTERVAL_SECS", "5"),
            ("LOG_COLLECTOR_SINK_URL", "http://127.0.0.1:9000/"),
            ("LOG_COLLECTOR_SINK_RETRIES", "1"),
            ("LOG_COLLECTOR_COMPRESSION_LEVEL", "6"),
            ("LOG_COLLECTOR_DNS_ADDRESS", "failover.example.com"),
            ("LOG_COLLECTOR_INPUT_FORMAT", "LINES"),
            ("LOG_COLLECTOR_SKIP_MALFORMED", "true"),
            ("LOG_COLLECTOR_FILTER_RULES", "/etc/log-collector/rules.json"),
            ("LOG_COLLECTOR_LOG_LEVEL", "DEBUG"),
            ("HTTPS_PROXY", "http://proxy:3128"),
        ]))
        .unwrap();

        assert_eq!(config.env.as_deref(), Some("prod"));
        assert_eq!(config.workers, 2);
        assert_eq!(config.queue_capacity, 16);
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.batch_interval_secs, 5);
        assert_eq!(config.compression_level, Some(6));
        assert_eq!(config.input_format, InputFormat::Lines);
        assert_eq!(config.malformed_policy(), MalformedPolicy::Skip);
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.https_proxy.as_deref(), Some("http://proxy:3128"));
        assert_eq!(
            config.filter_rules_path,
            Some(PathBuf::from("/etc/log-collector/rules.json"))
        );

        assert_eq!(config.dns_address.as_deref(), Some("failover.example.com"));

        let SinkTarget::Http(sink) = config.sink_target().unwrap() else {
            panic!("SINK_URL should write over plain HTTP");
        };
        assert_eq!(sink.endpoint, "http://127.0.0.1:9000/");
        assert_eq!(sink.key_prefix, "prod");
        assert_eq!(sink.retry_strategy, RetryStrategy::LinearBackoff(1, 100));
    }

    #[test]
    fn test_prefixed_proxy_wins() {
        let config = Config::from_lookup(lookup(&[
            ("LOG_COLLECTOR_BUCKET", "b"),
            ("LOG_COLLECTOR_HTTPS_PROXY", "http://mine:3128"),
            ("HTTPS_PROXY", "http://global:3128"),
        ]))
        .unwrap();
        assert_eq!(config.https_proxy.as_deref(), Some("http://mine:3128"));
    }

    #[test]
    fn test_unparsable_number() {
        let err = Config::from_lookup(lookup(&[
            ("LOG_COLLECTOR_BUCKET", "b"),
            ("LOG_COLLECTOR_WORKERS", "eight"),
        ]))
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid value 'eight' for LOG_COLLECTOR_WORKERS"
        );
    }

    #[test]
    fn test_unknown_input_format() {
        let err = Config::from_lookup(lookup(&[
            ("LOG_COLLECTOR_BUCKET", "b"),
            ("LOG_COLLECTOR_INPUT_FORMAT", "xml"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
    }

    #[test]
    fn test_missing_destination() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(err.to_string().contains("LOG_COLLECTOR_BUCKET"));
    }

    #[test]
    fn test_validate_zero_values() {
        for config in [
            Config { workers: 0, ..valid() },
            Config { queue_capacity: 0, ..valid() },
            Config { batch_size: 0, ..valid() },
            Config { batch_interval_secs: 0, ..valid() },
        ] {
            assert!(config.validate().is_err(), "{config:?}");
        }
    }

    #[test]
    fn test_validate_compression_level() {
        let config = Config {
            compression_level: Some(3),
            ..valid()
        };
        assert!(config.validate().is_ok());
        let config = Config {
            compression_level: Some(1000),
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_dns_address_with_env_accepted() {
        let config = Config::from_lookup(lookup(&[
            ("LOG_COLLECTOR_BUCKET", "b"),
            ("LOG_COLLECTOR_DNS_ADDRESS", "google.com"),
            ("LOG_COLLECTOR_ENV", "go"),
        ]))
        .unwrap();
        assert_eq!(config.dns_address.as_deref(), Some("google.com"));
        assert_eq!(config.env.as_deref(), Some("go"));
    }

    #[test]
    fn test_dns_address_without_env_rejected() {
        let err = Config::from_lookup(lookup(&[
            ("LOG_COLLECTOR_BUCKET", "b"),
            ("LOG_COLLECTOR_DNS_ADDRESS", "google.com"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("LOG_COLLECTOR_ENV"), "{err}");
    }

    #[test]
    fn test_bucket_with_custom_endpoint() {
        let config = Config::from_lookup(lookup(&[
            ("LOG_COLLECTOR_BUCKET", "logs-bucket"),
            ("LOG_COLLECTOR_AWS_REGION", "us-east-1"),
            ("LOG_COLLECTOR_S3_ENDPOINT", "http://minio:9000"),
            ("LOG_COLLECTOR_S3_ACCESS_KEY_ID", "minio"),
            ("LOG_COLLECTOR_S3_SECRET_ACCESS_KEY", "minio123"),
            ("LOG_COLLECTOR_ENV", "prod"),
        ]))
        .unwrap();
        let SinkTarget::S3(sink) = config.sink_target().unwrap() else {
            panic!("expected an S3 target");
        };
        assert_eq!(sink.region, "us-east-1");
        assert_eq!(sink.endpoint.as_deref(), Some("http://minio:9000"));
        assert_eq!(sink.access_key_id.as_deref(), Some("minio"));
        assert_eq!(sink.secret_access_key.as_deref(), Some("minio123"));
        assert_eq!(sink.key_prefix, "prod");
    }

    #[test]
    fn test_half_credentials_rejected() {
        let config = Config {
            s3_access_key_id: Some("minio".into()),
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_valid_log_levels() {
        for level in ["trace", "debug", "info", "warn", "error"] {
            let config = Config {
                log_level: level.to_string(),
                ..valid()
            };
            assert!(config.validate().is_ok(), "Log level '{level}' should be valid");
        }
        let config = Config {
            log_level: "verbose".to_string(),
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_filter_rules_default_without_path() {
        assert_eq!(valid().filter_rules().unwrap(), FilterRules::default());
        let config = Config {
            filter_rules_path: Some(PathBuf::from("/nonexistent/rules.json")),
            ..valid()
        };
        assert!(matches!(
            config.filter_rules(),
            Err(ConfigError::Rules { .. })
        ));
    }
}
