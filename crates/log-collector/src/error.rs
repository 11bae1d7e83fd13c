// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use reqwest::StatusCode;

/// Errors raised while turning the input stream into records or lines.
///
/// Every variant is a fatal stream error unless the decoder was built to skip
/// malformed units, in which case only `Io` can still surface.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed input unit: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("input ended in the middle of a unit ({0} bytes left)")]
    Truncated(usize),

    #[error("input unit exceeds {0} bytes")]
    TooLarge(usize),

    #[error("failed to read input: {0}")]
    Io(#[from] std::io::Error),
}

impl From<tokio_util::codec::LinesCodecError> for DecodeError {
    fn from(err: tokio_util::codec::LinesCodecError) -> Self {
        match err {
            tokio_util::codec::LinesCodecError::MaxLineLengthExceeded => {
                DecodeError::TooLarge(crate::constants::MAX_UNIT_SIZE_BYTES)
            }
            tokio_util::codec::LinesCodecError::Io(e) => DecodeError::Io(e),
        }
    }
}

/// Errors returned by a [`crate::sink::Sink`] for one payload.
#[derive(Debug, thiserror::Error)]
pub enum ShippingError {
    /// The payload could not be prepared (compression, request building). Not retried.
    #[error("failed to prepare payload: {0}")]
    Payload(String),

    /// The destination rejected the payload or could not be reached.
    #[error("destination error {0:?}: {1}")]
    Destination(Option<StatusCode>, String),
}

impl ShippingError {
    /// 4xx answers will not get better by sending the same payload again.
    pub fn is_permanent(&self) -> bool {
        match self {
            ShippingError::Payload(_) => true,
            ShippingError::Destination(status, _) => {
                status.is_some_and(|code| code.is_client_error())
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("dispatcher is stopped, payload of {0} events was not queued")]
    Stopped(usize),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid value '{value}' for {key}")]
    InvalidValue { key: String, value: String },

    #[error("Failed to read filter rules from {path}: {reason}")]
    Rules { path: String, reason: String },
}

/// Top level failure of a pipeline run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("failed to build sink client: {0}")]
    Sink(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = ConfigError::InvalidConfig("batch size must be greater than 0".to_string());
        assert_eq!(
            error.to_string(),
            "Invalid configuration: batch size must be greater than 0"
        );

        let error = DecodeError::Truncated(12);
        assert_eq!(
            error.to_string(),
            "input ended in the middle of a unit (12 bytes left)"
        );
    }

    #[test]
    fn test_shipping_error_permanence() {
        assert!(ShippingError::Payload("bad".into()).is_permanent());
        assert!(
            ShippingError::Destination(Some(StatusCode::FORBIDDEN), String::new()).is_permanent()
        );
        assert!(!ShippingError::Destination(
            Some(StatusCode::SERVICE_UNAVAILABLE),
            String::new()
        )
        .is_permanent());
        assert!(!ShippingError::Destination(None, "connection reset".into()).is_permanent());
    }

    #[test]
    fn test_lines_codec_error_conversion() {
        let err: DecodeError = tokio_util::codec::LinesCodecError::MaxLineLengthExceeded.into();
        assert!(matches!(err, DecodeError::TooLarge(_)));
    }
}
