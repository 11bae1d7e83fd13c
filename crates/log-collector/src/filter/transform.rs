// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pure per-field helpers used by the filter. None of them touch a [`crate::record::Record`].

use std::borrow::Cow;

use regex::{Captures, Regex};
use serde_json::{Map, Value};

use super::rules::POD_SENTINEL;

/// Replacement appended to the visible half of a redacted key.
pub const REDACTION_MASK: &str = "********";

const API_KEY_PATTERN: &str = r"(?i:api_?key)=([^\s&]+)";
const TRANSACTION_ID_PATTERN: &str = r"\btransaction_id=([A-Za-z0-9\-_:]+)";

/// Compiled regexes shared by every record.
#[derive(Debug, Clone)]
pub struct Patterns {
    api_key: Regex,
    transaction_id: Regex,
}

impl Patterns {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Patterns {
            api_key: Regex::new(API_KEY_PATTERN)?,
            transaction_id: Regex::new(TRANSACTION_ID_PATTERN)?,
        })
    }

    /// Masks the second half of every `apiKey=` / `api_key=` value, left to right.
    pub fn redact_api_keys<'a>(&self, message: &'a str) -> Cow<'a, str> {
        self.api_key.replace_all(message, |caps: &Captures| {
            let whole = &caps[0];
            let value = &caps[1];
            let name = &whole[..whole.len() - value.len() - 1];
            let visible: String = value.chars().take(value.chars().count() / 2).collect();
            format!("{name}={visible}{REDACTION_MASK}")
        })
    }

    /// First `transaction_id=<token>` in the message, if any.
    pub fn transaction_id<'a>(&self, message: &'a str) -> Option<&'a str> {
        self.transaction_id
            .captures(message)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }
}

/// Service and pod parsed out of a kubelet container name
/// (`k8s_<service>.<hash>_<pod>_<namespace>_...`).
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ContainerName<'a> {
    pub service: &'a str,
    pub pod: &'a str,
}

impl<'a> ContainerName<'a> {
    /// Both parts are empty unless the value is a string with at least three `_` tokens.
    pub fn parse(value: Option<&'a Value>) -> Self {
        let Some(name) = value.and_then(Value::as_str) else {
            return ContainerName::default();
        };
        let mut tokens = name.split('_');
        match (tokens.next(), tokens.next(), tokens.next()) {
            (Some(_), Some(service), Some(pod)) => ContainerName {
                service: service.split('.').next().unwrap_or_default(),
                pod,
            },
            _ => ContainerName::default(),
        }
    }

    /// The service name worth recording on the record.
    pub fn recordable_service(&self) -> Option<&'a str> {
        (!self.service.is_empty() && self.service != POD_SENTINEL).then_some(self.service)
    }
}

/// Reads the message field, undoing the string-to-number-array corruption some
/// upstream round trips apply. Arrays with a non-numeric element and any other
/// non-string value read as `None`.
pub fn repair_message(value: Option<&Value>) -> Option<Cow<'_, str>> {
    match value? {
        Value::String(s) => Some(Cow::Borrowed(s.as_str())),
        Value::Array(items) => {
            let bytes = items
                .iter()
                .map(|item| item.as_f64().map(byte_of))
                .collect::<Option<Vec<u8>>>()?;
            Some(Cow::Owned(String::from_utf8_lossy(&bytes).into_owned()))
        }
        _ => None,
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn byte_of(n: f64) -> u8 {
    // wraps like a C byte conversion
    (n as i64) as u8
}

/// Multi-line messages arrive with `|` standing in for newlines.
pub fn unescape_newlines(message: &str) -> String {
    message.replace('|', "\n")
}

/// Best effort parse of a message carrying a JSON object.
pub fn parse_json_object(message: &str) -> Option<Map<String, Value>> {
    if !message.trim_start().starts_with('{') {
        return None;
    }
    match serde_json::from_str(message) {
        Ok(Value::Object(map)) => Some(map),
        _ => None,
    }
}
