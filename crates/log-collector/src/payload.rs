// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sink wire format.
//!
//! Each event becomes one HEC style document, `{"event": "<event>", "time": <epoch>}`,
//! where `time` is epoch seconds with a millisecond fraction. Documents of one batch
//! are joined by a single space into one payload.

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use tracing::debug;

const TIMESTAMP_PATTERN: &str = r"([0-9]+)-(0[1-9]|1[012])-(0[1-9]|[12][0-9]|3[01])[Tt]([01][0-9]|2[0-3]):([0-5][0-9]):([0-5][0-9]|60)(.[0-9]+)?(([Zz])|([+|-]([01][0-9]|2[0-3]):[0-5][0-9]))";

/// Serialized form of one batch, owned by the delivery attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchUnit {
    pub body: String,
    pub events: usize,
}

#[derive(Serialize)]
struct HecEvent<'a> {
    event: &'a str,
    time: f64,
}

#[derive(Debug, Clone)]
pub struct PayloadEncoder {
    timestamp: Regex,
}

impl PayloadEncoder {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(PayloadEncoder {
            timestamp: Regex::new(TIMESTAMP_PATTERN)?,
        })
    }

    pub fn encode(&self, events: &[String]) -> Result<DispatchUnit, serde_json::Error> {
        self.encode_at(events, Utc::now())
    }

    /// Encodes a batch, stamping events without a usable timestamp with `now`.
    pub fn encode_at(
        &self,
        events: &[String],
        now: DateTime<Utc>,
    ) -> Result<DispatchUnit, serde_json::Error> {
        let mut body = String::with_capacity(events.iter().map(|e| e.len() + 48).sum());
        for event in events {
            if !body.is_empty() {
                body.push(' ');
            }
            let document = HecEvent {
                event,
                time: self.event_time(event, now),
            };
            body.push_str(&serde_json::to_string(&document)?);
        }
        Ok(DispatchUnit {
            body,
            events: events.len(),
        })
    }

    /// First RFC 3339 looking timestamp in the event, falling back to `now`.
    pub fn event_time(&self, event: &str, now: DateTime<Utc>) -> f64 {
        let time = self
            .timestamp
            .find(event)
            .and_then(|m| match DateTime::parse_from_rfc3339(m.as_str()) {
                Ok(time) => Some(time.with_timezone(&Utc)),
                Err(e) => {
                    debug!("PAYLOAD | Ignoring timestamp {}: {e}", m.as_str());
                    None
                }
            })
            .unwrap_or(now);
        epoch_with_millis(time)
    }
}

#[allow(clippy::cast_precision_loss)]
fn epoch_with_millis(time: DateTime<Utc>) -> f64 {
    time.timestamp() as f64 + f64::from(time.timestamp_subsec_millis()) / 1000.0
}
