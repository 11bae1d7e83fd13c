// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Default limits and tunables for the collector pipeline.

/// Maximum size in bytes of a single input unit (one JSON record or one line).
///
/// Anything larger is treated as a malformed unit by the decoders.
pub const MAX_UNIT_SIZE_BYTES: usize = 1_024 * 1_024;

/// Default maximum number of events sealed into one batch.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Default batch deadline, in seconds.
pub const DEFAULT_BATCH_INTERVAL_SECS: u64 = 10;

/// Default number of dispatcher workers delivering to the sink concurrently.
pub const DEFAULT_WORKERS: usize = 8;

/// Default capacity of the dispatcher queue. A full queue stalls intake.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default per-request timeout for the sink client, in seconds.
pub const DEFAULT_SINK_TIMEOUT_SECS: u64 = 5;

/// Default number of delivery attempts per batch.
pub const DEFAULT_SINK_RETRIES: u64 = 3;

/// Default period between two liveness lookups, in seconds.
pub const DEFAULT_LIVENESS_REFRESH_SECS: u64 = 60;

pub const DEFAULT_AWS_REGION: &str = "eu-west-1";
