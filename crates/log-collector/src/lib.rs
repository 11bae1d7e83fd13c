// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host log collector.
//!
//! Journald style JSON records are decoded from a byte stream, screened against
//! blacklists, enriched and redacted by [`filter::LogFilter`], then batched by the
//! [`forwarder::Forwarder`] and shipped through a bounded worker pool
//! ([`dispatcher::Dispatcher`]) to a [`sink::Sink`].

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod aggregator;
pub mod config;
pub mod constants;
pub mod decoder;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod forwarder;
pub mod liveness;
pub mod payload;
pub mod pipeline;
pub mod record;
pub mod sink;
pub mod source;
