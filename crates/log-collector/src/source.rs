// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Event sources feeding the forwarder.
//!
//! An event is the serialized text of one record that survived filtering. The
//! forwarder races [`EventSource::next_event`] against its flush deadline, so every
//! implementation must be cancel safe: dropping the future before it resolves must not
//! lose an event.

use async_trait::async_trait;
use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::debug;

use crate::decoder::{line_reader, record_reader, MalformedPolicy, RecordCodec};
use crate::error::DecodeError;
use crate::filter::LogFilter;

#[async_trait]
pub trait EventSource: Send {
    /// Next event, `Ok(None)` at end of stream.
    async fn next_event(&mut self) -> Result<Option<String>, DecodeError>;
}

#[async_trait]
impl<S: EventSource + ?Sized> EventSource for Box<S> {
    async fn next_event(&mut self) -> Result<Option<String>, DecodeError> {
        (**self).next_event().await
    }
}

/// Forwards newline-delimited input as is, minus the `\n` or `\r\n` terminator.
/// Blank lines are skipped.
pub struct LineSource<R> {
    lines: FramedRead<R, LinesCodec>,
}

impl<R: AsyncRead + Unpin + Send> LineSource<R> {
    pub fn new(reader: R) -> Self {
        LineSource {
            lines: line_reader(reader),
        }
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> EventSource for LineSource<R> {
    async fn next_event(&mut self) -> Result<Option<String>, DecodeError> {
        while let Some(line) = self.lines.next().await {
            let line = line?;
            if !line.trim().is_empty() {
                return Ok(Some(line));
            }
        }
        Ok(None)
    }
}

/// Decodes JSON records, runs them through the filter and yields the survivors
/// re-serialized on a single line.
pub struct FilteredSource<R> {
    records: FramedRead<R, RecordCodec>,
    filter: LogFilter,
    dropped: u64,
}

impl<R: AsyncRead + Unpin + Send> FilteredSource<R> {
    pub fn new(reader: R, filter: LogFilter, policy: MalformedPolicy) -> Self {
        FilteredSource {
            records: record_reader(reader, policy),
            filter,
            dropped: 0,
        }
    }

    /// Records rejected by the filter so far.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> EventSource for FilteredSource<R> {
    async fn next_event(&mut self) -> Result<Option<String>, DecodeError> {
        while let Some(record) = self.records.next().await {
            let decision = self.filter.process(record?);
            if !decision.keep {
                self.dropped += 1;
                continue;
            }
            return Ok(Some(serde_json::to_string(&decision.record)?));
        }
        debug!(
            "SOURCE | End of input, {} records filtered out, {} malformed units skipped",
            self.dropped,
            self.records.decoder().skipped()
        );
        Ok(None)
    }
}
