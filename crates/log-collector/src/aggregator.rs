// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use tracing::warn;

/// Ordered batch of serialized events, bounded by `max_batch_size`.
///
/// The backing vector is allocated once and reused: [`Aggregator::clear`] keeps the
/// capacity so steady-state batching does not allocate.
#[derive(Debug)]
pub struct Aggregator {
    events: Vec<String>,
    max_batch_size: usize,
}

impl Aggregator {
    #[must_use]
    pub fn new(max_batch_size: usize) -> Self {
        let max_batch_size = max_batch_size.max(1);
        Aggregator {
            events: Vec::with_capacity(max_batch_size),
            max_batch_size,
        }
    }

    /// Appends an event and reports whether the batch is now full. An event pushed
    /// into a full batch is rejected and handed back.
    pub fn push(&mut self, event: String) -> Result<bool, String> {
        if self.is_full() {
            warn!("AGGREGATOR | Batch already holds {} events", self.events.len());
            return Err(event);
        }
        self.events.push(event);
        Ok(self.is_full())
    }

    pub fn is_full(&self) -> bool {
        self.events.len() >= self.max_batch_size
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// The sealed view of the current batch, without unused capacity.
    pub fn batch(&self) -> &[String] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
