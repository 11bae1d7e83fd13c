// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded hand-off between the intake loop and the sink.
//!
//! Sealed batches are encoded on the caller's task and pushed on a bounded queue read
//! by a fixed pool of workers. A full queue makes [`Dispatcher::enqueue`] wait, which
//! is the only backpressure in the pipeline. Workers deliver independently, so two
//! batches may reach the sink out of submission order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::error::DispatchError;
use crate::payload::{DispatchUnit, PayloadEncoder};
use crate::sink::Sink;

#[derive(Debug, Default)]
struct DispatchStats {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// Counters reported once the dispatcher has drained.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub enqueued: u64,
    pub delivered: u64,
    pub failed: u64,
    /// Batches queued but never handed to the sink, because every worker died.
    pub abandoned: u64,
}

pub struct Dispatcher {
    tx: mpsc::Sender<DispatchUnit>,
    workers: JoinSet<()>,
    encoder: PayloadEncoder,
    stats: Arc<DispatchStats>,
}

impl Dispatcher {
    /// Spawns `workers` delivery tasks reading a queue of `queue_capacity` batches.
    pub fn start(
        sink: Arc<dyn Sink>,
        encoder: PayloadEncoder,
        workers: usize,
        queue_capacity: usize,
    ) -> Self {
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let stats = Arc::new(DispatchStats::default());

        let mut set = JoinSet::new();
        for id in 0..workers.max(1) {
            set.spawn(worker(
                id,
                Arc::clone(&rx),
                Arc::clone(&sink),
                Arc::clone(&stats),
            ));
        }
        info!(
            "DISPATCHER | Started {} workers, queue capacity {}",
            workers.max(1),
            queue_capacity.max(1)
        );

        Dispatcher {
            tx,
            workers: set,
            encoder,
            stats,
        }
    }

    /// Encodes a sealed batch and queues it. Empty batches are ignored.
    pub async fn dispatch(&self, events: &[String]) -> Result<(), DispatchError> {
        if events.is_empty() {
            return Ok(());
        }
        match self.encoder.encode(events) {
            Ok(unit) => self.enqueue(unit).await,
            Err(e) => {
                error!(
                    "DISPATCHER | Failed to encode batch of {} events: {e}",
                    events.len()
                );
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
        }
    }

    /// Queues an encoded batch, waiting while the queue is full.
    pub async fn enqueue(&self, unit: DispatchUnit) -> Result<(), DispatchError> {
        let events = unit.events;
        self.tx
            .send(unit)
            .await
            .map_err(|_| DispatchError::Stopped(events))?;
        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Closes the queue and waits until the workers have handed every queued batch to
    /// the sink. There is no timeout: a hanging sink keeps this pending.
    pub async fn stop(self) -> DispatchSummary {
        let Dispatcher {
            tx,
            mut workers,
            stats,
            ..
        } = self;
        drop(tx);

        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("DISPATCHER | Worker terminated abnormally: {e}");
            }
        }

        let enqueued = stats.enqueued.load(Ordering::Relaxed);
        let delivered = stats.delivered.load(Ordering::Relaxed);
        let failed = stats.failed.load(Ordering::Relaxed);
        let summary = DispatchSummary {
            enqueued,
            delivered,
            failed,
            abandoned: enqueued.saturating_sub(delivered + failed),
        };
        info!(
            "DISPATCHER | Stopped: {} delivered, {} failed, {} abandoned",
            summary.delivered, summary.failed, summary.abandoned
        );
        summary
    }
}

async fn worker(
    id: usize,
    rx: Arc<Mutex<mpsc::Receiver<DispatchUnit>>>,
    sink: Arc<dyn Sink>,
    stats: Arc<DispatchStats>,
) {
    loop {
        let next = rx.lock().await.recv().await;
        let Some(unit) = next else {
            break;
        };
        match sink.put(&unit).await {
            Ok(()) => {
                stats.delivered.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                error!(
                    "DISPATCHER | Failed to deliver batch of {} events: {e}",
                    unit.events
                );
            }
        }
    }
    debug!("DISPATCHER | Worker {id} exiting");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ShippingError;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;
    use tokio::sync::Semaphore;
    use tracing_test::traced_test;

    /// Keeps every payload it receives.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub(crate) units: StdMutex<Vec<DispatchUnit>>,
    }

    impl RecordingSink {
        pub(crate) fn batches(&self) -> Vec<Vec<String>> {
            self.units
                .lock()
                .unwrap()
                .iter()
                .map(|unit| {
                    serde_json::Deserializer::from_str(&unit.body)
                        .into_iter::<serde_json::Value>()
                        .map(|doc| doc.unwrap()["event"].as_str().unwrap().to_string())
                        .collect()
                })
                .collect()
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn put(&self, unit: &DispatchUnit) -> Result<(), ShippingError> {
            self.units.lock().unwrap().push(unit.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl Sink for FailingSink {
        async fn put(&self, _unit: &DispatchUnit) -> Result<(), ShippingError> {
            Err(ShippingError::Destination(None, "connection refused".into()))
        }
    }

    /// Each delivery waits for one permit.
    struct GatedSink {
        gate: Semaphore,
        inner: RecordingSink,
    }

    #[async_trait]
    impl Sink for GatedSink {
        async fn put(&self, unit: &DispatchUnit) -> Result<(), ShippingError> {
            self.gate.acquire().await.unwrap().forget();
            self.inner.put(unit).await
        }
    }

    fn events(range: std::ops::Range<usize>) -> Vec<String> {
        range.map(|i| format!("event {i}")).collect()
    }

    fn encoder() -> PayloadEncoder {
        PayloadEncoder::new().unwrap()
    }

    #[tokio::test]
    async fn test_delivers_every_batch_before_stop_returns() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Dispatcher::start(sink.clone(), encoder(), 4, 2);
        for i in 0..10 {
            dispatcher.dispatch(&events(i * 3..i * 3 + 3)).await.unwrap();
        }
        let summary = dispatcher.stop().await;

        assert_eq!(
            summary,
            DispatchSummary {
                enqueued: 10,
                delivered: 10,
                failed: 0,
                abandoned: 0
            }
        );
        let mut delivered: Vec<String> = sink.batches().into_iter().flatten().collect();
        delivered.sort_by_key(|e| e[6..].parse::<usize>().unwrap());
        assert_eq!(delivered, events(0..30));
    }

    #[tokio::test]
    async fn test_empty_batch_is_not_dispatched() {
        let sink = Arc::new(RecordingSink::default());
        let dispatcher = Dispatcher::start(sink.clone(), encoder(), 1, 1);
        dispatcher.dispatch(&[]).await.unwrap();
        assert_eq!(dispatcher.stop().await.enqueued, 0);
        assert!(sink.units.lock().unwrap().is_empty());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_sink_failures_are_counted() {
        let dispatcher = Dispatcher::start(Arc::new(FailingSink), encoder(), 2, 4);
        dispatcher.dispatch(&events(0..5)).await.unwrap();
        dispatcher.dispatch(&events(5..6)).await.unwrap();
        let summary = dispatcher.stop().await;

        assert_eq!(summary.failed, 2);
        assert_eq!(summary.delivered, 0);
        assert!(logs_contain("Stopped: 0 delivered, 2 failed, 0 abandoned"));
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        let sink = Arc::new(GatedSink {
            gate: Semaphore::new(0),
            inner: RecordingSink::default(),
        });
        let dispatcher = Dispatcher::start(sink.clone(), encoder(), 1, 1);

        // one batch held by the worker, one sitting in the queue
        dispatcher.dispatch(&events(0..1)).await.unwrap();
        dispatcher.dispatch(&events(1..2)).await.unwrap();
        let blocked = tokio::time::timeout(
            Duration::from_millis(50),
            dispatcher.dispatch(&events(2..3)),
        )
        .await;
        assert!(blocked.is_err(), "enqueue should wait for queue space");

        sink.gate.add_permits(3);
        dispatcher.dispatch(&events(3..4)).await.unwrap();
        let summary = dispatcher.stop().await;
        assert_eq!(summary.delivered, 3);
        assert_eq!(sink.inner.batches().concat(), ["event 0", "event 1", "event 3"]);
    }
}
