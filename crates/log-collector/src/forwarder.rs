// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Intake loop: pulls events, batches them and flushes on size or deadline.
//!
//! A single task owns the source, the batch and the deadline. Each iteration waits on
//! whichever comes first of shutdown, deadline expiry and the next event. The deadline
//! is re-armed after every flush, whatever triggered it.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::aggregator::Aggregator;
use crate::dispatcher::{DispatchSummary, Dispatcher};
use crate::error::{DispatchError, PipelineError};
use crate::source::EventSource;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlushReason {
    Full,
    Deadline,
    Shutdown,
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            FlushReason::Full => "batch full",
            FlushReason::Deadline => "deadline",
            FlushReason::Shutdown => "shutdown",
        };
        f.write_str(reason)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ForwarderSummary {
    /// Events pulled from the source.
    pub events: u64,
    /// Non-empty batches handed to the dispatcher.
    pub batches: u64,
    pub dispatch: DispatchSummary,
}

pub struct Forwarder<S> {
    source: S,
    aggregator: Aggregator,
    dispatcher: Dispatcher,
    batch_interval: Duration,
    cancel: CancellationToken,
    events: u64,
    batches: u64,
}

impl<S: EventSource> Forwarder<S> {
    pub fn new(
        source: S,
        dispatcher: Dispatcher,
        batch_size: usize,
        batch_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Forwarder {
            source,
            aggregator: Aggregator::new(batch_size),
            dispatcher,
            batch_interval,
            cancel,
            events: 0,
            batches: 0,
        }
    }

    /// Runs until the source ends, fails, or shutdown is requested. Whatever the
    /// reason, the pending batch is flushed and the dispatcher drained before
    /// returning.
    pub async fn run(mut self) -> Result<ForwarderSummary, PipelineError> {
        info!(
            "FORWARDER | Started (batch size {}, batch interval {:?})",
            self.aggregator.max_batch_size(),
            self.batch_interval
        );

        let deadline = tokio::time::sleep(self.batch_interval);
        tokio::pin!(deadline);

        let outcome: Result<(), PipelineError> = loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => {
                    info!("FORWARDER | Shutdown requested, draining");
                    break Ok(());
                }
                () = &mut deadline => {
                    if let Err(e) = self.flush(FlushReason::Deadline).await {
                        break Err(e.into());
                    }
                    deadline.as_mut().reset(Instant::now() + self.batch_interval);
                }
                next = self.source.next_event() => match next {
                    Ok(Some(event)) => {
                        self.events += 1;
                        match self.accept(event).await {
                            Ok(true) => deadline.as_mut().reset(Instant::now() + self.batch_interval),
                            Ok(false) => {}
                            Err(e) => break Err(e.into()),
                        }
                    }
                    Ok(None) => {
                        debug!("FORWARDER | End of input");
                        break Ok(());
                    }
                    Err(e) => {
                        error!("FORWARDER | Input failed, stopping: {e}");
                        break Err(e.into());
                    }
                }
            }
        };

        let final_flush = self.flush(FlushReason::Shutdown).await;
        let Forwarder {
            dispatcher,
            events,
            batches,
            ..
        } = self;
        let dispatch = dispatcher.stop().await;

        outcome?;
        final_flush?;
        info!("FORWARDER | Stopped after {events} events in {batches} batches");
        Ok(ForwarderSummary {
            events,
            batches,
            dispatch,
        })
    }

    /// Adds an event to the batch, flushing when it fills up. Returns whether a flush
    /// happened.
    async fn accept(&mut self, event: String) -> Result<bool, DispatchError> {
        match self.aggregator.push(event) {
            Ok(false) => Ok(false),
            Ok(true) => self.flush(FlushReason::Full).await.map(|()| true),
            Err(event) => {
                self.flush(FlushReason::Full).await?;
                let full = self.aggregator.push(event).unwrap_or(true);
                if full {
                    self.flush(FlushReason::Full).await?;
                }
                Ok(true)
            }
        }
    }

    async fn flush(&mut self, reason: FlushReason) -> Result<(), DispatchError> {
        if self.aggregator.is_empty() {
            return Ok(());
        }
        debug!(
            "FORWARDER | Flushing {} events ({reason})",
            self.aggregator.len()
        );
        self.dispatcher.dispatch(self.aggregator.batch()).await?;
        self.aggregator.clear();
        self.batches += 1;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::dispatcher::tests::RecordingSink;
    use crate::error::DecodeError;
    use crate::payload::PayloadEncoder;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tracing_test::traced_test;

    const INTERVAL: Duration = Duration::from_secs(10);

    /// Replays a fixed script, then ends.
    struct ScriptedSource(VecDeque<Result<String, DecodeError>>);

    #[async_trait]
    impl EventSource for ScriptedSource {
        async fn next_event(&mut self) -> Result<Option<String>, DecodeError> {
            self.0.pop_front().transpose()
        }
    }

    /// Yields whatever the test sends; ends when the sender is dropped.
    struct ChannelSource(mpsc::Receiver<String>);

    #[async_trait]
    impl EventSource for ChannelSource {
        async fn next_event(&mut self) -> Result<Option<String>, DecodeError> {
            Ok(self.0.recv().await)
        }
    }

    fn event(i: usize) -> String {
        format!("event {i}")
    }

    fn scripted(n: usize) -> ScriptedSource {
        ScriptedSource((0..n).map(|i| Ok(event(i))).collect())
    }

    fn forwarder<S: EventSource>(
        source: S,
        sink: &Arc<RecordingSink>,
        batch_size: usize,
        cancel: CancellationToken,
    ) -> Forwarder<S> {
        let dispatcher = Dispatcher::start(sink.clone(), PayloadEncoder::new().unwrap(), 1, 4);
        Forwarder::new(source, dispatcher, batch_size, INTERVAL, cancel)
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_trigger_and_final_partial_batch() {
        let sink = Arc::new(RecordingSink::default());
        let summary = forwarder(scripted(25), &sink, 10, CancellationToken::new())
            .run()
            .await
            .unwrap();

        assert_eq!(summary.events, 25);
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.dispatch.delivered, 3);
        let batches = sink.batches();
        assert_eq!(
            batches.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![10, 10, 5]
        );
        assert_eq!(batches.concat(), (0..25).map(event).collect::<Vec<_>>());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_multiple_has_no_trailing_batch() {
        let sink = Arc::new(RecordingSink::default());
        let summary = forwarder(scripted(20), &sink, 10, CancellationToken::new())
            .run()
            .await
            .unwrap();
        assert_eq!(summary.batches, 2);
        assert_eq!(sink.batches().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_flushes_partial_batch() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(
            forwarder(ChannelSource(rx), &sink, 100, CancellationToken::new()).run(),
        );

        for i in 0..3 {
            tx.send(event(i)).await.unwrap();
        }
        tokio::time::sleep(INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(sink.batches(), vec![vec![event(0), event(1), event(2)]]);

        tx.send(event(3)).await.unwrap();
        drop(tx);
        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.batches, 2);
        assert_eq!(sink.batches()[1], vec![event(3)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_deadlines_dispatch_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = mpsc::channel::<String>(1);
        let task = tokio::spawn(
            forwarder(ChannelSource(rx), &sink, 10, CancellationToken::new()).run(),
        );
        tokio::time::sleep(INTERVAL * 5).await;
        drop(tx);

        let summary = task.await.unwrap().unwrap();
        assert_eq!(summary.batches, 0);
        assert_eq!(summary.dispatch.enqueued, 0);
        assert!(sink.batches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_flush_rearms_deadline() {
        let sink = Arc::new(RecordingSink::default());
        let (tx, rx) = mpsc::channel(16);
        let task = tokio::spawn(
            forwarder(ChannelSource(rx), &sink, 2, CancellationToken::new()).run(),
        );

        tokio::time::sleep(Duration::from_secs(8)).await;
        tx.send(event(0)).await.unwrap();
        tx.send(event(1)).await.unwrap();
        tx.send(event(2)).await.unwrap();
        // the original deadline (t=10s) must not cut the second batch short
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(sink.batches().len(), 1);

        tokio::time::sleep(Duration::from_secs(8)).await;
        assert_eq!(sink.batches().len(), 2);
        drop(tx);
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_shutdown_flushes_and_drains() {
        let sink = Arc::new(RecordingSink::default());
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(16);
        let run = forwarder(ChannelSource(rx), &sink, 10, cancel.clone()).run();
        let drive = async {
            tx.send(event(0)).await.unwrap();
            tx.send(event(1)).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        };

        let (result, ()) = tokio::join!(run, drive);
        let summary = result.unwrap();
        assert_eq!(summary.events, 2);
        assert_eq!(sink.batches(), vec![vec![event(0), event(1)]]);
        assert!(logs_contain("Shutdown requested"));
        assert!(logs_contain("Flushing 2 events (shutdown)"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_input_error_still_flushes() {
        let sink = Arc::new(RecordingSink::default());
        let mut script = scripted(3).0;
        script.push_back(Err(DecodeError::Truncated(7)));
        script.push_back(Ok(event(99)));

        let result = forwarder(ScriptedSource(script), &sink, 10, CancellationToken::new())
            .run()
            .await;

        assert!(matches!(
            result,
            Err(PipelineError::Decode(DecodeError::Truncated(7)))
        ));
        assert_eq!(sink.batches(), vec![vec![event(0), event(1), event(2)]]);
    }
}
