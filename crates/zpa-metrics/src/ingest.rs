// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Ingestion loop: keeps a log stream open forever and folds its lines into [`MetricState`].
//!
//! ```text
//!   Starting ──open ok──> Streaming ──EOF / exit / read error──> Backoff ──delay──> Starting
//!      │                     │                                      │
//!      └──────────── cancellation token ──────────────> Stopped <───┘
//! ```
//!
//! Stream failures are never fatal. While the stream is down the sinks keep serving the last
//! snapshot. Lines that do not parse are ignored without touching the state machine.

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::parser::parse;
use crate::source::{LineSource, LineStream};
use crate::state::MetricState;

pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_secs(2);
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestState {
    Starting,
    Streaming,
    Backoff,
    Stopped,
}

/// Published on every state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestStatus {
    pub state: IngestState,
    /// Number of streams established so far; the current session's id while streaming.
    pub generation: u64,
}

/// Capped exponential reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    #[must_use]
    pub fn new(initial: Duration, max: Duration) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Delay to wait now; doubles the following one up to the cap.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.saturating_mul(2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(DEFAULT_BACKOFF_INITIAL, DEFAULT_BACKOFF_MAX)
    }
}

/// A single established stream and the generation it was opened as.
struct StreamSession {
    generation: u64,
    stream: Box<dyn LineStream>,
    lines_read: u64,
}

enum SessionEnd {
    Failed,
    Cancelled,
}

pub struct Ingestor<S> {
    source: S,
    state: Arc<MetricState>,
    backoff: Backoff,
    cancel_token: CancellationToken,
    generation: u64,
    status: watch::Sender<IngestStatus>,
}

impl<S: LineSource> Ingestor<S> {
    #[must_use]
    pub fn new(
        source: S,
        state: Arc<MetricState>,
        backoff: Backoff,
        cancel_token: CancellationToken,
    ) -> Self {
        let (status, _) = watch::channel(IngestStatus {
            state: IngestState::Starting,
            generation: 0,
        });
        Self {
            source,
            state,
            backoff,
            cancel_token,
            generation: 0,
            status,
        }
    }

    /// Receiver for state transitions, usable for diagnostics and tests.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<IngestStatus> {
        self.status.subscribe()
    }

    fn set_state(&self, state: IngestState) {
        self.status.send_replace(IngestStatus {
            state,
            generation: self.generation,
        });
    }

    /// Runs until the cancellation token fires. Returns the number of streams opened.
    pub async fn run(mut self) -> u64 {
        debug!("Ingestion loop started");
        loop {
            self.set_state(IngestState::Starting);
            let opened = tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                opened = self.source.open() => opened,
            };

            let delay = match opened {
                Ok(stream) => {
                    self.generation += 1;
                    let mut session = StreamSession {
                        generation: self.generation,
                        stream,
                        lines_read: 0,
                    };
                    info!("Log stream established (generation {})", session.generation);
                    self.set_state(IngestState::Streaming);

                    let end = stream_lines(&self.cancel_token, &self.state, &mut session).await;
                    session.stream.close().await;
                    if matches!(end, SessionEnd::Cancelled) {
                        break;
                    }
                    if session.lines_read > 0 {
                        self.backoff.reset();
                    }
                    let delay = self.backoff.next_delay();
                    warn!(
                        "Log stream generation {} ended after {} lines, restarting in {:?}",
                        session.generation, session.lines_read, delay
                    );
                    delay
                }
                Err(e) => {
                    let delay = self.backoff.next_delay();
                    warn!("Failed to open log stream: {}. Retrying in {:?}", e, delay);
                    delay
                }
            };

            self.set_state(IngestState::Backoff);
            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(IngestState::Stopped);
        debug!("Ingestion loop stopped after {} streams", self.generation);
        self.generation
    }
}

/// Reads one session until it fails or the token fires, in emission order.
async fn stream_lines(
    cancel_token: &CancellationToken,
    state: &MetricState,
    session: &mut StreamSession,
) -> SessionEnd {
    loop {
        let next = tokio::select! {
            biased;
            () = cancel_token.cancelled() => return SessionEnd::Cancelled,
            next = session.stream.next_line() => next,
        };
        match next {
            Ok(Some(line)) => {
                session.lines_read += 1;
                handle_line(state, &line);
            }
            Ok(None) => {
                debug!("Log stream generation {} reached EOF", session.generation);
                return SessionEnd::Failed;
            }
            Err(e) => {
                warn!(
                    "Error reading log stream generation {}: {}",
                    session.generation, e
                );
                return SessionEnd::Failed;
            }
        }
    }
}

fn handle_line(state: &MetricState, line: &str) {
    let Some(event) = parse(line) else {
        return;
    };
    trace!("Parsed mtunnel line: {:?}", event);
    let now = SystemTime::now();
    state.apply(&event.observed_at(now), now);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::StreamError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;
    use tracing::Instrument;
    use tracing_test::traced_test;

    /// Each `open` hands out the next scripted session; after the script runs out it fails.
    struct ScriptedSource {
        sessions: VecDeque<Result<ScriptedStream, ()>>,
        opens: Arc<std::sync::atomic::AtomicU64>,
    }

    struct ScriptedStream {
        lines: VecDeque<String>,
        /// When set, the stream stays open after its lines until it receives more or is closed.
        live: Option<mpsc::UnboundedReceiver<String>>,
        closed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl LineSource for ScriptedSource {
        async fn open(&mut self) -> Result<Box<dyn LineStream>, StreamError> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            match self.sessions.pop_front() {
                Some(Ok(stream)) => Ok(Box::new(stream)),
                _ => Err(StreamError::MissingStdout("scripted".to_string())),
            }
        }
    }

    #[async_trait]
    impl LineStream for ScriptedStream {
        async fn next_line(&mut self) -> Result<Option<String>, StreamError> {
            if let Some(line) = self.lines.pop_front() {
                return Ok(Some(line));
            }
            match self.live.as_mut() {
                Some(rx) => Ok(rx.recv().await),
                None => Ok(None),
            }
        }

        async fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn stream(lines: &[&str]) -> (ScriptedStream, Arc<AtomicBool>) {
        let closed = Arc::new(AtomicBool::new(false));
        (
            ScriptedStream {
                lines: lines.iter().map(|l| (*l).to_string()).collect(),
                live: None,
                closed: Arc::clone(&closed),
            },
            closed,
        )
    }

    fn fast_backoff() -> Backoff {
        Backoff::new(Duration::from_millis(10), Duration::from_millis(40))
    }

    async fn wait_for_state(
        rx: &mut watch::Receiver<IngestStatus>,
        pred: impl FnMut(&IngestStatus) -> bool,
    ) -> IngestStatus {
        *tokio::time::timeout(Duration::from_secs(5), rx.wait_for(pred))
            .await
            .expect("timed out waiting for ingest state")
            .expect("status channel closed")
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(8));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        assert_eq!(backoff.next_delay(), Duration::from_secs(10));
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn test_backoff_max_below_initial_is_raised() {
        let mut backoff = Backoff::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
        assert_eq!(backoff.next_delay(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_lines_are_applied_in_order() {
        let (first, _) = stream(&[
            "Mtunnels(all), current active 5",
            "unrelated noise",
            "Mtunnels(all), current active 12",
            "Mtunnels(all), current active 3",
        ]);
        let state = Arc::new(MetricState::new());
        let cancel = CancellationToken::new();
        let source = ScriptedSource {
            sessions: VecDeque::from([Ok(first)]),
            opens: Arc::default(),
        };
        let ingestor = Ingestor::new(source, Arc::clone(&state), fast_backoff(), cancel.clone());
        let mut status = ingestor.subscribe();
        let task = tokio::spawn(ingestor.run());

        wait_for_state(&mut status, |s| s.state == IngestState::Backoff).await;
        let snapshot = state.snapshot();
        assert_eq!(snapshot.current_active["all"], 3);
        assert_eq!(snapshot.peak_active, 12);
        assert_eq!(snapshot.events_parsed, 3);
        assert!(snapshot.last_event_at.is_some());

        cancel.cancel();
        assert_eq!(task.await.unwrap(), 1);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_reconnects_after_stream_ends() {
        let (first, first_closed) = stream(&["Mtunnels(all), current active 7"]);
        let (tx, rx) = mpsc::unbounded_channel();
        let (mut second, _) = stream(&[]);
        second.live = Some(rx);

        let state = Arc::new(MetricState::new());
        let cancel = CancellationToken::new();
        let source = ScriptedSource {
            sessions: VecDeque::from([Ok(first), Err(()), Ok(second)]),
            opens: Arc::default(),
        };
        let ingestor = Ingestor::new(source, Arc::clone(&state), fast_backoff(), cancel.clone());
        let mut status = ingestor.subscribe();
        let task = tokio::spawn(ingestor.run().in_current_span());

        let streaming = wait_for_state(&mut status, |s| {
            s.state == IngestState::Streaming && s.generation == 2
        })
        .await;
        assert_eq!(streaming.generation, 2);
        assert!(first_closed.load(Ordering::SeqCst));
        assert_eq!(state.snapshot().current_active["all"], 7);

        tx.send("Mtunnels(all|hrb), current active 2|1".to_string())
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while state.snapshot().current_active.get("hrb").is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("second stream should update the state");
        let snapshot = state.snapshot();
        assert_eq!(snapshot.current_active["all"], 2);
        assert_eq!(snapshot.peak_active, 7);

        assert!(logs_contain("Log stream generation 1 ended"));
        assert!(logs_contain("Failed to open log stream"));

        cancel.cancel();
        assert_eq!(task.await.unwrap(), 2);
        assert_eq!(*status.borrow(), IngestStatus {
            state: IngestState::Stopped,
            generation: 2,
        });
    }

    #[tokio::test]
    async fn test_cancel_interrupts_blocking_read_and_closes_stream() {
        let (_tx, rx) = mpsc::unbounded_channel();
        let (mut live, closed) = stream(&["Mtunnels(all), current active 1"]);
        live.live = Some(rx);

        let state = Arc::new(MetricState::new());
        let cancel = CancellationToken::new();
        let source = ScriptedSource {
            sessions: VecDeque::from([Ok(live)]),
            opens: Arc::default(),
        };
        let ingestor = Ingestor::new(source, Arc::clone(&state), fast_backoff(), cancel.clone());
        let mut status = ingestor.subscribe();
        let task = tokio::spawn(ingestor.run());

        wait_for_state(&mut status, |s| s.state == IngestState::Streaming).await;
        state.wait_ready().await;
        cancel.cancel();

        let generations = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop should stop promptly")
            .unwrap();
        assert_eq!(generations, 1);
        assert!(closed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let opens = Arc::new(std::sync::atomic::AtomicU64::new(0));
        let source = ScriptedSource {
            sessions: VecDeque::new(),
            opens: Arc::clone(&opens),
        };
        let cancel = CancellationToken::new();
        let ingestor = Ingestor::new(
            source,
            Arc::new(MetricState::new()),
            Backoff::new(Duration::from_secs(3600), Duration::from_secs(3600)),
            cancel.clone(),
        );
        let mut status = ingestor.subscribe();
        let task = tokio::spawn(ingestor.run());

        wait_for_state(&mut status, |s| s.state == IngestState::Backoff).await;
        cancel.cancel();
        let generations = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("backoff sleep should be cancellable")
            .unwrap();
        assert_eq!(generations, 0);
        assert_eq!(opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_noise_only_stream_leaves_state_untouched() {
        let (noise, _) = stream(&["", "systemd[1]: Started zpa-connector.", "Mtunnels"]);
        let state = Arc::new(MetricState::new());
        let cancel = CancellationToken::new();
        let source = ScriptedSource {
            sessions: VecDeque::from([Ok(noise)]),
            opens: Arc::default(),
        };
        let ingestor = Ingestor::new(source, Arc::clone(&state), fast_backoff(), cancel.clone());
        let mut status = ingestor.subscribe();
        let task = tokio::spawn(ingestor.run());

        wait_for_state(&mut status, |s| s.state == IngestState::Backoff).await;
        assert_eq!(state.snapshot(), crate::state::MetricSnapshot::default());
        assert!(!state.is_ready());

        cancel.cancel();
        task.await.unwrap();
    }
}
