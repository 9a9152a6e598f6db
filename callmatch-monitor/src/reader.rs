//! Read ring events from the call monitor and hand them to an `EventSink`.
use std::time;

use async_trait::async_trait;
use futures::StreamExt;
use health::HealthHandle;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use callmatch_common::retry::RetryPolicy;
use callmatch_common::ringqueue::{RingQueue, SubmitOutcome};

use crate::codec::CallMonitorCodec;
use crate::config::MonitorConfig;
use crate::error::ReaderError;
use crate::parser::{parse_line, RingEvent};
use crate::sweeper::Cleaner;

/// Enumeration of states of the connection to the call monitor.
/// Disconnected: No connection, possibly waiting to reconnect.
/// Connecting: A connection attempt is in flight.
/// Connected: Reading lines. Idle periods do not leave this state.
/// Failed: Terminal, every connection attempt allowed by the retry policy failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Destination of every relevant ring event.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn submit(&self, event: &RingEvent) -> SubmitOutcome;
}

#[async_trait]
impl EventSink for RingQueue {
    async fn submit(&self, event: &RingEvent) -> SubmitOutcome {
        self.submit_raw_event(&event.caller_number, &event.called_number)
            .await
    }
}

#[derive(Debug, Clone)]
pub struct ReaderSettings {
    /// host:port of the call monitor.
    pub endpoint: String,
    pub destination_number: String,
    pub connect_timeout: time::Duration,
    /// Longest wait for data before the loop gets to run maintenance.
    pub read_timeout: time::Duration,
    /// Wait after a connection drops before reconnecting.
    pub reconnect_delay: time::Duration,
    pub max_line_length: usize,
    pub retry_policy: RetryPolicy,
}

impl ReaderSettings {
    pub fn new(config: &MonitorConfig, retry_policy: RetryPolicy) -> Self {
        Self {
            endpoint: config.endpoint(),
            destination_number: config.destination_number.as_str().to_owned(),
            connect_timeout: config.connect_timeout.0,
            read_timeout: config.read_timeout.0,
            reconnect_delay: config.reconnect_delay.0,
            max_line_length: config.max_line_length,
            retry_policy,
        }
    }

    /// The longest the reader goes without reporting healthy while it is working as intended.
    pub fn liveness_deadline(&self) -> time::Duration {
        let longest_wait = [
            self.connect_timeout,
            self.read_timeout,
            self.reconnect_delay,
            self.retry_policy
                .retry_interval(self.retry_policy.max_attempts),
        ]
        .into_iter()
        .max()
        .unwrap_or(self.read_timeout);

        longest_wait.saturating_mul(2)
    }
}

/// How a connection ended.
enum Closed {
    Shutdown,
    Disconnected,
}

/// Holds a connection to the call monitor, reconnecting with backoff, and forwards ring events
/// for the destination number to an `EventSink`.
pub struct CallMonitorReader<S> {
    settings: ReaderSettings,
    sink: S,
    /// Run after every read cycle.
    cleaner: Box<dyn Cleaner + Send + Sync>,
    liveness: HealthHandle,
    state: watch::Sender<ReaderState>,
}

impl<S: EventSink> CallMonitorReader<S> {
    pub fn new(
        settings: ReaderSettings,
        sink: S,
        cleaner: Box<dyn Cleaner + Send + Sync>,
        liveness: HealthHandle,
    ) -> Self {
        let (state, _) = watch::channel(ReaderState::Disconnected);

        Self {
            settings,
            sink,
            cleaner,
            liveness,
            state,
        }
    }

    /// Observe state transitions of this reader.
    pub fn subscribe(&self) -> watch::Receiver<ReaderState> {
        self.state.subscribe()
    }

    /// Run until `shutdown` is cancelled, returning `Ok`, or until the retry policy is exhausted.
    pub async fn run(&mut self, shutdown: CancellationToken) -> Result<(), ReaderError> {
        let mut failed_attempts = 0;

        loop {
            self.transition(ReaderState::Connecting);

            let connected = tokio::select! {
                _ = shutdown.cancelled() => {
                    self.transition(ReaderState::Disconnected);
                    return Ok(());
                }
                connected = self.connect() => connected,
            };

            match connected {
                Ok(stream) => {
                    failed_attempts = 0;
                    self.transition(ReaderState::Connected);
                    metrics::counter!("callmatch_reader_connects_total").increment(1);

                    let closed = self.read_until_closed(stream, &shutdown).await;
                    self.transition(ReaderState::Disconnected);

                    if let Closed::Shutdown = closed {
                        return Ok(());
                    }
                    metrics::counter!("callmatch_reader_disconnects_total").increment(1);

                    info!(
                        "reconnecting to {} in {:?}",
                        self.settings.endpoint, self.settings.reconnect_delay
                    );
                    if !self.wait(self.settings.reconnect_delay, &shutdown).await {
                        return Ok(());
                    }
                }
                Err(error) => {
                    failed_attempts += 1;
                    warn!(
                        "failed to connect to {} (attempt {}): {}",
                        self.settings.endpoint, failed_attempts, error
                    );

                    if self.settings.retry_policy.is_exhausted(failed_attempts) {
                        self.transition(ReaderState::Failed);
                        return Err(ReaderError::RetriesExhausted {
                            endpoint: self.settings.endpoint.clone(),
                            attempts: failed_attempts,
                        });
                    }

                    self.transition(ReaderState::Disconnected);
                    let backoff = self.settings.retry_policy.retry_interval(failed_attempts);
                    info!("retrying in {:?}", backoff);
                    if !self.wait(backoff, &shutdown).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn connect(&self) -> std::io::Result<TcpStream> {
        info!("connecting to call monitor at {}", self.settings.endpoint);

        match tokio::time::timeout(
            self.settings.connect_timeout,
            TcpStream::connect(&self.settings.endpoint),
        )
        .await
        {
            Ok(connected) => connected,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("no connection within {:?}", self.settings.connect_timeout),
            )),
        }
    }

    async fn read_until_closed(&mut self, stream: TcpStream, shutdown: &CancellationToken) -> Closed {
        let mut lines = FramedRead::new(
            stream,
            CallMonitorCodec::new(self.settings.max_line_length),
        );

        loop {
            self.liveness.report_healthy();

            let next = tokio::select! {
                _ = shutdown.cancelled() => return Closed::Shutdown,
                next = tokio::time::timeout(self.settings.read_timeout, lines.next()) => next,
            };

            match next {
                // Idle: nothing to read, but a chance to run maintenance.
                Err(_) => {}
                Ok(Some(Ok(line))) => self.handle_line(&line).await,
                Ok(Some(Err(error))) => {
                    warn!("lost connection to call monitor: {}", error);
                    return Closed::Disconnected;
                }
                Ok(None) => {
                    warn!("call monitor closed the connection");
                    return Closed::Disconnected;
                }
            }

            self.cleaner.cleanup().await;
        }
    }

    async fn handle_line(&self, line: &str) {
        metrics::counter!("callmatch_ring_lines_total").increment(1);

        let event = match parse_line(line) {
            Ok(Some(event)) => event,
            Ok(None) => return,
            Err(error) => {
                warn!("discarding call monitor line {:?}: {}", line, error);
                metrics::counter!("callmatch_ring_parse_errors_total").increment(1);
                return;
            }
        };

        if !event.is_for(&self.settings.destination_number) {
            debug!(
                "ignoring call from {} to {}",
                event.caller_number, event.called_number
            );
            metrics::counter!("callmatch_ring_events_irrelevant_total").increment(1);
            return;
        }

        info!(
            connection_id = event.connection_id,
            line_id = event.line_id,
            source_timestamp = event.source_timestamp,
            "incoming call from {} to {}",
            event.caller_number,
            event.called_number
        );

        if let SubmitOutcome::Failed = self.sink.submit(&event).await {
            warn!(
                "ring event from {} was not stored, continuing",
                event.caller_number
            );
        }
    }

    /// Sleep for `duration` unless cancelled first. Returns false when cancelled.
    async fn wait(&self, duration: time::Duration, shutdown: &CancellationToken) -> bool {
        self.liveness.report_healthy();

        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    fn transition(&self, next: ReaderState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!("call monitor reader: {:?} -> {:?}", previous, next);
        }
    }
}
