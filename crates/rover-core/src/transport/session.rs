use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ConnectionState, Connector, Endpoint, Frame, FrameSource, SessionEvent};
use crate::backoff::Backoff;
use crate::error::{ConfigurationError, TransportError};

const CLOSE_GRACE: Duration = Duration::from_secs(1);
const FINAL_EVENT_GRACE: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct SessionOptions {
    pub backoff: Backoff,
    pub handshake_timeout: Duration,
    pub channel_capacity: usize,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            backoff: Backoff::default(),
            handshake_timeout: Duration::from_secs(10),
            channel_capacity: 256,
        }
    }
}

struct Worker {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// One logical streaming connection with automatic reconnection.
pub struct TransportSession {
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    events_tx: mpsc::Sender<SessionEvent>,
    events_rx: Mutex<Option<mpsc::Receiver<SessionEvent>>>,
    worker: Mutex<Option<Worker>>,
}

impl TransportSession {
    pub fn new(connector: impl Connector, options: SessionOptions) -> Self {
        Self::with_connector(Arc::new(connector), options)
    }

    pub fn with_connector(connector: Arc<dyn Connector>, options: SessionOptions) -> Self {
        let (events_tx, events_rx) = mpsc::channel(options.channel_capacity.max(1));
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            connector,
            options,
            state_tx: Arc::new(state_tx),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            worker: Mutex::new(None),
        }
    }

    /// Hands out the ordered event channel. There is exactly one consumer per
    /// session; later calls return `None`.
    pub fn take_events(&self) -> Option<mpsc::Receiver<SessionEvent>> {
        self.events_rx.lock().take()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Starts the connection loop. A no-op while a loop is already running;
    /// only a malformed endpoint is reported.
    pub fn connect(&self, endpoint: &str) -> Result<(), ConfigurationError> {
        let endpoint = Endpoint::parse(endpoint)?;
        let mut worker = self.worker.lock();
        if let Some(active) = worker.as_ref() {
            if !active.task.is_finished() {
                debug!(
                    target: "rover::transport",
                    state = self.state().as_str(),
                    "connect ignored; session already active"
                );
                return Ok(());
            }
        }
        let cancel = CancellationToken::new();
        let link = Link {
            connector: Arc::clone(&self.connector),
            options: self.options.clone(),
            state_tx: Arc::clone(&self.state_tx),
            events_tx: self.events_tx.clone(),
            endpoint,
            cancel: cancel.clone(),
        };
        // Reflect the transition before the task is first polled so callers
        // observe CONNECTING immediately.
        self.state_tx.send_replace(ConnectionState::Connecting);
        let task = tokio::spawn(link.run());
        *worker = Some(Worker { cancel, task });
        Ok(())
    }

    /// Stops the loop, releases the connection and waits for the worker.
    pub async fn disconnect(&self) {
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            worker.cancel.cancel();
            if let Err(err) = worker.task.await {
                warn!(target: "rover::transport", error = %err, "session worker ended abnormally");
            }
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
    }
}

impl Drop for TransportSession {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.lock().take() {
            worker.cancel.cancel();
        }
    }
}

enum PumpEnd {
    Cancelled,
    ConsumerGone,
    Failed(TransportError),
}

struct Link {
    connector: Arc<dyn Connector>,
    options: SessionOptions,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    events_tx: mpsc::Sender<SessionEvent>,
    endpoint: Endpoint,
    cancel: CancellationToken,
}

impl Link {
    async fn run(self) {
        let mut failures: u32 = 0;
        loop {
            self.transition(ConnectionState::Connecting).await;
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = tokio::time::timeout(
                    self.options.handshake_timeout,
                    self.connector.open(&self.endpoint),
                ) => match res {
                    Ok(result) => result,
                    Err(_) => Err(TransportError::HandshakeTimeout(self.options.handshake_timeout)),
                },
            };
            match opened {
                Ok(mut source) => {
                    failures = 0;
                    self.transition(ConnectionState::Connected).await;
                    info!(target: "rover::transport", endpoint = %self.endpoint, "stream connected");
                    let end = self.pump(source.as_mut()).await;
                    let _ = tokio::time::timeout(CLOSE_GRACE, source.close()).await;
                    match end {
                        PumpEnd::Cancelled => break,
                        PumpEnd::ConsumerGone => {
                            debug!(target: "rover::transport", "event consumer dropped; stopping session");
                            break;
                        }
                        PumpEnd::Failed(err) => {
                            warn!(target: "rover::transport", endpoint = %self.endpoint, error = %err, "stream lost");
                        }
                    }
                }
                Err(err) => {
                    warn!(
                        target: "rover::transport",
                        endpoint = %self.endpoint,
                        error = %err,
                        failures = failures + 1,
                        "connect attempt failed"
                    );
                }
            }
            failures = failures.saturating_add(1);
            self.transition(ConnectionState::Reconnecting).await;
            let delay = self.options.backoff.delay(failures);
            debug!(target: "rover::transport", delay_ms = delay.as_millis() as u64, "reconnect scheduled");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        self.transition(ConnectionState::Disconnected).await;
        info!(target: "rover::transport", endpoint = %self.endpoint, "stream session stopped");
    }

    async fn pump(&self, source: &mut dyn FrameSource) -> PumpEnd {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                next = source.next_frame() => next,
            };
            match next {
                Ok(Some(text)) => {
                    let event = SessionEvent::Frame(Frame::new(text));
                    tokio::select! {
                        _ = self.cancel.cancelled() => return PumpEnd::Cancelled,
                        sent = self.events_tx.send(event) => {
                            if sent.is_err() {
                                return PumpEnd::ConsumerGone;
                            }
                        }
                    }
                }
                Ok(None) => return PumpEnd::Failed(TransportError::Closed),
                Err(err) => return PumpEnd::Failed(err),
            }
        }
    }

    async fn transition(&self, next: ConnectionState) {
        self.state_tx.send_replace(next);
        let event = SessionEvent::State(next);
        if self.cancel.is_cancelled() {
            // The consumer may still be draining a full channel.
            if tokio::time::timeout(FINAL_EVENT_GRACE, self.events_tx.send(event))
                .await
                .is_err()
            {
                debug!(target: "rover::transport", state = next.as_str(), "final state event not delivered");
            }
            return;
        }
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = self.events_tx.send(event) => {}
        }
    }
}
