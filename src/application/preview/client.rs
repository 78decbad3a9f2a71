use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};

use dashmap::DashSet;
use metrics::counter;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc::UnboundedReceiver, oneshot};
use tracing::{debug, info, trace, warn};

use super::{
    bootstrap::{BootstrapError, Bootstrapped, Bootstrapper},
    pending::{DeliveryError, PendingTable},
};
use crate::domain::{
    protocol::{ConversionRequest, ConversionResponse, ProtocolError},
    strategy::BootstrapStrategy,
};
use crate::infra::host::{HostError, WorkerEvent, WorkerPort};

pub const METRIC_STALE_RESPONSE_TOTAL: &str = "mdpaged_stale_response_total";

/// HTML accepted for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub sequence: u64,
    pub html: String,
    /// The worker fell back to its permissive renderer or the placeholder.
    pub degraded: bool,
}

impl Rendered {
    fn from_response(sequence: u64, response: ConversionResponse) -> Result<Self, PreviewError> {
        match response {
            ConversionResponse {
                ok: true,
                html: Some(html),
                degraded,
                ..
            } => Ok(Self {
                sequence,
                html,
                degraded,
            }),
            ConversionResponse { error, .. } => Err(PreviewError::Worker {
                sequence,
                message: error.unwrap_or_else(|| "response carried no html".to_string()),
            }),
        }
    }
}

#[derive(Debug, Error)]
pub enum PreviewError {
    #[error("no conversion worker could be started: {0}")]
    Bootstrap(#[from] BootstrapError),
    #[error("request could not be sent to the worker: {0}")]
    Post(#[from] HostError),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("worker rejected request {sequence}: {message}")]
    Worker { sequence: u64, message: String },
    #[error("request {sequence} was cancelled before a response arrived")]
    Cancelled { sequence: u64 },
}

/// Client side of the conversion pipeline.
///
/// Clones share one session: one sequence counter, one pending table and at
/// most one live worker, created lazily on first use.
#[derive(Clone)]
pub struct PreviewClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    bootstrapper: Bootstrapper,
    live: Mutex<Option<Arc<LiveWorker>>>,
    next_sequence: AtomicU64,
    generations: AtomicU64,
    pending: PendingTable,
}

impl PreviewClient {
    pub fn new(bootstrapper: Bootstrapper) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                bootstrapper,
                live: Mutex::new(None),
                next_sequence: AtomicU64::new(1),
                generations: AtomicU64::new(0),
                pending: PendingTable::new(),
            }),
        }
    }

    /// Convert `markdown` and wait for its response, however many requests
    /// were issued meanwhile.
    pub async fn stringify(&self, markdown: impl Into<String>) -> Result<Rendered, PreviewError> {
        let sequence = self.inner.issue_sequence();
        let receiver = self.submit(sequence, markdown.into()).await?;
        match receiver.await {
            Ok(response) => Rendered::from_response(sequence, response),
            Err(_) => Err(PreviewError::Cancelled { sequence }),
        }
    }

    /// Convert `markdown`, resolving to `None` when a newer request was
    /// issued before this one's response arrived, or when it was cancelled.
    pub async fn stringify_latest(
        &self,
        markdown: impl Into<String>,
    ) -> Result<Option<Rendered>, PreviewError> {
        let sequence = self.inner.issue_sequence();
        let receiver = self.submit(sequence, markdown.into()).await?;
        let Ok(response) = receiver.await else {
            debug!(
                target = "application::preview::client",
                sequence, "Request cancelled"
            );
            return Ok(None);
        };

        if !self.inner.is_latest(sequence) {
            debug!(
                target = "application::preview::client",
                sequence,
                latest = self.inner.latest_sequence(),
                "Superseded response discarded"
            );
            return Ok(None);
        }

        Rendered::from_response(sequence, response).map(Some)
    }

    /// Forget every outstanding request without resolving it.
    pub fn cancel_pending(&self) -> usize {
        let cancelled = self.inner.pending.cancel_all();
        if cancelled > 0 {
            debug!(
                target = "application::preview::client",
                cancelled, "Pending requests cancelled"
            );
        }
        cancelled
    }

    /// Destroy the live worker, if any; the next request bootstraps afresh.
    pub async fn terminate(&self) {
        let previous = self.inner.live.lock().await.take();
        let cancelled = self.inner.pending.cancel_all();
        if let Some(worker) = previous {
            worker.port.terminate();
            info!(
                target = "application::preview::client",
                op = "terminate",
                generation = worker.generation,
                strategy = %worker.strategy,
                cancelled,
                "Worker terminated"
            );
        }
    }

    /// Strategy behind the live worker, if one is running.
    pub async fn active_strategy(&self) -> Option<BootstrapStrategy> {
        let live = self.inner.live.lock().await;
        live.as_ref()
            .filter(|worker| !worker.is_closed())
            .map(|worker| worker.strategy)
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.len()
    }

    async fn submit(
        &self,
        sequence: u64,
        markdown: String,
    ) -> Result<oneshot::Receiver<ConversionResponse>, PreviewError> {
        let payload = ConversionRequest::new(sequence, markdown).encode()?;
        let worker = self.ensure_worker().await?;

        let receiver = self.inner.pending.register(sequence);
        worker.in_flight.insert(sequence);
        if let Err(err) = worker.port.post(payload) {
            self.inner.pending.remove(sequence);
            worker.in_flight.remove(&sequence);
            warn!(
                target = "application::preview::client",
                sequence,
                generation = worker.generation,
                error = %err,
                "Posting failed; discarding worker"
            );
            self.discard(&worker).await;
            return Err(err.into());
        }

        trace!(
            target = "application::preview::client",
            sequence,
            generation = worker.generation,
            "Request posted"
        );
        Ok(receiver)
    }

    /// Return the live worker, bootstrapping one if needed. Holding the lock
    /// across the bootstrap makes concurrent first callers share it.
    async fn ensure_worker(&self) -> Result<Arc<LiveWorker>, PreviewError> {
        let mut live = self.inner.live.lock().await;
        if let Some(worker) = live.as_ref() {
            if !worker.is_closed() {
                return Ok(Arc::clone(worker));
            }
            info!(
                target = "application::preview::client",
                generation = worker.generation,
                "Live worker has exited; bootstrapping a replacement"
            );
            worker.port.terminate();
            *live = None;
        }

        let Bootstrapped { strategy, worker } = self.inner.bootstrapper.bootstrap().await?;
        let generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
        let closed = Arc::new(AtomicBool::new(false));
        let in_flight = Arc::new(DashSet::new());

        tokio::spawn(dispatch(
            generation,
            worker.events,
            self.inner.pending.clone(),
            Arc::clone(&closed),
            Arc::clone(&in_flight),
        ));

        let started = Arc::new(LiveWorker {
            generation,
            strategy,
            port: worker.port,
            closed,
            in_flight,
        });
        *live = Some(Arc::clone(&started));
        Ok(started)
    }

    async fn discard(&self, worker: &Arc<LiveWorker>) {
        let mut live = self.inner.live.lock().await;
        if live
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(current, worker))
        {
            *live = None;
        }
        worker.port.terminate();
    }
}

impl ClientInner {
    fn issue_sequence(&self) -> u64 {
        self.next_sequence.fetch_add(1, Ordering::SeqCst)
    }

    fn latest_sequence(&self) -> u64 {
        self.next_sequence.load(Ordering::SeqCst) - 1
    }

    fn is_latest(&self, sequence: u64) -> bool {
        self.latest_sequence() == sequence
    }
}

struct LiveWorker {
    generation: u64,
    strategy: BootstrapStrategy,
    port: Box<dyn WorkerPort>,
    closed: Arc<AtomicBool>,
    in_flight: Arc<DashSet<u64>>,
}

impl LiveWorker {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Route one worker's responses to the pending table until its event stream
/// ends, then drop the requests it will never answer.
async fn dispatch(
    generation: u64,
    mut events: UnboundedReceiver<WorkerEvent>,
    pending: PendingTable,
    closed: Arc<AtomicBool>,
    in_flight: Arc<DashSet<u64>>,
) {
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Message(payload) => {
                let response = match ConversionResponse::decode(&payload) {
                    Ok(response) => response,
                    Err(err) => {
                        warn!(
                            target = "application::preview::client",
                            generation,
                            error = %err,
                            "Undecodable response dropped"
                        );
                        continue;
                    }
                };
                if let Some(sequence) = response.sequence {
                    in_flight.remove(&sequence);
                }
                match pending.deliver(response) {
                    Ok(sequence) => trace!(
                        target = "application::preview::client",
                        generation,
                        sequence,
                        "Response delivered"
                    ),
                    Err(DeliveryError::Stale { sequence })
                    | Err(DeliveryError::ChannelClosed { sequence }) => {
                        counter!(METRIC_STALE_RESPONSE_TOTAL).increment(1);
                        debug!(
                            target = "application::preview::client",
                            generation,
                            sequence,
                            "Stale response dropped"
                        );
                    }
                    Err(DeliveryError::Unsequenced) => warn!(
                        target = "application::preview::client",
                        generation,
                        "Worker could not read a request"
                    ),
                }
            }
            WorkerEvent::Error(message) => warn!(
                target = "application::preview::client",
                generation,
                error = %message,
                "Worker reported an error"
            ),
        }
    }

    closed.store(true, Ordering::SeqCst);
    let orphaned: Vec<u64> = in_flight.iter().map(|sequence| *sequence).collect();
    for sequence in &orphaned {
        in_flight.remove(sequence);
        pending.remove(*sequence);
    }
    info!(
        target = "application::preview::client",
        generation,
        orphaned = orphaned.len(),
        "Worker event stream closed"
    );
}
