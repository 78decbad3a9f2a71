//! Worker construction.
//!
//! A [`WorkerHost`] builds isolated workers from a [`WorkerSource`] and hands
//! back a port for posting messages plus the stream of events the worker
//! emits. [`InProcessHost`] runs the embedded worker on its own named OS
//! thread; script sources go to [`ProcessHost`](super::process::ProcessHost).
//! [`RoutingHost`] picks between the two.

use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Mutex, PoisonError},
    thread,
};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};
use url::Url;

use crate::application::{
    render::{RenderPipelineConfig, shim::panic_message},
    worker::{ConversionWorker, panic_guard},
};
use crate::domain::protocol::WorkerMessage;

const DIGEST_CHARS: usize = 12;

/// What a worker is constructed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerSource {
    /// Script text held in memory.
    Inline { label: String, script: String },
    /// Script referenced directly by URL.
    Url(Url),
    /// The worker compiled into this binary.
    Embedded,
}

impl WorkerSource {
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerSource::Inline { .. } => "inline",
            WorkerSource::Url(_) => "url",
            WorkerSource::Embedded => "embedded",
        }
    }
}

impl fmt::Display for WorkerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerSource::Inline { label, script } => {
                write!(f, "inline:{label} ({} bytes)", script.len())
            }
            WorkerSource::Url(url) => write!(f, "url:{url}"),
            WorkerSource::Embedded => f.write_str("embedded"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// A message posted back by the worker.
    Message(String),
    /// The worker reported an error outside message handling.
    Error(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum HostError {
    #[error("inline worker script `{label}` is empty")]
    EmptyScript { label: String },
    #[error("worker scripts cannot be loaded from `{url}`")]
    UnsupportedScheme { url: String },
    #[error("this host cannot run {kind} workers")]
    UnsupportedSource { kind: &'static str },
    #[error("failed to start worker: {0}")]
    Spawn(String),
    #[error("worker has been terminated")]
    Terminated,
}

/// Sending half of a live worker.
pub trait WorkerPort: Send + Sync {
    fn post(&self, message: String) -> Result<(), HostError>;

    /// Stop the worker. Idempotent.
    fn terminate(&self);
}

pub struct SpawnedWorker {
    pub port: Box<dyn WorkerPort>,
    pub events: UnboundedReceiver<WorkerEvent>,
}

/// Environment able to construct workers.
pub trait WorkerHost: Send + Sync {
    fn spawn(&self, source: WorkerSource) -> Result<SpawnedWorker, HostError>;
}

type WorkerFactory = dyn Fn() -> ConversionWorker + Send + Sync;

/// Runs the embedded worker on a dedicated thread that handles one message at
/// a time.
#[derive(Clone)]
pub struct InProcessHost {
    factory: Arc<WorkerFactory>,
}

impl InProcessHost {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> ConversionWorker + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
        }
    }

    pub fn from_config(config: RenderPipelineConfig) -> Self {
        Self::new(move || ConversionWorker::from_config(&config))
    }
}

impl WorkerHost for InProcessHost {
    fn spawn(&self, source: WorkerSource) -> Result<SpawnedWorker, HostError> {
        if source != WorkerSource::Embedded {
            return Err(HostError::UnsupportedSource {
                kind: source.kind(),
            });
        }
        let name = worker_name(&source)?;
        let (message_tx, mut message_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<WorkerEvent>();
        let factory = Arc::clone(&self.factory);

        thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                panic_guard::mark_worker_thread();
                let outcome = catch_unwind(AssertUnwindSafe(|| {
                    let mut worker = factory();
                    while let Some(message) = message_rx.blocking_recv() {
                        let response = worker.handle_message(WorkerMessage::Text(message));
                        if event_tx.send(WorkerEvent::Message(response)).is_err() {
                            break;
                        }
                    }
                }));
                if let Err(payload) = outcome {
                    let _ = event_tx.send(WorkerEvent::Error(panic_message(payload.as_ref())));
                }
            })
            .map_err(|err| HostError::Spawn(err.to_string()))?;

        debug!(
            target = "infra::host",
            worker = %name,
            source = %source,
            "Worker thread started"
        );

        Ok(SpawnedWorker {
            port: Box::new(ChannelPort {
                name,
                sender: Mutex::new(Some(message_tx)),
            }),
            events: event_rx,
        })
    }
}

/// Sends the embedded tier to one host and every script tier to another.
#[derive(Clone)]
pub struct RoutingHost {
    embedded: Arc<dyn WorkerHost>,
    scripts: Arc<dyn WorkerHost>,
}

impl RoutingHost {
    pub fn new(embedded: Arc<dyn WorkerHost>, scripts: Arc<dyn WorkerHost>) -> Self {
        Self { embedded, scripts }
    }
}

impl WorkerHost for RoutingHost {
    fn spawn(&self, source: WorkerSource) -> Result<SpawnedWorker, HostError> {
        match source {
            WorkerSource::Embedded => self.embedded.spawn(source),
            WorkerSource::Inline { .. } | WorkerSource::Url(_) => self.scripts.spawn(source),
        }
    }
}

struct ChannelPort {
    name: String,
    sender: Mutex<Option<UnboundedSender<String>>>,
}

impl WorkerPort for ChannelPort {
    fn post(&self, message: String) -> Result<(), HostError> {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = guard.as_ref().ok_or(HostError::Terminated)?;
        sender.send(message).map_err(|_| {
            warn!(
                target = "infra::host",
                worker = %self.name,
                "Worker thread is gone; message dropped"
            );
            HostError::Terminated
        })
    }

    fn terminate(&self) {
        let mut guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.take().is_some() {
            debug!(target = "infra::host", worker = %self.name, "Worker terminated");
        }
    }
}

/// Validate the source and derive a worker name that tells instances apart.
pub(crate) fn worker_name(source: &WorkerSource) -> Result<String, HostError> {
    let fingerprint = match source {
        WorkerSource::Inline { label, script } => {
            if script.trim().is_empty() {
                return Err(HostError::EmptyScript {
                    label: label.clone(),
                });
            }
            short_digest(script.as_bytes())
        }
        WorkerSource::Url(url) => {
            if !matches!(url.scheme(), "http" | "https" | "file") {
                return Err(HostError::UnsupportedScheme {
                    url: url.to_string(),
                });
            }
            short_digest(url.as_str().as_bytes())
        }
        WorkerSource::Embedded => "builtin".to_string(),
    };
    Ok(format!("mdpaged-worker-{}-{fingerprint}", source.kind()))
}

fn short_digest(bytes: &[u8]) -> String {
    let mut digest = hex::encode(Sha256::digest(bytes));
    digest.truncate(DIGEST_CHARS);
    digest
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::preview::testing::ManualHost;
    use crate::domain::protocol::{ConversionRequest, ConversionResponse};

    fn host() -> InProcessHost {
        InProcessHost::from_config(RenderPipelineConfig::default())
    }

    #[tokio::test]
    async fn embedded_worker_answers_requests() {
        let SpawnedWorker { port, mut events } =
            host().spawn(WorkerSource::Embedded).expect("spawn");

        let request = ConversionRequest::new(5, "# Hi").encode().expect("encode");
        port.post(request).expect("post");

        let Some(WorkerEvent::Message(payload)) = events.recv().await else {
            panic!("expected a message event");
        };
        let response = ConversionResponse::decode(&payload).expect("decode");
        assert_eq!(response.sequence, Some(5));
        assert!(response.ok);

        port.terminate();
    }

    #[tokio::test]
    async fn terminating_closes_the_event_stream() {
        let SpawnedWorker { port, mut events } =
            host().spawn(WorkerSource::Embedded).expect("spawn");

        port.terminate();
        port.terminate();
        assert!(events.recv().await.is_none());
        assert_eq!(port.post("{}".to_string()), Err(HostError::Terminated));
    }

    #[test]
    fn in_process_host_only_runs_the_embedded_worker() {
        let result = host().spawn(WorkerSource::Inline {
            label: "library".to_string(),
            script: "throw new Error('broken library');".to_string(),
        });
        assert!(matches!(
            result,
            Err(HostError::UnsupportedSource { kind: "inline" })
        ));

        let url = Url::parse("https://cdn.example/worker.js").expect("url");
        assert!(matches!(
            host().spawn(WorkerSource::Url(url)),
            Err(HostError::UnsupportedSource { kind: "url" })
        ));
    }

    #[test]
    fn names_reject_empty_scripts_and_unsupported_schemes() {
        let empty = worker_name(&WorkerSource::Inline {
            label: "blob".to_string(),
            script: "  \n".to_string(),
        });
        assert!(matches!(empty, Err(HostError::EmptyScript { .. })));

        let url = Url::parse("ftp://example.com/worker.js").expect("url");
        assert!(matches!(
            worker_name(&WorkerSource::Url(url)),
            Err(HostError::UnsupportedScheme { .. })
        ));
    }

    #[tokio::test]
    async fn routing_host_keeps_script_tiers_off_the_embedded_host() {
        let (scripts, mut spawned) = ManualHost::new();
        let routing = RoutingHost::new(Arc::new(host()), Arc::new(scripts));

        let script = WorkerSource::Inline {
            label: "worker-script".to_string(),
            script: "serve()".to_string(),
        };
        let SpawnedWorker { port, .. } = routing.spawn(script.clone()).expect("script worker");
        assert_eq!(spawned.recv().await.expect("routed").source, script);
        port.terminate();

        let SpawnedWorker { port, mut events } =
            routing.spawn(WorkerSource::Embedded).expect("embedded worker");
        port.post(ConversionRequest::new(1, "x").encode().expect("encode"))
            .expect("post");
        assert!(matches!(events.recv().await, Some(WorkerEvent::Message(_))));
        assert!(spawned.try_recv().is_err());
        port.terminate();
    }

    #[test]
    fn worker_names_carry_a_digest() {
        let name = worker_name(&WorkerSource::Inline {
            label: "blob".to_string(),
            script: "postMessage(1)".to_string(),
        })
        .expect("name");
        assert!(name.starts_with("mdpaged-worker-inline-"));
        assert_eq!(name.len(), "mdpaged-worker-inline-".len() + DIGEST_CHARS);
        assert_eq!(
            worker_name(&WorkerSource::Embedded).expect("name"),
            "mdpaged-worker-embedded-builtin"
        );
    }
}
