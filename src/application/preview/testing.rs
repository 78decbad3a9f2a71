//! Hand-driven hosts and fetchers for exercising the client and bootstrap.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use url::Url;

use crate::domain::protocol::{ConversionRequest, ConversionResponse, PING_SEQUENCE};
use crate::infra::{
    fetch::{FetchError, FetchedScript, ScriptFetcher},
    host::{HostError, SpawnedWorker, WorkerEvent, WorkerHost, WorkerPort, WorkerSource},
};

/// Host whose workers never answer on their own; the test drives them.
pub struct ManualHost {
    spawned: UnboundedSender<ManualWorker>,
}

impl ManualHost {
    pub fn new() -> (Self, UnboundedReceiver<ManualWorker>) {
        let (spawned, workers) = mpsc::unbounded_channel();
        (Self { spawned }, workers)
    }
}

impl WorkerHost for ManualHost {
    fn spawn(&self, source: WorkerSource) -> Result<SpawnedWorker, HostError> {
        let (posted_tx, posted_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let terminated = Arc::new(AtomicBool::new(false));

        self.spawned
            .send(ManualWorker {
                source,
                posted: posted_rx,
                events: Some(events_tx),
                terminated: Arc::clone(&terminated),
            })
            .map_err(|_| HostError::Spawn("test dropped the worker receiver".to_string()))?;

        Ok(SpawnedWorker {
            port: Box::new(ManualPort {
                posted: Mutex::new(Some(posted_tx)),
                terminated,
            }),
            events: events_rx,
        })
    }
}

struct ManualPort {
    posted: Mutex<Option<UnboundedSender<String>>>,
    terminated: Arc<AtomicBool>,
}

impl WorkerPort for ManualPort {
    fn post(&self, message: String) -> Result<(), HostError> {
        let guard = self.posted.lock().expect("port lock");
        let sender = guard.as_ref().ok_or(HostError::Terminated)?;
        sender.send(message).map_err(|_| HostError::Terminated)
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
        self.posted.lock().expect("port lock").take();
    }
}

/// The test's side of a worker spawned by [`ManualHost`].
pub struct ManualWorker {
    pub source: WorkerSource,
    posted: UnboundedReceiver<String>,
    events: Option<UnboundedSender<WorkerEvent>>,
    terminated: Arc<AtomicBool>,
}

impl ManualWorker {
    pub async fn next_request(&mut self) -> Option<ConversionRequest> {
        let payload = self.posted.recv().await?;
        Some(serde_json::from_str(&payload).expect("request json"))
    }

    pub fn respond(&self, sequence: u64, html: &str) {
        let response = ConversionResponse::rendered(Some(sequence), html.to_string(), false);
        self.emit(WorkerEvent::Message(response.encode().expect("encode")));
    }

    /// Wait for the bootstrap ping and answer it.
    pub async fn answer_ping(&mut self) {
        let ping = self.next_request().await.expect("ping posted");
        assert_eq!(ping.sequence, PING_SEQUENCE);
        self.respond(PING_SEQUENCE, "");
    }

    pub fn emit(&self, event: WorkerEvent) {
        if let Some(events) = self.events.as_ref() {
            let _ = events.send(event);
        }
    }

    pub fn fail(&self, message: &str) {
        self.emit(WorkerEvent::Error(message.to_string()));
    }

    /// Close the event stream as if the worker died.
    pub fn crash(&mut self) {
        self.events.take();
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// Fetcher answering from a fixed table and recording every request.
#[derive(Default)]
pub struct StubFetcher {
    responses: HashMap<Url, FetchedScript>,
    requested: Mutex<Vec<Url>>,
}

impl StubFetcher {
    pub fn serve(mut self, url: Url, status: u16, content_type: Option<&str>, body: &str) -> Self {
        self.responses.insert(
            url,
            FetchedScript {
                status,
                content_type: content_type.map(str::to_string),
                body: body.to_string(),
            },
        );
        self
    }

    pub fn requested(&self) -> Vec<Url> {
        self.requested.lock().expect("requested lock").clone()
    }
}

#[async_trait]
impl ScriptFetcher for StubFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedScript, FetchError> {
        self.requested
            .lock()
            .expect("requested lock")
            .push(url.clone());
        self.responses
            .get(url)
            .cloned()
            .ok_or_else(|| FetchError::Transport {
                url: url.to_string(),
                message: "connection refused".to_string(),
            })
    }
}
