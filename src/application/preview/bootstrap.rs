//! Obtaining a live conversion worker.
//!
//! The configured strategies are tried in order and each result is validated
//! before it is trusted. The first success wins; when every strategy fails
//! the caller gets [`BootstrapError::Exhausted`] with one entry per attempt.

use std::{fmt, sync::Arc, time::Duration, time::Instant};

use metrics::counter;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::WorkerSettings;
use crate::domain::{
    protocol::{ConversionRequest, ConversionResponse, PING_SEQUENCE, ProtocolError},
    strategy::BootstrapStrategy,
};
use crate::infra::{
    fetch::{FetchError, ScriptFetcher},
    host::{HostError, SpawnedWorker, WorkerEvent, WorkerHost, WorkerSource},
};

pub const METRIC_BOOTSTRAP_ATTEMPT_TOTAL: &str = "mdpaged_bootstrap_attempt_total";

const DEFAULT_PING_TIMEOUT: Duration = Duration::from_millis(1500);

/// Line-protocol runner for a converter library, appended to the library
/// or to an import of it when a worker is assembled from the library alone.
pub const WORKER_SHIM: &str = include_str!("worker_shim.js");

/// Strategy order and the locations each strategy needs.
#[derive(Debug, Clone)]
pub struct BootstrapPlan {
    pub strategies: Vec<BootstrapStrategy>,
    pub script_url: Option<Url>,
    pub library_url: Option<Url>,
    pub import_url: Option<Url>,
    pub ping_timeout: Duration,
}

impl BootstrapPlan {
    /// A plan that only starts the compiled-in worker.
    pub fn embedded() -> Self {
        Self {
            strategies: vec![BootstrapStrategy::Embedded],
            ..Self::default()
        }
    }
}

impl Default for BootstrapPlan {
    fn default() -> Self {
        Self {
            strategies: BootstrapStrategy::DEFAULT_ORDER.to_vec(),
            script_url: None,
            library_url: None,
            import_url: None,
            ping_timeout: DEFAULT_PING_TIMEOUT,
        }
    }
}

impl From<&WorkerSettings> for BootstrapPlan {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            strategies: settings.strategies.clone(),
            script_url: settings.script_url.clone(),
            library_url: settings.library_url.clone(),
            import_url: settings.import_url.clone(),
            ping_timeout: settings.ping_timeout,
        }
    }
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("no bootstrap strategy is available")]
    NoStrategies,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("ping could not be sent: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("worker did not answer the ping within {timeout_ms} ms")]
    PingTimeout { timeout_ms: u64 },
    #[error("worker reported an error before answering the ping: {message}")]
    PingError { message: String },
    #[error("worker closed before answering the ping")]
    PingClosed,
    #[error("all bootstrap strategies failed: {}", summarize(.failures))]
    Exhausted { failures: Vec<StrategyFailure> },
}

#[derive(Debug)]
pub struct StrategyFailure {
    pub strategy: BootstrapStrategy,
    pub error: BootstrapError,
}

impl fmt::Display for StrategyFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.strategy, self.error)
    }
}

fn summarize(failures: &[StrategyFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// A validated worker and the strategy that produced it.
pub struct Bootstrapped {
    pub strategy: BootstrapStrategy,
    pub worker: SpawnedWorker,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    FetchBlob(Url),
    InlineLibrary(Url),
    RemoteImport(Url),
    DirectUrl(Url),
    Embedded,
}

impl Step {
    fn strategy(&self) -> BootstrapStrategy {
        match self {
            Step::FetchBlob(_) => BootstrapStrategy::FetchBlob,
            Step::InlineLibrary(_) => BootstrapStrategy::InlineLibrary,
            Step::RemoteImport(_) => BootstrapStrategy::RemoteImport,
            Step::DirectUrl(_) => BootstrapStrategy::DirectUrl,
            Step::Embedded => BootstrapStrategy::Embedded,
        }
    }
}

pub struct Bootstrapper {
    host: Arc<dyn WorkerHost>,
    fetcher: Arc<dyn ScriptFetcher>,
    steps: Vec<Step>,
    ping_timeout: Duration,
}

impl Bootstrapper {
    /// Build the strategy chain. Strategies whose URL is not configured are
    /// left out.
    pub fn new(
        host: Arc<dyn WorkerHost>,
        fetcher: Arc<dyn ScriptFetcher>,
        plan: &BootstrapPlan,
    ) -> Self {
        let mut steps = Vec::with_capacity(plan.strategies.len());
        for strategy in &plan.strategies {
            let step = match strategy {
                BootstrapStrategy::FetchBlob => plan.script_url.clone().map(Step::FetchBlob),
                BootstrapStrategy::InlineLibrary => {
                    plan.library_url.clone().map(Step::InlineLibrary)
                }
                BootstrapStrategy::RemoteImport => plan.import_url.clone().map(Step::RemoteImport),
                BootstrapStrategy::DirectUrl => plan.script_url.clone().map(Step::DirectUrl),
                BootstrapStrategy::Embedded => Some(Step::Embedded),
            };
            match step {
                Some(step) => steps.push(step),
                None => debug!(
                    target = "application::preview::bootstrap",
                    strategy = %strategy,
                    "Strategy skipped: no URL configured"
                ),
            }
        }

        Self {
            host,
            fetcher,
            steps,
            ping_timeout: plan.ping_timeout,
        }
    }

    /// Strategies that will be attempted, in order.
    pub fn strategies(&self) -> Vec<BootstrapStrategy> {
        self.steps.iter().map(Step::strategy).collect()
    }

    pub async fn bootstrap(&self) -> Result<Bootstrapped, BootstrapError> {
        if self.steps.is_empty() {
            return Err(BootstrapError::NoStrategies);
        }

        let mut failures = Vec::new();
        for step in &self.steps {
            let strategy = step.strategy();
            let started = Instant::now();
            match self.attempt(step).await {
                Ok(worker) => {
                    counter!(
                        METRIC_BOOTSTRAP_ATTEMPT_TOTAL,
                        "strategy" => strategy.as_str(),
                        "result" => "success"
                    )
                    .increment(1);
                    info!(
                        target = "application::preview::bootstrap",
                        op = "bootstrap",
                        strategy = %strategy,
                        result = "success",
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Worker ready"
                    );
                    return Ok(Bootstrapped { strategy, worker });
                }
                Err(error) => {
                    counter!(
                        METRIC_BOOTSTRAP_ATTEMPT_TOTAL,
                        "strategy" => strategy.as_str(),
                        "result" => "failure"
                    )
                    .increment(1);
                    warn!(
                        target = "application::preview::bootstrap",
                        op = "bootstrap",
                        strategy = %strategy,
                        result = "failure",
                        error = %error,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Strategy failed; trying the next one"
                    );
                    failures.push(StrategyFailure { strategy, error });
                }
            }
        }

        Err(BootstrapError::Exhausted { failures })
    }

    async fn attempt(&self, step: &Step) -> Result<SpawnedWorker, BootstrapError> {
        let source = match step {
            Step::FetchBlob(url) => WorkerSource::Inline {
                label: "worker-script".to_string(),
                script: self.fetch_script(url).await?,
            },
            Step::InlineLibrary(url) => WorkerSource::Inline {
                label: "inline-library".to_string(),
                script: inline_library_script(&self.fetch_script(url).await?),
            },
            Step::RemoteImport(url) => WorkerSource::Inline {
                label: "remote-import".to_string(),
                script: import_script(url),
            },
            Step::DirectUrl(url) => WorkerSource::Url(url.clone()),
            Step::Embedded => return Ok(self.host.spawn(WorkerSource::Embedded)?),
        };

        let mut worker = self.host.spawn(source)?;
        match self.ping(&mut worker).await {
            Ok(()) => Ok(worker),
            Err(err) => {
                worker.port.terminate();
                Err(err)
            }
        }
    }

    async fn fetch_script(&self, url: &Url) -> Result<String, BootstrapError> {
        let fetched = self.fetcher.fetch(url).await?;
        Ok(fetched.into_script(url)?)
    }

    /// Send the empty ping request and wait for the response carrying its sequence.
    async fn ping(&self, worker: &mut SpawnedWorker) -> Result<(), BootstrapError> {
        worker.port.post(ConversionRequest::ping().encode()?)?;

        let events = &mut worker.events;
        let answered = async {
            loop {
                match events.recv().await {
                    Some(WorkerEvent::Message(payload)) => {
                        match ConversionResponse::decode(&payload) {
                            Ok(response) if response.sequence == Some(PING_SEQUENCE) => {
                                return Ok(());
                            }
                            Ok(_) | Err(_) => {
                                debug!(
                                    target = "application::preview::bootstrap",
                                    "Ignoring non-ping message while waiting for the ping"
                                );
                            }
                        }
                    }
                    Some(WorkerEvent::Error(message)) => {
                        return Err(BootstrapError::PingError { message });
                    }
                    None => return Err(BootstrapError::PingClosed),
                }
            }
        };

        timeout(self.ping_timeout, answered)
            .await
            .unwrap_or_else(|_| {
                Err(BootstrapError::PingTimeout {
                    timeout_ms: self.ping_timeout.as_millis() as u64,
                })
            })
    }
}

fn inline_library_script(library: &str) -> String {
    format!("{library}\n{WORKER_SHIM}\nmdpagedServe(globalThis.mdpaged);\n")
}

fn import_script(url: &Url) -> String {
    let quoted = serde_json::Value::String(url.to_string()).to_string();
    format!(
        r#"{WORKER_SHIM}
import({quoted})
  .then(function (module) {{
    mdpagedServe(globalThis.mdpaged || module.default || module);
  }})
  .catch(function (err) {{
    process.stderr.write(String(err) + "\n");
    process.exit(1);
  }});
"#
    )
}
