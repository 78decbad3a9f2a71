//! Script workers run as child processes.
//!
//! [`ProcessHost`] starts the configured command with the worker script as
//! its last argument. Requests go to the child's stdin one JSON object per
//! line and every stdout line comes back as a [`WorkerEvent::Message`], the
//! same line protocol `mdpaged worker` serves. Inline scripts are written to
//! a temporary file that lives as long as the child.

use std::{
    ffi::OsString,
    fmt,
    io::Write,
    process::Stdio,
    sync::{Mutex, PoisonError},
};

use tempfile::TempPath;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStderr, ChildStdin, ChildStdout, Command},
    runtime::Handle,
    sync::{
        mpsc::{self, UnboundedReceiver, UnboundedSender},
        oneshot,
    },
};
use tracing::{debug, warn};

use super::host::{
    HostError, SpawnedWorker, WorkerEvent, WorkerHost, WorkerPort, WorkerSource, worker_name,
};

const DEFAULT_PROGRAM: &str = "node";

/// Program and leading arguments used to run worker scripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    program: String,
    args: Vec<String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Split a whitespace-separated command line. `None` when it is blank.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut words = raw.split_whitespace().map(str::to_string);
        let program = words.next()?;
        Some(Self::new(program, words.collect()))
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM, Vec::new())
    }
}

impl fmt::Display for WorkerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Runs inline and URL workers through an external script runtime.
#[derive(Debug, Clone, Default)]
pub struct ProcessHost {
    command: WorkerCommand,
}

impl ProcessHost {
    pub fn new(command: WorkerCommand) -> Self {
        Self { command }
    }
}

impl WorkerHost for ProcessHost {
    fn spawn(&self, source: WorkerSource) -> Result<SpawnedWorker, HostError> {
        let name = worker_name(&source)?;
        let runtime = Handle::try_current().map_err(|err| HostError::Spawn(err.to_string()))?;

        let (entry, script_file) = match &source {
            WorkerSource::Inline { script, .. } => {
                let path = write_script(script)?;
                (path.as_os_str().to_owned(), Some(path))
            }
            WorkerSource::Url(url) if url.scheme() == "file" => {
                let path = url.to_file_path().map_err(|()| HostError::UnsupportedScheme {
                    url: url.to_string(),
                })?;
                (path.into_os_string(), None)
            }
            WorkerSource::Url(url) => (OsString::from(url.as_str()), None),
            WorkerSource::Embedded => {
                return Err(HostError::UnsupportedSource {
                    kind: source.kind(),
                });
            }
        };

        let mut child = Command::new(self.command.program())
            .args(self.command.args())
            .arg(&entry)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| HostError::Spawn(format!("`{}`: {err}", self.command)))?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(HostError::Spawn("worker pipes were not captured".to_string()));
        };

        let (message_tx, message_rx) = mpsc::unbounded_channel::<String>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<WorkerEvent>();
        let (kill_tx, kill_rx) = oneshot::channel();

        runtime.spawn(feed_stdin(name.clone(), stdin, message_rx));
        runtime.spawn(log_stderr(name.clone(), stderr));
        runtime.spawn(supervise(
            name.clone(),
            child,
            stdout,
            event_tx,
            kill_rx,
            script_file,
        ));

        debug!(
            target = "infra::process",
            worker = %name,
            source = %source,
            command = %self.command,
            "Worker process started"
        );

        Ok(SpawnedWorker {
            port: Box::new(ProcessPort {
                name,
                sender: Mutex::new(Some(message_tx)),
                kill: Mutex::new(Some(kill_tx)),
            }),
            events: event_rx,
        })
    }
}

fn write_script(script: &str) -> Result<TempPath, HostError> {
    let written = || -> std::io::Result<TempPath> {
        let mut file = tempfile::Builder::new()
            .prefix("mdpaged-worker-")
            .suffix(".cjs")
            .tempfile()?;
        file.write_all(script.as_bytes())?;
        file.flush()?;
        Ok(file.into_temp_path())
    };
    written().map_err(|err| HostError::Spawn(format!("could not write worker script: {err}")))
}

async fn feed_stdin(name: String, mut stdin: ChildStdin, mut messages: UnboundedReceiver<String>) {
    while let Some(message) = messages.recv().await {
        let written = async {
            stdin.write_all(message.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        };
        if let Err(err) = written.await {
            warn!(
                target = "infra::process",
                worker = %name,
                error = %err,
                "Worker stopped reading requests"
            );
            return;
        }
    }
    debug!(target = "infra::process", worker = %name, "Request stream closed");
}

async fn log_stderr(name: String, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        warn!(target = "infra::process", worker = %name, stderr = %line, "Worker diagnostic");
    }
}

async fn supervise(
    name: String,
    mut child: Child,
    stdout: ChildStdout,
    events: UnboundedSender<WorkerEvent>,
    mut kill: oneshot::Receiver<()>,
    _script_file: Option<TempPath>,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        tokio::select! {
            // Fires on terminate and when the port is dropped.
            _ = &mut kill => {
                if let Err(err) = child.kill().await {
                    warn!(target = "infra::process", worker = %name, error = %err, "Kill failed");
                }
                debug!(target = "infra::process", worker = %name, "Worker process killed");
                return;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => {
                    if events.send(WorkerEvent::Message(line)).is_err() {
                        let _ = child.kill().await;
                        return;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    let _ = events.send(WorkerEvent::Error(format!(
                        "worker output could not be read: {err}"
                    )));
                    let _ = child.kill().await;
                    return;
                }
            },
        }
    }

    match child.wait().await {
        Ok(status) if status.success() => {
            debug!(target = "infra::process", worker = %name, "Worker process exited");
        }
        Ok(status) => {
            let _ = events.send(WorkerEvent::Error(format!("worker exited with {status}")));
        }
        Err(err) => {
            let _ = events.send(WorkerEvent::Error(format!(
                "worker exit status unavailable: {err}"
            )));
        }
    }
}

struct ProcessPort {
    name: String,
    sender: Mutex<Option<UnboundedSender<String>>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
}

impl WorkerPort for ProcessPort {
    fn post(&self, message: String) -> Result<(), HostError> {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = guard.as_ref().ok_or(HostError::Terminated)?;
        sender.send(message).map_err(|_| {
            warn!(
                target = "infra::process",
                worker = %self.name,
                "Worker process is gone; message dropped"
            );
            HostError::Terminated
        })
    }

    fn terminate(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let kill = self.kill.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(kill) = kill {
            let _ = kill.send(());
            debug!(target = "infra::process", worker = %self.name, "Worker terminated");
        }
    }
}
