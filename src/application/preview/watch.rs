//! Live preview of a file: poll, debounce, convert, publish.

use std::{
    future::Future,
    io,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tokio::{
    task::JoinSet,
    time::{MissedTickBehavior, interval, sleep},
};
use tracing::{debug, info, warn};

use super::client::{PreviewClient, Rendered};

#[derive(Debug, Clone, Copy)]
pub struct WatchOptions {
    pub poll_interval: Duration,
    pub debounce: Duration,
}

/// Destination for accepted previews, typically the paginator's input.
#[async_trait]
pub trait PreviewSink: Send + Sync {
    async fn publish(&self, rendered: &Rendered) -> io::Result<()>;
}

/// Replaces the output file atomically with every accepted preview.
#[derive(Debug, Clone)]
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PreviewSink for FileSink {
    async fn publish(&self, rendered: &Rendered) -> io::Result<()> {
        let path = self.path.clone();
        let html = rendered.html.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &html))
            .await
            .map_err(io::Error::other)?
    }
}

pub(crate) fn write_atomically(path: &Path, contents: &str) -> io::Result<()> {
    let directory = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(directory)?;
    io::Write::write_all(&mut file, contents.as_bytes())?;
    file.persist(path).map_err(|err| err.error)?;
    Ok(())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WatchSummary {
    pub changes: u64,
    pub published: u64,
}

/// Watch `input` until `shutdown` completes.
///
/// Each content change waits out the debounce window; a change followed by
/// another inside the window is never converted. Results superseded by a
/// newer request are not published. Empty input cancels outstanding work.
pub async fn watch_file<S>(
    client: PreviewClient,
    input: PathBuf,
    sink: Arc<dyn PreviewSink>,
    options: WatchOptions,
    shutdown: S,
) -> WatchSummary
where
    S: Future<Output = ()>,
{
    let latest_change = Arc::new(AtomicU64::new(0));
    let published = Arc::new(AtomicU64::new(0));
    let mut tasks = JoinSet::new();
    let mut last_seen: Option<String> = None;
    let mut changes = 0u64;

    let mut ticker = interval(options.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    info!(
        target = "application::preview::watch",
        input = %input.display(),
        poll_ms = options.poll_interval.as_millis() as u64,
        debounce_ms = options.debounce.as_millis() as u64,
        "Watching for changes"
    );

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => {}
        }
        while tasks.try_join_next().is_some() {}

        let content = match tokio::fs::read_to_string(&input).await {
            Ok(content) => content,
            Err(err) => {
                warn!(
                    target = "application::preview::watch",
                    input = %input.display(),
                    error = %err,
                    "Failed to read input"
                );
                continue;
            }
        };
        if last_seen.as_deref() == Some(content.as_str()) {
            continue;
        }
        last_seen = Some(content.clone());
        changes += 1;
        let change = latest_change.fetch_add(1, Ordering::SeqCst) + 1;

        if content.trim().is_empty() {
            let cancelled = client.cancel_pending();
            debug!(
                target = "application::preview::watch",
                cancelled, "Input is empty; nothing to render"
            );
            continue;
        }

        let client = client.clone();
        let sink = Arc::clone(&sink);
        let latest_change = Arc::clone(&latest_change);
        let published = Arc::clone(&published);
        let debounce = options.debounce;
        tasks.spawn(async move {
            sleep(debounce).await;
            if latest_change.load(Ordering::SeqCst) != change {
                debug!(
                    target = "application::preview::watch",
                    change, "Change superseded during debounce"
                );
                return;
            }

            match client.stringify_latest(content).await {
                Ok(Some(rendered)) => match sink.publish(&rendered).await {
                    Ok(()) => {
                        published.fetch_add(1, Ordering::SeqCst);
                        info!(
                            target = "application::preview::watch",
                            sequence = rendered.sequence,
                            degraded = rendered.degraded,
                            bytes = rendered.html.len(),
                            "Preview published"
                        );
                    }
                    Err(err) => warn!(
                        target = "application::preview::watch",
                        error = %err,
                        "Failed to publish preview"
                    ),
                },
                Ok(None) => debug!(
                    target = "application::preview::watch",
                    change, "Preview superseded"
                ),
                Err(err) => warn!(
                    target = "application::preview::watch",
                    error = %err,
                    "Preview failed"
                ),
            }
        });
    }

    tasks.shutdown().await;
    let summary = WatchSummary {
        changes,
        published: published.load(Ordering::SeqCst),
    };
    info!(
        target = "application::preview::watch",
        changes = summary.changes,
        published = summary.published,
        "Watch stopped"
    );
    summary
}
