//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{collections::HashSet, fmt, str::FromStr, time::Duration};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;
use url::Url;

use crate::domain::strategy::BootstrapStrategy;
use crate::infra::process::WorkerCommand;

pub use cli::{
    CliArgs, Command, LoggingOverrides, PipelineOverrides, PreviewOverrides, RenderArgs,
    RenderOverrides, WatchArgs, WorkerArgs, WorkerOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "mdpaged";
const DEFAULT_PING_TIMEOUT_MS: u64 = 1500;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_THEME: &str = "InspiredGitHub";
const DEFAULT_DOCUMENT_TITLE: &str = "Preview";
const DEFAULT_DEBOUNCE_MS: u64 = 250;
const DEFAULT_POLL_INTERVAL_MS: u64 = 500;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub worker: WorkerSettings,
    pub render: RenderSettings,
    pub preview: PreviewSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub script_url: Option<Url>,
    pub library_url: Option<Url>,
    pub import_url: Option<Url>,
    pub strategies: Vec<BootstrapStrategy>,
    pub ping_timeout: Duration,
    pub fetch_timeout: Duration,
    /// Runtime that runs script workers; the worker script is its last argument.
    pub command: WorkerCommand,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub highlight_style: HighlightStyle,
    pub theme: String,
    pub syntax_highlighting: bool,
    pub document_title: String,
}

#[derive(Debug, Clone)]
pub struct PreviewSettings {
    pub debounce: Duration,
    pub poll_interval: Duration,
}

/// Which highlighter renders code blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HighlightStyle {
    /// CSS classes backed by an embedded stylesheet.
    #[default]
    Classed,
    /// Inline `style` attributes.
    Inline,
}

impl HighlightStyle {
    pub fn as_str(self) -> &'static str {
        match self {
            HighlightStyle::Classed => "classed",
            HighlightStyle::Inline => "inline",
        }
    }
}

impl fmt::Display for HighlightStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HighlightStyle {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "classed" | "class" | "classes" => Ok(HighlightStyle::Classed),
            "inline" | "styled" => Ok(HighlightStyle::Inline),
            other => Err(format!("expected `classed` or `inline`, got `{other}`")),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("MDPAGED").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_cli_overrides(cli);

    Settings::from_raw(raw)
}

/// Resolve configuration using the process arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    worker: RawWorkerSettings,
    render: RawRenderSettings,
    preview: RawPreviewSettings,
}

impl RawSettings {
    fn apply_cli_overrides(&mut self, cli: &CliArgs) {
        self.apply_logging_overrides(&cli.logging);
        match &cli.command {
            Command::Render(args) => self.apply_pipeline_overrides(&args.pipeline),
            Command::Watch(args) => {
                self.apply_pipeline_overrides(&args.pipeline);
                self.apply_preview_overrides(&args.preview);
            }
            Command::Worker(args) => self.apply_render_overrides(&args.render),
        }
    }

    fn apply_logging_overrides(&mut self, overrides: &LoggingOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
    }

    fn apply_pipeline_overrides(&mut self, overrides: &PipelineOverrides) {
        self.apply_worker_overrides(&overrides.worker);
        self.apply_render_overrides(&overrides.render);
    }

    fn apply_worker_overrides(&mut self, overrides: &WorkerOverrides) {
        if let Some(url) = overrides.script_url.as_ref() {
            self.worker.script_url = Some(url.clone());
        }
        if let Some(url) = overrides.library_url.as_ref() {
            self.worker.library_url = Some(url.clone());
        }
        if let Some(url) = overrides.import_url.as_ref() {
            self.worker.import_url = Some(url.clone());
        }
        if let Some(list) = overrides.strategies.as_ref() {
            self.worker.strategies = Some(RawStrategies::Csv(list.clone()));
        }
        if let Some(millis) = overrides.ping_timeout_ms {
            self.worker.ping_timeout_ms = Some(millis);
        }
        if let Some(seconds) = overrides.fetch_timeout_secs {
            self.worker.fetch_timeout_secs = Some(seconds);
        }
        if let Some(command) = overrides.command.as_ref() {
            self.worker.command = Some(RawCommand::Line(command.clone()));
        }
    }

    fn apply_render_overrides(&mut self, overrides: &RenderOverrides) {
        if let Some(style) = overrides.highlight_style.as_ref() {
            self.render.highlight_style = Some(style.clone());
        }
        if let Some(theme) = overrides.theme.as_ref() {
            self.render.theme = Some(theme.clone());
        }
        if let Some(enabled) = overrides.syntax_highlighting {
            self.render.syntax_highlighting = Some(enabled);
        }
        if let Some(title) = overrides.document_title.as_ref() {
            self.render.document_title = Some(title.clone());
        }
    }

    fn apply_preview_overrides(&mut self, overrides: &PreviewOverrides) {
        if let Some(millis) = overrides.debounce_ms {
            self.preview.debounce_ms = Some(millis);
        }
        if let Some(millis) = overrides.poll_interval_ms {
            self.preview.poll_interval_ms = Some(millis);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            worker,
            render,
            preview,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let worker = build_worker_settings(worker)?;
        let render = build_render_settings(render)?;
        let preview = build_preview_settings(preview)?;

        Ok(Self {
            logging,
            worker,
            render,
            preview,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_worker_settings(worker: RawWorkerSettings) -> Result<WorkerSettings, LoadError> {
    let script_url = optional_url(worker.script_url, "worker.script_url")?;
    let library_url = optional_url(worker.library_url, "worker.library_url")?;
    let import_url = optional_url(worker.import_url, "worker.import_url")?;

    let strategies = match worker.strategies {
        Some(raw) => parse_strategies(raw.into_names())?,
        None => BootstrapStrategy::DEFAULT_ORDER.to_vec(),
    };

    let ping_timeout_ms = worker.ping_timeout_ms.unwrap_or(DEFAULT_PING_TIMEOUT_MS);
    if ping_timeout_ms == 0 {
        return Err(LoadError::invalid(
            "worker.ping_timeout_ms",
            "must be greater than zero",
        ));
    }

    let fetch_timeout_secs = worker
        .fetch_timeout_secs
        .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS);
    if fetch_timeout_secs == 0 {
        return Err(LoadError::invalid(
            "worker.fetch_timeout_secs",
            "must be greater than zero",
        ));
    }

    let command = match worker.command {
        Some(raw) => raw
            .into_command()
            .ok_or_else(|| LoadError::invalid("worker.command", "must name a program"))?,
        None => WorkerCommand::default(),
    };

    Ok(WorkerSettings {
        script_url,
        library_url,
        import_url,
        strategies,
        ping_timeout: Duration::from_millis(ping_timeout_ms),
        fetch_timeout: Duration::from_secs(fetch_timeout_secs),
        command,
    })
}

fn build_render_settings(render: RawRenderSettings) -> Result<RenderSettings, LoadError> {
    let highlight_style = match render.highlight_style {
        Some(style) => style
            .parse()
            .map_err(|reason| LoadError::invalid("render.highlight_style", reason))?,
        None => HighlightStyle::default(),
    };

    let theme = render
        .theme
        .map(|theme| theme.trim().to_string())
        .unwrap_or_else(|| DEFAULT_THEME.to_string());
    if theme.is_empty() {
        return Err(LoadError::invalid("render.theme", "must not be empty"));
    }

    let document_title = render
        .document_title
        .map(|title| title.trim().to_string())
        .unwrap_or_else(|| DEFAULT_DOCUMENT_TITLE.to_string());
    if document_title.is_empty() {
        return Err(LoadError::invalid(
            "render.document_title",
            "must not be empty",
        ));
    }

    Ok(RenderSettings {
        highlight_style,
        theme,
        syntax_highlighting: render.syntax_highlighting.unwrap_or(true),
        document_title,
    })
}

fn build_preview_settings(preview: RawPreviewSettings) -> Result<PreviewSettings, LoadError> {
    let poll_interval_ms = preview.poll_interval_ms.unwrap_or(DEFAULT_POLL_INTERVAL_MS);
    if poll_interval_ms == 0 {
        return Err(LoadError::invalid(
            "preview.poll_interval_ms",
            "must be greater than zero",
        ));
    }

    Ok(PreviewSettings {
        debounce: Duration::from_millis(preview.debounce_ms.unwrap_or(DEFAULT_DEBOUNCE_MS)),
        poll_interval: Duration::from_millis(poll_interval_ms),
    })
}

fn optional_url(value: Option<String>, key: &'static str) -> Result<Option<Url>, LoadError> {
    let Some(value) = value else {
        return Ok(None);
    };
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let url = Url::parse(trimmed)
        .map_err(|err| LoadError::invalid(key, format!("invalid URL `{trimmed}`: {err}")))?;
    if !matches!(url.scheme(), "http" | "https" | "file") {
        return Err(LoadError::invalid(
            key,
            format!("unsupported scheme `{}`", url.scheme()),
        ));
    }
    Ok(Some(url))
}

fn parse_strategies(names: Vec<String>) -> Result<Vec<BootstrapStrategy>, LoadError> {
    let mut seen = HashSet::new();
    let mut strategies = Vec::new();
    for name in names.iter().map(|name| name.trim()).filter(|name| !name.is_empty()) {
        let strategy = name
            .parse::<BootstrapStrategy>()
            .map_err(|err| LoadError::invalid("worker.strategies", err.to_string()))?;
        if !seen.insert(strategy) {
            return Err(LoadError::invalid(
                "worker.strategies",
                format!("`{strategy}` is listed more than once"),
            ));
        }
        strategies.push(strategy);
    }

    if strategies.is_empty() {
        return Err(LoadError::invalid(
            "worker.strategies",
            "at least one strategy is required",
        ));
    }
    Ok(strategies)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawWorkerSettings {
    script_url: Option<String>,
    library_url: Option<String>,
    import_url: Option<String>,
    strategies: Option<RawStrategies>,
    ping_timeout_ms: Option<u64>,
    fetch_timeout_secs: Option<u64>,
    command: Option<RawCommand>,
}

/// Strategy order as a list in files or a comma separated string in the
/// environment and on the command line.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawStrategies {
    List(Vec<String>),
    Csv(String),
}

impl RawStrategies {
    fn into_names(self) -> Vec<String> {
        match self {
            RawStrategies::List(names) => names,
            RawStrategies::Csv(list) => list.split(',').map(str::to_string).collect(),
        }
    }
}

/// Worker command as an argument list in files or a single command line.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawCommand {
    List(Vec<String>),
    Line(String),
}

impl RawCommand {
    fn into_command(self) -> Option<WorkerCommand> {
        match self {
            RawCommand::Line(line) => WorkerCommand::parse(&line),
            RawCommand::List(words) => {
                let mut words = words.into_iter().filter(|word| !word.trim().is_empty());
                let program = words.next()?;
                Some(WorkerCommand::new(program, words.collect()))
            }
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRenderSettings {
    highlight_style: Option<String>,
    theme: Option<String>,
    syntax_highlighting: Option<bool>,
    document_title: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPreviewSettings {
    debounce_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
}
