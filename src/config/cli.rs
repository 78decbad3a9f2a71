use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the mdpaged binary.
#[derive(Debug, Parser)]
#[command(
    name = "mdpaged",
    version,
    about = "Markdown to HTML preview pipeline for paginated output"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(
        long = "config-file",
        env = "MDPAGED_CONFIG_FILE",
        value_name = "PATH",
        global = true
    )]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub logging: LoggingOverrides,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Convert a markdown file once and write the HTML document.
    Render(RenderArgs),
    /// Re-render a markdown file whenever it changes.
    Watch(WatchArgs),
    /// Serve one conversion worker over stdin/stdout, one JSON message per line.
    Worker(WorkerArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct LoggingOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,
}

#[derive(Debug, Args, Clone)]
pub struct RenderArgs {
    /// Markdown file to convert.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub input: PathBuf,

    /// Write the document here instead of stdout.
    #[arg(long, short, value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub output: Option<PathBuf>,

    #[command(flatten)]
    pub pipeline: PipelineOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct WatchArgs {
    /// Markdown file to watch.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub input: PathBuf,

    /// File replaced with every accepted preview.
    #[arg(long, short, value_name = "PATH", value_hint = ValueHint::FilePath)]
    pub output: PathBuf,

    #[command(flatten)]
    pub pipeline: PipelineOverrides,

    #[command(flatten)]
    pub preview: PreviewOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub render: RenderOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PipelineOverrides {
    #[command(flatten)]
    pub worker: WorkerOverrides,

    #[command(flatten)]
    pub render: RenderOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct WorkerOverrides {
    /// Override the worker script URL used by fetch_blob and direct_url.
    #[arg(long = "worker-script-url", value_name = "URL")]
    pub script_url: Option<String>,

    /// Override the converter library URL used by inline_library.
    #[arg(long = "worker-library-url", value_name = "URL")]
    pub library_url: Option<String>,

    /// Override the converter library URL used by remote_import.
    #[arg(long = "worker-import-url", value_name = "URL")]
    pub import_url: Option<String>,

    /// Override the bootstrap strategy order (comma separated).
    #[arg(long = "worker-strategies", value_name = "LIST")]
    pub strategies: Option<String>,

    /// Override how long a directly loaded worker has to answer its ping.
    #[arg(long = "worker-ping-timeout-ms", value_name = "MILLIS")]
    pub ping_timeout_ms: Option<u64>,

    /// Override the timeout for fetching scripts.
    #[arg(long = "worker-fetch-timeout-seconds", value_name = "SECONDS")]
    pub fetch_timeout_secs: Option<u64>,

    /// Override the runtime that runs script workers (e.g. `node`).
    #[arg(long = "worker-command", value_name = "COMMAND")]
    pub command: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RenderOverrides {
    /// Override the highlighter used for code blocks (classed|inline).
    #[arg(long = "render-highlight-style", value_name = "STYLE")]
    pub highlight_style: Option<String>,

    /// Override the syntax highlighting theme.
    #[arg(long = "render-theme", value_name = "THEME")]
    pub theme: Option<String>,

    /// Toggle syntax highlighting.
    #[arg(
        long = "render-syntax-highlighting",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub syntax_highlighting: Option<bool>,

    /// Override the title used when a document has no heading.
    #[arg(long = "render-document-title", value_name = "TITLE")]
    pub document_title: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct PreviewOverrides {
    /// Override the debounce window applied to file changes.
    #[arg(long = "preview-debounce-ms", value_name = "MILLIS")]
    pub debounce_ms: Option<u64>,

    /// Override how often the input file is polled.
    #[arg(long = "preview-poll-interval-ms", value_name = "MILLIS")]
    pub poll_interval_ms: Option<u64>,
}
