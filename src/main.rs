use std::{process, sync::Arc};

use mdpaged::{
    application::{
        error::AppError,
        preview::{
            BootstrapPlan, Bootstrapper, FileSink, PreviewClient, PreviewSink, WatchOptions,
            watch_file,
        },
        render::RenderPipelineConfig,
        worker::{ConversionWorker, serve_lines},
    },
    config::{self, RenderArgs, Settings, WatchArgs},
    infra::{
        error::InfraError,
        fetch::HttpScriptFetcher,
        host::{InProcessHost, RoutingHost},
        process::ProcessHost,
        telemetry,
    },
};
use tokio::io::{self, AsyncWriteExt, BufReader};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    let report = error.report();
    if dispatcher::has_been_set() {
        error!(error = %report.chain(), "application error");
        return;
    }

    let subscriber = tracing_fmt()
        .with_max_level(Level::ERROR)
        .with_writer(std::io::stderr)
        .finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %report.chain(), "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;

    telemetry::init(&settings.logging)?;

    match cli_args.command {
        config::Command::Render(args) => run_render(settings, args).await,
        config::Command::Watch(args) => run_watch(settings, args).await,
        config::Command::Worker(_) => run_worker(settings).await,
    }
}

fn build_client(settings: &Settings) -> Result<PreviewClient, AppError> {
    let pipeline = RenderPipelineConfig::from(&settings.render);
    let host = Arc::new(RoutingHost::new(
        Arc::new(InProcessHost::from_config(pipeline)),
        Arc::new(ProcessHost::new(settings.worker.command.clone())),
    ));
    let fetcher = HttpScriptFetcher::new(settings.worker.fetch_timeout)
        .map_err(|err| InfraError::runtime(err.to_string()))?;
    let plan = BootstrapPlan::from(&settings.worker);
    let bootstrapper = Bootstrapper::new(host, Arc::new(fetcher), &plan);

    info!(
        strategies = ?bootstrapper.strategies(),
        command = %settings.worker.command,
        "Preview client configured"
    );
    Ok(PreviewClient::new(bootstrapper))
}

async fn run_render(settings: Settings, args: RenderArgs) -> Result<(), AppError> {
    let markdown = tokio::fs::read_to_string(&args.input)
        .await
        .map_err(InfraError::from)?;

    let client = build_client(&settings)?;
    let result = client.stringify(markdown).await;
    client.terminate().await;
    let rendered = result?;

    if rendered.degraded {
        warn!(
            input = %args.input.display(),
            "Document was rendered by a fallback converter"
        );
    }

    match args.output {
        Some(path) => {
            FileSink::new(&path)
                .publish(&rendered)
                .await
                .map_err(InfraError::from)?;
            info!(
                output = %path.display(),
                bytes = rendered.html.len(),
                "Document written"
            );
        }
        None => {
            let mut stdout = io::stdout();
            stdout
                .write_all(rendered.html.as_bytes())
                .await
                .map_err(InfraError::from)?;
            stdout.flush().await.map_err(InfraError::from)?;
        }
    }

    Ok(())
}

async fn run_watch(settings: Settings, args: WatchArgs) -> Result<(), AppError> {
    if !args.input.is_file() {
        return Err(AppError::validation(format!(
            "input `{}` is not a file",
            args.input.display()
        )));
    }

    let client = build_client(&settings)?;
    let sink: Arc<dyn PreviewSink> = Arc::new(FileSink::new(&args.output));
    let options = WatchOptions {
        poll_interval: settings.preview.poll_interval,
        debounce: settings.preview.debounce,
    };

    let shutdown = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for shutdown signal");
        }
    };

    let summary = watch_file(client.clone(), args.input, sink, options, shutdown).await;
    client.terminate().await;
    info!(
        changes = summary.changes,
        published = summary.published,
        "Watch finished"
    );
    Ok(())
}

async fn run_worker(settings: Settings) -> Result<(), AppError> {
    let mut worker = ConversionWorker::from_config(&RenderPipelineConfig::from(&settings.render));
    worker.initialize();

    let reader = BufReader::new(io::stdin());
    let answered = serve_lines(&mut worker, reader, io::stdout())
        .await
        .map_err(InfraError::from)?;
    info!(answered, "Worker finished");
    Ok(())
}
