use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber writing to stderr. Stdout is left to
/// command output and the worker line protocol.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "mdpaged_conversion_total",
            Unit::Count,
            "Conversions answered by workers, labelled by converter tier."
        );
        describe_histogram!(
            "mdpaged_conversion_ms",
            Unit::Milliseconds,
            "Conversion latency inside the worker in milliseconds."
        );
        describe_counter!(
            "mdpaged_bootstrap_attempt_total",
            Unit::Count,
            "Worker bootstrap attempts, labelled by strategy and result."
        );
        describe_counter!(
            "mdpaged_stale_response_total",
            Unit::Count,
            "Responses dropped because no request was waiting for them."
        );
    });
}
