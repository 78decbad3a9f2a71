//! Client side of the conversion pipeline: worker bootstrap, request
//! sequencing with stale-result suppression, and live file previews.

pub mod bootstrap;
mod client;
mod pending;
#[cfg(test)]
pub(crate) mod testing;
pub mod watch;

pub use bootstrap::{
    BootstrapError, BootstrapPlan, Bootstrapped, Bootstrapper, StrategyFailure, WORKER_SHIM,
};
pub use client::{PreviewClient, PreviewError, Rendered};
pub use pending::{DeliveryError, PendingTable};
pub use watch::{FileSink, PreviewSink, WatchOptions, WatchSummary, watch_file};
