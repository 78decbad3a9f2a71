//! Infrastructure adapters: worker hosting on threads and child processes,
//! script fetching and telemetry.

pub mod error;
pub mod fetch;
pub mod host;
pub mod process;
pub mod telemetry;
