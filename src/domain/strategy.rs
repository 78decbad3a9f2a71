use std::{fmt, str::FromStr};

use thiserror::Error;

/// Ways of obtaining a live conversion worker, tried in configured order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BootstrapStrategy {
    /// Fetch the worker script and run it from memory.
    FetchBlob,
    /// Fetch the converter library and run it with the message shim appended.
    InlineLibrary,
    /// Run a shim that imports the converter library by URL.
    RemoteImport,
    /// Run the worker script straight from its URL, validated by a ping.
    DirectUrl,
    /// Run the worker compiled into the binary.
    Embedded,
}

impl BootstrapStrategy {
    pub const DEFAULT_ORDER: [BootstrapStrategy; 5] = [
        BootstrapStrategy::FetchBlob,
        BootstrapStrategy::InlineLibrary,
        BootstrapStrategy::RemoteImport,
        BootstrapStrategy::DirectUrl,
        BootstrapStrategy::Embedded,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BootstrapStrategy::FetchBlob => "fetch_blob",
            BootstrapStrategy::InlineLibrary => "inline_library",
            BootstrapStrategy::RemoteImport => "remote_import",
            BootstrapStrategy::DirectUrl => "direct_url",
            BootstrapStrategy::Embedded => "embedded",
        }
    }
}

impl fmt::Display for BootstrapStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown bootstrap strategy `{0}`")]
pub struct UnknownStrategy(pub String);

impl FromStr for BootstrapStrategy {
    type Err = UnknownStrategy;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase().replace('-', "_");
        Self::DEFAULT_ORDER
            .into_iter()
            .find(|strategy| strategy.as_str() == normalized)
            .ok_or_else(|| UnknownStrategy(value.trim().to_string()))
    }
}
