//! The conversion worker: an isolated unit answering conversion requests.

mod conversion;
pub(crate) mod panic_guard;
mod stdio;

pub use conversion::{
    Conversion, ConversionTier, ConversionWorker, METRIC_CONVERSION_MS, METRIC_CONVERSION_TOTAL,
    PLACEHOLDER_HTML,
};
pub use stdio::serve_lines;
