//! Markdown to HTML conversion used inside conversion workers.
//!
//! The pipeline is pure: it accepts markdown, produces a complete HTML
//! document, and surfaces structured errors. Containment of failures and
//! panics happens in the caller, the conversion worker.

mod fallback;
mod service;
pub mod shim;
mod types;

pub use fallback::PulldownRenderer;
pub use service::{
    CLASS_PREFIX, ClassedHighlighter, ComrakStringifier, DocumentShell, InlineHighlighter,
    RenderPipelineConfig,
};
pub use shim::{
    Highlight, HighlightError, Highlighted, HighlighterRegistry, HighlighterShim, HighlighterSlot,
    ShimSet, escape_html,
};
pub use types::{FallbackRenderer, RenderError, Stringifier};
