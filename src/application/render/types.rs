use thiserror::Error;

use super::shim::ShimSet;

/// Structured errors surfaced by the markdown converters. Workers never send
/// these to clients; they only decide which fallback tier runs next.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("markdown conversion failed: {message}")]
    Markdown { message: String },
    #[error("converter panicked: {message}")]
    Panicked { message: String },
    #[error("converter unavailable: {reason}")]
    Unavailable { reason: String },
}

impl RenderError {
    pub fn markdown(message: impl Into<String>) -> Self {
        Self::Markdown {
            message: message.into(),
        }
    }
}

/// Primary markdown converter producing a complete HTML document.
///
/// Implementations may fail or panic; the conversion worker contains both.
pub trait Stringifier: Send {
    fn stringify(&self, markdown: &str, highlighters: &ShimSet) -> Result<String, RenderError>;
}

/// Permissive converter used when the [`Stringifier`] fails.
pub trait FallbackRenderer: Send {
    fn render(&self, markdown: &str) -> Result<String, RenderError>;
}
