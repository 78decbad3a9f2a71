//! Defensive adapters around the syntax highlighters used during conversion.
//!
//! Every highlighter slot is inspected once when a worker initializes. A slot
//! with an engine is wrapped so blank languages and engine failures degrade to
//! escaped code; an empty slot gets a stub that only escapes.

use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::domain::fence::FALLBACK_LANGUAGE;

/// Highlighter output, shaped like the value object returned by browser
/// highlighters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Highlighted {
    pub value: String,
}

#[derive(Debug, Clone, Error)]
pub enum HighlightError {
    #[error("unknown language `{language}`")]
    UnknownLanguage { language: String },
    #[error("highlighting {language} failed: {message}")]
    Engine { language: String, message: String },
}

/// A syntax highlighting engine.
pub trait Highlight: Send + Sync {
    fn highlight(&self, code: &str, language: &str) -> Result<Highlighted, HighlightError>;
}

/// The two well-known highlighter slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HighlighterSlot {
    /// Highlighter A: emits CSS classes.
    Classed,
    /// Highlighter B: emits inline styles.
    Inline,
}

impl HighlighterSlot {
    pub fn as_str(self) -> &'static str {
        match self {
            HighlighterSlot::Classed => "classed",
            HighlighterSlot::Inline => "inline",
        }
    }
}

impl fmt::Display for HighlighterSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Engines made available by the environment a worker runs in.
#[derive(Default)]
pub struct HighlighterRegistry {
    pub classed: Option<Box<dyn Highlight>>,
    pub inline: Option<Box<dyn Highlight>>,
}

impl HighlighterRegistry {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Capability-checked adapter over one highlighter slot.
pub enum HighlighterShim {
    Wrapped(Box<dyn Highlight>),
    Stub,
}

impl HighlighterShim {
    fn inspect(slot: HighlighterSlot, engine: Option<Box<dyn Highlight>>) -> Self {
        match engine {
            Some(engine) => {
                info!(
                    target = "application::render::shim",
                    slot = %slot,
                    variant = "wrapped",
                    "Highlighter wrapped"
                );
                HighlighterShim::Wrapped(engine)
            }
            None => {
                info!(
                    target = "application::render::shim",
                    slot = %slot,
                    variant = "stub",
                    "Highlighter stub installed"
                );
                HighlighterShim::Stub
            }
        }
    }

    pub fn is_stub(&self) -> bool {
        matches!(self, HighlighterShim::Stub)
    }

    /// Highlight `code`, never failing. Blank languages are treated as
    /// [`FALLBACK_LANGUAGE`].
    pub fn highlight(&self, code: &str, language: Option<&str>) -> Highlighted {
        let language = coerce_language(language);
        let HighlighterShim::Wrapped(engine) = self else {
            return escaped(code);
        };

        match catch_unwind(AssertUnwindSafe(|| engine.highlight(code, language))) {
            Ok(Ok(highlighted)) => highlighted,
            Ok(Err(err)) => {
                debug!(
                    target = "application::render::shim",
                    language,
                    error = %err,
                    "Highlighter failed; emitting escaped code"
                );
                escaped(code)
            }
            Err(payload) => {
                warn!(
                    target = "application::render::shim",
                    language,
                    panic = %panic_message(payload.as_ref()),
                    "Highlighter panicked; emitting escaped code"
                );
                escaped(code)
            }
        }
    }
}

/// Both highlighter slots after installation.
pub struct ShimSet {
    classed: HighlighterShim,
    inline: HighlighterShim,
}

impl ShimSet {
    /// Inspect each registry slot once and build the matching adapters.
    pub fn install(registry: HighlighterRegistry) -> Self {
        let HighlighterRegistry { classed, inline } = registry;
        Self {
            classed: HighlighterShim::inspect(HighlighterSlot::Classed, classed),
            inline: HighlighterShim::inspect(HighlighterSlot::Inline, inline),
        }
    }

    /// Adapters that only escape.
    pub fn stubs() -> Self {
        Self {
            classed: HighlighterShim::Stub,
            inline: HighlighterShim::Stub,
        }
    }

    pub fn slot(&self, slot: HighlighterSlot) -> &HighlighterShim {
        match slot {
            HighlighterSlot::Classed => &self.classed,
            HighlighterSlot::Inline => &self.inline,
        }
    }
}

fn coerce_language(language: Option<&str>) -> &str {
    match language.map(str::trim) {
        Some(lang) if !lang.is_empty() => lang,
        _ => FALLBACK_LANGUAGE,
    }
}

fn escaped(code: &str) -> Highlighted {
    Highlighted {
        value: escape_html(code),
    }
}

/// Escape `&`, `<`, `>` and `"`; every other character is kept as is.
pub fn escape_html(input: &str) -> String {
    let mut output = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => output.push_str("&amp;"),
            '<' => output.push_str("&lt;"),
            '>' => output.push_str("&gt;"),
            '"' => output.push_str("&quot;"),
            other => output.push(other),
        }
    }
    output
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
