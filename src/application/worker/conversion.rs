use std::{
    mem,
    panic::{AssertUnwindSafe, catch_unwind},
    time::Instant,
};

use metrics::{counter, histogram};
use tracing::{debug, error, info, warn};

use super::panic_guard::{self, SilenceGuard};
use crate::application::render::{
    ComrakStringifier, FallbackRenderer, HighlighterRegistry, PulldownRenderer,
    RenderError, RenderPipelineConfig, ShimSet, Stringifier,
    shim::panic_message,
};
use crate::domain::{
    fence::normalize_fences,
    protocol::{ConversionResponse, ProtocolError, WorkerMessage},
};

/// Fragment emitted when both converters fail.
pub const PLACEHOLDER_HTML: &str =
    "<div class=\"mdpaged-placeholder\"><p>Preview unavailable for this document.</p></div>";

pub const METRIC_CONVERSION_TOTAL: &str = "mdpaged_conversion_total";
pub const METRIC_CONVERSION_MS: &str = "mdpaged_conversion_ms";

const UNENCODABLE_RESPONSE: &str =
    r#"{"sequence":null,"ok":false,"error":"response could not be encoded"}"#;

/// Which converter produced the html of a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversionTier {
    Stringifier,
    Fallback,
    Placeholder,
}

impl ConversionTier {
    pub fn as_str(self) -> &'static str {
        match self {
            ConversionTier::Stringifier => "stringifier",
            ConversionTier::Fallback => "fallback",
            ConversionTier::Placeholder => "placeholder",
        }
    }

    pub fn is_degraded(self) -> bool {
        !matches!(self, ConversionTier::Stringifier)
    }
}

#[derive(Debug, Clone)]
pub struct Conversion {
    pub html: String,
    pub tier: ConversionTier,
}

enum ShimState {
    Pending(HighlighterRegistry),
    Installed(ShimSet),
}

/// One conversion worker: owns the converters and the highlighter shims and
/// answers every message with exactly one encoded response.
pub struct ConversionWorker {
    stringifier: Box<dyn Stringifier>,
    fallback: Box<dyn FallbackRenderer>,
    shims: ShimState,
}

impl ConversionWorker {
    pub fn new(
        stringifier: Box<dyn Stringifier>,
        fallback: Box<dyn FallbackRenderer>,
        highlighters: HighlighterRegistry,
    ) -> Self {
        Self {
            stringifier,
            fallback,
            shims: ShimState::Pending(highlighters),
        }
    }

    pub fn from_config(config: &RenderPipelineConfig) -> Self {
        Self::new(
            Box::new(ComrakStringifier::new(config)),
            Box::new(PulldownRenderer::new(config.document_title.clone())),
            config.highlighter_registry(),
        )
    }

    pub fn is_initialized(&self) -> bool {
        matches!(self.shims, ShimState::Installed(_))
    }

    /// Install the highlighter shims and the panic hook. Later calls are
    /// no-ops.
    pub fn initialize(&mut self) {
        let registry = match &mut self.shims {
            ShimState::Installed(_) => return,
            ShimState::Pending(registry) => mem::take(registry),
        };

        panic_guard::install_hook();
        self.shims = ShimState::Installed(ShimSet::install(registry));
        info!(
            target = "application::worker::conversion",
            op = "initialize",
            "Conversion worker initialized"
        );
    }

    /// Answer one message. Never fails and never panics out.
    pub fn handle_message(&mut self, message: WorkerMessage) -> String {
        self.initialize();

        let response = match message.into_request() {
            Ok(request) => {
                let started = Instant::now();
                let conversion = self.convert(&request.markdown);
                let elapsed = started.elapsed();
                counter!(METRIC_CONVERSION_TOTAL, "tier" => conversion.tier.as_str()).increment(1);
                histogram!(METRIC_CONVERSION_MS).record(elapsed.as_secs_f64() * 1000.0);
                debug!(
                    target = "application::worker::conversion",
                    op = "convert",
                    sequence = ?request.sequence,
                    tier = conversion.tier.as_str(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Conversion finished"
                );
                ConversionResponse::rendered(
                    request.sequence,
                    conversion.html,
                    conversion.tier.is_degraded(),
                )
            }
            Err(err) => return self.reject(&err),
        };

        encode_response(&response)
    }

    /// Answer a request that could not be read at all.
    pub fn reject(&self, err: &ProtocolError) -> String {
        warn!(
            target = "application::worker::conversion",
            op = "decode",
            error = %err,
            "Rejected malformed request"
        );
        encode_response(&ConversionResponse::malformed(err))
    }

    /// Normalize and convert `markdown`, walking down the converter tiers.
    pub fn convert(&mut self, markdown: &str) -> Conversion {
        self.initialize();
        let ShimState::Installed(shims) = &self.shims else {
            return Conversion {
                html: PLACEHOLDER_HTML.to_string(),
                tier: ConversionTier::Placeholder,
            };
        };

        let normalized = normalize_fences(markdown);
        let _silenced = SilenceGuard::engage();

        let primary = contain(|| self.stringifier.stringify(&normalized, shims));
        let err = match primary {
            Ok(html) => {
                return Conversion {
                    html,
                    tier: ConversionTier::Stringifier,
                };
            }
            Err(err) => err,
        };
        warn!(
            target = "application::worker::conversion",
            op = "stringify",
            error = %err,
            "Stringifier failed; using fallback renderer"
        );

        match contain(|| self.fallback.render(&normalized)) {
            Ok(html) => Conversion {
                html,
                tier: ConversionTier::Fallback,
            },
            Err(err) => {
                error!(
                    target = "application::worker::conversion",
                    op = "fallback",
                    error = %err,
                    "Fallback renderer failed; emitting placeholder"
                );
                Conversion {
                    html: PLACEHOLDER_HTML.to_string(),
                    tier: ConversionTier::Placeholder,
                }
            }
        }
    }
}

fn contain<F>(render: F) -> Result<String, RenderError>
where
    F: FnOnce() -> Result<String, RenderError>,
{
    match catch_unwind(AssertUnwindSafe(render)) {
        Ok(result) => result,
        Err(payload) => Err(RenderError::Panicked {
            message: panic_message(payload.as_ref()),
        }),
    }
}

fn encode_response(response: &ConversionResponse) -> String {
    response.encode().unwrap_or_else(|err| {
        error!(
            target = "application::worker::conversion",
            op = "encode",
            error = %err,
            "Failed to encode response"
        );
        UNENCODABLE_RESPONSE.to_string()
    })
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use serde_json::json;

    use super::*;
    use crate::application::render::{
        Highlight, HighlightError, Highlighted, HighlighterSlot,
    };

    struct FailingStringifier;

    impl Stringifier for FailingStringifier {
        fn stringify(&self, _markdown: &str, _shims: &ShimSet) -> Result<String, RenderError> {
            Err(RenderError::markdown("always fails"))
        }
    }

    struct PanickingStringifier;

    impl Stringifier for PanickingStringifier {
        fn stringify(&self, _markdown: &str, _shims: &ShimSet) -> Result<String, RenderError> {
            panic!("stringifier exploded");
        }
    }

    struct FailingFallback;

    impl FallbackRenderer for FailingFallback {
        fn render(&self, _markdown: &str) -> Result<String, RenderError> {
            Err(RenderError::markdown("fallback fails too"))
        }
    }

    struct PanickingFallback;

    impl FallbackRenderer for PanickingFallback {
        fn render(&self, _markdown: &str) -> Result<String, RenderError> {
            panic!("fallback exploded");
        }
    }

    /// Echoes the normalized markdown and records the highlighter output of
    /// the classed slot.
    struct EchoStringifier;

    impl Stringifier for EchoStringifier {
        fn stringify(&self, markdown: &str, shims: &ShimSet) -> Result<String, RenderError> {
            let highlighted = shims
                .slot(HighlighterSlot::Classed)
                .highlight("<x>", None)
                .value;
            Ok(format!("{markdown}|{highlighted}"))
        }
    }

    struct CountingHighlighter {
        calls: Arc<AtomicUsize>,
    }

    impl Highlight for CountingHighlighter {
        fn highlight(&self, code: &str, _language: &str) -> Result<Highlighted, HighlightError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Highlighted {
                value: format!("[{code}]"),
            })
        }
    }

    fn decode(payload: &str) -> ConversionResponse {
        ConversionResponse::decode(payload).expect("response json")
    }

    #[test]
    fn failing_stringifier_still_yields_ok_html() {
        let mut worker = ConversionWorker::new(
            Box::new(FailingStringifier),
            Box::new(PulldownRenderer::new("Preview")),
            HighlighterRegistry::empty(),
        );
        let response = decode(&worker.handle_message(WorkerMessage::Structured(
            json!({"sequence": 4, "markdown": "# Hello"}),
        )));

        assert!(response.ok);
        assert!(response.degraded);
        assert_eq!(response.sequence, Some(4));
        let html = response.html.expect("html");
        assert!(html.contains("<h1>Hello</h1>"));
    }

    #[test]
    fn total_failure_yields_the_placeholder() {
        let mut worker = ConversionWorker::new(
            Box::new(PanickingStringifier),
            Box::new(FailingFallback),
            HighlighterRegistry::empty(),
        );
        let response = decode(&worker.handle_message(WorkerMessage::Text(
            r#"{"sequence":9,"markdown":"text"}"#.to_string(),
        )));

        assert!(response.ok);
        assert!(response.degraded);
        assert_eq!(response.html.as_deref(), Some(PLACEHOLDER_HTML));
        assert!(response.error.is_none());
    }

    #[test]
    fn panicking_fallback_is_contained() {
        let mut worker = ConversionWorker::new(
            Box::new(FailingStringifier),
            Box::new(PanickingFallback),
            HighlighterRegistry::empty(),
        );
        let conversion = worker.convert("anything");
        assert_eq!(conversion.tier, ConversionTier::Placeholder);

        let again = worker.convert("still alive");
        assert_eq!(again.tier, ConversionTier::Placeholder);
    }

    #[test]
    fn malformed_requests_get_a_null_sequence_error() {
        let mut worker = ConversionWorker::from_config(&RenderPipelineConfig::default());
        let payload = worker.handle_message(WorkerMessage::Text("not json".to_string()));
        let value: serde_json::Value = serde_json::from_str(&payload).expect("json");

        assert_eq!(value["sequence"], serde_json::Value::Null);
        assert_eq!(value["ok"], json!(false));
        assert!(value["error"].as_str().is_some_and(|error| !error.is_empty()));
        assert!(value.get("html").is_none());
    }

    #[test]
    fn fences_are_normalized_before_conversion() {
        let mut worker = ConversionWorker::new(
            Box::new(EchoStringifier),
            Box::new(FailingFallback),
            HighlighterRegistry::empty(),
        );
        let conversion = worker.convert("```undefined\nx\n```\n");

        assert_eq!(conversion.tier, ConversionTier::Stringifier);
        assert!(conversion.html.starts_with("``` text\nx\n```\n|"));
        assert!(conversion.html.ends_with("&lt;x&gt;"));
    }

    #[test]
    fn initialization_happens_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let mut worker = ConversionWorker::new(
            Box::new(EchoStringifier),
            Box::new(FailingFallback),
            HighlighterRegistry {
                classed: Some(Box::new(CountingHighlighter {
                    calls: Arc::clone(&calls),
                })),
                inline: None,
            },
        );
        assert!(!worker.is_initialized());

        worker.initialize();
        worker.initialize();
        assert!(worker.is_initialized());

        let first = worker.convert("a");
        let second = worker.convert("b");
        assert!(first.html.ends_with("[<x>]"));
        assert!(second.html.ends_with("[<x>]"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn end_to_end_document_has_heading_and_code() {
        let mut worker = ConversionWorker::from_config(&RenderPipelineConfig::default());
        let response = decode(&worker.handle_message(WorkerMessage::Structured(json!({
            "sequence": 1,
            "markdown": "# Title\n\n```\ncode\n```",
        }))));

        assert!(response.ok);
        assert!(!response.degraded);
        let html = response.html.expect("html");
        assert!(html.contains("<h1>Title</h1>"));
        assert!(html.contains("data-language=\"text\""));
        assert!(html.contains("<code class=\"language-text\">"));
        assert!(html.contains("code"));
    }
}
