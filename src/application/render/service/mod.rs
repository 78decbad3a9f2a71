mod config;
mod document;
mod highlight;

use comrak::{
    Arena, format_html,
    nodes::{AstNode, NodeHtmlBlock, NodeValue},
    parse_document,
};
use tracing::warn;

use crate::application::render::{
    shim::{
        Highlight, HighlighterRegistry, HighlighterShim, HighlighterSlot, ShimSet, escape_html,
    },
    types::{RenderError, Stringifier},
};
use crate::config::{HighlightStyle, RenderSettings};
use crate::domain::fence::FALLBACK_LANGUAGE;

pub use document::DocumentShell;
pub use highlight::{CLASS_PREFIX, ClassedHighlighter, InlineHighlighter};

use config::default_options;
use highlight::{classed_stylesheet, find_theme};

const DEFAULT_THEME: &str = "InspiredGitHub";
const DEFAULT_DOCUMENT_TITLE: &str = "Preview";

#[derive(Debug, Clone)]
pub struct RenderPipelineConfig {
    pub highlight_style: HighlightStyle,
    pub theme: String,
    pub syntax_highlighting: bool,
    pub document_title: String,
}

impl Default for RenderPipelineConfig {
    fn default() -> Self {
        Self {
            highlight_style: HighlightStyle::Classed,
            theme: DEFAULT_THEME.to_string(),
            syntax_highlighting: true,
            document_title: DEFAULT_DOCUMENT_TITLE.to_string(),
        }
    }
}

impl From<&RenderSettings> for RenderPipelineConfig {
    fn from(settings: &RenderSettings) -> Self {
        Self {
            highlight_style: settings.highlight_style,
            theme: settings.theme.clone(),
            syntax_highlighting: settings.syntax_highlighting,
            document_title: settings.document_title.clone(),
        }
    }
}

impl RenderPipelineConfig {
    pub(crate) fn highlighter_slot(&self) -> HighlighterSlot {
        match self.highlight_style {
            HighlightStyle::Classed => HighlighterSlot::Classed,
            HighlightStyle::Inline => HighlighterSlot::Inline,
        }
    }

    /// Engines available to workers built from this configuration.
    pub fn highlighter_registry(&self) -> HighlighterRegistry {
        if !self.syntax_highlighting {
            return HighlighterRegistry::empty();
        }

        let inline = InlineHighlighter::new(&self.theme)
            .map(|highlighter| Box::new(highlighter) as Box<dyn Highlight>);
        if inline.is_none() {
            warn!(
                target = "application::render::service",
                theme = %self.theme,
                "Theme is not bundled; inline highlighter unavailable"
            );
        }

        HighlighterRegistry {
            classed: Some(Box::new(ClassedHighlighter::new())),
            inline,
        }
    }
}

/// Comrak-based stringifier producing complete HTML documents with
/// highlighted code blocks.
pub struct ComrakStringifier {
    options: comrak::Options<'static>,
    slot: HighlighterSlot,
    shell: DocumentShell,
}

impl ComrakStringifier {
    pub fn new(config: &RenderPipelineConfig) -> Self {
        let slot = config.highlighter_slot();
        let stylesheet = if config.syntax_highlighting && slot == HighlighterSlot::Classed {
            let stylesheet = find_theme(&config.theme).and_then(classed_stylesheet);
            if stylesheet.is_none() {
                warn!(
                    target = "application::render::service",
                    theme = %config.theme,
                    "No stylesheet for theme; classed output will be unstyled"
                );
            }
            stylesheet
        } else {
            None
        };

        Self {
            options: default_options(),
            slot,
            shell: DocumentShell::new(config.document_title.clone(), stylesheet),
        }
    }
}

impl Default for ComrakStringifier {
    fn default() -> Self {
        Self::new(&RenderPipelineConfig::default())
    }
}

impl Stringifier for ComrakStringifier {
    fn stringify(&self, markdown: &str, highlighters: &ShimSet) -> Result<String, RenderError> {
        let arena = Arena::new();
        let root = parse_document(&arena, markdown, &self.options);

        let mut walker = CodeBlockWalker {
            highlighter: highlighters.slot(self.slot),
            title: None,
        };
        walker.visit_nodes(root);

        let mut body = String::new();
        format_html(root, &self.options, &mut body)
            .map_err(|err| RenderError::markdown(err.to_string()))?;

        Ok(self.shell.wrap(walker.title.as_deref(), &body))
    }
}

struct CodeBlockWalker<'a> {
    highlighter: &'a HighlighterShim,
    title: Option<String>,
}

impl CodeBlockWalker<'_> {
    fn visit_nodes(&mut self, node: &AstNode<'_>) {
        if self.title.is_none() && is_heading(node) {
            let text = collect_inline_text(node);
            let normalized = text.split_whitespace().collect::<Vec<_>>().join(" ");
            if !normalized.is_empty() {
                self.title = Some(normalized);
            }
        }

        if let Some((info, literal)) = extract_code_block(node) {
            let language = info.split_whitespace().next().unwrap_or(FALLBACK_LANGUAGE);
            let highlighted = self.highlighter.highlight(&literal, Some(language));
            let html = code_block_html(language, &highlighted.value);
            let mut data = node.data.borrow_mut();
            data.value = NodeValue::HtmlBlock(NodeHtmlBlock {
                block_type: 0,
                literal: html,
            });
        }

        let mut child = node.first_child();
        while let Some(next) = child {
            self.visit_nodes(next);
            child = next.next_sibling();
        }
    }
}

fn code_block_html(language: &str, highlighted: &str) -> String {
    let lang = escape_html(&language.to_ascii_lowercase());
    format!(
        "<pre class=\"{CLASS_PREFIX}block {CLASS_PREFIX}lang-{lang}\" data-language=\"{lang}\"><code class=\"language-{lang}\">{highlighted}</code></pre>\n"
    )
}

fn extract_code_block(node: &AstNode<'_>) -> Option<(String, String)> {
    let data = node.data.borrow();
    if let NodeValue::CodeBlock(block) = &data.value {
        let info = block.info.trim().to_string();
        let literal = block.literal.clone();
        Some((info, literal))
    } else {
        None
    }
}

fn is_heading(node: &AstNode<'_>) -> bool {
    let data = node.data.borrow();
    matches!(data.value, NodeValue::Heading(_))
}

fn collect_inline_text(node: &AstNode<'_>) -> String {
    fn walk(node: &AstNode<'_>, buffer: &mut String) {
        {
            let data = node.data.borrow();
            match &data.value {
                NodeValue::Text(text) => buffer.push_str(text),
                NodeValue::Code(code) => buffer.push_str(&code.literal),
                NodeValue::LineBreak | NodeValue::SoftBreak => buffer.push(' '),
                _ => {}
            }
        }
        let mut child = node.first_child();
        while let Some(next) = child {
            walk(next, buffer);
            child = next.next_sibling();
        }
    }

    let mut text = String::new();
    walk(node, &mut text);
    text
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::render::shim::HighlighterRegistry;

    fn installed(config: &RenderPipelineConfig) -> ShimSet {
        ShimSet::install(config.highlighter_registry())
    }

    #[test]
    fn produces_a_complete_document() {
        let config = RenderPipelineConfig::default();
        let html = ComrakStringifier::new(&config)
            .stringify("# Title\n\nSome *text*.\n", &installed(&config))
            .expect("render");

        assert!(html.starts_with("<!DOCTYPE html>"));
        assert!(html.contains("<title>Title</title>"));
        assert!(html.contains("<h1>Title</h1>"));
        assert!(html.contains("<em>text</em>"));
        assert!(html.contains("<style>"));
    }

    #[test]
    fn code_blocks_are_highlighted_with_classes() {
        let config = RenderPipelineConfig::default();
        let html = ComrakStringifier::new(&config)
            .stringify("``` rust\nfn main() {}\n```\n", &installed(&config))
            .expect("render");

        assert!(html.contains("data-language=\"rust\""));
        assert!(html.contains("class=\"language-rust\""));
        assert!(html.contains("class=\"hl-"));
    }

    #[test]
    fn unknown_languages_fall_back_to_escaped_code() {
        let config = RenderPipelineConfig::default();
        let html = ComrakStringifier::new(&config)
            .stringify("``` klingon\na < b\n```\n", &installed(&config))
            .expect("render");

        assert!(html.contains("data-language=\"klingon\""));
        assert!(html.contains("a &lt; b"));
    }

    #[test]
    fn inline_style_writes_style_attributes() {
        let config = RenderPipelineConfig {
            highlight_style: HighlightStyle::Inline,
            ..RenderPipelineConfig::default()
        };
        let html = ComrakStringifier::new(&config)
            .stringify("``` python\nprint(1)\n```\n", &installed(&config))
            .expect("render");

        assert!(html.contains("style=\"color:"));
        assert!(!html.contains("<style>"));
    }

    #[test]
    fn disabled_highlighting_escapes_code() {
        let config = RenderPipelineConfig {
            syntax_highlighting: false,
            ..RenderPipelineConfig::default()
        };
        let registry = config.highlighter_registry();
        assert!(registry.classed.is_none() && registry.inline.is_none());

        let html = ComrakStringifier::new(&config)
            .stringify("``` html\n<b>\"x\"</b>\n```\n", &ShimSet::install(HighlighterRegistry::empty()))
            .expect("render");
        assert!(html.contains("&lt;b&gt;&quot;x&quot;&lt;/b&gt;"));
    }

    #[test]
    fn default_title_applies_without_headings() {
        let config = RenderPipelineConfig {
            document_title: "Draft".to_string(),
            ..RenderPipelineConfig::default()
        };
        let html = ComrakStringifier::new(&config)
            .stringify("just a paragraph\n", &ShimSet::stubs())
            .expect("render");
        assert!(html.contains("<title>Draft</title>"));
    }
}
