use once_cell::sync::Lazy;
use syntect::{
    easy::HighlightLines,
    highlighting::{Theme, ThemeSet},
    html::{
        ClassStyle, ClassedHTMLGenerator, IncludeBackground, css_for_theme_with_class_style,
        styled_line_to_highlighted_html,
    },
    parsing::{SyntaxReference, SyntaxSet},
    util::LinesWithEndings,
};

use crate::application::render::shim::{Highlight, HighlightError, Highlighted};

/// Prefix applied to every CSS class emitted by the classed highlighter.
pub const CLASS_PREFIX: &str = "hl-";

const CLASS_STYLE: ClassStyle = ClassStyle::SpacedPrefixed {
    prefix: CLASS_PREFIX,
};

const PLAIN_TOKENS: [&str; 4] = ["text", "plain", "plaintext", "txt"];

static SYNTAX_SET: Lazy<SyntaxSet> = Lazy::new(SyntaxSet::load_defaults_newlines);
static THEME_SET: Lazy<ThemeSet> = Lazy::new(ThemeSet::load_defaults);

pub(crate) fn find_theme(name: &str) -> Option<&'static Theme> {
    THEME_SET.themes.get(name)
}

/// Stylesheet matching the classes emitted by [`ClassedHighlighter`].
pub(crate) fn classed_stylesheet(theme: &Theme) -> Option<String> {
    css_for_theme_with_class_style(theme, CLASS_STYLE).ok()
}

/// Highlighter A: syntect output annotated with prefixed CSS classes.
pub struct ClassedHighlighter {
    syntax_set: &'static SyntaxSet,
}

impl ClassedHighlighter {
    pub fn new() -> Self {
        Self {
            syntax_set: &SYNTAX_SET,
        }
    }
}

impl Default for ClassedHighlighter {
    fn default() -> Self {
        Self::new()
    }
}

impl Highlight for ClassedHighlighter {
    fn highlight(&self, code: &str, language: &str) -> Result<Highlighted, HighlightError> {
        let syntax = resolve_syntax(self.syntax_set, language)?;
        let source = with_trailing_newline(code);

        let mut generator =
            ClassedHTMLGenerator::new_with_class_style(syntax, self.syntax_set, CLASS_STYLE);
        for line in LinesWithEndings::from(source.as_str()) {
            generator
                .parse_html_for_line_which_includes_newline(line)
                .map_err(|err| HighlightError::Engine {
                    language: language.to_string(),
                    message: err.to_string(),
                })?;
        }

        Ok(Highlighted {
            value: generator.finalize(),
        })
    }
}

/// Highlighter B: syntect output with inline styles from a named theme.
pub struct InlineHighlighter {
    syntax_set: &'static SyntaxSet,
    theme: &'static Theme,
}

impl InlineHighlighter {
    /// Returns `None` when the theme is not bundled.
    pub fn new(theme_name: &str) -> Option<Self> {
        Some(Self {
            syntax_set: &SYNTAX_SET,
            theme: find_theme(theme_name)?,
        })
    }
}

impl Highlight for InlineHighlighter {
    fn highlight(&self, code: &str, language: &str) -> Result<Highlighted, HighlightError> {
        let syntax = resolve_syntax(self.syntax_set, language)?;
        let source = with_trailing_newline(code);
        let engine_error = |err: syntect::Error| HighlightError::Engine {
            language: language.to_string(),
            message: err.to_string(),
        };

        let mut lines = HighlightLines::new(syntax, self.theme);
        let mut value = String::with_capacity(source.len() * 2);
        for line in LinesWithEndings::from(source.as_str()) {
            let regions = lines
                .highlight_line(line, self.syntax_set)
                .map_err(engine_error)?;
            let html = styled_line_to_highlighted_html(&regions[..], IncludeBackground::No)
                .map_err(engine_error)?;
            value.push_str(&html);
        }

        Ok(Highlighted { value })
    }
}

fn resolve_syntax<'a>(
    syntax_set: &'a SyntaxSet,
    language: &str,
) -> Result<&'a SyntaxReference, HighlightError> {
    let token = language
        .split_whitespace()
        .next()
        .unwrap_or(language)
        .to_ascii_lowercase();

    if PLAIN_TOKENS.contains(&token.as_str()) {
        return Ok(syntax_set.find_syntax_plain_text());
    }

    syntax_set
        .find_syntax_by_token(&token)
        .or_else(|| syntax_set.find_syntax_by_name(&token))
        .or_else(|| syntax_set.find_syntax_by_extension(&token))
        .ok_or_else(|| HighlightError::UnknownLanguage {
            language: token.clone(),
        })
}

fn with_trailing_newline(code: &str) -> String {
    let mut source = code.to_string();
    if !source.ends_with('\n') {
        source.push('\n');
    }
    source
}
