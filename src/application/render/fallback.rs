use pulldown_cmark::{Options, Parser, html};

use super::{service::DocumentShell, types::FallbackRenderer};
use crate::application::render::types::RenderError;

/// Permissive pulldown-cmark renderer used when the primary stringifier
/// fails. Code blocks are emitted escaped, without highlighting.
pub struct PulldownRenderer {
    options: Options,
    shell: DocumentShell,
}

impl PulldownRenderer {
    pub fn new(document_title: impl Into<String>) -> Self {
        let mut options = Options::empty();
        options.insert(Options::ENABLE_TABLES);
        options.insert(Options::ENABLE_STRIKETHROUGH);
        options.insert(Options::ENABLE_TASKLISTS);
        options.insert(Options::ENABLE_FOOTNOTES);

        Self {
            options,
            shell: DocumentShell::new(document_title, None),
        }
    }
}

impl FallbackRenderer for PulldownRenderer {
    fn render(&self, markdown: &str) -> Result<String, RenderError> {
        let parser = Parser::new_ext(markdown, self.options);
        let mut body = String::with_capacity(markdown.len() * 3 / 2);
        html::push_html(&mut body, parser);
        Ok(self.shell.wrap(None, &body))
    }
}
