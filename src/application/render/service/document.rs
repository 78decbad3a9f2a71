use crate::application::render::shim::escape_html;

/// Wraps rendered body HTML into a standalone document for the paginator.
#[derive(Debug, Clone)]
pub struct DocumentShell {
    default_title: String,
    stylesheet: Option<String>,
}

impl DocumentShell {
    pub fn new(default_title: impl Into<String>, stylesheet: Option<String>) -> Self {
        Self {
            default_title: default_title.into(),
            stylesheet,
        }
    }

    pub fn wrap(&self, title: Option<&str>, body: &str) -> String {
        let title = title
            .map(str::trim)
            .filter(|title| !title.is_empty())
            .unwrap_or(self.default_title.as_str());

        let mut document = String::with_capacity(body.len() + 512);
        document.push_str("<!DOCTYPE html>\n<html lang=\"en\">\n<head>\n");
        document.push_str("<meta charset=\"utf-8\">\n");
        document.push_str("<title>");
        document.push_str(&escape_html(title));
        document.push_str("</title>\n");
        if let Some(stylesheet) = self.stylesheet.as_deref() {
            document.push_str("<style>\n");
            document.push_str(stylesheet);
            document.push_str("</style>\n");
        }
        document.push_str("</head>\n<body>\n<article class=\"markdown-body\">\n");
        document.push_str(body);
        document.push_str("</article>\n</body>\n</html>\n");
        document
    }
}
