//! Fetching worker scripts and converter libraries.

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, header::CONTENT_TYPE};
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Content types accepted for executable scripts.
const SCRIPT_CONTENT_TYPES: [&str; 5] = [
    "application/javascript",
    "text/javascript",
    "application/x-javascript",
    "application/ecmascript",
    "text/ecmascript",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedScript {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
}

impl FetchedScript {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Media type without parameters, lowercased.
    pub fn media_type(&self) -> Option<String> {
        self.content_type.as_deref().map(|value| {
            value
                .split(';')
                .next()
                .unwrap_or(value)
                .trim()
                .to_ascii_lowercase()
        })
    }

    pub fn has_script_content_type(&self) -> bool {
        self.media_type()
            .is_some_and(|media| SCRIPT_CONTENT_TYPES.contains(&media.as_str()))
    }

    /// Accept the body only if the response is a successful, non-empty script.
    pub fn into_script(self, url: &Url) -> Result<String, FetchError> {
        if !self.is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: self.status,
            });
        }
        if !self.has_script_content_type() {
            return Err(FetchError::ContentType {
                url: url.to_string(),
                content_type: self
                    .content_type
                    .unwrap_or_else(|| "<missing>".to_string()),
            });
        }
        if self.body.trim().is_empty() {
            return Err(FetchError::EmptyBody {
                url: url.to_string(),
            });
        }
        Ok(self.body)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("failed to build http client: {0}")]
    Client(String),
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("{url} answered with status {status}")]
    Status { url: String, status: u16 },
    #[error("{url} is served as `{content_type}`, not as a script")]
    ContentType { url: String, content_type: String },
    #[error("{url} returned an empty script")]
    EmptyBody { url: String },
}

#[async_trait]
pub trait ScriptFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchedScript, FetchError>;
}

/// Fetches over http(s) with reqwest; `file:` URLs are read from disk.
#[derive(Debug, Clone)]
pub struct HttpScriptFetcher {
    client: Client,
}

impl HttpScriptFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(timeout)
            .build()
            .map_err(|err| FetchError::Client(err.to_string()))?;
        Ok(Self { client })
    }

    pub fn user_agent() -> &'static str {
        concat!("mdpaged/", env!("CARGO_PKG_VERSION"))
    }

    async fn fetch_file(&self, url: &Url) -> Result<FetchedScript, FetchError> {
        let transport = |message: String| FetchError::Transport {
            url: url.to_string(),
            message,
        };
        let path = url
            .to_file_path()
            .map_err(|_| transport("not a local path".to_string()))?;
        let body = tokio::fs::read_to_string(&path)
            .await
            .map_err(|err| transport(err.to_string()))?;

        Ok(FetchedScript {
            status: 200,
            content_type: content_type_for_path(&path).map(str::to_string),
            body,
        })
    }
}

#[async_trait]
impl ScriptFetcher for HttpScriptFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedScript, FetchError> {
        if url.scheme() == "file" {
            return self.fetch_file(url).await;
        }

        let transport = |err: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        };
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(transport)?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let body = response.text().await.map_err(transport)?;

        debug!(
            target = "infra::fetch",
            url = %url,
            status,
            content_type = content_type.as_deref().unwrap_or("<missing>"),
            bytes = body.len(),
            "Fetched script"
        );

        Ok(FetchedScript {
            status,
            content_type,
            body,
        })
    }
}

fn content_type_for_path(path: &Path) -> Option<&'static str> {
    match path.extension()?.to_str()? {
        "js" | "mjs" | "cjs" => Some("text/javascript"),
        "html" | "htm" => Some("text/html"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use httpmock::MockServer;

    use super::*;

    fn fetched(status: u16, content_type: Option<&str>, body: &str) -> FetchedScript {
        FetchedScript {
            status,
            content_type: content_type.map(str::to_string),
            body: body.to_string(),
        }
    }

    fn url() -> Url {
        Url::parse("https://cdn.example/worker.js").expect("url")
    }

    #[test]
    fn accepts_script_content_types_with_parameters() {
        let script = fetched(200, Some("Text/JavaScript; charset=utf-8"), "x()")
            .into_script(&url())
            .expect("script");
        assert_eq!(script, "x()");
    }

    #[test]
    fn rejects_html_and_missing_content_types() {
        let html = fetched(200, Some("text/html"), "<!doctype html>").into_script(&url());
        assert!(matches!(html, Err(FetchError::ContentType { .. })));

        let missing = fetched(200, None, "x()").into_script(&url());
        assert!(matches!(
            missing,
            Err(FetchError::ContentType { content_type, .. }) if content_type == "<missing>"
        ));
    }

    #[test]
    fn rejects_failed_status_and_empty_bodies() {
        let failed = fetched(404, Some("text/javascript"), "x()").into_script(&url());
        assert!(matches!(failed, Err(FetchError::Status { status: 404, .. })));

        let empty = fetched(200, Some("application/javascript"), "  ").into_script(&url());
        assert!(matches!(empty, Err(FetchError::EmptyBody { .. })));
    }

    #[tokio::test]
    async fn reports_status_and_content_type_over_http() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method("GET").path("/worker.js");
            then.status(200)
                .header("content-type", "application/javascript")
                .body("self.onmessage = () => {};");
        });

        let fetcher = HttpScriptFetcher::new(Duration::from_secs(5)).expect("client");
        let url = Url::parse(&server.url("/worker.js")).expect("url");
        let fetched = fetcher.fetch(&url).await.expect("fetch");

        mock.assert();
        assert!(fetched.is_success());
        assert!(fetched.has_script_content_type());
        assert_eq!(fetched.body, "self.onmessage = () => {};");
    }

    #[tokio::test]
    async fn reads_file_urls_from_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("worker.js");
        let mut file = std::fs::File::create(&path).expect("create");
        file.write_all(b"postMessage(1);").expect("write");

        let fetcher = HttpScriptFetcher::new(Duration::from_secs(5)).expect("client");
        let url = Url::from_file_path(&path).expect("file url");
        let fetched = fetcher.fetch(&url).await.expect("fetch");

        assert_eq!(fetched.content_type.as_deref(), Some("text/javascript"));
        assert_eq!(fetched.into_script(&url).expect("script"), "postMessage(1);");
    }
}
