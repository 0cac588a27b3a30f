use async_trait::async_trait;
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE, PRAGMA};
use reqwest::{Client, Url};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OfflineError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Bad response for {url}: {status}")]
    BadStatus { url: String, status: u16 },
}

impl From<reqwest::Error> for OfflineError {
    fn from(e: reqwest::Error) -> Self {
        OfflineError::Network(e.to_string())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RequestMode {
    Navigate,
    #[default]
    SameOrigin,
    Cors,
    NoCors,
}

/// How the network layer may use intermediate HTTP caches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheMode {
    #[default]
    Default,
    /// Bypass HTTP caches and fetch a fresh copy.
    Reload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub url: Url,
    pub mode: RequestMode,
    pub cache: CacheMode,
}

impl Request {
    pub fn get(url: Url) -> Self {
        Self {
            url,
            mode: RequestMode::default(),
            cache: CacheMode::default(),
        }
    }

    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    pub fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_cache(mut self, cache: CacheMode) -> Self {
        self.cache = cache;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Basic,
    Cors,
    /// Cross-origin `no-cors` response; status is hidden and reported as 0.
    Opaque,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub kind: ResponseKind,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            kind: ResponseKind::Basic,
            content_type: None,
            body: body.into(),
        }
    }

    pub fn html(body: &str) -> Self {
        Self {
            content_type: Some("text/html".into()),
            ..Self::ok(body)
        }
    }

    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Only full 200s and opaque responses are worth keeping offline.
    pub fn is_cacheable(&self) -> bool {
        self.status == 200 || self.kind == ResponseKind::Opaque
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[async_trait]
pub trait Network: Send + Sync {
    async fn fetch(&self, request: &Request) -> Result<Response, OfflineError>;
}

/// `Network` over a real HTTP client.
pub struct HttpNetwork {
    client: Client,
}

impl Default for HttpNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpNetwork {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

#[async_trait]
impl Network for HttpNetwork {
    async fn fetch(&self, request: &Request) -> Result<Response, OfflineError> {
        let mut builder = self.client.get(request.url.clone());
        if request.cache == CacheMode::Reload {
            builder = builder.header(CACHE_CONTROL, "no-cache").header(PRAGMA, "no-cache");
        }

        let resp = builder.send().await?;
        let status = resp.status().as_u16();
        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = resp.bytes().await?.to_vec();

        tracing::debug!(url = %request.url, status, bytes = body.len(), "Fetched");

        let (status, kind) = match request.mode {
            RequestMode::NoCors => (0, ResponseKind::Opaque),
            RequestMode::Cors => (status, ResponseKind::Cors),
            RequestMode::Navigate | RequestMode::SameOrigin => (status, ResponseKind::Basic),
        };

        Ok(Response {
            status,
            kind,
            content_type,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cacheable_responses() {
        assert!(Response::ok("x").is_cacheable());

        let not_found = Response {
            status: 404,
            ..Response::ok("missing")
        };
        assert!(!not_found.is_cacheable());

        let opaque = Response {
            status: 0,
            kind: ResponseKind::Opaque,
            ..Response::ok("")
        };
        assert!(opaque.is_cacheable());
        assert!(!opaque.is_ok());
    }
}
