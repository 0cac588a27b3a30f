//! Offline proxy for the chat shell: precache on install, evict stale
//! versions on activate, and serve fetches cache-first.

use std::sync::Arc;

use reqwest::Url;
use tracing::{debug, error, info, instrument, warn};

use crate::{CacheMode, CacheStorage, Network, OfflineError, Request, RequestMode, Response};

pub const CACHE_VERSION: &str = "v1.0.3";
pub const CACHE_PREFIX: &str = "lumen-chat-cache";
pub const SHELL_DOCUMENT: &str = "./index.html";
pub const OFFLINE_DOCUMENT: &str = "<h1>Offline</h1><p>The application cannot be loaded. Please check your internet connection.</p>";

const PRECACHE_ASSETS: &[&str] = &[SHELL_DOCUMENT];

pub struct OfflineCache {
    scope: Url,
    shell_url: Url,
    cache_name: String,
    storage: Arc<CacheStorage>,
    network: Arc<dyn Network>,
}

impl OfflineCache {
    /// `scope` is the URL the shell is served under, e.g. `https://host/app/`.
    pub fn new(
        scope: Url,
        storage: Arc<CacheStorage>,
        network: Arc<dyn Network>,
    ) -> Result<Self, OfflineError> {
        let shell_url = resolve(&scope, SHELL_DOCUMENT)?;
        Ok(Self {
            scope,
            shell_url,
            cache_name: format!("{}-{}", CACHE_PREFIX, CACHE_VERSION),
            storage,
            network,
        })
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn shell_url(&self) -> &Url {
        &self.shell_url
    }

    /// Precache the shell bypassing HTTP caches. Individual failures are
    /// logged and skipped.
    #[instrument(skip(self), fields(version = CACHE_VERSION))]
    pub async fn install(&self) -> Result<(), OfflineError> {
        self.storage.open(&self.cache_name);
        info!(assets = ?PRECACHE_ASSETS, "Caching app shell");

        for asset in PRECACHE_ASSETS {
            let url = resolve(&self.scope, asset)?;
            let request = Request::get(url.clone()).with_cache(CacheMode::Reload);

            match self.network.fetch(&request).await {
                Ok(resp) if resp.is_ok() => {
                    self.storage.put(&self.cache_name, url.as_str(), resp);
                }
                Ok(resp) => {
                    let e = OfflineError::BadStatus {
                        url: url.to_string(),
                        status: resp.status,
                    };
                    error!("Failed to cache {} during install: {}", asset, e);
                }
                Err(e) => error!("Failed to cache {} during install: {}", asset, e),
            }
        }
        Ok(())
    }

    /// Delete caches of older versions. Returns the deleted names.
    #[instrument(skip(self), fields(version = CACHE_VERSION))]
    pub fn activate(&self) -> Vec<String> {
        let stale: Vec<String> = self
            .storage
            .keys()
            .into_iter()
            .filter(|name| name.starts_with(CACHE_PREFIX) && *name != self.cache_name)
            .collect();

        for name in &stale {
            info!("Deleting old cache: {}", name);
            self.storage.delete(name);
        }
        stale
    }

    fn is_shell_navigation(&self, request: &Request) -> bool {
        request.mode == RequestMode::Navigate
            && request.url.origin() == self.scope.origin()
            && request.url.path() == self.shell_url.path()
    }

    pub async fn handle_fetch(&self, request: &Request) -> Result<Response, OfflineError> {
        if self.is_shell_navigation(request) {
            return Ok(self.serve_shell(request).await);
        }

        let key = request.url.as_str();
        if let Some(cached) = self.storage.match_any(key) {
            debug!(url = key, "Serving from cache");
            return Ok(cached);
        }

        let resp = self.network.fetch(request).await.map_err(|e| {
            error!("Network fetch error for {}: {}", key, e);
            e
        })?;

        if resp.is_cacheable() {
            self.storage.put(&self.cache_name, key, resp.clone());
        } else {
            debug!(url = key, status = resp.status, "Not caching response");
        }
        Ok(resp)
    }

    async fn serve_shell(&self, request: &Request) -> Response {
        if let Some(cached) = self.storage.match_any(self.shell_url.as_str()) {
            return cached;
        }

        match self.network.fetch(request).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!("Fetch failed for app shell ({}): {}", SHELL_DOCUMENT, e);
                Response::html(OFFLINE_DOCUMENT)
            }
        }
    }
}

fn resolve(base: &Url, path: &str) -> Result<Url, OfflineError> {
    base.join(path)
        .map_err(|e| OfflineError::InvalidUrl(format!("{}: {}", path, e)))
}
