pub mod cache;
pub mod network;
pub mod worker;

pub use cache::CacheStorage;
pub use reqwest::Url;
pub use network::{
    CacheMode, HttpNetwork, Network, OfflineError, Request, RequestMode, Response, ResponseKind,
};
pub use worker::{OfflineCache, CACHE_PREFIX, CACHE_VERSION, OFFLINE_DOCUMENT, SHELL_DOCUMENT};
