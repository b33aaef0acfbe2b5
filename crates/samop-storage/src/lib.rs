//! HTTP fetch, partition cache and state snapshot storage for the SAM.gov pipeline.

pub mod cache;
pub mod http;
pub mod state;

pub use cache::{
    CacheBackend, CacheError, FileCacheBackend, MemoryCacheBackend, PartitionCache,
    PARTITION_CACHE_TTL,
};
pub use http::{
    classify_status, BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher,
    HttpTransport, RawResponse, ReqwestTransport, RetryDisposition, Sleeper, TokioSleeper,
    TransportError,
};
pub use reqwest::StatusCode;
pub use state::{StateStore, LEGACY_SNAPSHOT_FILE, SNAPSHOT_KEEP};

pub const CRATE_NAME: &str = "samop-storage";
