//! # sa-pipeline
//!
//! Orchestration for skyarchive: the rate limiter, the feed fetcher, the
//! archive operation controller and the export engine. Everything here talks
//! to storage and the network only through the ports in `sa-core`.

pub mod controller;
pub mod embed;
pub mod export;
pub mod fetcher;
pub mod ratelimit;

#[cfg(test)]
pub(crate) mod testing;

pub use controller::{ArchiveController, OperationRegistry};
pub use embed::Embed;
pub use export::{ExportEngine, OutputOpener};
pub use fetcher::{FeedPage, FetchedPost, PageFetcher};
pub use ratelimit::{RateLimitConfig, RateLimitSnapshot, RateLimiter};
