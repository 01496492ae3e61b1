//! imgproxy - image resize proxy.
//!
//! Fetches origin images by relative path, validates them against size and
//! format constraints, resizes/recompresses them, and serves the result
//! either streamed directly or persisted to a local cache directory.

pub mod api;
pub mod config;
pub mod pipeline;
pub mod state;

pub use config::{Config, ConfigError, Mode};
pub use pipeline::{
    cache::{CacheKey, CacheStore, StoreError},
    detect::{DetectError, ImageFormat},
    fetch::{FetchError, FetchResult, OriginFetcher},
    transform::{TransformError, TransformedImage},
    ImageRequest, ImageService, PipelineError, ServedImage,
};
