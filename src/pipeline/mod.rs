//! The image retrieval-and-transformation pipeline.
//!
//! The coordinator drives fetch -> detect -> transform and decides, per
//! configured mode, whether the result is persisted or streamed straight
//! back. Concurrent cache-mode requests for the same key coalesce into a
//! single execution via the store's per-key gate.

pub mod cache;
pub mod detect;
pub mod fetch;
pub mod transform;

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{Config, Mode};
use cache::{CacheKey, CacheStore};
use detect::{DetectError, ImageFormat};
use fetch::{FetchError, FetchResult, OriginFetcher};
use transform::{TransformError, TransformedImage};

/// Errors surfaced to the serving boundary. Store failures never appear
/// here - persistence is best-effort and recovered locally.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid request path: {0}")]
    InvalidPath(String),

    #[error("target dimensions must be non-zero")]
    InvalidDimensions,

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Detect(#[from] DetectError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("transform task failed: {0}")]
    Internal(String),
}

/// A validated, immutable request descriptor.
#[derive(Debug, Clone)]
pub struct ImageRequest {
    source_path: String,
    pub target_width: Option<u32>,
    pub target_height: Option<u32>,
    pub format_override: Option<ImageFormat>,
}

impl ImageRequest {
    /// Build a request for a relative source path.
    ///
    /// The path must be non-empty and must not contain parent-directory
    /// components; a leading slash is tolerated and stripped. Target
    /// dimensions, when given, must be non-zero.
    pub fn new(
        source_path: &str,
        target_width: Option<u32>,
        target_height: Option<u32>,
        format_override: Option<ImageFormat>,
    ) -> Result<Self, PipelineError> {
        let path = source_path.trim_start_matches('/');
        if path.is_empty() {
            return Err(PipelineError::InvalidPath("empty path".to_string()));
        }
        if path.split('/').any(|segment| segment == "..") {
            return Err(PipelineError::InvalidPath(source_path.to_string()));
        }
        if target_width == Some(0) || target_height == Some(0) {
            return Err(PipelineError::InvalidDimensions);
        }
        Ok(Self {
            source_path: path.to_string(),
            target_width,
            target_height,
            format_override,
        })
    }

    pub fn source_path(&self) -> &str {
        &self.source_path
    }

    /// Output format known before fetching: the explicit override, or the
    /// extension hint in the path. `None` means the output format can only
    /// be decided after detecting the downloaded payload.
    fn output_format_hint(&self) -> Option<ImageFormat> {
        self.format_override.or_else(|| {
            let ext = self.source_path.rsplit('.').next()?;
            ImageFormat::from_extension(ext)
        })
    }
}

/// Response payload handed back to the HTTP layer.
#[derive(Debug)]
pub struct ServedImage {
    pub bytes: Bytes,
    pub content_type: &'static str,
}

/// Orchestrates the pipeline per configured serving mode.
pub struct ImageService {
    fetcher: OriginFetcher,
    store: Option<Arc<CacheStore>>,
    mode: Mode,
    quality: u8,
    max_image_size: u64,
}

impl ImageService {
    /// Build the service from validated configuration.
    ///
    /// Config guarantees `resize_dir` is present in cache mode.
    pub fn new(config: &Config) -> Result<Self, PipelineError> {
        let fetcher = OriginFetcher::new(
            config.origin_url.clone(),
            config.max_image_size,
            config.request_timeout,
        )?;

        let store = match (config.mode, &config.resize_dir) {
            (Mode::Cache, Some(dir)) => Some(Arc::new(CacheStore::new(dir.clone()))),
            _ => None,
        };

        Ok(Self {
            fetcher,
            store,
            mode: config.mode,
            quality: config.quality,
            max_image_size: config.max_image_size,
        })
    }

    /// Serve one request: cache mode checks and fills the store; stream
    /// mode always runs the full pipeline and never persists.
    pub async fn serve(&self, request: &ImageRequest) -> Result<ServedImage, PipelineError> {
        match (self.mode, &self.store, request.output_format_hint()) {
            (Mode::Cache, Some(store), Some(format)) => {
                self.serve_cached(request, store, format).await
            }
            (Mode::Cache, Some(_), None) => {
                // Output format is unknowable before the fetch, so the key
                // cannot be derived. Serve fresh without persisting.
                debug!(path = %request.source_path(), "No format hint, bypassing cache");
                self.serve_fresh(request).await
            }
            _ => self.serve_fresh(request).await,
        }
    }

    async fn serve_cached(
        &self,
        request: &ImageRequest,
        store: &Arc<CacheStore>,
        output_format: ImageFormat,
    ) -> Result<ServedImage, PipelineError> {
        let key = CacheKey::derive(
            request.source_path(),
            request.target_width,
            request.target_height,
            output_format,
            self.quality,
        );

        if let Some(entry) = store.lookup(&key).await {
            return Ok(ServedImage {
                bytes: entry.bytes,
                content_type: entry.format.content_type(),
            });
        }

        // Coalesce concurrent misses: one caller transforms, the rest wait
        // and hit the freshly written entry on the re-check.
        let key_lock = store.key_lock(&key).await;
        let _guard = key_lock.lock().await;

        if let Some(entry) = store.lookup(&key).await {
            debug!(key = %key, "Cache filled while waiting for key lock");
            return Ok(ServedImage {
                bytes: entry.bytes,
                content_type: entry.format.content_type(),
            });
        }

        let image = self.fetch_and_transform(request, Some(output_format)).await?;

        // Persistence is an optimization; the transform already succeeded,
        // so a failed write still serves the computed bytes.
        if let Err(e) = store.put(&key, &image).await {
            warn!(key = %key, error = %e, "Cache write failed, streaming result");
        }

        Ok(ServedImage {
            content_type: image.content_type(),
            bytes: image.bytes,
        })
    }

    async fn serve_fresh(&self, request: &ImageRequest) -> Result<ServedImage, PipelineError> {
        let image = self
            .fetch_and_transform(request, request.format_override)
            .await?;
        Ok(ServedImage {
            content_type: image.content_type(),
            bytes: image.bytes,
        })
    }

    /// Fetch, detect, transform. `output_format` of `None` means "keep the
    /// detected input format".
    async fn fetch_and_transform(
        &self,
        request: &ImageRequest,
        output_format: Option<ImageFormat>,
    ) -> Result<TransformedImage, PipelineError> {
        let fetched: FetchResult = self.fetcher.fetch(request.source_path()).await?;

        let input_format = detect::detect(
            fetched.content_type.as_deref(),
            &fetched.bytes,
            request.source_path(),
        )?;
        let output_format = output_format.unwrap_or(input_format);

        let (width, height) = (request.target_width, request.target_height);
        let (quality, max_bytes) = (self.quality, self.max_image_size);

        // Decode/resize/encode is CPU-bound; keep it off the request path.
        let image = tokio::task::spawn_blocking(move || {
            transform::transform(
                &fetched,
                input_format,
                output_format,
                width,
                height,
                quality,
                max_bytes,
            )
        })
        .await
        .map_err(|e| PipelineError::Internal(e.to_string()))??;

        info!(
            path = %request.source_path(),
            format = %image.format,
            width = image.width,
            height = image.height,
            size = image.bytes.len(),
            "Image transformed"
        );

        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_rejects_empty_path() {
        assert!(matches!(
            ImageRequest::new("", Some(200), None, None),
            Err(PipelineError::InvalidPath(_))
        ));
        assert!(matches!(
            ImageRequest::new("/", None, None, None),
            Err(PipelineError::InvalidPath(_))
        ));
    }

    #[test]
    fn request_rejects_parent_components() {
        assert!(ImageRequest::new("../secrets.png", None, None, None).is_err());
        assert!(ImageRequest::new("photos/../../x.png", None, None, None).is_err());
        // A dot inside a file name is fine.
        assert!(ImageRequest::new("photos/a..b.png", None, None, None).is_ok());
    }

    #[test]
    fn request_rejects_zero_dimensions() {
        assert!(matches!(
            ImageRequest::new("a.png", Some(0), None, None),
            Err(PipelineError::InvalidDimensions)
        ));
        assert!(matches!(
            ImageRequest::new("a.png", None, Some(0), None),
            Err(PipelineError::InvalidDimensions)
        ));
        assert!(ImageRequest::new("a.png", Some(1), Some(1), None).is_ok());
    }

    #[test]
    fn leading_slash_is_stripped() {
        let request = ImageRequest::new("/photos/cat.png", None, None, None).unwrap();
        assert_eq!(request.source_path(), "photos/cat.png");
    }

    #[test]
    fn override_beats_path_extension_for_output_hint() {
        let request =
            ImageRequest::new("photos/cat.png", None, None, Some(ImageFormat::Webp)).unwrap();
        assert_eq!(request.output_format_hint(), Some(ImageFormat::Webp));

        let request = ImageRequest::new("photos/cat.png", None, None, None).unwrap();
        assert_eq!(request.output_format_hint(), Some(ImageFormat::Png));

        let request = ImageRequest::new("photos/cat", None, None, None).unwrap();
        assert_eq!(request.output_format_hint(), None);
    }
}
