//! Application state shared across request handlers.

use std::sync::Arc;

use crate::pipeline::ImageService;

/// Shared application state, passed to handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<ImageService>,
}

impl AppState {
    pub fn new(service: ImageService) -> Self {
        Self {
            inner: Arc::new(service),
        }
    }

    pub fn service(&self) -> &ImageService {
        &self.inner
    }
}
