//! Shared application state handed to every axum handler.

use crate::services::{
    gallery_service::{Gallery, GallerySettings},
    object_store::ObjectStore,
    storage_service::StorageService,
    thumbnail_service::{ThumbnailCache, ThumbnailSize},
};
use std::{sync::Arc, time::Duration};

#[derive(Clone)]
pub struct AppState {
    /// Concrete local store, used directly by grant redemption and readiness.
    pub storage: StorageService,
    /// Gallery router wired to the same store through `dyn ObjectStore`.
    pub gallery: Gallery,
    /// Upper bound on one gallery dispatch.
    pub request_timeout: Duration,
}

impl AppState {
    pub fn new(
        storage: StorageService,
        settings: GallerySettings,
        thumbnail_size: ThumbnailSize,
        request_timeout: Duration,
    ) -> Self {
        let store: Arc<dyn ObjectStore> = Arc::new(storage.clone());
        let thumbnails = ThumbnailCache::new(store.clone(), thumbnail_size);
        Self {
            storage,
            gallery: Gallery::new(store, thumbnails, settings),
            request_timeout,
        }
    }
}
