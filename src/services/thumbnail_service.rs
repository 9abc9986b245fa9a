//! Thumbnail cache: derives square previews on demand and reuses stored ones.
//!
//! A preview for `key` lives at `preview_{key}`. Its presence is the cache hit;
//! on a miss the original is decoded, center-cropped to a square, resized and
//! re-encoded in its own format. Concurrent misses for one key may both render
//! and overwrite; the output is deterministic so the last write wins harmlessly.

use crate::{
    errors::{GalleryError, GalleryResult},
    services::object_store::ObjectStore,
};
use bytes::Bytes;
use image::{GenericImageView, ImageFormat, imageops::FilterType};
use std::{io::Cursor, sync::Arc};
use tokio::task::JoinError;
use tracing::debug;

pub const PREVIEW_PREFIX: &str = "preview_";

/// Key under which the preview of `key` is cached.
pub fn derived_key(key: &str) -> String {
    format!("{}{}", PREVIEW_PREFIX, key)
}

/// Target thumbnail dimensions in pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ThumbnailSize {
    pub width: u32,
    pub height: u32,
}

impl ThumbnailSize {
    pub fn square(side: u32) -> Self {
        Self {
            width: side,
            height: side,
        }
    }
}

impl Default for ThumbnailSize {
    fn default() -> Self {
        Self::square(100)
    }
}

/// An encoded thumbnail ready to store.
#[derive(Debug)]
pub struct Thumbnail {
    pub data: Bytes,
    pub format: ImageFormat,
}

#[derive(Clone)]
pub struct ThumbnailCache {
    store: Arc<dyn ObjectStore>,
    size: ThumbnailSize,
}

impl ThumbnailCache {
    pub fn new(store: Arc<dyn ObjectStore>, size: ThumbnailSize) -> Self {
        Self { store, size }
    }

    /// Return the derived key for `key`, rendering and storing the preview first
    /// when it does not exist yet.
    pub async fn ensure_preview(&self, key: &str) -> GalleryResult<String> {
        let derived = derived_key(key);
        if self.store.exists(&derived).await? {
            debug!(key, derived = %derived, "preview cache hit");
            return Ok(derived);
        }

        debug!(key, derived = %derived, "preview cache miss");
        let original = self.store.get(key).await?;
        let size = self.size;
        let thumbnail = tokio::task::spawn_blocking(move || render_thumbnail(&original, size))
            .await
            .map_err(render_task_failure)??;

        self.store
            .put(
                &derived,
                thumbnail.data,
                Some(thumbnail.format.to_mime_type().to_string()),
            )
            .await?;
        debug!(key, derived = %derived, "preview stored");
        Ok(derived)
    }
}

/// A render task that panicked or was cancelled is an internal failure, not a
/// property of the image.
fn render_task_failure(err: JoinError) -> GalleryError {
    GalleryError::Store(format!("thumbnail task failed: {err}"))
}

/// Centered square crop box `(x, y, side)` for a `width` x `height` image.
pub fn center_square(width: u32, height: u32) -> (u32, u32, u32) {
    let side = width.min(height);
    ((width - side) / 2, (height - side) / 2, side)
}

/// Decode `original`, crop it to its centered square and resize it to `size`,
/// keeping the source encoding.
///
/// CPU-bound; call from a blocking thread.
pub fn render_thumbnail(original: &[u8], size: ThumbnailSize) -> GalleryResult<Thumbnail> {
    let format = image::guess_format(original)
        .map_err(|e| GalleryError::Decode(format!("unrecognized image format: {e}")))?;
    let img = image::load_from_memory_with_format(original, format)
        .map_err(|e| GalleryError::Decode(e.to_string()))?;

    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return Err(GalleryError::Decode("image has no pixels".into()));
    }

    let (x, y, side) = center_square(width, height);
    let thumb = img
        .crop_imm(x, y, side, side)
        .resize_exact(size.width, size.height, FilterType::Triangle);

    let mut encoded = Cursor::new(Vec::new());
    thumb
        .write_to(&mut encoded, format)
        .map_err(|e| GalleryError::Decode(format!("cannot encode {format:?}: {e}")))?;

    debug!(
        original_width = width,
        original_height = height,
        bytes = encoded.get_ref().len(),
        "thumbnail rendered"
    );
    Ok(Thumbnail {
        data: Bytes::from(encoded.into_inner()),
        format,
    })
}
