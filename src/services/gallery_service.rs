//! Gallery request router.
//!
//! | Method  | Path                       | Operation                       |
//! |---------|----------------------------|---------------------------------|
//! | OPTIONS | any                        | CORS preflight                  |
//! | GET     | `/list-images`             | list keys with download grants  |
//! | POST    | `/get-presigned-url`       | issue an upload grant           |
//! | DELETE  | `/delete-image/{*key}`     | delete an image                 |
//! | GET     | `/{*key}[?preview]`        | download grant (or its preview) |
//!
//! Anything else is `404 {"message": "Not found"}`. Every envelope carries the
//! CORS header set. The router keeps no state between requests.

use crate::{
    errors::GalleryError,
    models::{
        event::{RequestEvent, ResponseEnvelope},
        grant::{DEFAULT_GRANT_TTL_SECS, UploadCondition},
    },
    services::{
        object_store::ObjectStore,
        storage_service::StorageError,
        thumbnail_service::{ThumbnailCache, derived_key},
    },
};
use serde::Deserialize;
use serde_json::json;
use std::{sync::Arc, time::Duration};
use tracing::{debug, error, warn};

pub const LIST_IMAGES_PATH: &str = "/list-images";
pub const PRESIGN_PATH: &str = "/get-presigned-url";
pub const DELETE_PREFIX: &str = "/delete-image/";
pub const PREVIEW_PARAM: &str = "preview";

const MSG_NOT_FOUND: &str = "Not found";
const MSG_FILE_NOT_FOUND: &str = "File not found";
const MSG_PRESIGN_FAILED: &str = "Failed to generate presigned URL";

/// Resolved gallery operation for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Preflight,
    ListImages,
    PresignUpload,
    DeleteImage(String),
    GetImage { key: String, preview: bool },
    NotFound,
}

impl Route {
    /// Match `event` against the routing table, first match wins.
    pub fn resolve(event: &RequestEvent) -> Self {
        let method = event.method.to_ascii_uppercase();
        let path = event.path.as_str();

        match method.as_str() {
            "OPTIONS" => Route::Preflight,
            "GET" if path == LIST_IMAGES_PATH => Route::ListImages,
            "POST" if path == PRESIGN_PATH => Route::PresignUpload,
            "DELETE" => match path.strip_prefix(DELETE_PREFIX) {
                Some(key) if !key.is_empty() => Route::DeleteImage(key.to_string()),
                _ => Route::NotFound,
            },
            "GET" => match path.strip_prefix('/').unwrap_or(path) {
                "" => Route::NotFound,
                key => Route::GetImage {
                    key: key.to_string(),
                    preview: event.query.contains_key(PREVIEW_PARAM),
                },
            },
            _ => Route::NotFound,
        }
    }
}

/// Tunables for the router, fixed at startup.
#[derive(Clone, Debug)]
pub struct GallerySettings {
    pub grant_ttl: Duration,
    pub max_upload_bytes: u64,
    /// Also delete `preview_{key}` when `key` is deleted.
    pub cascade_preview_delete: bool,
}

impl Default for GallerySettings {
    fn default() -> Self {
        Self {
            grant_ttl: Duration::from_secs(DEFAULT_GRANT_TTL_SECS),
            max_upload_bytes: 20 * 1024 * 1024,
            cascade_preview_delete: false,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct PresignRequest {
    filename: Option<String>,
    filetype: Option<String>,
}

#[derive(Clone)]
pub struct Gallery {
    store: Arc<dyn ObjectStore>,
    thumbnails: ThumbnailCache,
    settings: GallerySettings,
}

impl Gallery {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        thumbnails: ThumbnailCache,
        settings: GallerySettings,
    ) -> Self {
        Self {
            store,
            thumbnails,
            settings,
        }
    }

    /// Handle one request event.
    pub async fn dispatch(&self, event: RequestEvent) -> ResponseEnvelope {
        let route = Route::resolve(&event);
        debug!(method = %event.method, path = %event.path, ?route, "dispatching gallery request");

        match route {
            Route::Preflight => ResponseEnvelope::message(200, "CORS preflight successful"),
            Route::ListImages => self.list_images().await,
            Route::PresignUpload => self.presign_upload(event.body.as_deref()),
            Route::DeleteImage(key) => self.delete_image(&key).await,
            Route::GetImage { key, preview } => self.get_image(&key, preview).await,
            Route::NotFound => ResponseEnvelope::message(404, MSG_NOT_FOUND),
        }
    }

    async fn list_images(&self) -> ResponseEnvelope {
        let keys = match self.store.list().await {
            Ok(keys) => keys,
            Err(err) => {
                error!(error = %err, "listing images failed");
                return ResponseEnvelope::message(500, "Failed to list images");
            }
        };

        let mut images = Vec::with_capacity(keys.len());
        for key in keys {
            match self.store.issue_download_grant(&key, self.settings.grant_ttl) {
                Ok(url) => images.push(json!({ "id": key, "url": url })),
                Err(err) => {
                    error!(key = %key, error = %err, "issuing download grant failed");
                    return ResponseEnvelope::message(500, MSG_PRESIGN_FAILED);
                }
            }
        }

        ResponseEnvelope::ok(json!({ "images": images }))
    }

    fn presign_upload(&self, body: Option<&str>) -> ResponseEnvelope {
        let request = match body.map(str::trim).filter(|b| !b.is_empty()) {
            None => PresignRequest::default(),
            Some(raw) => match serde_json::from_str::<PresignRequest>(raw) {
                Ok(request) => request,
                Err(err) => {
                    warn!(error = %err, "unparseable presign request body");
                    return ResponseEnvelope::message(400, "Invalid request body");
                }
            },
        };

        let (filename, filetype) = match (request.filename, request.filetype) {
            (Some(name), Some(kind)) if !name.is_empty() && !kind.is_empty() => (name, kind),
            _ => return ResponseEnvelope::message(400, "Filename and filetype required"),
        };

        let conditions = [
            UploadCondition::ContentType { value: filetype },
            UploadCondition::ContentLengthRange {
                min: 0,
                max: self.settings.max_upload_bytes,
            },
        ];
        match self
            .store
            .issue_upload_grant(&filename, self.settings.grant_ttl, &conditions)
        {
            Ok(grant) => match serde_json::to_value(&grant) {
                Ok(body) => ResponseEnvelope::ok(body),
                Err(err) => {
                    error!(error = %err, "serializing upload grant failed");
                    ResponseEnvelope::message(500, MSG_PRESIGN_FAILED)
                }
            },
            Err(StorageError::InvalidObjectKey) => {
                ResponseEnvelope::message(400, "Invalid filename")
            }
            Err(err) => {
                error!(key = %filename, error = %err, "issuing upload grant failed");
                ResponseEnvelope::message(500, MSG_PRESIGN_FAILED)
            }
        }
    }

    async fn delete_image(&self, key: &str) -> ResponseEnvelope {
        match self.store.exists(key).await {
            Ok(true) => {}
            Ok(false) => return ResponseEnvelope::message(404, MSG_FILE_NOT_FOUND),
            Err(err) => return delete_failure(key, err),
        }

        if let Err(err) = self.store.delete(key).await {
            return delete_failure(key, err);
        }

        if self.settings.cascade_preview_delete {
            let derived = derived_key(key);
            match self.store.delete(&derived).await {
                Ok(()) => debug!(key, derived = %derived, "cascaded preview delete"),
                Err(StorageError::ObjectNotFound { .. }) => {}
                Err(err) => warn!(derived = %derived, error = %err, "preview cleanup failed"),
            }
        }

        ResponseEnvelope::message(200, "Image deleted successfully")
    }

    async fn get_image(&self, key: &str, preview: bool) -> ResponseEnvelope {
        let mut target = key.to_string();

        if preview {
            match self.store.exists(key).await {
                Ok(true) => {}
                Ok(false) => return ResponseEnvelope::message(404, MSG_FILE_NOT_FOUND),
                Err(err) => return preview_failure(key, err.into()),
            }
            match self.thumbnails.ensure_preview(key).await {
                Ok(derived) => target = derived,
                Err(err) => return preview_failure(key, err),
            }
        }

        match self.store.issue_download_grant(&target, self.settings.grant_ttl) {
            Ok(url) => ResponseEnvelope::ok(json!({ "url": url })),
            Err(err) => {
                warn!(key = %target, error = %err, "issuing download grant failed");
                ResponseEnvelope::message(400, MSG_PRESIGN_FAILED)
            }
        }
    }
}

fn delete_failure(key: &str, err: StorageError) -> ResponseEnvelope {
    match GalleryError::from(err) {
        GalleryError::NotFound(_) => ResponseEnvelope::message(404, MSG_FILE_NOT_FOUND),
        GalleryError::Validation(_) => ResponseEnvelope::message(400, "Invalid filename"),
        other => {
            error!(key, error = %other, "deleting image failed");
            ResponseEnvelope::message(500, "Failed to delete image")
        }
    }
}

fn preview_failure(key: &str, err: GalleryError) -> ResponseEnvelope {
    let status = err.status().as_u16();
    match err {
        GalleryError::NotFound(_) => ResponseEnvelope::message(status, MSG_FILE_NOT_FOUND),
        GalleryError::Decode(ref reason) => {
            warn!(key, reason = %reason, "preview source is not a decodable image");
            ResponseEnvelope::message(status, "Unable to create preview")
        }
        GalleryError::Validation(_) => ResponseEnvelope::message(status, "Invalid filename"),
        other => {
            error!(key, error = %other, "preview generation failed");
            ResponseEnvelope::message(status, "Failed to create preview")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        object_store::memory::MemoryStore,
        thumbnail_service::{ThumbnailSize, tests::encoded_image},
    };
    use image::ImageFormat;
    use std::sync::atomic::Ordering;

    fn gallery_with(store: &Arc<MemoryStore>, settings: GallerySettings) -> Gallery {
        let thumbnails = ThumbnailCache::new(store.clone(), ThumbnailSize::default());
        Gallery::new(store.clone(), thumbnails, settings)
    }

    fn gallery(store: &Arc<MemoryStore>) -> Gallery {
        gallery_with(store, GallerySettings::default())
    }

    #[test]
    fn routing_table_resolves_in_order() {
        let get = |path: &str| RequestEvent::new("GET", path);
        assert_eq!(Route::resolve(&RequestEvent::new("OPTIONS", "/list-images")), Route::Preflight);
        assert_eq!(Route::resolve(&get("/list-images")), Route::ListImages);
        assert_eq!(Route::resolve(&RequestEvent::new("POST", "/get-presigned-url")), Route::PresignUpload);
        assert_eq!(
            Route::resolve(&RequestEvent::new("DELETE", "/delete-image/a/b.png")),
            Route::DeleteImage("a/b.png".into())
        );
        assert_eq!(
            Route::resolve(&get("/dir/cat.png").with_query("preview", "")),
            Route::GetImage { key: "dir/cat.png".into(), preview: true }
        );
        assert_eq!(
            Route::resolve(&get("/get-presigned-url")),
            Route::GetImage { key: "get-presigned-url".into(), preview: false }
        );
        assert_eq!(Route::resolve(&get("/")), Route::NotFound);
        assert_eq!(Route::resolve(&RequestEvent::new("DELETE", "/delete-image/")), Route::NotFound);
        assert_eq!(Route::resolve(&RequestEvent::new("DELETE", "/cat.png")), Route::NotFound);
        assert_eq!(Route::resolve(&RequestEvent::new("PUT", "/cat.png")), Route::NotFound);
        assert_eq!(Route::resolve(&RequestEvent::new("POST", "/list-images")), Route::NotFound);
    }

    #[tokio::test]
    async fn preflight_is_always_ok_with_cors() {
        let store = Arc::new(MemoryStore::default());
        store.fail_io.store(true, Ordering::SeqCst);
        let resp = gallery(&store).dispatch(RequestEvent::new("OPTIONS", "/anything")).await;

        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.message_text(), Some("CORS preflight successful"));
        assert_eq!(resp.headers["Access-Control-Allow-Origin"], "*");
        assert_eq!(resp.headers["Access-Control-Allow-Credentials"], "true");
    }

    #[tokio::test]
    async fn unknown_routes_are_not_found() {
        let store = Arc::new(MemoryStore::default());
        let resp = gallery(&store).dispatch(RequestEvent::new("PATCH", "/x")).await;
        assert_eq!(resp.status_code, 404);
        assert_eq!(resp.message_text(), Some("Not found"));
        assert_eq!(resp.headers["Access-Control-Allow-Methods"], "GET, POST, DELETE, OPTIONS");
    }

    #[tokio::test]
    async fn list_images_grants_every_key() {
        let store = Arc::new(MemoryStore::default());
        store.insert("b.png", b"b".to_vec());
        store.insert("a.png", b"a".to_vec());

        let resp = gallery(&store).dispatch(RequestEvent::new("GET", "/list-images")).await;
        assert_eq!(resp.status_code, 200);
        let images = resp.body["images"].as_array().unwrap();
        assert_eq!(images.len(), 2);
        assert_eq!(images[0]["id"], "a.png");
        assert_eq!(images[0]["url"], "memory://a.png?ttl=3600");
        assert_eq!(images[1]["id"], "b.png");
    }

    #[tokio::test]
    async fn list_images_on_empty_store() {
        let store = Arc::new(MemoryStore::default());
        let resp = gallery(&store).dispatch(RequestEvent::new("GET", "/list-images")).await;
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body, json!({ "images": [] }));
    }

    #[tokio::test]
    async fn list_images_failures_are_500() {
        let store = Arc::new(MemoryStore::default());
        store.insert("a.png", b"a".to_vec());
        store.fail_grants.store(true, Ordering::SeqCst);
        let resp = gallery(&store).dispatch(RequestEvent::new("GET", "/list-images")).await;
        assert_eq!(resp.status_code, 500);

        store.fail_io.store(true, Ordering::SeqCst);
        let resp = gallery(&store).dispatch(RequestEvent::new("GET", "/list-images")).await;
        assert_eq!(resp.status_code, 500);
        assert_eq!(resp.message_text(), Some("Failed to list images"));
    }

    #[tokio::test]
    async fn presign_requires_filename_and_filetype() {
        let store = Arc::new(MemoryStore::default());
        let g = gallery(&store);

        for body in [Some("{}"), Some(r#"{"filename":"a.png"}"#), Some(r#"{"filename":"","filetype":"image/png"}"#), None] {
            let mut event = RequestEvent::new("POST", "/get-presigned-url");
            event.body = body.map(str::to_string);
            let resp = g.dispatch(event).await;
            assert_eq!(resp.status_code, 400, "body {body:?}");
            assert_eq!(resp.message_text(), Some("Filename and filetype required"));
        }

        let resp = g
            .dispatch(RequestEvent::new("POST", "/get-presigned-url").with_body("{nope"))
            .await;
        assert_eq!(resp.status_code, 400);
        assert_eq!(resp.message_text(), Some("Invalid request body"));
    }

    #[tokio::test]
    async fn presign_returns_grant_as_is() {
        let store = Arc::new(MemoryStore::default());
        let resp = gallery(&store)
            .dispatch(
                RequestEvent::new("POST", "/get-presigned-url")
                    .with_body(r#"{"filename":"cat.png","filetype":"image/png"}"#),
            )
            .await;

        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body["url"], "memory://upload");
        assert_eq!(resp.body["fields"]["key"], "cat.png");
        assert_eq!(resp.body["fields"]["Content-Type"], "image/png");
        assert!(resp.body.get("message").is_none());
    }

    #[tokio::test]
    async fn presign_issuance_failure_is_500() {
        let store = Arc::new(MemoryStore::default());
        store.fail_grants.store(true, Ordering::SeqCst);
        let resp = gallery(&store)
            .dispatch(
                RequestEvent::new("POST", "/get-presigned-url")
                    .with_body(r#"{"filename":"cat.png","filetype":"image/png"}"#),
            )
            .await;
        assert_eq!(resp.status_code, 500);
        assert_eq!(resp.message_text(), Some("Failed to generate presigned URL"));
    }

    #[tokio::test]
    async fn delete_existing_then_missing() {
        let store = Arc::new(MemoryStore::default());
        store.insert("photo.png", b"p".to_vec());
        let g = gallery(&store);

        let resp = g.dispatch(RequestEvent::new("DELETE", "/delete-image/photo.png")).await;
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.message_text(), Some("Image deleted successfully"));
        assert!(!store.exists("photo.png").await.unwrap());

        let resp = g.dispatch(RequestEvent::new("DELETE", "/delete-image/photo.png")).await;
        assert_eq!(resp.status_code, 404);
        assert_eq!(resp.message_text(), Some("File not found"));
    }

    #[tokio::test]
    async fn delete_keeps_preview_unless_cascading() {
        let store = Arc::new(MemoryStore::default());
        store.insert("a.png", b"a".to_vec());
        store.insert("preview_a.png", b"pa".to_vec());
        gallery(&store)
            .dispatch(RequestEvent::new("DELETE", "/delete-image/a.png"))
            .await;
        assert!(store.object("preview_a.png").is_some());

        store.insert("b.png", b"b".to_vec());
        store.insert("preview_b.png", b"pb".to_vec());
        let cascading = GallerySettings {
            cascade_preview_delete: true,
            ..GallerySettings::default()
        };
        let resp = gallery_with(&store, cascading)
            .dispatch(RequestEvent::new("DELETE", "/delete-image/b.png"))
            .await;
        assert_eq!(resp.status_code, 200);
        assert!(store.object("preview_b.png").is_none());
    }

    #[tokio::test]
    async fn delete_store_failure_is_500() {
        let store = Arc::new(MemoryStore::default());
        store.fail_io.store(true, Ordering::SeqCst);
        let resp = gallery(&store)
            .dispatch(RequestEvent::new("DELETE", "/delete-image/a.png"))
            .await;
        assert_eq!(resp.status_code, 500);
        assert_eq!(resp.message_text(), Some("Failed to delete image"));
    }

    #[tokio::test]
    async fn plain_get_grants_without_existence_check() {
        let store = Arc::new(MemoryStore::default());
        let resp = gallery(&store).dispatch(RequestEvent::new("GET", "/never-uploaded.jpg")).await;
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body["url"], "memory://never-uploaded.jpg?ttl=3600");
    }

    #[tokio::test]
    async fn get_grant_failure_is_400() {
        let store = Arc::new(MemoryStore::default());
        store.fail_grants.store(true, Ordering::SeqCst);
        let resp = gallery(&store).dispatch(RequestEvent::new("GET", "/a.png")).await;
        assert_eq!(resp.status_code, 400);
        assert_eq!(resp.message_text(), Some("Failed to generate presigned URL"));
    }

    #[tokio::test]
    async fn preview_of_missing_file_is_404() {
        let store = Arc::new(MemoryStore::default());
        let resp = gallery(&store)
            .dispatch(RequestEvent::new("GET", "/missing.jpg").with_query("preview", "1"))
            .await;
        assert_eq!(resp.status_code, 404);
        assert_eq!(resp.message_text(), Some("File not found"));
        assert_eq!(store.puts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn preview_redirects_grant_to_derived_key() {
        let store = Arc::new(MemoryStore::default());
        store.insert("cat.png", encoded_image(320, 240, ImageFormat::Png));
        let g = gallery(&store);

        let resp = g
            .dispatch(RequestEvent::new("GET", "/cat.png").with_query("preview", "1"))
            .await;
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.body["url"], "memory://preview_cat.png?ttl=3600");
        assert!(store.object("preview_cat.png").is_some());

        g.dispatch(RequestEvent::new("GET", "/cat.png").with_query("preview", ""))
            .await;
        assert_eq!(store.puts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn preview_of_non_image_is_400() {
        let store = Arc::new(MemoryStore::default());
        store.insert("notes.txt", b"plain text".to_vec());
        let resp = gallery(&store)
            .dispatch(RequestEvent::new("GET", "/notes.txt").with_query("preview", "1"))
            .await;
        assert_eq!(resp.status_code, 400);
        assert_eq!(resp.message_text(), Some("Unable to create preview"));
    }

    #[tokio::test]
    async fn preview_store_outage_is_500() {
        let store = Arc::new(MemoryStore::default());
        store.fail_io.store(true, Ordering::SeqCst);
        let resp = gallery(&store)
            .dispatch(RequestEvent::new("GET", "/cat.png").with_query("preview", "1"))
            .await;
        assert_eq!(resp.status_code, 500);
        assert!(!resp.message_text().unwrap().contains("backend offline"));
    }
}
