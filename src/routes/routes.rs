//! Defines the HTTP surface of the gateway.
//!
//! ## Structure
//! - **Probes**
//!   - `GET  /healthz`, `GET /readyz`
//!
//! - **Grant redemption** (local object store)
//!   - `POST /_store`        : upload through a signed form policy
//!   - `GET  /_store/{*key}` : download through a signed URL
//!
//! - **Gallery API** (fallback for everything else)
//!   - `OPTIONS *`, `GET /list-images`, `POST /get-presigned-url`,
//!     `DELETE /delete-image/{*key}`, `GET /{*key}[?preview]`
//!
//! Methods a concrete route does not handle fall through to the gallery so
//! that `OPTIONS` preflights succeed on every path.

use crate::{
    handlers::{
        gallery_handlers::gateway,
        grant_handlers::{download_object, upload_object},
        health_handlers::{healthz, readyz},
    },
    state::AppState,
};
use axum::{
    Router,
    extract::DefaultBodyLimit,
    routing::{get, post},
};

/// Room for the policy, signature and multipart framing around the file.
const FORM_OVERHEAD_BYTES: usize = 64 * 1024;

/// Build the router for the whole gateway. `max_upload_bytes` sizes the body
/// limit of the upload endpoint.
pub fn routes(max_upload_bytes: u64) -> Router<AppState> {
    let upload_limit = usize::try_from(max_upload_bytes)
        .unwrap_or(usize::MAX)
        .saturating_add(FORM_OVERHEAD_BYTES);

    Router::new()
        .route("/healthz", get(healthz).fallback(gateway))
        .route("/readyz", get(readyz).fallback(gateway))
        .route(
            "/_store",
            post(upload_object)
                .fallback(gateway)
                .layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/_store/{*key}", get(download_object).fallback(gateway))
        .fallback(gateway)
}
