//! Redemption endpoints for access grants issued by the local object store.
//!
//! - `GET  /_store/{*key}?expires=&signature=` streams the object.
//! - `POST /_store` accepts a multipart form built from an upload grant's
//!   `fields` followed by a `file` part.

use crate::{
    errors::AppError,
    models::object::Object,
    services::signer::{
        FIELD_CONTENT_TYPE, FIELD_KEY, FIELD_POLICY, FIELD_SIGNATURE, enforce_policy,
    },
    state::AppState,
};
use axum::{
    body::Body,
    extract::{Multipart, Path, Query, State, multipart::MultipartError},
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use serde::Deserialize;
use std::collections::HashMap;
use tokio_util::io::ReaderStream;
use tracing::debug;

const FILE_FIELD: &str = "file";

#[derive(Debug, Deserialize)]
pub struct DownloadGrantQuery {
    pub expires: Option<i64>,
    pub signature: Option<String>,
}

/// GET `/_store/{*key}`: verify the signed URL and stream the payload.
pub async fn download_object(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(grant): Query<DownloadGrantQuery>,
) -> Result<Response, AppError> {
    let (Some(expires), Some(signature)) = (grant.expires, grant.signature) else {
        return Err(AppError::forbidden("Missing access grant"));
    };
    state
        .storage
        .signer()
        .verify_download(&key, expires, &signature)?;

    let (meta, file) = state.storage.get_object_reader(&key).await?;
    debug!(key = %key, size = meta.size_bytes, "serving granted download");

    let mut response = Response::new(Body::from_stream(ReaderStream::new(file)));
    *response.status_mut() = StatusCode::OK;
    set_object_headers(response.headers_mut(), &meta);
    Ok(response)
}

/// POST `/_store`: verify the signed policy and store the uploaded file.
pub async fn upload_object(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, AppError> {
    let mut fields: HashMap<String, String> = HashMap::new();
    let mut file: Option<Bytes> = None;

    // Fields after the file part are ignored, as with browser form uploads to S3.
    while let Some(field) = multipart.next_field().await.map_err(form_error)? {
        let name = field.name().unwrap_or_default().to_string();
        if name == FILE_FIELD {
            file = Some(field.bytes().await.map_err(form_error)?);
            break;
        }
        let value = field.text().await.map_err(form_error)?;
        fields.insert(name, value);
    }

    let field = |name: &str| fields.get(name).map(String::as_str);
    let (Some(policy), Some(signature)) = (field(FIELD_POLICY), field(FIELD_SIGNATURE)) else {
        return Err(AppError::forbidden("Missing upload policy"));
    };
    let key = field(FIELD_KEY)
        .ok_or_else(|| AppError::new(StatusCode::BAD_REQUEST, "Missing key field"))?;
    let file = file.ok_or_else(|| AppError::new(StatusCode::BAD_REQUEST, "Missing file field"))?;
    let content_type = field(FIELD_CONTENT_TYPE);

    let policy = state.storage.signer().verify_upload(policy, signature)?;
    enforce_policy(&policy, key, content_type, file.len() as u64)?;

    let object = state
        .storage
        .put_object(key, file, content_type.map(str::to_string))
        .await?;
    debug!(key = %object.key, size = object.size_bytes, "granted upload stored");

    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::NO_CONTENT;
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    if let Some(etag) = object.etag.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
            headers.insert(header::ETAG, value);
        }
    }
    Ok(response)
}

/// Parser detail goes to the log; the client only sees the status class.
fn form_error(err: MultipartError) -> AppError {
    let status = err.status();
    debug!(%status, error = %err.body_text(), "rejected upload form");
    let message = if status == StatusCode::PAYLOAD_TOO_LARGE {
        "Upload too large"
    } else {
        "Invalid upload form"
    };
    AppError::new(status, message)
}

fn set_object_headers(headers: &mut HeaderMap, meta: &Object) {
    let content_type = meta
        .content_type
        .clone()
        .unwrap_or_else(|| "application/octet-stream".into());
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(&content_type)
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );

    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&meta.size_bytes.max(0).to_string())
            .unwrap_or_else(|_| HeaderValue::from_static("0")),
    );

    if let Some(etag) = meta.etag.as_ref() {
        if let Ok(value) = HeaderValue::from_str(&format!("\"{}\"", etag)) {
            headers.insert(header::ETAG, value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(&meta.last_modified.to_rfc2822()) {
        headers.insert(header::LAST_MODIFIED, value);
    }

    headers.insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
}
