//! HTTP adapter for the gallery router.
//!
//! Every request that no other route claims lands here, is flattened into a
//! [`RequestEvent`], dispatched under the configured timeout, and the
//! resulting [`ResponseEnvelope`] is rendered back to HTTP.

use crate::{
    models::event::{RequestEvent, ResponseEnvelope},
    state::AppState,
};
use axum::{
    body::{Body, to_bytes},
    extract::{Request, State},
    http::{HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use tracing::warn;

/// Gallery request bodies are small JSON documents.
const GATEWAY_BODY_LIMIT: usize = 64 * 1024;

/// Fallback handler serving the whole gallery API.
pub async fn gateway(State(state): State<AppState>, request: Request) -> Response {
    let event = match request_event(request).await {
        Ok(event) => event,
        Err(envelope) => return envelope.into_response(),
    };

    let method = event.method.clone();
    let path = event.path.clone();
    match tokio::time::timeout(state.request_timeout, state.gallery.dispatch(event)).await {
        Ok(envelope) => envelope.into_response(),
        Err(_) => {
            warn!(%method, %path, timeout = ?state.request_timeout, "gallery request timed out");
            ResponseEnvelope::message(504, "Request timed out").into_response()
        }
    }
}

/// Flatten an HTTP request into a router event.
async fn request_event(request: Request) -> Result<RequestEvent, ResponseEnvelope> {
    let (parts, body) = request.into_parts();

    let path = urlencoding::decode(parts.uri.path())
        .map_err(|_| ResponseEnvelope::message(400, "Invalid request path"))?
        .into_owned();

    let query: HashMap<String, String> = parts
        .uri
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    let bytes = to_bytes(body, GATEWAY_BODY_LIMIT)
        .await
        .map_err(|_| ResponseEnvelope::message(400, "Invalid request body"))?;
    let body = if bytes.is_empty() {
        None
    } else {
        Some(
            String::from_utf8(bytes.to_vec())
                .map_err(|_| ResponseEnvelope::message(400, "Invalid request body"))?,
        )
    };

    Ok(RequestEvent {
        method: parts.method.to_string(),
        path,
        query,
        body,
    })
}

impl IntoResponse for ResponseEnvelope {
    fn into_response(self) -> Response {
        let body = serde_json::to_vec(&self.body).unwrap_or_else(|_| b"{}".to_vec());
        let mut response = Response::new(Body::from(body));
        *response.status_mut() =
            StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let headers = response.headers_mut();
        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }
        response
    }
}
