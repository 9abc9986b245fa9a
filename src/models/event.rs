//! Request/response envelopes exchanged with the gallery router.
//!
//! The router never sees axum types: the HTTP layer converts each request into
//! a [`RequestEvent`] and renders the returned [`ResponseEnvelope`].

use serde::Serialize;
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap};

/// CORS headers attached to every gallery response.
pub const CORS_HEADERS: [(&str, &str); 4] = [
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "GET, POST, DELETE, OPTIONS"),
    ("Access-Control-Allow-Headers", "Content-Type"),
    ("Access-Control-Allow-Credentials", "true"),
];

/// One inbound gallery request.
#[derive(Debug, Clone, Default)]
pub struct RequestEvent {
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub body: Option<String>,
}

impl RequestEvent {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = Some(body.into());
        self
    }
}

/// The router's answer: status, headers and a JSON body.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub status_code: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl ResponseEnvelope {
    /// Build an envelope carrying the CORS header set and a JSON content type.
    pub fn new(status_code: u16, body: Value) -> Self {
        let mut headers: BTreeMap<String, String> = CORS_HEADERS
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        headers.insert("Content-Type".into(), "application/json".into());

        Self {
            status_code,
            headers,
            body,
        }
    }

    pub fn ok(body: Value) -> Self {
        Self::new(200, body)
    }

    /// Envelope with a `{message}` body, used for every user-visible outcome
    /// that is not a data payload.
    pub fn message(status_code: u16, message: &str) -> Self {
        Self::new(status_code, json!({ "message": message }))
    }

    /// Read the `message` field of the body, if any.
    pub fn message_text(&self) -> Option<&str> {
        self.body.get("message").and_then(Value::as_str)
    }
}
