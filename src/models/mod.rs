//! Core data models for the gallery gateway.
//!
//! `bucket` and `object` map to SQLite tables via `sqlx::FromRow`; `event` and
//! `grant` are the transient shapes the router and clients exchange.

pub mod bucket;
pub mod event;
pub mod grant;
pub mod object;
