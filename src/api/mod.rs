//! HTTP surface: one axum router serving the OpenAI-compatible endpoints plus a
//! health probe, grounded on the `api` module layout.

pub mod chat;
pub mod health;
pub mod request_id;
