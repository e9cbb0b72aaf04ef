//! Axum route handlers. Each module owns one area of the HTTP surface and
//! only ever talks to `AppState`'s services, translating to/from the DTOs
//! in `models::dto`.

pub mod chat;
pub mod documents;
pub mod health;
pub mod query;
pub mod realtime;
pub mod tenants;
