//! The wire layer of the tollgate billing service: serializable API errors,
//! request/response models, bearer credentials, and axum server helpers.

/// Bearer credential wire type and header parsing.
pub mod auth;
/// Serializable api error types and error kinds.
pub mod error;
/// Request / response models.
pub mod models;
/// Server utilities: extractors, rejections, middleware, graceful serving.
pub mod server;
