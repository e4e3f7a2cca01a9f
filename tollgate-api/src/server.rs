//! This module provides various API server utilities.
//!
//! # Serving
//!
//! [`spawn_server_task`] serves a [`Router`] with a fallback handler (for
//! unmatched paths), request tracing, load shedding, concurrency limits,
//! server-side timeouts, a request body limit, and graceful shutdown.
//!
//! # Extractors to get data from requests
//!
//! - [`ApiJson`] to deserialize from HTTP body JSON
//! - [`ApiQuery`] to deserialize from query strings
//!
//! # Building API-conformant responses
//!
//! - [`ApiJson`] as a return type for success responses
//! - [`BillingApiError`] and [`CommonApiError`] impl [`IntoResponse`]
//! - [`ApiRejection`] for notifying clients of bad JSON, query strings, etc.
//!
//! [`IntoResponse`]: axum::response::IntoResponse
//! [`BillingApiError`]: crate::error::BillingApiError

use std::{fmt, net::SocketAddr, time::Duration};

use anyhow::Context as _;
use axum::{
    error_handling::HandleErrorLayer,
    extract::{
        rejection::{JsonRejection, QueryRejection},
        DefaultBodyLimit, FromRequest, FromRequestParts, Request,
    },
    response::IntoResponse,
    Router,
};
use http::StatusCode;
use serde::{de::DeserializeOwned, Serialize};
use tollgate_common::{shutdown::Shutdown, task::NamedTask};
use tower::{
    limit::ConcurrencyLimitLayer, load_shed::LoadShedLayer,
    timeout::TimeoutLayer,
};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::error::{
    CommonApiError, CommonErrorKind, ErrorResponse,
    SERVER_500_INTERNAL_SERVER_ERROR,
};

/// A configuration object for the tower middleware applied to every server.
///
/// Defaults:
///
/// ```
/// # use std::time::Duration;
/// # use tollgate_api::server::LayerConfig;
/// assert_eq!(
///     LayerConfig::default(),
///     LayerConfig {
///         body_limit: Some(65536),
///         load_shed: true,
///         concurrency: Some(4096),
///         handling_timeout: Some(Duration::from_secs(15)),
///         default_fallback: true,
///     }
/// );
/// ```
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LayerConfig {
    /// The maximum size of the request body in bytes ([`None`] to disable).
    /// Helps prevent DoS. Provider webhook payloads can reach tens of KiB.
    pub body_limit: Option<usize>,
    /// Whether to shed load when the service has reached capacity.
    pub load_shed: bool,
    /// The maximum # of requests we'll process at once ([`None`] to
    /// disable). Helps prevent the CPU from maxing out, resulting in
    /// thrashing.
    pub concurrency: Option<usize>,
    /// The maximum time a server can spend handling a request ([`None`] to
    /// disable). Prevents degenerate cases which take abnormally long to
    /// process from crowding out normal workloads.
    pub handling_timeout: Option<Duration>,
    /// Whether to add the default [`Router::fallback`], which returns a
    /// "bad endpoint" rejection along with the requested method and path.
    /// If you need a custom fallback, set this to `false` and configure
    /// your own.
    pub default_fallback: bool,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            body_limit: Some(65536),
            load_shed: true,
            concurrency: Some(4096),
            handling_timeout: Some(Duration::from_secs(15)),
            default_fallback: true,
        }
    }
}

// --- Server helpers --- //

/// Serves `router` on `listener` in a spawned, instrumented task. Returns
/// the server task and the bound socket address.
///
/// Triggering `shutdown` begins a graceful shutdown of the server; the
/// application root's join loop bounds how long draining may take.
pub fn spawn_server_task(
    listener: std::net::TcpListener,
    router: Router<()>,
    layer_config: LayerConfig,
    server_span_name: &'static str,
    shutdown: Shutdown,
) -> anyhow::Result<(NamedTask<()>, SocketAddr)> {
    let server_addr = listener
        .local_addr()
        .context("Could not get local address of TcpListener")?;

    // Add the default fallback if it is enabled in the LayerConfig.
    let router = if layer_config.default_fallback {
        router.fallback(default_fallback)
    } else {
        router
    };

    // Requests pass through the layers top to bottom.
    //
    // `HandleErrorLayer` converts the `BoxError`s produced by the load
    // shed / concurrency / timeout layers back into API-conformant
    // responses, restoring the `Infallible` error type axum requires.
    let middleware = tower::ServiceBuilder::new()
        .layer(HandleErrorLayer::new(handle_middleware_error))
        .option_layer(layer_config.load_shed.then(LoadShedLayer::new))
        .option_layer(layer_config.concurrency.map(ConcurrencyLimitLayer::new))
        .option_layer(layer_config.handling_timeout.map(TimeoutLayer::new))
        // Normalizes the innermost route's `Infallible` error to `BoxError`
        // so every arm of the optional layers above agrees on an error
        // type (required for `tower::util::Either` to type-check).
        .layer(tower::util::MapErrLayer::new(tower::BoxError::from));

    let router = router
        .layer(middleware)
        // Log requests and responses on their way in and out.
        .layer(TraceLayer::new_for_http())
        .layer(match layer_config.body_limit {
            Some(limit) => DefaultBodyLimit::max(limit),
            None => DefaultBodyLimit::disable(),
        });

    listener
        .set_nonblocking(true)
        .context("Could not set listener nonblocking")?;
    let listener = tokio::net::TcpListener::from_std(listener)
        .context("Could not convert TcpListener")?;

    let span = tracing::info_span!(parent: None, "(api-server)");
    let server_task =
        NamedTask::spawn_with_span(server_span_name, span, async move {
            let serve_result = axum::serve(listener, router)
                .with_graceful_shutdown(shutdown.wait_owned())
                .await;
            match serve_result {
                Ok(()) => debug!("API server finished"),
                Err(e) => error!("API server errored: {e:#}"),
            }
        });

    Ok((server_task, server_addr))
}

/// Maps errors generated by the middleware stack to API-conformant
/// responses.
async fn handle_middleware_error(error: tower::BoxError) -> CommonApiError {
    if error.is::<tower::load_shed::error::Overloaded>() {
        CommonApiError::new(
            CommonErrorKind::AtCapacity,
            format!("Service is at capacity; retry later: {error}"),
        )
    } else if error.is::<tower::timeout::error::Elapsed>() {
        CommonApiError::new(
            CommonErrorKind::Timeout,
            format!("Server timed out handling request: {error}"),
        )
    } else {
        CommonApiError::new(
            CommonErrorKind::Server,
            format!("Unexpected middleware error: {error}"),
        )
    }
}

/// Build an [`http::Response`] with a JSON body from a serializable value.
pub fn build_json_response(
    status: StatusCode,
    value: &impl Serialize,
) -> http::Response<axum::body::Body> {
    match serde_json::to_vec(value) {
        Ok(body) => http::Response::builder()
            .status(status)
            .header(http::header::CONTENT_TYPE, "application/json")
            .body(axum::body::Body::from(body))
            .expect("Building a response from parts shouldn't fail"),
        Err(err) => {
            error!("Failed to serialize response body: {err:#}");
            let error_response = ErrorResponse {
                code: CommonErrorKind::Server.to_code(),
                msg: "Failed to serialize response body".to_owned(),
            };
            let body = serde_json::to_vec(&error_response)
                .expect("ErrorResponse serialization is infallible");
            http::Response::builder()
                .status(SERVER_500_INTERNAL_SERVER_ERROR)
                .header(http::header::CONTENT_TYPE, "application/json")
                .body(axum::body::Body::from(body))
                .expect("Building a response from parts shouldn't fail")
        }
    }
}

// --- ApiJson --- //

/// A version of [`axum::Json`] which conforms to the tollgate (JSON) API.
/// It can be used as either an extractor or a response.
///
/// - As an extractor: rejections return [`ApiRejection`] (a JSON
///   [`ErrorResponse`]) rather than axum's plain-string body.
/// - As a response: serializes to a JSON body with [`StatusCode::OK`].
///
/// NOTE: only use this for forming *success* responses, i.e. `T` in
/// `Result<T, E>`; the api error types have their own [`IntoResponse`]
/// impls which return error statuses.
pub struct ApiJson<T>(pub T);

impl<T: DeserializeOwned, S: Send + Sync> FromRequest<S> for ApiJson<T> {
    type Rejection = ApiRejection;

    async fn from_request(
        req: Request,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        // `axum::Json`'s from_request impl is fine but its rejection is not
        axum::Json::from_request(req, state)
            .await
            .map(|axum::Json(t)| Self(t))
            .map_err(ApiRejection::from)
    }
}

impl<T: Serialize> IntoResponse for ApiJson<T> {
    fn into_response(self) -> http::Response<axum::body::Body> {
        build_json_response(StatusCode::OK, &self.0)
    }
}

impl<T: Clone> Clone for ApiJson<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: fmt::Debug> fmt::Debug for ApiJson<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        T::fmt(&self.0, f)
    }
}

impl<T: Eq + PartialEq> Eq for ApiJson<T> {}

impl<T: PartialEq> PartialEq for ApiJson<T> {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq(&other.0)
    }
}

// --- ApiQuery --- //

/// API-conformant version of [`axum::extract::Query`].
pub struct ApiQuery<T>(pub T);

impl<T: DeserializeOwned, S: Send + Sync> FromRequestParts<S> for ApiQuery<T> {
    type Rejection = ApiRejection;

    async fn from_request_parts(
        parts: &mut http::request::Parts,
        state: &S,
    ) -> Result<Self, Self::Rejection> {
        axum::extract::Query::from_request_parts(parts, state)
            .await
            .map(|axum::extract::Query(t)| Self(t))
            .map_err(ApiRejection::from)
    }
}

impl<T: fmt::Debug> fmt::Debug for ApiQuery<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        T::fmt(&self.0, f)
    }
}

// --- ApiRejection --- //

/// Our own [`axum::extract::rejection`] type with an [`IntoResponse`] impl
/// which conforms to the tollgate API. Contains the source rejection's
/// error text.
pub struct ApiRejection {
    /// Which rejection this [`ApiRejection`] was built from.
    kind: ApiRejectionKind,
    /// The error text of the source rejection, or additional context.
    source_msg: String,
}

enum ApiRejectionKind {
    /// [`JsonRejection`]
    Json,
    /// [`QueryRejection`]
    Query,
    /// Bearer auth
    Auth,
    /// Client request did not match any paths in the [`Router`].
    BadEndpoint,
}

impl ApiRejection {
    pub fn from_bearer_auth(error: impl fmt::Display) -> Self {
        Self {
            kind: ApiRejectionKind::Auth,
            source_msg: format!("{error:#}"),
        }
    }
}

impl From<JsonRejection> for ApiRejection {
    fn from(json_rejection: JsonRejection) -> Self {
        Self {
            kind: ApiRejectionKind::Json,
            source_msg: json_rejection.body_text(),
        }
    }
}

impl From<QueryRejection> for ApiRejection {
    fn from(query_rejection: QueryRejection) -> Self {
        Self {
            kind: ApiRejectionKind::Query,
            source_msg: query_rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiRejection {
    fn into_response(self) -> http::Response<axum::body::Body> {
        let kind = CommonErrorKind::Rejection;
        // e.g. "Rejection: Client provided bad JSON: <details>"
        let kind_msg = self.kind.to_msg();
        let source_msg = &self.source_msg;
        let msg = format!("Rejection: {kind_msg}: {source_msg}");
        // Log the rejection now since the trace layer can't access this info
        warn!("{msg}");
        CommonApiError { kind, msg }.into_response()
    }
}

impl ApiRejectionKind {
    /// A generic error message for this rejection kind.
    fn to_msg(&self) -> &'static str {
        match self {
            Self::Json => "Client provided bad JSON",
            Self::Query => "Client provided bad query string",
            Self::Auth => "Bad bearer auth credential",
            Self::BadEndpoint => "Client requested a non-existent endpoint",
        }
    }
}

// --- Helpers --- //

/// The default fallback [`Handler`](axum::handler::Handler).
/// Returns a "bad endpoint" rejection with the requested method and path.
pub async fn default_fallback(
    method: http::Method,
    uri: http::Uri,
) -> ApiRejection {
    let path = uri.path();
    ApiRejection {
        kind: ApiRejectionKind::BadEndpoint,
        // e.g. "POST /v1/webhooks/provider"
        source_msg: format!("{method} {path}"),
    }
}
