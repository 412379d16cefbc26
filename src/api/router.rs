use std::time::Duration;

use axum::{
    Json, Router,
    http::{HeaderName, Request, Response, StatusCode},
    response::IntoResponse,
    routing::get,
};
use tower::ServiceBuilder;
use tower_http::{
    catch_panic::CatchPanicLayer,
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::{MakeSpan, OnFailure, OnResponse, TraceLayer},
};
use tracing::{Level, Span, error, field, info, span};

use super::{
    Env,
    handlers::{get_health, get_list, get_list_root, get_meta, get_stream},
};
use crate::{blobber::BlobberApi, chain::ChainFacade, error::ErrorEnvelope};

#[derive(Clone)]
struct CustomMakeSpan;
impl<B> MakeSpan<B> for CustomMakeSpan {
    fn make_span(&mut self, req: &Request<B>) -> Span {
        let id = req
            .extensions()
            .get::<RequestId>()
            .and_then(|id| id.header_value().to_str().ok())
            .unwrap_or("unknown");
        span!(
            Level::INFO,
            "request",
            id = %id,
            method = %req.method(),
            path = %req.uri().path(),
            error = field::Empty,
        )
    }
}

#[derive(Clone)]
struct CustomOnResponse;
impl<B> OnResponse<B> for CustomOnResponse {
    fn on_response(self, res: &Response<B>, latency: Duration, _: &Span) {
        if res.status().is_success() {
            info!("{} {}ms", res.status(), latency.as_millis());
        } else {
            error!("{} {}ms", res.status(), latency.as_millis());
        }
    }
}

#[derive(Clone)]
struct NoOpOnFailure;
impl<B> OnFailure<B> for NoOpOnFailure {
    fn on_failure(&mut self, _res: B, _latency: Duration, _span: &Span) {}
}

fn handle_panic(panic: Box<dyn std::any::Any + Send>) -> axum::response::Response {
    let message = panic
        .downcast_ref::<String>()
        .map(|s| s.as_str())
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("Unknown panic occurred")
        .to_string();
    let envelope = Json(ErrorEnvelope {
        code: "internal".to_string(),
        msg: message,
    });
    (StatusCode::INTERNAL_SERVER_ERROR, envelope).into_response()
}

pub fn new<B: BlobberApi, C: ChainFacade>(env: Env<B, C>) -> Router {
    let x_request_id = HeaderName::from_static("x-request-id");

    Router::new()
        .route("/health", get(get_health))
        .route("/stream/{*path}", get(get_stream::<B, C>))
        .route("/meta/{*path}", get(get_meta::<B, C>))
        .route("/list", get(get_list_root::<B, C>))
        .route("/list/{*path}", get(get_list::<B, C>))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::new(
                    x_request_id.clone(),
                    MakeRequestUuid,
                ))
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(CustomMakeSpan)
                        .on_response(CustomOnResponse)
                        .on_failure(NoOpOnFailure),
                )
                .layer(PropagateRequestIdLayer::new(x_request_id))
                .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any))
                .layer(CatchPanicLayer::custom(handle_panic)),
        )
        .with_state(env)
}
