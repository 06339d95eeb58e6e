use std::future::ready;
use std::sync::Arc;

use axum::http::Method;
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::capture;
use crate::health::HealthRegistry;
use crate::pipeline::Pipeline;
use crate::prometheus::{setup_metrics_recorder, track_metrics};

pub const EVENT_BODY_SIZE: usize = 2 * 1024 * 1024; // 2MB

#[derive(Clone)]
pub struct State {
    pub pipeline: Arc<Pipeline>,
}

async fn index() -> &'static str {
    "capture-pipeline"
}

pub fn router(pipeline: Arc<Pipeline>, liveness: HealthRegistry, metrics: bool) -> Router {
    let state = State { pipeline };

    // Producers run inside browser pages, so mirror whatever they send
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .allow_origin(AllowOrigin::mirror_request());

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(capture::readiness))
        .route("/_liveness", get(move || ready(liveness.get_status())))
        .route("/events", post(capture::event))
        .route("/events/throttled", post(capture::throttled_event))
        .route("/flush", post(capture::flush))
        .route(
            "/config",
            get(capture::get_config).patch(capture::update_config),
        )
        .route("/entries", get(capture::entries).delete(capture::clear))
        .route("/records", get(capture::records))
        .route("/sweep", post(capture::sweep))
        .route("/stats", get(capture::stats))
        .layer(RequestBodyLimitLayer::new(EVENT_BODY_SIZE))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(axum::middleware::from_fn(track_metrics))
        .with_state(state);

    // Don't install metrics unless asked to
    // Installing a global recorder when capture is used as a library (during tests etc)
    // does not work well.
    if !metrics {
        return router;
    }
    match setup_metrics_recorder() {
        Ok(recorder_handle) => {
            router.route("/metrics", get(move || ready(recorder_handle.render())))
        }
        Err(err) => {
            warn!("failed to install prometheus recorder: {}", err);
            router
        }
    }
}
