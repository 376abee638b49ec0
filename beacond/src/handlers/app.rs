use std::sync::Arc;
use std::time::Duration;

use axum::{routing, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use beacon_common::manager::BeaconManager;
use beacon_common::metrics;

use super::probe;
use crate::api::BaseResponse;

#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<BeaconManager>,
    /// Poll delay given to probes created over HTTP.
    pub poll_interval: Duration,
    /// Bound for stopping a probe on `DELETE /probe`.
    pub stop_timeout: Duration,
}

pub fn app(state: AppState, metrics: Option<PrometheusHandle>) -> Router {
    Router::new()
        .route("/", routing::get(index))
        .route("/health", routing::get(health))
        .route("/beacon", routing::get(probe::describe))
        .route("/probes", routing::get(probe::list))
        .route(
            "/probe",
            routing::get(probe::get)
                .post(probe::create)
                .delete(probe::delete),
        )
        .with_state(state)
        .route(
            "/metrics",
            routing::get(move || match metrics {
                Some(ref recorder_handle) => std::future::ready(recorder_handle.render()),
                None => std::future::ready("no metrics recorder installed".to_owned()),
            }),
        )
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(metrics::track_metrics))
}

pub async fn index() -> &'static str {
    "beacond"
}

pub async fn health() -> Json<BaseResponse> {
    Json(BaseResponse::message("beacond is happily running :)"))
}
