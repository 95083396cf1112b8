use crate::errors::{ApiError, ApiResult};
use actix_web::http::header::CONTENT_TYPE;
use actix_web::{web, HttpRequest, HttpResponse};
use facade_core::{Error, FacadeService, ThresholdUpdate};
use futures_util::FutureExt;
use serde_json::json;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::error;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub facade: Arc<FacadeService>,
    pub environment: String,
}

impl AppState {
    pub fn new(facade: Arc<FacadeService>, environment: impl Into<String>) -> Self {
        Self {
            facade,
            environment: environment.into(),
        }
    }
}

/// Run a handler body, turning a panic into a 500 and logging every failure
/// with the request line.
async fn guarded<F>(req: &HttpRequest, handler: F) -> ApiResult<HttpResponse>
where
    F: Future<Output = ApiResult<HttpResponse>>,
{
    let result = match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(ApiError::from(Error::from_panic(panic))),
    };

    if let Err(e) = &result {
        error!(
            method = %req.method(),
            uri = %req.uri(),
            code = e.code(),
            "{}",
            e
        );
    }
    result
}

// ===== Health Check =====
pub async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    let broker = state
        .facade
        .broker_state()
        .map(|s| s.as_str())
        .unwrap_or("disabled");

    HttpResponse::Ok().json(json!({
        "status": "available",
        "system_info": {
            "environment": state.environment,
            "version": env!("CARGO_PKG_VERSION"),
        },
        "broker": broker,
    }))
}

// ===== Metrics =====
pub async fn metrics() -> HttpResponse {
    HttpResponse::Ok()
        .content_type("text/plain; version=0.0.4")
        .body(facade_core::metrics::export())
}

// ===== Predict =====
pub async fn predict(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> ApiResult<HttpResponse> {
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    guarded(&req, async move {
        let outcome = state.facade.score_payload(content_type, body).await?;

        let counters: BTreeMap<String, i64> = outcome
            .counters
            .iter()
            .map(|(machine_id, counter)| (machine_id.to_string(), *counter))
            .collect();

        Ok(HttpResponse::Created().json(json!({
            "reconstruction_errors": outcome.reconstruction_errors,
            "anomaly_counter": outcome.final_counter,
            "anomaly_counters": counters,
        })))
    })
    .await
}

// ===== Set Threshold =====
pub async fn set_threshold(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<AppState>,
) -> ApiResult<HttpResponse> {
    guarded(&req, async move {
        let update: ThresholdUpdate =
            serde_json::from_slice(&body).map_err(|e| ApiError::InvalidJson(e.to_string()))?;

        let threshold = state.facade.set_threshold(update).await?;
        Ok(HttpResponse::Created().json(json!({ "threshold": threshold })))
    })
    .await
}

// ===== Fallbacks =====
pub async fn not_found(req: HttpRequest) -> ApiResult<HttpResponse> {
    guarded(&req, async { Err(ApiError::NotFound) }).await
}

pub async fn method_not_allowed(req: HttpRequest) -> ApiResult<HttpResponse> {
    let method = req.method().to_string();
    guarded(&req, async move { Err(ApiError::MethodNotAllowed(method)) }).await
}

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/health")
            .route(web::get().to(health_check))
            .default_service(web::to(method_not_allowed)),
    )
    .service(
        web::resource("/metrics")
            .route(web::get().to(metrics))
            .default_service(web::to(method_not_allowed)),
    )
    .service(
        web::scope("/v1")
            .service(
                web::resource("/predict")
                    .route(web::post().to(predict))
                    .default_service(web::to(method_not_allowed)),
            )
            .service(
                web::resource("/threshold")
                    .route(web::post().to(set_threshold))
                    .default_service(web::to(method_not_allowed)),
            ),
    )
    .default_service(web::to(not_found));
}
