//! HTTP surface: `/classify_image` and `/health`.

use axum::extract::rejection::FormRejection;
use axum::extract::{Form, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use celebclass_core::ClassificationService;
use serde::Deserialize;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ClassificationService>,
}

#[derive(Debug, Deserialize)]
pub struct ClassifyForm {
    pub image_data: Option<String>,
}

pub fn router(service: Arc<ClassificationService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::any())
        .allow_methods(vec![Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(vec![header::CONTENT_TYPE, header::ACCEPT]);

    Router::new()
        .route("/classify_image", get(classify_image).post(classify_image))
        .route("/health", get(health))
        .layer(cors)
        .with_state(AppState { service })
}

fn error_response(message: impl Into<String>) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": message.into() })),
    )
        .into_response()
}

/// Form field `image_data` from a POST body or a GET query string.
pub async fn classify_image(State(state): State<AppState>, form: Result<Form<ClassifyForm>, FormRejection>) -> Response {
    let image_data = match form {
        Ok(Form(ClassifyForm { image_data: Some(data) })) => data,
        Ok(_) => {
            tracing::error!("request without image_data");
            return error_response("missing form field: image_data");
        }
        Err(rejection) => {
            tracing::error!(error = %rejection, "unreadable form");
            return error_response(rejection.body_text());
        }
    };

    let preview: String = image_data.chars().take(100).collect();
    tracing::debug!(preview = %preview, len = image_data.len(), "received image data");

    let result = tokio::task::spawn_blocking({
        let service = state.service.clone();
        move || service.classify_parts(Some(&image_data), None)
    })
    .await;

    match result {
        Ok(Ok(results)) => {
            tracing::info!(faces = results.len(), "classified image");
            (StatusCode::OK, Json(results)).into_response()
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "error processing image");
            error_response(e.to_string())
        }
        Err(e) => {
            tracing::error!(error = %e, "classification task failed");
            error_response(format!("task error: {e}"))
        }
    }
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let artifacts = state.service.artifacts();
    let status = if artifacts.is_ready() { "ok" } else { "not_ready" };
    let classes = artifacts.labels().map_or(0, |l| l.len());
    Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "classes": classes,
    }))
}
