use anyhow::{Context, Result};
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderName, HeaderValue, Method, header};
use axum::routing::{delete, get, post};
use axum::{Json, Router, middleware};
use serde_json::json;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::Settings;
use crate::state::AppState;
use crate::{routes, trace};

pub async fn serve(settings: Settings, host: &str, port: u16) -> Result<()> {
    let state = AppState::initialize(settings).await?;
    let app = router(state);

    let addr = format!("{host}:{port}");
    tracing::info!(%addr, "metergate listening");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    axum::serve(listener, app).await.context("running server")?;

    Ok(())
}

pub fn router(state: AppState) -> Router {
    let api = Router::new()
        // Auth
        .route("/auth/magic-link", post(routes::auth::magic_link))
        .route("/auth/verify", post(routes::auth::verify))
        .route("/auth/telegram", post(routes::auth::telegram))
        .route("/auth/google", post(routes::auth::google))
        .route("/auth/google/init", get(routes::auth::google_init))
        .route("/auth/google/callback", get(routes::auth::google_callback))
        .route("/auth/refresh", post(routes::auth::refresh))
        .route("/auth/logout", post(routes::auth::logout))
        .route("/auth/me", get(routes::auth::me))
        // Account
        .route("/balance", get(routes::balance::balance))
        .route("/usage", get(routes::balance::usage))
        .route("/usage/summary", get(routes::balance::usage_summary))
        .route("/history", get(routes::balance::history))
        .route("/keys", get(routes::keys::list).post(routes::keys::create))
        .route("/keys/{id}", delete(routes::keys::revoke))
        // Pricing
        .route("/pricing", get(routes::pricing::list))
        .route("/pricing/estimate", post(routes::pricing::estimate))
        // Payments
        .route("/payments/checkout", post(routes::payments::checkout))
        .route("/webhooks/paddle", post(routes::webhooks::paddle))
        .route("/webhooks/lemonsqueezy", post(routes::webhooks::lemonsqueezy))
        .route("/webhooks/telegram_stars", post(routes::webhooks::telegram_stars))
        // Metered products
        .route("/chart2csv/extract", post(routes::chart2csv::extract))
        .route("/masker/redact", post(routes::masker::redact))
        .route("/patas/analyze", post(routes::patas::analyze))
        .route("/proxy/llm", post(routes::proxy::llm))
        .route("/proxy/http", post(routes::proxy::http))
        // Chart uploads run up to 20 MiB; axum's default cap is 2 MiB.
        .layer(DefaultBodyLimit::max(25 * 1024 * 1024));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .nest("/api/v1", api)
        .layer(middleware::from_fn_with_state(state.clone(), trace::middleware))
        .layer(cors_layer(&state))
        .with_state(state)
}

fn cors_layer(state: &AppState) -> CorsLayer {
    let origins: Vec<HeaderValue> = state
        .settings
        .cors_origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-api-key"),
            HeaderName::from_static("x-request-id"),
        ])
        .expose_headers([
            HeaderName::from_static("x-request-id"),
            HeaderName::from_static("x-credits-used"),
            HeaderName::from_static("x-credits-balance"),
        ])
}

async fn healthz() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn metrics(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> ([(HeaderName, &'static str); 1], String) {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.prometheus.render(),
    )
}
