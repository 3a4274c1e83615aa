//! Per-request correlation and opt-in debug capture.
//!
//! The middleware assigns every request an id (client-supplied
//! `X-Request-ID` or a fresh UUID), exposes it task-locally so error
//! envelopes and audit rows can reference it, and stamps it on the
//! response. When the identified account opted into debug capture, the
//! request and response bodies are buffered and written to `debug_logs`
//! in the background.

use std::cell::Cell;

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, Method};
use axum::middleware::Next;
use axum::response::Response;
use sqlx::PgPool;
use uuid::Uuid;

use crate::state::AppState;

/// Bodies above this size are not captured.
const CAPTURE_LIMIT: usize = 256 * 1024;

tokio::task_local! {
    static TRACE: TraceContext;
}

struct TraceContext {
    request_id: String,
    client_ip: Option<String>,
    user_agent: Option<String>,
    debug_account: Cell<Option<Uuid>>,
}

pub fn current_request_id() -> Option<String> {
    TRACE.try_with(|t| t.request_id.clone()).ok()
}

pub fn client_ip() -> Option<String> {
    TRACE.try_with(|t| t.client_ip.clone()).ok().flatten()
}

pub fn user_agent() -> Option<String> {
    TRACE.try_with(|t| t.user_agent.clone()).ok().flatten()
}

/// Called by the auth layer once the caller resolves to an account with
/// `opt_in_debug` set.
pub fn mark_debug(account_id: Uuid) {
    let _ = TRACE.try_with(|t| t.debug_account.set(Some(account_id)));
}

/// Normalized client IP: `CF-Connecting-IP` wins, else the first
/// `X-Forwarded-For` hop.
pub fn client_ip_from_headers(headers: &HeaderMap) -> Option<String> {
    if let Some(ip) = headers.get("cf-connecting-ip").and_then(|v| v.to_str().ok()) {
        return Some(ip.trim().to_string());
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub async fn middleware(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let ctx = TraceContext {
        request_id: request_id.clone(),
        client_ip: client_ip_from_headers(req.headers()),
        user_agent: req
            .headers()
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        debug_account: Cell::new(None),
    };

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    tracing::info!(request_id = %request_id, %method, %path, "request");

    let mut response = TRACE
        .scope(ctx, async {
            let (req, request_body) = buffer_capturable(req).await;
            let response = next.run(req).await;

            match TRACE.with(|t| t.debug_account.get()) {
                Some(account_id) => {
                    capture(state.db.clone(), account_id, method, path, request_body, response)
                        .await
                }
                None => response,
            }
        })
        .await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    metrics::counter!(
        "http_requests_total",
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);

    response
}

/// Buffer the request body when it is a bounded JSON payload; streaming
/// and multipart bodies pass through untouched.
async fn buffer_capturable(req: Request) -> (Request, Option<String>) {
    if !matches!(*req.method(), Method::POST | Method::PUT | Method::PATCH)
        || !bounded_json(req.headers())
    {
        return (req, None);
    }

    let (parts, body) = req.into_parts();
    match to_bytes(body, CAPTURE_LIMIT).await {
        Ok(bytes) => {
            let text = String::from_utf8_lossy(&bytes).into_owned();
            (Request::from_parts(parts, Body::from(bytes)), Some(text))
        }
        Err(_) => (Request::from_parts(parts, Body::empty()), None),
    }
}

async fn capture(
    db: PgPool,
    account_id: Uuid,
    method: Method,
    path: String,
    request_body: Option<String>,
    response: Response,
) -> Response {
    if !bounded_json(response.headers()) {
        return response;
    }

    let (parts, body) = response.into_parts();
    let bytes = match to_bytes(body, CAPTURE_LIMIT).await {
        Ok(bytes) => bytes,
        Err(err) => {
            tracing::warn!(error = %err, "debug capture lost response body");
            return Response::from_parts(parts, Body::empty());
        }
    };

    let status = parts.status.as_u16() as i32;
    let response_body = String::from_utf8_lossy(&bytes).into_owned();
    let request_id = current_request_id();

    tokio::spawn(async move {
        let result = sqlx::query(
            "INSERT INTO debug_logs
                 (account_id, request_id, path, method, request_body, response_body, status_code)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(account_id)
        .bind(request_id)
        .bind(path)
        .bind(method.as_str())
        .bind(request_body)
        .bind(response_body)
        .bind(status)
        .execute(&db)
        .await;

        if let Err(err) = result {
            tracing::warn!(%account_id, error = %err, "failed to write debug log");
        }
    });

    Response::from_parts(parts, Body::from(bytes))
}

/// JSON content with a known length within the capture cap.
fn bounded_json(headers: &HeaderMap) -> bool {
    let json = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/json"));
    let bounded = headers
        .get("content-length")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok())
        .is_some_and(|len| len <= CAPTURE_LIMIT);
    json && bounded
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (k, v) in pairs {
            map.insert(
                axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        map
    }

    #[test]
    fn cloudflare_header_wins() {
        let map = headers(&[
            ("cf-connecting-ip", "1.2.3.4"),
            ("x-forwarded-for", "5.6.7.8, 9.9.9.9"),
        ]);
        assert_eq!(client_ip_from_headers(&map), Some("1.2.3.4".into()));
    }

    #[test]
    fn first_forwarded_hop_used() {
        let map = headers(&[("x-forwarded-for", " 5.6.7.8 , 9.9.9.9")]);
        assert_eq!(client_ip_from_headers(&map), Some("5.6.7.8".into()));
    }

    #[test]
    fn no_headers_no_ip() {
        assert_eq!(client_ip_from_headers(&HeaderMap::new()), None);
    }

    #[test]
    fn capture_requires_bounded_json() {
        assert!(bounded_json(&headers(&[
            ("content-type", "application/json"),
            ("content-length", "100"),
        ])));
        assert!(!bounded_json(&headers(&[
            ("content-type", "multipart/form-data"),
            ("content-length", "100"),
        ])));
        assert!(!bounded_json(&headers(&[("content-type", "application/json")])));
    }
}
