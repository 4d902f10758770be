//! HTTP surface: sensor ingestion, protected valve control, login, and the
//! static control page.
//!
//! Response bodies reproduce the wire contract the mobile app and the sensor
//! firmware already speak, Spanish messages included — changing a byte here
//! breaks deployed clients.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::cloud::{CloudError, ValveCloud};
use crate::config::AuthSettings;
use crate::controller::{ControlError, IrrigationController, ValveAction};
use crate::sign::now_millis;

const CONTROL_PAGE: &str = include_str!("ui/control.html");

/// Minimum accepted `x-auth-token` length. The token is bearer-opaque: it is
/// never verified beyond this length check.
const MIN_TOKEN_LEN: usize = 11;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct AppState<C> {
    pub controller: Arc<IrrigationController<C>>,
    pub auth: AuthSettings,
}

impl<C> Clone for AppState<C> {
    fn clone(&self) -> Self {
        Self {
            controller: Arc::clone(&self.controller),
            auth: self.auth.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router<C: ValveCloud>(state: AppState<C>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/api/data/sensor", post(post_sensor::<C>))
        .route("/api/control/valvula", post(post_control::<C>))
        .route("/api/auth/login", post(post_login::<C>))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
        CONTROL_PAGE,
    )
}

fn reply(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

fn error_reply(status: StatusCode, message: &str) -> Response {
    reply(status, json!({ "status": "error", "message": message }))
}

// -- POST /api/data/sensor ---------------------------------------------------

async fn post_sensor<C: ValveCloud>(
    State(state): State<AppState<C>>,
    body: Bytes,
) -> Response {
    // Manual extraction: a missing or non-numeric `humidity` must produce
    // the contract's 400 body, not the framework's rejection.
    let body: Option<Value> = serde_json::from_slice(&body).ok();
    let humidity = body
        .as_ref()
        .and_then(|v| v.get("humidity"))
        .and_then(Value::as_f64);

    let Some(humidity) = humidity else {
        return error_reply(StatusCode::BAD_REQUEST, "Datos de humedad inválidos.");
    };

    match state.controller.record_humidity(humidity).await {
        Ok(()) => reply(
            StatusCode::OK,
            json!({ "status": "success", "message": "Dato recibido." }),
        ),
        Err(e) => {
            warn!("sensor reading rejected: {e}");
            error_reply(StatusCode::BAD_REQUEST, "Datos de humedad inválidos.")
        }
    }
}

// -- POST /api/control/valvula -----------------------------------------------

async fn post_control<C: ValveCloud>(
    State(state): State<AppState<C>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if state.auth.require_control_auth && !authorized(&headers) {
        return error_reply(
            StatusCode::FORBIDDEN,
            "Acceso denegado. Token requerido o inválido.",
        );
    }

    let body: Option<Value> = serde_json::from_slice(&body).ok();
    let action = body
        .as_ref()
        .and_then(|v| v.get("action"))
        .and_then(Value::as_str)
        .and_then(ValveAction::parse);

    let Some(action) = action else {
        return error_reply(StatusCode::BAD_REQUEST, "Invalid action.");
    };

    let duration_minutes = body
        .as_ref()
        .and_then(|v| v.get("durationMinutes"))
        .map(parse_duration_minutes)
        .unwrap_or(0);

    match state.controller.manual_control(action, duration_minutes).await {
        Ok(()) => {
            info!(action = action.as_str(), duration_minutes, "manual control applied");
            reply(
                StatusCode::OK,
                json!({ "status": "success", "action": action.as_str() }),
            )
        }
        Err(e) => {
            if let ControlError::Command(CloudError::Api { code, msg }) = &e {
                error!(?code, %msg, "remote rejected manual control");
            } else {
                error!("manual control failed: {e}");
            }
            error_reply(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}

/// Lenient duration extraction, matching what the deployed clients send:
/// fractional numbers truncate to whole minutes, and strings keep their
/// leading digits (`"10.5"` and `"10min"` both mean 10). Anything else,
/// including negative or non-finite values, means no timer.
fn parse_duration_minutes(value: &Value) -> u64 {
    match value {
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.is_finite() && f > 0.0 => f.trunc() as u64,
            _ => 0,
        },
        Value::String(s) => {
            let digits: &str = {
                let trimmed = s.trim();
                let end = trimmed
                    .find(|c: char| !c.is_ascii_digit())
                    .unwrap_or(trimmed.len());
                &trimmed[..end]
            };
            match digits.parse() {
                Ok(minutes) => minutes,
                // All-digit strings only fail to parse on overflow.
                Err(_) if !digits.is_empty() => u64::MAX,
                Err(_) => 0,
            }
        }
        _ => 0,
    }
}

/// Placeholder bearer check: header present and longer than 10 characters.
fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get("x-auth-token")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|token| token.len() >= MIN_TOKEN_LEN)
}

// -- POST /api/auth/login ------------------------------------------------------

async fn post_login<C: ValveCloud>(
    State(state): State<AppState<C>>,
    body: Bytes,
) -> Response {
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let username = body.get("username").and_then(Value::as_str);
    let password = body.get("password").and_then(Value::as_str);

    let matches = username == Some(state.auth.username.as_str())
        && password == Some(state.auth.password.as_str());

    if matches {
        let token = session_token(&state.auth.username, &state.auth.session_secret);
        info!(username = %state.auth.username, "user authenticated");
        reply(
            StatusCode::OK,
            json!({ "status": "success", "message": "Login exitoso.", "token": token }),
        )
    } else {
        error_reply(StatusCode::UNAUTHORIZED, "Credenciales inválidas.")
    }
}

/// Bearer-opaque session token: a hash over username + secret + current time.
/// Nothing verifies it beyond the control endpoint's length check.
fn session_token(username: &str, secret: &str) -> String {
    let input = format!("{username}{secret}{}", now_millis());
    hex::encode(Sha256::digest(input.as_bytes()))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve<C: ValveCloud>(state: AppState<C>, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("backend listening on http://{addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
