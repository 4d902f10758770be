//! Tuya-style cloud client: grant-token acquisition, device status queries,
//! and valve commands.
//!
//! The `ValveCloud` trait is the seam between the decision logic and the
//! remote platform; the controller and scheduler are generic over it so tests
//! can substitute a recording mock. Tokens are short-lived and fetched fresh
//! per operation — nothing here caches them.

use std::future::Future;

use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};

use crate::sign::{now_millis, RequestSigner, SignedHeaders, SIGN_METHOD};

/// The platform data point holding the valve's open/closed state.
pub const SWITCH_CODE: &str = "switch_1";

const TOKEN_PATH: &str = "/v1.0/token";
const TOKEN_QUERY: &str = "?grant_type=1";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("Device ID no definido.")]
    DeviceNotConfigured,
    #[error("Fallo de conexión a la API de Tuya: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("{msg}")]
    Api { code: Option<i64>, msg: String },
    #[error("respuesta inesperada de la API: {0}")]
    Malformed(String),
}

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Opaque short-lived credential for one outgoing call sequence.
#[derive(Debug, Clone)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Remote operations the decision engine depends on.
pub trait ValveCloud: Send + Sync + 'static {
    fn fetch_access_token(&self) -> impl Future<Output = Result<AccessToken, CloudError>> + Send;

    /// Query the device and return the `switch_1` state. A device with no
    /// `switch_1` data point reads as closed.
    fn valve_status(&self) -> impl Future<Output = Result<bool, CloudError>> + Send;

    fn set_valve(
        &self,
        open: bool,
        token: &AccessToken,
    ) -> impl Future<Output = Result<(), CloudError>> + Send;

    /// Fail-safe status read: a failed query reads as closed, so the
    /// automation never double-opens on a transient error. The cause is
    /// logged before being swallowed.
    fn status_or_closed(&self) -> impl Future<Output = bool> + Send {
        async {
            match self.valve_status().await {
                Ok(open) => open,
                Err(e) => {
                    warn!("valve status query failed, assuming closed: {e}");
                    false
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Wire envelopes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    msg: Option<String>,
    result: Option<T>,
}

impl<T> Envelope<T> {
    /// Unwrap a success envelope's result, mapping the failure modes to
    /// typed errors.
    fn into_result(self, what: &str) -> Result<T, CloudError> {
        if !self.success {
            return Err(CloudError::Api {
                code: self.code,
                msg: self
                    .msg
                    .unwrap_or_else(|| format!("cloud reported failure for {what}")),
            });
        }
        self.result
            .ok_or_else(|| CloudError::Malformed(format!("missing result for {what}")))
    }
}

#[derive(Debug, Deserialize)]
struct TokenResult {
    access_token: String,
}

#[derive(Debug, Deserialize)]
pub struct DeviceResult {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub online: bool,
    #[serde(default)]
    status: Vec<DataPoint>,
}

#[derive(Debug, Deserialize)]
struct DataPoint {
    code: String,
    value: serde_json::Value,
}

impl DeviceResult {
    /// Scan the status list for `switch_1`; absent or non-boolean reads as
    /// closed.
    pub fn switch_state(&self) -> bool {
        self.status
            .iter()
            .find(|dp| dp.code == SWITCH_CODE)
            .and_then(|dp| dp.value.as_bool())
            .unwrap_or(false)
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

pub struct TuyaClient {
    http: reqwest::Client,
    base_url: String,
    device_id: String,
    signer: RequestSigner,
}

impl TuyaClient {
    pub fn new(base_url: impl Into<String>, device_id: impl Into<String>, signer: RequestSigner) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            device_id: device_id.into(),
            signer,
        }
    }

    fn apply_headers(rb: reqwest::RequestBuilder, h: &SignedHeaders) -> reqwest::RequestBuilder {
        let rb = rb
            .header("client_id", &h.client_id)
            .header("t", &h.t)
            .header("sign", &h.sign)
            .header("sign_method", SIGN_METHOD);
        match &h.access_token {
            Some(token) => rb.header("access_token", token),
            None => rb,
        }
    }

    /// Full device overview; used by the startup connection test.
    pub async fn device_info(&self, token: &AccessToken) -> Result<DeviceResult, CloudError> {
        if self.device_id.is_empty() {
            return Err(CloudError::DeviceNotConfigured);
        }
        let path = format!("/v1.0/devices/{}", self.device_id);
        let t = now_millis();
        let headers = self
            .signer
            .headers("GET", &path, "", None, Some(token.as_str()), &t);

        let envelope: Envelope<DeviceResult> =
            Self::apply_headers(self.http.get(format!("{}{path}", self.base_url)), &headers)
                .send()
                .await?
                .json()
                .await?;
        envelope.into_result("device status")
    }
}

impl ValveCloud for TuyaClient {
    async fn fetch_access_token(&self) -> Result<AccessToken, CloudError> {
        let t = now_millis();
        let headers = self
            .signer
            .headers("GET", TOKEN_PATH, TOKEN_QUERY, None, None, &t);

        let envelope: Envelope<TokenResult> = Self::apply_headers(
            self.http
                .get(format!("{}{TOKEN_PATH}{TOKEN_QUERY}", self.base_url)),
            &headers,
        )
        .send()
        .await?
        .json()
        .await?;

        let result = envelope.into_result("grant token").map_err(|e| {
            error!("token acquisition failed: {e}");
            e
        })?;
        Ok(AccessToken(result.access_token))
    }

    async fn valve_status(&self) -> Result<bool, CloudError> {
        let token = self.fetch_access_token().await?;
        Ok(self.device_info(&token).await?.switch_state())
    }

    async fn set_valve(&self, open: bool, token: &AccessToken) -> Result<(), CloudError> {
        if self.device_id.is_empty() {
            return Err(CloudError::DeviceNotConfigured);
        }

        let path = format!("/v1.0/devices/{}/commands", self.device_id);
        let body = json!({ "commands": [{ "code": SWITCH_CODE, "value": open }] });
        // Sign the exact string that goes on the wire.
        let body_str = body.to_string();
        let t = now_millis();
        let headers = self
            .signer
            .headers("POST", &path, "", Some(&body_str), Some(token.as_str()), &t);

        let direction = if open { "ABRIR" } else { "CERRAR" };
        info!(command = direction, "sending valve command");

        let envelope: Envelope<serde_json::Value> = Self::apply_headers(
            self.http.post(format!("{}{path}", self.base_url)),
            &headers,
        )
        .header("Content-Type", "application/json")
        .body(body_str)
        .send()
        .await?
        .json()
        .await?;

        if envelope.success {
            info!(command = direction, "valve command acknowledged");
            Ok(())
        } else {
            let err = CloudError::Api {
                code: envelope.code,
                msg: envelope
                    .msg
                    .unwrap_or_else(|| "Internal Tuya error".to_string()),
            };
            error!(command = direction, "valve command rejected: {err}");
            Err(err)
        }
    }
}

// ===========================================================================
// Test mock
// ===========================================================================


// ===========================================================================
// Tests
// ===========================================================================
