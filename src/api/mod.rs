//! Gate backend API client.
//!
//! Endpoints, relative to the configured base URL:
//! - `GET /license-plates` -> `{"data":[{"text":"AB1234C", ...}]}`
//! - `GET /gates/{id}/status` -> `{"data":{"isOpen":true}}`
//! - `GET /gates/{id}/toggle`
//! - `POST /license-plate`, multipart field `file` holding a JPEG
//!
//! Every call returns an explicit `ApiError` so callers decide between
//! fail-closed, log-and-continue, or surfacing the failure.

use rand::RngCore;
use serde::Deserialize;
use std::fmt;
use std::io::Read;
use std::time::Duration;

use crate::plate::PlateText;

const MAX_RESPONSE_BYTES: u64 = 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// Connection, DNS, or timeout failure.
    Transport,
    /// Non-success HTTP status.
    Status(u16),
    /// Response body did not have the expected shape.
    Decode,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ApiErrorKind::Transport => write!(f, "api transport error: {}", self.message),
            ApiErrorKind::Status(code) => write!(f, "api returned {}: {}", code, self.message),
            ApiErrorKind::Decode => write!(f, "api response invalid: {}", self.message),
        }
    }
}

impl std::error::Error for ApiError {}

impl From<ureq::Error> for ApiError {
    fn from(err: ureq::Error) -> Self {
        match err {
            ureq::Error::Status(code, response) => {
                ApiError::new(ApiErrorKind::Status(code), response.status_text().to_string())
            }
            ureq::Error::Transport(transport) => {
                ApiError::new(ApiErrorKind::Transport, transport.to_string())
            }
        }
    }
}

/// Boundary to the gate backend. Implemented over HTTP in production and by
/// in-memory fakes in tests.
pub trait GateApi: Send + Sync {
    /// Whitelisted plates.
    fn whitelist(&self) -> Result<Vec<PlateText>, ApiError>;

    /// Whether gate `gate_id` is open.
    fn gate_status(&self, gate_id: &str) -> Result<bool, ApiError>;

    /// Flip gate `gate_id`.
    fn toggle_gate(&self, gate_id: &str) -> Result<(), ApiError>;

    /// Upload a JPEG plate snapshot. Returns the HTTP status.
    fn upload_plate_snapshot(&self, jpeg: &[u8]) -> Result<u16, ApiError>;
}

/// Fail-closed whitelist membership: any API error means "not whitelisted".
pub fn is_whitelisted(api: &dyn GateApi, plate: &PlateText) -> bool {
    match api.whitelist() {
        Ok(plates) => {
            let listed = plates.iter().any(|p| p == plate);
            if listed {
                log::info!("Whitelist: {} is whitelisted", plate);
            } else {
                log::warn!("Whitelist: {} is NOT whitelisted", plate);
            }
            listed
        }
        Err(err) => {
            log::error!("Whitelist: check for {} failed, denying: {}", plate, err);
            false
        }
    }
}

// ---- wire format ----

#[derive(Deserialize)]
struct Envelope<T> {
    data: T,
}

#[derive(Deserialize)]
struct PlateRecord {
    text: String,
}

#[derive(Deserialize)]
struct GateStatusRecord {
    #[serde(rename = "isOpen")]
    is_open: bool,
}

pub(crate) fn decode_whitelist(body: &[u8]) -> Result<Vec<PlateText>, ApiError> {
    let envelope: Envelope<Vec<PlateRecord>> = serde_json::from_slice(body)
        .map_err(|e| ApiError::new(ApiErrorKind::Decode, format!("license plates: {}", e)))?;
    Ok(envelope
        .data
        .into_iter()
        .filter_map(|record| PlateText::normalize(&record.text))
        .collect())
}

pub(crate) fn decode_gate_status(body: &[u8]) -> Result<bool, ApiError> {
    let envelope: Envelope<GateStatusRecord> = serde_json::from_slice(body)
        .map_err(|e| ApiError::new(ApiErrorKind::Decode, format!("gate status: {}", e)))?;
    Ok(envelope.data.is_open)
}

/// Multipart form body with a single file part. Returns `(content_type, body)`.
pub(crate) fn multipart_file(
    boundary: &str,
    field: &str,
    filename: &str,
    content_type: &str,
    bytes: &[u8],
) -> (String, Vec<u8>) {
    let mut body = Vec::with_capacity(bytes.len() + 256);
    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(
        format!(
            "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
            field, filename
        )
        .as_bytes(),
    );
    body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", content_type).as_bytes());
    body.extend_from_slice(bytes);
    body.extend_from_slice(format!("\r\n--{}--\r\n", boundary).as_bytes());
    (
        format!("multipart/form-data; boundary={}", boundary),
        body,
    )
}

fn random_boundary() -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    let suffix: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("gate-sentry-{}", suffix)
}

// ---- HTTP client ----

#[derive(Clone)]
pub struct HttpGateApi {
    agent: ureq::Agent,
    base_url: String,
}

impl HttpGateApi {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn get_body(&self, path: &str) -> Result<Vec<u8>, ApiError> {
        let response = self.agent.get(&self.url(path)).call()?;
        read_body(response)
    }
}

fn read_body(response: ureq::Response) -> Result<Vec<u8>, ApiError> {
    let mut body = Vec::new();
    response
        .into_reader()
        .take(MAX_RESPONSE_BYTES)
        .read_to_end(&mut body)
        .map_err(|e| ApiError::new(ApiErrorKind::Transport, format!("read body: {}", e)))?;
    Ok(body)
}

impl GateApi for HttpGateApi {
    fn whitelist(&self) -> Result<Vec<PlateText>, ApiError> {
        decode_whitelist(&self.get_body("/license-plates")?)
    }

    fn gate_status(&self, gate_id: &str) -> Result<bool, ApiError> {
        let body = self.get_body(&format!("/gates/{}/status", gate_id))?;
        log::debug!(
            "HttpGateApi: status for {}: {}",
            gate_id,
            String::from_utf8_lossy(&body)
        );
        decode_gate_status(&body)
    }

    fn toggle_gate(&self, gate_id: &str) -> Result<(), ApiError> {
        self.get_body(&format!("/gates/{}/toggle", gate_id))?;
        Ok(())
    }

    fn upload_plate_snapshot(&self, jpeg: &[u8]) -> Result<u16, ApiError> {
        let (content_type, body) =
            multipart_file(&random_boundary(), "file", "plate.jpg", "image/jpeg", jpeg);
        let response = self
            .agent
            .post(&self.url("/license-plate"))
            .set("Content-Type", &content_type)
            .send_bytes(&body)?;
        Ok(response.status())
    }
}
