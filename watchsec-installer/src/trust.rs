//! Device Trust Validation
//!
//! Authorization gate for the whole install. The backend classifies the
//! device; an untrusted device must present an operator PIN before the
//! install may start.
//!
//! ```text
//! Init -> Checking -> Trusted ----------------------------> Ready
//!                  -> PinRequired <-> Verifying -> Verified -> Ready
//!                  -> CheckFailed (terminal)
//! ```
//!
//! Every request is sent exactly once. There are no retries and no timeouts.

use crate::device::DeviceIdentity;
use serde::{Deserialize, Deserializer, Serialize};
use std::future::Future;
use watchsec_common::paths::backend::{VALIDATE_PATH, VERIFY_TOKEN_PATH};
use watchsec_common::{InstallError, Result};

/// Status value the backend uses for implicitly trusted devices
pub const TRUSTED_STATUS: &str = "Trusted";

/// Validation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustState {
    Init,
    Checking,
    Trusted,
    PinRequired,
    Verifying,
    Verified,
    /// The only state from which installation may proceed
    Ready,
    /// Backend unreachable or answered with an error; restart required
    CheckFailed,
}

/// Classification returned by the validation endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceTrust {
    Trusted,
    RemoteUntrusted,
}

/// Body of a successful validation response
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ValidateResponse {
    #[serde(rename = "Status", alias = "status", default, deserialize_with = "status_text")]
    pub status: Option<String>,
}

/// Keep textual statuses; any other JSON value counts as absent
fn status_text<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Status {
        Text(String),
        Other(serde::de::IgnoredAny),
    }

    Ok(match Option::<Status>::deserialize(deserializer)? {
        Some(Status::Text(text)) => Some(text),
        Some(Status::Other(_)) | None => None,
    })
}

impl ValidateResponse {
    pub fn classification(&self) -> DeviceTrust {
        match self.status.as_deref() {
            Some(TRUSTED_STATUS) => DeviceTrust::Trusted,
            _ => DeviceTrust::RemoteUntrusted,
        }
    }
}

#[derive(Debug, Serialize)]
struct VerifyTokenRequest<'a> {
    #[serde(rename = "Token")]
    token: &'a str,
}

/// Operator-entered installation code
#[derive(Clone, PartialEq, Eq)]
pub struct Pin(String);

impl Pin {
    pub const MAX_LEN: usize = 7;

    /// Trim and length-check an entered code
    pub fn new(raw: &str) -> Result<Self> {
        let code = raw.trim();
        let len = code.chars().count();
        if len == 0 || len > Self::MAX_LEN {
            return Err(InstallError::InvalidPin { max: Self::MAX_LEN });
        }
        Ok(Self(code.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for Pin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Pin(<redacted>)")
    }
}

/// Proof that the trust gate reached `Ready`.
///
/// Only [`TrustValidator::authorization`] can create one, and the install
/// phase consumes it.
#[derive(Debug)]
pub struct Authorization {
    _private: (),
}

/// Remote side of the trust protocol
pub trait TrustService: Send + Sync {
    /// `POST {backend}/api/install/validate`.
    ///
    /// Non-success status, transport failure and unreadable bodies all map to
    /// `NetworkUnavailable`.
    fn validate(
        &self,
        backend: &str,
        device: &DeviceIdentity,
    ) -> impl Future<Output = Result<ValidateResponse>> + Send;

    /// `POST {backend}/api/install/verify-token`; `Ok(true)` on HTTP success
    fn verify_token(&self, backend: &str, token: &str) -> impl Future<Output = Result<bool>> + Send;
}

/// reqwest-backed trust service
#[derive(Debug, Clone, Default)]
pub struct HttpTrustService {
    client: reqwest::Client,
}

impl HttpTrustService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn endpoint(backend: &str, path: &str) -> String {
        format!("{}{}", backend.trim_end_matches('/'), path)
    }
}

impl TrustService for HttpTrustService {
    async fn validate(&self, backend: &str, device: &DeviceIdentity) -> Result<ValidateResponse> {
        let url = Self::endpoint(backend, VALIDATE_PATH);
        tracing::info!("Validating device {} with {}", device.machine_name, url);

        let response = self
            .client
            .post(&url)
            .json(device)
            .send()
            .await
            .map_err(|e| InstallError::NetworkUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(InstallError::NetworkUnavailable(format!("server returned {}", status)));
        }

        // A `null` body carries no status and classifies like a missing one
        let body = response
            .json::<Option<ValidateResponse>>()
            .await
            .map_err(|e| InstallError::NetworkUnavailable(format!("unreadable response: {}", e)))?;
        Ok(body.unwrap_or_default())
    }

    async fn verify_token(&self, backend: &str, token: &str) -> Result<bool> {
        let url = Self::endpoint(backend, VERIFY_TOKEN_PATH);
        tracing::info!("Verifying installation PIN with {}", url);

        let response = self
            .client
            .post(&url)
            .json(&VerifyTokenRequest { token })
            .send()
            .await
            .map_err(|e| InstallError::NetworkUnavailable(e.to_string()))?;

        tracing::debug!("verify-token returned {}", response.status());
        Ok(response.status().is_success())
    }
}

/// Client-side trust state machine
pub struct TrustValidator<S> {
    service: S,
    state: TrustState,
    pin_verified: bool,
}

impl<S: TrustService> TrustValidator<S> {
    pub fn new(service: S) -> Self {
        Self {
            service,
            state: TrustState::Init,
            pin_verified: false,
        }
    }

    pub fn state(&self) -> TrustState {
        self.state
    }

    pub fn pin_verified(&self) -> bool {
        self.pin_verified
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    fn transition(&mut self, next: TrustState) {
        tracing::debug!("Trust state: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Classify the device. Only valid from `Init`.
    pub async fn check_device(&mut self, backend: &str, device: &DeviceIdentity) -> Result<DeviceTrust> {
        if self.state != TrustState::Init {
            return Err(InstallError::OutOfOrder("device check already performed"));
        }

        self.transition(TrustState::Checking);
        match self.service.validate(backend, device).await {
            Ok(response) => {
                let trust = response.classification();
                match trust {
                    DeviceTrust::Trusted => {
                        self.transition(TrustState::Trusted);
                        self.transition(TrustState::Ready);
                    }
                    DeviceTrust::RemoteUntrusted => {
                        tracing::info!(
                            "Device classified as {:?}; PIN required",
                            response.status.as_deref().unwrap_or("<none>")
                        );
                        self.transition(TrustState::PinRequired);
                    }
                }
                Ok(trust)
            }
            Err(err) => {
                tracing::error!("Device validation failed: {}", err);
                self.transition(TrustState::CheckFailed);
                Err(err)
            }
        }
    }

    /// Verify an operator PIN. Only valid from `PinRequired`.
    ///
    /// Rejection and transport failure both return to `PinRequired`.
    pub async fn verify_pin(&mut self, backend: &str, pin: &Pin) -> Result<()> {
        if self.state != TrustState::PinRequired {
            return Err(InstallError::OutOfOrder("no PIN is expected in this state"));
        }

        self.transition(TrustState::Verifying);
        match self.service.verify_token(backend, pin.as_str()).await {
            Ok(true) => {
                self.pin_verified = true;
                self.transition(TrustState::Verified);
                self.transition(TrustState::Ready);
                Ok(())
            }
            Ok(false) => {
                tracing::warn!("Installation PIN rejected");
                self.transition(TrustState::PinRequired);
                Err(InstallError::PinRejected)
            }
            Err(err) => {
                tracing::warn!("PIN verification failed: {}", err);
                self.transition(TrustState::PinRequired);
                Err(InstallError::PinRejected)
            }
        }
    }

    /// Proof of authorization, available only in `Ready`
    pub fn authorization(&self) -> Option<Authorization> {
        (self.state == TrustState::Ready).then_some(Authorization { _private: () })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{device, serve, ScriptedService};

    const BACKEND: &str = "http://svc";

    fn local_http() -> HttpTrustService {
        HttpTrustService::with_client(reqwest::Client::builder().no_proxy().build().unwrap())
    }

    #[tokio::test]
    async fn test_trusted_device_is_ready_without_pin() {
        let mut validator = TrustValidator::new(ScriptedService::status("Trusted"));

        let trust = validator.check_device(BACKEND, &device()).await.unwrap();

        assert_eq!(trust, DeviceTrust::Trusted);
        assert_eq!(validator.state(), TrustState::Ready);
        assert!(validator.authorization().is_some());
        assert!(!validator.pin_verified());
        assert_eq!(validator.service().calls(), vec!["validate http://svc WS-042"]);
    }

    #[tokio::test]
    async fn test_other_status_requires_pin() {
        for status in ["Remote", "Unknown", "trusted", ""] {
            let mut validator = TrustValidator::new(ScriptedService::status(status));

            let trust = validator.check_device(BACKEND, &device()).await.unwrap();

            assert_eq!(trust, DeviceTrust::RemoteUntrusted);
            assert_eq!(validator.state(), TrustState::PinRequired);
            assert!(validator.authorization().is_none());
        }
    }

    #[tokio::test]
    async fn test_missing_status_requires_pin() {
        let service = ScriptedService::default();
        service.push_validate(Ok(ValidateResponse::default()));
        let mut validator = TrustValidator::new(service);

        validator.check_device(BACKEND, &device()).await.unwrap();
        assert_eq!(validator.state(), TrustState::PinRequired);
    }

    #[tokio::test]
    async fn test_network_failure_is_terminal() {
        let service = ScriptedService::default();
        service.push_validate(Err(InstallError::NetworkUnavailable("connection refused".into())));
        let mut validator = TrustValidator::new(service);

        let result = validator.check_device(BACKEND, &device()).await;

        assert!(matches!(result, Err(InstallError::NetworkUnavailable(_))));
        assert_eq!(validator.state(), TrustState::CheckFailed);
        assert!(validator.authorization().is_none());

        // No PIN entry from a failed check, and no second attempt
        let pin = Pin::new("123456").unwrap();
        assert!(matches!(
            validator.verify_pin(BACKEND, &pin).await,
            Err(InstallError::OutOfOrder(_))
        ));
        assert!(matches!(
            validator.check_device(BACKEND, &device()).await,
            Err(InstallError::OutOfOrder(_))
        ));
        assert_eq!(validator.service().calls().len(), 1);
    }

    #[tokio::test]
    async fn test_accepted_pin_reaches_ready() {
        let service = ScriptedService::status("Remote");
        service.push_verify(Ok(true));
        let mut validator = TrustValidator::new(service);
        validator.check_device(BACKEND, &device()).await.unwrap();

        validator.verify_pin(BACKEND, &Pin::new("4821").unwrap()).await.unwrap();

        assert_eq!(validator.state(), TrustState::Ready);
        assert!(validator.pin_verified());
        assert!(validator.authorization().is_some());
        assert_eq!(validator.service().calls()[1], "verify http://svc 4821");
    }

    #[tokio::test]
    async fn test_rejected_pin_returns_to_pin_required() {
        let service = ScriptedService::status("Remote");
        service.push_verify(Ok(false));
        service.push_verify(Err(InstallError::NetworkUnavailable("reset".into())));
        service.push_verify(Ok(true));
        let mut validator = TrustValidator::new(service);
        validator.check_device(BACKEND, &device()).await.unwrap();

        let pin = Pin::new("000000").unwrap();
        assert!(matches!(validator.verify_pin(BACKEND, &pin).await, Err(InstallError::PinRejected)));
        assert_eq!(validator.state(), TrustState::PinRequired);

        // Transport failure is treated as a rejection
        assert!(matches!(validator.verify_pin(BACKEND, &pin).await, Err(InstallError::PinRejected)));
        assert_eq!(validator.state(), TrustState::PinRequired);

        validator.verify_pin(BACKEND, &pin).await.unwrap();
        assert_eq!(validator.state(), TrustState::Ready);
    }

    #[tokio::test]
    async fn test_trusted_device_does_not_accept_pin() {
        let mut validator = TrustValidator::new(ScriptedService::status("Trusted"));
        validator.check_device(BACKEND, &device()).await.unwrap();

        let result = validator.verify_pin(BACKEND, &Pin::new("1").unwrap()).await;
        assert!(matches!(result, Err(InstallError::OutOfOrder(_))));
        assert_eq!(validator.state(), TrustState::Ready);
    }

    #[test]
    fn test_pin_length_bounds() {
        assert!(Pin::new("1234567").is_ok());
        assert_eq!(Pin::new("  42 ").unwrap().as_str(), "42");
        assert!(matches!(Pin::new(""), Err(InstallError::InvalidPin { max: 7 })));
        assert!(matches!(Pin::new("   "), Err(InstallError::InvalidPin { .. })));
        assert!(matches!(Pin::new("12345678"), Err(InstallError::InvalidPin { .. })));
    }

    #[test]
    fn test_pin_debug_is_redacted() {
        assert_eq!(format!("{:?}", Pin::new("4821").unwrap()), "Pin(<redacted>)");
    }

    #[test]
    fn test_response_status_field_names() {
        let response: ValidateResponse = serde_json::from_str(r#"{"Status":"Trusted"}"#).unwrap();
        assert_eq!(response.classification(), DeviceTrust::Trusted);

        let response: ValidateResponse = serde_json::from_str(r#"{"status":"Trusted"}"#).unwrap();
        assert_eq!(response.classification(), DeviceTrust::Trusted);

        let response: ValidateResponse = serde_json::from_str(r#"{"Status":null}"#).unwrap();
        assert_eq!(response.classification(), DeviceTrust::RemoteUntrusted);
    }

    #[test]
    fn test_non_text_status_requires_pin() {
        for body in [r#"{"Status":5}"#, r#"{"Status":true}"#, r#"{"Status":{"Trusted":1}}"#] {
            let response: ValidateResponse = serde_json::from_str(body).unwrap();
            assert_eq!(response.status, None);
            assert_eq!(response.classification(), DeviceTrust::RemoteUntrusted);
        }
    }

    #[tokio::test]
    async fn test_http_validate_null_or_numeric_status_requires_pin() {
        let (base, server) = serve(vec![(200, "null"), (200, r#"{"Status":5}"#)]).await;
        let service = local_http();

        for _ in 0..2 {
            let mut validator = TrustValidator::new(service.clone());
            let trust = validator.check_device(&base, &device()).await.unwrap();
            assert_eq!(trust, DeviceTrust::RemoteUntrusted);
            assert_eq!(validator.state(), TrustState::PinRequired);
        }
        assert_eq!(server.await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_http_validate_posts_device_identity() {
        let (base, server) = serve(vec![(200, r#"{"Status":"Trusted"}"#)]).await;

        let response = local_http().validate(&base, &device()).await.unwrap();
        assert_eq!(response.classification(), DeviceTrust::Trusted);

        let requests = server.await.unwrap();
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].path, "/api/install/validate");
        let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(
            body,
            serde_json::json!({"MachineName": "WS-042", "Domain": "CORP", "IP": "127.0.0.1"})
        );
    }

    #[tokio::test]
    async fn test_http_validate_error_status_is_unavailable() {
        let (base, server) = serve(vec![(500, "{}")]).await;

        let result = local_http().validate(&base, &device()).await;
        assert!(matches!(result, Err(InstallError::NetworkUnavailable(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_http_validate_unreadable_body_is_unavailable() {
        let (base, server) = serve(vec![(200, "not json")]).await;

        let result = local_http().validate(&base, &device()).await;
        assert!(matches!(result, Err(InstallError::NetworkUnavailable(_))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_http_verify_token() {
        let (base, server) = serve(vec![(200, "{}"), (401, "{}")]).await;
        let service = local_http();

        assert!(service.verify_token(&base, "4821").await.unwrap());
        assert!(!service.verify_token(&base, "000000").await.unwrap());

        let requests = server.await.unwrap();
        assert_eq!(requests[0].path, "/api/install/verify-token");
        let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(body, serde_json::json!({"Token": "4821"}));
    }

    #[tokio::test]
    async fn test_http_unreachable_backend() {
        // Bind then drop to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let result = local_http().validate(&base, &device()).await;
        assert!(matches!(result, Err(InstallError::NetworkUnavailable(_))));
    }

    #[test]
    fn test_endpoint_join() {
        assert_eq!(
            HttpTrustService::endpoint("http://svc/", VALIDATE_PATH),
            "http://svc/api/install/validate"
        );
        assert_eq!(
            HttpTrustService::endpoint("http://svc", VERIFY_TOKEN_PATH),
            "http://svc/api/install/verify-token"
        );
    }
}
