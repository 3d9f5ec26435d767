//! Test doubles shared by the installer's unit tests

use crate::device::{DeviceIdentity, PLACEHOLDER_IP};
use crate::elevation::Elevator;
use crate::trust::{TrustService, ValidateResponse};
use crate::ui::{Presenter, Severity};
use axum::extract::State;
use axum::http::{header, HeaderName, Method, StatusCode, Uri};
use axum::Router;
use std::collections::VecDeque;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use watchsec_common::payload::append_trailer;
use watchsec_common::secrets::SecretStore;
use watchsec_common::{InstallError, Result};
use zip::write::SimpleFileOptions;

pub fn device() -> DeviceIdentity {
    DeviceIdentity {
        machine_name: "WS-042".to_string(),
        domain: "CORP".to_string(),
        ip: PLACEHOLDER_IP.to_string(),
    }
}

/// Trust service answering from queued responses
#[derive(Default)]
pub struct ScriptedService {
    pub validate: Mutex<VecDeque<Result<ValidateResponse>>>,
    pub verify: Mutex<VecDeque<Result<bool>>>,
    pub calls: Mutex<Vec<String>>,
}

impl ScriptedService {
    /// Service whose validation answers with `status`
    pub fn status(status: &str) -> Self {
        let service = Self::default();
        service.push_validate(Ok(ValidateResponse {
            status: Some(status.to_string()),
        }));
        service
    }

    pub fn push_validate(&self, response: Result<ValidateResponse>) {
        self.validate.lock().unwrap().push_back(response);
    }

    pub fn push_verify(&self, response: Result<bool>) {
        self.verify.lock().unwrap().push_back(response);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl TrustService for ScriptedService {
    async fn validate(&self, backend: &str, device: &DeviceIdentity) -> Result<ValidateResponse> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("validate {} {}", backend, device.machine_name));
        self.validate
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(InstallError::NetworkUnavailable("unscripted".into())))
    }

    async fn verify_token(&self, backend: &str, token: &str) -> Result<bool> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("verify {} {}", backend, token));
        self.verify
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(InstallError::NetworkUnavailable("unscripted".into())))
    }
}

/// Elevator that records launches instead of running anything
pub struct RecordingElevator {
    exit_code: i32,
    launches: Mutex<Vec<PathBuf>>,
}

impl RecordingElevator {
    pub fn exiting_with(exit_code: i32) -> Self {
        Self {
            exit_code,
            launches: Mutex::new(Vec::new()),
        }
    }

    pub fn launches(&self) -> Vec<PathBuf> {
        self.launches.lock().unwrap().clone()
    }
}

impl Elevator for RecordingElevator {
    async fn run_elevated(&self, script: &Path) -> Result<i32> {
        self.launches.lock().unwrap().push(script.to_path_buf());
        Ok(self.exit_code)
    }
}

/// Secret store that refuses every write
pub struct FailingSecretStore;

impl SecretStore for FailingSecretStore {
    fn upsert(&self, _name: &str, _value: &str) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "access denied",
        ))
    }

    fn read(&self, _name: &str) -> std::io::Result<Option<String>> {
        Ok(None)
    }

    fn location(&self) -> String {
        "read-only store".to_string()
    }
}

pub fn build_zip(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
    let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
    for (name, data) in entries {
        writer.start_file(*name, options).unwrap();
        writer.write_all(data).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// Write a packaged installer image (stub, zip payload, trailer) into `dir`
pub fn build_image(dir: &Path, entries: &[(&str, &[u8])]) -> PathBuf {
    let stub = b"#!stub installer executable\n".repeat(8);
    let mut image = stub.clone();
    image.extend_from_slice(&build_zip(entries));
    append_trailer(&mut image, stub.len() as i64).unwrap();

    let path = dir.join("WatchSecInstaller.bin");
    std::fs::write(&path, image).unwrap();
    path
}

/// Write an unpackaged image (trailer value 0) into `dir`
pub fn build_dev_image(dir: &Path) -> PathBuf {
    let mut image = b"#!stub installer executable\n".to_vec();
    append_trailer(&mut image, 0).unwrap();

    let path = dir.join("WatchSecInstaller.bin");
    std::fs::write(&path, image).unwrap();
    path
}

/// One request seen by [`serve`]
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub body: String,
}

struct Backend {
    responses: Mutex<VecDeque<(u16, &'static str)>>,
    seen: mpsc::UnboundedSender<RecordedRequest>,
}

async fn answer(
    State(backend): State<Arc<Backend>>,
    method: Method,
    uri: Uri,
    body: String,
) -> (StatusCode, [(HeaderName, &'static str); 1], &'static str) {
    let _ = backend.seen.send(RecordedRequest {
        method: method.to_string(),
        path: uri.path().to_string(),
        body,
    });
    let (status, body) = backend
        .responses
        .lock()
        .unwrap()
        .pop_front()
        .expect("more requests than scripted responses");
    (
        StatusCode::from_u16(status).unwrap(),
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
}

/// Scripted backend on an ephemeral port.
///
/// Answers each request with the next entry of `responses`. The handle
/// resolves to the requests seen once every response has been used.
pub async fn serve(
    responses: Vec<(u16, &'static str)>,
) -> (String, JoinHandle<Vec<RecordedRequest>>) {
    let expected = responses.len();
    let (seen, mut requests) = mpsc::unbounded_channel();
    let backend = Arc::new(Backend {
        responses: Mutex::new(responses.into()),
        seen,
    });
    let app = Router::new().fallback(answer).with_state(backend);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    let server = tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let handle = tokio::spawn(async move {
        let mut recorded = Vec::with_capacity(expected);
        while recorded.len() < expected {
            match requests.recv().await {
                Some(request) => recorded.push(request),
                None => break,
            }
        }
        server.abort();
        recorded
    });

    (base, handle)
}

/// Presenter that renders every call as one line of text
#[derive(Default)]
pub struct RecordingPresenter {
    pub lines: Vec<String>,
}

impl Presenter for RecordingPresenter {
    fn set_status(&mut self, text: &str, severity: Severity) {
        self.lines.push(format!("status {:?} {}", severity, text));
    }

    fn set_progress(&mut self, percent: u8) {
        self.lines.push(format!("progress {}", percent));
    }

    fn show_pin_input(&mut self, visible: bool) {
        self.lines.push(format!("pin {}", visible));
    }

    fn set_primary_action(&mut self, label: &str, enabled: bool) {
        self.lines.push(format!("action {} {}", label, enabled));
    }

    fn prompt_blocking(&mut self, message: &str) {
        self.lines.push(format!("notice {}", message));
    }
}
