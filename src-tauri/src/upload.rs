//! Single-flight upload of the staged clip to the classification endpoint.
//!
//! [`UploadCoordinator`] is the only writer of [`UploadState`]. A submit takes
//! an [`UploadTicket`] with [`UploadCoordinator::begin`], performs the request
//! without holding any lock, and lands the outcome with
//! [`UploadCoordinator::complete`]. Tickets carry an epoch so an outcome that
//! arrives after the asset was cleared is dropped.

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::asset::AudioAsset;
use crate::error::{BirdyError, Result};
use crate::settings::Settings;

pub const AUDIO_FIELD: &str = "audio_file";
pub const SERVER_ERROR_MESSAGE: &str = "Server error during upload";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BirdDetails {
    #[serde(rename = "ScientificName", default, skip_serializing_if = "Option::is_none")]
    pub scientific_name: Option<String>,
    #[serde(rename = "MoreInfo", default, skip_serializing_if = "Option::is_none")]
    pub more_info: Option<String>,
    #[serde(rename = "ImageURL", default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub class_name: String,
    pub probabilities: Vec<f64>,
    #[serde(default)]
    pub bird_details: BirdDetails,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Non-2xx status.
    Server,
    /// No response at all.
    Transport,
    /// 2xx with a body that is not a classification.
    MalformedResponse,
    /// The staged file could not be read.
    Unreadable,
    /// The submitting task went away before the request resolved.
    Abandoned,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl UploadFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum UploadState {
    #[default]
    Idle,
    InFlight,
    Succeeded(ClassificationResult),
    Failed(UploadFailure),
}

impl UploadState {
    pub fn is_in_flight(&self) -> bool {
        matches!(self, UploadState::InFlight)
    }

    pub fn result(&self) -> Option<&ClassificationResult> {
        match self {
            UploadState::Succeeded(result) => Some(result),
            _ => None,
        }
    }
}

/// What a submit needs from the asset, captured while the session is locked.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadPlan {
    pub path: PathBuf,
    pub file_name: String,
    pub mime_type: &'static str,
}

#[derive(Debug)]
pub struct UploadTicket {
    epoch: u64,
}

#[derive(Debug, Default)]
pub struct UploadCoordinator {
    state: UploadState,
    epoch: u64,
    /// Epoch of the request still on the wire. Survives `reset`, so a cleared
    /// asset cannot open a second request next to it.
    pending: Option<u64>,
}

impl UploadCoordinator {
    pub fn state(&self) -> &UploadState {
        &self.state
    }

    pub fn begin(&mut self, asset: Option<&AudioAsset>) -> Result<(UploadTicket, UploadPlan)> {
        let asset = asset.ok_or(BirdyError::NoAudio)?;
        if self.state.is_in_flight() || self.pending.is_some() {
            return Err(BirdyError::UploadInFlight);
        }

        self.state = UploadState::InFlight;
        self.pending = Some(self.epoch);
        let plan = UploadPlan {
            path: asset.path.clone(),
            file_name: asset.upload_file_name().to_string(),
            mime_type: asset.mime_type(),
        };
        Ok((UploadTicket { epoch: self.epoch }, plan))
    }

    /// Lands an outcome. Returns false if the ticket is stale.
    pub fn complete(
        &mut self,
        ticket: &UploadTicket,
        outcome: std::result::Result<ClassificationResult, UploadFailure>,
    ) -> bool {
        if self.pending == Some(ticket.epoch) {
            self.pending = None;
        }

        if ticket.epoch != self.epoch {
            info!("Discarding upload outcome for a cleared asset");
            return false;
        }

        self.state = match outcome {
            Ok(result) => UploadState::Succeeded(result),
            Err(failure) => UploadState::Failed(failure),
        };
        true
    }

    /// True while a request is outstanding, including one whose outcome will
    /// be discarded.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    pub fn reset(&mut self) {
        self.epoch = self.epoch.wrapping_add(1);
        self.state = UploadState::Idle;
    }
}

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file_name: String,
    pub mime_type: &'static str,
    pub bytes: Vec<u8>,
}

/// Status and, for 2xx only, the body.
#[derive(Debug, Clone, PartialEq)]
pub struct RawReply {
    pub status: u16,
    pub body: Vec<u8>,
}

#[async_trait]
pub trait ClassificationTransport: Send + Sync {
    /// `Err` carries the transport's own error text.
    async fn send(&self, request: UploadRequest) -> std::result::Result<RawReply, String>;
}

pub fn interpret(reply: RawReply) -> std::result::Result<ClassificationResult, UploadFailure> {
    if !(200..300).contains(&reply.status) {
        return Err(UploadFailure::new(FailureKind::Server, SERVER_ERROR_MESSAGE));
    }

    serde_json::from_slice(&reply.body).map_err(|e| {
        UploadFailure::new(
            FailureKind::MalformedResponse,
            format!("{}: unreadable response ({})", SERVER_ERROR_MESSAGE, e),
        )
    })
}

pub async fn run_upload(
    transport: &dyn ClassificationTransport,
    plan: UploadPlan,
) -> std::result::Result<ClassificationResult, UploadFailure> {
    let bytes = tokio::fs::read(&plan.path).await.map_err(|e| {
        UploadFailure::new(
            FailureKind::Unreadable,
            format!("Failed to read {}: {}", plan.path.display(), e),
        )
    })?;

    info!(
        file_name = %plan.file_name,
        mime_type = plan.mime_type,
        bytes = bytes.len(),
        "Uploading clip for classification"
    );

    let reply = transport
        .send(UploadRequest {
            file_name: plan.file_name,
            mime_type: plan.mime_type,
            bytes,
        })
        .await
        .map_err(|message| UploadFailure::new(FailureKind::Transport, message))?;

    let outcome = interpret(reply);
    match &outcome {
        Ok(result) => info!(class_name = %result.class_name, "Classification received"),
        Err(failure) => warn!(kind = ?failure.kind, "Upload failed: {}", failure.message),
    }
    outcome
}

pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(settings: &Settings) -> Result<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(timeout) = settings.request_timeout() {
            builder = builder.timeout(timeout);
        }

        let client = builder
            .build()
            .map_err(|e| BirdyError::Settings(format!("Failed to initialize HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: settings.endpoint.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ClassificationTransport for HttpTransport {
    async fn send(&self, request: UploadRequest) -> std::result::Result<RawReply, String> {
        let part = Part::bytes(request.bytes)
            .file_name(request.file_name)
            .mime_str(request.mime_type)
            .map_err(|e| e.to_string())?;
        let form = Form::new().part(AUDIO_FIELD, part);

        let response = self
            .client
            .post(&self.endpoint)
            .header(ACCEPT, "application/json")
            .multipart(form)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        let status = response.status();
        if !status.is_success() {
            return Ok(RawReply {
                status: status.as_u16(),
                body: Vec::new(),
            });
        }

        let body = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(RawReply {
            status: status.as_u16(),
            body: body.to_vec(),
        })
    }
}
