//! Persisted client settings: where the classifier lives and how long to wait for it.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{BirdyError, Result};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:8000/api/upload/";

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Settings {
    pub endpoint: String,
    /// `None` waits for the server indefinitely.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            request_timeout_secs: None,
        }
    }
}

impl Settings {
    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}

pub fn validate_endpoint(endpoint: &str) -> Result<String> {
    let trimmed = endpoint.trim();
    if trimmed.is_empty() {
        return Err(BirdyError::Settings("Endpoint cannot be empty.".to_string()));
    }

    let url = reqwest::Url::parse(trimmed)
        .map_err(|e| BirdyError::Settings(format!("Endpoint '{}' is not a URL: {}", trimmed, e)))?;

    match url.scheme() {
        "http" | "https" => Ok(url.to_string()),
        other => Err(BirdyError::Settings(format!(
            "Endpoint must use http or https, got '{}'",
            other
        ))),
    }
}

fn sanitize(mut settings: Settings) -> Settings {
    settings.endpoint =
        validate_endpoint(&settings.endpoint).unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
    settings.request_timeout_secs = settings.request_timeout_secs.filter(|secs| *secs > 0);
    settings
}

pub fn load_settings(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Ok(Settings::default());
    }

    let raw = fs::read_to_string(path)?;
    let settings: Settings = serde_json::from_str(&raw)?;
    Ok(sanitize(settings))
}

pub fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }

    let serialized = serde_json::to_string_pretty(settings)?;
    fs::write(path, serialized)?;
    tracing::debug!(path = %path.display(), "Settings saved");
    Ok(())
}
