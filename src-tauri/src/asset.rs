use serde::Serialize;
use std::path::{Path, PathBuf};

const RECORDED_FALLBACK_NAME: &str = "bird_song.wav";
const PICKED_FALLBACK_STEM: &str = "audio";
const PICKED_FALLBACK_EXTENSION: &str = "mp3";
const FALLBACK_MIME: &str = "audio/mpeg";

/// Extensions the picker offers, with the MIME type each uploads as.
const AUDIO_TYPES: [(&str, &str); 9] = [
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("wave", "audio/wav"),
    ("m4a", "audio/mp4"),
    ("mp4", "audio/mp4"),
    ("aac", "audio/aac"),
    ("ogg", "audio/ogg"),
    ("oga", "audio/ogg"),
    ("flac", "audio/flac"),
];

pub fn audio_extensions() -> Vec<&'static str> {
    AUDIO_TYPES.iter().map(|(ext, _)| *ext).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Recorded,
    Picked,
}

/// The one clip the user has staged for playback and upload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioAsset {
    pub path: PathBuf,
    pub display_name: String,
    pub duration_label: Option<String>,
    pub source: SourceKind,
}

impl AudioAsset {
    pub fn recorded(path: PathBuf, duration_ms: u64) -> Self {
        Self {
            path,
            display_name: RECORDED_FALLBACK_NAME.to_string(),
            duration_label: Some(format_duration_label(duration_ms)),
            source: SourceKind::Recorded,
        }
    }

    pub fn picked(path: PathBuf, display_name: &str, duration_ms: Option<u64>) -> Self {
        let display_name = match display_name.trim() {
            "" => fallback_picked_name(&path),
            name => name.to_string(),
        };

        Self {
            path,
            display_name,
            duration_label: duration_ms.map(format_duration_label),
            source: SourceKind::Picked,
        }
    }

    /// Name sent as the multipart filename.
    pub fn upload_file_name(&self) -> &str {
        match self.source {
            SourceKind::Recorded => RECORDED_FALLBACK_NAME,
            SourceKind::Picked => &self.display_name,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self.source {
            SourceKind::Recorded => "audio/wav",
            SourceKind::Picked => mime_for_path(&self.path)
                .or_else(|| mime_for_path(Path::new(&self.display_name)))
                .unwrap_or(FALLBACK_MIME),
        }
    }
}

fn audio_type(path: &Path) -> Option<(&'static str, &'static str)> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    AUDIO_TYPES.iter().copied().find(|(known, _)| *known == ext)
}

fn mime_for_path(path: &Path) -> Option<&'static str> {
    audio_type(path).map(|(_, mime)| mime)
}

/// Keeps the fallback name's extension in step with the staged file so the
/// multipart filename and MIME type agree.
fn fallback_picked_name(path: &Path) -> String {
    let ext = audio_type(path)
        .map(|(ext, _)| ext)
        .unwrap_or(PICKED_FALLBACK_EXTENSION);
    format!("{}.{}", PICKED_FALLBACK_STEM, ext)
}

/// `m:ss` with whole minutes floored and the remainder rounded to seconds.
pub fn format_duration_label(duration_ms: u64) -> String {
    let minutes = duration_ms / 60_000;
    let remainder_ms = duration_ms % 60_000;
    let seconds = ((remainder_ms + 500) / 1000).min(59);
    format!("{}:{:02}", minutes, seconds)
}
