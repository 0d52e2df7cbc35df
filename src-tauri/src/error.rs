use thiserror::Error;

#[derive(Debug, Error)]
pub enum BirdyError {
    #[error("Microphone access was denied")]
    PermissionDenied,

    #[error("Please clear the current audio before recording or choosing another file.")]
    AssetAlreadyStaged,

    #[error("A recording is already in progress")]
    RecordingInProgress,

    #[error("No recording in progress")]
    NoActiveRecording,

    #[error("A file dialog is already open")]
    SelectionInProgress,

    #[error("Could not acquire audio: {0}")]
    Acquisition(String),

    #[error("No audio uploaded. Record or choose a file first.")]
    NoAudio,

    #[error("An upload is already in progress")]
    UploadInFlight,

    #[error("Playback failed: {0}")]
    Playback(String),

    #[error("Could not open link: {0}")]
    Opener(String),

    #[error("Invalid settings: {0}")]
    Settings(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, BirdyError>;
