use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tauri::{AppHandle, Emitter, Manager, Runtime, State};
use tracing::{info, warn};

use crate::error::BirdyError;
use crate::permission::CpalMicrophone;
use crate::picker::DialogPicker;
use crate::playback::CpalPlayer;
use crate::presenter::{open_more_info as open_link, TauriOpener};
use crate::recorder::CpalRecorder;
use crate::session::{Devices, Session, SessionSnapshot};
use crate::settings::{load_settings, save_settings, validate_endpoint, Settings};
use crate::staging::Staging;
use crate::upload::HttpTransport;

pub const SESSION_CHANGED_EVENT: &str = "session-changed";

pub struct AppState {
    session: Arc<Session>,
    settings_path: PathBuf,
    settings: Mutex<Settings>,
}

fn app_data_dir<R: Runtime>(app: &AppHandle<R>) -> Result<PathBuf, String> {
    app.path()
        .app_data_dir()
        .map_err(|e| format!("Failed to resolve app data directory: {}", e))
}

fn emit_snapshot<R: Runtime>(app: &AppHandle<R>, snapshot: &SessionSnapshot) {
    if let Err(e) = app.emit(SESSION_CHANGED_EVENT, snapshot) {
        warn!("Failed to emit {}: {}", SESSION_CHANGED_EVENT, e);
    }
}

impl AppState {
    pub fn build<R: Runtime>(app: &AppHandle<R>) -> Result<Self, String> {
        let data_dir = app_data_dir(app)?;
        let settings_path = data_dir.join("settings.json");
        let settings = load_settings(&settings_path).unwrap_or_else(|e| {
            warn!("Ignoring unreadable settings ({}): {}", settings_path.display(), e);
            Settings::default()
        });
        let transport = HttpTransport::new(&settings).map_err(|e| e.to_string())?;
        info!(endpoint = transport.endpoint(), "Classifier endpoint configured");

        let staging = Staging::new(data_dir.join("staging"));
        let devices = Devices {
            microphone: Arc::new(CpalMicrophone),
            recorder: Arc::new(CpalRecorder),
            picker: Arc::new(DialogPicker::new(app.clone())),
            player: Arc::new(CpalPlayer),
            transport: Arc::new(transport),
        };

        // The player thread calls this; the snapshot is taken on the async
        // runtime so the thread never waits on the session lock.
        let handle = app.clone();
        let session = Session::new(devices, staging).with_playback_observer(Arc::new(move || {
            let handle = handle.clone();
            tauri::async_runtime::spawn(async move {
                if let Some(state) = handle.try_state::<AppState>() {
                    let snapshot = state.session.snapshot();
                    emit_snapshot(&handle, &snapshot);
                }
            });
        }));
        info!(staging = %session.staging().dir().display(), "Session ready");

        Ok(Self {
            session: Arc::new(session),
            settings_path,
            settings: Mutex::new(settings),
        })
    }

    fn settings(&self) -> Settings {
        self.settings
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    fn apply_settings(&self, settings: Settings) -> Result<Settings, String> {
        let transport = HttpTransport::new(&settings).map_err(|e| e.to_string())?;
        save_settings(&self.settings_path, &settings).map_err(|e| {
            format!(
                "Failed to save settings ({}): {}",
                self.settings_path.display(),
                e
            )
        })?;

        self.session.set_transport(Arc::new(transport));
        match self.settings.lock() {
            Ok(mut slot) => *slot = settings.clone(),
            Err(poisoned) => *poisoned.into_inner() = settings.clone(),
        }
        info!(endpoint = %settings.endpoint, timeout = ?settings.request_timeout_secs, "Settings updated");
        Ok(settings)
    }
}

#[tauri::command]
pub fn get_session(state: State<'_, AppState>) -> SessionSnapshot {
    state.session.snapshot()
}

#[tauri::command]
pub async fn start_recording(state: State<'_, AppState>) -> Result<SessionSnapshot, String> {
    match state.session.start_recording().await {
        Ok(()) | Err(BirdyError::PermissionDenied) => Ok(state.session.snapshot()),
        Err(e) => Err(e.to_string()),
    }
}

#[tauri::command]
pub async fn stop_recording(state: State<'_, AppState>) -> Result<SessionSnapshot, String> {
    state.session.stop_recording().await.map_err(|e| e.to_string())?;
    Ok(state.session.snapshot())
}

#[tauri::command]
pub async fn pick_audio_file(state: State<'_, AppState>) -> Result<SessionSnapshot, String> {
    state.session.pick_file().await.map_err(|e| e.to_string())?;
    Ok(state.session.snapshot())
}

/// Clearing joins the playback thread and deletes the staged file, so it runs
/// on the blocking pool.
#[tauri::command]
pub async fn clear_audio(state: State<'_, AppState>) -> Result<SessionSnapshot, String> {
    let session = state.session.clone();
    tauri::async_runtime::spawn_blocking(move || session.clear())
        .await
        .map_err(|e| format!("Failed to clear audio: {}", e))?;
    Ok(state.session.snapshot())
}

#[tauri::command]
pub async fn toggle_playback(state: State<'_, AppState>) -> Result<SessionSnapshot, String> {
    state.session.toggle_playback().await.map_err(|e| e.to_string())?;
    Ok(state.session.snapshot())
}

#[tauri::command]
pub async fn submit_audio(
    app: AppHandle,
    state: State<'_, AppState>,
) -> Result<SessionSnapshot, String> {
    state.session.submit().await.map_err(|e| e.to_string())?;
    let snapshot = state.session.snapshot();
    emit_snapshot(&app, &snapshot);
    Ok(snapshot)
}

#[tauri::command]
pub fn open_more_info(app: AppHandle, state: State<'_, AppState>) -> Result<bool, String> {
    let Some(view) = state.session.snapshot().result else {
        return Ok(false);
    };
    open_link(&view, &TauriOpener::new(app)).map_err(|e| e.to_string())
}

#[tauri::command]
pub fn get_settings(state: State<'_, AppState>) -> Settings {
    state.settings()
}

#[tauri::command]
pub fn set_endpoint(state: State<'_, AppState>, endpoint: String) -> Result<Settings, String> {
    let endpoint = validate_endpoint(&endpoint).map_err(|e| e.to_string())?;
    let mut settings = state.settings();
    settings.endpoint = endpoint;
    state.apply_settings(settings)
}

#[tauri::command]
pub fn set_request_timeout(
    state: State<'_, AppState>,
    seconds: Option<u64>,
) -> Result<Settings, String> {
    let mut settings = state.settings();
    settings.request_timeout_secs = seconds.filter(|secs| *secs > 0);
    state.apply_settings(settings)
}
