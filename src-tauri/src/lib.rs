pub mod asset;
pub mod decode;
pub mod error;
pub mod permission;
pub mod phase;
pub mod picker;
pub mod playback;
pub mod presenter;
pub mod recorder;
pub mod session;
pub mod settings;
pub mod staging;
pub mod upload;

#[cfg(feature = "desktop")]
mod commands;

#[cfg(feature = "desktop")]
use tauri::Manager;

#[cfg(feature = "desktop")]
fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("birdy_lib=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

#[cfg(feature = "desktop")]
#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    init_tracing();

    tauri::Builder::default()
        .plugin(tauri_plugin_opener::init())
        .plugin(tauri_plugin_dialog::init())
        .setup(|app| {
            let state = commands::AppState::build(app.handle())?;
            app.manage(state);
            Ok(())
        })
        .invoke_handler(tauri::generate_handler![
            commands::get_session,
            commands::start_recording,
            commands::stop_recording,
            commands::pick_audio_file,
            commands::clear_audio,
            commands::toggle_playback,
            commands::submit_audio,
            commands::open_more_info,
            commands::get_settings,
            commands::set_endpoint,
            commands::set_request_timeout
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}
