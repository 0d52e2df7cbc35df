use async_trait::async_trait;
use std::path::PathBuf;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct PickedFile {
    pub path: PathBuf,
    pub name: String,
}

/// `Ok(None)` means the user cancelled.
#[async_trait]
pub trait FilePicker: Send + Sync {
    async fn pick_audio(&self) -> Result<Option<PickedFile>>;
}

#[cfg(feature = "desktop")]
pub use dialog::DialogPicker;

#[cfg(feature = "desktop")]
mod dialog {
    use async_trait::async_trait;
    use tauri::{AppHandle, Runtime};
    use tauri_plugin_dialog::DialogExt;
    use tokio::sync::oneshot;

    use super::{FilePicker, PickedFile};
    use crate::asset::audio_extensions;
    use crate::error::{BirdyError, Result};

    pub struct DialogPicker<R: Runtime> {
        app: AppHandle<R>,
    }

    impl<R: Runtime> DialogPicker<R> {
        pub fn new(app: AppHandle<R>) -> Self {
            Self { app }
        }
    }

    #[async_trait]
    impl<R: Runtime> FilePicker for DialogPicker<R> {
        async fn pick_audio(&self) -> Result<Option<PickedFile>> {
            let (tx, rx) = oneshot::channel();
            let extensions = audio_extensions();

            self.app
                .dialog()
                .file()
                .set_title("Choose a bird song")
                .add_filter("Audio", &extensions)
                .pick_file(move |file| {
                    let _ = tx.send(file);
                });

            let Some(file) = rx
                .await
                .map_err(|_| BirdyError::Acquisition("File dialog closed unexpectedly".to_string()))?
            else {
                return Ok(None);
            };

            let path = file
                .into_path()
                .map_err(|e| BirdyError::Acquisition(format!("Unsupported file location: {}", e)))?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();

            Ok(Some(PickedFile { path, name }))
        }
    }
}
