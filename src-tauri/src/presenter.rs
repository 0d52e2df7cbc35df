//! Display fields derived from a classification. Nothing here mutates the
//! result or touches the network.

use serde::Serialize;

use crate::error::Result;
use crate::upload::ClassificationResult;

pub const NOT_AVAILABLE: &str = "N/A";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultView {
    pub class_name: String,
    pub top_probability: String,
    pub scientific_name: String,
    /// `None` means the more-info link is not rendered at all.
    pub more_info_url: Option<String>,
    pub image_url: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub fn top_probability(probabilities: &[f64]) -> Option<f64> {
    probabilities
        .iter()
        .copied()
        .filter(|p| !p.is_nan())
        .fold(None, |best, p| match best {
            Some(b) if b >= p => Some(b),
            _ => Some(p),
        })
}

pub fn present(result: &ClassificationResult) -> ResultView {
    let details = &result.bird_details;

    ResultView {
        class_name: result.class_name.clone(),
        top_probability: top_probability(&result.probabilities)
            .map(|p| format!("{:.2}", p))
            .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
        scientific_name: non_empty(&details.scientific_name)
            .unwrap_or_else(|| NOT_AVAILABLE.to_string()),
        more_info_url: non_empty(&details.more_info),
        image_url: non_empty(&details.image_url),
    }
}

pub trait LinkOpener: Send + Sync {
    fn open(&self, url: &str) -> Result<()>;
}

/// Opens the more-info link if the view has one. Returns whether a link was opened.
pub fn open_more_info(view: &ResultView, opener: &dyn LinkOpener) -> Result<bool> {
    let Some(url) = view.more_info_url.as_deref() else {
        return Ok(false);
    };

    opener.open(url)?;
    tracing::info!(url, "Opened more-info link");
    Ok(true)
}

#[cfg(feature = "desktop")]
pub use tauri_opener::TauriOpener;

#[cfg(feature = "desktop")]
mod tauri_opener {
    use tauri::{AppHandle, Runtime};
    use tauri_plugin_opener::OpenerExt;

    use super::LinkOpener;
    use crate::error::{BirdyError, Result};

    pub struct TauriOpener<R: Runtime> {
        app: AppHandle<R>,
    }

    impl<R: Runtime> TauriOpener<R> {
        pub fn new(app: AppHandle<R>) -> Self {
            Self { app }
        }
    }

    impl<R: Runtime> LinkOpener for TauriOpener<R> {
        fn open(&self, url: &str) -> Result<()> {
            self.app
                .opener()
                .open_url(url, None::<&str>)
                .map_err(|e| BirdyError::Opener(e.to_string()))
        }
    }
}
