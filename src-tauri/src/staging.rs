//! App-controlled storage for the staged clip.
//!
//! Picker results can point at transient locations, so picked files are
//! copied here before they become the asset. Recordings are written here
//! directly.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use time::{macros::format_description, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::error::Result;

const FALLBACK_FILE_NAME: &str = "audio.mp3";

pub struct Staging {
    dir: PathBuf,
    counter: AtomicU64,
}

fn now_local_or_utc() -> OffsetDateTime {
    OffsetDateTime::now_local().unwrap_or_else(|_| OffsetDateTime::now_utc())
}

fn format_stamp(now: OffsetDateTime) -> String {
    now.format(format_description!(
        "[year][month][day]-[hour][minute][second]"
    ))
    .unwrap_or_else(|_| "19700101-000000".to_string())
}

pub fn sanitize_file_name(name: &str) -> String {
    let base = Path::new(name.trim())
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();

    let cleaned: String = base
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '-' | '_' => c,
            _ => '_',
        })
        .collect();

    let cleaned = cleaned.trim_start_matches('.').to_string();
    if cleaned.is_empty() {
        FALLBACK_FILE_NAME.to_string()
    } else {
        cleaned
    }
}

impl Staging {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            counter: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn unique_prefix(&self) -> String {
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        format!("{}-{}", format_stamp(now_local_or_utc()), seq)
    }

    pub fn recording_path(&self) -> Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        Ok(self
            .dir
            .join(format!("recording-{}.wav", self.unique_prefix())))
    }

    /// Copies `source` into the staging directory and returns the copy's path.
    pub async fn stage_copy(&self, source: &Path, display_name: &str) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let target = self.dir.join(format!(
            "picked-{}-{}",
            self.unique_prefix(),
            sanitize_file_name(display_name)
        ));

        let bytes = match tokio::fs::copy(source, &target).await {
            Ok(bytes) => bytes,
            Err(e) => {
                self.discard(&target);
                return Err(e.into());
            }
        };
        info!(
            source = %source.display(),
            target = %target.display(),
            bytes,
            "Staged picked file"
        );
        Ok(target)
    }

    pub fn owns(&self, path: &Path) -> bool {
        path.starts_with(&self.dir)
    }

    /// Removes a staged file. Paths outside the staging directory are left alone.
    pub fn discard(&self, path: &Path) {
        if !self.owns(path) {
            debug!(path = %path.display(), "Not discarding file outside staging");
            return;
        }

        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %path.display(), "Failed to remove staged file: {}", e);
            }
        }
    }
}
