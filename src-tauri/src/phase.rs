use serde::Serialize;

use crate::error::{BirdyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SourcePhase {
    Empty,
    Picking,
    Recording,
    Staged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceEvent {
    StartRecording,
    StopRecording,
    PickFile,
    Clear,
}

impl SourcePhase {
    /// Every (phase, event) pair is either accepted or rejected with the
    /// notice the user should see.
    pub fn accepts(self, event: SourceEvent) -> Result<()> {
        use SourceEvent::*;
        use SourcePhase::*;

        match (self, event) {
            (_, Clear) => Ok(()),

            (Empty, StartRecording) | (Empty, PickFile) => Ok(()),
            (Recording, StopRecording) => Ok(()),

            (Staged, StartRecording) | (Staged, PickFile) => Err(BirdyError::AssetAlreadyStaged),
            (Recording, StartRecording) | (Recording, PickFile) => {
                Err(BirdyError::RecordingInProgress)
            }
            (Picking, StartRecording) | (Picking, PickFile) => Err(BirdyError::SelectionInProgress),
            (Empty, StopRecording) | (Picking, StopRecording) | (Staged, StopRecording) => {
                Err(BirdyError::NoActiveRecording)
            }
        }
    }
}
