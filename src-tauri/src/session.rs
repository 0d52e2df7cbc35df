//! The single owner of the staged clip and everything derived from it.
//!
//! All mutation goes through [`Session`]. The slot lock is only held for
//! bookkeeping: the picker dialog, device open and close, decoding and the
//! upload request all run unlocked (blocking work on the blocking pool), and
//! re-enter the lock to commit.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use serde::Serialize;
use tracing::{info, warn};

use crate::asset::AudioAsset;
use crate::decode::read_duration_ms;
use crate::error::{BirdyError, Result};
use crate::permission::{MicrophoneAccess, PermissionStatus};
use crate::phase::{SourceEvent, SourcePhase};
use crate::picker::FilePicker;
use crate::playback::{
    CompletionObserver, PlaybackController, PlaybackHandle, PlayerBackend, ToggleStep,
};
use crate::presenter::{present, ResultView};
use crate::recorder::{ActiveRecording, Recorder};
use crate::staging::Staging;
use crate::upload::{
    run_upload, ClassificationResult, ClassificationTransport, FailureKind, UploadCoordinator,
    UploadFailure, UploadState, UploadTicket,
};

/// The platform pieces a session drives.
pub struct Devices {
    pub microphone: Arc<dyn MicrophoneAccess>,
    pub recorder: Arc<dyn Recorder>,
    pub picker: Arc<dyn FilePicker>,
    pub player: Arc<dyn PlayerBackend>,
    pub transport: Arc<dyn ClassificationTransport>,
}

struct RecordingSession {
    path: PathBuf,
    active: Box<dyn ActiveRecording>,
}

/// Source work running outside the lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SourceWork {
    Picking,
    StartingRecording,
    StoppingRecording,
}

#[derive(Default)]
struct Slots {
    asset: Option<AudioAsset>,
    recording: Option<RecordingSession>,
    busy: Option<SourceWork>,
    playback: PlaybackController,
    upload: UploadCoordinator,
}

impl Slots {
    fn phase(&self) -> SourcePhase {
        let opening_or_closing = matches!(
            self.busy,
            Some(SourceWork::StartingRecording) | Some(SourceWork::StoppingRecording)
        );

        if self.recording.is_some() || opening_or_closing {
            SourcePhase::Recording
        } else if self.asset.is_some() {
            SourcePhase::Staged
        } else if self.busy == Some(SourceWork::Picking) {
            SourcePhase::Picking
        } else {
            SourcePhase::Empty
        }
    }

    /// Drops upload state that belonged to the previous asset and detaches its
    /// player, which the caller unloads after unlocking.
    fn reset_derived(&mut self) -> Option<Box<dyn PlaybackHandle>> {
        self.upload.reset();
        self.playback.detach()
    }

    fn finish_work(&mut self, work: SourceWork) {
        if self.busy == Some(work) {
            self.busy = None;
        }
    }
}

fn unload(handle: Option<Box<dyn PlaybackHandle>>) {
    if let Some(handle) = handle {
        handle.unload();
    }
}

/// What the UI renders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub phase: SourcePhase,
    pub asset: Option<AudioAsset>,
    pub is_playing: bool,
    pub upload: UploadState,
    pub result: Option<ResultView>,
}

pub struct Session {
    slots: Mutex<Slots>,
    microphone: Arc<dyn MicrophoneAccess>,
    recorder: Arc<dyn Recorder>,
    picker: Arc<dyn FilePicker>,
    player: Arc<dyn PlayerBackend>,
    transport: RwLock<Arc<dyn ClassificationTransport>>,
    staging: Staging,
    playback_observer: CompletionObserver,
}

type Undo = Box<dyn FnOnce(&mut Slots) + Send>;

/// Rolls back a claim on the slots if the operation that made it is dropped
/// or fails before committing.
struct SlotGuard<'a> {
    session: &'a Session,
    undo: Option<Undo>,
}

impl<'a> SlotGuard<'a> {
    fn new(session: &'a Session, undo: impl FnOnce(&mut Slots) + Send + 'static) -> Self {
        Self {
            session,
            undo: Some(Box::new(undo)),
        }
    }

    fn disarm(&mut self) {
        self.undo = None;
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        if let Some(undo) = self.undo.take() {
            let mut slots = self.session.lock();
            undo(&mut *slots);
        }
    }
}

/// Owns the upload ticket while the request is outstanding. If the submitting
/// future is dropped first, the upload is marked abandoned so the in-flight
/// flag cannot stick.
struct Flight<'a> {
    session: &'a Session,
    ticket: Option<UploadTicket>,
}

impl Flight<'_> {
    fn land(
        mut self,
        outcome: std::result::Result<ClassificationResult, UploadFailure>,
    ) -> UploadState {
        let mut slots = self.session.lock();
        if let Some(ticket) = self.ticket.take() {
            slots.upload.complete(&ticket, outcome);
        }
        slots.upload.state().clone()
    }
}

impl Drop for Flight<'_> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            warn!("Upload abandoned before it resolved");
            self.session.lock().upload.complete(
                &ticket,
                Err(UploadFailure::new(
                    FailureKind::Abandoned,
                    "Upload was interrupted before it finished",
                )),
            );
        }
    }
}

fn join_failed(task: &str, e: tokio::task::JoinError) -> BirdyError {
    BirdyError::Acquisition(format!("{} task failed: {}", task, e))
}

impl Session {
    pub fn new(devices: Devices, staging: Staging) -> Self {
        Self {
            slots: Mutex::new(Slots::default()),
            microphone: devices.microphone,
            recorder: devices.recorder,
            picker: devices.picker,
            player: devices.player,
            transport: RwLock::new(devices.transport),
            staging,
            playback_observer: Arc::new(|| {}),
        }
    }

    /// Called from the playback thread when a clip reaches its end. It must not
    /// call back into the session.
    pub fn with_playback_observer(mut self, observer: CompletionObserver) -> Self {
        self.playback_observer = observer;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn transport(&self) -> Arc<dyn ClassificationTransport> {
        match self.transport.read() {
            Ok(transport) => transport.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Replaces the transport for later submits. An upload already in flight
    /// keeps the one it started with.
    pub fn set_transport(&self, transport: Arc<dyn ClassificationTransport>) {
        match self.transport.write() {
            Ok(mut slot) => *slot = transport,
            Err(poisoned) => *poisoned.into_inner() = transport,
        }
    }

    pub fn staging(&self) -> &Staging {
        &self.staging
    }

    pub fn phase(&self) -> SourcePhase {
        self.lock().phase()
    }

    /// Marks `work` as running if the current phase accepts `event`.
    fn claim(&self, event: SourceEvent, work: SourceWork) -> Result<SlotGuard<'_>> {
        {
            let mut slots = self.lock();
            slots.phase().accepts(event)?;
            slots.busy = Some(work);
        }
        Ok(SlotGuard::new(self, move |slots| slots.finish_work(work)))
    }

    pub async fn start_recording(&self) -> Result<()> {
        let mut claim = self.claim(SourceEvent::StartRecording, SourceWork::StartingRecording)?;

        let path = self.staging.recording_path()?;
        let microphone = self.microphone.clone();
        let recorder = self.recorder.clone();
        let target = path.clone();
        let started = tokio::task::spawn_blocking(move || {
            if microphone.request() == PermissionStatus::Denied {
                return Err(BirdyError::PermissionDenied);
            }
            recorder.start(&target)
        })
        .await
        .unwrap_or_else(|e| Err(join_failed("Recorder start", e)));

        let active = match started {
            Ok(active) => active,
            Err(BirdyError::PermissionDenied) => {
                info!("Microphone permission denied, recording not started");
                return Err(BirdyError::PermissionDenied);
            }
            Err(e) => {
                warn!("Failed to start recording: {}", e);
                self.staging.discard(&path);
                return Err(e);
            }
        };

        info!(path = %path.display(), "Recording started");
        let mut slots = self.lock();
        slots.recording = Some(RecordingSession { path, active });
        slots.finish_work(SourceWork::StartingRecording);
        claim.disarm();
        Ok(())
    }

    pub async fn stop_recording(&self) -> Result<AudioAsset> {
        let RecordingSession { path, active } = {
            let mut slots = self.lock();
            slots.phase().accepts(SourceEvent::StopRecording)?;
            let session = slots.recording.take().ok_or(BirdyError::NoActiveRecording)?;
            slots.busy = Some(SourceWork::StoppingRecording);
            session
        };
        let mut claim = SlotGuard::new(self, |slots| {
            slots.finish_work(SourceWork::StoppingRecording)
        });

        let finished = tokio::task::spawn_blocking(move || active.finish())
            .await
            .unwrap_or_else(|e| Err(join_failed("Recorder finish", e)));

        let clip = match finished {
            Ok(clip) => clip,
            Err(e) => {
                warn!("Recording could not be finalized: {}", e);
                self.staging.discard(&path);
                return Err(e);
            }
        };

        let asset = AudioAsset::recorded(clip.path, clip.duration_ms);
        info!(
            path = %asset.path.display(),
            duration_ms = clip.duration_ms,
            "Recording staged"
        );

        let previous = {
            let mut slots = self.lock();
            let previous = slots.reset_derived();
            slots.asset = Some(asset.clone());
            slots.finish_work(SourceWork::StoppingRecording);
            claim.disarm();
            previous
        };
        unload(previous);
        Ok(asset)
    }

    /// Opens the picker and stages the chosen file. `Ok(None)` on cancel.
    pub async fn pick_file(&self) -> Result<Option<AudioAsset>> {
        let mut claim = self.claim(SourceEvent::PickFile, SourceWork::Picking)?;

        let Some(picked) = self.picker.pick_audio().await? else {
            info!("File selection cancelled");
            return Ok(None);
        };

        let staged = self
            .staging
            .stage_copy(&picked.path, &picked.name)
            .await
            .map_err(|e| BirdyError::Acquisition(format!("Failed to copy {}: {}", picked.name, e)))?;

        let clip_path = staged.clone();
        let duration_ms = tokio::task::spawn_blocking(move || read_duration_ms(&clip_path))
            .await
            .ok()
            .flatten();
        let asset = AudioAsset::picked(staged, &picked.name, duration_ms);

        let previous = {
            let mut slots = self.lock();
            let still_ours = slots.busy == Some(SourceWork::Picking)
                && slots.asset.is_none()
                && slots.recording.is_none();
            if !still_ours {
                warn!("State changed while picking, dropping {}", asset.display_name);
                self.staging.discard(&asset.path);
                return Err(BirdyError::AssetAlreadyStaged);
            }

            info!(name = %asset.display_name, "Picked file staged");
            let previous = slots.reset_derived();
            slots.asset = Some(asset.clone());
            slots.finish_work(SourceWork::Picking);
            claim.disarm();
            previous
        };
        unload(previous);
        Ok(Some(asset))
    }

    /// Idempotent. Outcomes of an upload still in flight are discarded. The
    /// player, if any, is unloaded on the calling thread after the lock is
    /// released.
    pub fn clear(&self) {
        let (previous, asset) = {
            let mut slots = self.lock();
            (slots.reset_derived(), slots.asset.take())
        };

        unload(previous);
        if let Some(asset) = asset {
            self.staging.discard(&asset.path);
            info!(name = %asset.display_name, "Cleared staged audio");
        }
    }

    /// Returns whether the clip is playing after the toggle.
    pub async fn toggle_playback(&self) -> Result<bool> {
        let path = {
            let mut guard = self.lock();
            let slots = &mut *guard;
            match slots.playback.step(slots.asset.as_ref())? {
                ToggleStep::Done(playing) => return Ok(playing),
                ToggleStep::Load(path) => path,
            }
        };
        let abandon_path = path.clone();
        let mut claim = SlotGuard::new(self, move |slots| {
            slots.playback.abort_load(&abandon_path)
        });

        let player = self.player.clone();
        let observer = self.playback_observer.clone();
        let load_path = path.clone();
        let loaded = tokio::task::spawn_blocking(move || player.load(&load_path, observer))
            .await
            .unwrap_or_else(|e| Err(BirdyError::Playback(format!("Player task failed: {}", e))));

        let handle = match loaded {
            Ok(handle) => handle,
            Err(e) => {
                warn!(path = %path.display(), "Failed to load clip: {}", e);
                return Err(e);
            }
        };

        let stale = {
            let mut slots = self.lock();
            claim.disarm();
            slots.playback.attach(&path, handle)
        };
        Ok(self.release_stale(&path, stale).await)
    }

    async fn release_stale(&self, path: &Path, stale: Option<Box<dyn PlaybackHandle>>) -> bool {
        let Some(handle) = stale else {
            return true;
        };

        info!(path = %path.display(), "Dropping player for a cleared clip");
        let _ = tokio::task::spawn_blocking(move || handle.unload()).await;
        false
    }

    pub async fn submit(&self) -> Result<UploadState> {
        let (ticket, plan) = {
            let mut guard = self.lock();
            let slots = &mut *guard;
            slots.upload.begin(slots.asset.as_ref())?
        };

        let transport = self.transport();
        let flight = Flight {
            session: self,
            ticket: Some(ticket),
        };
        let outcome = run_upload(transport.as_ref(), plan).await;
        Ok(flight.land(outcome))
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let mut slots = self.lock();
        slots.playback.reap();

        let upload = slots.upload.state().clone();
        SessionSnapshot {
            phase: slots.phase(),
            asset: slots.asset.clone(),
            is_playing: slots.playback.is_playing(),
            result: upload.result().map(present),
            upload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::tests::write_test_wav;
    use crate::picker::PickedFile;
    use crate::playback::tests::FakePlayer;
    use crate::recorder::CapturedClip;
    use crate::upload::{RawReply, UploadRequest, SERVER_ERROR_MESSAGE};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Barrier;
    use tempfile::TempDir;
    use tokio::sync::Notify;

    const REPLY_JSON: &str = r#"{"class_name":"Common Blackbird","probabilities":[0.1,0.82,0.07],"bird_details":{}}"#;

    struct FakeMicrophone {
        granted: AtomicBool,
        requests: AtomicUsize,
    }

    impl MicrophoneAccess for FakeMicrophone {
        fn request(&self) -> PermissionStatus {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if self.granted.load(Ordering::SeqCst) {
                PermissionStatus::Granted
            } else {
                PermissionStatus::Denied
            }
        }
    }

    #[derive(Default)]
    struct FakeRecorder {
        starts: AtomicUsize,
        fail_start: AtomicBool,
        fail_finish: AtomicBool,
        duration_ms: std::sync::atomic::AtomicU64,
        /// Waited on twice: once when the device is being opened, once more
        /// before it reports back.
        opening: Mutex<Option<Arc<Barrier>>>,
    }

    struct FakeRecording {
        path: PathBuf,
        duration_ms: u64,
        fail: bool,
    }

    impl Recorder for FakeRecorder {
        fn start(&self, path: &Path) -> Result<Box<dyn ActiveRecording>> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if let Some(opening) = self.opening.lock().unwrap().clone() {
                opening.wait();
                opening.wait();
            }
            std::fs::write(path, b"RIFF")?;
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(BirdyError::Acquisition("no input device".to_string()));
            }
            Ok(Box::new(FakeRecording {
                path: path.to_path_buf(),
                duration_ms: self.duration_ms.load(Ordering::SeqCst),
                fail: self.fail_finish.load(Ordering::SeqCst),
            }))
        }
    }

    impl ActiveRecording for FakeRecording {
        fn finish(self: Box<Self>) -> Result<CapturedClip> {
            if self.fail {
                return Err(BirdyError::Acquisition("stream closed".to_string()));
            }
            Ok(CapturedClip {
                path: self.path,
                duration_ms: self.duration_ms,
            })
        }
    }

    /// Returns whatever the test queued; `None` acts as cancel.
    #[derive(Default)]
    struct FakePicker {
        next: Mutex<Option<PickedFile>>,
        opens: AtomicUsize,
        gate: Option<Arc<Gate>>,
    }

    #[async_trait]
    impl FilePicker for FakePicker {
        async fn pick_audio(&self) -> Result<Option<PickedFile>> {
            self.opens.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.pass().await;
            }
            Ok(self.next.lock().unwrap().take())
        }
    }

    /// Lets a test hold an async call open until it says go.
    #[derive(Default)]
    struct Gate {
        entered: Notify,
        release: Notify,
    }

    impl Gate {
        async fn pass(&self) {
            self.entered.notify_one();
            self.release.notified().await;
        }
    }

    struct ScriptedTransport {
        calls: AtomicUsize,
        reply: std::result::Result<RawReply, String>,
        gate: Option<Arc<Gate>>,
        last_request: Mutex<Option<UploadRequest>>,
    }

    impl ScriptedTransport {
        fn replying(reply: std::result::Result<RawReply, String>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                reply,
                gate: None,
                last_request: Mutex::new(None),
            }
        }

        fn ok_json() -> Self {
            Self::replying(Ok(RawReply {
                status: 200,
                body: REPLY_JSON.as_bytes().to_vec(),
            }))
        }

        fn gated(mut self, gate: Arc<Gate>) -> Self {
            self.gate = Some(gate);
            self
        }
    }

    #[async_trait]
    impl ClassificationTransport for ScriptedTransport {
        async fn send(&self, request: UploadRequest) -> std::result::Result<RawReply, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_request.lock().unwrap() = Some(request);
            if let Some(gate) = &self.gate {
                gate.pass().await;
            }
            self.reply.clone()
        }
    }

    struct Rig {
        session: Arc<Session>,
        microphone: Arc<FakeMicrophone>,
        recorder: Arc<FakeRecorder>,
        picker: Arc<FakePicker>,
        player: Arc<FakePlayer>,
        transport: Arc<ScriptedTransport>,
        completions: Arc<AtomicUsize>,
        dir: TempDir,
    }

    impl Rig {
        fn staging_dir(&self) -> PathBuf {
            self.dir.path().join("staging")
        }

        fn staged_files(&self) -> usize {
            std::fs::read_dir(self.staging_dir())
                .map(|entries| entries.count())
                .unwrap_or(0)
        }

        async fn record(&self) -> AudioAsset {
            self.session.start_recording().await.unwrap();
            self.session.stop_recording().await.unwrap()
        }
    }

    fn rig_with(picker: FakePicker, transport: ScriptedTransport) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let microphone = Arc::new(FakeMicrophone {
            granted: AtomicBool::new(true),
            requests: AtomicUsize::new(0),
        });
        let recorder = Arc::new(FakeRecorder::default());
        recorder.duration_ms.store(4_000, Ordering::SeqCst);
        let picker = Arc::new(picker);
        let player = Arc::new(FakePlayer::default());
        let transport = Arc::new(transport);
        let completions = Arc::new(AtomicUsize::new(0));

        let counter = completions.clone();
        let session = Session::new(
            Devices {
                microphone: microphone.clone(),
                recorder: recorder.clone(),
                picker: picker.clone(),
                player: player.clone(),
                transport: transport.clone(),
            },
            Staging::new(dir.path().join("staging")),
        )
        .with_playback_observer(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        Rig {
            session: Arc::new(session),
            microphone,
            recorder,
            picker,
            player,
            transport,
            completions,
            dir,
        }
    }

    fn rig() -> Rig {
        rig_with(FakePicker::default(), ScriptedTransport::ok_json())
    }

    fn queue_pick(rig: &Rig, name: &str) -> PathBuf {
        let source = write_test_wav(rig.dir.path(), name, 8_000, 8_000 * 65);
        *rig.picker.next.lock().unwrap() = Some(PickedFile {
            path: source.clone(),
            name: name.to_string(),
        });
        source
    }

    #[tokio::test]
    async fn recording_stages_a_clip_with_its_duration() {
        let rig = rig();
        rig.recorder.duration_ms.store(65_000, Ordering::SeqCst);

        rig.session.start_recording().await.unwrap();
        assert_eq!(rig.session.phase(), SourcePhase::Recording);

        let asset = rig.session.stop_recording().await.unwrap();
        assert_eq!(asset.display_name, "bird_song.wav");
        assert_eq!(asset.duration_label.as_deref(), Some("1:05"));
        assert!(asset.path.starts_with(rig.staging_dir()));

        let snapshot = rig.session.snapshot();
        assert_eq!(snapshot.phase, SourcePhase::Staged);
        assert_eq!(snapshot.asset, Some(asset));
        assert_eq!(snapshot.upload, UploadState::Idle);
    }

    #[tokio::test]
    async fn staged_asset_blocks_new_acquisition() {
        let rig = rig();
        let asset = rig.record().await;

        let err = rig.session.start_recording().await.unwrap_err();
        assert!(matches!(err, BirdyError::AssetAlreadyStaged));
        assert_eq!(
            err.to_string(),
            "Please clear the current audio before recording or choosing another file."
        );
        assert_eq!(rig.recorder.starts.load(Ordering::SeqCst), 1);
        assert_eq!(rig.session.snapshot().asset, Some(asset));
    }

    #[tokio::test]
    async fn staged_asset_blocks_picking_without_opening_dialog() {
        let rig = rig();
        let asset = rig.record().await;

        let err = rig.session.pick_file().await.unwrap_err();
        assert!(matches!(err, BirdyError::AssetAlreadyStaged));
        assert_eq!(rig.picker.opens.load(Ordering::SeqCst), 0);
        assert_eq!(rig.session.snapshot().asset, Some(asset));
    }

    #[tokio::test]
    async fn denied_permission_leaves_state_untouched() {
        let rig = rig();
        rig.microphone.granted.store(false, Ordering::SeqCst);

        let err = rig.session.start_recording().await.unwrap_err();
        assert!(matches!(err, BirdyError::PermissionDenied));
        assert_eq!(rig.microphone.requests.load(Ordering::SeqCst), 1);
        assert_eq!(rig.recorder.starts.load(Ordering::SeqCst), 0);
        assert_eq!(rig.session.phase(), SourcePhase::Empty);
    }

    #[tokio::test]
    async fn failed_start_leaves_no_recording_behind() {
        let rig = rig();
        rig.recorder.fail_start.store(true, Ordering::SeqCst);

        assert!(rig.session.start_recording().await.is_err());
        assert_eq!(rig.session.phase(), SourcePhase::Empty);
        assert_eq!(rig.staged_files(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn session_stays_usable_while_the_device_opens() {
        let rig = rig();
        let opening = Arc::new(Barrier::new(2));
        *rig.recorder.opening.lock().unwrap() = Some(opening.clone());

        let session = rig.session.clone();
        let start = tokio::spawn(async move { session.start_recording().await });
        let wait = opening.clone();
        tokio::task::spawn_blocking(move || wait.wait()).await.unwrap();

        let snapshot = rig.session.snapshot();
        assert_eq!(snapshot.phase, SourcePhase::Recording);
        assert!(matches!(
            rig.session.start_recording().await,
            Err(BirdyError::RecordingInProgress)
        ));
        assert!(matches!(
            rig.session.pick_file().await,
            Err(BirdyError::RecordingInProgress)
        ));
        assert_eq!(rig.picker.opens.load(Ordering::SeqCst), 0);

        let wait = opening.clone();
        tokio::task::spawn_blocking(move || wait.wait()).await.unwrap();
        start.await.unwrap().unwrap();
        *rig.recorder.opening.lock().unwrap() = None;

        rig.session.stop_recording().await.unwrap();
        assert_eq!(rig.session.phase(), SourcePhase::Staged);
        assert_eq!(rig.recorder.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stop_without_recording_is_rejected() {
        let rig = rig();
        assert!(matches!(
            rig.session.stop_recording().await,
            Err(BirdyError::NoActiveRecording)
        ));
    }

    #[tokio::test]
    async fn failed_finalize_closes_the_session() {
        let rig = rig();
        rig.recorder.fail_finish.store(true, Ordering::SeqCst);
        rig.session.start_recording().await.unwrap();

        assert!(rig.session.stop_recording().await.is_err());
        assert_eq!(rig.session.phase(), SourcePhase::Empty);
        assert_eq!(rig.staged_files(), 0);

        rig.recorder.fail_finish.store(false, Ordering::SeqCst);
        rig.record().await;
        assert_eq!(rig.session.phase(), SourcePhase::Staged);
    }

    #[tokio::test]
    async fn cancelled_pick_is_silent() {
        let rig = rig();

        assert_eq!(rig.session.pick_file().await.unwrap(), None);
        assert_eq!(rig.picker.opens.load(Ordering::SeqCst), 1);
        assert_eq!(rig.session.phase(), SourcePhase::Empty);
        assert_eq!(rig.session.snapshot().asset, None);
    }

    #[tokio::test]
    async fn picked_file_is_copied_into_staging() {
        let rig = rig();
        let source = queue_pick(&rig, "dawn chorus.wav");

        let asset = rig.session.pick_file().await.unwrap().unwrap();
        assert_eq!(asset.display_name, "dawn chorus.wav");
        assert_eq!(asset.duration_label.as_deref(), Some("1:05"));
        assert!(asset.path.starts_with(rig.staging_dir()));

        std::fs::remove_file(&source).unwrap();
        assert!(asset.path.exists());
        assert_eq!(rig.session.phase(), SourcePhase::Staged);
    }

    #[tokio::test]
    async fn open_dialog_blocks_other_acquisition() {
        let gate = Arc::new(Gate::default());
        let picker = FakePicker {
            gate: Some(gate.clone()),
            ..FakePicker::default()
        };
        let rig = rig_with(picker, ScriptedTransport::ok_json());
        queue_pick(&rig, "wren.wav");

        let session = rig.session.clone();
        let pick = tokio::spawn(async move { session.pick_file().await });
        gate.entered.notified().await;

        assert_eq!(rig.session.phase(), SourcePhase::Picking);
        assert!(matches!(
            rig.session.start_recording().await,
            Err(BirdyError::SelectionInProgress)
        ));
        assert!(matches!(
            rig.session.pick_file().await,
            Err(BirdyError::SelectionInProgress)
        ));

        gate.release.notify_one();
        assert!(pick.await.unwrap().unwrap().is_some());
        assert_eq!(rig.session.phase(), SourcePhase::Staged);
        assert_eq!(rig.picker.opens.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_is_idempotent() {
        let rig = rig();
        let before = rig.session.snapshot();

        rig.session.clear();
        assert_eq!(rig.session.snapshot(), before);

        rig.record().await;
        rig.session.clear();
        let once = rig.session.snapshot();
        rig.session.clear();
        assert_eq!(rig.session.snapshot(), once);
        assert_eq!(once, before);
    }

    #[tokio::test]
    async fn clear_releases_everything_derived_from_the_asset() {
        let rig = rig();
        let asset = rig.record().await;
        rig.session.toggle_playback().await.unwrap();
        rig.session.submit().await.unwrap();
        assert!(rig.session.snapshot().result.is_some());

        rig.session.clear();

        let snapshot = rig.session.snapshot();
        assert_eq!(snapshot.phase, SourcePhase::Empty);
        assert_eq!(snapshot.asset, None);
        assert!(!snapshot.is_playing);
        assert_eq!(snapshot.upload, UploadState::Idle);
        assert_eq!(snapshot.result, None);
        assert_eq!(rig.player.unloads.load(Ordering::SeqCst), 1);
        assert!(!asset.path.exists());
    }

    #[tokio::test]
    async fn playback_follows_the_asset() {
        let rig = rig();
        assert!(matches!(
            rig.session.toggle_playback().await,
            Err(BirdyError::NoAudio)
        ));
        assert_eq!(rig.player.loads.load(Ordering::SeqCst), 0);

        rig.record().await;
        assert!(rig.session.toggle_playback().await.unwrap());
        assert!(!rig.session.toggle_playback().await.unwrap());
        assert!(rig.session.toggle_playback().await.unwrap());
        assert_eq!(rig.player.loads.load(Ordering::SeqCst), 1);

        rig.player.finish_clip();
        assert_eq!(rig.completions.load(Ordering::SeqCst), 1);
        assert!(!rig.session.snapshot().is_playing);
        assert_eq!(rig.player.unloads.load(Ordering::SeqCst), 1);

        assert!(rig.session.toggle_playback().await.unwrap());
        assert_eq!(rig.player.loads.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn submit_without_asset_sends_nothing() {
        let rig = rig();

        let err = rig.session.submit().await.unwrap_err();
        assert!(matches!(err, BirdyError::NoAudio));
        assert_eq!(err.to_string(), "No audio uploaded. Record or choose a file first.");
        assert_eq!(rig.transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn successful_submit_presents_the_result() {
        let rig = rig();
        rig.record().await;

        let state = rig.session.submit().await.unwrap();
        assert!(matches!(state, UploadState::Succeeded(_)));

        let request = rig.transport.last_request.lock().unwrap().take().unwrap();
        assert_eq!(request.file_name, "bird_song.wav");
        assert_eq!(request.mime_type, "audio/wav");

        let result = rig.session.snapshot().result.unwrap();
        assert_eq!(result.class_name, "Common Blackbird");
        assert_eq!(result.top_probability, "0.82");
        assert_eq!(result.scientific_name, "N/A");
        assert_eq!(result.more_info_url, None);
    }

    #[tokio::test]
    async fn only_one_upload_in_flight() {
        let gate = Arc::new(Gate::default());
        let rig = rig_with(
            FakePicker::default(),
            ScriptedTransport::ok_json().gated(gate.clone()),
        );
        rig.record().await;

        let session = rig.session.clone();
        let first = tokio::spawn(async move { session.submit().await });
        gate.entered.notified().await;

        assert!(rig.session.snapshot().upload.is_in_flight());
        assert!(matches!(
            rig.session.submit().await,
            Err(BirdyError::UploadInFlight)
        ));

        gate.release.notify_one();
        assert!(matches!(
            first.await.unwrap().unwrap(),
            UploadState::Succeeded(_)
        ));
        assert_eq!(rig.transport.calls.load(Ordering::SeqCst), 1);
        assert!(!rig.session.snapshot().upload.is_in_flight());
    }

    #[tokio::test]
    async fn server_error_surfaces_the_generic_message() {
        let rig = rig_with(
            FakePicker::default(),
            ScriptedTransport::replying(Ok(RawReply {
                status: 500,
                body: Vec::new(),
            })),
        );
        rig.record().await;

        let state = rig.session.submit().await.unwrap();
        assert_eq!(
            state,
            UploadState::Failed(UploadFailure::new(FailureKind::Server, SERVER_ERROR_MESSAGE))
        );
        let snapshot = rig.session.snapshot();
        assert!(!snapshot.upload.is_in_flight());
        assert_eq!(snapshot.result, None);
    }

    #[tokio::test]
    async fn transport_error_surfaces_its_own_message() {
        let rig = rig_with(
            FakePicker::default(),
            ScriptedTransport::replying(Err("Connection refused (os error 111)".to_string())),
        );
        rig.record().await;

        let state = rig.session.submit().await.unwrap();
        assert_eq!(
            state,
            UploadState::Failed(UploadFailure::new(
                FailureKind::Transport,
                "Connection refused (os error 111)"
            ))
        );
        assert!(!rig.session.snapshot().upload.is_in_flight());
    }

    #[tokio::test]
    async fn late_result_after_clear_is_discarded() {
        let gate = Arc::new(Gate::default());
        let rig = rig_with(
            FakePicker::default(),
            ScriptedTransport::ok_json().gated(gate.clone()),
        );
        rig.record().await;

        let session = rig.session.clone();
        let submit = tokio::spawn(async move { session.submit().await });
        gate.entered.notified().await;

        rig.session.clear();
        gate.release.notify_one();
        assert_eq!(submit.await.unwrap().unwrap(), UploadState::Idle);

        let snapshot = rig.session.snapshot();
        assert_eq!(snapshot.upload, UploadState::Idle);
        assert_eq!(snapshot.result, None);
    }

    #[tokio::test]
    async fn clear_does_not_open_a_second_request() {
        let gate = Arc::new(Gate::default());
        let rig = rig_with(
            FakePicker::default(),
            ScriptedTransport::ok_json().gated(gate.clone()),
        );
        rig.record().await;

        let session = rig.session.clone();
        let first = tokio::spawn(async move { session.submit().await });
        gate.entered.notified().await;

        rig.session.clear();
        rig.record().await;
        assert!(!rig.session.snapshot().upload.is_in_flight());
        assert!(matches!(
            rig.session.submit().await,
            Err(BirdyError::UploadInFlight)
        ));
        assert_eq!(rig.transport.calls.load(Ordering::SeqCst), 1);

        gate.release.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), UploadState::Idle);

        gate.release.notify_one();
        assert!(matches!(
            rig.session.submit().await.unwrap(),
            UploadState::Succeeded(_)
        ));
        assert_eq!(rig.transport.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn abandoned_submit_does_not_stick_in_flight() {
        let gate = Arc::new(Gate::default());
        let rig = rig_with(
            FakePicker::default(),
            ScriptedTransport::ok_json().gated(gate.clone()),
        );
        rig.record().await;

        let session = rig.session.clone();
        let submit = tokio::spawn(async move { session.submit().await });
        gate.entered.notified().await;

        submit.abort();
        assert!(submit.await.unwrap_err().is_cancelled());

        match rig.session.snapshot().upload {
            UploadState::Failed(failure) => assert_eq!(failure.kind, FailureKind::Abandoned),
            other => panic!("unexpected upload state: {:?}", other),
        }
    }
}
