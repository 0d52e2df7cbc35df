//! Single-handle playback of the staged clip.
//!
//! The controller owns at most one [`PlaybackHandle`]. Handles are released
//! through [`PlaybackHandle::unload`] on every exit path: explicit teardown,
//! a new asset, or the clip reaching its natural end.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::asset::AudioAsset;
use crate::decode::DecodedAudio;
use crate::error::{BirdyError, Result};

/// Invoked from the backend once a clip has played to the end.
pub type CompletionObserver = Arc<dyn Fn() + Send + Sync>;

pub trait PlayerBackend: Send + Sync {
    /// Loads `path` and starts playing immediately.
    fn load(&self, path: &Path, on_complete: CompletionObserver) -> Result<Box<dyn PlaybackHandle>>;
}

pub trait PlaybackHandle: Send {
    fn pause(&mut self) -> Result<()>;
    fn resume(&mut self) -> Result<()>;
    /// Loaded and no longer playing because the clip ended.
    fn is_finished(&self) -> bool;
    fn unload(self: Box<Self>);
}

/// What a toggle press asks of the caller.
#[derive(Debug, PartialEq)]
pub enum ToggleStep {
    /// Pause or resume happened in place; carries the new `is_playing`.
    Done(bool),
    /// No handle yet: the caller loads `path` off the lock and hands the
    /// result back through [`PlaybackController::attach`].
    Load(PathBuf),
}

#[derive(Default)]
pub struct PlaybackController {
    handle: Option<Box<dyn PlaybackHandle>>,
    loading: Option<PathBuf>,
    is_playing: bool,
}

impl PlaybackController {
    pub fn is_playing(&self) -> bool {
        self.is_playing
    }

    pub fn has_handle(&self) -> bool {
        self.handle.is_some()
    }

    pub fn is_loading(&self) -> bool {
        self.loading.is_some()
    }

    /// Releases a handle whose clip has ended. Returns true if one was released.
    pub fn reap(&mut self) -> bool {
        let finished = self
            .handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(false);

        if finished {
            tracing::debug!("Playback reached the end of the clip");
            self.teardown();
        }
        finished
    }

    /// Play, pause or resume. A press while a load is pending leaves it alone.
    pub fn step(&mut self, asset: Option<&AudioAsset>) -> Result<ToggleStep> {
        self.reap();

        let Some(asset) = asset else {
            return Err(BirdyError::NoAudio);
        };

        if self.loading.is_some() {
            return Ok(ToggleStep::Done(self.is_playing));
        }

        match self.handle.as_mut() {
            None => {
                self.loading = Some(asset.path.clone());
                self.is_playing = true;
                Ok(ToggleStep::Load(asset.path.clone()))
            }
            Some(handle) => {
                if self.is_playing {
                    handle.pause()?;
                } else {
                    handle.resume()?;
                }
                self.is_playing = !self.is_playing;
                Ok(ToggleStep::Done(self.is_playing))
            }
        }
    }

    /// Adopts a handle loaded for `path`. If that load was superseded by a
    /// teardown or a newer load, the handle is returned for the caller to unload.
    pub fn attach(
        &mut self,
        path: &Path,
        handle: Box<dyn PlaybackHandle>,
    ) -> Option<Box<dyn PlaybackHandle>> {
        if self.loading.as_deref() != Some(path) {
            return Some(handle);
        }

        tracing::info!(path = %path.display(), "Playback started");
        self.loading = None;
        self.handle = Some(handle);
        self.is_playing = true;
        None
    }

    /// Forgets a pending load for `path` that failed or was abandoned.
    pub fn abort_load(&mut self, path: &Path) {
        if self.loading.as_deref() == Some(path) {
            self.loading = None;
            self.is_playing = false;
        }
    }

    /// Resets to stopped and hands back the handle, if any, for unloading
    /// outside the caller's lock.
    pub fn detach(&mut self) -> Option<Box<dyn PlaybackHandle>> {
        self.loading = None;
        self.is_playing = false;
        self.handle.take()
    }

    pub fn teardown(&mut self) {
        if let Some(handle) = self.detach() {
            handle.unload();
        }
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Converts decoded audio to the output device's rate and channel count
/// (linear interpolation, channel fold/spread).
pub fn adapt_for_output(audio: &DecodedAudio, out_rate: u32, out_channels: u16) -> Vec<f32> {
    let in_channels = audio.channels.max(1) as usize;
    let out_channels = out_channels.max(1) as usize;
    let frames = audio.frames();
    if frames == 0 || out_rate == 0 || audio.sample_rate == 0 {
        return Vec::new();
    }

    let frame_at = |index: usize| &audio.samples[index * in_channels..(index + 1) * in_channels];
    let mix = |frame: &[f32], out_ch: usize| -> f32 {
        match (in_channels, out_channels) {
            (i, o) if i == o => frame[out_ch],
            (1, _) => frame[0],
            (i, 1) => frame.iter().sum::<f32>() / i as f32,
            (i, _) => frame[out_ch.min(i - 1)],
        }
    };

    let ratio = audio.sample_rate as f64 / out_rate as f64;
    let out_frames = ((frames as f64) / ratio).round().max(1.0) as usize;
    let mut output = Vec::with_capacity(out_frames * out_channels);

    for n in 0..out_frames {
        let position = n as f64 * ratio;
        let base = (position.floor() as usize).min(frames - 1);
        let next = (base + 1).min(frames - 1);
        let weight = (position - base as f64) as f32;

        for ch in 0..out_channels {
            let a = mix(frame_at(base), ch);
            let b = mix(frame_at(next), ch);
            output.push(a + (b - a) * weight);
        }
    }

    output
}

#[cfg(feature = "desktop")]
pub use cpal_player::CpalPlayer;

#[cfg(feature = "desktop")]
mod cpal_player {
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc::{channel, Sender};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::StreamConfig;
    use tracing::{error, info};

    use super::{adapt_for_output, CompletionObserver, PlaybackHandle, PlayerBackend};
    use crate::decode::decode_file;
    use crate::error::{BirdyError, Result};

    pub struct CpalPlayer;

    #[derive(Default)]
    struct Flags {
        paused: AtomicBool,
        stop: AtomicBool,
        finished: AtomicBool,
    }

    struct CpalPlayback {
        flags: Arc<Flags>,
        worker: Option<thread::JoinHandle<()>>,
    }

    impl PlayerBackend for CpalPlayer {
        fn load(&self, path: &Path, on_complete: CompletionObserver) -> Result<Box<dyn PlaybackHandle>> {
            let flags = Arc::new(Flags::default());
            let (ready_tx, ready_rx) = channel::<Result<()>>();

            let thread_flags = flags.clone();
            let thread_path = path.to_path_buf();
            let worker = thread::spawn(move || {
                play_until_done(thread_path, thread_flags, on_complete, ready_tx)
            });

            match ready_rx.recv() {
                Ok(Ok(())) => Ok(Box::new(CpalPlayback {
                    flags,
                    worker: Some(worker),
                })),
                Ok(Err(e)) => {
                    let _ = worker.join();
                    Err(e)
                }
                Err(_) => {
                    let _ = worker.join();
                    Err(BirdyError::Playback("player thread exited early".to_string()))
                }
            }
        }
    }

    impl PlaybackHandle for CpalPlayback {
        fn pause(&mut self) -> Result<()> {
            self.flags.paused.store(true, Ordering::SeqCst);
            Ok(())
        }

        fn resume(&mut self) -> Result<()> {
            self.flags.paused.store(false, Ordering::SeqCst);
            Ok(())
        }

        fn is_finished(&self) -> bool {
            self.flags.finished.load(Ordering::SeqCst)
        }

        fn unload(mut self: Box<Self>) {
            self.flags.stop.store(true, Ordering::SeqCst);
            if let Some(worker) = self.worker.take() {
                let _ = worker.join();
            }
        }
    }

    impl Drop for CpalPlayback {
        fn drop(&mut self) {
            self.flags.stop.store(true, Ordering::SeqCst);
        }
    }

    fn open_output(path: &Path, flags: &Arc<Flags>) -> Result<(cpal::Stream, Arc<AtomicUsize>, usize)> {
        let decoded = decode_file(path)?;

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| BirdyError::Playback("No audio output devices found".to_string()))?;
        let supported = device
            .default_output_config()
            .map_err(|e| BirdyError::Playback(e.to_string()))?;

        let out_rate = supported.sample_rate().0;
        let out_channels = supported.channels();
        let samples = Arc::new(adapt_for_output(&decoded, out_rate, out_channels));
        let total = samples.len();

        info!(
            device = %device.name().unwrap_or_default(),
            source_rate = decoded.sample_rate,
            output_rate = out_rate,
            output_channels = out_channels,
            total_samples = total,
            "Loading clip for playback"
        );

        let position = Arc::new(AtomicUsize::new(0));
        let callback_position = position.clone();
        let callback_flags = flags.clone();
        let config: StreamConfig = supported.into();

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    if callback_flags.paused.load(Ordering::SeqCst) {
                        data.fill(0.0);
                        return;
                    }
                    let pos = callback_position.load(Ordering::SeqCst);
                    for (i, sample) in data.iter_mut().enumerate() {
                        *sample = samples.get(pos + i).copied().unwrap_or(0.0);
                    }
                    callback_position.store((pos + data.len()).min(total), Ordering::SeqCst);
                },
                move |err| error!("Playback stream error: {}", err),
                None,
            )
            .map_err(|e| BirdyError::Playback(e.to_string()))?;

        stream
            .play()
            .map_err(|e| BirdyError::Playback(e.to_string()))?;

        Ok((stream, position, total))
    }

    fn play_until_done(
        path: PathBuf,
        flags: Arc<Flags>,
        on_complete: CompletionObserver,
        ready_tx: Sender<Result<()>>,
    ) {
        let (stream, position, total) = match open_output(&path, &flags) {
            Ok(parts) => {
                let _ = ready_tx.send(Ok(()));
                parts
            }
            Err(e) => {
                let _ = ready_tx.send(Err(e));
                return;
            }
        };

        while !flags.stop.load(Ordering::SeqCst) {
            if position.load(Ordering::SeqCst) >= total {
                flags.finished.store(true, Ordering::SeqCst);
                info!(path = %path.display(), "Playback finished");
                on_complete();
                break;
            }
            thread::sleep(Duration::from_millis(30));
        }

        drop(stream);
    }
}
