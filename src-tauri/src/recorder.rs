//! Live microphone capture into a WAV file.
//!
//! A recording is opened with [`Recorder::start`] and closed exactly once with
//! [`ActiveRecording::finish`], which consumes it.

use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct CapturedClip {
    pub path: PathBuf,
    pub duration_ms: u64,
}

pub trait Recorder: Send + Sync {
    fn start(&self, path: &Path) -> Result<Box<dyn ActiveRecording>>;
}

pub trait ActiveRecording: Send {
    fn finish(self: Box<Self>) -> Result<CapturedClip>;
}

pub fn duration_ms_for_frames(frames: u64, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    frames.saturating_mul(1000) / sample_rate as u64
}

#[cfg(feature = "desktop")]
pub use cpal_capture::CpalRecorder;

#[cfg(feature = "desktop")]
mod cpal_capture {
    use std::fs::File;
    use std::io::BufWriter;
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::mpsc::{channel, Sender};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{Device, FromSample, SampleFormat, StreamConfig};
    use hound::{WavSpec, WavWriter};
    use tracing::{error, info};

    use super::{duration_ms_for_frames, ActiveRecording, CapturedClip, Recorder};
    use crate::error::{BirdyError, Result};

    type SharedWriter = Arc<Mutex<Option<WavWriter<BufWriter<File>>>>>;

    /// Records at the device's default rate and channel count, 16-bit PCM.
    pub struct CpalRecorder;

    /// The cpal stream is `!Send`, so it lives on its own thread for the
    /// whole session and is dropped there.
    struct CpalRecording {
        stop_flag: Arc<AtomicBool>,
        worker: Option<thread::JoinHandle<Result<CapturedClip>>>,
    }

    impl Recorder for CpalRecorder {
        fn start(&self, path: &Path) -> Result<Box<dyn ActiveRecording>> {
            let stop_flag = Arc::new(AtomicBool::new(false));
            let (ready_tx, ready_rx) = channel::<Result<()>>();

            let thread_stop = stop_flag.clone();
            let thread_path = path.to_path_buf();
            let worker =
                thread::spawn(move || capture_until_stopped(thread_path, thread_stop, ready_tx));

            match ready_rx.recv() {
                Ok(Ok(())) => Ok(Box::new(CpalRecording {
                    stop_flag,
                    worker: Some(worker),
                })),
                Ok(Err(e)) => {
                    let _ = worker.join();
                    Err(e)
                }
                Err(_) => {
                    let _ = worker.join();
                    Err(BirdyError::Acquisition(
                        "capture thread exited before the stream started".to_string(),
                    ))
                }
            }
        }
    }

    impl ActiveRecording for CpalRecording {
        fn finish(mut self: Box<Self>) -> Result<CapturedClip> {
            self.stop_flag.store(true, Ordering::SeqCst);
            let worker = self.worker.take().ok_or_else(|| {
                BirdyError::Acquisition("recording already finished".to_string())
            })?;

            worker
                .join()
                .map_err(|_| BirdyError::Acquisition("capture thread panicked".to_string()))?
        }
    }

    impl Drop for CpalRecording {
        fn drop(&mut self) {
            self.stop_flag.store(true, Ordering::SeqCst);
        }
    }

    fn capture_until_stopped(
        path: PathBuf,
        stop_flag: Arc<AtomicBool>,
        ready_tx: Sender<Result<()>>,
    ) -> Result<CapturedClip> {
        let opened = open_stream(&path);
        let (stream, writer, samples_written, sample_rate, channels) = match opened {
            Ok(parts) => {
                let _ = ready_tx.send(Ok(()));
                parts
            }
            Err(e) => {
                let message = e.to_string();
                let _ = ready_tx.send(Err(e));
                return Err(BirdyError::Acquisition(message));
            }
        };

        while !stop_flag.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(20));
        }

        drop(stream);

        let writer = writer
            .lock()
            .map_err(|_| BirdyError::Acquisition("WAV writer lock poisoned".to_string()))?
            .take()
            .ok_or_else(|| BirdyError::Acquisition("WAV writer missing".to_string()))?;
        writer
            .finalize()
            .map_err(|e| BirdyError::Acquisition(format!("Failed to finalize WAV: {}", e)))?;

        let frames = samples_written.load(Ordering::SeqCst) / channels.max(1) as u64;
        let duration_ms = duration_ms_for_frames(frames, sample_rate);
        info!(path = %path.display(), frames, duration_ms, "Recording finalized");

        Ok(CapturedClip { path, duration_ms })
    }

    fn open_stream(
        path: &Path,
    ) -> Result<(cpal::Stream, SharedWriter, Arc<AtomicU64>, u32, u16)> {
        let host = cpal::default_host();
        let device = host
            .default_input_device()
            .ok_or_else(|| BirdyError::Acquisition("No audio input devices found".to_string()))?;
        let config = device
            .default_input_config()
            .map_err(|e| BirdyError::Acquisition(e.to_string()))?;

        let sample_rate = config.sample_rate().0;
        let channels = config.channels();

        info!(
            device = %device.name().unwrap_or_default(),
            sample_rate,
            channels,
            format = ?config.sample_format(),
            path = %path.display(),
            "Starting recording"
        );

        let spec = WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = WavWriter::create(path, spec)
            .map_err(|e| BirdyError::Acquisition(format!("Failed to create WAV file: {}", e)))?;
        let writer: SharedWriter = Arc::new(Mutex::new(Some(writer)));
        let samples_written = Arc::new(AtomicU64::new(0));

        let sample_format = config.sample_format();
        let stream_config: StreamConfig = config.into();
        let stream = match sample_format {
            SampleFormat::F32 => build_stream::<f32>(&device, &stream_config, &writer, &samples_written),
            SampleFormat::I16 => build_stream::<i16>(&device, &stream_config, &writer, &samples_written),
            SampleFormat::I32 => build_stream::<i32>(&device, &stream_config, &writer, &samples_written),
            SampleFormat::U16 => build_stream::<u16>(&device, &stream_config, &writer, &samples_written),
            format => {
                return Err(BirdyError::Acquisition(format!(
                    "Unsupported sample format: {:?}",
                    format
                )))
            }
        }?;

        stream
            .play()
            .map_err(|e| BirdyError::Acquisition(e.to_string()))?;

        Ok((stream, writer, samples_written, sample_rate, channels))
    }

    fn build_stream<T>(
        device: &Device,
        config: &StreamConfig,
        writer: &SharedWriter,
        samples_written: &Arc<AtomicU64>,
    ) -> Result<cpal::Stream>
    where
        T: cpal::Sample + cpal::SizedSample + Send + 'static,
        i16: FromSample<T>,
    {
        let writer = writer.clone();
        let samples_written = samples_written.clone();

        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    let Ok(mut guard) = writer.lock() else { return };
                    let Some(wav) = guard.as_mut() else { return };
                    for sample in data {
                        if wav.write_sample(i16::from_sample_(*sample)).is_err() {
                            return;
                        }
                    }
                    samples_written.fetch_add(data.len() as u64, Ordering::SeqCst);
                },
                |err| error!("Recording stream error: {}", err),
                None,
            )
            .map_err(|e| BirdyError::Acquisition(e.to_string()))
    }
}
