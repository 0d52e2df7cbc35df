//! Container probing and PCM decoding for staged clips.

use std::fs::File;
use std::path::Path;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{CodecParameters, DecoderOptions};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, warn};

use crate::error::{BirdyError, Result};

/// Interleaved f32 samples.
#[derive(Debug, Clone)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl DecodedAudio {
    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }
}

fn open_format(path: &Path) -> Result<(Box<dyn FormatReader>, u32, CodecParameters)> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let opened = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| BirdyError::Playback(format!("Unrecognized audio file: {}", e)))?;

    let format = opened.format;
    let track = format
        .default_track()
        .ok_or_else(|| BirdyError::Playback("No audio track found".to_string()))?;
    let track_id = track.id;
    let params = track.codec_params.clone();

    Ok((format, track_id, params))
}

/// Duration from container metadata, without decoding. `None` when the
/// container does not declare a frame count.
pub fn read_duration_ms(path: &Path) -> Option<u64> {
    let (_, _, params) = open_format(path).ok()?;
    let frames = params.n_frames?;
    let sample_rate = params.sample_rate?;
    if sample_rate == 0 {
        return None;
    }
    Some(frames.saturating_mul(1000) / sample_rate as u64)
}

pub fn decode_file(path: &Path) -> Result<DecodedAudio> {
    let (mut format, track_id, params) = open_format(path)?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&params, &DecoderOptions::default())
        .map_err(|e| BirdyError::Playback(format!("Unsupported codec: {}", e)))?;

    let mut sample_rate = params.sample_rate.unwrap_or(44_100);
    let mut channels = params.channels.map(|c| c.count() as u16).unwrap_or(2);
    let mut samples: Vec<f32> = Vec::new();

    loop {
        let packet = match format.next_packet() {
            Ok(p) => p,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => {
                warn!("Error reading packet: {}", e);
                break;
            }
        };

        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(d) => d,
            Err(SymphoniaError::DecodeError(e)) => {
                warn!("Skipping undecodable packet: {}", e);
                continue;
            }
            Err(e) => return Err(BirdyError::Playback(e.to_string())),
        };

        let spec = *decoded.spec();
        sample_rate = spec.rate;
        channels = spec.channels.count() as u16;

        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buffer.samples());
    }

    debug!(
        path = %path.display(),
        samples = samples.len(),
        sample_rate,
        channels,
        "Decoded audio"
    );

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}
