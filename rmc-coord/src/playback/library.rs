//! In-process playback backend
//!
//! Decodes the stimulus with symphonia, resamples with rubato when the
//! output device runs at a different rate, and plays through cpal. Each play
//! call runs on its own thread because cpal streams are not `Send`.
//!
//! File channels map one-to-one onto device channels so a per-channel sweep
//! reaches the speaker it was authored for. File channels beyond the device
//! channel count are dropped; spare device channels get silence.

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
use rubato::{FastFixedIn, Resampler};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::DecoderOptions;
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use tracing::{debug, error, info, warn};

use super::{FinishGuard, MediaPlayer, OnFinished};
use crate::error::{Error, Result};

/// How often the playback thread checks for stop / end of stream
const SUPERVISE_INTERVAL: Duration = Duration::from_millis(20);

/// Decoded stimulus, interleaved at its native channel count
#[derive(Debug)]
pub struct DecodedAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: usize,
}

/// Decode a whole file to interleaved f32
pub fn decode_file(path: &Path) -> Result<DecodedAudio> {
    let file = File::open(path)?;
    let mss = MediaSourceStream::new(Box::new(file), Default::default());

    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }

    let probed = symphonia::default::get_probe()
        .format(&hint, mss, &FormatOptions::default(), &MetadataOptions::default())
        .map_err(|e| Error::Playback(format!("Unsupported format {}: {}", path.display(), e)))?;
    let mut format = probed.format;

    let track = format
        .default_track()
        .ok_or_else(|| Error::Playback(format!("No audio track in {}", path.display())))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let sample_rate = codec_params.sample_rate.unwrap_or(48_000);
    let mut channels = codec_params.channels.map(|c| c.count()).unwrap_or(2);

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| Error::Playback(format!("Unsupported codec {}: {}", path.display(), e)))?;

    let mut samples = Vec::new();
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => return Err(Error::Playback(format!("Read error: {}", e))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            // Corrupt packet; skip it
            Err(SymphoniaError::DecodeError(e)) => {
                warn!("Skipping undecodable packet: {}", e);
                continue;
            }
            Err(e) => return Err(Error::Playback(format!("Decode error: {}", e))),
        };

        channels = decoded.spec().channels.count();
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, *decoded.spec());
        buffer.copy_interleaved_ref(decoded);
        samples.extend_from_slice(buffer.samples());
    }

    debug!(
        "Decoded {}: {} frames, {} Hz, {} channels",
        path.display(),
        samples.len() / channels.max(1),
        sample_rate,
        channels
    );

    Ok(DecodedAudio {
        samples,
        sample_rate,
        channels,
    })
}

/// Interleaved to planar
fn deinterleave(samples: &[f32], channels: usize) -> Vec<Vec<f32>> {
    let frames = samples.len() / channels;
    let mut planar = vec![Vec::with_capacity(frames); channels];
    for frame in samples.chunks_exact(channels) {
        for (ch, sample) in frame.iter().enumerate() {
            planar[ch].push(*sample);
        }
    }
    planar
}

/// Planar to interleaved
fn interleave(planar: &[Vec<f32>]) -> Vec<f32> {
    let Some(first) = planar.first() else {
        return Vec::new();
    };
    let frames = first.len();
    let mut interleaved = Vec::with_capacity(frames * planar.len());
    for frame in 0..frames {
        for channel in planar {
            interleaved.push(channel[frame]);
        }
    }
    interleaved
}

/// Convert `audio` to `output_rate`, leaving it untouched if rates match
pub fn resample(audio: DecodedAudio, output_rate: u32) -> Result<DecodedAudio> {
    if audio.sample_rate == output_rate || audio.samples.is_empty() {
        return Ok(audio);
    }

    debug!("Resampling from {}Hz to {}Hz", audio.sample_rate, output_rate);
    let planar = deinterleave(&audio.samples, audio.channels);
    let frames = planar[0].len();

    let mut resampler = FastFixedIn::<f32>::new(
        output_rate as f64 / audio.sample_rate as f64,
        1.0,
        rubato::PolynomialDegree::Septic,
        frames,
        audio.channels,
    )
    .map_err(|e| Error::Playback(format!("Failed to create resampler: {}", e)))?;

    let output = resampler
        .process(&planar, None)
        .map_err(|e| Error::Playback(format!("Resampling failed: {}", e)))?;

    Ok(DecodedAudio {
        samples: interleave(&output),
        sample_rate: output_rate,
        channels: audio.channels,
    })
}

/// Playback cursor shared with the audio callback
struct Cursor {
    audio: DecodedAudio,
    frame: usize,
}

impl Cursor {
    fn frames(&self) -> usize {
        self.audio.samples.len() / self.audio.channels.max(1)
    }

    /// Fill one device buffer; returns false once the stimulus is exhausted
    fn fill<T: SizedSample + FromSample<f32>>(
        &mut self,
        data: &mut [T],
        device_channels: usize,
    ) -> bool {
        let src_channels = self.audio.channels;
        for out_frame in data.chunks_mut(device_channels) {
            if self.frame >= self.frames() {
                for sample in out_frame.iter_mut() {
                    *sample = T::from_sample(0.0f32);
                }
                continue;
            }
            let base = self.frame * src_channels;
            for (ch, sample) in out_frame.iter_mut().enumerate() {
                let value = if ch < src_channels {
                    self.audio.samples[base + ch]
                } else {
                    0.0
                };
                *sample = T::from_sample(value);
            }
            self.frame += 1;
        }
        self.frame < self.frames()
    }
}

fn build_stream<T: SizedSample + FromSample<f32>>(
    device: &cpal::Device,
    config: &StreamConfig,
    cursor: Arc<Mutex<Cursor>>,
    drained: Arc<AtomicBool>,
) -> Result<Stream> {
    let device_channels = config.channels as usize;
    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let mut cursor = cursor.lock().unwrap_or_else(PoisonError::into_inner);
                if !cursor.fill(data, device_channels) {
                    drained.store(true, Ordering::SeqCst);
                }
            },
            |err| error!("Audio output error: {}", err),
            None,
        )
        .map_err(|e| Error::Playback(format!("Failed to build output stream: {}", e)))
}

/// Runs on the playback thread until the stimulus ends or `stop` is set
fn play_blocking(path: &Path, stop: &AtomicBool) -> Result<()> {
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| Error::Playback("No default output device found".to_string()))?;
    let supported = device
        .default_output_config()
        .map_err(|e| Error::Playback(format!("Failed to get default config: {}", e)))?;
    let sample_format = supported.sample_format();
    let config: StreamConfig = supported.config();

    let audio = resample(decode_file(path)?, config.sample_rate.0)?;
    if audio.channels > config.channels as usize {
        warn!(
            "{} has {} channels, output device has {}; extra channels dropped",
            path.display(),
            audio.channels,
            config.channels
        );
    }

    let cursor = Arc::new(Mutex::new(Cursor { audio, frame: 0 }));
    let drained = Arc::new(AtomicBool::new(false));

    let stream = match sample_format {
        SampleFormat::F32 => build_stream::<f32>(&device, &config, cursor, Arc::clone(&drained))?,
        SampleFormat::I16 => build_stream::<i16>(&device, &config, cursor, Arc::clone(&drained))?,
        SampleFormat::U16 => build_stream::<u16>(&device, &config, cursor, Arc::clone(&drained))?,
        other => {
            return Err(Error::Playback(format!("Unsupported sample format: {:?}", other)));
        }
    };
    stream
        .play()
        .map_err(|e| Error::Playback(format!("Failed to start stream: {}", e)))?;

    while !stop.load(Ordering::SeqCst) && !drained.load(Ordering::SeqCst) {
        std::thread::sleep(SUPERVISE_INTERVAL);
    }
    Ok(())
}

/// Plays stimuli through the default audio output device
#[derive(Default)]
pub struct LibraryPlayer {
    current: Mutex<Option<Arc<AtomicBool>>>,
}

impl LibraryPlayer {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MediaPlayer for LibraryPlayer {
    fn play(&self, file: &Path, on_finished: OnFinished) -> Result<()> {
        let guard = FinishGuard::new(on_finished);
        self.stop();

        if !file.is_file() {
            return Err(Error::Playback(format!("Stimulus not found: {}", file.display())));
        }

        let stop = Arc::new(AtomicBool::new(false));
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&stop));

        let path: PathBuf = file.to_path_buf();
        info!("Playing {} in-process", path.display());
        std::thread::Builder::new()
            .name("rmc-playback".to_string())
            .spawn(move || {
                if let Err(e) = play_blocking(&path, &stop) {
                    error!("Playback of {} failed: {}", path.display(), e);
                }
                stop.store(true, Ordering::SeqCst);
                guard.fire();
            })?;
        Ok(())
    }

    fn stop(&self) {
        if let Some(stop) = self.current.lock().unwrap_or_else(PoisonError::into_inner).take() {
            stop.store(true, Ordering::SeqCst);
        }
    }

    fn is_playing(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|stop| !stop.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}
