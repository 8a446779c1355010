//! # Capture Bridge
//!
//! Turns an open microphone into a continuous sequence of fixed-size
//! [`AudioFrame`]s at 16 kHz mono, whatever the device's native format. The
//! cpal callback runs on the audio thread; it only converts, accumulates and
//! pushes complete frames into an unbounded channel read by the session loop.

use crate::audio::codec::AudioFrame;
use crate::config::AudioConfig;
use crate::device::{map_build_error, map_play_error, DeviceManager};
use crate::error::{SessionError, SessionResult};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A microphone tap owned by one session.
///
/// ## Contract:
/// - `open` acquires the device and starts delivering frames on `frames`
/// - `close` disconnects the tap and releases the device; calling it again,
///   or on a handle that never opened, does nothing
pub trait CaptureDevice {
    fn open(&mut self, frames: mpsc::UnboundedSender<AudioFrame>) -> SessionResult<()>;

    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Turns device callback slices into fixed-size mono frames at the upstream rate.
///
/// ## Pipeline:
/// 1. **Downmix**: interleaved channels are averaged to mono
/// 2. **Resample**: linear interpolation from the device rate; the read
///    position carries across callbacks so slice boundaries leave no seams
/// 3. **Frame**: samples are cut into `frame_size` frames with increasing sequence numbers
#[derive(Debug)]
pub struct FrameAccumulator {
    frame_size: usize,
    sample_rate: u32,
    input_rate: u32,
    channels: usize,
    /// Mono device samples not yet consumed by the resampler
    input: Vec<f32>,
    /// Fractional read position into `input`
    position: f64,
    pending: Vec<f32>,
    next_sequence: u64,
}

impl FrameAccumulator {
    pub fn new(frame_size: usize, sample_rate: u32, input_rate: u32, channels: usize) -> Self {
        Self {
            frame_size: frame_size.max(1),
            sample_rate,
            input_rate,
            channels: channels.max(1),
            input: Vec::new(),
            position: 0.0,
            pending: Vec::with_capacity(frame_size),
            next_sequence: 0,
        }
    }

    /// Feed interleaved device samples; returns every frame completed by them.
    pub fn push(&mut self, data: &[f32]) -> Vec<AudioFrame> {
        let mono = data
            .chunks(self.channels)
            .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32);

        if self.input_rate == self.sample_rate || self.input_rate == 0 || self.sample_rate == 0 {
            let mut completed = Vec::new();
            for sample in mono {
                self.emit(sample, &mut completed);
            }
            return completed;
        }

        self.input.extend(mono);
        let step = self.input_rate as f64 / self.sample_rate as f64;
        let mut resampled = Vec::with_capacity((self.input.len() as f64 / step) as usize + 1);

        loop {
            let idx = self.position.floor() as usize;
            if idx + 1 >= self.input.len() {
                break;
            }
            let frac = (self.position - idx as f64) as f32;
            resampled.push(self.input[idx] * (1.0 - frac) + self.input[idx + 1] * frac);
            self.position += step;
        }

        let consumed = (self.position.floor() as usize).min(self.input.len());
        self.input.drain(..consumed);
        self.position -= consumed as f64;

        let mut completed = Vec::new();
        for sample in resampled {
            self.emit(sample, &mut completed);
        }
        completed
    }

    fn emit(&mut self, sample: f32, completed: &mut Vec<AudioFrame>) {
        self.pending.push(sample);
        if self.pending.len() == self.frame_size {
            let samples = std::mem::replace(&mut self.pending, Vec::with_capacity(self.frame_size));
            completed.push(AudioFrame {
                samples,
                sample_rate: self.sample_rate,
                sequence: self.next_sequence,
            });
            self.next_sequence += 1;
        }
    }
}

/// Microphone capture through cpal.
///
/// The stream opens at the device's default config (rate, channels and
/// sample type); [`FrameAccumulator`] converts to the upstream format.
pub struct CaptureBridge {
    device_name: Option<String>,
    sample_rate: u32,
    frame_size: usize,
    stream: Option<Stream>,
}

impl CaptureBridge {
    pub fn new(audio: &AudioConfig) -> Self {
        Self {
            device_name: audio.input_device.clone(),
            sample_rate: audio.capture_sample_rate,
            frame_size: audio.capture_frame_size,
            stream: None,
        }
    }
}

impl CaptureDevice for CaptureBridge {
    fn open(&mut self, frames: mpsc::UnboundedSender<AudioFrame>) -> SessionResult<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let device = DeviceManager::input_device(self.device_name.as_deref())?;
        let supported = device
            .default_input_config()
            .map_err(|e| SessionError::DeviceUnavailable(format!("no usable input config: {}", e)))?;

        let native_rate = supported.sample_rate().0;
        let channels = supported.channels();
        let stream_config: StreamConfig = supported.config();

        info!(
            native_rate,
            channels,
            sample_rate = self.sample_rate,
            frame_size = self.frame_size,
            "Opening microphone capture"
        );

        let accumulator = FrameAccumulator::new(self.frame_size, self.sample_rate, native_rate, channels as usize);

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_capture_stream::<f32>(&device, &stream_config, accumulator, frames)?,
            SampleFormat::I16 => build_capture_stream::<i16>(&device, &stream_config, accumulator, frames)?,
            SampleFormat::U16 => build_capture_stream::<u16>(&device, &stream_config, accumulator, frames)?,
            other => {
                return Err(SessionError::DeviceUnavailable(format!(
                    "unsupported input sample format {:?}",
                    other
                )))
            }
        };

        stream.play().map_err(map_play_error)?;
        self.stream = Some(stream);

        info!("Microphone capture started");
        Ok(())
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                debug!("Pausing microphone stream failed: {}", e);
            }
            drop(stream);
            info!("Microphone capture released");
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

/// Input stream in the device's native sample type, converted to f32 before framing.
fn build_capture_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut accumulator: FrameAccumulator,
    frames: mpsc::UnboundedSender<AudioFrame>,
) -> SessionResult<Stream>
where
    T: SizedSample,
    f32: FromSample<T>,
{
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|&s| -> f32 { Sample::from_sample(s) }));
                for frame in accumulator.push(&scratch) {
                    // The receiver is gone once the session tears down
                    if frames.send(frame).is_err() {
                        return;
                    }
                }
            },
            move |err| {
                warn!("Microphone stream error: {}", err);
            },
            None,
        )
        .map_err(map_build_error)
}

impl Drop for CaptureBridge {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulator_emits_fixed_frames_in_order() {
        let mut acc = FrameAccumulator::new(4096, 16000, 16000, 1);

        // Irregular callback sizes, 3 frames' worth plus a remainder
        let mut frames = Vec::new();
        for size in [1000, 5000, 3000, 3300] {
            frames.extend(acc.push(&vec![0.1; size]));
        }

        assert_eq!(frames.len(), 3);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.samples.len(), 4096);
            assert_eq!(frame.sequence, i as u64);
            assert_eq!(frame.sample_rate, 16000);
        }
    }

    #[test]
    fn test_accumulator_downmixes_stereo() {
        let mut acc = FrameAccumulator::new(2, 16000, 16000, 2);
        let frames = acc.push(&[1.0, 0.0, -0.5, -0.5]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples, vec![0.5, -0.5]);
    }

    #[test]
    fn test_accumulator_converts_48k_stereo_to_16k_frames() {
        let mut acc = FrameAccumulator::new(4096, 16000, 48000, 2);

        // One second of 48 kHz stereo in 10 ms callbacks, left 0.5 and right 0.1
        let callback: Vec<f32> = [0.5, 0.1].repeat(480);
        let mut frames = Vec::new();
        for _ in 0..100 {
            frames.extend(acc.push(&callback));
        }

        // ~16000 output samples: three full frames, the rest still pending
        assert_eq!(frames.len(), 3);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.samples.len(), 4096);
            assert_eq!(frame.sample_rate, 16000);
            assert_eq!(frame.sequence, i as u64);
            assert!(frame.samples.iter().all(|&s| (s - 0.3).abs() < 1e-6));
        }
        assert!(acc.pending.len() >= 16000 - 3 * 4096 - 1);
    }

    #[test]
    fn test_accumulator_resamples_without_seams() {
        // A ramp split across uneven callbacks matches the ramp resampled in one pass
        let ramp: Vec<f32> = (0..4800).map(|i| i as f32 / 4800.0).collect();
        let mut split = FrameAccumulator::new(1, 16000, 48000, 1);
        let mut whole = FrameAccumulator::new(1, 16000, 48000, 1);

        let mut split_out = Vec::new();
        for chunk in ramp.chunks(317) {
            split_out.extend(split.push(chunk).into_iter().map(|f| f.samples[0]));
        }
        let whole_out: Vec<f32> = whole.push(&ramp).into_iter().map(|f| f.samples[0]).collect();

        assert_eq!(split_out.len(), whole_out.len());
        for (a, b) in split_out.iter().zip(&whole_out) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_close_without_open_is_noop() {
        let mut bridge = CaptureBridge::new(&AudioConfig::default());
        assert!(!bridge.is_open());
        bridge.close();
        bridge.close();
        assert!(!bridge.is_open());
    }
}
