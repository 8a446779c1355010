//! # Playback Scheduler
//!
//! Plays synthesized speech back-to-back, in arrival order, with no gap or
//! overlap, even though chunks arrive at irregular times.
//!
//! ## Scheduling rule:
//! ```text
//! start  = max(now, cursor)
//! cursor = start + duration
//! ```
//! An interruption collapses the cursor to `now` and abandons every buffer
//! that has not started yet.

use crate::audio::buffer::{lock_timeline, resample_linear, PlaybackTimeline, SharedTimeline};
use crate::audio::codec::PlaybackBuffer;
use crate::config::AudioConfig;
use crate::device::{map_build_error, map_play_error, DeviceManager};
use crate::error::{SessionError, SessionResult};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::{FromSample, SampleFormat, SizedSample, Stream, StreamConfig};
use tracing::{debug, info, warn};

/// Speaker output owned by one session.
///
/// `open` moves the timeline to the rate the device actually runs at, shares
/// it with the device and starts pulling audio from it. `close` releases the
/// device and is idempotent.
pub trait OutputDevice {
    fn open(&mut self, timeline: PlaybackTimeline) -> SessionResult<SharedTimeline>;

    fn close(&mut self);
}

/// The pure scheduling transition: `(now, cursor, duration) -> (start, next_cursor)`.
pub fn schedule_start(now: f64, cursor: f64, duration: f64) -> (f64, f64) {
    let start = now.max(cursor);
    (start, start + duration)
}

/// Owns the output context and the scheduling cursor for one session.
///
/// The cursor is private: only `schedule` and `reset` move it.
pub struct PlaybackScheduler {
    timeline: SharedTimeline,
    output: Option<Box<dyn OutputDevice>>,
    cursor: f64,
}

impl PlaybackScheduler {
    /// Open the output device on `timeline` and start the cursor at its "now".
    pub fn open(mut output: Box<dyn OutputDevice>, timeline: PlaybackTimeline) -> SessionResult<Self> {
        let timeline = output.open(timeline)?;
        let cursor = lock_timeline(&timeline).now();

        Ok(Self {
            timeline,
            output: Some(output),
            cursor,
        })
    }

    /// Current output clock time in seconds.
    pub fn now(&self) -> f64 {
        lock_timeline(&self.timeline).now()
    }

    /// Earliest time the next buffer may start.
    pub fn cursor(&self) -> f64 {
        self.cursor
    }

    pub fn is_speaking(&self) -> bool {
        lock_timeline(&self.timeline).is_speaking()
    }

    #[cfg(test)]
    pub(crate) fn timeline(&self) -> SharedTimeline {
        self.timeline.clone()
    }

    /// Schedule one buffer; returns the start time it was given.
    ///
    /// The buffer is brought to the output rate before the timeline is
    /// locked, so the device callback never waits on a resample.
    pub fn schedule(&mut self, buffer: PlaybackBuffer) -> f64 {
        let output_rate = lock_timeline(&self.timeline).sample_rate();
        let buffer = if buffer.sample_rate == output_rate {
            buffer
        } else {
            PlaybackBuffer::new(
                resample_linear(&buffer.samples, buffer.sample_rate, output_rate),
                output_rate,
            )
        };

        let duration = buffer.duration();
        let mut timeline = lock_timeline(&self.timeline);

        let (start, _) = schedule_start(timeline.now(), self.cursor, duration);
        let scheduled = timeline.enqueue(start, buffer);
        self.cursor = scheduled + duration;

        debug!(start = scheduled, duration, cursor = self.cursor, "Scheduled playback buffer");
        scheduled
    }

    /// Collapse the cursor to "now" and abandon buffers that have not started.
    ///
    /// The buffer already sounding plays out, so the speaking flag stays true
    /// until its last frame. Returns the new cursor.
    pub fn reset(&mut self) -> f64 {
        let mut timeline = lock_timeline(&self.timeline);
        let dropped = timeline.discard_pending();
        self.cursor = timeline.now();

        debug!(cursor = self.cursor, dropped, "Playback reset");
        self.cursor
    }

    /// Release the output context. Idempotent.
    pub fn close(&mut self) {
        if let Some(mut output) = self.output.take() {
            output.close();
            lock_timeline(&self.timeline).clear();
        }
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.close();
    }
}

/// Speaker output through cpal, rendering straight from the timeline.
///
/// The stream runs at the device's default config; the timeline follows it.
pub struct SpeakerOutput {
    device_name: Option<String>,
    stream: Option<Stream>,
}

impl SpeakerOutput {
    pub fn new(audio: &AudioConfig) -> Self {
        Self {
            device_name: audio.output_device.clone(),
            stream: None,
        }
    }
}

impl OutputDevice for SpeakerOutput {
    fn open(&mut self, timeline: PlaybackTimeline) -> SessionResult<SharedTimeline> {
        let device = DeviceManager::output_device(self.device_name.as_deref())?;
        let supported = device
            .default_output_config()
            .map_err(|e| SessionError::DeviceUnavailable(format!("no usable output config: {}", e)))?;

        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        let stream_config: StreamConfig = supported.config();
        let timeline = timeline.with_sample_rate(sample_rate).into_shared();

        let stream = match supported.sample_format() {
            SampleFormat::F32 => build_speaker_stream::<f32>(&device, &stream_config, timeline.clone())?,
            SampleFormat::I16 => build_speaker_stream::<i16>(&device, &stream_config, timeline.clone())?,
            SampleFormat::U16 => build_speaker_stream::<u16>(&device, &stream_config, timeline.clone())?,
            other => {
                return Err(SessionError::DeviceUnavailable(format!(
                    "unsupported output sample format {:?}",
                    other
                )))
            }
        };

        stream.play().map_err(map_play_error)?;
        self.stream = Some(stream);

        info!(sample_rate, channels, "Speaker output started");
        Ok(timeline)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.pause() {
                debug!("Pausing speaker stream failed: {}", e);
            }
            drop(stream);
            info!("Speaker output released");
        }
    }
}

/// Output stream in the device's native sample type, rendered through an f32 scratch.
fn build_speaker_stream<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    timeline: SharedTimeline,
) -> SessionResult<Stream>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |out: &mut [T], _: &cpal::OutputCallbackInfo| {
                scratch.resize(out.len(), 0.0);
                lock_timeline(&timeline).render(&mut scratch, channels);
                for (slot, sample) in out.iter_mut().zip(&scratch) {
                    *slot = T::from_sample(*sample);
                }
            },
            move |err| {
                warn!("Speaker stream error: {}", err);
            },
            None,
        )
        .map_err(map_build_error)
}

impl Drop for SpeakerOutput {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Output that never touches hardware; tests drive the clock by rendering.
    ///
    /// With `device_rate` set it behaves like a device that only runs at that rate.
    #[derive(Default)]
    pub(crate) struct SilentOutput {
        pub closes: Arc<AtomicUsize>,
        pub open: bool,
        pub device_rate: Option<u32>,
    }

    impl OutputDevice for SilentOutput {
        fn open(&mut self, timeline: PlaybackTimeline) -> SessionResult<SharedTimeline> {
            self.open = true;
            let timeline = match self.device_rate {
                Some(rate) => timeline.with_sample_rate(rate),
                None => timeline,
            };
            Ok(timeline.into_shared())
        }

        fn close(&mut self) {
            if self.open {
                self.open = false;
                self.closes.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    /// Advance the output clock by `seconds`.
    pub(crate) fn advance(timeline: &SharedTimeline, seconds: f64) {
        let mut timeline = lock_timeline(timeline);
        let frames = (seconds * timeline.sample_rate() as f64).round() as usize;
        let mut scratch = vec![0.0; frames];
        timeline.render(&mut scratch, 1);
    }

    fn scheduler_at(rate: u32) -> (PlaybackScheduler, SharedTimeline) {
        let scheduler =
            PlaybackScheduler::open(Box::new(SilentOutput::default()), PlaybackTimeline::new(rate)).unwrap();
        let timeline = scheduler.timeline();
        (scheduler, timeline)
    }

    fn seconds(duration: f64, rate: u32) -> PlaybackBuffer {
        PlaybackBuffer::new(vec![0.2; (duration * rate as f64).round() as usize], rate)
    }

    #[test]
    fn test_schedule_start_rule() {
        let close = |a: (f64, f64), b: (f64, f64)| (a.0 - b.0).abs() < 1e-9 && (a.1 - b.1).abs() < 1e-9;
        assert!(close(schedule_start(10.0, 10.0, 0.5), (10.0, 10.5)));
        // Late arrival starts at now, leaving a gap
        assert!(close(schedule_start(12.0, 10.5, 0.3), (12.0, 12.3)));
        // Early arrival queues behind the cursor
        assert!(close(schedule_start(10.0, 11.0, 0.3), (11.0, 11.3)));
    }

    #[test]
    fn test_intervals_never_overlap_and_keep_arrival_order() {
        let (mut scheduler, timeline) = scheduler_at(1000);
        let arrivals = [(0.0, 0.25), (0.1, 0.1), (0.0, 0.4), (1.5, 0.2), (0.05, 0.05), (0.3, 0.3)];

        let mut intervals: Vec<(f64, f64)> = Vec::new();
        for (wait, duration) in arrivals {
            advance(&timeline, wait);
            let start = scheduler.schedule(seconds(duration, 1000));
            assert!(start >= scheduler.now() - 1e-9);
            intervals.push((start, start + duration));
        }

        for pair in intervals.windows(2) {
            assert!(pair[1].0 >= pair[0].1 - 1e-9, "{:?} overlaps {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn test_reset_collapses_cursor_to_now() {
        let (mut scheduler, timeline) = scheduler_at(1000);
        scheduler.schedule(seconds(2.0, 1000));
        scheduler.schedule(seconds(2.0, 1000));
        assert!((scheduler.cursor() - 4.0).abs() < 1e-9);

        advance(&timeline, 0.7);
        let cursor = scheduler.reset();
        assert!((cursor - 0.7).abs() < 1e-9);

        let start = scheduler.schedule(seconds(0.1, 1000));
        assert!(start >= 0.7 - 1e-9);
        assert!(start < 4.0);
    }

    #[test]
    fn test_interruption_scenario_at_ten_seconds() {
        let (mut scheduler, timeline) = scheduler_at(24000);
        advance(&timeline, 10.0);

        let first = scheduler.schedule(seconds(0.5, 24000));
        let second = scheduler.schedule(seconds(0.3, 24000));
        assert!((first - 10.0).abs() < 1e-9);
        assert!((second - 10.5).abs() < 1e-9);

        advance(&timeline, 0.2);
        assert!(scheduler.is_speaking());
        let cursor = scheduler.reset();
        assert!((cursor - 10.2).abs() < 1e-9);

        let third = scheduler.schedule(seconds(0.1, 24000));
        assert!(third >= 10.2 - 1e-9);
        assert!((third - 10.2).abs() < 1e-9);
    }

    #[test]
    fn test_close_is_idempotent() {
        let closes = Arc::new(AtomicUsize::new(0));
        let output = SilentOutput {
            closes: closes.clone(),
            ..Default::default()
        };
        let mut scheduler = PlaybackScheduler::open(Box::new(output), PlaybackTimeline::new(1000)).unwrap();
        let timeline = scheduler.timeline();
        scheduler.schedule(seconds(1.0, 1000));

        scheduler.close();
        scheduler.close();
        drop(scheduler);

        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(lock_timeline(&timeline).pending(), 0);
    }

    #[test]
    fn test_timeline_follows_device_rate() {
        let output = SilentOutput {
            device_rate: Some(48000),
            ..Default::default()
        };
        let mut scheduler = PlaybackScheduler::open(Box::new(output), PlaybackTimeline::new(24000)).unwrap();
        let timeline = scheduler.timeline();
        assert_eq!(lock_timeline(&timeline).sample_rate(), 48000);

        // 0.5 s of 24 kHz speech lasts 0.5 s on the 48 kHz clock
        let first = scheduler.schedule(seconds(0.5, 24000));
        let second = scheduler.schedule(seconds(0.25, 24000));
        assert!(first.abs() < 1e-9);
        assert!((second - 0.5).abs() < 1e-9);
        assert!((scheduler.cursor() - 0.75).abs() < 1e-9);

        let mut out = vec![0.0; 36000];
        lock_timeline(&timeline).render(&mut out, 1);
        assert!(out.iter().all(|&s| (s - 0.2).abs() < 1e-6));
        let mut tail = vec![1.0; 10];
        lock_timeline(&timeline).render(&mut tail, 1);
        assert!(tail.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_speaking_holds_through_tail_after_reset() {
        let (mut scheduler, timeline) = scheduler_at(1000);
        scheduler.schedule(seconds(0.5, 1000));
        scheduler.schedule(seconds(0.5, 1000));

        advance(&timeline, 0.2);
        scheduler.reset();
        assert!(scheduler.is_speaking());
        assert_eq!(lock_timeline(&timeline).pending(), 1);

        advance(&timeline, 0.3);
        assert!(!scheduler.is_speaking());
    }
}
