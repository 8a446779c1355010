//! # Playback Timeline
//!
//! Sample-accurate queue of scheduled speech buffers plus the output clock
//! they are scheduled against. The speaker callback renders from it; the
//! playback scheduler enqueues into it.
//!
//! ## Key Features:
//! - **Output clock**: `now()` is frames rendered so far divided by the output rate
//! - **Gap filling**: frames with no buffer scheduled render as silence
//! - **Non-overlap**: entries are kept ordered and never overlap in frames
//! - **Speaking signal**: flips when "now" enters or leaves a scheduled buffer
//! - **Thread safety**: shared between the session loop and the audio thread
//!   through `Arc<Mutex<...>>`

use crate::audio::codec::PlaybackBuffer;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// Timeline shared between the session loop and the output device callback.
pub type SharedTimeline = Arc<Mutex<PlaybackTimeline>>;

/// Lock the shared timeline, recovering the data if a callback panicked mid-render.
pub fn lock_timeline(timeline: &SharedTimeline) -> MutexGuard<'_, PlaybackTimeline> {
    timeline.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A buffer placed on the timeline.
#[derive(Debug, Clone)]
struct ScheduledBuffer {
    /// First output frame of this buffer
    start_frame: u64,
    samples: Vec<f32>,
}

impl ScheduledBuffer {
    fn end_frame(&self) -> u64 {
        self.start_frame + self.samples.len() as u64
    }

    fn contains(&self, frame: u64) -> bool {
        self.start_frame <= frame && frame < self.end_frame()
    }
}

/// Ordered, non-overlapping playback queue with its own clock.
pub struct PlaybackTimeline {
    /// Output rate in Hz
    sample_rate: u32,

    /// Frames rendered since the timeline was created
    position: u64,

    /// Scheduled buffers ordered by start frame
    queue: VecDeque<ScheduledBuffer>,

    /// Whether "now" currently falls inside a scheduled buffer
    speaking: bool,

    /// Observers of the speaking flag
    speaking_tx: Option<Arc<watch::Sender<bool>>>,
}

impl PlaybackTimeline {
    /// Create an empty timeline at the given output rate.
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            position: 0,
            queue: VecDeque::new(),
            speaking: false,
            speaking_tx: None,
        }
    }

    /// Publish speaking transitions on a watch channel.
    pub fn with_speaking_signal(mut self, speaking_tx: Arc<watch::Sender<bool>>) -> Self {
        self.speaking_tx = Some(speaking_tx);
        self
    }

    /// Move the clock to another output rate. Only meaningful before anything
    /// has been rendered or scheduled.
    pub fn with_sample_rate(mut self, sample_rate: u32) -> Self {
        debug_assert!(self.position == 0 && self.queue.is_empty());
        self.sample_rate = sample_rate;
        self
    }

    /// Wrap into the shared form used by the scheduler and the device callback.
    pub fn into_shared(self) -> SharedTimeline {
        Arc::new(Mutex::new(self))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Current output clock time in seconds.
    pub fn now(&self) -> f64 {
        self.position as f64 / self.sample_rate as f64
    }

    /// Number of buffers waiting or playing.
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Place a buffer on the timeline starting at `start_seconds`.
    ///
    /// ## Calculations:
    /// - **start_frame**: `round(start_seconds * sample_rate)`, never earlier than
    ///   the current position
    /// - **samples**: expected at the output rate already; a buffer at another
    ///   rate is resampled here as a fallback
    ///
    /// An entry still running at `start_frame` is cut there. Back-to-back
    /// scheduling never hits that case; it only happens right after an
    /// interruption, when fresh speech supersedes the tail of the old turn.
    ///
    /// Returns the start time actually used, in seconds.
    pub fn enqueue(&mut self, start_seconds: f64, buffer: PlaybackBuffer) -> f64 {
        let samples = if buffer.sample_rate == self.sample_rate {
            buffer.samples
        } else {
            resample_linear(&buffer.samples, buffer.sample_rate, self.sample_rate)
        };

        let requested = (start_seconds.max(0.0) * self.sample_rate as f64).round() as u64;
        let start_frame = requested.max(self.position);

        self.queue.retain(|b| b.start_frame < start_frame);
        if let Some(last) = self.queue.back_mut() {
            if last.end_frame() > start_frame {
                let keep = (start_frame - last.start_frame) as usize;
                last.samples.truncate(keep);
            }
        }

        if !samples.is_empty() {
            self.queue.push_back(ScheduledBuffer { start_frame, samples });
        }
        self.refresh_speaking();

        start_frame as f64 / self.sample_rate as f64
    }

    /// Drop every buffer that has not started yet.
    ///
    /// The buffer currently playing, if any, is kept and finishes naturally.
    pub fn discard_pending(&mut self) -> usize {
        let position = self.position;
        let before = self.queue.len();
        self.queue.retain(|b| b.start_frame <= position);
        let dropped = before - self.queue.len();
        self.refresh_speaking();
        dropped
    }

    /// Drop everything, including the buffer currently playing.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.refresh_speaking();
    }

    /// Render the next `out.len() / channels` frames into an interleaved slice.
    ///
    /// Each output frame copies the mono sample to every channel; frames with
    /// nothing scheduled are silent. Advances the clock.
    pub fn render(&mut self, out: &mut [f32], channels: usize) {
        let channels = channels.max(1);
        for frame in out.chunks_mut(channels) {
            let value = self.next_sample();
            for slot in frame.iter_mut() {
                *slot = value;
            }
        }
        self.refresh_speaking();
    }

    fn next_sample(&mut self) -> f32 {
        let frame = self.position;
        self.position += 1;

        while let Some(front) = self.queue.front() {
            if front.end_frame() <= frame {
                self.queue.pop_front();
            } else {
                break;
            }
        }

        match self.queue.front() {
            Some(front) if front.contains(frame) => front.samples[(frame - front.start_frame) as usize],
            _ => 0.0,
        }
    }

    fn refresh_speaking(&mut self) {
        let now = self.position;
        let speaking = self.queue.iter().any(|b| b.contains(now));
        if speaking != self.speaking {
            self.speaking = speaking;
            if let Some(tx) = &self.speaking_tx {
                tx.send_replace(speaking);
            }
        }
    }
}

/// Linear-interpolation resampler for mono speech.
///
/// Converts synthesized speech to the output device rate.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if samples.is_empty() || from_rate == 0 || to_rate == 0 || from_rate == to_rate {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = ((samples.len() as f64) / ratio).round() as usize;
    let last = samples.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = (pos.floor() as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = (pos - idx as f64) as f32;
            samples[idx] * (1.0 - frac) + samples[next] * frac
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize, value: f32, rate: u32) -> PlaybackBuffer {
        PlaybackBuffer::new(vec![value; len], rate)
    }

    #[test]
    fn test_render_plays_back_to_back_with_silence_in_gaps() {
        let mut timeline = PlaybackTimeline::new(10);
        timeline.enqueue(0.2, tone(3, 0.5, 10));
        timeline.enqueue(0.5, tone(2, -0.5, 10));

        let mut out = vec![9.0; 8];
        timeline.render(&mut out, 1);
        assert_eq!(out, vec![0.0, 0.0, 0.5, 0.5, 0.5, -0.5, -0.5, 0.0]);
        assert_eq!(timeline.pending(), 0);
        assert!((timeline.now() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_render_duplicates_into_channels() {
        let mut timeline = PlaybackTimeline::new(10);
        timeline.enqueue(0.0, PlaybackBuffer::new(vec![0.1, 0.2], 10));
        let mut out = vec![0.0; 4];
        timeline.render(&mut out, 2);
        assert_eq!(out, vec![0.1, 0.1, 0.2, 0.2]);
    }

    #[test]
    fn test_enqueue_cuts_tail_it_overlaps() {
        let mut timeline = PlaybackTimeline::new(10);
        timeline.enqueue(0.0, tone(5, 0.1, 10));
        // A start inside the first buffer supersedes the rest of it
        let second = timeline.enqueue(0.2, tone(2, 0.9, 10));
        assert!((second - 0.2).abs() < 1e-9);

        let mut out = vec![0.0; 5];
        timeline.render(&mut out, 1);
        assert_eq!(out, vec![0.1, 0.1, 0.9, 0.9, 0.0]);
    }

    #[test]
    fn test_enqueue_never_starts_in_the_past() {
        let mut timeline = PlaybackTimeline::new(10);
        let mut out = vec![0.0; 3];
        timeline.render(&mut out, 1);
        let start = timeline.enqueue(0.0, tone(1, 0.2, 10));
        assert!((start - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_speaking_flag_follows_buffer_boundaries() {
        let (tx, rx) = watch::channel(false);
        let mut timeline = PlaybackTimeline::new(10).with_speaking_signal(Arc::new(tx));
        timeline.enqueue(0.1, tone(2, 0.3, 10));
        assert!(!timeline.is_speaking());

        let mut out = vec![0.0; 1];
        timeline.render(&mut out, 1);
        assert!(timeline.is_speaking());
        assert!(*rx.borrow());

        let mut out = vec![0.0; 2];
        timeline.render(&mut out, 1);
        assert!(!timeline.is_speaking());
        assert!(!*rx.borrow());
    }

    #[test]
    fn test_discard_pending_keeps_the_playing_buffer() {
        let mut timeline = PlaybackTimeline::new(10);
        timeline.enqueue(0.0, tone(4, 0.5, 10));
        timeline.enqueue(0.4, tone(4, 0.7, 10));

        let mut out = vec![0.0; 2];
        timeline.render(&mut out, 1);
        assert_eq!(timeline.discard_pending(), 1);
        assert!(timeline.is_speaking());

        let mut out = vec![0.0; 4];
        timeline.render(&mut out, 1);
        assert_eq!(out, vec![0.5, 0.5, 0.0, 0.0]);
    }

    #[test]
    fn test_resample_linear_length() {
        let samples = vec![0.0; 24000];
        assert_eq!(resample_linear(&samples, 24000, 48000).len(), 48000);
        assert_eq!(resample_linear(&samples, 24000, 16000).len(), 16000);
    }
}
