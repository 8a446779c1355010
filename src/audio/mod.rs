//! # Audio Session Module
//!
//! Everything between the microphone, the speaker and the transport.
//!
//! ## Key Components:
//! - **Codec**: PCM16 little-endian and base64 conversions
//! - **Capture**: microphone tap emitting fixed 4096-sample frames
//! - **Buffer**: sample-accurate playback timeline rendered by the speaker
//! - **Playback**: gap-free scheduler with interruption reset
//! - **Session**: the controller state machine and its handle
//!
//! ## Audio Format Requirements:
//! - **Upstream**: 16 kHz, 16-bit PCM, mono, little-endian, tagged `audio/pcm;rate=16000`
//! - **Downstream**: 24 kHz, 16-bit PCM, mono, little-endian

pub mod buffer;
pub mod capture;
pub mod codec;
pub mod playback;
pub mod session;

pub use session::SessionHandle;
