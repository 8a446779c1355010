//! # PCM Codec
//!
//! Pure conversions used on both directions of the live session:
//!
//! - **Upstream**: microphone `f32` samples → PCM16 little-endian bytes → base64 text
//! - **Downstream**: base64 text → PCM16 little-endian bytes → `f32` playback samples
//!
//! No state is kept here; every function is safe to call from any thread.

use crate::error::{SessionError, SessionResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::Cursor;

/// Full-scale factor between normalized floats and signed 16-bit integers.
const PCM16_SCALE: f32 = 32768.0;

/// Rate of the speech the live service synthesizes.
pub const SERVER_AUDIO_RATE: u32 = 24_000;

/// One fixed-size block of microphone samples.
///
/// Frames are produced by the capture bridge, encoded once, and dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Samples normalized to [-1.0, 1.0]
    pub samples: Vec<f32>,
    /// Capture rate in Hz (16000 for the live service)
    pub sample_rate: u32,
    /// Position of this frame in capture order, starting at 0
    pub sequence: u64,
}

/// A frame ready for the wire: base64 PCM16 plus its media type tag.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedInputChunk {
    pub data: String,
    pub mime_type: String,
}

/// Decoded speech ready to be scheduled on the output clock.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PlaybackBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    /// Duration in seconds: samples / sample_rate.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Media type tag for linear PCM at the given rate, e.g. `audio/pcm;rate=16000`.
pub fn pcm_mime_type(sample_rate: u32) -> String {
    format!("audio/pcm;rate={}", sample_rate)
}

/// Convert normalized samples to signed 16-bit little-endian bytes.
///
/// Out-of-range input is clamped, never rejected. The scaled value is
/// truncated toward zero and saturates at `i16::MAX`, so `1.0` becomes 32767.
pub fn samples_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
        let value = (clamped * PCM16_SCALE).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
        // Writing into a Vec cannot fail
        let _ = bytes.write_i16::<LittleEndian>(value);
    }
    bytes
}

/// Convert signed 16-bit little-endian bytes back to normalized samples.
///
/// ## Errors:
/// `MalformedAudioData` when the byte length is odd.
pub fn pcm16_to_samples(bytes: &[u8]) -> SessionResult<Vec<f32>> {
    if bytes.len() % 2 != 0 {
        return Err(SessionError::MalformedAudioData(format!(
            "PCM16 payload has odd length {}",
            bytes.len()
        )));
    }

    let mut cursor = Cursor::new(bytes);
    let mut samples = Vec::with_capacity(bytes.len() / 2);
    while let Ok(value) = cursor.read_i16::<LittleEndian>() {
        samples.push(value as f32 / PCM16_SCALE);
    }
    Ok(samples)
}

/// Text-safe encoding for binary audio (standard base64 with padding).
pub fn bytes_to_transport_text(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Inverse of [`bytes_to_transport_text`].
///
/// ## Errors:
/// `MalformedAudioData` on any character or padding the encoding cannot produce.
pub fn transport_text_to_bytes(text: &str) -> SessionResult<Vec<u8>> {
    STANDARD
        .decode(text)
        .map_err(|e| SessionError::MalformedAudioData(format!("invalid base64 payload: {}", e)))
}

/// Encode one captured frame for the realtime input message.
pub fn encode_frame(frame: &AudioFrame) -> EncodedInputChunk {
    EncodedInputChunk {
        data: bytes_to_transport_text(&samples_to_pcm16(&frame.samples)),
        mime_type: pcm_mime_type(frame.sample_rate),
    }
}

/// Decode one server audio payload into a playback buffer.
pub fn decode_server_audio(text: &str, sample_rate: u32) -> SessionResult<PlaybackBuffer> {
    let bytes = transport_text_to_bytes(text)?;
    let samples = pcm16_to_samples(&bytes)?;
    Ok(PlaybackBuffer::new(samples, sample_rate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pcm16_layout_is_little_endian() {
        let bytes = samples_to_pcm16(&[0.0, 0.5, -0.5, -1.0]);
        assert_eq!(bytes, vec![0x00, 0x00, 0x00, 0x40, 0x00, 0xC0, 0x00, 0x80]);
    }

    #[test]
    fn test_out_of_range_samples_are_clamped() {
        let bytes = samples_to_pcm16(&[1.0, 3.5, -7.0, f32::NAN]);
        let values: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        assert_eq!(values, vec![i16::MAX, i16::MAX, i16::MIN, 0]);
    }

    #[test]
    fn test_pcm_conversion_within_one_step() {
        let original: Vec<f32> = (0..2000)
            .map(|i| ((i as f32) * 0.013).sin() * 0.95)
            .chain([1.0, -1.0, 0.0, 0.999, -0.999])
            .collect();

        let restored = pcm16_to_samples(&samples_to_pcm16(&original)).unwrap();
        assert_eq!(restored.len(), original.len());

        let step = 1.0 / PCM16_SCALE;
        for (a, b) in original.iter().zip(restored.iter()) {
            assert!((a - b).abs() <= step, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_odd_length_is_malformed() {
        let err = pcm16_to_samples(&[0u8; 15]).unwrap_err();
        assert!(matches!(err, SessionError::MalformedAudioData(_)));
    }

    #[test]
    fn test_transport_text_preserves_every_byte() {
        let all_bytes: Vec<u8> = (0..=255u8).chain((0..=255u8).rev()).collect();
        for len in [0, 1, 2, 3, 255, all_bytes.len()] {
            let slice = &all_bytes[..len];
            let text = bytes_to_transport_text(slice);
            assert!(text.is_ascii());
            assert_eq!(transport_text_to_bytes(&text).unwrap(), slice);
        }
    }

    #[test]
    fn test_invalid_transport_text_is_malformed() {
        for bad in ["not base64!", "QUJD=", "QQ"] {
            let err = transport_text_to_bytes(bad).unwrap_err();
            assert!(matches!(err, SessionError::MalformedAudioData(_)), "{}", bad);
        }
    }

    #[test]
    fn test_encode_frame_tags_mime_type() {
        let frame = AudioFrame { samples: vec![0.25; 4096], sample_rate: 16000, sequence: 0 };
        let chunk = encode_frame(&frame);
        assert_eq!(chunk.mime_type, "audio/pcm;rate=16000");
        assert_eq!(transport_text_to_bytes(&chunk.data).unwrap().len(), 8192);
    }

    #[test]
    fn test_decode_server_audio_duration() {
        // 12000 samples at 24kHz = 0.5s
        let text = bytes_to_transport_text(&vec![0u8; 24000]);
        let buffer = decode_server_audio(&text, 24000).unwrap();
        assert_eq!(buffer.samples.len(), 12000);
        assert!((buffer.duration() - 0.5).abs() < 1e-9);
    }
}
