//! # Live Service Wire Messages
//!
//! Serde types for the JSON messages exchanged with the BidiGenerateContent
//! endpoint. Field names follow the service's camelCase convention.
//!
//! ## Client → server:
//! - `setup`: sent once, right after the socket opens
//! - `realtimeInput`: one per captured frame
//!
//! ## Server → client:
//! - `setupComplete`: the session is ready for input
//! - `serverContent`: synthesized audio parts and/or an interruption flag
//! - `goAway`: the server will close the connection soon

use crate::audio::codec::EncodedInputChunk;
use crate::config::LiveConfig;
use serde::{Deserialize, Serialize};

/// First message on every connection.
#[derive(Debug, Clone, Serialize)]
pub struct SetupMessage {
    pub setup: Setup,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Setup {
    pub model: String,
    pub generation_config: GenerationConfig,
    pub system_instruction: Content,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub response_modalities: Vec<String>,
    pub speech_config: SpeechConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SpeechConfig {
    pub voice_config: VoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceConfig {
    pub prebuilt_voice_config: PrebuiltVoiceConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrebuiltVoiceConfig {
    pub voice_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct Content {
    pub parts: Vec<TextPart>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TextPart {
    pub text: String,
}

impl SetupMessage {
    /// Build the setup message for an audio-only session.
    pub fn from_config(live: &LiveConfig) -> Self {
        let model = if live.model.starts_with("models/") {
            live.model.clone()
        } else {
            format!("models/{}", live.model)
        };

        Self {
            setup: Setup {
                model,
                generation_config: GenerationConfig {
                    response_modalities: vec!["AUDIO".to_string()],
                    speech_config: SpeechConfig {
                        voice_config: VoiceConfig {
                            prebuilt_voice_config: PrebuiltVoiceConfig {
                                voice_name: live.voice.clone(),
                            },
                        },
                    },
                },
                system_instruction: Content {
                    parts: vec![TextPart {
                        text: live.system_instruction.clone(),
                    }],
                },
            },
        }
    }
}

/// One captured frame on its way upstream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInputMessage {
    pub realtime_input: RealtimeInput,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RealtimeInput {
    pub media_chunks: Vec<MediaChunk>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaChunk {
    pub data: String,
    pub mime_type: String,
}

impl From<EncodedInputChunk> for RealtimeInputMessage {
    fn from(chunk: EncodedInputChunk) -> Self {
        Self {
            realtime_input: RealtimeInput {
                media_chunks: vec![MediaChunk {
                    data: chunk.data,
                    mime_type: chunk.mime_type,
                }],
            },
        }
    }
}

/// Anything the server sends. Unknown fields are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerMessage {
    #[serde(default)]
    pub setup_complete: Option<serde_json::Value>,
    #[serde(default)]
    pub server_content: Option<ServerContent>,
    #[serde(default)]
    pub go_away: Option<GoAway>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerContent {
    #[serde(default)]
    pub model_turn: Option<ModelTurn>,
    #[serde(default)]
    pub interrupted: Option<bool>,
    #[serde(default)]
    pub turn_complete: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ModelTurn {
    #[serde(default)]
    pub parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Part {
    #[serde(default)]
    pub inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub data: String,
    #[serde(default)]
    pub mime_type: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GoAway {
    #[serde(default)]
    pub time_left: Option<String>,
}

impl ServerMessage {
    pub fn is_setup_complete(&self) -> bool {
        self.setup_complete.is_some()
    }

    /// Every inline audio payload of the model turn, in part order.
    ///
    /// Parts tagged with a non-audio MIME type are skipped; untagged parts
    /// are treated as audio.
    pub fn audio_payloads(&self) -> Vec<&str> {
        self.server_content
            .as_ref()
            .and_then(|content| content.model_turn.as_ref())
            .map(|turn| {
                turn.parts
                    .iter()
                    .filter_map(|part| part.inline_data.as_ref())
                    .filter(|inline| inline.is_audio())
                    .map(|inline| inline.data.as_str())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn is_interrupted(&self) -> bool {
        self.server_content
            .as_ref()
            .and_then(|content| content.interrupted)
            .unwrap_or(false)
    }

    pub fn is_turn_complete(&self) -> bool {
        self.server_content
            .as_ref()
            .and_then(|content| content.turn_complete)
            .unwrap_or(false)
    }
}

impl InlineData {
    fn is_audio(&self) -> bool {
        self.mime_type
            .as_deref()
            .map_or(true, |mime| mime.starts_with("audio/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use serde_json::json;

    #[test]
    fn test_setup_message_shape() {
        let mut live = AppConfig::default().live;
        live.model = "gemini-test".to_string();
        live.voice = "Zephyr".to_string();
        live.system_instruction = "Be brief.".to_string();

        let value = serde_json::to_value(SetupMessage::from_config(&live)).unwrap();
        assert_eq!(
            value,
            json!({
                "setup": {
                    "model": "models/gemini-test",
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "speechConfig": {
                            "voiceConfig": {"prebuiltVoiceConfig": {"voiceName": "Zephyr"}}
                        }
                    },
                    "systemInstruction": {"parts": [{"text": "Be brief."}]}
                }
            })
        );
    }

    #[test]
    fn test_model_prefix_not_doubled() {
        let mut live = AppConfig::default().live;
        live.model = "models/already-prefixed".to_string();
        assert_eq!(SetupMessage::from_config(&live).setup.model, "models/already-prefixed");
    }

    #[test]
    fn test_realtime_input_shape() {
        let chunk = EncodedInputChunk {
            data: "AAAA".to_string(),
            mime_type: "audio/pcm;rate=16000".to_string(),
        };
        let value = serde_json::to_value(RealtimeInputMessage::from(chunk)).unwrap();
        assert_eq!(
            value,
            json!({"realtimeInput": {"mediaChunks": [{"data": "AAAA", "mimeType": "audio/pcm;rate=16000"}]}})
        );
    }

    #[test]
    fn test_parse_setup_complete() {
        let msg: ServerMessage = serde_json::from_str(r#"{"setupComplete": {}}"#).unwrap();
        assert!(msg.is_setup_complete());
        assert!(msg.audio_payloads().is_empty());
    }

    #[test]
    fn test_parse_every_audio_part() {
        let raw = r#"{
            "serverContent": {
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAA="}},
                    {"text": "ignored"},
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AQI="}}
                ]}
            }
        }"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.audio_payloads(), vec!["AAA=", "AQI="]);
        assert!(!msg.is_interrupted());
    }

    #[test]
    fn test_parse_interrupted_and_go_away() {
        let msg: ServerMessage = serde_json::from_str(r#"{"serverContent": {"interrupted": true}}"#).unwrap();
        assert!(msg.is_interrupted());

        let msg: ServerMessage = serde_json::from_str(r#"{"goAway": {"timeLeft": "10s"}}"#).unwrap();
        assert_eq!(msg.go_away.and_then(|g| g.time_left).as_deref(), Some("10s"));
    }

    #[test]
    fn test_non_audio_parts_are_skipped() {
        let raw = r#"{
            "serverContent": {
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "image/png", "data": "iVBO"}},
                    {"inlineData": {"data": "AAA="}}
                ]},
                "turnComplete": true
            }
        }"#;
        let msg: ServerMessage = serde_json::from_str(raw).unwrap();
        assert_eq!(msg.audio_payloads(), vec!["AAA="]);
        assert!(msg.is_turn_complete());
    }
}
