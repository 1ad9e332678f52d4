//! Encoding and decoding of Live API frames.
//!
//! Outbound frames are always written in camelCase. Inbound frames are
//! accepted in either camelCase or snake_case; both spellings deserialize
//! into the same wire structs and are then flattened into [`InboundFrame`],
//! so nothing past this module ever sees the naming difference.

use crate::LiveError;
use crate::pcm::{AudioChunk, LIVE_OUTPUT_SAMPLE_RATE, rate_from_mime};
use tracing::debug;

// --- Wire types ---
mod wire {
    use serde::{Deserialize, Serialize};

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) enum ClientMessage {
        Setup(Setup),
        ClientContent(ClientContent),
        RealtimeInput(RealtimeInput),
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct Setup {
        pub model: String,
        pub generation_config: GenerationConfig,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub system_instruction: Option<Content>,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct GenerationConfig {
        pub response_modalities: Vec<ResponseModality>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub speech_config: Option<SpeechConfig>,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "UPPERCASE")]
    pub(super) enum ResponseModality {
        Audio,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct SpeechConfig {
        pub voice_config: VoiceConfig,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct VoiceConfig {
        pub prebuilt_voice_config: PrebuiltVoiceConfig,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct PrebuiltVoiceConfig {
        pub voice_name: String,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ClientContent {
        pub turns: Vec<Content>,
        pub turn_complete: bool,
    }

    #[derive(Serialize)]
    pub(super) struct Content {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub role: Option<String>,
        pub parts: Vec<Part>,
    }

    #[derive(Serialize)]
    pub(super) struct Part {
        pub text: String,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct RealtimeInput {
        pub media_chunks: Vec<Blob>,
    }

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct Blob {
        pub mime_type: String,
        pub data: String,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ServerMessage {
        #[serde(default, alias = "setup_complete")]
        pub setup_complete: Option<serde_json::Value>,
        #[serde(default, alias = "server_content")]
        pub server_content: Option<ServerContent>,
        #[serde(default)]
        pub error: Option<ServerError>,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ServerContent {
        #[serde(default, alias = "model_turn")]
        pub model_turn: Option<ServerTurn>,
        #[serde(default, alias = "turn_complete")]
        pub turn_complete: Option<bool>,
        #[serde(default)]
        pub interrupted: Option<bool>,
        #[serde(default, alias = "input_transcription")]
        pub input_transcription: Option<Transcription>,
        #[serde(default, alias = "output_transcription")]
        pub output_transcription: Option<Transcription>,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct ServerTurn {
        #[serde(default)]
        pub parts: Vec<ServerPart>,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ServerPart {
        #[serde(default)]
        pub text: Option<String>,
        #[serde(default, alias = "inline_data")]
        pub inline_data: Option<ServerBlob>,
    }

    #[derive(Deserialize, Debug)]
    #[serde(rename_all = "camelCase")]
    pub(super) struct ServerBlob {
        #[serde(default, alias = "mime_type")]
        pub mime_type: Option<String>,
        pub data: String,
    }

    #[derive(Deserialize, Debug)]
    pub(super) struct Transcription {
        #[serde(default)]
        pub text: String,
    }

    #[derive(Deserialize, Debug)]
    #[serde(untagged)]
    pub(super) enum ServerError {
        Detailed {
            #[serde(default)]
            message: String,
            #[serde(default)]
            status: Option<String>,
        },
        Plain(String),
    }
}

/// Parameters of the Setup frame that opens every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupConfig {
    /// Fully qualified model name, e.g. `models/gemini-2.0-flash-exp`.
    pub model: String,
    /// Prebuilt voice to speak with. Empty means the server default.
    pub voice_name: String,
    /// System instruction text. Empty means none.
    pub system_instruction: String,
}

/// The canonical form of one inbound frame.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// `setupComplete`: the server accepted the Setup frame.
    HandshakeAck,
    /// A slice of model output.
    Content(ContentPart),
    /// The server reported an error; the session cannot continue.
    Error { message: String },
    /// Anything unrecognised or malformed.
    Unknown,
}

/// Model output carried by one `serverContent` frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentPart {
    /// Audio parts, in the order they must be played.
    pub audio: Vec<AudioChunk>,
    /// Concatenated text parts of the model turn.
    pub text: Option<String>,
    /// Transcription of the model's own speech.
    pub output_transcript: Option<String>,
    /// Transcription of the user's speech.
    pub input_transcript: Option<String>,
    pub turn_complete: bool,
    /// The server cut the model off (user barge-in detected remotely).
    pub interrupted: bool,
}

fn encode(message: &wire::ClientMessage) -> Result<String, LiveError> {
    Ok(serde_json::to_string(message)?)
}

/// Encodes the Setup frame: audio-only responses with the configured voice.
pub fn encode_setup(config: &SetupConfig) -> Result<String, LiveError> {
    let speech_config = (!config.voice_name.is_empty()).then(|| wire::SpeechConfig {
        voice_config: wire::VoiceConfig {
            prebuilt_voice_config: wire::PrebuiltVoiceConfig {
                voice_name: config.voice_name.clone(),
            },
        },
    });
    let system_instruction = (!config.system_instruction.is_empty()).then(|| wire::Content {
        role: None,
        parts: vec![wire::Part {
            text: config.system_instruction.clone(),
        }],
    });
    encode(&wire::ClientMessage::Setup(wire::Setup {
        model: config.model.clone(),
        generation_config: wire::GenerationConfig {
            response_modalities: vec![wire::ResponseModality::Audio],
            speech_config,
        },
        system_instruction,
    }))
}

/// Encodes a completed user turn containing `text`.
pub fn encode_user_turn(text: &str) -> Result<String, LiveError> {
    encode(&wire::ClientMessage::ClientContent(wire::ClientContent {
        turns: vec![wire::Content {
            role: Some("user".to_string()),
            parts: vec![wire::Part {
                text: text.to_string(),
            }],
        }],
        turn_complete: true,
    }))
}

/// Encodes one captured microphone chunk as realtime input.
pub fn encode_audio_input(chunk: &AudioChunk) -> Result<String, LiveError> {
    encode(&wire::ClientMessage::RealtimeInput(wire::RealtimeInput {
        media_chunks: vec![wire::Blob {
            mime_type: chunk.mime_type(),
            data: chunk.to_base64(),
        }],
    }))
}

/// Decodes one raw inbound frame. Never fails: malformed input is `Unknown`.
pub fn decode_frame(raw: &str) -> InboundFrame {
    let message = match serde_json::from_str::<wire::ServerMessage>(raw) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "Discarding undecodable frame");
            return InboundFrame::Unknown;
        }
    };

    if let Some(error) = message.error {
        let message = match error {
            wire::ServerError::Detailed { message, status } => match status {
                Some(status) if message.is_empty() => status,
                _ => message,
            },
            wire::ServerError::Plain(message) => message,
        };
        return InboundFrame::Error { message };
    }
    if message.setup_complete.is_some() {
        return InboundFrame::HandshakeAck;
    }
    match message.server_content {
        Some(content) => normalize_content(content).unwrap_or(InboundFrame::Unknown),
        None => InboundFrame::Unknown,
    }
}

fn normalize_content(content: wire::ServerContent) -> Option<InboundFrame> {
    let mut part = ContentPart {
        turn_complete: content.turn_complete.unwrap_or(false),
        interrupted: content.interrupted.unwrap_or(false),
        input_transcript: content.input_transcription.map(|t| t.text),
        output_transcript: content.output_transcription.map(|t| t.text),
        ..ContentPart::default()
    };

    let mut text = String::new();
    for server_part in content.model_turn.map(|t| t.parts).unwrap_or_default() {
        if let Some(fragment) = server_part.text {
            text.push_str(&fragment);
        }
        if let Some(blob) = server_part.inline_data {
            let mime_type = blob.mime_type.unwrap_or_default();
            if !mime_type.is_empty() && !mime_type.starts_with("audio/pcm") {
                debug!(%mime_type, "Skipping non-PCM inline data");
                continue;
            }
            let rate = rate_from_mime(&mime_type).unwrap_or(LIVE_OUTPUT_SAMPLE_RATE);
            match AudioChunk::from_base64(&blob.data, rate) {
                Ok(chunk) => part.audio.push(chunk),
                Err(e) => {
                    debug!(error = %e, "Discarding frame with malformed audio payload");
                    return None;
                }
            }
        }
    }
    if !text.is_empty() {
        part.text = Some(text);
    }
    Some(InboundFrame::Content(part))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    fn parse(frame: &str) -> Value {
        serde_json::from_str(frame).unwrap()
    }

    #[test]
    fn test_encode_setup() {
        let frame = encode_setup(&SetupConfig {
            model: "models/gemini-2.0-flash-exp".into(),
            voice_name: "Puck".into(),
            system_instruction: "You are a chess coach.".into(),
        })
        .unwrap();

        assert_eq!(
            parse(&frame),
            json!({
                "setup": {
                    "model": "models/gemini-2.0-flash-exp",
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "speechConfig": {
                            "voiceConfig": { "prebuiltVoiceConfig": { "voiceName": "Puck" } }
                        }
                    },
                    "systemInstruction": { "parts": [{ "text": "You are a chess coach." }] }
                }
            })
        );
    }

    #[test]
    fn test_encode_setup_omits_empty_voice_and_instruction() {
        let frame = encode_setup(&SetupConfig {
            model: "models/m".into(),
            voice_name: String::new(),
            system_instruction: String::new(),
        })
        .unwrap();
        let value = parse(&frame);
        assert!(value["setup"]["generationConfig"].get("speechConfig").is_none());
        assert!(value["setup"].get("systemInstruction").is_none());
    }

    #[test]
    fn test_encode_user_turn_is_always_complete() {
        let frame = encode_user_turn("Nice move!").unwrap();
        assert_eq!(
            parse(&frame),
            json!({
                "clientContent": {
                    "turns": [{ "role": "user", "parts": [{ "text": "Nice move!" }] }],
                    "turnComplete": true
                }
            })
        );
    }

    #[test]
    fn test_encode_audio_input() {
        let chunk = AudioChunk::mono(vec![1, -1], 16_000);
        let value = parse(&encode_audio_input(&chunk).unwrap());
        let media = &value["realtimeInput"]["mediaChunks"][0];
        assert_eq!(media["mimeType"], "audio/pcm;rate=16000");
        assert_eq!(media["data"], chunk.to_base64());
    }

    #[test]
    fn test_decode_handshake_ack_both_spellings() {
        assert_eq!(decode_frame(r#"{"setupComplete":{}}"#), InboundFrame::HandshakeAck);
        assert_eq!(decode_frame(r#"{"setup_complete":{}}"#), InboundFrame::HandshakeAck);
    }

    #[test]
    fn test_decode_content_identical_across_spellings() {
        let audio = AudioChunk::mono(vec![100, -100, 7], 24_000).to_base64();
        let camel = json!({
            "serverContent": {
                "modelTurn": { "parts": [
                    { "inlineData": { "mimeType": "audio/pcm;rate=24000", "data": audio } },
                    { "text": "Good " },
                    { "text": "move." }
                ]},
                "turnComplete": true,
                "outputTranscription": { "text": "Good move." }
            }
        });
        let snake = json!({
            "server_content": {
                "model_turn": { "parts": [
                    { "inline_data": { "mime_type": "audio/pcm;rate=24000", "data": audio } },
                    { "text": "Good " },
                    { "text": "move." }
                ]},
                "turn_complete": true,
                "output_transcription": { "text": "Good move." }
            }
        });

        let from_camel = decode_frame(&camel.to_string());
        let from_snake = decode_frame(&snake.to_string());
        assert_eq!(from_camel, from_snake);

        let InboundFrame::Content(part) = from_camel else {
            panic!("expected content, got {from_camel:?}");
        };
        assert_eq!(part.audio, vec![AudioChunk::mono(vec![100, -100, 7], 24_000)]);
        assert_eq!(part.text.as_deref(), Some("Good move."));
        assert_eq!(part.output_transcript.as_deref(), Some("Good move."));
        assert!(part.turn_complete);
        assert!(!part.interrupted);
    }

    #[test]
    fn test_decode_audio_defaults_to_output_rate() {
        let audio = AudioChunk::mono(vec![1], 24_000).to_base64();
        let raw = json!({ "serverContent": { "modelTurn": { "parts": [
            { "inlineData": { "data": audio } }
        ]}}});
        let InboundFrame::Content(part) = decode_frame(&raw.to_string()) else {
            panic!("expected content");
        };
        assert_eq!(part.audio[0].sample_rate(), LIVE_OUTPUT_SAMPLE_RATE);
        assert!(!part.turn_complete);
    }

    #[test]
    fn test_decode_interrupted() {
        let InboundFrame::Content(part) =
            decode_frame(r#"{"serverContent":{"interrupted":true}}"#)
        else {
            panic!("expected content");
        };
        assert!(part.interrupted);
        assert!(part.audio.is_empty());
        assert!(part.text.is_none());
    }

    #[test]
    fn test_decode_error_frames() {
        assert_eq!(
            decode_frame(r#"{"error":{"message":"quota exceeded","code":429}}"#),
            InboundFrame::Error {
                message: "quota exceeded".into()
            }
        );
        assert_eq!(
            decode_frame(r#"{"error":{"status":"PERMISSION_DENIED"}}"#),
            InboundFrame::Error {
                message: "PERMISSION_DENIED".into()
            }
        );
        assert_eq!(
            decode_frame(r#"{"error":"boom"}"#),
            InboundFrame::Error {
                message: "boom".into()
            }
        );
    }

    #[test]
    fn test_decode_malformed_is_unknown() {
        assert_eq!(decode_frame("not json"), InboundFrame::Unknown);
        assert_eq!(decode_frame("42"), InboundFrame::Unknown);
        assert_eq!(decode_frame("{}"), InboundFrame::Unknown);
        assert_eq!(decode_frame(r#"{"usageMetadata":{"totalTokenCount":3}}"#), InboundFrame::Unknown);
        assert_eq!(
            decode_frame(r#"{"serverContent":{"modelTurn":{"parts":[{"inlineData":{"data":"%%%"}}]}}}"#),
            InboundFrame::Unknown
        );
        assert_eq!(decode_frame(r#"{"serverContent":"oops"}"#), InboundFrame::Unknown);
    }

    #[test]
    fn test_decode_skips_non_pcm_inline_data() {
        let raw = json!({ "serverContent": { "modelTurn": { "parts": [
            { "inlineData": { "mimeType": "image/png", "data": "AAAA" } },
            { "text": "hi" }
        ]}}});
        let InboundFrame::Content(part) = decode_frame(&raw.to_string()) else {
            panic!("expected content");
        };
        assert!(part.audio.is_empty());
        assert_eq!(part.text.as_deref(), Some("hi"));
    }
}
