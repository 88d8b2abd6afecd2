//! JSON wire messages of the bidirectional session service.
//!
//! Outbound messages are built from typed serde structs. Inbound messages
//! are decoded leniently from `serde_json::Value` since the service adds
//! fields freely; only the keys the session acts on are read.

use super::{ChannelEvent, SessionSetup, ToolInvocation};
use crate::audio::codec::MediaBlob;
use crate::error::{Result, SessionError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::debug;

/// Declared tool schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: ParameterSchema,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSchema {
    #[serde(rename = "type")]
    pub kind: String,
    pub properties: BTreeMap<String, PropertySchema>,
    pub required: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type")]
    pub kind: String,
    pub description: String,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<String>>,
}

impl PropertySchema {
    pub fn string(description: &str) -> Self {
        Self {
            kind: "STRING".to_owned(),
            description: description.to_owned(),
            allowed: None,
        }
    }

    pub fn one_of(description: &str, allowed: &[&str]) -> Self {
        Self {
            allowed: Some(allowed.iter().map(|s| (*s).to_owned()).collect()),
            ..Self::string(description)
        }
    }
}

/// Result of one tool invocation, echoed back with its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub id: String,
    pub name: String,
    pub response: Value,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupEnvelope<'a> {
    setup: SetupBody<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SetupBody<'a> {
    model: &'a str,
    generation_config: GenerationConfig<'a>,
    system_instruction: Content<'a>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ToolGroup<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig<'a> {
    response_modalities: [&'static str; 1],
    speech_config: SpeechConfig<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SpeechConfig<'a> {
    voice_config: VoiceConfigBody<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VoiceConfigBody<'a> {
    prebuilt_voice_config: PrebuiltVoice<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PrebuiltVoice<'a> {
    voice_name: &'a str,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolGroup<'a> {
    function_declarations: &'a [FunctionDeclaration],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInputEnvelope<'a> {
    realtime_input: RealtimeInput<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RealtimeInput<'a> {
    media_chunks: [&'a MediaBlob; 1],
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResponseEnvelope<'a> {
    tool_response: ToolResponseBody<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ToolResponseBody<'a> {
    function_responses: &'a [FunctionResponse],
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| SessionError::Protocol(e.to_string()))
}

/// The first message sent on every channel.
pub fn setup_message(setup: &SessionSetup) -> Result<String> {
    let tools = if setup.tools.is_empty() {
        Vec::new()
    } else {
        vec![ToolGroup {
            function_declarations: &setup.tools,
        }]
    };
    to_json(&SetupEnvelope {
        setup: SetupBody {
            model: &setup.model,
            generation_config: GenerationConfig {
                response_modalities: ["AUDIO"],
                speech_config: SpeechConfig {
                    voice_config: VoiceConfigBody {
                        prebuilt_voice_config: PrebuiltVoice {
                            voice_name: &setup.voice_name,
                        },
                    },
                },
            },
            system_instruction: Content {
                parts: [TextPart {
                    text: &setup.system_instruction,
                }],
            },
            tools,
        },
    })
}

pub fn realtime_input_message(media: &MediaBlob) -> Result<String> {
    to_json(&RealtimeInputEnvelope {
        realtime_input: RealtimeInput {
            media_chunks: [media],
        },
    })
}

pub fn tool_response_message(responses: &[FunctionResponse]) -> Result<String> {
    to_json(&ToolResponseEnvelope {
        tool_response: ToolResponseBody {
            function_responses: responses,
        },
    })
}

/// Decode one inbound server message into channel events.
///
/// Tool calls come first, then audio parts in order, then turn markers.
///
/// # Errors
///
/// Returns [`SessionError::Protocol`] if `text` is not a JSON object.
pub fn decode_server_message(text: &str) -> Result<Vec<ChannelEvent>> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| SessionError::Protocol(e.to_string()))?;
    let Some(msg) = value.as_object() else {
        return Err(SessionError::Protocol("server message is not an object".into()));
    };

    let mut events = Vec::new();

    if msg.contains_key("setupComplete") {
        debug!("remote setup complete");
    }

    if let Some(calls) = msg
        .get("toolCall")
        .and_then(|t| t.get("functionCalls"))
        .and_then(Value::as_array)
    {
        let invocations: Vec<ToolInvocation> = calls.iter().filter_map(parse_call).collect();
        if !invocations.is_empty() {
            events.push(ChannelEvent::ToolCall(invocations));
        }
    }

    if let Some(content) = msg.get("serverContent") {
        if let Some(parts) = content
            .get("modelTurn")
            .and_then(|t| t.get("parts"))
            .and_then(Value::as_array)
        {
            for part in parts {
                if let Some(blob) = part.get("inlineData").and_then(parse_audio_blob) {
                    events.push(ChannelEvent::AudioChunk(blob));
                }
            }
        }
        if content.get("interrupted").and_then(Value::as_bool) == Some(true) {
            debug!("remote turn interrupted");
        }
        if content.get("turnComplete").and_then(Value::as_bool) == Some(true) {
            events.push(ChannelEvent::TurnComplete);
        }
    }

    if let Some(go_away) = msg.get("goAway") {
        let left = go_away
            .get("timeLeft")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        events.push(ChannelEvent::Error(format!(
            "server is going away (time left: {left})"
        )));
    }

    Ok(events)
}

fn parse_call(call: &Value) -> Option<ToolInvocation> {
    let name = call.get("name").and_then(Value::as_str)?;
    let id = call
        .get("id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let arguments = call
        .get("args")
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    Some(ToolInvocation {
        id,
        name: name.to_owned(),
        arguments,
    })
}

fn parse_audio_blob(inline: &Value) -> Option<MediaBlob> {
    let mime_type = inline.get("mimeType").and_then(Value::as_str)?;
    if !mime_type.starts_with("audio/") {
        return None;
    }
    let data = inline.get("data").and_then(Value::as_str)?;
    Some(MediaBlob {
        mime_type: mime_type.to_owned(),
        data: data.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use serde_json::json;

    fn sample_setup() -> SessionSetup {
        let mut properties = BTreeMap::new();
        properties.insert("severity".to_owned(), PropertySchema::one_of("How bad", &["Low", "High"]));
        properties.insert("location".to_owned(), PropertySchema::string("Where"));
        SessionSetup {
            model: "models/test".into(),
            system_instruction: "be brief".into(),
            voice_name: "Kore".into(),
            tools: vec![FunctionDeclaration {
                name: "log_complaint".into(),
                description: "Log it".into(),
                parameters: ParameterSchema {
                    kind: "OBJECT".into(),
                    properties,
                    required: vec!["location".into()],
                },
            }],
            input_sample_rate: 16_000,
        }
    }

    #[test]
    fn setup_message_shape() {
        let json: Value = serde_json::from_str(&setup_message(&sample_setup()).unwrap()).unwrap();
        let setup = &json["setup"];
        assert_eq!(setup["model"], "models/test");
        assert_eq!(setup["generationConfig"]["responseModalities"], json!(["AUDIO"]));
        assert_eq!(
            setup["generationConfig"]["speechConfig"]["voiceConfig"]["prebuiltVoiceConfig"]["voiceName"],
            "Kore"
        );
        assert_eq!(setup["systemInstruction"]["parts"][0]["text"], "be brief");
        let decl = &setup["tools"][0]["functionDeclarations"][0];
        assert_eq!(decl["name"], "log_complaint");
        assert_eq!(decl["parameters"]["type"], "OBJECT");
        assert_eq!(decl["parameters"]["properties"]["severity"]["enum"], json!(["Low", "High"]));
        assert!(decl["parameters"]["properties"]["location"].get("enum").is_none());
        assert_eq!(decl["parameters"]["required"], json!(["location"]));
    }

    #[test]
    fn realtime_input_shape() {
        let blob = MediaBlob {
            mime_type: "audio/pcm;rate=16000".into(),
            data: "AAAA".into(),
        };
        let json: Value = serde_json::from_str(&realtime_input_message(&blob).unwrap()).unwrap();
        assert_eq!(
            json,
            json!({"realtimeInput": {"mediaChunks": [{"mimeType": "audio/pcm;rate=16000", "data": "AAAA"}]}})
        );
    }

    #[test]
    fn tool_response_shape() {
        let responses = vec![FunctionResponse {
            id: "call-1".into(),
            name: "log_complaint".into(),
            response: json!({"result": "success", "ticketId": "MAH-1234"}),
        }];
        let json: Value = serde_json::from_str(&tool_response_message(&responses).unwrap()).unwrap();
        assert_eq!(json["toolResponse"]["functionResponses"][0]["id"], "call-1");
        assert_eq!(
            json["toolResponse"]["functionResponses"][0]["response"]["ticketId"],
            "MAH-1234"
        );
    }

    #[test]
    fn tool_call_is_surfaced_before_audio() {
        let msg = json!({
            "serverContent": {"modelTurn": {"parts": [
                {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAAA"}},
                {"text": "ignored"},
                {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "BBBB"}}
            ]}},
            "toolCall": {"functionCalls": [
                {"id": "a", "name": "log_complaint", "args": {"category": "Water"}},
                {"id": "b", "name": "other"}
            ]}
        });
        let events = decode_server_message(&msg.to_string()).unwrap();
        assert_eq!(events.len(), 3);
        match &events[0] {
            ChannelEvent::ToolCall(calls) => {
                assert_eq!(calls.len(), 2);
                assert_eq!(calls[0].id, "a");
                assert_eq!(calls[0].arguments["category"], "Water");
                assert_eq!(calls[1].id, "b");
                assert!(calls[1].arguments.is_empty());
            }
            other => panic!("expected tool call first, got {other:?}"),
        }
        assert!(matches!(&events[1], ChannelEvent::AudioChunk(b) if b.data == "AAAA"));
        assert!(matches!(&events[2], ChannelEvent::AudioChunk(b) if b.data == "BBBB"));
    }

    #[test]
    fn non_audio_inline_data_is_ignored() {
        let msg = json!({"serverContent": {"modelTurn": {"parts": [
            {"inlineData": {"mimeType": "image/png", "data": "AAAA"}}
        ]}, "turnComplete": true}});
        let events = decode_server_message(&msg.to_string()).unwrap();
        assert_eq!(events, vec![ChannelEvent::TurnComplete]);
    }

    #[test]
    fn setup_complete_and_unknown_keys_yield_nothing() {
        assert!(decode_server_message(r#"{"setupComplete": {}}"#).unwrap().is_empty());
        assert!(decode_server_message(r#"{"usageMetadata": {"x": 1}}"#).unwrap().is_empty());
    }

    #[test]
    fn go_away_becomes_error_event() {
        let events = decode_server_message(r#"{"goAway": {"timeLeft": "5s"}}"#).unwrap();
        assert!(matches!(&events[0], ChannelEvent::Error(m) if m.contains("5s")));
    }

    #[test]
    fn garbage_is_protocol_error() {
        assert!(matches!(decode_server_message("not json"), Err(SessionError::Protocol(_))));
        assert!(matches!(decode_server_message("[1,2]"), Err(SessionError::Protocol(_))));
    }
}
