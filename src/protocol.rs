//! Live API wire types
//!
//! Outbound messages are serialized from typed structs. Inbound messages are
//! parsed leniently and flattened into a closed list of [`Inbound`] events;
//! anything the session does not act on becomes [`Inbound::Unrecognized`].

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::SessionConfig;

/// Result string acknowledged for every function call.
pub const TOOL_RESULT_DISPLAYED: &str = "Modal successfully displayed to user.";

/// Generation configuration for setup.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub response_modalities: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Content {
    pub parts: Vec<Part>,
}

/// Session setup message.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SetupMessage {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_instruction: Option<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<serde_json::Value>,
}

impl SetupMessage {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            model: config.model.clone(),
            generation_config: Some(GenerationConfig {
                response_modalities: vec![config.response_modality.as_str().to_string()],
            }),
            system_instruction: Some(Content {
                parts: vec![Part {
                    text: Some(config.system_instruction.clone()),
                }],
            }),
            tools: Some(config.tools()),
        }
    }
}

/// Base64 payload with its mime type.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Blob {
    pub data: String,
    pub mime_type: String,
}

/// A chunk of realtime input.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RealtimeInput {
    pub audio: Blob,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FunctionResult {
    pub result: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct FunctionResponse {
    pub id: String,
    pub response: FunctionResult,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ToolResponse {
    pub function_responses: Vec<FunctionResponse>,
}

impl ToolResponse {
    /// Acknowledge each id with the fixed "displayed" result.
    pub fn displayed<'a>(ids: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            function_responses: ids
                .into_iter()
                .map(|id| FunctionResponse {
                    id: id.to_string(),
                    response: FunctionResult {
                        result: TOOL_RESULT_DISPLAYED.to_string(),
                    },
                })
                .collect(),
        }
    }
}

/// Message sent from client to server.
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub enum ClientMessage {
    Setup(SetupMessage),
    RealtimeInput(RealtimeInput),
    ToolResponse(ToolResponse),
}

impl ClientMessage {
    /// Realtime audio input carrying one encoded capture window.
    pub fn audio(data: String, sample_rate: u32) -> Self {
        ClientMessage::RealtimeInput(RealtimeInput {
            audio: Blob {
                data,
                mime_type: format!("audio/pcm;rate={}", sample_rate),
            },
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// A single function call requested by the assistant.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionCall {
    pub id: String,
    pub name: String,
    pub args: serde_json::Value,
}

impl FunctionCall {
    /// Extract a call from its JSON form; `None` when `id` or `name` is missing.
    fn from_value(value: &serde_json::Value) -> Option<Self> {
        let id = value.get("id")?.as_str()?.to_string();
        let name = value.get("name")?.as_str()?.to_string();
        let args = value.get("args").cloned().unwrap_or(serde_json::Value::Null);
        Some(Self { id, name, args })
    }
}

/// Inbound protocol events, in the order they appear in a server message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    SetupComplete,
    /// One base64 S16LE chunk of synthesized speech.
    AudioDelta { data: String },
    /// One or more well-formed function calls.
    ToolCall(Vec<FunctionCall>),
    Interrupted,
    TurnComplete,
    GoAway,
    Unrecognized,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<serde_json::Value>,
    server_content: Option<ServerContent>,
    tool_call: Option<serde_json::Value>,
    go_away: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerContent {
    model_turn: Option<ModelTurn>,
    #[serde(default)]
    interrupted: bool,
    #[serde(default)]
    turn_complete: bool,
}

#[derive(Debug, Deserialize, Default)]
struct ModelTurn {
    #[serde(default)]
    parts: Vec<ServerPart>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ServerPart {
    text: Option<String>,
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize, Default)]
struct InlineData {
    data: Option<String>,
}

/// Parse one text frame from the server into inbound events.
pub fn parse_server_message(text: &str) -> Vec<Inbound> {
    let message = match serde_json::from_str::<ServerMessage>(text) {
        Ok(message) => message,
        Err(e) => {
            warn!("Failed to parse server message: {}", e);
            return vec![Inbound::Unrecognized];
        }
    };

    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(Inbound::SetupComplete);
    }

    if let Some(tool_call) = &message.tool_call {
        let calls = parse_function_calls(tool_call);
        if calls.is_empty() {
            debug!("Ignoring tool call without well-formed function calls: {}", tool_call);
        } else {
            events.push(Inbound::ToolCall(calls));
        }
    }

    if let Some(content) = message.server_content {
        if let Some(turn) = content.model_turn {
            for part in turn.parts {
                if let Some(data) = part.inline_data.and_then(|d| d.data) {
                    events.push(Inbound::AudioDelta { data });
                } else if let Some(text) = part.text {
                    debug!("Model text part: {}", text);
                }
            }
        }
        if content.interrupted {
            events.push(Inbound::Interrupted);
        }
        if content.turn_complete {
            events.push(Inbound::TurnComplete);
        }
    }

    if message.go_away.is_some() {
        events.push(Inbound::GoAway);
    }

    if events.is_empty() {
        events.push(Inbound::Unrecognized);
    }
    events
}

fn parse_function_calls(tool_call: &serde_json::Value) -> Vec<FunctionCall> {
    let Some(calls) = tool_call.get("functionCalls").and_then(|c| c.as_array()) else {
        return Vec::new();
    };
    calls
        .iter()
        .filter_map(|call| {
            let parsed = FunctionCall::from_value(call);
            if parsed.is_none() {
                debug!("Dropping malformed function call: {}", call);
            }
            parsed
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_setup_serialization() {
        let msg = ClientMessage::Setup(SetupMessage::from_config(&SessionConfig::default()));
        let parsed: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();

        assert!(parsed["setup"]["model"].as_str().unwrap().starts_with("models/"));
        assert_eq!(parsed["setup"]["generationConfig"]["responseModalities"][0], "AUDIO");
        assert!(parsed["setup"]["systemInstruction"]["parts"][0]["text"]
            .as_str()
            .unwrap()
            .contains("LEAD QUALIFICATION"));
        assert_eq!(
            parsed["setup"]["tools"][0]["functionDeclarations"][0]["name"],
            "reviewBookingDetails"
        );
    }

    #[test]
    fn test_audio_input_serialization() {
        let msg = ClientMessage::audio("AAAA".to_string(), 16_000);
        let parsed: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        assert_eq!(parsed["realtimeInput"]["audio"]["data"], "AAAA");
        assert_eq!(parsed["realtimeInput"]["audio"]["mimeType"], "audio/pcm;rate=16000");
    }

    #[test]
    fn test_tool_response_serialization() {
        let msg = ClientMessage::ToolResponse(ToolResponse::displayed(["c1", "c2"]));
        let parsed: serde_json::Value = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        let responses = parsed["toolResponse"]["functionResponses"].as_array().unwrap();
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["id"], "c1");
        assert_eq!(responses[1]["id"], "c2");
        assert_eq!(responses[0]["response"]["result"], TOOL_RESULT_DISPLAYED);
    }

    #[test]
    fn test_parse_audio_and_interrupted() {
        let text = json!({
            "serverContent": {
                "modelTurn": {"parts": [
                    {"inlineData": {"mimeType": "audio/pcm;rate=24000", "data": "AAEC"}},
                    {"text": "thinking"},
                    {"inlineData": {"data": "AwQF"}}
                ]},
                "interrupted": true
            }
        })
        .to_string();

        assert_eq!(
            parse_server_message(&text),
            vec![
                Inbound::AudioDelta { data: "AAEC".to_string() },
                Inbound::AudioDelta { data: "AwQF".to_string() },
                Inbound::Interrupted,
            ]
        );
    }

    #[test]
    fn test_parse_tool_call_drops_malformed_entries() {
        let text = json!({
            "toolCall": {"functionCalls": [
                {"name": "reviewBookingDetails", "args": {"firstName": "Sam"}, "id": "c1"},
                {"name": "reviewBookingDetails", "args": {}},
                {"id": "c3"}
            ]}
        })
        .to_string();

        match parse_server_message(&text).as_slice() {
            [Inbound::ToolCall(calls)] => {
                assert_eq!(calls.len(), 1);
                assert_eq!(calls[0].id, "c1");
                assert_eq!(calls[0].args["firstName"], "Sam");
            }
            other => panic!("Unexpected events: {:?}", other),
        }
    }

    #[test]
    fn test_parse_lifecycle_and_unknown() {
        assert_eq!(
            parse_server_message(&json!({"setupComplete": {}}).to_string()),
            vec![Inbound::SetupComplete]
        );
        assert_eq!(
            parse_server_message(&json!({"goAway": {"timeLeft": "10s"}}).to_string()),
            vec![Inbound::GoAway]
        );
        assert_eq!(
            parse_server_message(&json!({"usageMetadata": {}}).to_string()),
            vec![Inbound::Unrecognized]
        );
        assert_eq!(parse_server_message("{not json"), vec![Inbound::Unrecognized]);
        assert_eq!(
            parse_server_message(&json!({"toolCall": {"functionCalls": "nope"}}).to_string()),
            vec![Inbound::Unrecognized]
        );
    }
}
