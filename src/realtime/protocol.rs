//! Wire types for the realtime model socket. Inbound events are typed;
//! outbound events are composed as JSON where they are sent.

use serde::Deserialize;

/// Server events we act on; everything else falls through to `Other`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(rename = "session.updated")]
    SessionUpdated,
    #[serde(rename = "input_audio_buffer.speech_started")]
    SpeechStarted,
    #[serde(rename = "response.output_audio.delta")]
    OutputAudioDelta { delta: String },
    #[serde(rename = "response.output_audio_transcript.done")]
    OutputTranscriptDone { transcript: String },
    #[serde(rename = "conversation.item.input_audio_transcription.delta")]
    InputTranscriptionDelta {
        item_id: String,
        #[serde(default)]
        delta: Option<String>,
    },
    #[serde(rename = "conversation.item.input_audio_transcription.completed")]
    InputTranscriptionCompleted {
        item_id: String,
        #[serde(default)]
        transcript: Option<String>,
    },
    #[serde(rename = "response.done")]
    ResponseDone { response: ResponseDetails },
    #[serde(rename = "error")]
    Error { error: serde_json::Value },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResponseDetails {
    #[serde(default)]
    pub output: Vec<OutputItem>,
}

#[derive(Debug, Deserialize)]
pub struct OutputItem {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
    #[serde(default)]
    pub call_id: Option<String>,
}

/// A function call the model asked for, pulled out of a completed
/// response.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub call_id: Option<String>,
    pub kind: ToolCallKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallKind {
    Hangup { reason: String },
    SendDtmf { digits: String },
}

/// Extract tool calls from `response.done` output, in order. Dispatching
/// only from the completed response keeps a duplicated intermediate
/// event from firing the same hangup twice.
pub fn tool_calls(response: &ResponseDetails) -> Vec<ToolCall> {
    response
        .output
        .iter()
        .filter(|item| item.kind == "function_call")
        .filter_map(|item| {
            let args: serde_json::Value = item
                .arguments
                .as_deref()
                .and_then(|raw| serde_json::from_str(raw).ok())
                .unwrap_or_default();
            let kind = match item.name.as_deref() {
                Some("hangup") => ToolCallKind::Hangup {
                    reason: args["reason"].as_str().unwrap_or("unspecified").to_string(),
                },
                Some("send_dtmf") => ToolCallKind::SendDtmf {
                    digits: args["digits"].as_str().unwrap_or_default().to_string(),
                },
                _ => return None,
            };
            Some(ToolCall {
                call_id: item.call_id.clone(),
                kind,
            })
        })
        .collect()
}
