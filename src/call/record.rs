use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Lifecycle state of a call. Forward progression is
/// `initiated -> ringing -> answered -> active`, then `speaking` and
/// `listening` alternate freely until a terminal state is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    Initiated,
    Ringing,
    Answered,
    Active,
    Speaking,
    Listening,
    Completed,
    Busy,
    NoAnswer,
    Failed,
    HangupBot,
    Timeout,
    Error,
}

impl CallState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Completed
                | CallState::Busy
                | CallState::NoAnswer
                | CallState::Failed
                | CallState::HangupBot
                | CallState::Timeout
                | CallState::Error
        )
    }

    fn is_conversational(&self) -> bool {
        matches!(self, CallState::Speaking | CallState::Listening)
    }

    /// Position in the forward progression; `speaking` and `listening`
    /// share an ordinal so neither outranks the other.
    fn ordinal(&self) -> u8 {
        match self {
            CallState::Initiated => 0,
            CallState::Ringing => 1,
            CallState::Answered => 2,
            CallState::Active => 3,
            CallState::Speaking | CallState::Listening => 4,
            _ => u8::MAX,
        }
    }

    /// Whether a transition from `self` to `target` is admitted.
    /// Terminal states never transition; terminal targets are always
    /// admitted from a live state; the conversational pair alternates
    /// freely; otherwise the move must be strictly forward.
    pub fn admits(&self, target: CallState) -> bool {
        if self.is_terminal() {
            return false;
        }
        if target.is_terminal() {
            return true;
        }
        if self.is_conversational() && target.is_conversational() {
            return true;
        }
        target.ordinal() > self.ordinal()
    }
}

/// Why a call reached its terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndReason {
    Completed,
    Busy,
    NoAnswer,
    Failed,
    HangupBot,
    Timeout,
    Error,
}

impl EndReason {
    pub fn as_state(&self) -> CallState {
        match self {
            EndReason::Completed => CallState::Completed,
            EndReason::Busy => CallState::Busy,
            EndReason::NoAnswer => CallState::NoAnswer,
            EndReason::Failed => CallState::Failed,
            EndReason::HangupBot => CallState::HangupBot,
            EndReason::Timeout => CallState::Timeout,
            EndReason::Error => CallState::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EndReason::Completed => "completed",
            EndReason::Busy => "busy",
            EndReason::NoAnswer => "no-answer",
            EndReason::Failed => "failed",
            EndReason::HangupBot => "hangup-bot",
            EndReason::Timeout => "timeout",
            EndReason::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Speaker {
    Bot,
    User,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub timestamp: u64,
    pub speaker: Speaker,
    pub text: String,
    pub is_final: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outbound,
}

/// One journaled line per mutation; the last line per `call_id` wins
/// on replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRecord {
    pub call_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_call_id: Option<String>,
    pub direction: CallDirection,
    pub state: CallState,
    pub from: String,
    pub to: String,
    pub session_key: String,
    pub started_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answered_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_reason: Option<EndReason>,
    #[serde(default)]
    pub transcript: Vec<TranscriptEntry>,
    #[serde(default)]
    pub processed_event_ids: HashSet<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl CallRecord {
    pub fn new(call_id: String, from: String, to: String, session_key: String) -> Self {
        Self {
            call_id,
            provider_call_id: None,
            direction: CallDirection::Outbound,
            state: CallState::Initiated,
            from,
            to,
            session_key,
            started_at: crate::get_timestamp(),
            answered_at: None,
            ended_at: None,
            end_reason: None,
            transcript: Vec::new(),
            processed_event_ids: HashSet::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// Persona and goal for a call, kept out of the journaled record and
/// used to decorate status and completion output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersonaCallInfo {
    pub persona: String,
    pub goal: String,
}
