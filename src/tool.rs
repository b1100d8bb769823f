//! The user-facing surface: one tool, four actions. Payloads are
//! validated at this boundary and everything below works on typed
//! values.

use crate::call::{CallManager, CallRecord, PersonaCallInfo, Speaker};
use anyhow::Result;
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ToolAction {
    #[serde(rename_all = "camelCase")]
    PersonaCall {
        to: String,
        persona: String,
        goal: String,
        opening_line: String,
        session_key: String,
    },
    #[serde(rename_all = "camelCase")]
    GetStatus { call_id: String },
    #[serde(rename_all = "camelCase")]
    EndCall { call_id: String },
    ListCalls,
}

impl ToolAction {
    pub fn parse(raw: &Value) -> Result<Self> {
        Ok(serde_json::from_value(raw.clone())?)
    }
}

pub async fn execute(manager: &Arc<CallManager>, action: ToolAction) -> Value {
    match action {
        ToolAction::PersonaCall {
            to,
            persona,
            goal,
            opening_line,
            session_key,
        } => persona_call(manager, to, persona, goal, opening_line, session_key).await,
        ToolAction::GetStatus { call_id } => get_status(manager, &call_id).await,
        ToolAction::EndCall { call_id } => match manager.end_call(&call_id).await {
            Ok(()) => json!({"ok": true, "callId": call_id}),
            Err(e) => error_value(e),
        },
        ToolAction::ListCalls => {
            let mut calls = Vec::new();
            for record in manager.get_active_calls().await {
                let persona = manager.persona_info(&record.call_id).await;
                calls.push(call_summary(&record, persona.as_ref()));
            }
            json!({"ok": true, "calls": calls})
        }
    }
}

async fn persona_call(
    manager: &Arc<CallManager>,
    to: String,
    persona: String,
    goal: String,
    opening_line: String,
    session_key: String,
) -> Value {
    for (field, value) in [
        ("persona", &persona),
        ("goal", &goal),
        ("openingLine", &opening_line),
        ("sessionKey", &session_key),
    ] {
        if value.trim().is_empty() {
            return json!({"ok": false, "error": format!("{} must not be empty", field)});
        }
    }

    let persona_prompt = build_persona_prompt(&persona, &goal, &to);
    let call_id = match manager
        .initiate_call(&to, &session_key, Some(opening_line))
        .await
    {
        Ok(call_id) => call_id,
        Err(e) => return error_value(e),
    };

    manager
        .set_persona_info(
            &call_id,
            PersonaCallInfo {
                persona: persona.clone(),
                goal: goal.clone(),
            },
        )
        .await;
    let metadata: HashMap<String, Value> = [
        ("persona".to_string(), persona.clone().into()),
        ("goal".to_string(), goal.clone().into()),
        ("personaPrompt".to_string(), persona_prompt.into()),
    ]
    .into();
    if let Err(e) = manager.update_metadata(&call_id, metadata).await {
        // The call is live either way; metadata is decoration.
        info!(call_id, "metadata update failed: {}", e);
    }

    json!({"ok": true, "callId": call_id, "to": to, "persona": persona})
}

async fn get_status(manager: &Arc<CallManager>, call_id: &str) -> Value {
    let record = match manager.get_call(call_id).await {
        Some(record) => Some(record),
        None => manager.get_call_from_store(call_id).await.ok().flatten(),
    };
    let Some(record) = record else {
        return json!({"ok": false, "error": format!("unknown call {}", call_id)});
    };
    let persona = manager.persona_info(call_id).await.or_else(|| {
        // Terminal calls lose their side-map entry; fall back to the
        // journaled metadata.
        match (record.metadata_str("persona"), record.metadata_str("goal")) {
            (Some(p), Some(g)) => Some(PersonaCallInfo {
                persona: p.to_string(),
                goal: g.to_string(),
            }),
            _ => None,
        }
    });
    json!({"ok": true, "call": call_summary(&record, persona.as_ref())})
}

fn call_summary(record: &CallRecord, persona: Option<&PersonaCallInfo>) -> Value {
    json!({
        "callId": record.call_id,
        "state": record.state,
        "to": record.to,
        "sessionKey": record.session_key,
        "endReason": record.end_reason,
        "transcript": record.transcript,
        "persona": persona.map(|p| p.persona.clone()),
        "goal": persona.map(|p| p.goal.clone()),
    })
}

fn error_value(e: anyhow::Error) -> Value {
    json!({"ok": false, "error": e.to_string()})
}

/// Compose the persona prompt: who the model is, what it wants, the
/// rules that keep it in character, and who it dialed.
pub fn build_persona_prompt(persona: &str, goal: &str, to: &str) -> String {
    format!(
        "You are {persona}, making a phone call.\n\n\
         Your goal for this call: {goal}\n\n\
         Rules:\n\
         - Stay in character as {persona} for the entire call. Never say you are an AI, \
           an assistant, or a language model, and never break character even if asked directly.\n\
         - Keep each reply short and conversational; this is a live phone line.\n\
         - Work toward the goal, then wrap up politely and use the hangup tool after your goodbye.\n\
         - If you reach voicemail, leave one short message covering the goal, then hang up.\n\n\
         You dialed {to}."
    )
}

/// Human-readable summary delivered to the host when a call finishes.
pub fn completion_summary(record: &CallRecord, persona: Option<&PersonaCallInfo>) -> String {
    let mut lines = Vec::new();
    let reason = record
        .end_reason
        .map(|r| r.as_str().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    match persona {
        Some(info) => lines.push(format!(
            "Call to {} finished ({}). Persona: {}. Goal: {}.",
            record.to, reason, info.persona, info.goal
        )),
        None => lines.push(format!("Call to {} finished ({}).", record.to, reason)),
    }
    lines.push(format!("Session: {}", record.session_key));
    if record.transcript.is_empty() {
        lines.push("No conversation was recorded.".to_string());
    } else {
        lines.push("Transcript:".to_string());
        for entry in &record.transcript {
            let speaker = match entry.speaker {
                Speaker::Bot => "bot",
                Speaker::User => "them",
            };
            lines.push(format!("  {}: {}", speaker, entry.text));
        }
    }
    lines.join("\n")
}
