//! Carrier adapters. A provider places and tears down calls over the
//! carrier's REST control plane and turns its webhooks into normalized
//! events the call manager can apply.

pub mod mock;
pub mod signature;
pub mod twilio;

use crate::call::record::EndReason;
use anyhow::Result;
use async_trait::async_trait;
use axum::http::HeaderMap;
use std::collections::HashMap;

pub use mock::MockProvider;
pub use signature::VerifyOutcome;
pub use twilio::TwilioProvider;

/// A carrier webhook as received by the front door: the path and query
/// the carrier addressed, the request headers, and the raw form body.
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: String,
}

impl WebhookRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn query_param(&self, key: &str) -> Option<String> {
        let query = self.path_and_query.split_once('?')?.1;
        parse_form(query)
            .into_iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    /// Decoded `application/x-www-form-urlencoded` body pairs in
    /// arrival order.
    pub fn form_pairs(&self) -> Vec<(String, String)> {
        parse_form(&self.body)
    }

    pub fn form_map(&self) -> HashMap<String, String> {
        self.form_pairs().into_iter().collect()
    }
}

/// Parse an `x-www-form-urlencoded` string; `+` means space.
pub fn parse_form(input: &str) -> Vec<(String, String)> {
    input
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (decode_component(key), decode_component(value))
        })
        .collect()
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced)
        .map(|c| c.into_owned())
        .unwrap_or(spaced)
}

/// A carrier webhook mapped onto the call lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedEvent {
    /// Idempotency key; delivering the same id twice has no effect.
    pub event_id: String,
    /// Internal call id, when the webhook URL carried one.
    pub call_id: Option<String>,
    /// The carrier's own call identifier.
    pub provider_call_id: Option<String>,
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    CallInitiated,
    CallRinging,
    CallAnswered,
    CallEnded { reason: EndReason },
    Speech { text: String, is_final: bool },
    Dtmf { digits: String },
}

/// What the front door should answer the carrier with.
#[derive(Debug, Clone)]
pub struct WebhookReply {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl WebhookReply {
    pub fn xml(body: String) -> Self {
        Self {
            status: 200,
            content_type: "text/xml",
            body,
        }
    }

    pub fn empty_document() -> Self {
        Self::xml("<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response></Response>".to_string())
    }
}

#[async_trait]
pub trait CallProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Check the webhook signature. The front door rejects with 401 when
    /// this does not come back ok.
    fn verify_webhook(&self, request: &WebhookRequest) -> VerifyOutcome;

    /// Turn a verified webhook into normalized events plus the control
    /// document to answer with.
    fn parse_webhook_event(&self, request: &WebhookRequest) -> (Vec<NormalizedEvent>, WebhookReply);

    /// Place the outbound call; returns the provider's call id.
    async fn initiate_call(
        &self,
        call_id: &str,
        from: &str,
        to: &str,
        webhook_url: &str,
    ) -> Result<String>;

    async fn hangup_call(&self, provider_call_id: &str) -> Result<()>;

    /// The public origin used when emitting media-stream URLs.
    fn set_public_url(&self, url: &str);
}

/// Shared mapping from the carrier's form fields to normalized events;
/// both the real and the mock provider emit the same shapes.
pub fn events_from_form(request: &WebhookRequest) -> Vec<NormalizedEvent> {
    let form = request.form_map();
    let call_id = request.query_param("callId");
    let provider_call_id = form.get("CallSid").cloned();
    let sid = provider_call_id.clone().unwrap_or_default();
    let sequence = form
        .get("SequenceNumber")
        .map(|s| format!(":{}", s))
        .unwrap_or_default();

    let mut events = Vec::new();
    if let Some(status) = form.get("CallStatus") {
        let kind = match status.as_str() {
            "initiated" => Some(EventKind::CallInitiated),
            "ringing" => Some(EventKind::CallRinging),
            "in-progress" => Some(EventKind::CallAnswered),
            "completed" => Some(EventKind::CallEnded {
                reason: EndReason::Completed,
            }),
            "busy" => Some(EventKind::CallEnded {
                reason: EndReason::Busy,
            }),
            "no-answer" => Some(EventKind::CallEnded {
                reason: EndReason::NoAnswer,
            }),
            "failed" => Some(EventKind::CallEnded {
                reason: EndReason::Failed,
            }),
            "canceled" => Some(EventKind::CallEnded {
                reason: EndReason::HangupBot,
            }),
            _ => None,
        };
        if let Some(kind) = kind {
            events.push(NormalizedEvent {
                event_id: format!("{}:{}{}", sid, status, sequence),
                call_id: call_id.clone(),
                provider_call_id: provider_call_id.clone(),
                kind,
            });
        }
    }
    if let Some(text) = form.get("SpeechResult") {
        events.push(NormalizedEvent {
            event_id: format!("{}:speech:{}", sid, text),
            call_id: call_id.clone(),
            provider_call_id: provider_call_id.clone(),
            kind: EventKind::Speech {
                text: text.clone(),
                is_final: true,
            },
        });
    }
    if let Some(digits) = form.get("Digits") {
        events.push(NormalizedEvent {
            event_id: format!("{}:dtmf:{}", sid, digits),
            call_id,
            provider_call_id,
            kind: EventKind::Dtmf {
                digits: digits.clone(),
            },
        });
    }
    events
}
