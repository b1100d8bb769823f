//! Session against the realtime speech model: one web-socket per call,
//! µ-law audio both ways, transcripts and tool calls surfaced as typed
//! events.

pub mod protocol;

use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::{SinkExt, StreamExt};
use protocol::{tool_calls, ServerEvent, ToolCallKind};
use serde_json::json;
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// The model socket wants a beat after the upgrade before it will
/// accept a session.update.
const SETTLE_DELAY: Duration = Duration::from_millis(250);

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct ModelSessionConfig {
    pub api_key: String,
    pub model: String,
    pub temperature: f64,
    pub voice: String,
    pub transcription_model: String,
    pub persona_prompt: String,
    pub initial_greeting: Option<String>,
}

/// Everything a session reports back to the audio bridge.
#[derive(Debug, Clone)]
pub enum ModelEvent {
    AudioOutput(Vec<u8>),
    UserTranscript(String),
    AssistantTranscript(String),
    SpeechStarted,
    ResponseDone,
    HangupRequested { reason: String },
    DtmfRequested { digits: String },
    Closed,
}

pub type ModelEventSender = mpsc::UnboundedSender<ModelEvent>;
pub type ModelEventReceiver = mpsc::UnboundedReceiver<ModelEvent>;

pub struct ModelSession {
    audio_tx: mpsc::UnboundedSender<Vec<u8>>,
    cancel_token: CancellationToken,
}

impl ModelSession {
    /// Open the model socket and start the session task. Resolves once
    /// the socket is up; audio sent before then queues.
    pub async fn connect(config: ModelSessionConfig, events: ModelEventSender) -> Result<Self> {
        let url = format!(
            "{}?model={}&temperature={}",
            REALTIME_URL, config.model, config.temperature
        );
        let mut request = url.into_client_request()?;
        request.headers_mut().insert(
            "Authorization",
            format!("Bearer {}", config.api_key)
                .parse()
                .map_err(|_| anyhow!("api key is not a valid header value"))?,
        );

        let (socket, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request))
            .await
            .map_err(|_| anyhow!("model socket did not open within 10s"))??;
        info!(model = config.model, "model session connected");

        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let cancel_token = CancellationToken::new();
        let token = cancel_token.clone();
        tokio::spawn(async move {
            if let Err(e) = run_session(socket, config, events.clone(), audio_rx, token).await {
                error!("model session ended with error: {}", e);
            }
            events.send(ModelEvent::Closed).ok();
        });

        Ok(Self {
            audio_tx,
            cancel_token,
        })
    }

    /// Queue a µ-law frame for the model; frames sent before the
    /// session is configured are delivered once it is.
    pub fn send_audio(&self, frame: Vec<u8>) {
        self.audio_tx.send(frame).ok();
    }

    pub fn close(&self) {
        self.cancel_token.cancel();
    }
}

impl Drop for ModelSession {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

/// Compose the system instructions once: today's date, the IVR rubric,
/// then the persona.
pub fn compose_instructions(persona_prompt: &str) -> String {
    let date = chrono::Local::now().format("%A, %B %-d, %Y");
    format!(
        "Today's date is {}.\n\n\
         If an automated phone menu answers, listen to the options before acting. \
         Use the send_dtmf tool to press keypad digits; use \"w\" in the digit string \
         to wait half a second between presses. Speak only when a human is on the line. \
         If the menu loops or none of the options fit, press 0 to reach an operator.\n\n{}",
        date, persona_prompt
    )
}

fn session_update(config: &ModelSessionConfig) -> serde_json::Value {
    json!({
        "type": "session.update",
        "session": {
            "type": "realtime",
            "instructions": compose_instructions(&config.persona_prompt),
            "output_modalities": ["audio"],
            "audio": {
                "input": {
                    "format": {"type": "audio/pcmu"},
                    "transcription": {"model": config.transcription_model},
                    "turn_detection": {"type": "semantic_vad", "interrupt_response": true}
                },
                "output": {
                    "format": {"type": "audio/pcmu"},
                    "voice": config.voice
                }
            },
            "tools": [
                {
                    "type": "function",
                    "name": "hangup",
                    "description": "End the phone call. Call this after saying your goodbye; \
                                    the caller will hear your last sentence before the line drops.",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "reason": {"type": "string", "description": "Why the call is ending"}
                        },
                        "required": ["reason"]
                    }
                },
                {
                    "type": "function",
                    "name": "send_dtmf",
                    "description": "Press buttons on the phone keypad, for navigating automated menus.",
                    "parameters": {
                        "type": "object",
                        "properties": {
                            "digits": {
                                "type": "string",
                                "description": "Digits to press: 0-9, *, #, or w for a half-second pause"
                            }
                        },
                        "required": ["digits"]
                    }
                }
            ]
        }
    })
}

async fn send_json(socket: &mut Socket, payload: serde_json::Value) -> Result<()> {
    socket
        .send(Message::Text(payload.to_string().into()))
        .await
        .map_err(|e| anyhow!("model socket send failed: {}", e))
}

async fn run_session(
    mut socket: Socket,
    config: ModelSessionConfig,
    events: ModelEventSender,
    mut audio_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel_token: CancellationToken,
) -> Result<()> {
    tokio::time::sleep(SETTLE_DELAY).await;
    send_json(&mut socket, session_update(&config)).await?;

    // Partial user transcriptions accumulate per conversation item.
    let mut partials: HashMap<String, String> = HashMap::new();
    let mut greeted = false;

    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                socket.send(Message::Close(None)).await.ok();
                break;
            }
            Some(frame) = audio_rx.recv() => {
                let append = json!({
                    "type": "input_audio_buffer.append",
                    "audio": BASE64.encode(&frame),
                });
                if send_json(&mut socket, append).await.is_err() {
                    break;
                }
            }
            message = socket.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        let event: ServerEvent = match serde_json::from_str(&text) {
                            Ok(event) => event,
                            Err(e) => {
                                debug!("unparseable model event: {}", e);
                                continue;
                            }
                        };
                        handle_server_event(&mut socket, &config, &events, &mut partials, &mut greeted, event)
                            .await?;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!("model socket error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
    Ok(())
}

async fn handle_server_event(
    socket: &mut Socket,
    config: &ModelSessionConfig,
    events: &ModelEventSender,
    partials: &mut HashMap<String, String>,
    greeted: &mut bool,
    event: ServerEvent,
) -> Result<()> {
    match event {
        ServerEvent::SessionUpdated => {
            if !*greeted {
                *greeted = true;
                if let Some(greeting) = &config.initial_greeting {
                    send_greeting(socket, greeting).await?;
                }
            }
        }
        ServerEvent::SpeechStarted => {
            events.send(ModelEvent::SpeechStarted).ok();
        }
        ServerEvent::OutputAudioDelta { delta } => {
            if let Ok(audio) = BASE64.decode(delta) {
                events.send(ModelEvent::AudioOutput(audio)).ok();
            }
        }
        ServerEvent::OutputTranscriptDone { transcript } => {
            events.send(ModelEvent::AssistantTranscript(transcript)).ok();
        }
        ServerEvent::InputTranscriptionDelta { item_id, delta } => {
            if let Some(delta) = delta {
                partials.entry(item_id).or_default().push_str(&delta);
            }
        }
        ServerEvent::InputTranscriptionCompleted { item_id, transcript } => {
            let accumulated = partials.remove(&item_id);
            let text = transcript
                .filter(|t| !t.is_empty())
                .or(accumulated)
                .unwrap_or_default();
            if !text.is_empty() {
                events.send(ModelEvent::UserTranscript(text)).ok();
            }
        }
        ServerEvent::ResponseDone { response } => {
            for call in tool_calls(&response) {
                let model_event = match &call.kind {
                    ToolCallKind::Hangup { reason } => {
                        info!(reason, "model requested hangup");
                        ModelEvent::HangupRequested {
                            reason: reason.clone(),
                        }
                    }
                    ToolCallKind::SendDtmf { digits } => {
                        info!(digits, "model requested dtmf");
                        ModelEvent::DtmfRequested {
                            digits: digits.clone(),
                        }
                    }
                };
                events.send(model_event).ok();
                if let Some(call_id) = &call.call_id {
                    let ack = json!({
                        "type": "conversation.item.create",
                        "item": {
                            "type": "function_call_output",
                            "call_id": call_id,
                            "output": "{\"ok\":true}",
                        }
                    });
                    send_json(socket, ack).await?;
                }
            }
            events.send(ModelEvent::ResponseDone).ok();
        }
        ServerEvent::Error { error } => {
            warn!("model error event: {}", error);
        }
        ServerEvent::Other => {}
    }
    Ok(())
}

/// Seed the conversation so the model speaks first, with the exact
/// opening line the caller asked for.
async fn send_greeting(socket: &mut Socket, greeting: &str) -> Result<()> {
    let item = json!({
        "type": "conversation.item.create",
        "item": {
            "type": "message",
            "role": "user",
            "content": [{
                "type": "input_text",
                "text": format!(
                    "[SYSTEM: The call has just connected. Greet the person and say exactly: \"{}\"]",
                    greeting
                ),
            }]
        }
    });
    send_json(socket, item).await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    send_json(socket, json!({"type": "response.create"})).await
}
