//! Audio bridge between the carrier media stream and the model session.
//! One bridge serves every call; each accepted upgrade runs its own
//! pump loop and model session, keyed by the carrier's call id.

pub mod protocol;

use crate::call::record::Speaker;
use crate::media::codecs::{chunk_for_stream, STREAM_FRAME_BYTES};
use crate::media::dtmf::{generate_dtmf, DEFAULT_GAP_MS, DEFAULT_TONE_MS};
use crate::realtime::{ModelEvent, ModelSession, ModelSessionConfig};
use axum::extract::ws::{Message, WebSocket};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::{SinkExt, StreamExt};
use protocol::{media_frame, mark_frame, StreamFrame};
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

const HANGUP_BARRIER_TIMEOUT: Duration = Duration::from_secs(30);
const DTMF_BARRIER_TIMEOUT: Duration = Duration::from_secs(5);

const MARK_HANGUP: &str = "hangup";
const MARK_DTMF: &str = "dtmf";

/// What the bridge needs to know about a call before it will bridge it.
#[derive(Debug, Clone)]
pub struct BridgeCallInfo {
    pub call_id: String,
    pub persona_prompt: String,
    pub initial_greeting: Option<String>,
}

/// Narrow capability handles into the call manager; the bridge never
/// holds the manager itself.
pub type LookupCallFn = Arc<
    dyn Fn(String) -> Pin<Box<dyn Future<Output = Option<BridgeCallInfo>> + Send>> + Send + Sync,
>;
pub type EndCallFn =
    Arc<dyn Fn(String, String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;
pub type TranscriptFn =
    Arc<dyn Fn(String, Speaker, String) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Clone)]
pub struct BridgeHooks {
    /// Resolve a carrier call id to the call's bridging info.
    pub lookup_call: LookupCallFn,
    /// Tear the call down through the manager: `(call_id, reason)`.
    pub end_call: EndCallFn,
    /// Append a transcript line: `(call_id, speaker, text)`.
    pub add_transcript: TranscriptFn,
}

/// Model connection settings shared by every session the bridge spawns.
#[derive(Debug, Clone)]
pub struct ModelSettings {
    pub api_key: String,
    pub model: String,
    pub temperature: f64,
    pub voice: String,
    pub transcription_model: String,
}

impl ModelSettings {
    fn session_config(&self, info: &BridgeCallInfo) -> ModelSessionConfig {
        ModelSessionConfig {
            api_key: self.api_key.clone(),
            model: self.model.clone(),
            temperature: self.temperature,
            voice: self.voice.clone(),
            transcription_model: self.transcription_model.clone(),
            persona_prompt: info.persona_prompt.clone(),
            initial_greeting: info.initial_greeting.clone(),
        }
    }
}

/// Pending playback barriers for one stream. Latches are single-shot:
/// the mark echo consumes the sender, so each request injects at most
/// once.
#[derive(Default)]
struct MarkLatches {
    hangup: Option<oneshot::Sender<()>>,
    hangup_fired: bool,
    dtmf: Option<oneshot::Sender<()>>,
}

impl MarkLatches {
    /// Register the hangup barrier; `None` when a hangup is already
    /// pending for this session.
    fn register_hangup(&mut self) -> Option<oneshot::Receiver<()>> {
        if self.hangup_fired {
            return None;
        }
        self.hangup_fired = true;
        let (tx, rx) = oneshot::channel();
        self.hangup = Some(tx);
        Some(rx)
    }

    /// Register the DTMF barrier; `None` while an earlier injection is
    /// still waiting on its echo.
    fn register_dtmf(&mut self) -> Option<oneshot::Receiver<()>> {
        if self.dtmf.is_some() {
            return None;
        }
        let (tx, rx) = oneshot::channel();
        self.dtmf = Some(tx);
        Some(rx)
    }

    fn resolve(&mut self, name: &str) {
        let latch = match name {
            MARK_HANGUP => self.hangup.take(),
            MARK_DTMF => self.dtmf.take(),
            _ => None,
        };
        if let Some(tx) = latch {
            tx.send(()).ok();
        }
    }
}

pub struct StreamBridge {
    /// Carrier call ids with a live stream; duplicate upgrades for the
    /// same id are closed immediately.
    active_streams: Mutex<HashSet<String>>,
    hooks: BridgeHooks,
    model: ModelSettings,
}

impl StreamBridge {
    pub fn new(hooks: BridgeHooks, model: ModelSettings) -> Self {
        Self {
            active_streams: Mutex::new(HashSet::new()),
            hooks,
            model,
        }
    }

    fn try_register(&self, provider_call_id: &str) -> bool {
        self.active_streams
            .lock()
            .unwrap()
            .insert(provider_call_id.to_string())
    }

    fn release(&self, provider_call_id: &str) {
        self.active_streams.lock().unwrap().remove(provider_call_id);
    }

    /// Drive one carrier media-stream socket to completion.
    pub async fn handle_socket(self: Arc<Self>, socket: WebSocket) {
        let (mut sink, mut source) = socket.split();

        // All frame producers funnel through one writer task so media,
        // marks and DTMF frames stay FIFO toward the carrier.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                if sink.send(message).await.is_err() {
                    break;
                }
            }
            sink.close().await.ok();
        });

        // The carrier sends `connected` then `start`; nothing useful
        // can happen before `start` names the call.
        let (stream_sid, provider_call_id) = loop {
            match source.next().await {
                Some(Ok(Message::Text(text))) => match serde_json::from_str(&text) {
                    Ok(StreamFrame::Start { stream_sid, start }) => {
                        break (stream_sid, start.call_sid)
                    }
                    Ok(StreamFrame::Connected) => continue,
                    Ok(other) => {
                        debug!("frame before start: {:?}", other);
                        continue;
                    }
                    Err(e) => {
                        warn!("unparseable stream frame before start: {}", e);
                        continue;
                    }
                },
                Some(Ok(Message::Close(_))) | None => {
                    drop(out_tx);
                    writer.await.ok();
                    return;
                }
                Some(Err(e)) => {
                    warn!("stream socket error before start: {}", e);
                    drop(out_tx);
                    writer.await.ok();
                    return;
                }
                _ => continue,
            }
        };

        if !self.try_register(&provider_call_id) {
            // The carrier sometimes opens the stream twice; first wins.
            warn!(provider_call_id, "duplicate media stream; closing");
            out_tx.send(Message::Close(None)).ok();
            drop(out_tx);
            writer.await.ok();
            return;
        }

        info!(provider_call_id, stream_sid, "media stream started");
        self.clone()
            .run_call(&mut source, out_tx, &stream_sid, &provider_call_id)
            .await;

        self.release(&provider_call_id);
        writer.await.ok();
        info!(provider_call_id, "media stream closed");
    }

    async fn run_call(
        self: Arc<Self>,
        source: &mut (impl futures::Stream<Item = Result<Message, axum::Error>> + Unpin),
        out_tx: mpsc::UnboundedSender<Message>,
        stream_sid: &str,
        provider_call_id: &str,
    ) {
        let info = match (self.hooks.lookup_call)(provider_call_id.to_string()).await {
            Some(info) => info,
            None => {
                warn!(provider_call_id, "no active call for media stream");
                return;
            }
        };

        let (event_tx, mut model_rx) = mpsc::unbounded_channel();
        let session = match ModelSession::connect(self.model.session_config(&info), event_tx).await
        {
            Ok(session) => session,
            Err(e) => {
                warn!(call_id = info.call_id, "model session failed to open: {}", e);
                return;
            }
        };

        let latches = Arc::new(Mutex::new(MarkLatches::default()));
        let mut model_done = false;

        loop {
            tokio::select! {
                frame = source.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            match serde_json::from_str(&text) {
                                Ok(StreamFrame::Media { media }) => {
                                    if let Ok(audio) = BASE64.decode(media.payload) {
                                        session.send_audio(audio);
                                    }
                                }
                                Ok(StreamFrame::Mark { mark }) => {
                                    latches.lock().unwrap().resolve(&mark.name);
                                }
                                Ok(StreamFrame::Stop) => break,
                                Ok(_) => {}
                                Err(e) => debug!("unparseable stream frame: {}", e),
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!("stream socket error: {}", e);
                            break;
                        }
                        _ => {}
                    }
                }
                event = model_rx.recv(), if !model_done => {
                    match event {
                        Some(event) => self.handle_model_event(
                            event,
                            &info,
                            stream_sid,
                            &out_tx,
                            &latches,
                        ).await,
                        None => {
                            // Model gone mid-call; the human may still be
                            // talking, so keep the carrier side alive and
                            // let its close or the duration timer finish
                            // the call.
                            model_done = true;
                        }
                    }
                }
            }
        }

        session.close();
    }

    async fn handle_model_event(
        &self,
        event: ModelEvent,
        info: &BridgeCallInfo,
        stream_sid: &str,
        out_tx: &mpsc::UnboundedSender<Message>,
        latches: &Arc<Mutex<MarkLatches>>,
    ) {
        match event {
            ModelEvent::AudioOutput(audio) => {
                let frame = media_frame(stream_sid, &BASE64.encode(audio));
                out_tx.send(Message::Text(frame.into())).ok();
            }
            ModelEvent::UserTranscript(text) => {
                (self.hooks.add_transcript)(info.call_id.clone(), Speaker::User, text).await;
            }
            ModelEvent::AssistantTranscript(text) => {
                (self.hooks.add_transcript)(info.call_id.clone(), Speaker::Bot, text).await;
            }
            ModelEvent::SpeechStarted => {
                debug!(call_id = info.call_id, "caller started speaking");
            }
            ModelEvent::ResponseDone => {}
            ModelEvent::HangupRequested { reason } => {
                self.barrier_hangup(info, stream_sid, out_tx, latches, reason);
            }
            ModelEvent::DtmfRequested { digits } => {
                self.barrier_dtmf(info, stream_sid, out_tx, latches, digits);
            }
            ModelEvent::Closed => {
                debug!(call_id = info.call_id, "model session closed");
            }
        }
    }

    /// Send the hangup mark and, once the carrier echoes it (or the
    /// barrier times out), end the call. The human hears the model's
    /// goodbye before the line drops.
    fn barrier_hangup(
        &self,
        info: &BridgeCallInfo,
        stream_sid: &str,
        out_tx: &mpsc::UnboundedSender<Message>,
        latches: &Arc<Mutex<MarkLatches>>,
        reason: String,
    ) {
        let echo = match latches.lock().unwrap().register_hangup() {
            Some(echo) => echo,
            None => {
                debug!(call_id = info.call_id, "hangup already pending");
                return;
            }
        };
        out_tx
            .send(Message::Text(mark_frame(stream_sid, MARK_HANGUP).into()))
            .ok();

        let end_call = self.hooks.end_call.clone();
        let call_id = info.call_id.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(HANGUP_BARRIER_TIMEOUT, echo).await.is_err() {
                warn!(call_id, "hangup mark never echoed; ending call anyway");
            }
            end_call(call_id, reason).await;
        });
    }

    /// Send the DTMF mark, wait for its echo (or 5s), then inject the
    /// synthesized tones as 20ms media frames.
    fn barrier_dtmf(
        &self,
        info: &BridgeCallInfo,
        stream_sid: &str,
        out_tx: &mpsc::UnboundedSender<Message>,
        latches: &Arc<Mutex<MarkLatches>>,
        digits: String,
    ) {
        let echo = match latches.lock().unwrap().register_dtmf() {
            Some(echo) => echo,
            None => {
                debug!(call_id = info.call_id, "dtmf injection already pending");
                return;
            }
        };
        out_tx
            .send(Message::Text(mark_frame(stream_sid, MARK_DTMF).into()))
            .ok();

        let out_tx = out_tx.clone();
        let stream_sid = stream_sid.to_string();
        let call_id = info.call_id.clone();
        let latches = latches.clone();
        tokio::spawn(async move {
            if tokio::time::timeout(DTMF_BARRIER_TIMEOUT, echo).await.is_err() {
                warn!(call_id, "dtmf mark never echoed; injecting anyway");
                // Forget the stale latch so a later injection can run.
                latches.lock().unwrap().dtmf = None;
            }
            let audio = generate_dtmf(&digits, DEFAULT_TONE_MS, DEFAULT_GAP_MS);
            info!(call_id, digits, bytes = audio.len(), "injecting dtmf");
            for frame in chunk_for_stream(&audio, STREAM_FRAME_BYTES) {
                let envelope = media_frame(&stream_sid, &BASE64.encode(frame));
                if out_tx.send(Message::Text(envelope.into())).is_err() {
                    break;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_stream_registration_first_wins() {
        let bridge = StreamBridge::new(test_hooks(), test_model());
        assert!(bridge.try_register("CA1"));
        assert!(!bridge.try_register("CA1"));
        bridge.release("CA1");
        assert!(bridge.try_register("CA1"));
    }

    #[test]
    fn test_hangup_latch_is_single_shot() {
        let mut latches = MarkLatches::default();
        let first = latches.register_hangup();
        assert!(first.is_some());
        // A second request while one is pending is ignored
        assert!(latches.register_hangup().is_none());
        // Even after the echo resolves it, hangup never re-arms
        latches.resolve(MARK_HANGUP);
        assert!(latches.register_hangup().is_none());
    }

    #[tokio::test]
    async fn test_mark_echo_releases_latch() {
        let mut latches = MarkLatches::default();
        let echo = latches.register_dtmf().unwrap();
        latches.resolve(MARK_DTMF);
        assert!(echo.await.is_ok());
    }

    #[tokio::test]
    async fn test_dtmf_latch_rearms_after_echo() {
        let mut latches = MarkLatches::default();
        let first = latches.register_dtmf().unwrap();
        assert!(latches.register_dtmf().is_none());
        latches.resolve(MARK_DTMF);
        assert!(first.await.is_ok());
        // Echo consumed the pending latch; the next request may arm
        assert!(latches.register_dtmf().is_some());
    }

    #[test]
    fn test_unknown_mark_name_ignored() {
        let mut latches = MarkLatches::default();
        let echo = latches.register_dtmf().unwrap();
        latches.resolve("greeting");
        // Still pending
        assert!(latches.dtmf.is_some());
        drop(echo);
    }

    fn test_hooks() -> BridgeHooks {
        BridgeHooks {
            lookup_call: Arc::new(|_| Box::pin(async { None })),
            end_call: Arc::new(|_, _| Box::pin(async {})),
            add_transcript: Arc::new(|_, _, _| Box::pin(async {})),
        }
    }

    fn test_model() -> ModelSettings {
        ModelSettings {
            api_key: "sk-test".into(),
            model: "gpt-realtime".into(),
            temperature: 0.8,
            voice: "marin".into(),
            transcription_model: "gpt-4o-transcribe".into(),
        }
    }
}
