//! Call manager: owns every in-flight call record, the journal, the
//! lifecycle state machine, timers, and the completion callback. All
//! other components reach records through this module.

pub mod preflight;
pub mod record;
pub mod store;

pub use record::{
    CallRecord, CallState, EndReason, PersonaCallInfo, Speaker, TranscriptEntry,
};

use crate::provider::{CallProvider, EventKind, NormalizedEvent};
use crate::stream::BridgeCallInfo;
use anyhow::{anyhow, bail, Result};
use preflight::Preflight;
use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use store::CallStore;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

/// Invoked exactly once per call, on its terminal transition.
pub type FnCallComplete = Arc<
    dyn Fn(CallRecord, Option<PersonaCallInfo>) -> Pin<Box<dyn Future<Output = ()> + Send>>
        + Send
        + Sync,
>;

pub struct CallManagerSettings {
    pub max_concurrent_calls: usize,
    pub max_duration: Duration,
    pub from_number: String,
}

/// Where the carrier reaches us; learned at finalize time, after tunnel
/// discovery.
#[derive(Debug, Clone)]
struct Endpoints {
    webhook_url: String,
    stream_ws_url: String,
}

#[derive(Default)]
struct ManagerState {
    active: HashMap<String, CallRecord>,
    by_provider_id: HashMap<String, String>,
    persona_info: HashMap<String, PersonaCallInfo>,
    duration_timers: HashMap<String, AbortHandle>,
    provider: Option<Arc<dyn CallProvider>>,
    endpoints: Option<Endpoints>,
    on_complete: Option<FnCallComplete>,
}

pub struct CallManager {
    state: Mutex<ManagerState>,
    store: CallStore,
    preflight: Preflight,
    settings: CallManagerSettings,
    boot_secret: String,
}

impl CallManager {
    pub fn new(
        store_dir: &Path,
        settings: CallManagerSettings,
        boot_secret: String,
    ) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            state: Mutex::new(ManagerState::default()),
            store: CallStore::new(store_dir)?,
            preflight: Preflight::new(),
            settings,
            boot_secret,
        }))
    }

    pub fn boot_secret(&self) -> &str {
        &self.boot_secret
    }

    /// Replay the journal: stale in-flight records get rewritten as
    /// errors, fresh ones come back as active.
    pub async fn recover(&self) -> Result<()> {
        let recovered = self.store.recover(crate::get_timestamp()).await?;
        let mut state = self.state.lock().await;
        for record in recovered.active {
            if let Some(pid) = &record.provider_call_id {
                state.by_provider_id.insert(pid.clone(), record.call_id.clone());
            }
            state.active.insert(record.call_id.clone(), record);
        }
        Ok(())
    }

    /// Wire in the provider and public endpoints; calls cannot be
    /// placed before this.
    pub async fn finalize(
        &self,
        provider: Arc<dyn CallProvider>,
        webhook_url: String,
        stream_ws_url: String,
    ) {
        let mut state = self.state.lock().await;
        state.provider = Some(provider);
        state.endpoints = Some(Endpoints {
            webhook_url,
            stream_ws_url,
        });
    }

    pub async fn set_on_call_complete(&self, handler: FnCallComplete) {
        self.state.lock().await.on_complete = Some(handler);
    }

    pub async fn set_persona_info(&self, call_id: &str, info: PersonaCallInfo) {
        self.state
            .lock()
            .await
            .persona_info
            .insert(call_id.to_string(), info);
    }

    pub async fn persona_info(&self, call_id: &str) -> Option<PersonaCallInfo> {
        self.state.lock().await.persona_info.get(call_id).cloned()
    }

    /// Merge metadata into an active record and journal the change.
    pub async fn update_metadata(
        &self,
        call_id: &str,
        entries: HashMap<String, serde_json::Value>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state
            .active
            .get_mut(call_id)
            .ok_or_else(|| anyhow!("no active call {}", call_id))?;
        record.metadata.extend(entries);
        let snapshot = record.clone();
        self.store.append(&snapshot).await
    }

    /// Place an outbound call. Runs the reachability preflight, enforces
    /// the concurrency cap, persists the record, then asks the carrier
    /// to dial. Returns the new call id.
    pub async fn initiate_call(
        self: &Arc<Self>,
        to: &str,
        session_key: &str,
        initial_message: Option<String>,
    ) -> Result<String> {
        if !is_e164(to) {
            bail!("destination must be E.164, like +15550001234 (got {:?})", to);
        }

        let (provider, endpoints) = {
            let state = self.state.lock().await;
            match (&state.provider, &state.endpoints) {
                (Some(p), Some(e)) => (p.clone(), e.clone()),
                _ => bail!("call provider is not initialized yet"),
            }
        };

        self.preflight
            .check(
                &endpoints.webhook_url,
                &endpoints.stream_ws_url,
                &self.boot_secret,
            )
            .await?;

        let call_id = uuid::Uuid::new_v4().to_string();
        {
            let mut state = self.state.lock().await;
            if state.active.len() >= self.settings.max_concurrent_calls {
                bail!(
                    "at the limit of {} concurrent call(s); end one first",
                    self.settings.max_concurrent_calls
                );
            }
            let mut record = CallRecord::new(
                call_id.clone(),
                self.settings.from_number.clone(),
                to.to_string(),
                session_key.to_string(),
            );
            if let Some(message) = &initial_message {
                record
                    .metadata
                    .insert("initialMessage".to_string(), message.clone().into());
            }
            self.store.append(&record).await?;
            state.active.insert(call_id.clone(), record);
        }

        match provider
            .initiate_call(
                &call_id,
                &self.settings.from_number,
                to,
                &endpoints.webhook_url,
            )
            .await
        {
            Ok(provider_call_id) => {
                let mut state = self.state.lock().await;
                if let Some(record) = state.active.get_mut(&call_id) {
                    record.provider_call_id = Some(provider_call_id.clone());
                    let snapshot = record.clone();
                    state
                        .by_provider_id
                        .insert(provider_call_id, call_id.clone());
                    self.store.append(&snapshot).await?;
                }
                info!(call_id, to, "call initiated");
                Ok(call_id)
            }
            Err(e) => {
                warn!(call_id, "carrier rejected call create: {}", e);
                self.finish_call(&call_id, EndReason::Failed).await;
                Err(e)
            }
        }
    }

    /// Hang up through the carrier and finish the record as
    /// `hangup-bot`. A call already in a terminal state is a no-op.
    pub async fn end_call(self: &Arc<Self>, call_id: &str) -> Result<()> {
        self.end_call_with_reason(call_id, EndReason::HangupBot)
            .await
    }

    pub async fn end_call_with_reason(
        self: &Arc<Self>,
        call_id: &str,
        reason: EndReason,
    ) -> Result<()> {
        let (provider, provider_call_id) = {
            let state = self.state.lock().await;
            let record = match state.active.get(call_id) {
                Some(record) => record,
                None => {
                    // Terminal records are evicted; ending them again is fine.
                    if self.store.find(call_id).await?.is_some() {
                        return Ok(());
                    }
                    bail!("unknown call {}", call_id);
                }
            };
            (state.provider.clone(), record.provider_call_id.clone())
        };

        if let (Some(provider), Some(pid)) = (provider, provider_call_id) {
            if let Err(e) = provider.hangup_call(&pid).await {
                warn!(call_id, "carrier hangup failed: {}", e);
            }
        }
        self.finish_call(call_id, reason).await;
        Ok(())
    }

    /// Apply one normalized carrier event. Duplicate event ids and
    /// transitions the state machine does not admit are dropped
    /// silently.
    pub async fn process_event(self: &Arc<Self>, event: NormalizedEvent) {
        let mut completion: Option<(CallRecord, Option<PersonaCallInfo>, Option<FnCallComplete>)> =
            None;
        let mut start_timer_for: Option<String> = None;

        {
            let mut state = self.state.lock().await;
            let call_id = match resolve_call_id(&state, &event) {
                Some(id) => id,
                None => {
                    debug!(kind = ?event.kind, "event for unknown call dropped");
                    return;
                }
            };

            // Rebinding the reverse index happens in the same critical
            // section as the record mutation.
            if let Some(pid) = &event.provider_call_id {
                let stale = state
                    .active
                    .get(&call_id)
                    .and_then(|r| r.provider_call_id.clone())
                    .filter(|existing| existing != pid);
                if let Some(stale) = stale {
                    state.by_provider_id.remove(&stale);
                }
                state.by_provider_id.insert(pid.clone(), call_id.clone());
                if let Some(record) = state.active.get_mut(&call_id) {
                    record.provider_call_id = Some(pid.clone());
                }
            }

            let record = match state.active.get_mut(&call_id) {
                Some(record) => record,
                None => return,
            };
            if !event.event_id.is_empty()
                && !record.processed_event_ids.insert(event.event_id.clone())
            {
                debug!(call_id, event_id = event.event_id, "duplicate event dropped");
                return;
            }

            match &event.kind {
                EventKind::CallInitiated => {
                    apply_transition(record, CallState::Initiated);
                }
                EventKind::CallRinging => {
                    apply_transition(record, CallState::Ringing);
                }
                EventKind::CallAnswered => {
                    if apply_transition(record, CallState::Answered) {
                        record.answered_at = Some(crate::get_timestamp());
                        start_timer_for = Some(call_id.clone());
                    }
                }
                EventKind::CallEnded { reason } => {
                    completion = finish_record_locked(&mut state, &call_id, *reason);
                }
                EventKind::Speech { text, is_final } => {
                    record.transcript.push(TranscriptEntry {
                        timestamp: crate::get_timestamp(),
                        speaker: Speaker::User,
                        text: text.clone(),
                        is_final: *is_final,
                    });
                    apply_transition(record, CallState::Listening);
                }
                EventKind::Dtmf { digits } => {
                    info!(call_id, digits, "caller pressed keys");
                }
            }

            let snapshot = match &completion {
                Some((record, _, _)) => record.clone(),
                None => match state.active.get(&call_id) {
                    Some(record) => record.clone(),
                    None => return,
                },
            };
            if let Err(e) = self.store.append(&snapshot).await {
                warn!(call_id, "journal append failed: {}", e);
            }
        }

        if let Some(call_id) = start_timer_for {
            self.start_duration_timer(call_id).await;
        }
        fire_completion(completion);
    }

    /// Append a transcript line from the bridge. A bot line moves the
    /// call to `speaking`, a user line to `listening`.
    pub async fn add_transcript(&self, call_id: &str, speaker: Speaker, text: String) {
        let mut state = self.state.lock().await;
        let record = match state.active.get_mut(call_id) {
            Some(record) => record,
            None => return,
        };
        record.transcript.push(TranscriptEntry {
            timestamp: crate::get_timestamp(),
            speaker,
            text,
            is_final: true,
        });
        let target = match speaker {
            Speaker::Bot => CallState::Speaking,
            Speaker::User => CallState::Listening,
        };
        apply_transition(record, target);
        let snapshot = record.clone();
        if let Err(e) = self.store.append(&snapshot).await {
            warn!(call_id, "journal append failed: {}", e);
        }
    }

    pub async fn get_call(&self, call_id: &str) -> Option<CallRecord> {
        self.state.lock().await.active.get(call_id).cloned()
    }

    pub async fn get_active_calls(&self) -> Vec<CallRecord> {
        self.state.lock().await.active.values().cloned().collect()
    }

    pub async fn get_call_by_provider_id(&self, provider_call_id: &str) -> Option<CallRecord> {
        let state = self.state.lock().await;
        let call_id = state.by_provider_id.get(provider_call_id)?;
        state.active.get(call_id).cloned()
    }

    /// Scan the journal; finds terminal calls the active map no longer
    /// holds.
    pub async fn get_call_from_store(&self, call_id: &str) -> Result<Option<CallRecord>> {
        self.store.find(call_id).await
    }

    /// Bridge capability: resolve a carrier call id to what the bridge
    /// needs for a model session.
    pub async fn bridge_info(&self, provider_call_id: &str) -> Option<BridgeCallInfo> {
        let record = self.get_call_by_provider_id(provider_call_id).await?;
        let persona_prompt = record
            .metadata_str("personaPrompt")
            .unwrap_or("You are a polite caller. Keep the conversation short and on topic.")
            .to_string();
        Some(BridgeCallInfo {
            call_id: record.call_id.clone(),
            persona_prompt,
            initial_greeting: record.metadata_str("initialMessage").map(str::to_string),
        })
    }

    async fn start_duration_timer(self: &Arc<Self>, call_id: String) {
        let manager = self.clone();
        let max_duration = self.settings.max_duration;
        let id = call_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(max_duration).await;
            info!(call_id = id, "max call duration reached");
            if let Err(e) = manager.end_call_with_reason(&id, EndReason::Timeout).await {
                warn!(call_id = id, "timeout teardown failed: {}", e);
            }
        })
        .abort_handle();
        self.state
            .lock()
            .await
            .duration_timers
            .insert(call_id, handle);
    }

    /// Terminal transition: journal the final record, evict it, and
    /// fire the completion callback.
    async fn finish_call(&self, call_id: &str, reason: EndReason) {
        let completion = {
            let mut state = self.state.lock().await;
            let completion = finish_record_locked(&mut state, call_id, reason);
            if let Some((record, _, _)) = &completion {
                if let Err(e) = self.store.append(record).await {
                    warn!(call_id, "journal append failed: {}", e);
                }
            }
            completion
        };
        fire_completion(completion);
    }
}

/// Finish a record while the state lock is held. Returns the final
/// record plus what the completion callback needs; `None` when the call
/// is unknown or already terminal.
fn finish_record_locked(
    state: &mut ManagerState,
    call_id: &str,
    reason: EndReason,
) -> Option<(CallRecord, Option<PersonaCallInfo>, Option<FnCallComplete>)> {
    let record = state.active.get_mut(call_id)?;
    if !apply_transition(record, reason.as_state()) {
        return None;
    }
    record.end_reason = Some(reason);
    record.ended_at = Some(crate::get_timestamp());

    let record = state.active.remove(call_id)?;
    if let Some(pid) = &record.provider_call_id {
        state.by_provider_id.remove(pid);
    }
    if let Some(timer) = state.duration_timers.remove(call_id) {
        timer.abort();
    }
    let persona = state.persona_info.remove(call_id);
    let handler = state.on_complete.clone();
    info!(
        call_id,
        reason = reason.as_str(),
        "call finished"
    );
    Some((record, persona, handler))
}

fn fire_completion(
    completion: Option<(CallRecord, Option<PersonaCallInfo>, Option<FnCallComplete>)>,
) {
    if let Some((record, persona, Some(handler))) = completion {
        tokio::spawn(async move {
            handler(record, persona).await;
        });
    }
}

fn apply_transition(record: &mut CallRecord, target: CallState) -> bool {
    if record.state.admits(target) {
        record.state = target;
        true
    } else {
        debug!(
            call_id = record.call_id,
            from = ?record.state,
            to = ?target,
            "transition dropped"
        );
        false
    }
}

fn resolve_call_id(state: &ManagerState, event: &NormalizedEvent) -> Option<String> {
    if let Some(id) = &event.call_id {
        if state.active.contains_key(id) {
            return Some(id.clone());
        }
    }
    let pid = event.provider_call_id.as_ref()?;
    state.by_provider_id.get(pid).cloned()
}

/// E.164: a plus sign then 8 to 15 digits.
pub fn is_e164(number: &str) -> bool {
    let Some(digits) = number.strip_prefix('+') else {
        return false;
    };
    (8..=15).contains(&digits.len()) && digits.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MockProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn settings() -> CallManagerSettings {
        CallManagerSettings {
            max_concurrent_calls: 1,
            max_duration: Duration::from_secs(300),
            from_number: "+15550009999".to_string(),
        }
    }

    async fn ready_manager(dir: &TempDir) -> (Arc<CallManager>, Arc<MockProvider>) {
        let manager = CallManager::new(dir.path(), settings(), "secret".into()).unwrap();
        let provider = Arc::new(MockProvider::new());
        manager
            .finalize(
                provider.clone(),
                "http://127.0.0.1:3334/voice/webhook".into(),
                "ws://127.0.0.1:3334/voice/stream".into(),
            )
            .await;
        (manager, provider)
    }

    fn status_event(call_id: &str, pid: &str, status: EventKind, event_id: &str) -> NormalizedEvent {
        NormalizedEvent {
            event_id: event_id.to_string(),
            call_id: Some(call_id.to_string()),
            provider_call_id: Some(pid.to_string()),
            kind: status,
        }
    }

    #[tokio::test]
    async fn test_initiate_creates_record_and_binds_provider_id() {
        let dir = TempDir::new().unwrap();
        let (manager, provider) = ready_manager(&dir).await;

        let call_id = manager
            .initiate_call("+15550001234", "s1", Some("Hi there".into()))
            .await
            .unwrap();

        let record = manager.get_call(&call_id).await.unwrap();
        assert_eq!(record.state, CallState::Initiated);
        assert_eq!(record.metadata_str("initialMessage"), Some("Hi there"));
        let pid = record.provider_call_id.clone().unwrap();
        assert!(manager.get_call_by_provider_id(&pid).await.is_some());
        assert_eq!(provider.initiated.lock().unwrap().len(), 1);
        assert!(provider.initiated.lock().unwrap()[0]
            .webhook_url
            .contains("/voice/webhook"));
    }

    #[tokio::test]
    async fn test_initiate_rejects_bad_number() {
        let dir = TempDir::new().unwrap();
        let (manager, provider) = ready_manager(&dir).await;
        assert!(manager.initiate_call("5551234", "s1", None).await.is_err());
        assert!(manager
            .initiate_call("+1555notanumber", "s1", None)
            .await
            .is_err());
        assert!(provider.initiated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_initiate_without_provider_fails() {
        let dir = TempDir::new().unwrap();
        let manager = CallManager::new(dir.path(), settings(), "secret".into()).unwrap();
        let err = manager
            .initiate_call("+15550001234", "s1", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not initialized"));
    }

    #[tokio::test]
    async fn test_concurrency_cap_enforced() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = ready_manager(&dir).await;
        let first = manager
            .initiate_call("+15550001234", "s1", None)
            .await
            .unwrap();
        let err = manager
            .initiate_call("+15550005678", "s2", None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("concurrent"));

        // Ending the first call frees the slot
        manager.end_call(&first).await.unwrap();
        manager
            .initiate_call("+15550005678", "s2", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_rest_failure_marks_failed() {
        let dir = TempDir::new().unwrap();
        let (manager, provider) = ready_manager(&dir).await;
        provider.fail_next_initiate.store(true, Ordering::SeqCst);

        assert!(manager
            .initiate_call("+15550001234", "s1", None)
            .await
            .is_err());
        assert!(manager.get_active_calls().await.is_empty());

        // The journal's last line for the call reads failed
        let records = manager.store.load_all().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, CallState::Failed);
        assert_eq!(records[0].end_reason, Some(EndReason::Failed));
    }

    #[tokio::test]
    async fn test_lifecycle_happy_path() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = ready_manager(&dir).await;
        let call_id = manager
            .initiate_call("+15550001234", "s1", None)
            .await
            .unwrap();
        let pid = manager
            .get_call(&call_id)
            .await
            .unwrap()
            .provider_call_id
            .unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_handler = fired.clone();
        manager
            .set_on_call_complete(Arc::new(move |record, _| {
                let fired = fired_in_handler.clone();
                Box::pin(async move {
                    assert_eq!(record.end_reason, Some(EndReason::Completed));
                    fired.fetch_add(1, Ordering::SeqCst);
                })
            }))
            .await;

        manager
            .process_event(status_event(&call_id, &pid, EventKind::CallRinging, "e1"))
            .await;
        assert_eq!(
            manager.get_call(&call_id).await.unwrap().state,
            CallState::Ringing
        );

        manager
            .process_event(status_event(&call_id, &pid, EventKind::CallAnswered, "e2"))
            .await;
        let record = manager.get_call(&call_id).await.unwrap();
        assert_eq!(record.state, CallState::Answered);
        assert!(record.answered_at.is_some());

        manager.add_transcript(&call_id, Speaker::Bot, "Hello!".into()).await;
        assert_eq!(
            manager.get_call(&call_id).await.unwrap().state,
            CallState::Speaking
        );
        manager
            .add_transcript(&call_id, Speaker::User, "Hi.".into())
            .await;
        assert_eq!(
            manager.get_call(&call_id).await.unwrap().state,
            CallState::Listening
        );

        manager
            .process_event(status_event(
                &call_id,
                &pid,
                EventKind::CallEnded {
                    reason: EndReason::Completed,
                },
                "e3",
            ))
            .await;

        // Evicted from the active set; final record in the journal
        assert!(manager.get_call(&call_id).await.is_none());
        let stored = manager.get_call_from_store(&call_id).await.unwrap().unwrap();
        assert_eq!(stored.state, CallState::Completed);
        assert_eq!(stored.transcript.len(), 2);
        assert!(stored.ended_at.is_some());

        // Completion fired exactly once
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // A late duplicate terminal event is ignored
        manager
            .process_event(status_event(
                &call_id,
                &pid,
                EventKind::CallEnded {
                    reason: EndReason::Failed,
                },
                "e4",
            ))
            .await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_duplicate_event_id_ignored() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = ready_manager(&dir).await;
        let call_id = manager
            .initiate_call("+15550001234", "s1", None)
            .await
            .unwrap();
        let pid = manager
            .get_call(&call_id)
            .await
            .unwrap()
            .provider_call_id
            .unwrap();

        let speech = EventKind::Speech {
            text: "one".into(),
            is_final: true,
        };
        manager
            .process_event(status_event(&call_id, &pid, speech.clone(), "dup"))
            .await;
        manager
            .process_event(status_event(&call_id, &pid, speech, "dup"))
            .await;
        let record = manager.get_call(&call_id).await.unwrap();
        assert_eq!(record.transcript.len(), 1);
    }

    #[tokio::test]
    async fn test_backward_status_dropped() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = ready_manager(&dir).await;
        let call_id = manager
            .initiate_call("+15550001234", "s1", None)
            .await
            .unwrap();
        let pid = manager
            .get_call(&call_id)
            .await
            .unwrap()
            .provider_call_id
            .unwrap();
        manager
            .process_event(status_event(&call_id, &pid, EventKind::CallAnswered, "e1"))
            .await;
        manager
            .process_event(status_event(&call_id, &pid, EventKind::CallRinging, "e2"))
            .await;
        assert_eq!(
            manager.get_call(&call_id).await.unwrap().state,
            CallState::Answered
        );
    }

    #[tokio::test]
    async fn test_provider_id_rebind_updates_reverse_index() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = ready_manager(&dir).await;
        let call_id = manager
            .initiate_call("+15550001234", "s1", None)
            .await
            .unwrap();
        let stale_pid = manager
            .get_call(&call_id)
            .await
            .unwrap()
            .provider_call_id
            .unwrap();

        // A webhook confirms a different sid than the REST create returned
        manager
            .process_event(NormalizedEvent {
                event_id: "e1".into(),
                call_id: Some(call_id.clone()),
                provider_call_id: Some("CAfresh".into()),
                kind: EventKind::CallRinging,
            })
            .await;

        assert!(manager.get_call_by_provider_id(&stale_pid).await.is_none());
        let rebound = manager.get_call_by_provider_id("CAfresh").await.unwrap();
        assert_eq!(rebound.call_id, call_id);
    }

    #[tokio::test]
    async fn test_max_duration_times_out_call() {
        let dir = TempDir::new().unwrap();
        let manager = CallManager::new(
            dir.path(),
            CallManagerSettings {
                max_concurrent_calls: 1,
                max_duration: Duration::from_millis(200),
                from_number: "+15550009999".into(),
            },
            "secret".into(),
        )
        .unwrap();
        let provider = Arc::new(MockProvider::new());
        manager
            .finalize(
                provider.clone(),
                "http://127.0.0.1:3334/voice/webhook".into(),
                "ws://127.0.0.1:3334/voice/stream".into(),
            )
            .await;

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_in_handler = fired.clone();
        manager
            .set_on_call_complete(Arc::new(move |record, _| {
                let fired = fired_in_handler.clone();
                Box::pin(async move {
                    assert_eq!(record.end_reason, Some(EndReason::Timeout));
                    fired.fetch_add(1, Ordering::SeqCst);
                })
            }))
            .await;

        let call_id = manager
            .initiate_call("+15550001234", "s1", None)
            .await
            .unwrap();
        let pid = manager
            .get_call(&call_id)
            .await
            .unwrap()
            .provider_call_id
            .unwrap();
        manager
            .process_event(status_event(&call_id, &pid, EventKind::CallAnswered, "e1"))
            .await;

        // Wait out the duration timer plus teardown
        for _ in 0..50 {
            if manager.get_call(&call_id).await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert!(manager.get_call(&call_id).await.is_none());
        let stored = manager.get_call_from_store(&call_id).await.unwrap().unwrap();
        assert_eq!(stored.end_reason, Some(EndReason::Timeout));
        // The carrier leg was torn down too
        assert_eq!(provider.hangups.lock().unwrap().as_slice(), &[pid]);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recover_restores_fresh_calls() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = ready_manager(&dir).await;
        let call_id = manager
            .initiate_call("+15550001234", "s1", None)
            .await
            .unwrap();
        let pid = manager
            .get_call(&call_id)
            .await
            .unwrap()
            .provider_call_id
            .unwrap();

        // A new manager over the same store picks the call back up
        let reborn = CallManager::new(dir.path(), settings(), "secret2".into()).unwrap();
        reborn.recover().await.unwrap();
        assert!(reborn.get_call(&call_id).await.is_some());
        assert!(reborn.get_call_by_provider_id(&pid).await.is_some());
    }

    #[test]
    fn test_e164_validation() {
        assert!(is_e164("+15550001234"));
        assert!(is_e164("+442071838750"));
        assert!(!is_e164("15550001234"));
        assert!(!is_e164("+1555"));
        assert!(!is_e164("+1555000123456789"));
        assert!(!is_e164("+1555abc1234"));
    }
}
