//! In-process carrier stand-in for tests: accepts every webhook, mints
//! synthetic call ids, and records the REST traffic it would have sent.

use super::{
    events_from_form, CallProvider, NormalizedEvent, VerifyOutcome, WebhookReply, WebhookRequest,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub call_id: String,
    pub from: String,
    pub to: String,
    pub webhook_url: String,
}

#[derive(Default)]
pub struct MockProvider {
    counter: AtomicU64,
    pub initiated: Mutex<Vec<MockCall>>,
    pub hangups: Mutex<Vec<String>>,
    /// When set, the next `initiate_call` fails like a carrier outage.
    pub fail_next_initiate: AtomicBool,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallProvider for MockProvider {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn verify_webhook(&self, _request: &WebhookRequest) -> VerifyOutcome {
        VerifyOutcome {
            ok: true,
            reason: None,
            url: None,
            ngrok_free_tier: false,
        }
    }

    fn parse_webhook_event(&self, request: &WebhookRequest) -> (Vec<NormalizedEvent>, WebhookReply) {
        (events_from_form(request), WebhookReply::empty_document())
    }

    async fn initiate_call(
        &self,
        call_id: &str,
        from: &str,
        to: &str,
        webhook_url: &str,
    ) -> Result<String> {
        if self.fail_next_initiate.swap(false, Ordering::SeqCst) {
            return Err(anyhow!("mock carrier outage"));
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let sid = format!("MC{:08}", n);
        self.initiated.lock().unwrap().push(MockCall {
            call_id: call_id.to_string(),
            from: from.to_string(),
            to: to.to_string(),
            webhook_url: webhook_url.to_string(),
        });
        Ok(sid)
    }

    async fn hangup_call(&self, provider_call_id: &str) -> Result<()> {
        self.hangups
            .lock()
            .unwrap()
            .push(provider_call_id.to_string());
        Ok(())
    }

    fn set_public_url(&self, _url: &str) {}
}
