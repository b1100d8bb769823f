//! Twilio adapter: Calls REST resource for placing and ending calls,
//! status webhooks in, TwiML control documents out.

use super::{
    events_from_form, signature, CallProvider, NormalizedEvent, VerifyOutcome, WebhookReply,
    WebhookRequest,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{info, warn};

const API_BASE: &str = "https://api.twilio.com/2010-04-01";

/// Seconds the carrier lets the destination ring before giving up.
const DIAL_TIMEOUT_SECS: &str = "30";

pub struct TwilioProvider {
    account_sid: String,
    auth_token: String,
    stream_path: String,
    /// Overrides header-based URL reconstruction during verification.
    override_public_url: Option<String>,
    /// Public origin the carrier can reach us on; learned after tunnel
    /// discovery, hence the interior lock.
    public_url: RwLock<Option<String>>,
    client: Client,
}

impl TwilioProvider {
    pub fn new(
        account_sid: String,
        auth_token: String,
        stream_path: String,
        override_public_url: Option<String>,
    ) -> Self {
        Self {
            account_sid,
            auth_token,
            stream_path,
            override_public_url,
            public_url: RwLock::new(None),
            client: Client::builder()
                .timeout(Duration::from_secs(15))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn stream_url(&self) -> Option<String> {
        let public = self.public_url.read().ok()?.clone()?;
        let origin = public
            .replace("https://", "wss://")
            .replace("http://", "ws://");
        let origin = origin.trim_end_matches('/');
        Some(format!("{}{}", origin, self.stream_path))
    }

    fn connect_stream_document(&self) -> WebhookReply {
        match self.stream_url() {
            Some(url) => WebhookReply::xml(format!(
                "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Connect><Stream url=\"{}\"/></Connect></Response>",
                url
            )),
            None => {
                warn!("no public URL yet; answering with a pause instead of a stream");
                pause_document()
            }
        }
    }
}

fn pause_document() -> WebhookReply {
    WebhookReply::xml(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?><Response><Pause length=\"30\"/></Response>"
            .to_string(),
    )
}

#[async_trait]
impl CallProvider for TwilioProvider {
    fn name(&self) -> &'static str {
        "twilio"
    }

    fn verify_webhook(&self, request: &WebhookRequest) -> VerifyOutcome {
        signature::verify(
            request,
            &self.auth_token,
            self.override_public_url.as_deref(),
        )
    }

    fn parse_webhook_event(&self, request: &WebhookRequest) -> (Vec<NormalizedEvent>, WebhookReply) {
        let events = events_from_form(request);
        let form = request.form_map();

        let is_status_callback = request.query_param("type").as_deref() == Some("status");
        let reply = if is_status_callback {
            WebhookReply::empty_document()
        } else {
            let direction = form.get("Direction").map(String::as_str).unwrap_or("");
            let in_progress = form.get("CallStatus").map(String::as_str) == Some("in-progress");
            if direction.starts_with("outbound") || direction == "inbound" || in_progress {
                self.connect_stream_document()
            } else {
                pause_document()
            }
        };
        (events, reply)
    }

    async fn initiate_call(
        &self,
        call_id: &str,
        from: &str,
        to: &str,
        webhook_url: &str,
    ) -> Result<String> {
        let url = format!("{}/Accounts/{}/Calls.json", API_BASE, self.account_sid);
        let voice_url = format!("{}?callId={}", webhook_url, call_id);
        let status_callback = format!("{}?callId={}&type=status", webhook_url, call_id);

        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[
                ("To", to),
                ("From", from),
                ("Url", voice_url.as_str()),
                ("StatusCallback", status_callback.as_str()),
                ("StatusCallbackEvent", "initiated"),
                ("StatusCallbackEvent", "ringing"),
                ("StatusCallbackEvent", "answered"),
                ("StatusCallbackEvent", "completed"),
                ("Record", "true"),
                ("RecordingChannels", "dual"),
                ("Timeout", DIAL_TIMEOUT_SECS),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("carrier refused call create ({}): {}", status, body));
        }

        let body: serde_json::Value = response.json().await?;
        let sid = body["sid"]
            .as_str()
            .ok_or_else(|| anyhow!("carrier response missing call sid"))?
            .to_string();
        info!(call_id, sid, to, "outbound call created");
        Ok(sid)
    }

    async fn hangup_call(&self, provider_call_id: &str) -> Result<()> {
        let url = format!(
            "{}/Accounts/{}/Calls/{}.json",
            API_BASE, self.account_sid, provider_call_id
        );
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("Status", "completed")])
            .send()
            .await?;

        let status = response.status();
        // 404 means the call is already gone, which is what we wanted.
        if status.is_success() || status.as_u16() == 404 {
            info!(sid = provider_call_id, "call hung up");
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(anyhow!("carrier refused hangup ({}): {}", status, body))
        }
    }

    fn set_public_url(&self, url: &str) {
        if let Ok(mut guard) = self.public_url.write() {
            *guard = Some(url.trim_end_matches('/').to_string());
        }
    }
}
