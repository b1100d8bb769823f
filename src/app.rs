//! Runtime assembly: builds the call manager, provider, bridge and
//! front door from config, owns the tunnel lifecycle, and exposes the
//! tool surface plus the completion sink.

use crate::call::{CallManager, CallManagerSettings, PersonaCallInfo};
use crate::config::{Config, ProviderKind, WakeConfig};
use crate::handler::{self, FrontDoor};
use crate::provider::{CallProvider, MockProvider, TwilioProvider};
use crate::stream::{BridgeHooks, ModelSettings, StreamBridge};
use crate::tool::{self, ToolAction};
use crate::tunnel;
use anyhow::{bail, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde_json::json;
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{info, warn};

pub struct AppBuilder {
    pub config: Option<Config>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self { config: None }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    pub fn build(self) -> Result<App> {
        let config = self.config.unwrap_or_default();
        App::new(config)
    }
}

pub struct App {
    pub config: Config,
    manager: Arc<CallManager>,
    provider: Arc<dyn CallProvider>,
    bridge: Arc<StreamBridge>,
    wake: Arc<WakeSink>,
    wake_events: Option<mpsc::UnboundedReceiver<String>>,
}

impl App {
    fn new(config: Config) -> Result<Self> {
        let openai_api_key = config.streaming.openai_api_key();
        let provider: Arc<dyn CallProvider> = match config.provider {
            ProviderKind::Twilio => {
                let account_sid = config
                    .twilio
                    .account_sid()
                    .context("twilio.account_sid missing (or set TWILIO_ACCOUNT_SID)")?;
                let auth_token = config
                    .twilio
                    .auth_token()
                    .context("twilio.auth_token missing (or set TWILIO_AUTH_TOKEN)")?;
                if config.from_number.is_none() {
                    bail!("from_number is required for the twilio provider");
                }
                if openai_api_key.is_none() {
                    bail!("streaming.openai_api_key missing (or set OPENAI_API_KEY)");
                }
                Arc::new(TwilioProvider::new(
                    account_sid,
                    auth_token,
                    config.streaming.stream_path.clone(),
                    config.public_url.clone(),
                ))
            }
            ProviderKind::Mock => Arc::new(MockProvider::new()),
        };

        // Process-local; proves self-test requests came from this boot.
        let boot_secret = BASE64.encode(rand::random::<[u8; 24]>());

        let manager = CallManager::new(
            &config.store_dir(),
            CallManagerSettings {
                max_concurrent_calls: config.max_concurrent_calls,
                max_duration: Duration::from_secs(config.max_duration_seconds),
                from_number: config.from_number.clone().unwrap_or_default(),
            },
            boot_secret,
        )?;

        let bridge = Arc::new(StreamBridge::new(
            bridge_hooks(&manager),
            ModelSettings {
                api_key: openai_api_key.unwrap_or_default(),
                model: config.streaming.model.clone(),
                temperature: config.streaming.temperature,
                voice: config.streaming.voice.clone(),
                transcription_model: config.streaming.transcription_model.clone(),
            },
        ));

        let (wake, wake_events) = WakeSink::new(&config.wake);

        Ok(Self {
            config,
            manager,
            provider,
            bridge,
            wake,
            wake_events: Some(wake_events),
        })
    }

    pub fn manager(&self) -> Arc<CallManager> {
        self.manager.clone()
    }

    /// Completion summaries that could not be delivered to the wake URL
    /// land here instead.
    pub fn take_wake_events(&mut self) -> Option<mpsc::UnboundedReceiver<String>> {
        self.wake_events.take()
    }

    /// Run one tool action against this runtime.
    pub async fn execute(&self, action: ToolAction) -> serde_json::Value {
        tool::execute(&self.manager, action).await
    }

    /// Serve until ctrl-c: journal recovery, listener, public-URL
    /// discovery, provider finalization, then teardown in tunnel-first
    /// order.
    pub async fn run(self) -> Result<()> {
        self.manager.recover().await?;

        let wake = self.wake.clone();
        self.manager
            .set_on_call_complete(Arc::new(
                move |record, persona: Option<PersonaCallInfo>| {
                    let wake = wake.clone();
                    Box::pin(async move {
                        let text = tool::completion_summary(&record, persona.as_ref());
                        wake.deliver(text).await;
                    })
                },
            ))
            .await;

        let router = handler::router(
            FrontDoor {
                manager: self.manager.clone(),
                bridge: self.bridge.clone(),
                provider: self.provider.clone(),
                boot_secret: self.manager.boot_secret().to_string(),
            },
            &self.config.serve.path,
            &self.config.streaming.stream_path,
        );

        let addr: SocketAddr = format!("{}:{}", self.config.serve.bind, self.config.serve.port)
            .parse()
            .context("serve.bind/serve.port do not form a socket address")?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;
        info!(%addr, "listening");
        let mut server = tokio::spawn(axum::serve(listener, router).into_future());

        // Public URL: explicit override beats tunnel discovery; with
        // neither, only loopback callers can reach us.
        let mut tunnel = None;
        let public_url = match &self.config.public_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => match tunnel::start(self.config.tunnel.provider, self.config.serve.port).await?
            {
                Some(t) => {
                    let url = t.public_url.clone();
                    tunnel = Some(t);
                    url
                }
                None => format!("http://{}", addr),
            },
        };
        self.provider.set_public_url(&public_url);

        let webhook_url = format!("{}{}", public_url, self.config.serve.path);
        let stream_ws_url = format!(
            "{}{}",
            public_url
                .replacen("https://", "wss://", 1)
                .replacen("http://", "ws://", 1),
            self.config.streaming.stream_path
        );
        self.manager
            .finalize(self.provider.clone(), webhook_url, stream_ws_url)
            .await;
        info!(public_url, "call runtime ready");

        tokio::select! {
            result = &mut server => {
                result.context("listener task panicked")??;
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
            }
        }

        if let Some(mut tunnel) = tunnel {
            tunnel.shutdown().await;
        }
        server.abort();
        Ok(())
    }
}

fn bridge_hooks(manager: &Arc<CallManager>) -> BridgeHooks {
    let lookup = manager.clone();
    let ender = manager.clone();
    let scribe = manager.clone();
    BridgeHooks {
        lookup_call: Arc::new(move |provider_call_id| {
            let manager = lookup.clone();
            Box::pin(async move { manager.bridge_info(&provider_call_id).await })
        }),
        end_call: Arc::new(move |call_id, reason| {
            let manager = ender.clone();
            Box::pin(async move {
                info!(call_id, reason, "bridge requested hangup");
                if let Err(e) = manager.end_call(&call_id).await {
                    warn!(call_id, "hangup failed: {}", e);
                }
            })
        }),
        add_transcript: Arc::new(move |call_id, speaker, text| {
            let manager = scribe.clone();
            Box::pin(async move {
                manager.add_transcript(&call_id, speaker, text).await;
            })
        }),
    }
}

/// Delivers completion summaries to the host's wake endpoint; failures
/// fall back to an in-process channel the host can drain.
pub struct WakeSink {
    url: Option<String>,
    token: Option<String>,
    client: reqwest::Client,
    fallback: mpsc::UnboundedSender<String>,
}

impl WakeSink {
    fn new(config: &WakeConfig) -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (fallback, rx) = mpsc::unbounded_channel();
        let sink = Self {
            url: config
                .port
                .map(|port| format!("http://127.0.0.1:{}/hooks/wake", port)),
            token: config.token.clone(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            fallback,
        };
        (Arc::new(sink), rx)
    }

    pub async fn deliver(&self, text: String) {
        if let Some(url) = &self.url {
            let mut request = self
                .client
                .post(url)
                .json(&json!({"text": text, "mode": "now"}));
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }
            match request.send().await {
                Ok(response) if response.status().is_success() => return,
                Ok(response) => warn!(status = %response.status(), "wake endpoint refused summary"),
                Err(e) => warn!("wake endpoint unreachable: {}", e),
            }
        }
        // Fire-and-forget; a missing consumer just drops the summary.
        self.fallback.send(text).ok();
    }
}
