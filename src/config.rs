use anyhow::Result;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version = crate::version::get_version_info())]
pub struct Cli {
    #[clap(long, default_value = "supercall.toml")]
    pub conf: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub provider: ProviderKind,
    /// E.164 caller id; required for the real carrier.
    pub from_number: Option<String>,
    pub log_level: Option<String>,
    pub log_file: Option<String>,
    #[serde(default)]
    pub twilio: TwilioConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub serve: ServeConfig,
    #[serde(default)]
    pub tunnel: TunnelConfig,
    /// Explicit public origin; set this when something other than the
    /// tunnel helpers fronts the listener.
    pub public_url: Option<String>,
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,
    #[serde(default = "default_max_duration_seconds")]
    pub max_duration_seconds: u64,
    /// Call journal directory; defaults under the home directory.
    pub store: Option<PathBuf>,
    #[serde(default)]
    pub wake: WakeConfig,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    Twilio,
    Mock,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct TwilioConfig {
    pub account_sid: Option<String>,
    pub auth_token: Option<String>,
}

impl TwilioConfig {
    pub fn account_sid(&self) -> Option<String> {
        self.account_sid
            .clone()
            .or_else(|| std::env::var("TWILIO_ACCOUNT_SID").ok())
    }

    pub fn auth_token(&self) -> Option<String> {
        self.auth_token
            .clone()
            .or_else(|| std::env::var("TWILIO_AUTH_TOKEN").ok())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub openai_api_key: Option<String>,
    pub model: String,
    pub temperature: f64,
    pub voice: String,
    pub transcription_model: String,
    /// Retained for configs written against the earlier server-side VAD
    /// mode; semantic turn detection does not consume them.
    pub silence_duration_ms: u32,
    pub vad_threshold: f64,
    pub stream_path: String,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            openai_api_key: None,
            model: "gpt-realtime".to_string(),
            temperature: 0.8,
            voice: "marin".to_string(),
            transcription_model: "gpt-4o-transcribe".to_string(),
            silence_duration_ms: 800,
            vad_threshold: 0.5,
            stream_path: "/voice/stream".to_string(),
        }
    }
}

impl StreamingConfig {
    pub fn openai_api_key(&self) -> Option<String> {
        self.openai_api_key
            .clone()
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServeConfig {
    pub port: u16,
    pub bind: String,
    pub path: String,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            port: 3334,
            bind: "127.0.0.1".to_string(),
            path: "/voice/webhook".to_string(),
        }
    }
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct TunnelConfig {
    #[serde(default)]
    pub provider: crate::tunnel::TunnelProviderKind,
}

/// Where call-completion summaries get POSTed, so the host agent wakes
/// up with the result.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct WakeConfig {
    pub port: Option<u16>,
    pub token: Option<String>,
}

fn default_max_concurrent_calls() -> usize {
    1
}

fn default_max_duration_seconds() -> u64 {
    300
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: ProviderKind::default(),
            from_number: None,
            log_level: None,
            log_file: None,
            twilio: TwilioConfig::default(),
            streaming: StreamingConfig::default(),
            serve: ServeConfig::default(),
            tunnel: TunnelConfig::default(),
            public_url: None,
            max_concurrent_calls: default_max_concurrent_calls(),
            max_duration_seconds: default_max_duration_seconds(),
            store: None,
            wake: WakeConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let config = toml::from_str(
            &std::fs::read_to_string(path).map_err(|e| anyhow::anyhow!("{}: {}", e, path))?,
        )?;
        Ok(config)
    }

    pub fn store_dir(&self) -> PathBuf {
        self.store.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("clawd")
                .join("supercall-logs")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.provider, ProviderKind::Twilio);
        assert_eq!(config.serve.port, 3334);
        assert_eq!(config.serve.bind, "127.0.0.1");
        assert_eq!(config.serve.path, "/voice/webhook");
        assert_eq!(config.streaming.stream_path, "/voice/stream");
        assert_eq!(config.streaming.silence_duration_ms, 800);
        assert_eq!(config.max_concurrent_calls, 1);
        assert_eq!(config.max_duration_seconds, 300);
        assert!(config.store_dir().ends_with("supercall-logs"));
    }

    #[test]
    fn test_config_dump() {
        let mut config = Config::default();
        config.provider = ProviderKind::Mock;
        config.from_number = Some("+15550009999".to_string());
        config.public_url = Some("https://calls.example.com".to_string());
        config.max_concurrent_calls = 3;

        let config_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&config_str).unwrap();
        assert_eq!(parsed.provider, ProviderKind::Mock);
        assert_eq!(parsed.from_number.as_deref(), Some("+15550009999"));
        assert_eq!(parsed.max_concurrent_calls, 3);
    }

    #[test]
    fn test_tunnel_provider_tags() {
        let config: Config = toml::from_str("[tunnel]\nprovider = \"tailscale-serve\"\n").unwrap();
        assert_eq!(
            config.tunnel.provider,
            crate::tunnel::TunnelProviderKind::TailscaleServe
        );
        let config: Config = toml::from_str("[tunnel]\nprovider = \"none\"\n").unwrap();
        assert_eq!(config.tunnel.provider, crate::tunnel::TunnelProviderKind::None);
    }
}
