//! Reachability preflight: before any call is placed, prove the public
//! webhook answers us and the media-stream endpoint accepts upgrades.
//! A carrier dialing a dead webhook burns a real phone call.

use anyhow::{anyhow, Result};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const SELF_TEST_HEADER: &str = "x-supercall-self-test";

const PROBE_TIMEOUT: Duration = Duration::from_secs(4);

/// A passing preflight is trusted for this long.
const CACHE_TTL: Duration = Duration::from_secs(30);

pub struct Preflight {
    client: reqwest::Client,
    last_success: Mutex<Option<Instant>>,
}

impl Preflight {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(PROBE_TIMEOUT)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            last_success: Mutex::new(None),
        }
    }

    /// Probe the webhook URL and the media-stream web-socket. Loopback
    /// webhook hosts skip the probes; the carrier could never reach
    /// them anyway and local setups answer for themselves.
    pub async fn check(&self, webhook_url: &str, ws_url: &str, boot_secret: &str) -> Result<()> {
        if is_loopback(webhook_url) {
            debug!("loopback webhook host; skipping preflight");
            return Ok(());
        }
        if let Some(at) = *self.last_success.lock().unwrap() {
            if at.elapsed() < CACHE_TTL {
                debug!("preflight cached");
                return Ok(());
            }
        }

        self.probe_http(webhook_url, boot_secret).await?;
        self.probe_ws(ws_url).await?;

        *self.last_success.lock().unwrap() = Some(Instant::now());
        info!(webhook_url, ws_url, "preflight passed");
        Ok(())
    }

    async fn probe_http(&self, webhook_url: &str, boot_secret: &str) -> Result<()> {
        let response = self
            .client
            .post(webhook_url)
            .header(SELF_TEST_HEADER, boot_secret)
            .send()
            .await
            .map_err(|e| anyhow!("webhook unreachable at {}: {}", webhook_url, e))?;
        if response.status().as_u16() != 200 {
            return Err(anyhow!(
                "webhook self-test at {} answered {}; is something else on this URL?",
                webhook_url,
                response.status()
            ));
        }
        Ok(())
    }

    async fn probe_ws(&self, ws_url: &str) -> Result<()> {
        let connect = tokio_tungstenite::connect_async(ws_url);
        let (mut socket, _) = tokio::time::timeout(PROBE_TIMEOUT, connect)
            .await
            .map_err(|_| anyhow!("media-stream probe to {} timed out", ws_url))?
            .map_err(|e| anyhow!("media-stream endpoint refused upgrade at {}: {}", ws_url, e))?;
        socket.close(None).await.ok();
        Ok(())
    }
}

fn is_loopback(url: &str) -> bool {
    match reqwest::Url::parse(url) {
        Ok(parsed) => match parsed.host_str() {
            Some(host) => {
                // IPv6 hosts serialize with brackets
                let host = host.trim_start_matches('[').trim_end_matches(']');
                host == "localhost"
                    || host
                        .parse::<std::net::IpAddr>()
                        .map(|ip| ip.is_loopback())
                        .unwrap_or(false)
            }
            None => false,
        },
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_detection() {
        assert!(is_loopback("http://127.0.0.1:3334/voice/webhook"));
        assert!(is_loopback("http://localhost/voice/webhook"));
        assert!(is_loopback("http://[::1]:3334/voice/webhook"));
        assert!(!is_loopback("https://calls.example.com/voice/webhook"));
        assert!(!is_loopback("https://10.0.0.8/voice/webhook"));
    }

    #[tokio::test]
    async fn test_loopback_skips_probes() {
        let preflight = Preflight::new();
        // Nothing is listening; this passes only because of the skip
        preflight
            .check(
                "http://127.0.0.1:1/voice/webhook",
                "ws://127.0.0.1:1/voice/stream",
                "secret",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_public_host_fails() {
        let preflight = Preflight::new();
        let err = preflight
            .check(
                // Reserved TEST-NET address; nothing answers
                "http://192.0.2.1:9/voice/webhook",
                "ws://192.0.2.1:9/voice/stream",
                "secret",
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unreachable"));
    }

    #[test]
    fn test_cache_marks_success() {
        let preflight = Preflight::new();
        *preflight.last_success.lock().unwrap() = Some(Instant::now());
        let cached = preflight.last_success.lock().unwrap().unwrap();
        assert!(cached.elapsed() < CACHE_TTL);
    }
}
