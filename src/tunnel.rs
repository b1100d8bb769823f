//! Public-URL discovery through tunnel helper CLIs. The helpers are
//! external collaborators; this module only spawns them, asks where
//! they landed, and tears them down on shutdown.

use anyhow::{anyhow, bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TunnelProviderKind {
    #[default]
    None,
    Ngrok,
    TailscaleServe,
    TailscaleFunnel,
}

pub struct Tunnel {
    kind: TunnelProviderKind,
    child: Option<Child>,
    pub public_url: String,
}

/// Start the configured tunnel helper and wait for its public URL.
/// `None` means no tunnel was requested.
pub async fn start(kind: TunnelProviderKind, port: u16) -> Result<Option<Tunnel>> {
    match kind {
        TunnelProviderKind::None => Ok(None),
        TunnelProviderKind::Ngrok => start_ngrok(port).await.map(Some),
        TunnelProviderKind::TailscaleServe => {
            start_tailscale(port, false).await.map(Some)
        }
        TunnelProviderKind::TailscaleFunnel => start_tailscale(port, true).await.map(Some),
    }
}

async fn start_ngrok(port: u16) -> Result<Tunnel> {
    let child = Command::new("ngrok")
        .args(["http", &port.to_string(), "--log", "stdout"])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| anyhow!("failed to spawn ngrok (is it installed?): {}", e))?;

    // ngrok publishes its tunnels on a local inspection API shortly
    // after startup.
    let client = reqwest::Client::new();
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        let tunnels: serde_json::Value = match client
            .get("http://127.0.0.1:4040/api/tunnels")
            .send()
            .await
        {
            Ok(response) => match response.json().await {
                Ok(body) => body,
                Err(_) => continue,
            },
            Err(_) => continue,
        };
        let url = tunnels["tunnels"]
            .as_array()
            .and_then(|list| {
                list.iter()
                    .filter_map(|t| t["public_url"].as_str())
                    .find(|u| u.starts_with("https://"))
            })
            .map(str::to_string);
        if let Some(public_url) = url {
            info!(public_url, "ngrok tunnel up");
            return Ok(Tunnel {
                kind: TunnelProviderKind::Ngrok,
                child: Some(child),
                public_url,
            });
        }
    }
    bail!("ngrok started but never reported a public URL");
}

async fn start_tailscale(port: u16, funnel: bool) -> Result<Tunnel> {
    let subcommand = if funnel { "funnel" } else { "serve" };
    let status = Command::new("tailscale")
        .args([subcommand, "--bg", &format!("localhost:{}", port)])
        .status()
        .await
        .map_err(|e| anyhow!("failed to run tailscale (is it installed?): {}", e))?;
    if !status.success() {
        bail!("tailscale {} exited with {}", subcommand, status);
    }

    let output = Command::new("tailscale")
        .args(["status", "--json"])
        .output()
        .await?;
    let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    let dns_name = parsed["Self"]["DNSName"]
        .as_str()
        .ok_or_else(|| anyhow!("tailscale status did not include a DNS name"))?
        .trim_end_matches('.');
    let public_url = format!("https://{}", dns_name);
    info!(public_url, mode = subcommand, "tailscale tunnel up");
    Ok(Tunnel {
        kind: if funnel {
            TunnelProviderKind::TailscaleFunnel
        } else {
            TunnelProviderKind::TailscaleServe
        },
        child: None,
        public_url,
    })
}

impl Tunnel {
    pub async fn shutdown(&mut self) {
        match self.kind {
            TunnelProviderKind::Ngrok => {
                if let Some(mut child) = self.child.take() {
                    child.kill().await.ok();
                }
            }
            TunnelProviderKind::TailscaleServe | TunnelProviderKind::TailscaleFunnel => {
                let result = Command::new("tailscale").args(["serve", "reset"]).status().await;
                if let Err(e) = result {
                    warn!("tailscale serve reset failed: {}", e);
                }
            }
            TunnelProviderKind::None => {}
        }
    }
}
