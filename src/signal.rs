use std::{net::IpAddr, sync::Arc};

use serde::Serialize;

use crate::media::types::SignalEvent;

/// Outbound half of the signaling channel to the peer.
///
/// Calls must not block: the orchestrator invokes them from its control loop.
pub trait Signaling: Send + Sync {
    fn is_connected(&self) -> bool;

    fn announce_ip(&self, ip: IpAddr) -> anyhow::Result<()>;

    /// `line` is the formatted transcript line, `nick` the local sender.
    fn send_chat(&self, nick: &str, line: &str) -> anyhow::Result<()>;
}

/// Resolves the address announced to the peer.
pub type AddressResolver = Arc<dyn Fn() -> anyhow::Result<IpAddr> + Send + Sync>;

/// Configured override first, then the first non-loopback interface.
pub fn address_resolver(configured: Option<IpAddr>) -> AddressResolver {
    Arc::new(move || match configured {
        Some(ip) => Ok(ip),
        None => local_ip_address::local_ip()
            .map_err(|e| anyhow::anyhow!("could not find ip address: {}", e)),
    })
}

/// Delivers signaling events to the peer's control API as JSON POSTs.
pub struct HttpSignaling {
    client: reqwest::Client,
    peer_api: Option<String>,
}

impl HttpSignaling {
    pub fn new(peer_api: Option<&str>) -> Self {
        Self {
            client: reqwest::Client::new(),
            peer_api: peer_api.map(|url| url.trim_end_matches('/').to_string()),
        }
    }

    fn post<T: Serialize>(&self, path: &str, body: &T) -> anyhow::Result<()> {
        let base = self
            .peer_api
            .as_deref()
            .ok_or_else(|| anyhow::anyhow!("no peer control api configured"))?;
        let url = format!("{}{}", base, path);
        let body = serde_json::to_value(body)?;
        let client = self.client.clone();
        tokio::spawn(async move {
            match client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    log::debug!("signal: POST {} -> {}", url, resp.status())
                }
                Ok(resp) => log::warn!("signal: POST {} rejected: {}", url, resp.status()),
                Err(e) => log::warn!("signal: POST {} failed: {}", url, e),
            }
        });
        Ok(())
    }
}

impl Signaling for HttpSignaling {
    fn is_connected(&self) -> bool {
        self.peer_api.is_some()
    }

    fn announce_ip(&self, ip: IpAddr) -> anyhow::Result<()> {
        log::info!("signal: announcing {}", ip);
        self.post("/signal", &SignalEvent::PeerIpAnnounced { ip })
    }

    fn send_chat(&self, nick: &str, line: &str) -> anyhow::Result<()> {
        self.post(
            "/signal",
            &SignalEvent::ChatMessageReceived {
                sender: nick.to_string(),
                text: line.to_string(),
            },
        )
    }
}
