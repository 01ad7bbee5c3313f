use std::{net::IpAddr, path::Path, sync::OnceLock, time::Duration};

use media_bus::profile::WireProfile;
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Sim,
    Gstreamer,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ChatConfig {
    nick: String,
    /// Joining an activity someone else shared.
    shared: bool,
    local_ip: Option<IpAddr>,
    /// Base URL of the peer's control API, e.g. `http://10.0.0.5:8080`.
    peer_api: Option<String>,
    api_listen: String,
    backend: BackendKind,
    settle_timeout_ms: u64,
    wire: WireProfile,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            nick: "ovc".to_string(),
            shared: false,
            local_ip: None,
            peer_api: None,
            api_listen: "0.0.0.0:8080".to_string(),
            backend: if cfg!(feature = "gstreamer") {
                BackendKind::Gstreamer
            } else {
                BackendKind::Sim
            },
            settle_timeout_ms: 5000,
            wire: WireProfile::default(),
        }
    }
}

impl ChatConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("reading {}: {}", path.display(), e))?;
        let config: ChatConfig = serde_json::from_str(&raw)
            .map_err(|e| anyhow::anyhow!("parsing {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.nick.trim().is_empty() {
            return Err(anyhow::anyhow!("nick must not be empty"));
        }
        if self.settle_timeout_ms == 0 {
            return Err(anyhow::anyhow!("settle_timeout_ms must be positive"));
        }
        if self.backend == BackendKind::Gstreamer && !cfg!(feature = "gstreamer") {
            return Err(anyhow::anyhow!(
                "backend `gstreamer` requested but not compiled in"
            ));
        }
        self.wire.validate()
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }

    pub fn shared(&self) -> bool {
        self.shared
    }

    pub fn local_ip(&self) -> Option<IpAddr> {
        self.local_ip
    }

    pub fn peer_api(&self) -> Option<&str> {
        self.peer_api.as_deref()
    }

    pub fn api_listen(&self) -> &str {
        &self.api_listen
    }

    pub fn backend(&self) -> BackendKind {
        self.backend
    }

    pub fn settle_timeout(&self) -> Duration {
        Duration::from_millis(self.settle_timeout_ms)
    }

    pub fn wire(&self) -> &WireProfile {
        &self.wire
    }
}

static CONFIG: OnceLock<ChatConfig> = OnceLock::new();

/// Loads the config named by the first CLI argument or `OVC_CONFIG`, falling
/// back to defaults. Only the first call reads anything.
pub fn load() -> anyhow::Result<&'static ChatConfig> {
    if let Some(config) = CONFIG.get() {
        return Ok(config);
    }
    let path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("OVC_CONFIG").ok());
    let config = match path {
        Some(path) => ChatConfig::from_file(Path::new(&path))?,
        None => {
            let config = ChatConfig::default();
            config.validate()?;
            config
        }
    };
    Ok(CONFIG.get_or_init(|| config))
}
