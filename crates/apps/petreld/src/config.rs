use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct DaemonConfig {
    pub local_eid: String,
    pub db_dir: Option<PathBuf>,
    pub payload_dir: Option<PathBuf>,
    #[serde(default)]
    pub interfaces: Vec<InterfaceConfig>,
    #[serde(default)]
    pub links: Vec<LinkConfig>,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub ltp: LtpConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

#[derive(Debug, Deserialize)]
pub struct InterfaceConfig {
    pub name: String,
    pub cla: String,
    pub listen: String,
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct LinkConfig {
    pub name: String,
    pub cla: String,
    pub nexthop: String,
    pub mtu: Option<u64>,
    pub retry_interval_secs: Option<u64>,
    pub max_retry_interval_secs: Option<u64>,
    /// Bring the link AVAILABLE at startup.
    pub available: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct RouteConfig {
    pub pattern: String,
    pub link: String,
    /// "copy" or "unique" (default).
    pub mode: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct LtpConfig {
    pub engine_id: Option<u64>,
    pub agg_size: Option<u64>,
    pub agg_time_ms: Option<u64>,
    pub seg_size: Option<usize>,
    pub retran_intvl_ms: Option<u64>,
    pub retran_retries: Option<u32>,
    pub inact_intvl_ms: Option<u64>,
    pub green: Option<bool>,
    pub rate_bps: Option<u64>,
    pub bucket_depth_bits: Option<u64>,
    /// "standard" or "leaky".
    pub bucket: Option<String>,
    /// Hex preshared key enabling the segment auth trailer.
    pub auth_key: Option<String>,
    pub auth_key_id: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct SecurityConfig {
    #[serde(default)]
    pub ba1: bool,
    #[serde(default)]
    pub pi2: bool,
    #[serde(default)]
    pub pc3: bool,
    #[serde(default)]
    pub es4: bool,
    pub ba1_key_id: Option<u64>,
    /// Hex HMAC key for BA1, applied to all peers.
    pub ba1_key: Option<String>,
    /// Hex Ed25519 signing seed (32 bytes).
    pub signing_key: Option<String>,
    /// Hex X25519 agreement secret (32 bytes).
    pub agreement_secret: Option<String>,
    /// Peer verification keys: eid -> hex Ed25519 public key.
    #[serde(default)]
    pub verify_keys: Vec<PeerKey>,
    /// Peer agreement keys: eid -> hex X25519 public key.
    #[serde(default)]
    pub agreement_keys: Vec<PeerKey>,
}

#[derive(Debug, Deserialize)]
pub struct PeerKey {
    pub eid: String,
    pub key: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct ApiConfig {
    pub addr: Option<String>,
    pub port: Option<u16>,
}

impl DaemonConfig {
    pub fn from_toml(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }

    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }

    /// API bind address after applying `DTNAPI_ADDR` / `DTNAPI_PORT`.
    pub fn api_bind(&self) -> (String, u16) {
        let addr = std::env::var("DTNAPI_ADDR")
            .ok()
            .or_else(|| self.api.addr.clone())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        let port = std::env::var("DTNAPI_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .or(self.api.port)
            .unwrap_or(5010);
        (addr, port)
    }

    pub fn enabled_interfaces(&self) -> impl Iterator<Item = &InterfaceConfig> {
        self.interfaces.iter().filter(|i| i.enabled.unwrap_or(true))
    }
}
