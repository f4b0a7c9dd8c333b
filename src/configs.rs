use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::credentials::{EcCurve, KeyAlgorithm, ProvisioningMode, MIN_RSA_BITS};

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const DEFAULT_NODE_ID: &str = "default";

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub keys: KeyConfig,
    #[serde(default)]
    pub trust: TrustConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default = "default_nodes")]
    pub nodes: Vec<NodeConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            keys: KeyConfig::default(),
            trust: TrustConfig::default(),
            storage: StorageConfig::default(),
            nodes: default_nodes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    #[serde(default = "default_https_host")]
    pub https_host: String,
    #[serde(default = "default_web_root")]
    pub web_root: PathBuf,
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
            https_host: default_https_host(),
            web_root: default_web_root(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

fn default_server_host() -> String {
    "127.0.0.1".to_string()
}

fn default_server_port() -> u16 {
    8082
}

fn default_https_host() -> String {
    "0.0.0.0".to_string()
}

fn default_web_root() -> PathBuf {
    PathBuf::from("web_root")
}

fn default_max_upload_bytes() -> usize {
    64 * 1024
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Text
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    Rsa,
    Ec,
}

/// Algorithm used by "generate key".
#[derive(Debug, Deserialize, Clone)]
pub struct KeyConfig {
    #[serde(default = "default_key_kind")]
    pub algorithm: KeyKind,
    #[serde(default = "default_rsa_bits")]
    pub rsa_bits: u32,
    #[serde(default = "default_ec_curve")]
    pub ec_curve: EcCurve,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            algorithm: default_key_kind(),
            rsa_bits: default_rsa_bits(),
            ec_curve: default_ec_curve(),
        }
    }
}

impl KeyConfig {
    pub fn key_algorithm(&self) -> KeyAlgorithm {
        match self.algorithm {
            KeyKind::Rsa => KeyAlgorithm::Rsa {
                bits: self.rsa_bits,
            },
            KeyKind::Ec => KeyAlgorithm::Ec {
                curve: self.ec_curve,
            },
        }
    }
}

fn default_key_kind() -> KeyKind {
    KeyKind::Rsa
}

fn default_rsa_bits() -> u32 {
    4096
}

fn default_ec_curve() -> EcCurve {
    EcCurve::P256
}

/// Root trust policy for uploaded chains.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TrustConfig {
    /// PEM files holding trusted root certificates.
    #[serde(default)]
    pub trusted_roots: Vec<PathBuf>,
    /// Accept a chain whose last entry is self-signed even when it is not
    /// one of `trusted_roots`.
    #[serde(default)]
    pub allow_self_declared_root: bool,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StorageConfig {
    /// When set, committed credential sets are written below this directory.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct NodeConfig {
    pub id: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default = "default_mode")]
    pub mode: ProvisioningMode,
    #[serde(default = "default_https_port")]
    pub https_port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: DEFAULT_NODE_ID.to_string(),
            hostname: None,
            mode: default_mode(),
            https_port: default_https_port(),
        }
    }
}

fn default_nodes() -> Vec<NodeConfig> {
    vec![NodeConfig::default()]
}

fn default_mode() -> ProvisioningMode {
    ProvisioningMode::Manual
}

fn default_https_port() -> u16 {
    8443
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml(&config_str)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(config_str: &str) -> Result<Self> {
        let config: AppConfig =
            toml::from_str(config_str).context("Failed to parse config file")?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration with default path (config.toml), falling back to
    /// built-in defaults when the file does not exist
    pub fn load() -> Result<Self> {
        if Path::new(DEFAULT_CONFIG_PATH).exists() {
            Self::from_file(DEFAULT_CONFIG_PATH)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            bail!("At least one [[nodes]] entry is required");
        }
        let mut ids = HashSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                bail!("Node id must not be empty");
            }
            if !ids.insert(node.id.as_str()) {
                bail!("Duplicate node id '{}'", node.id);
            }
        }
        if self.keys.algorithm == KeyKind::Rsa && self.keys.rsa_bits < MIN_RSA_BITS {
            bail!(
                "keys.rsa_bits must be at least {} (got {})",
                MIN_RSA_BITS,
                self.keys.rsa_bits
            );
        }
        if self.server.max_upload_bytes == 0 {
            bail!("server.max_upload_bytes must be greater than zero");
        }
        Ok(())
    }

    /// The node addressed when a request does not name one.
    pub fn default_node_id(&self) -> &str {
        self.nodes
            .first()
            .map(|node| node.id.as_str())
            .unwrap_or(DEFAULT_NODE_ID)
    }
}
