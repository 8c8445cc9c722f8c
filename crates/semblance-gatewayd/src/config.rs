//! Configuration for semblance-gatewayd

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use semblance_audit::{AuditTrail, JsonlAuditStore, MemoryAuditStore};
use semblance_crypto::SigningKey;
use semblance_gateway::GatewayConfig;
use serde::{Deserialize, Serialize};

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Pipeline configuration
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Audit storage
    #[serde(default)]
    pub audit: AuditConfig,

    /// Where the signing key comes from. The key itself never lives here.
    #[serde(default)]
    pub key: KeyConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Audit storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuditConfig {
    /// Volatile, lost on exit
    Memory,

    /// Append-only JSON lines file
    File { path: PathBuf },
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig::File {
            path: PathBuf::from("semblance-audit.jsonl"),
        }
    }
}

impl AuditConfig {
    pub async fn open(&self) -> anyhow::Result<Arc<AuditTrail>> {
        let trail = match self {
            AuditConfig::Memory => AuditTrail::open(Arc::new(MemoryAuditStore::new())).await?,
            AuditConfig::File { path } => {
                let store = JsonlAuditStore::new(path)
                    .await
                    .with_context(|| format!("opening audit file {}", path.display()))?;
                AuditTrail::open(Arc::new(store)).await?
            }
        };
        Ok(Arc::new(trail))
    }
}

/// Signing key provisioning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    /// Environment variable holding the hex-encoded key.
    #[serde(default = "default_key_env")]
    pub env: String,

    /// File holding the hex-encoded key, used when the variable is unset.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            env: default_key_env(),
            file: None,
        }
    }
}

impl KeyConfig {
    pub fn resolve(&self) -> anyhow::Result<SigningKey> {
        if let Ok(hex) = std::env::var(&self.env) {
            return SigningKey::from_hex(&hex)
                .with_context(|| format!("decoding signing key from ${}", self.env));
        }
        if let Some(path) = &self.file {
            let hex = std::fs::read_to_string(path)
                .with_context(|| format!("reading key file {}", path.display()))?;
            return SigningKey::from_hex(&hex)
                .with_context(|| format!("decoding key file {}", path.display()));
        }
        bail!(
            "no signing key: set ${} or configure key.file",
            self.env
        )
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_key_env() -> String {
    "SEMBLANCE_SIGNING_KEY".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    /// Load configuration: defaults, then the optional file, then
    /// `SEMBLANCE_`-prefixed environment variables (`__` between levels).
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&DaemonConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("SEMBLANCE")
                .prefix_separator("_")
                .separator("__")
                .list_separator(",")
                .with_list_parse_key("gateway.allowlist")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
