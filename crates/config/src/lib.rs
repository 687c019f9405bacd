use anyhow::{bail, Context, Result};
use ln_bridge_core::ExpiryUnit;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

const APP_NAME: &str = "ln-bridge";
const KEYCHAIN_SERVICE: &str = "ln-bridge.ledger";
/// Explicit config file location, overriding the platform default.
pub const CONFIG_PATH_ENV: &str = "LN_BRIDGE_CONFIG";
/// Longest invoice expiry accepted from the config: one year.
const MAX_EXPIRY_SECS: u64 = 365 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub inventory: InventoryConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub base_url: String,
    /// Defaults to `<base_url>/invoice/paid`.
    pub notify_url: Option<String>,
    /// Environment variables holding the HTTP Basic credentials.
    pub user_env: String,
    pub password_env: String,
    pub timeout_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://pay2.email".to_string(),
            notify_url: None,
            user_env: "HTTP_AUTH_USER".to_string(),
            password_env: "HTTP_AUTH_PASSWORD".to_string(),
            timeout_secs: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub rpc_path: Option<String>,
    /// Environment variable that, when set, overrides `rpc_path`.
    pub rpc_env: String,
    pub timeout_secs: u64,
    /// How long one `waitanyinvoice` call may wait for a payment.
    pub wait_window_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            rpc_path: None,
            rpc_env: "LIGHTNING_RPC".to_string(),
            timeout_secs: 20,
            wait_window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    /// Run the replenisher in this process. Disable on all but one instance.
    pub enabled: bool,
    pub target: u64,
    pub amount_sat: u64,
    pub description: String,
    pub expiry_min: u64,
    pub expiry_max: u64,
    pub expiry_unit: ExpiryUnit,
    pub interval_secs: u64,
    pub escalate_after: u32,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            target: 60,
            amount_sat: 20,
            description: "pay2.email".to_string(),
            expiry_min: 7,
            expiry_max: 28,
            expiry_unit: ExpiryUnit::Days,
            interval_secs: 600,
            escalate_after: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_secs: u64,
    pub multiplier: f64,
    pub cap_secs: u64,
    pub jitter: f64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_secs: 30,
            multiplier: 2.0,
            cap_secs: 3600,
            jitter: 0.2,
            max_attempts: 20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub workers: usize,
    pub poll_interval_ms: u64,
    pub retention_days: u64,
    pub prune_interval_secs: u64,
    pub initial_pay_index: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            poll_interval_ms: 5000,
            retention_days: 30,
            prune_interval_secs: 3600,
            initial_pay_index: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub queue_path: String,
    pub audit_log: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            queue_path: ".ln_bridge_queue".to_string(),
            audit_log: Some("audit.jsonl".to_string()),
        }
    }
}

/// HTTP Basic credentials for the ledger service.
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl AppConfig {
    /// Rejects settings the process must not start with.
    pub fn validate(&self) -> Result<()> {
        check_url("ledger.base_url", &self.ledger.base_url)?;
        if let Some(url) = &self.ledger.notify_url {
            check_url("ledger.notify_url", url)?;
        }
        if self.ledger.timeout_secs == 0 || self.node.timeout_secs == 0 {
            bail!("request timeouts must be at least one second");
        }

        let inv = &self.inventory;
        if inv.amount_sat == 0 {
            bail!("inventory.amount_sat must be positive");
        }
        if inv.expiry_min == 0 || inv.expiry_min > inv.expiry_max {
            bail!(
                "inventory expiry range {}..={} is invalid",
                inv.expiry_min,
                inv.expiry_max
            );
        }
        if inv.expiry_unit.to_seconds(inv.expiry_max) > MAX_EXPIRY_SECS {
            bail!("inventory.expiry_max exceeds one year");
        }
        if inv.interval_secs == 0 {
            bail!("inventory.interval_secs must be positive");
        }

        let retry = &self.retry;
        if retry.base_secs == 0 || retry.cap_secs < retry.base_secs {
            bail!("retry.cap_secs must be at least retry.base_secs, both positive");
        }
        if retry.multiplier < 1.0 {
            bail!("retry.multiplier must be at least 1");
        }
        if !(0.0..1.0).contains(&retry.jitter) {
            bail!("retry.jitter must be in [0, 1)");
        }
        if retry.max_attempts == 0 {
            bail!("retry.max_attempts must be positive");
        }

        if self.delivery.workers == 0 {
            bail!("delivery.workers must be positive");
        }
        Ok(())
    }

    /// Node RPC socket: the `node.rpc_env` variable wins over `node.rpc_path`.
    pub fn node_rpc_path(&self) -> Result<PathBuf> {
        if let Ok(path) = std::env::var(&self.node.rpc_env) {
            if !path.is_empty() {
                return Ok(PathBuf::from(path));
            }
        }
        self.node
            .rpc_path
            .as_ref()
            .map(PathBuf::from)
            .with_context(|| {
                format!(
                    "node RPC socket not configured: set {} or node.rpc_path",
                    self.node.rpc_env
                )
            })
    }
}

fn check_url(field: &str, url: &str) -> Result<()> {
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        bail!("{field} must be an http(s) URL, got {url:?}");
    }
    Ok(())
}

/// Loads the config from `$LN_BRIDGE_CONFIG` if set, else from the platform
/// config directory. A missing file is created with defaults.
pub fn load() -> Result<AppConfig> {
    let cfg: AppConfig = match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) => load_path(&path)?,
        Err(_) => confy::load(APP_NAME, None).context("Failed to load app config")?,
    };
    Ok(cfg)
}

pub fn load_path(path: &str) -> Result<AppConfig> {
    confy::load_path(path).with_context(|| format!("Failed to load app config from {path}"))
}

/// Reads the ledger credentials from the configured environment variables,
/// falling back to the OS keychain.
pub fn load_credentials(ledger: &LedgerConfig) -> Result<Credentials> {
    let username = std::env::var(&ledger.user_env)
        .or_else(|_| get_secret("ledger_username"))
        .map_err(|_| {
            anyhow::anyhow!("{} not set and no ledger_username in keychain", ledger.user_env)
        })?;
    let password = std::env::var(&ledger.password_env)
        .or_else(|_| get_secret("ledger_password"))
        .map_err(|_| {
            anyhow::anyhow!(
                "{} not set and no ledger_password in keychain",
                ledger.password_env
            )
        })?;

    if username.is_empty() || password.is_empty() {
        bail!("ledger credentials must not be empty");
    }
    Ok(Credentials { username, password })
}

/// Retrieve a secret from the OS keychain
pub fn get_secret(key: &str) -> Result<String> {
    let entry = keyring::Entry::new(KEYCHAIN_SERVICE, key)?;
    let password = entry.get_password()?;
    Ok(password)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_are_valid() {
        let cfg = AppConfig::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.inventory.target, 60);
        assert_eq!(cfg.inventory.amount_sat, 20);
        assert_eq!(cfg.retry.base_secs, 30);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ln-bridge.toml");
        std::fs::write(
            &path,
            "[inventory]\ntarget = 80\nexpiry_unit = \"seconds\"\nexpiry_min = 3600\nexpiry_max = 7200\n",
        )
        .unwrap();

        let cfg = load_path(path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.inventory.target, 80);
        assert_eq!(cfg.inventory.expiry_unit, ExpiryUnit::Seconds);
        assert_eq!(cfg.inventory.amount_sat, 20);
        assert_eq!(cfg.ledger.user_env, "HTTP_AUTH_USER");
        cfg.validate().unwrap();
    }

    #[test]
    fn inverted_expiry_range_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.inventory.expiry_min = 30;
        cfg.inventory.expiry_max = 7;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn expiry_beyond_a_year_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.inventory.expiry_max = 365;
        cfg.validate().unwrap();

        cfg.inventory.expiry_max = u64::MAX;
        assert!(cfg.validate().is_err());

        cfg.inventory.expiry_unit = ExpiryUnit::Seconds;
        cfg.inventory.expiry_min = 3600;
        cfg.inventory.expiry_max = 400 * 24 * 60 * 60;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn non_http_notify_url_is_rejected() {
        let mut cfg = AppConfig::default();
        cfg.ledger.notify_url = Some("ftp://example.com/paid".to_string());
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rpc_env_overrides_configured_path() {
        let mut cfg = AppConfig::default();
        cfg.node.rpc_env = "LN_BRIDGE_TEST_RPC_OVERRIDE".to_string();
        cfg.node.rpc_path = Some("/from/config".to_string());
        assert_eq!(cfg.node_rpc_path().unwrap(), PathBuf::from("/from/config"));

        std::env::set_var("LN_BRIDGE_TEST_RPC_OVERRIDE", "/from/env");
        assert_eq!(cfg.node_rpc_path().unwrap(), PathBuf::from("/from/env"));
        std::env::remove_var("LN_BRIDGE_TEST_RPC_OVERRIDE");
    }

    #[test]
    fn missing_rpc_path_is_an_error() {
        let mut cfg = AppConfig::default();
        cfg.node.rpc_env = "LN_BRIDGE_TEST_RPC_UNSET".to_string();
        assert!(cfg.node_rpc_path().is_err());
    }

    #[test]
    fn credentials_come_from_configured_env_vars() {
        let ledger = LedgerConfig {
            user_env: "LN_BRIDGE_TEST_USER".to_string(),
            password_env: "LN_BRIDGE_TEST_PASSWORD".to_string(),
            ..LedgerConfig::default()
        };
        std::env::set_var("LN_BRIDGE_TEST_USER", "alice");
        std::env::set_var("LN_BRIDGE_TEST_PASSWORD", "secret");

        let creds = load_credentials(&ledger).unwrap();
        assert_eq!(creds.username, "alice");
        assert_eq!(creds.password, "secret");
    }
}
