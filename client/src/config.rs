use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    #[serde(default)]
    pub inventory: InventoryConfig,
    #[serde(default)]
    pub transactions: TransactionConfig,
    pub attachments: Option<AttachmentConfig>,
}

#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize)]
pub struct LedgerConfig {
    /// JSON-RPC endpoint used for contract reads and receipts.
    pub url: String,
    pub contract_address: String,
}

#[derive(Debug, Deserialize)]
pub struct WalletConfig {
    /// Signer endpoint; falls back to the ledger url when absent.
    pub url: Option<String>,
    #[serde(default = "default_notification_poll_ms")]
    pub notification_poll_ms: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        WalletConfig {
            url: None,
            notification_poll_ms: default_notification_poll_ms(),
        }
    }
}

fn default_notification_poll_ms() -> u64 {
    2_000
}

#[derive(Debug, Deserialize)]
pub struct CatalogConfig {
    /// Highest event id the discovery scan will read.
    #[serde(default = "default_scan_ceiling")]
    pub scan_ceiling: u64,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        CatalogConfig {
            scan_ceiling: default_scan_ceiling(),
        }
    }
}

fn default_scan_ceiling() -> u64 {
    20
}

#[derive(Debug, Deserialize)]
pub struct InventoryConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        InventoryConfig {
            page_size: default_page_size(),
        }
    }
}

fn default_page_size() -> u64 {
    6
}

#[derive(Debug, Deserialize)]
pub struct TransactionConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        TransactionConfig {
            poll_interval_ms: default_poll_interval_ms(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
        }
    }
}

impl TransactionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_confirmation_timeout_secs() -> u64 {
    120
}

#[derive(Debug, Deserialize)]
pub struct AttachmentConfig {
    pub url: String,
}

pub fn read_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let s = fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file '{}'", path.as_ref().display()))?;
    let cfg: Config = toml::from_str(&s).context("failed to parse TOML config")?;
    Ok(cfg)
}

pub fn read_config_from_toml() -> Result<Config> {
    // ./config/config.toml first, then the crate's own config directory
    let cwd_config = std::path::PathBuf::from("config").join("config.toml");
    if cwd_config.exists() {
        return read_config(&cwd_config);
    }

    if let Ok(crate_root) = std::env::var("CARGO_MANIFEST_DIR") {
        let cargo_config = std::path::PathBuf::from(&crate_root)
            .join("config")
            .join("config.toml");
        if cargo_config.exists() {
            return read_config(&cargo_config);
        }
    }

    anyhow::bail!(
        "Could not find config.toml in ./config/config.toml or CARGO_MANIFEST_DIR/config/config.toml. Use --config-file to specify a path."
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_config_from_toml() -> Result<()> {
        let cfg = read_config_from_toml()?;
        assert!(!cfg.ledger.url.is_empty());
        assert!(ticket_api::Address::parse(&cfg.ledger.contract_address).is_ok());
        assert!(cfg.catalog.scan_ceiling > 0);
        assert!(cfg.inventory.page_size > 0);
        Ok(())
    }

    #[test]
    fn missing_sections_use_defaults() -> Result<()> {
        let cfg: Config = toml::from_str(
            r#"
            [ledger]
            url = "http://localhost:8545"
            contract_address = "0x5FbDB2315678afecb367f032d93F642f64180aa3"
            "#,
        )?;
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.catalog.scan_ceiling, 20);
        assert_eq!(cfg.inventory.page_size, 6);
        assert_eq!(cfg.transactions.poll_interval(), Duration::from_secs(1));
        assert!(cfg.wallet.url.is_none());
        assert!(cfg.attachments.is_none());
        Ok(())
    }
}
