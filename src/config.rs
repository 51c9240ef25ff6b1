use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::Address;
use alloy::signers::local::PrivateKeySigner;
use serde::Deserialize;

use crate::chain::SubscribePolicy;
use crate::error::{BettingError, Result};

/// Which process is validating the configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Recorder,
    Settler,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct ChainCfg {
    pub rpc_url: String,
    pub ws_rpc_url: Option<String>,
    pub contract_address: String,
    pub private_key: Option<String>,
    /// Checked against the node on connect, if set
    pub chain_id: Option<u64>,
    pub subscription_protocol: Option<String>, // "ws" or "http", "ws" by default when `ws_rpc_url` is set
    pub http_polling_interval_secs: Option<u64>, // HTTP RPC only
    pub subscribe_timeout_secs: Option<u64>,
    /// Pause before reopening a subscription that ended or failed to open
    pub resubscribe_delay_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PgCfg {
    pub dsn: String,
    pub schema: String,
}

impl Default for PgCfg {
    fn default() -> Self {
        Self {
            dsn: String::new(),
            schema: "./schema.sql".to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RecorderCfg {
    pub write_timeout_secs: u64,
    pub max_in_flight_writes: usize,
    pub drain_timeout_secs: u64,
}

impl Default for RecorderCfg {
    fn default() -> Self {
        Self {
            write_timeout_secs: 30,
            max_in_flight_writes: 64,
            drain_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SettlementCfg {
    pub call_timeout_secs: u64,
    pub confirmation_timeout_secs: u64,
    pub required_confirmations: u64,
    pub max_concurrent_scans: usize,
    /// Skip bets whose settlement transaction is still pending in another scan
    pub track_in_flight: bool,
    /// Keep scanning after a failed settlement instead of aborting the scan
    pub continue_after_failure: bool,
}

impl Default for SettlementCfg {
    fn default() -> Self {
        Self {
            call_timeout_secs: 30,
            confirmation_timeout_secs: 180,
            required_confirmations: 1,
            max_concurrent_scans: 2,
            track_in_flight: true,
            continue_after_failure: false,
        }
    }
}

impl SettlementCfg {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub chain: ChainCfg,
    pub postgres: PgCfg,
    pub recorder: RecorderCfg,
    pub settlement: SettlementCfg,
    pub log_level: Option<String>,
}

impl Config {
    /// Load from an optional config file, `BETTING__*` variables and the plain process variables
    /// (`ALCHEMY_URL`, `BETTING_CONTRACT_ADDRESS`, `PRIVATE_KEY`, `DATABASE_URL`).
    pub fn load(path: Option<&str>) -> Result<Self> {
        // Load .env file first
        dotenv::dotenv().ok();

        Self::load_with(path, |name| std::env::var(name).ok())
    }

    /// Same as [`Config::load`], with the plain variables read through `lookup`.
    /// Empty values count as unset, so `PRIVATE_KEY=` in `.env` keeps the file's key.
    pub fn load_with<F>(path: Option<&str>, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let config_builder = config::Config::builder()
            .add_source(config::File::with_name(path.unwrap_or("config")).required(path.is_some()))
            // BETTING__CHAIN__RPC_URL, BETTING__SETTLEMENT__CALL_TIMEOUT_SECS, ...
            .add_source(
                config::Environment::with_prefix("BETTING")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("chain.rpc_url", var("ALCHEMY_URL"))?
            .set_override_option("chain.contract_address", var("BETTING_CONTRACT_ADDRESS"))?
            .set_override_option("chain.private_key", var("PRIVATE_KEY"))?
            .set_override_option("postgres.dsn", var("DATABASE_URL"))?
            .build()?;

        let config: Config = config_builder.try_deserialize()?;
        Ok(config)
    }

    /// Fail fast on settings the given process cannot run without
    pub fn validate(&self, role: Role) -> Result<()> {
        if self.chain.rpc_url.trim().is_empty() {
            return Err(BettingError::Configuration(
                "RPC endpoint is not set (ALCHEMY_URL or BETTING__CHAIN__RPC_URL)".to_string(),
            ));
        }
        reqwest::Url::parse(&self.chain.rpc_url)
            .map_err(|e| BettingError::Configuration(format!("Invalid RPC URL {}: {}", self.chain.rpc_url, e)))?;

        self.contract_address()?;

        match self.subscription_protocol().as_str() {
            "ws" => {
                if self.chain.ws_rpc_url.as_deref().map_or(true, |url| url.trim().is_empty()) {
                    return Err(BettingError::Configuration(
                        "WebSocket subscriptions requested but chain.ws_rpc_url is not set".to_string(),
                    ));
                }
            }
            "http" => {}
            other => {
                return Err(BettingError::Configuration(format!(
                    "Unknown subscription protocol '{}', expected 'ws' or 'http'",
                    other
                )));
            }
        }

        match role {
            Role::Recorder => {
                if self.postgres.dsn.trim().is_empty() {
                    return Err(BettingError::Configuration(
                        "Database DSN is not set (DATABASE_URL or BETTING__POSTGRES__DSN)".to_string(),
                    ));
                }
                if self.recorder.max_in_flight_writes == 0 {
                    return Err(BettingError::Configuration(
                        "recorder.max_in_flight_writes must be at least 1".to_string(),
                    ));
                }
            }
            Role::Settler => {
                self.signer()?;
                if self.settlement.max_concurrent_scans == 0 {
                    return Err(BettingError::Configuration(
                        "settlement.max_concurrent_scans must be at least 1".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }

    pub fn contract_address(&self) -> Result<Address> {
        let raw = self.chain.contract_address.trim();
        if raw.is_empty() {
            return Err(BettingError::Configuration(
                "Contract address is not set (BETTING_CONTRACT_ADDRESS or BETTING__CHAIN__CONTRACT_ADDRESS)".to_string(),
            ));
        }
        Address::from_str(raw)
            .map_err(|e| BettingError::Configuration(format!("Invalid contract address {}: {}", raw, e)))
    }

    pub fn signer(&self) -> Result<PrivateKeySigner> {
        let key = self
            .chain
            .private_key
            .as_deref()
            .map(str::trim)
            .filter(|key| !key.is_empty())
            .ok_or_else(|| {
                BettingError::Configuration(
                    "Signing key is not set (PRIVATE_KEY or BETTING__CHAIN__PRIVATE_KEY)".to_string(),
                )
            })?;

        // never echo the key itself
        key.parse::<PrivateKeySigner>()
            .map_err(|_| BettingError::Configuration("Invalid private key".to_string()))
    }

    /// "ws" when a WebSocket endpoint is configured, otherwise "http"
    pub fn subscription_protocol(&self) -> String {
        match &self.chain.subscription_protocol {
            Some(protocol) => protocol.to_lowercase(),
            None if self.chain.ws_rpc_url.is_some() => "ws".to_string(),
            None => "http".to_string(),
        }
    }

    pub fn http_polling_interval(&self) -> Duration {
        Duration::from_secs(self.chain.http_polling_interval_secs.unwrap_or(5))
    }

    /// Limit for opening an event or block subscription
    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_secs(self.chain.subscribe_timeout_secs.unwrap_or(30))
    }

    pub fn resubscribe_delay(&self) -> Duration {
        Duration::from_secs(self.chain.resubscribe_delay_secs.unwrap_or(5))
    }

    pub fn subscribe_policy(&self) -> SubscribePolicy {
        SubscribePolicy {
            timeout: self.subscribe_timeout(),
            retry_delay: self.resubscribe_delay(),
        }
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // anvil's first dev account
    const DEV_KEY: &str = "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";
    const CONTRACT: &str = "0x5FbDB2315678afecb367f032d93F642f64180aa3";

    fn base_config() -> Config {
        let mut config = Config::default();
        config.chain.rpc_url = "http://localhost:8545".to_string();
        config.chain.contract_address = CONTRACT.to_string();
        config
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.recorder.write_timeout_secs, 30);
        assert_eq!(config.settlement.required_confirmations, 1);
        assert!(config.settlement.track_in_flight);
        assert!(!config.settlement.continue_after_failure);
        assert_eq!(config.postgres.schema, "./schema.sql");
        assert_eq!(config.log_level(), "info");
        assert_eq!(config.http_polling_interval(), Duration::from_secs(5));
        assert_eq!(config.subscribe_timeout(), Duration::from_secs(30));
        assert_eq!(config.subscribe_policy().retry_delay, Duration::from_secs(5));
    }

    fn write_config(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("{}-{}.toml", name, std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn test_empty_process_variables_keep_file_values() {
        let path = write_config(
            "betting-empty-vars",
            &format!(
                "[chain]\nrpc_url = \"http://localhost:8545\"\ncontract_address = \"{}\"\nprivate_key = \"{}\"\n",
                CONTRACT, DEV_KEY
            ),
        );

        let config = Config::load_with(path.to_str(), |name| match name {
            "ALCHEMY_URL" | "PRIVATE_KEY" => Some(String::new()),
            "BETTING_CONTRACT_ADDRESS" => Some("  ".to_string()),
            _ => None,
        })
        .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.chain.rpc_url, "http://localhost:8545");
        assert_eq!(config.chain.contract_address, CONTRACT);
        assert_eq!(config.chain.private_key.as_deref(), Some(DEV_KEY));
        assert!(config.validate(Role::Settler).is_ok());
    }

    #[test]
    fn test_process_variables_override_file() {
        let path = write_config("betting-override-vars", "[chain]\nrpc_url = \"http://localhost:8545\"\n");

        let config = Config::load_with(path.to_str(), |name| match name {
            "ALCHEMY_URL" => Some("https://rpc.example.org".to_string()),
            "DATABASE_URL" => Some("postgres://localhost/bets".to_string()),
            _ => None,
        })
        .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.chain.rpc_url, "https://rpc.example.org");
        assert_eq!(config.postgres.dsn, "postgres://localhost/bets");
        assert_eq!(config.chain.private_key, None);
    }

    #[test]
    fn test_empty_rpc_url_rejected() {
        let mut config = base_config();
        config.chain.rpc_url = String::new();
        let err = config.validate(Role::Settler).unwrap_err();
        assert!(err.to_string().contains("RPC endpoint is not set"));
    }

    #[test]
    fn test_malformed_contract_address_rejected() {
        let mut config = base_config();
        config.chain.contract_address = "0x1234".to_string();
        config.postgres.dsn = "postgres://localhost/bets".to_string();
        assert!(matches!(config.validate(Role::Recorder), Err(BettingError::Configuration(_))));

        config.chain.contract_address = String::new();
        let err = config.validate(Role::Recorder).unwrap_err();
        assert!(err.to_string().contains("Contract address is not set"));
    }

    #[test]
    fn test_settler_requires_private_key() {
        let mut config = base_config();
        let err = config.validate(Role::Settler).unwrap_err();
        assert!(err.to_string().contains("Signing key is not set"));

        config.chain.private_key = Some("not-a-key".to_string());
        let err = config.validate(Role::Settler).unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: Invalid private key");

        config.chain.private_key = Some(DEV_KEY.to_string());
        assert!(config.validate(Role::Settler).is_ok());
    }

    #[test]
    fn test_recorder_requires_dsn_but_not_key() {
        let mut config = base_config();
        assert!(config.validate(Role::Recorder).is_err());

        config.postgres.dsn = "postgres://localhost/bets".to_string();
        assert!(config.validate(Role::Recorder).is_ok());
    }

    #[test]
    fn test_subscription_protocol_selection() {
        let mut config = base_config();
        config.chain.private_key = Some(DEV_KEY.to_string());
        assert_eq!(config.subscription_protocol(), "http");

        config.chain.ws_rpc_url = Some("ws://localhost:8546".to_string());
        assert_eq!(config.subscription_protocol(), "ws");

        config.chain.subscription_protocol = Some("HTTP".to_string());
        assert_eq!(config.subscription_protocol(), "http");

        config.chain.ws_rpc_url = None;
        config.chain.subscription_protocol = Some("ws".to_string());
        assert!(config.validate(Role::Settler).is_err());

        config.chain.subscription_protocol = Some("ipc".to_string());
        assert!(config.validate(Role::Settler).is_err());
    }
}
