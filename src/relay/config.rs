/**
 * ============================================================================
 * RELAY CONFIGURATION MODULE
 * ============================================================================
 *
 * PURPOSE: Configuration schema, persistence, and validation
 *
 * STORAGE: JSON files in the relay data directory
 * FILE PATHS:
 * - {data_dir}/relay_config.json   endpoints, limits, timing
 * - {data_dir}/message_types.json  per-type send settings
 *
 * FUNCTIONALITY:
 * - Define configuration schema with production defaults
 * - Validate configuration values
 * - Load configuration from disk (missing file => defaults)
 * - Save configuration atomically
 * - Merge saved message-type settings over built-in defaults
 *
 * ============================================================================
 */

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "relay_config.json";
pub const MESSAGE_TYPES_FILE_NAME: &str = "message_types.json";
pub const QUEUE_FILE_NAME: &str = "queue.sqlite3";
pub const SESSION_FILE_NAME: &str = "session.json";

/**
 * User-controllable message types and their defaults
 * Types outside this list are denied once settings are loaded
 */
pub static DEFAULT_MESSAGE_TYPE_SETTINGS: Lazy<HashMap<String, bool>> = Lazy::new(|| {
    [
        "STORAGE_CHANGE",
        "WORKFORCE_CHANGE",
        "ACTION_COMPLETED",
        "DATA_DATA",
        "ACCOUNTING_CASH_BALANCES",
        "CORPORATION_SHAREHOLDER_HOLDINGS",
        "SHIP_FLIGHT_FLIGHTS",
        "CONTRACTS_CONTRACTS",
        "PLANET_DATA",
        "PRODUCTION_SITE_PRODUCTION_LINES",
        "COMEX_TRADER_ORDERS",
        "POPULATION_AVAILABLE_RESERVE_WORKFORCE",
        "FOREX_TRADER_ORDERS",
        "SHIPYARD_PROJECTS",
        "BLUEPRINT_BLUEPRINTS",
        "PRODUCTION_ORDER_REMOVED",
        "PRODUCTION_ORDER_UPDATED",
        "ACCOUNTING_BOOKINGS",
        "PRODUCTION_ORDER_ADDED",
        "COMEX_EXCHANGE_BROKER_LIST",
        "COMEX_BROKER_DATA",
        "DATA_AGGREGATION_DATA",
        "PRODUCTION_PRODUCTION_LINES",
        "EXPERTS_EXPERTS",
        "CORPORATION_DATA",
        "CORPORATION_PROJECTS_DATA",
        "SHIP_FLIGHT_FLIGHT_ENDED",
        "SHIP_DATA",
        "SHIP_FLIGHT_FLIGHT",
        "COMEX_TRADER_ORDER_DELETION_TERMS",
        "COMEX_TRADER_ORDER_REMOVED",
        "SITE_NO_SITE",
        "AUTH_AUTHENTICATED",
        "SITE_SITE",
        "USER_STARTING_PROFILE_DATA",
        "PRODUCTION_PRODUCTION_LINE_UPDATED",
        "WORKFORCE_WORKFORCES_UPDATED",
        "SITE_PLATFORM_UPDATED",
        "COUNTRY_AGENT_DATA",
        "CONTRACTS_CONTRACT",
        "COMEX_TRADER_ORDER_UPDATED",
        "COMEX_TRADER_ORDER_ADDED",
        "LEADERBOARD_SCORES",
        "COMEX_BROKER_NEW_PRICE",
        "COMEX_BROKER_PRICES",
        "ACCOUNTING_BALANCES",
        "ACCOUNTING_CASH_BOOKINGS",
        "WAREHOUSE_STORAGE",
        "SITE_PLATFORM_BUILT",
        "ADMIN_CENTER_CLIENT_VOTING_DATA",
        "SHIPYARD_PROJECT",
        "BLUEPRINT_BLUEPRINT",
        "STORAGE_REMOVED",
        "SERVER_CONNECTION_OPENED",
    ]
    .into_iter()
    .map(|t| (t.to_string(), true))
    .collect()
});

/**
 * Complete relay configuration
 * All delivery behavior is controlled through these settings
 */
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    // Auth plane base URL (login, extension_sync)
    pub auth_url: String,

    // Data plane base URL (data_batch, status)
    pub data_url: String,

    // Value of the X-Extension-Client header
    pub client_id: String,

    // Bound on every network request
    pub request_timeout_seconds: u64,

    // Hard ceiling on one serialized batch body
    pub max_payload_bytes: usize,

    // Oldest items considered per pass
    pub scan_window: usize,

    pub min_interval_ms: u64,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,

    // Pending count above which the interval snaps to the minimum
    pub high_water_mark: usize,

    // Round trips slower than this double the interval
    pub slow_round_trip_ms: u64,

    // Delay before a scheduled follow-up pass
    pub retry_delay_ms: u64,

    // Reachability probe period
    pub watchdog_interval_seconds: u64,

    pub dedup_ttl_seconds: u64,

    // Gzip batch bodies
    pub compress_batches: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            auth_url: "https://api.punoted.net/auth".to_string(),
            data_url: "https://api.punoted.net".to_string(),
            client_id: concat!("prun-relay/", env!("CARGO_PKG_VERSION")).to_string(),
            request_timeout_seconds: 10,
            max_payload_bytes: 15 * 1024 * 1024,
            scan_window: 1000,
            min_interval_ms: 500,
            initial_interval_ms: 1000,
            max_interval_ms: 10_000,
            high_water_mark: 50,
            slow_round_trip_ms: 2000,
            retry_delay_ms: 1000,
            watchdog_interval_seconds: 60,
            dedup_ttl_seconds: 10,
            compress_batches: true,
        }
    }
}

impl RelayConfig {
    /**
     * Validate configuration values
     * Returns Ok(()) if valid, Err(String) with validation message if invalid
     */
    pub fn validate(&self) -> Result<(), String> {
        for (name, url) in [("auth_url", &self.auth_url), ("data_url", &self.data_url)] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(format!("{} must start with http:// or https://", name));
            }
        }
        if self.client_id.is_empty() {
            return Err("client_id must not be empty".to_string());
        }

        if self.request_timeout_seconds < 1 || self.request_timeout_seconds > 300 {
            return Err("request_timeout_seconds must be between 1 and 300".to_string());
        }
        // The envelope alone must fit
        if self.max_payload_bytes < 1024 {
            return Err("max_payload_bytes must be at least 1024".to_string());
        }
        if self.scan_window == 0 {
            return Err("scan_window must be at least 1".to_string());
        }
        if self.min_interval_ms == 0 {
            return Err("min_interval_ms must be at least 1".to_string());
        }
        if self.min_interval_ms > self.max_interval_ms {
            return Err("min_interval_ms must not exceed max_interval_ms".to_string());
        }
        if self.initial_interval_ms < self.min_interval_ms
            || self.initial_interval_ms > self.max_interval_ms
        {
            return Err("initial_interval_ms must be between min_interval_ms and max_interval_ms".to_string());
        }
        if self.watchdog_interval_seconds == 0 {
            return Err("watchdog_interval_seconds must be at least 1".to_string());
        }

        Ok(())
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_seconds)
    }
}

/**
 * Default data directory: {platform data dir}/prun-relay
 * Falls back to ./prun-relay when the platform has none
 */
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("prun-relay")
}

/**
 * Load configuration from disk
 * Returns default configuration if the file doesn't exist
 */
pub fn load_config(data_dir: &Path) -> Result<RelayConfig, String> {
    let config_path = data_dir.join(CONFIG_FILE_NAME);

    if !config_path.exists() {
        log::info!("Relay config not found, using defaults");
        return Ok(RelayConfig::default());
    }

    let json_str = fs::read_to_string(&config_path)
        .map_err(|e| format!("Failed to read config file: {}", e))?;
    let config: RelayConfig = serde_json::from_str(&json_str)
        .map_err(|e| format!("Failed to parse config JSON: {}", e))?;
    config.validate()?;

    log::info!("Loaded relay config from {}", config_path.display());
    Ok(config)
}

/**
 * Save configuration to disk atomically
 */
pub fn save_config(data_dir: &Path, config: &RelayConfig) -> Result<(), String> {
    config.validate()?;
    let json_str = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    write_atomic(&data_dir.join(CONFIG_FILE_NAME), &json_str)?;

    log::info!("Saved relay config to {}", data_dir.display());
    Ok(())
}

/**
 * Load message-type settings merged over the built-in defaults
 * Saved values win for known types; unknown saved types are kept as-is
 */
pub fn load_message_settings(data_dir: &Path) -> Result<HashMap<String, bool>, String> {
    let path = data_dir.join(MESSAGE_TYPES_FILE_NAME);
    let mut settings = DEFAULT_MESSAGE_TYPE_SETTINGS.clone();

    if !path.exists() {
        log::debug!("No message type settings saved, using defaults");
        return Ok(settings);
    }

    let json_str = fs::read_to_string(&path)
        .map_err(|e| format!("Failed to read message type settings: {}", e))?;
    let saved: HashMap<String, bool> = serde_json::from_str(&json_str)
        .map_err(|e| format!("Failed to parse message type settings: {}", e))?;
    settings.extend(saved);

    log::info!("Loaded {} message type settings", settings.len());
    Ok(settings)
}

pub fn save_message_settings(data_dir: &Path, settings: &HashMap<String, bool>) -> Result<(), String> {
    let json_str = serde_json::to_string_pretty(settings)
        .map_err(|e| format!("Failed to serialize message type settings: {}", e))?;
    write_atomic(&data_dir.join(MESSAGE_TYPES_FILE_NAME), &json_str)
}

/**
 * Write via temporary file + rename to prevent corruption
 */
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create directory {}: {}", parent.display(), e))?;
    }

    let temp_path = path.with_extension("json.tmp");
    fs::write(&temp_path, contents)
        .map_err(|e| format!("Failed to write temporary file: {}", e))?;
    fs::rename(&temp_path, path)
        .map_err(|e| format!("Failed to save {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config_is_valid() {
        let config = RelayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.max_payload_bytes, 15_728_640);
        assert_eq!(config.request_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = RelayConfig::default();
        config.data_url = "ftp://example.com".to_string();
        assert!(config.validate().unwrap_err().contains("data_url"));

        let mut config = RelayConfig::default();
        config.min_interval_ms = 20_000;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.initial_interval_ms = 100;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.scan_window = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_round_trip_on_disk() {
        let dir = TempDir::new().unwrap();
        assert_eq!(load_config(dir.path()).unwrap(), RelayConfig::default());

        let mut config = RelayConfig::default();
        config.data_url = "http://localhost:9000".to_string();
        config.compress_batches = false;
        save_config(dir.path(), &config).unwrap();

        assert_eq!(load_config(dir.path()).unwrap(), config);
        assert!(!dir.path().join("relay_config.json.tmp").exists());
    }

    #[test]
    fn test_partial_config_file_uses_defaults() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE_NAME), r#"{"scan_window": 10}"#).unwrap();

        let config = load_config(dir.path()).unwrap();
        assert_eq!(config.scan_window, 10);
        assert_eq!(config.high_water_mark, 50);
    }

    #[test]
    fn test_message_settings_merge_over_defaults() {
        let dir = TempDir::new().unwrap();
        let defaults = load_message_settings(dir.path()).unwrap();
        assert_eq!(defaults.len(), DEFAULT_MESSAGE_TYPE_SETTINGS.len());
        assert!(defaults.values().all(|v| *v));

        let saved = HashMap::from([
            ("STORAGE_CHANGE".to_string(), false),
            ("CUSTOM_TYPE".to_string(), true),
        ]);
        save_message_settings(dir.path(), &saved).unwrap();

        let merged = load_message_settings(dir.path()).unwrap();
        assert_eq!(merged.get("STORAGE_CHANGE"), Some(&false));
        assert_eq!(merged.get("CUSTOM_TYPE"), Some(&true));
        assert_eq!(merged.get("SHIP_DATA"), Some(&true));
    }
}
