//! Copy configuration: global settings, per-symbol pair rules, and the
//! hot-reloadable handle the loops read at each polling cycle.
//!
//! Configuration lives in a JSON file. A malformed file keeps the previous
//! config in force; a malformed pair rule disables that pair only.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::warn;

use crate::error::CopyError;
use crate::gateway::FillingMode;

/// Floor on the polling period so a misconfigured interval cannot hammer
/// the terminal API.
pub const MIN_COPY_INTERVAL_MS: u64 = 10;

/// Global copier settings, re-read at each polling cycle start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    /// Master polling period in milliseconds
    pub copy_interval: u64,

    /// Order submissions per replication attempt before giving up
    pub retry_attempts: u32,

    /// Base slippage tolerance in points
    pub slippage: u32,

    /// Filling policy for child orders
    pub filling_mode: FillingMode,

    /// Mirror master closes on the child (false = local bookkeeping only)
    pub copy_closes: bool,

    /// Propagate comment changes to child positions
    pub comment_tracking: bool,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            copy_interval: 50,
            retry_attempts: 3,
            slippage: 20,
            filling_mode: FillingMode::Fok,
            copy_closes: true,
            comment_tracking: true,
        }
    }
}

impl GlobalSettings {
    /// Polling period with the anti-overload floor applied.
    pub fn effective_interval(&self) -> Duration {
        Duration::from_millis(self.copy_interval.max(MIN_COPY_INTERVAL_MS))
    }
}

fn default_true() -> bool {
    true
}

fn default_multiplier() -> Decimal {
    dec!(1.0)
}

fn default_max_slippage() -> u32 {
    20
}

/// Copy policy for one master symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairConfig {
    /// Symbol on the master account
    pub master_symbol: String,

    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Child-side symbol when the broker names it differently
    #[serde(default)]
    pub child_symbol_override: Option<String>,

    /// Child volume = master volume * multiplier; must be > 0
    #[serde(default = "default_multiplier")]
    pub lot_multiplier: Decimal,

    /// Mirror in the opposite direction
    #[serde(default)]
    pub direction_flip: bool,

    /// Ceiling for slippage widening on retries
    #[serde(default = "default_max_slippage")]
    pub max_slippage_points: u32,
}

impl PairConfig {
    pub fn new(master_symbol: impl Into<String>) -> Self {
        Self {
            master_symbol: master_symbol.into(),
            enabled: true,
            child_symbol_override: None,
            lot_multiplier: default_multiplier(),
            direction_flip: false,
            max_slippage_points: default_max_slippage(),
        }
    }

    /// Symbol to trade on the child account.
    pub fn resolved_symbol(&self) -> &str {
        self.child_symbol_override
            .as_deref()
            .unwrap_or(&self.master_symbol)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.master_symbol.trim().is_empty() {
            return Err("master_symbol is empty".to_string());
        }
        if self.lot_multiplier <= Decimal::ZERO {
            return Err(format!(
                "lot_multiplier must be > 0, got {}",
                self.lot_multiplier
            ));
        }
        Ok(())
    }
}

/// Full configuration file shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyConfig {
    pub settings: GlobalSettings,
    pub pairs: Vec<PairConfig>,
}

/// Resolver from master symbol to at most one pair rule.
///
/// Invalid rules are kept but forced disabled, so a bad entry never takes
/// down the rest of the book.
#[derive(Debug, Clone, Default)]
pub struct PairBook {
    by_symbol: HashMap<String, PairConfig>,
}

impl PairBook {
    pub fn from_pairs(pairs: &[PairConfig]) -> Self {
        let mut by_symbol = HashMap::new();
        for pair in pairs {
            let mut pair = pair.clone();
            if let Err(reason) = pair.validate() {
                let err = CopyError::ConfigInvalid {
                    symbol: pair.master_symbol.clone(),
                    reason,
                };
                warn!(error = %err, "Invalid pair config, treating as disabled");
                pair.enabled = false;
            }
            by_symbol.insert(pair.master_symbol.to_uppercase(), pair);
        }
        Self { by_symbol }
    }

    /// Look up the rule for a master symbol. Returns the rule even when
    /// disabled; the executor decides what a disabled rule means.
    pub fn resolve(&self, master_symbol: &str) -> Option<&PairConfig> {
        self.by_symbol.get(&master_symbol.to_uppercase())
    }

    pub fn len(&self) -> usize {
        self.by_symbol.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_symbol.is_empty()
    }
}

/// Shared handle to the current configuration.
///
/// `reload` re-reads the backing file; callers that only need the last
/// accepted config use `current`.
#[derive(Clone)]
pub struct ConfigHandle {
    path: Option<PathBuf>,
    current: Arc<RwLock<Arc<CopyConfig>>>,
}

impl ConfigHandle {
    /// Load configuration from a JSON file.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: CopyConfig = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(Self {
            path: Some(path),
            current: Arc::new(RwLock::new(Arc::new(config))),
        })
    }

    /// Wrap a fixed configuration; used by tests and defaults.
    pub fn from_static(config: CopyConfig) -> Self {
        Self {
            path: None,
            current: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub async fn current(&self) -> Arc<CopyConfig> {
        self.current.read().await.clone()
    }

    /// Re-read the backing file. A read or parse failure keeps the previous
    /// config in force and logs a warning.
    pub async fn reload(&self) -> Arc<CopyConfig> {
        let Some(ref path) = self.path else {
            return self.current().await;
        };

        match tokio::fs::read_to_string(path).await {
            Ok(raw) => match serde_json::from_str::<CopyConfig>(&raw) {
                Ok(config) => {
                    let config = Arc::new(config);
                    *self.current.write().await = config.clone();
                    config
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Config reload failed to parse, keeping previous");
                    self.current().await
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Config reload failed to read, keeping previous");
                self.current().await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_match_shipped_config() {
        let settings = GlobalSettings::default();
        assert_eq!(settings.copy_interval, 50);
        assert_eq!(settings.retry_attempts, 3);
        assert_eq!(settings.slippage, 20);
        assert_eq!(settings.filling_mode, FillingMode::Fok);
        assert!(settings.copy_closes);
        assert!(settings.comment_tracking);
    }

    #[test]
    fn test_interval_floor_enforced() {
        let settings = GlobalSettings {
            copy_interval: 1,
            ..Default::default()
        };
        assert_eq!(
            settings.effective_interval(),
            Duration::from_millis(MIN_COPY_INTERVAL_MS)
        );

        let settings = GlobalSettings {
            copy_interval: 500,
            ..Default::default()
        };
        assert_eq!(settings.effective_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_resolver_is_case_insensitive() {
        let book = PairBook::from_pairs(&[PairConfig::new("EURUSD")]);
        assert!(book.resolve("eurusd").is_some());
        assert!(book.resolve("EURUSD").is_some());
        assert!(book.resolve("GBPUSD").is_none());
    }

    #[test]
    fn test_invalid_multiplier_disables_pair() {
        let mut pair = PairConfig::new("EURUSD");
        pair.lot_multiplier = dec!(0);
        let book = PairBook::from_pairs(&[pair]);

        let resolved = book.resolve("EURUSD").unwrap();
        assert!(!resolved.enabled);
    }

    #[test]
    fn test_symbol_override_resolution() {
        let mut pair = PairConfig::new("XAUUSD");
        pair.child_symbol_override = Some("GOLD".to_string());
        assert_eq!(pair.resolved_symbol(), "GOLD");

        let plain = PairConfig::new("EURUSD");
        assert_eq!(plain.resolved_symbol(), "EURUSD");
    }

    #[test]
    fn test_config_json_roundtrip_with_defaults() {
        let raw = r#"{
            "settings": { "copy_interval": 100, "filling_mode": "IOC" },
            "pairs": [ { "master_symbol": "EURUSD", "lot_multiplier": "0.5" } ]
        }"#;
        let config: CopyConfig = serde_json::from_str(raw).unwrap();

        assert_eq!(config.settings.copy_interval, 100);
        assert_eq!(config.settings.filling_mode, FillingMode::Ioc);
        assert_eq!(config.settings.retry_attempts, 3);
        assert_eq!(config.pairs[0].lot_multiplier, dec!(0.5));
        assert!(config.pairs[0].enabled);
        assert_eq!(config.pairs[0].max_slippage_points, 20);
    }
}
