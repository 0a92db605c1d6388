//! Sync configuration.
//!
//! Settings live in the replica's `options` table as local-only rows, so each
//! replica keeps its own peer address and they never replicate. A static JSON
//! file can override address, timeout and proxy; test setups use it to keep a
//! copied database from pointing at its original.

use crate::core::replica::Replica;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const OPTION_SERVER_ADDRESS: &str = "syncServerAddress";
pub const OPTION_SERVER_TIMEOUT: &str = "syncServerTimeout";
pub const OPTION_PROXY: &str = "syncProxy";
pub const OPTION_INTERVAL: &str = "syncInterval";
pub const OPTION_MAX_REQUEUE_ROUNDS: &str = "syncMaxRequeueRounds";

const DEFAULT_TIMEOUT_MS: u64 = 120_000;
const DEFAULT_INTERVAL_SECS: u64 = 60;
const DEFAULT_MAX_REQUEUE_ROUNDS: u32 = 10;

/// Everything the sync driver needs to reach its peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncConfig {
    /// Base URL of the peer, e.g. `http://10.0.0.2:8080`. Empty means not configured.
    pub server_address: String,
    /// Budget of one whole sync attempt.
    pub timeout_ms: u64,
    /// Proxy URL tried on alternate attempts.
    pub proxy: Option<String>,
    /// Seconds between scheduled attempts.
    pub interval_secs: u64,
    /// Sector re-queue rounds allowed before an attempt fails as inconsistent.
    pub max_requeue_rounds: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_address: String::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            proxy: None,
            interval_secs: DEFAULT_INTERVAL_SECS,
            max_requeue_rounds: DEFAULT_MAX_REQUEUE_ROUNDS,
        }
    }
}

/// Fields of the override file; absent fields leave the stored value alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncOverride {
    pub server_address: Option<String>,
    pub timeout_ms: Option<u64>,
    pub proxy: Option<String>,
}

impl SyncConfig {
    /// Creates a configuration pointing at `server_address` with default settings.
    pub fn for_server(server_address: impl Into<String>) -> Self {
        Self {
            server_address: server_address.into(),
            ..Self::default()
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.server_address.trim().is_empty()
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// Reads the settings stored in `replica`, falling back to defaults.
    pub fn load(replica: &Replica) -> Result<Self> {
        let defaults = Self::default();
        let number = |name: &str, default: u64| -> Result<u64> {
            Ok(replica
                .option(name)?
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default))
        };

        Ok(Self {
            server_address: replica.option(OPTION_SERVER_ADDRESS)?.unwrap_or_default(),
            timeout_ms: number(OPTION_SERVER_TIMEOUT, defaults.timeout_ms)?,
            proxy: replica.option(OPTION_PROXY)?.filter(|p| !p.trim().is_empty()),
            interval_secs: number(OPTION_INTERVAL, defaults.interval_secs)?,
            max_requeue_rounds: u32::try_from(number(
                OPTION_MAX_REQUEUE_ROUNDS,
                u64::from(defaults.max_requeue_rounds),
            )?)
            .unwrap_or(defaults.max_requeue_rounds),
        })
    }

    /// Stores the settings in `replica` as local-only options.
    pub fn save(&self, replica: &mut Replica) -> Result<()> {
        replica.set_option(OPTION_SERVER_ADDRESS, &self.server_address, false)?;
        replica.set_option(OPTION_SERVER_TIMEOUT, &self.timeout_ms.to_string(), false)?;
        replica.set_option(OPTION_PROXY, self.proxy.as_deref().unwrap_or_default(), false)?;
        replica.set_option(OPTION_INTERVAL, &self.interval_secs.to_string(), false)?;
        replica.set_option(OPTION_MAX_REQUEUE_ROUNDS, &self.max_requeue_rounds.to_string(), false)?;
        Ok(())
    }

    /// Applies the fields present in `over`.
    #[must_use]
    pub fn with_override(mut self, over: &SyncOverride) -> Self {
        if let Some(address) = &over.server_address {
            self.server_address = address.clone();
        }
        if let Some(timeout_ms) = over.timeout_ms {
            self.timeout_ms = timeout_ms;
        }
        if let Some(proxy) = &over.proxy {
            self.proxy = Some(proxy.clone()).filter(|p| !p.trim().is_empty());
        }
        self
    }
}

/// Returns the path of the override file.
///
/// - macOS / Linux: `~/.config/arbor/sync-override.json`
/// - Windows: `%APPDATA%/Arbor/sync-override.json`
pub fn override_file_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let base = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));
        base.join("Arbor").join("sync-override.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".config").join("arbor").join("sync-override.json")
    }
}

/// Loads the override file; a missing file is no override, a corrupt one is logged and ignored.
pub fn load_override(path: &Path) -> Option<SyncOverride> {
    let content = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&content) {
        Ok(over) => {
            log::info!("Applying sync override from {}", path.display());
            Some(over)
        }
        Err(e) => {
            log::warn!("Ignoring corrupt sync override {}: {e}", path.display());
            None
        }
    }
}
