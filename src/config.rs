//! Config loading and persistence.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::meter::Mode;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("failed to write {path}: {reason}")]
    Write { path: PathBuf, reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Session boundary mode at startup.
    pub mode: Mode,
    /// Rolling DPS/HPS window in seconds.
    pub window_seconds: f64,
    /// Battle-mode idle timeout in seconds.
    pub battle_timeout_seconds: f64,
    /// Archived sessions retained in the history ring.
    pub history_limit: usize,
    /// Seeded local player name; overridden by the first observed
    /// self-identification.
    pub self_name: Option<String>,
    /// Seeded local player entity id; same override rule as `self_name`.
    pub self_id: Option<u32>,
    /// Directory for unknown-payload dumps. Unset disables the sink.
    pub dump_dir: Option<PathBuf>,
    /// Optional item lookup tables for weapon-category resolution.
    pub items: ItemPaths,
    /// Human names for zone server endpoints, keyed as `"ip:port"`.
    pub zone_names: BTreeMap<String, String>,
    pub limits: Limits,
    pub codes: EventCodes,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Battle,
            window_seconds: 10.0,
            battle_timeout_seconds: 20.0,
            history_limit: 20,
            self_name: None,
            self_id: None,
            dump_dir: None,
            items: ItemPaths::default(),
            zone_names: BTreeMap::new(),
            limits: Limits::default(),
            codes: EventCodes::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemPaths {
    /// JSON map of item index -> unique item name.
    pub indexed_items: Option<PathBuf>,
    /// JSON map of unique item name -> category.
    pub category_mapping: Option<PathBuf>,
}

/// Safety limits (normative defaults).
///
/// Values are explicit about their units. Exceeding a limit always drops
/// data and bumps a counter; it never grows memory or aborts the pipeline.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Raw packets buffered between the capture and pipeline threads.
    pub capture_queue_capacity: usize,
    /// Total bytes across all in-flight reassembly buffers.
    pub reassembly_arena_bytes: usize,
    /// Seconds before an incomplete reassembly buffer is collected.
    pub reassembly_timeout_seconds: f64,
    /// Deferred combat tuples retained per unresolved actor id.
    pub deferred_per_actor: usize,
    /// Unrecognized-payload dump dedup window in seconds.
    pub dump_dedup_seconds: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            capture_queue_capacity: 4096,
            reassembly_arena_bytes: 16 * 1024 * 1024,
            reassembly_timeout_seconds: 30.0,
            deferred_per_actor: 256,
            dump_dedup_seconds: 60,
        }
    }
}

/// Wire code points for recognized messages.
///
/// These are dialect-dependent and shift on game patches, so they are config
/// data rather than constants. The defaults match the currently observed
/// dialect.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventCodes {
    pub health_update: u8,
    pub combat_state: u8,
    pub player_joined: u8,
    pub fame_gained: u8,
    pub item_equipped: u8,
    pub party_update: u8,
    pub party_disbanded: u8,
    pub self_identified: u8,
    /// Operation response that confirms entering a new zone.
    pub join_world_response: u8,
    /// UDP ports served by zone servers; a change of the observed endpoint
    /// on these ports is a zone change.
    pub zone_ports: Vec<u16>,
}

impl Default for EventCodes {
    fn default() -> Self {
        Self {
            health_update: 6,
            combat_state: 18,
            player_joined: 29,
            fame_gained: 72,
            item_equipped: 90,
            party_update: 213,
            party_disbanded: 214,
            self_identified: 88,
            join_world_response: 2,
            zone_ports: vec![5056, 5058],
        }
    }
}

pub fn load(path: &Path) -> Result<Config, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}

/// Load the config, falling back to defaults (and writing them out) when the
/// file is absent or unparsable. A meter must come up even with a bad config.
pub fn load_or_init(path: &Path) -> Config {
    if path.exists() {
        match load(path) {
            Ok(cfg) => return cfg,
            Err(e) => {
                tracing::warn!("config load failed, using defaults: {e}");
                return Config::default();
            }
        }
    }

    let cfg = Config::default();
    if let Err(e) = write_config(path, &cfg) {
        tracing::warn!("failed to write default config: {e}");
    }
    cfg
}

pub fn write_config(path: &Path, cfg: &Config) -> Result<(), ConfigError> {
    let write_err = |reason: String| ConfigError::Write {
        path: path.to_owned(),
        reason,
    };
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| write_err(format!("create {}: {e}", dir.display())))?;
    }
    let contents =
        toml::to_string_pretty(cfg).map_err(|e| write_err(format!("render config: {e}")))?;
    atomic_write(path, contents.as_bytes()).map_err(write_err)
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), String> {
    let dir = path
        .parent()
        .ok_or_else(|| "config path missing parent directory".to_string())?;
    let temp =
        tempfile::NamedTempFile::new_in(dir).map_err(|e| format!("create temp file: {e}"))?;
    fs::write(temp.path(), data).map_err(|e| format!("write temp file: {e}"))?;
    temp.persist(path).map_err(|e| format!("persist: {e}"))?;
    Ok(())
}
