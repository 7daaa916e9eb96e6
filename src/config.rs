//! Supervisor configuration.
//!
//! One knob is consumed from the daemon configuration file:
//! `BackendSpawnNiceValue`, the scheduling priority applied to freshly
//! spawned backend children. The file is TOML; unknown keys are ignored so
//! the supervisor can share the daemon's config file.
//!
//! Resolution order for the config path:
//!   1. explicit path (CLI flag / embedder)
//!   2. `BACKEND_SPAWN_CONFIG` environment variable
//!   3. `$XDG_CONFIG_HOME/backend-spawn/config.toml`
//!   4. `~/.config/backend-spawn/config.toml`

use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Lowest (most favourable) nice value accepted.
pub const NICE_MIN: i64 = -20;
/// Highest (least favourable) nice value accepted.
pub const NICE_MAX: i64 = 19;

/// Effective configuration handed to the supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SpawnConfig {
    /// Nice value for spawned children, already clamped; 0 means leave the
    /// child at the daemon's own priority.
    pub nice: i32,
}

/// On-disk shape. Only the key this crate consumes is modelled; the rest of
/// the daemon's configuration passes through untouched.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    #[serde(rename = "BackendSpawnNiceValue", default)]
    backend_spawn_nice_value: i64,
}

impl SpawnConfig {
    /// Resolve the config path and load it. A missing file is not an error;
    /// it simply yields the defaults.
    pub fn load(explicit: Option<&str>) -> Result<Self> {
        Self::load_file(&resolve_config_path(explicit))
    }

    /// Load from a concrete path.
    pub fn load_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no config file; using defaults");
            return Ok(SpawnConfig::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("parse config {}", path.display()))?;
        Ok(SpawnConfig {
            nice: clamp_nice(raw.backend_spawn_nice_value),
        })
    }
}

/// Clamp a configured nice value into the range the kernel accepts.
pub fn clamp_nice(requested: i64) -> i32 {
    let effective = requested.clamp(NICE_MIN, NICE_MAX) as i32;
    if i64::from(effective) != requested {
        warn!(requested, effective, "nice value out of range; clamped");
    }
    effective
}

/// Resolve the config file path following the priority chain.
pub fn resolve_config_path(explicit: Option<&str>) -> PathBuf {
    // 1. Explicit path
    if let Some(path) = explicit {
        return PathBuf::from(path);
    }

    // 2. Environment variable
    if let Ok(path) = std::env::var("BACKEND_SPAWN_CONFIG") {
        if !path.is_empty() {
            return PathBuf::from(path);
        }
    }

    // 3. XDG_CONFIG_HOME
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        if !xdg.is_empty() {
            return PathBuf::from(xdg).join("backend-spawn").join("config.toml");
        }
    }

    // 4. Default: ~/.config/backend-spawn/config.toml
    if let Some(base_dirs) = BaseDirs::new() {
        return base_dirs
            .home_dir()
            .join(".config")
            .join("backend-spawn")
            .join("config.toml");
    }

    // Fallback if directories crate returns None
    PathBuf::from("~/.config/backend-spawn/config.toml")
}

// ---------- Unit tests ----------
