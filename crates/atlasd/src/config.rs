use atlas_core::gate::DEFAULT_COOLDOWN_MINUTES;
use atlas_core::matcher::DEFAULT_TOLERANCE;
use atlas_core::service::DEFAULT_MAX_SIGNATURES_PER_IDENTITY;
use atlas_core::{LateCutoff, Policy};
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

use crate::hooks::DEFAULT_HELPER_TIMEOUT;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Which D-Bus bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    System,
    Session,
}

impl BusKind {
    fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "system" => Some(Self::System),
            "session" => Some(Self::Session),
            _ => None,
        }
    }
}

/// Optional TOML config file named by `ATLAS_CONFIG`. Every key is optional;
/// environment variables override the file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub bus: Option<BusKind>,
    pub db_path: Option<PathBuf>,
    pub tolerance: Option<f32>,
    pub cooldown_minutes: Option<i64>,
    pub max_signatures_per_identity: Option<usize>,
    pub default_late_cutoff: Option<LateCutoff>,
    pub encoder_command: Option<String>,
    pub notify_command: Option<String>,
    pub notify_queue: Option<usize>,
    pub helper_timeout_secs: Option<u64>,
}

/// Daemon configuration, loaded from the optional config file and environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bus: BusKind,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Maximum Euclidean distance for a positive match.
    pub tolerance: f32,
    /// Minimum minutes between two recordings of the same student.
    pub cooldown_minutes: i64,
    /// Enrollment poses kept per student.
    pub max_signatures_per_identity: usize,
    /// Used when `system_settings.late_limit` is missing or unreadable.
    pub default_late_cutoff: LateCutoff,
    /// Face encoder helper: reads an image on stdin, prints signatures as JSON.
    pub encoder_command: String,
    /// Notification helper; notifications are only logged when unset.
    pub notify_command: Option<String>,
    pub notify_queue: usize,
    /// Encoder and notify helpers are killed after running this long.
    pub helper_timeout_secs: u64,
}

impl Config {
    /// Load `ATLAS_CONFIG` (if set) and apply `ATLAS_*` environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("ATLAS_CONFIG") {
            Ok(path) => read_file(PathBuf::from(path))?,
            Err(_) => FileConfig::default(),
        };
        Ok(Self::resolve(file, &|key| std::env::var(key).ok()))
    }

    /// Merge file values with environment lookups; environment wins.
    pub fn resolve(file: FileConfig, env: &dyn Fn(&str) -> Option<String>) -> Self {
        let db_path = env("ATLAS_DB_PATH")
            .map(PathBuf::from)
            .or(file.db_path)
            .unwrap_or_else(|| default_data_dir(env).join("atlas.db"));

        let notify_command = env("ATLAS_NOTIFY_COMMAND")
            .or(file.notify_command)
            .filter(|c| !c.trim().is_empty());

        Self {
            bus: env("ATLAS_BUS")
                .and_then(|v| BusKind::parse(&v))
                .or(file.bus)
                .unwrap_or(BusKind::System),
            db_path,
            tolerance: valid_tolerance(parsed(env, "ATLAS_TOLERANCE").or(file.tolerance)),
            cooldown_minutes: parsed(env, "ATLAS_COOLDOWN_MINUTES")
                .or(file.cooldown_minutes)
                .unwrap_or(DEFAULT_COOLDOWN_MINUTES),
            max_signatures_per_identity: parsed(env, "ATLAS_MAX_SIGNATURES")
                .or(file.max_signatures_per_identity)
                .unwrap_or(DEFAULT_MAX_SIGNATURES_PER_IDENTITY),
            default_late_cutoff: parsed(env, "ATLAS_DEFAULT_LATE_CUTOFF")
                .or(file.default_late_cutoff)
                .unwrap_or_default(),
            encoder_command: env("ATLAS_ENCODER_COMMAND")
                .or(file.encoder_command)
                .unwrap_or_else(|| "atlas-encode".to_string()),
            notify_command,
            notify_queue: parsed(env, "ATLAS_NOTIFY_QUEUE")
                .or(file.notify_queue)
                .unwrap_or(atlas_core::dispatch::DEFAULT_QUEUE_DEPTH),
            helper_timeout_secs: parsed(env, "ATLAS_HELPER_TIMEOUT_SECS")
                .or(file.helper_timeout_secs)
                .unwrap_or(DEFAULT_HELPER_TIMEOUT.as_secs())
                .max(1),
        }
    }

    pub fn helper_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.helper_timeout_secs)
    }

    /// Matching and cooldown policy for the attendance service.
    pub fn policy(&self) -> Policy {
        Policy {
            tolerance: self.tolerance,
            cooldown: chrono::Duration::minutes(self.cooldown_minutes.max(0)),
            max_signatures_per_identity: self.max_signatures_per_identity,
            default_cutoff: self.default_late_cutoff,
        }
    }
}

fn read_file(path: PathBuf) -> Result<FileConfig, ConfigError> {
    let text = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse { path, source })
}

fn default_data_dir(env: &dyn Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("atlas")
}

/// A tolerance must be a finite, non-negative distance; anything else would
/// silently reject every face.
fn valid_tolerance(tolerance: Option<f32>) -> f32 {
    match tolerance {
        Some(t) if t.is_finite() && t >= 0.0 => t,
        Some(t) => {
            tracing::warn!(tolerance = t, default = DEFAULT_TOLERANCE, "invalid tolerance; using default");
            DEFAULT_TOLERANCE
        }
        None => DEFAULT_TOLERANCE,
    }
}

/// Parse an environment value, ignoring it (with a warning) if malformed.
fn parsed<T: std::str::FromStr>(env: &dyn Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = env(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring malformed environment value");
            None
        }
    }
}
