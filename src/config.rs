use std::path::PathBuf;
use std::str::FromStr;

use chrono::TimeDelta;

const DEFAULT_GENERATOR_LIMIT_DAYS: i64 = 365;
const MAX_GENERATOR_LIMIT_DAYS: i64 = 36_500;
const DEFAULT_MAX_SAVE_RETRIES: u32 = 3;
const DEFAULT_COMPACT_THRESHOLD: u64 = 1000;

/// Settings the engine itself consumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    /// How far past "now" an open-ended rule is expanded.
    pub default_generator_limit: TimeDelta,
    /// Extra attempts after an optimistic commit loses to a concurrent one.
    pub max_save_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_generator_limit: TimeDelta::days(DEFAULT_GENERATOR_LIMIT_DAYS),
            max_save_retries: DEFAULT_MAX_SAVE_RETRIES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub engine: EngineConfig,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
}

impl Config {
    /// Read `RECURRA_*` variables. Unset or unparseable values fall back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let limit_days: i64 = parsed(&get, "RECURRA_GENERATOR_LIMIT_DAYS")
            .filter(|d: &i64| (1..=MAX_GENERATOR_LIMIT_DAYS).contains(d))
            .unwrap_or(DEFAULT_GENERATOR_LIMIT_DAYS);

        Self {
            data_dir: PathBuf::from(get("RECURRA_DATA_DIR").unwrap_or_else(|| "./data".into())),
            engine: EngineConfig {
                default_generator_limit: TimeDelta::days(limit_days),
                max_save_retries: parsed(&get, "RECURRA_MAX_SAVE_RETRIES").unwrap_or(DEFAULT_MAX_SAVE_RETRIES),
            },
            compact_threshold: parsed(&get, "RECURRA_COMPACT_THRESHOLD").unwrap_or(DEFAULT_COMPACT_THRESHOLD),
            metrics_port: parsed(&get, "RECURRA_METRICS_PORT"),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("recurra.wal")
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|s| s.trim().parse().ok())
}
