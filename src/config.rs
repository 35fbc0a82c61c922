//! Process configuration from `TERMIN_*` environment variables.

use std::env;
use std::path::PathBuf;

use crate::limits::{DEFAULT_LOOKAHEAD_DAYS, MAX_LOOKAHEAD_DAYS};

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub lookahead_days: u32,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 7878,
            data_dir: PathBuf::from("./termin-data"),
            max_connections: 256,
            compact_threshold: 10_000,
            lookahead_days: DEFAULT_LOOKAHEAD_DAYS,
            metrics_port: None,
        }
    }
}

impl Config {
    /// Unset variables fall back to defaults; unparsable values do too,
    /// with a warning, so a typo never takes the service down.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            bind: env::var("TERMIN_BIND").unwrap_or(d.bind),
            port: parse_var("TERMIN_PORT", d.port),
            data_dir: env::var("TERMIN_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(d.data_dir),
            max_connections: parse_var("TERMIN_MAX_CONNECTIONS", d.max_connections),
            compact_threshold: parse_var("TERMIN_COMPACT_THRESHOLD", d.compact_threshold),
            lookahead_days: parse_var("TERMIN_LOOKAHEAD_DAYS", d.lookahead_days)
                .min(MAX_LOOKAHEAD_DAYS),
            metrics_port: env::var("TERMIN_METRICS_PORT")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }
}

fn parse_var<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::warn!(var = name, value = %raw, "unparsable value, using default");
            default
        }),
        Err(_) => default,
    }
}
