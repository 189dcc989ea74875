use std::path::PathBuf;
use std::str::FromStr;

use crate::model::Ms;

/// Service configuration, read from `SLOTBOOK_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    /// A synced connection older than this is reported stale.
    pub stale_sync_after: Ms,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "slotbook".into(),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            stale_sync_after: 3600 * 1000,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        Self {
            port: parsed(&get, "SLOTBOOK_PORT").unwrap_or(d.port),
            bind: get("SLOTBOOK_BIND").unwrap_or(d.bind),
            data_dir: get("SLOTBOOK_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            password: get("SLOTBOOK_PASSWORD").unwrap_or(d.password),
            max_connections: parsed(&get, "SLOTBOOK_MAX_CONNECTIONS").unwrap_or(d.max_connections),
            compact_threshold: parsed(&get, "SLOTBOOK_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            metrics_port: parsed(&get, "SLOTBOOK_METRICS_PORT"),
            stale_sync_after: parsed::<Ms>(&get, "SLOTBOOK_STALE_SYNC_SECS")
                .map(|secs| secs.saturating_mul(1000))
                .unwrap_or(d.stale_sync_after),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("slotbook.wal")
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parsed<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let value = get(key)?;
    match value.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("ignoring invalid {key}={value:?}, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_without_env() {
        let c = config(&[]);
        assert_eq!(c, Config::default());
        assert_eq!(c.addr(), "0.0.0.0:5433");
        assert_eq!(c.wal_path(), PathBuf::from("./data/slotbook.wal"));
    }

    #[test]
    fn env_overrides() {
        let c = config(&[
            ("SLOTBOOK_PORT", "6000"),
            ("SLOTBOOK_DATA_DIR", "/var/lib/slotbook"),
            ("SLOTBOOK_METRICS_PORT", "9100"),
            ("SLOTBOOK_STALE_SYNC_SECS", "60"),
        ]);
        assert_eq!(c.port, 6000);
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.stale_sync_after, 60_000);
        assert_eq!(c.wal_path(), PathBuf::from("/var/lib/slotbook/slotbook.wal"));
    }

    #[test]
    fn invalid_values_fall_back() {
        let c = config(&[("SLOTBOOK_MAX_CONNECTIONS", "lots"), ("SLOTBOOK_METRICS_PORT", "-1")]);
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.metrics_port, None);
    }
}
