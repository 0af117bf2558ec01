//! Runtime configuration.
//!
//! Values resolve in three layers: built-in defaults, then the `config`
//! category of `local_settings`, then `RESI_*` environment variables.
//! Unparseable values are ignored with a warning so a bad setting never
//! prevents startup.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

use crate::db::{self, DbState};

pub const SETTINGS_CATEGORY: &str = "config";

const DEFAULT_KNOWN_COURIERS: &[&str] = &[
    "JNE", "JNT", "SICEPAT", "ID", "SPX", "ANTERAJA", "POS", "LION", "NINJA", "SAP", "BATAL",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub sync_interval_secs: u64,
    pub max_retries: u32,
    /// Trailing days of expedition rows used to resolve late scans.
    pub expedition_window_days: u32,
    /// Couriers shown on the dashboard, normalized and in display order.
    pub known_couriers: Vec<String>,
    pub change_debounce_ms: u64,
    /// Sack used when a confirm carries none.
    pub default_sack: String,
    pub request_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: 60,
            max_retries: 5,
            expedition_window_days: 3,
            known_couriers: DEFAULT_KNOWN_COURIERS
                .iter()
                .map(|c| c.to_string())
                .collect(),
            change_debounce_ms: 500,
            default_sack: "1".to_string(),
            request_timeout_secs: 20,
        }
    }
}

fn parse_into<T: FromStr>(key: &str, raw: &str, target: &mut T) {
    match raw.trim().parse::<T>() {
        Ok(v) => *target = v,
        Err(_) => warn!(key, value = %raw, "Ignoring unparseable config value"),
    }
}

fn parse_courier_list(raw: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    raw.split(',')
        .map(crate::models::normalize_key)
        .filter(|c| !c.is_empty())
        .filter(|c| seen.insert(c.clone()))
        .collect()
}

impl AppConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(1))
    }

    pub fn change_debounce(&self) -> Duration {
        Duration::from_millis(self.change_debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    /// Apply one `key = value` pair from any layer.
    fn apply(&mut self, key: &str, raw: &str) {
        match key {
            "sync_interval_secs" => parse_into(key, raw, &mut self.sync_interval_secs),
            "max_retries" => parse_into(key, raw, &mut self.max_retries),
            "expedition_window_days" => parse_into(key, raw, &mut self.expedition_window_days),
            "change_debounce_ms" => parse_into(key, raw, &mut self.change_debounce_ms),
            "request_timeout_secs" => parse_into(key, raw, &mut self.request_timeout_secs),
            "default_sack" => {
                let sack = raw.trim();
                if !sack.is_empty() {
                    self.default_sack = sack.to_string();
                }
            }
            "known_couriers" => {
                let couriers = parse_courier_list(raw);
                if couriers.is_empty() {
                    warn!(key, "Ignoring empty courier list");
                } else {
                    self.known_couriers = couriers;
                }
            }
            _ => {}
        }
        if self.max_retries == 0 {
            self.max_retries = 1;
        }
    }

    const KEYS: &'static [&'static str] = &[
        "sync_interval_secs",
        "max_retries",
        "expedition_window_days",
        "known_couriers",
        "change_debounce_ms",
        "default_sack",
        "request_timeout_secs",
    ];

    fn env_name(key: &str) -> String {
        format!("RESI_{}", key.to_ascii_uppercase())
    }

    /// Resolve configuration from settings and environment.
    pub fn load(db: &DbState) -> Self {
        let mut config = Self::default();
        {
            let conn = db.conn.lock().unwrap_or_else(|e| e.into_inner());
            for key in Self::KEYS {
                if let Some(value) = db::get_setting(&conn, SETTINGS_CATEGORY, key) {
                    config.apply(key, &value);
                }
            }
        }
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        for key in Self::KEYS {
            if let Ok(value) = std::env::var(Self::env_name(key)) {
                self.apply(key, &value);
            }
        }
    }

    /// Persist one setting so the next `load` picks it up.
    pub fn save_setting(db: &DbState, key: &str, value: &str) -> Result<(), String> {
        if !Self::KEYS.contains(&key) {
            return Err(format!("Unknown config key: {key}"));
        }
        let conn = db.conn.lock().map_err(|e| e.to_string())?;
        db::set_setting(&conn, SETTINGS_CATEGORY, key, value)
    }
}

/// Base directory for the database and logs.
///
/// `RESI_DATA_DIR` wins; otherwise the platform's local data directory.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("RESI_DATA_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("resi-tracker")
}
