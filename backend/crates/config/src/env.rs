use std::env;
use std::str::FromStr;

use serde::Deserialize;
use shopmirror_common::error::{MirrorError, MirrorResult};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub log_level: String,
}

impl AppConfig {
    /// Load configuration from environment variables.
    /// Loads `.env` file if present, then reads required vars.
    pub fn from_env() -> MirrorResult<Self> {
        // Best-effort .env load; ignore if missing
        let _ = dotenvy::dotenv();

        Ok(Self {
            database_url: get_var("DATABASE_URL")?,
            log_level: get_var_or("LOG_LEVEL", "info"),
        })
    }
}

pub fn get_var(key: &str) -> MirrorResult<String> {
    env::var(key).map_err(|_| MirrorError::Config(format!("{key} is required but not set")))
}

pub fn get_var_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_owned())
}

/// Parse an optional var, falling back to `default` when unset.
/// A value that is set but does not parse is a configuration error.
pub fn parse_var_or<T>(key: &str, default: T) -> MirrorResult<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| MirrorError::Config(format!("invalid {key}: {e}"))),
        Err(_) => Ok(default),
    }
}

/// Accepts `1/0`, `true/false`, `yes/no` (case-insensitive).
pub fn parse_bool_or(key: &str, default: bool) -> MirrorResult<bool> {
    match env::var(key) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" => Ok(true),
            "0" | "false" | "no" => Ok(false),
            other => Err(MirrorError::Config(format!("invalid {key}: {other}"))),
        },
        Err(_) => Ok(default),
    }
}

/// Parse a comma-separated list from an env var.
/// Returns `Ok(None)` if unset, `Err` if set but every entry is blank.
pub fn parse_csv(key: &str) -> MirrorResult<Option<Vec<String>>> {
    let raw = match env::var(key) {
        Ok(v) => v,
        Err(_) => return Ok(None),
    };

    let values: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    if values.is_empty() {
        return Err(MirrorError::Config(format!(
            "{key} is set but contains no values"
        )));
    }

    Ok(Some(values))
}
