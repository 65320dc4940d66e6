use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use parley_gateway::notify::PushConfig;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_WEBHOOK_TOLERANCE_SECS: u64 = 300;
const DEFAULT_PUSH_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub webhook_secret: Option<String>,
    /// `None` when the timestamp check is disabled (`PARLEY_WEBHOOK_TOLERANCE_SECS=0`).
    pub webhook_tolerance: Option<Duration>,
    pub push: PushConfig,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| get(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let port = parse_or(var("PARLEY_PORT"), "PARLEY_PORT", DEFAULT_PORT)?;
        let tolerance_secs = parse_or(
            var("PARLEY_WEBHOOK_TOLERANCE_SECS"),
            "PARLEY_WEBHOOK_TOLERANCE_SECS",
            DEFAULT_WEBHOOK_TOLERANCE_SECS,
        )?;
        let push_timeout = parse_or(
            var("PARLEY_PUSH_TIMEOUT_SECS"),
            "PARLEY_PUSH_TIMEOUT_SECS",
            DEFAULT_PUSH_TIMEOUT_SECS,
        )?;
        let push_enabled = match var("PARLEY_PUSH_ENABLED") {
            Some(v) => parse_flag(&v).context("Invalid PARLEY_PUSH_ENABLED")?,
            None => true,
        };

        let defaults = PushConfig::default();
        Ok(Self {
            host: var("PARLEY_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port,
            db_path: PathBuf::from(var("PARLEY_DB_PATH").unwrap_or_else(|| "parley.db".into())),
            webhook_secret: var("PARLEY_WEBHOOK_SECRET"),
            webhook_tolerance: (tolerance_secs > 0).then(|| Duration::from_secs(tolerance_secs)),
            push: PushConfig {
                enabled: push_enabled,
                endpoint: var("PARLEY_PUSH_URL").unwrap_or(defaults.endpoint),
                timeout: Duration::from_secs(push_timeout),
            },
        })
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<String>, key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(v) => v.parse().with_context(|| format!("Invalid {key}: '{v}'")),
        None => Ok(default),
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected a boolean, got '{other}'"),
    }
}
