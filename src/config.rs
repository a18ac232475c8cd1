//! Runtime configuration
use anyhow::Context;
use chrono::Duration;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub struct NegotiationConfig {
    pub decision_window: Duration,
    pub acceptance_window: Duration,
    /// Backoff between attempts to apply a due expiry.
    pub expiry_retry_delays: Vec<std::time::Duration>,
    pub sweep_interval: std::time::Duration,
    pub database_path: PathBuf,
}

impl Default for NegotiationConfig {
    fn default() -> Self {
        Self {
            decision_window: Duration::minutes(5),
            acceptance_window: Duration::minutes(30),
            expiry_retry_delays: [1, 2, 4].map(std::time::Duration::from_secs).to_vec(),
            sweep_interval: std::time::Duration::from_secs(30),
            database_path: PathBuf::from("negotiation.db"),
        }
    }
}

impl NegotiationConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from any key/value source, falling back to defaults
    /// for missing keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(window) = parse_window(&lookup, "NEGOTIATION_DECISION_WINDOW_SECS")? {
            config.decision_window = window;
        }
        if let Some(window) = parse_window(&lookup, "NEGOTIATION_ACCEPTANCE_WINDOW_SECS")? {
            config.acceptance_window = window;
        }
        if let Some(secs) = parse_secs(&lookup, "NEGOTIATION_SWEEP_INTERVAL_SECS")? {
            config.sweep_interval = std::time::Duration::from_secs(secs);
        }
        if let Some(raw) = lookup("NEGOTIATION_RETRY_DELAYS_SECS") {
            config.expiry_retry_delays = raw
                .split(',')
                .map(|s| s.trim().parse::<u64>().map(std::time::Duration::from_secs))
                .collect::<Result<Vec<_>, _>>()
                .with_context(|| format!("NEGOTIATION_RETRY_DELAYS_SECS is malformed: {raw}"))?;
        }
        if let Some(path) = lookup("NEGOTIATION_DB_PATH") {
            config.database_path = PathBuf::from(path);
        }

        if config.decision_window <= Duration::zero() {
            anyhow::bail!("decision window must be positive");
        }
        if config.acceptance_window < config.decision_window {
            anyhow::bail!("acceptance window must not be shorter than the decision window");
        }

        Ok(config)
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> anyhow::Result<Option<u64>> {
    lookup(key)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .with_context(|| format!("{key} must be a whole number of seconds, got {raw}"))
        })
        .transpose()
}

fn parse_window(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> anyhow::Result<Option<Duration>> {
    parse_secs(lookup, key)?
        .map(|secs| {
            i64::try_from(secs)
                .ok()
                .and_then(Duration::try_seconds)
                .with_context(|| format!("{key} is out of range: {secs}"))
        })
        .transpose()
}
