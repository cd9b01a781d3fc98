use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};

/// Tunables shared by every pipeline stage.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub lookback_days: i64,
    pub trend_days: i64,
    pub top_k: usize,
    pub upsell_min_score: f64,
    pub retry_backoff: Duration,
    pub narrative_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            lookback_days: 30,
            trend_days: 7,
            top_k: 10,
            upsell_min_score: 70.0,
            retry_backoff: Duration::from_millis(250),
            narrative_timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NarrativeConfig {
    pub api_base: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub pipeline: PipelineConfig,
    pub narrative: Option<NarrativeConfig>,
}

impl Config {
    /// Reads and validates the environment. Called once at startup.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|value| !value.trim().is_empty())
            .context("DATABASE_URL must be set to a production Postgres instance")?;

        let defaults = PipelineConfig::default();
        let lookback_days = parse_or(&lookup, "ENGAGEMENT_LOOKBACK_DAYS", defaults.lookback_days)?;
        if lookback_days < 1 {
            bail!("ENGAGEMENT_LOOKBACK_DAYS must be at least 1, got {lookback_days}");
        }
        let trend_days = parse_or(&lookup, "ENGAGEMENT_TREND_DAYS", defaults.trend_days)?;
        if trend_days < 1 {
            bail!("ENGAGEMENT_TREND_DAYS must be at least 1, got {trend_days}");
        }
        let top_k: usize = parse_or(&lookup, "ENGAGEMENT_TOP_K", defaults.top_k)?;
        if top_k < 1 {
            bail!("ENGAGEMENT_TOP_K must be at least 1, got {top_k}");
        }
        let upsell_min_score =
            parse_or(&lookup, "ENGAGEMENT_UPSELL_MIN_SCORE", defaults.upsell_min_score)?;
        if !(0.0..=100.0).contains(&upsell_min_score) {
            bail!("ENGAGEMENT_UPSELL_MIN_SCORE must be within 0-100, got {upsell_min_score}");
        }
        let timeout_secs: u64 = parse_or(
            &lookup,
            "NARRATIVE_TIMEOUT_SECS",
            defaults.narrative_timeout.as_secs(),
        )?;

        let pipeline = PipelineConfig {
            lookback_days,
            trend_days,
            top_k,
            upsell_min_score,
            retry_backoff: defaults.retry_backoff,
            narrative_timeout: Duration::from_secs(timeout_secs.max(1)),
        };

        let narrative = lookup("NARRATIVE_API_KEY")
            .filter(|key| !key.trim().is_empty())
            .map(|api_key| NarrativeConfig {
                api_base: lookup("NARRATIVE_API_BASE")
                    .unwrap_or_else(|| "https://api.openai.com/v1".to_string()),
                api_key,
                model: lookup("NARRATIVE_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string()),
            });

        let bind_addr = parse_or(
            &lookup,
            "ENGAGEMENT_BIND_ADDR",
            SocketAddr::from(([127, 0, 0, 1], 8080)),
        )?;

        Ok(Self {
            database_url,
            bind_addr,
            pipeline,
            narrative,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> anyhow::Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("invalid value for {key} ({raw}): {err}")),
        None => Ok(default),
    }
}
