//! Process configuration.
//! Mission: one place to read env/CLI-driven settings, fail fast on anything malformed.

use anyhow::{Context, Result};
use chrono_tz::Tz;
use std::time::Duration;

/// Application configuration, read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: String,

    pub http_port: u16,
    pub api_key: String,

    pub broker_host: String,
    pub broker_port: u16,
    pub broker_client_id: i64,
    pub broker_min_version: i32,

    pub claude_api_key: Option<String>,
    pub gpt4o_api_key: Option<String>,
    pub gemini_api_key: Option<String>,
    pub claude_model: String,
    pub gpt4o_model: String,
    pub gemini_model: String,
    pub model_timeout: Duration,

    pub weights_path: String,
    pub weights_reload_interval: Duration,

    pub flatten_time_hhmm: String,
    pub flatten_timezone: Tz,

    pub max_position_pct: f64,
    pub max_daily_loss_pct: f64,
    pub max_concentration_pct: f64,
    pub max_daily_trades: u32,
    pub consecutive_loss_limit: u32,

    pub subscription_cap: usize,
    pub mcp_idle_ttl: Duration,
    pub outbound_stream_buffer: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./betterbridge.db".to_string());

        let http_port = env_parse("REST_PORT", 8080)?;

        let api_key = std::env::var("API_KEY")
            .context("API_KEY must be set (shared secret for X-API-Key / Bearer auth)")?;
        if api_key.trim().is_empty() {
            anyhow::bail!("API_KEY must not be empty");
        }

        let broker_host = std::env::var("BROKER_HOST").unwrap_or_else(|_| "127.0.0.1".into());
        let broker_port = env_parse("BROKER_PORT", 7497u16)?;
        let broker_client_id = env_parse("BROKER_CLIENT_ID", 1i64)?;
        let broker_min_version = env_parse("BROKER_MIN_VERSION", 100i32)?;

        let claude_api_key = std::env::var("CLAUDE_API_KEY").ok().filter(|s| !s.is_empty());
        let gpt4o_api_key = std::env::var("GPT4O_API_KEY").ok().filter(|s| !s.is_empty());
        let gemini_api_key = std::env::var("GEMINI_API_KEY").ok().filter(|s| !s.is_empty());

        let claude_model =
            std::env::var("CLAUDE_MODEL").unwrap_or_else(|_| "claude-sonnet".to_string());
        let gpt4o_model = std::env::var("GPT4O_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
        let gemini_model =
            std::env::var("GEMINI_MODEL").unwrap_or_else(|_| "gemini-1.5-pro".to_string());

        let model_timeout_secs: u64 = env_parse("MODEL_TIMEOUT_SECS", 30u64)?;

        let weights_path =
            std::env::var("WEIGHTS_PATH").unwrap_or_else(|_| "./weights.json".to_string());
        let weights_reload_secs: u64 = env_parse("WEIGHTS_RELOAD_SECS", 5u64)?;

        let flatten_time_hhmm =
            std::env::var("FLATTEN_TIME").unwrap_or_else(|_| "16:00".to_string());
        let flatten_tz_name =
            std::env::var("FLATTEN_TIMEZONE").unwrap_or_else(|_| "America/New_York".to_string());
        let flatten_timezone: Tz = flatten_tz_name
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid FLATTEN_TIMEZONE: {flatten_tz_name}"))?;

        let max_position_pct = env_parse("MAX_POSITION_PCT", 0.10)?;
        let max_daily_loss_pct = env_parse("MAX_DAILY_LOSS_PCT", 0.02)?;
        let max_concentration_pct = env_parse("MAX_CONCENTRATION_PCT", 0.25)?;
        let max_daily_trades = env_parse("MAX_DAILY_TRADES", 50u32)?;
        let consecutive_loss_limit = env_parse("CONSECUTIVE_LOSS_LIMIT", 5u32)?;

        let subscription_cap = env_parse("SUBSCRIPTION_CAP", 50usize)?;
        let mcp_idle_ttl_secs: u64 = env_parse("MCP_IDLE_TTL_SECS", 1800u64)?;
        let outbound_stream_buffer = env_parse("OUTBOUND_STREAM_BUFFER", 1000usize)?;

        Ok(Self {
            database_path,
            http_port,
            api_key,
            broker_host,
            broker_port,
            broker_client_id,
            broker_min_version,
            claude_api_key,
            gpt4o_api_key,
            gemini_api_key,
            claude_model,
            gpt4o_model,
            gemini_model,
            model_timeout: Duration::from_secs(model_timeout_secs),
            weights_path,
            weights_reload_interval: Duration::from_secs(weights_reload_secs),
            flatten_time_hhmm,
            flatten_timezone,
            max_position_pct,
            max_daily_loss_pct,
            max_concentration_pct,
            max_daily_trades,
            consecutive_loss_limit,
            subscription_cap,
            mcp_idle_ttl: Duration::from_secs(mcp_idle_ttl_secs),
            outbound_stream_buffer,
        })
    }
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid {key}: {e}")),
        Err(_) => Ok(default),
    }
}
