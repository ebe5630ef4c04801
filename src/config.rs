use alloy::primitives::{Address, U256};
use dotenvy::dotenv;
use eyre::{eyre, Result, WrapErr};
use rust_decimal::Decimal;
use std::{env, fmt, str::FromStr, time::Duration};
use tracing::info;

use crate::units::to_base_units;

/// Payout key; never printed.
#[derive(Clone)]
pub struct SecretKey(String);

impl SecretKey {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(***)")
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub rpc_http_url: String,
    pub db_path: String,
    pub port: u16,

    pub watched_token: Address,
    pub token_decimals: u8,

    pub reward_token: Address,
    pub reward_decimals: u8,
    pub reward_amount: Decimal,
    pub reward_threshold: Decimal,
    pub private_key: Option<SecretKey>,
    pub payout_confirmations: u64,
    pub payout_timeout: Duration,

    pub confirmations: u64,
    pub poll_interval: Duration,
    pub receipt_timeout: Duration,
    pub receipt_concurrency: usize,
    pub block_queue_capacity: usize,
    pub start_block: Option<u64>,

    pub notify_webhook_url: Option<String>,
}

impl Config {
    /// Reward amount in the reward token's base units.
    pub fn reward_base_units(&self) -> Result<U256> {
        to_base_units(self.reward_amount, self.reward_decimals).ok_or_else(|| {
            eyre!(
                "REWARD_AMOUNT {} is not representable with {} decimals",
                self.reward_amount,
                self.reward_decimals
            )
        })
    }
}

pub fn load() -> Result<Config> {
    dotenv().ok();

    // Explicit URL first, then Infura (Sepolia), then a local node
    let rpc_http_url = match (var("RPC_HTTP_URL"), var("INFURA_PROJECT_ID")) {
        (Some(url), _) => url,
        (None, Some(project)) => format!("https://sepolia.infura.io/v3/{}", project),
        (None, None) => "http://127.0.0.1:8545".to_string(),
    };

    let cfg = Config {
        rpc_http_url,
        db_path: var("DATABASE_URL").unwrap_or_else(|| "rewards.db".to_string()),
        port: parse_or("PORT", 3000)?,

        watched_token: required("WATCHED_TOKEN_ADDRESS")?,
        token_decimals: parse_or("TOKEN_DECIMALS", 18)?,

        reward_token: required("REWARD_TOKEN_ADDRESS")?,
        reward_decimals: parse_or("REWARD_TOKEN_DECIMALS", 18)?,
        reward_amount: parse_or("REWARD_AMOUNT", Decimal::ONE)?,
        reward_threshold: parse_or("REWARD_THRESHOLD", Decimal::new(500, 0))?,
        private_key: var("PRIVATE_KEY").map(SecretKey),
        payout_confirmations: parse_or("PAYOUT_CONFIRMATIONS", 1)?,
        payout_timeout: positive_secs("PAYOUT_TIMEOUT_SECS", 120)?,

        confirmations: parse_or("CONFIRMATIONS", 2)?,
        poll_interval: positive_secs("POLL_INTERVAL_SECS", 12)?,
        receipt_timeout: positive_secs("RECEIPT_TIMEOUT_SECS", 10)?,
        receipt_concurrency: parse_or("RECEIPT_CONCURRENCY", 8)?,
        block_queue_capacity: parse_or("BLOCK_QUEUE_CAPACITY", 64)?,
        start_block: var("START_BLOCK").map(|v| parse("START_BLOCK", &v)).transpose()?,

        notify_webhook_url: var("NOTIFY_WEBHOOK_URL"),
    };

    // fail at startup rather than on the first payout
    cfg.reward_base_units()?;

    info!("Loaded config: {:?}", cfg);
    Ok(cfg)
}

/// Non-empty environment variable.
fn var(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse<T>(key: &str, raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| eyre!("{}", e))
        .wrap_err_with(|| format!("invalid value for {}: `{}`", key, raw))
}

fn parse_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match var(key) {
        Some(raw) => parse(key, &raw),
        None => Ok(default),
    }
}

/// Whole seconds, zero rejected.
fn positive_secs(key: &str, default: u64) -> Result<Duration> {
    match parse_or(key, default)? {
        0 => Err(eyre!("{} must be at least 1 second", key)),
        secs => Ok(Duration::from_secs(secs)),
    }
}

fn required<T>(key: &str) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let raw = var(key).ok_or_else(|| eyre!("{} must be set", key))?;
    parse(key, &raw)
}
