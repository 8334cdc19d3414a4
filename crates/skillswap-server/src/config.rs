use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::warn;

use skillswap_booking::BookingConfig;
use skillswap_booking::retry::RetryPolicy;

const DEV_SECRET: &str = "dev-secret-change-me";

/// Server settings, read from `SKILLSWAP_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub signup_credits: i64,
    pub booking: BookingConfig,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let jwt_secret = get("SKILLSWAP_JWT_SECRET", DEV_SECRET);
        if jwt_secret == DEV_SECRET {
            warn!("SKILLSWAP_JWT_SECRET not set, using the development secret");
        }

        let signup_credits: i64 = parse(&lookup, "SKILLSWAP_SIGNUP_CREDITS", 10)?;
        if signup_credits < 0 {
            anyhow::bail!("SKILLSWAP_SIGNUP_CREDITS must not be negative");
        }

        let retry_attempts: u32 = parse(&lookup, "SKILLSWAP_RETRY_ATTEMPTS", 3)?;
        let booking = BookingConfig {
            reschedule_buffer: chrono::Duration::minutes(parse(
                &lookup,
                "SKILLSWAP_RESCHEDULE_BUFFER_MINUTES",
                30,
            )?),
            pending_ttl: chrono::Duration::hours(parse(&lookup, "SKILLSWAP_PENDING_TTL_HOURS", 168)?),
            store_timeout: Duration::from_millis(parse(&lookup, "SKILLSWAP_STORE_TIMEOUT_MS", 5000)?),
            retry: RetryPolicy {
                max_attempts: retry_attempts.max(1),
                initial_backoff: Duration::from_millis(parse(
                    &lookup,
                    "SKILLSWAP_RETRY_BACKOFF_MS",
                    100,
                )?),
            },
            sweep_interval: Duration::from_secs(
                parse::<u64, _>(&lookup, "SKILLSWAP_SWEEP_INTERVAL_SECS", 60)?.max(1),
            ),
        };

        Ok(Self {
            host: get("SKILLSWAP_HOST", "0.0.0.0"),
            port: parse(&lookup, "SKILLSWAP_PORT", 3000)?,
            db_path: PathBuf::from(get("SKILLSWAP_DB_PATH", "skillswap.db")),
            jwt_secret,
            signup_credits,
            booking,
        })
    }
}

fn parse<T, F>(lookup: &F, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 3000);
        assert_eq!(config.db_path, PathBuf::from("skillswap.db"));
        assert_eq!(config.jwt_secret, DEV_SECRET);
        assert_eq!(config.signup_credits, 10);
        assert_eq!(config.booking.reschedule_buffer, chrono::Duration::minutes(30));
        assert_eq!(config.booking.pending_ttl, chrono::Duration::days(7));
        assert_eq!(config.booking.store_timeout, Duration::from_secs(5));
        assert_eq!(config.booking.retry.max_attempts, 3);
        assert_eq!(config.booking.sweep_interval, Duration::from_secs(60));
    }

    #[test]
    fn overrides() {
        let config = config_from(&[
            ("SKILLSWAP_PORT", "8080"),
            ("SKILLSWAP_SIGNUP_CREDITS", "25"),
            ("SKILLSWAP_RESCHEDULE_BUFFER_MINUTES", "90"),
            ("SKILLSWAP_RETRY_ATTEMPTS", "0"),
        ])
        .unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.signup_credits, 25);
        assert_eq!(config.booking.reschedule_buffer, chrono::Duration::minutes(90));
        assert_eq!(config.booking.retry.max_attempts, 1);
    }

    #[test]
    fn rejects_garbage() {
        let err = config_from(&[("SKILLSWAP_PORT", "eighty")]).unwrap_err();
        assert!(err.to_string().contains("SKILLSWAP_PORT"));

        assert!(config_from(&[("SKILLSWAP_SIGNUP_CREDITS", "-5")]).is_err());
    }
}
