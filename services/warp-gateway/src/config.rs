//! Environment configuration
//!
//! Everything is read once at startup from the environment; malformed
//! values fail fast rather than limping along with silent defaults.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use common::Secret;
use warp_pool::{DispatchConfig, MonitorConfig};
use warp_transport::TransportConfig;

/// Admin authorization modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAuthMode {
    /// Bearer token compared in constant time.
    Token,
    /// Loopback peers bypass the check; everyone else needs the token.
    Local,
    /// No check (development).
    Off,
}

impl AdminAuthMode {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "token" => Some(AdminAuthMode::Token),
            "local" => Some(AdminAuthMode::Local),
            "off" => Some(AdminAuthMode::Off),
            _ => None,
        }
    }
}

/// Gateway configuration.
pub struct Config {
    pub listen_addr: SocketAddr,
    pub db_path: PathBuf,
    /// base64url 32-byte key; absent means the dev-derived key.
    pub encryption_key: Option<String>,
    pub admin_token: Option<Secret<String>>,
    pub admin_auth_mode: AdminAuthMode,
    pub health_interval: Duration,
    pub cooldown_short: Duration,
    pub cooldown_long: Duration,
    pub h_fail_threshold: i64,
    pub f_threshold: i64,
    pub max_accounts_per_request: usize,
    pub api_url: String,
    pub token_url: String,
    pub quota_url: String,
    pub refresh_timeout: Duration,
    pub connect_timeout: Duration,
    pub read_idle_timeout: Duration,
    pub probe_timeout: Duration,
    pub lock_wait: Duration,
    pub http2_prior_knowledge: bool,
}

impl Config {
    pub fn from_env() -> common::Result<Self> {
        let admin_token = std::env::var("ADMIN_TOKEN")
            .ok()
            .filter(|t| !t.is_empty())
            .map(Secret::new);
        let mode_raw = env_or("ADMIN_AUTH_MODE", "token");
        let admin_auth_mode = AdminAuthMode::parse(&mode_raw).ok_or_else(|| {
            common::Error::Config(format!(
                "ADMIN_AUTH_MODE must be one of token, local, off (got {mode_raw:?})"
            ))
        })?;
        if admin_auth_mode != AdminAuthMode::Off && admin_token.is_none() {
            return Err(common::Error::Config(
                "ADMIN_TOKEN is required unless ADMIN_AUTH_MODE=off".into(),
            ));
        }

        Ok(Self {
            listen_addr: env_parse("LISTEN_ADDR", "0.0.0.0:8080".parse().unwrap())?,
            db_path: PathBuf::from(env_or("TOKEN_DB_PATH", "warp-gateway.db")),
            encryption_key: std::env::var("TOKEN_ENCRYPTION_KEY")
                .ok()
                .filter(|k| !k.is_empty()),
            admin_token,
            admin_auth_mode,
            health_interval: env_secs("POOL_REFRESH_INTERVAL_SECONDS", 3600)?,
            cooldown_short: env_secs("TOKEN_COOLDOWN_SECONDS", 300)?,
            cooldown_long: env_secs("TOKEN_QUOTA_COOLDOWN_SECONDS", 3600)?,
            h_fail_threshold: env_parse("H_FAIL_THRESHOLD", 3)?,
            f_threshold: env_parse("F_THRESHOLD", 3)?,
            max_accounts_per_request: env_parse("MAX_ACCOUNTS_PER_REQUEST", 3)?,
            api_url: env_or("WARP_API_URL", "https://app.warp.dev/ai/multi-agent"),
            token_url: env_or("WARP_TOKEN_URL", warp_auth::DEFAULT_TOKEN_URL),
            quota_url: env_or("WARP_QUOTA_URL", warp_auth::DEFAULT_QUOTA_URL),
            refresh_timeout: env_secs("REFRESH_TIMEOUT_SECONDS", 15)?,
            connect_timeout: env_secs("CONNECT_TIMEOUT_SECONDS", 10)?,
            read_idle_timeout: env_secs("READ_IDLE_TIMEOUT_SECONDS", 60)?,
            probe_timeout: env_secs("HEALTH_PROBE_TIMEOUT_SECONDS", 20)?,
            lock_wait: env_secs("SELECTOR_LOCK_WAIT_SECONDS", 5)?,
            http2_prior_knowledge: env_parse("WARP_HTTP2_PRIOR_KNOWLEDGE", false)?,
        })
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            max_accounts_per_request: self.max_accounts_per_request,
            cooldown_short: self.cooldown_short,
            cooldown_long: self.cooldown_long,
            f_threshold: self.f_threshold,
            h_fail_threshold: self.h_fail_threshold,
            lock_wait: self.lock_wait,
            access_token_skew: Duration::from_secs(60),
        }
    }

    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            interval: self.health_interval,
            probe_timeout: self.probe_timeout,
            h_fail_threshold: self.h_fail_threshold,
            cooldown_short: self.cooldown_short,
            cooldown_long: self.cooldown_long,
        }
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            api_url: self.api_url.clone(),
            connect_timeout: self.connect_timeout,
            read_idle_timeout: self.read_idle_timeout,
            http2_prior_knowledge: self.http2_prior_knowledge,
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_parse<T>(name: &str, default: T) -> common::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw.trim().parse().map_err(|e| {
            common::Error::Config(format!("invalid {name}={raw:?}: {e}"))
        }),
        _ => Ok(default),
    }
}

fn env_secs(name: &str, default: u64) -> common::Result<Duration> {
    Ok(Duration::from_secs(env_parse(name, default)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_mode_parsing() {
        assert_eq!(AdminAuthMode::parse("token"), Some(AdminAuthMode::Token));
        assert_eq!(AdminAuthMode::parse("local"), Some(AdminAuthMode::Local));
        assert_eq!(AdminAuthMode::parse("off"), Some(AdminAuthMode::Off));
        assert_eq!(AdminAuthMode::parse("open"), None);
    }

    #[test]
    fn env_parse_rejects_garbage() {
        // Env mutation is process-global; this test owns a unique name.
        unsafe { std::env::set_var("WG_TEST_PARSE", "not-a-number") };
        let result: common::Result<i64> = env_parse("WG_TEST_PARSE", 5);
        assert!(result.is_err());
        unsafe { std::env::set_var("WG_TEST_PARSE", "12") };
        assert_eq!(env_parse("WG_TEST_PARSE", 5).unwrap(), 12);
        unsafe { std::env::remove_var("WG_TEST_PARSE") };
        assert_eq!(env_parse("WG_TEST_PARSE", 5).unwrap(), 5);
    }
}
