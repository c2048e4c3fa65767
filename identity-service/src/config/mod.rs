use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::collections::HashMap;
use std::env;
use std::time::Duration;

use crate::models::RateAction;

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    /// Port the Prometheus exporter listens on.
    pub metrics_port: u16,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub store: StoreConfig,
    pub jwt: JwtConfig,
    pub otp: OtpConfig,
    pub rate_limit: RateLimitConfig,
    pub permissions: PermissionConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Deadline applied to every keyed-store and database call.
    pub call_timeout_ms: u64,
}

impl StoreConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            call_timeout_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub private_key_path: String,
    pub public_key_path: String,
    pub access_token_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtpConfig {
    pub code_length: usize,
    pub ttl_seconds: u64,
    pub max_attempts: u32,
    pub cooldown_seconds: u64,
    /// Generations allowed per rolling hour before the lockout kicks in.
    pub max_generations_per_hour: u32,
    pub lockout_seconds: u64,
    /// Server-side pepper for the code HMAC.
    pub hash_secret: String,
}

impl Default for OtpConfig {
    fn default() -> Self {
        Self {
            code_length: 6,
            ttl_seconds: 600,
            max_attempts: 3,
            cooldown_seconds: 60,
            max_generations_per_hour: 5,
            lockout_seconds: 24 * 60 * 60,
            hash_secret: String::new(),
        }
    }
}

/// How the sliding window is enforced.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WindowStrategy {
    /// Read, filter, append. Small overshoot possible under concurrent
    /// calls on the same key.
    BestEffort,
    /// Store-side atomic primitive; exact cap.
    Atomic,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct RatePolicy {
    pub limit: u32,
    pub window_seconds: u64,
}

impl RatePolicy {
    pub const fn new(limit: u32, window_seconds: u64) -> Self {
        Self {
            limit,
            window_seconds,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub strategy: WindowStrategy,
    pub policies: HashMap<RateAction, RatePolicy>,
}

impl RateLimitConfig {
    pub fn policy(&self, action: RateAction) -> RatePolicy {
        self.policies
            .get(&action)
            .copied()
            .unwrap_or_else(|| action.default_policy())
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            strategy: WindowStrategy::BestEffort,
            policies: RateAction::ALL
                .iter()
                .map(|action| (*action, action.default_policy()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PermissionConfig {
    pub cache_ttl_seconds: u64,
}

impl Default for PermissionConfig {
    fn default() -> Self {
        Self {
            cache_ttl_seconds: 300,
        }
    }
}

/// The settings the four components need, without connection details.
#[derive(Debug, Clone, Default)]
pub struct ComponentConfig {
    pub store: StoreConfig,
    pub otp: OtpConfig,
    pub rate_limit: RateLimitConfig,
    pub permissions: PermissionConfig,
}

impl PermissionConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

impl IdentityConfig {
    pub fn components(&self) -> ComponentConfig {
        ComponentConfig {
            store: self.store.clone(),
            otp: self.otp.clone(),
            rate_limit: self.rate_limit.clone(),
            permissions: self.permissions.clone(),
        }
    }

    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let strategy = get_env("RATE_LIMIT_STRATEGY", Some("best_effort"), is_prod)?
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let mut policies = HashMap::new();
        for action in RateAction::ALL {
            let defaults = action.default_policy();
            let prefix = format!("RATE_LIMIT_{}", action.as_str().to_uppercase());
            let limit = parse_env(
                &format!("{}_ATTEMPTS", prefix),
                &defaults.limit.to_string(),
                is_prod,
            )?;
            let window_seconds = parse_env(
                &format!("{}_WINDOW_SECONDS", prefix),
                &defaults.window_seconds.to_string(),
                is_prod,
            )?;
            policies.insert(action, RatePolicy::new(limit, window_seconds));
        }

        let otp_defaults = OtpConfig::default();

        let config = IdentityConfig {
            common: common_config,
            environment: environment.clone(),
            metrics_port: parse_env("METRICS_PORT", "9090", is_prod)?,
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", "10", is_prod)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", "1", is_prod)?,
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", None, is_prod)?,
            },
            store: StoreConfig {
                call_timeout_ms: parse_env("STORE_CALL_TIMEOUT_MS", "2000", is_prod)?,
            },
            jwt: JwtConfig {
                private_key_path: get_env("JWT_PRIVATE_KEY_PATH", None, is_prod)?,
                public_key_path: get_env("JWT_PUBLIC_KEY_PATH", None, is_prod)?,
                access_token_expiry_minutes: parse_env(
                    "JWT_ACCESS_TOKEN_EXPIRY_MINUTES",
                    "15",
                    is_prod,
                )?,
                refresh_token_expiry_days: parse_env(
                    "JWT_REFRESH_TOKEN_EXPIRY_DAYS",
                    "7",
                    is_prod,
                )?,
            },
            otp: OtpConfig {
                code_length: parse_env(
                    "OTP_CODE_LENGTH",
                    &otp_defaults.code_length.to_string(),
                    is_prod,
                )?,
                ttl_seconds: parse_env(
                    "OTP_TTL_SECONDS",
                    &otp_defaults.ttl_seconds.to_string(),
                    is_prod,
                )?,
                max_attempts: parse_env(
                    "OTP_MAX_ATTEMPTS",
                    &otp_defaults.max_attempts.to_string(),
                    is_prod,
                )?,
                cooldown_seconds: parse_env(
                    "OTP_COOLDOWN_SECONDS",
                    &otp_defaults.cooldown_seconds.to_string(),
                    is_prod,
                )?,
                max_generations_per_hour: parse_env(
                    "OTP_MAX_GENERATIONS_PER_HOUR",
                    &otp_defaults.max_generations_per_hour.to_string(),
                    is_prod,
                )?,
                lockout_seconds: parse_env(
                    "OTP_LOCKOUT_SECONDS",
                    &otp_defaults.lockout_seconds.to_string(),
                    is_prod,
                )?,
                hash_secret: get_env("OTP_HASH_SECRET", Some(""), is_prod)?,
            },
            rate_limit: RateLimitConfig {
                strategy,
                policies,
            },
            permissions: PermissionConfig {
                cache_ttl_seconds: parse_env("PERMISSION_CACHE_TTL_SECONDS", "300", is_prod)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.jwt.access_token_expiry_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_ACCESS_TOKEN_EXPIRY_MINUTES must be positive"
            )));
        }

        if self.jwt.refresh_token_expiry_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_REFRESH_TOKEN_EXPIRY_DAYS must be positive"
            )));
        }

        if self.store.call_timeout_ms == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "STORE_CALL_TIMEOUT_MS must be positive"
            )));
        }

        validate_otp(&self.otp)?;

        for (action, policy) in &self.rate_limit.policies {
            if policy.limit == 0 || policy.window_seconds == 0 {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Rate limit policy for {} must have a positive limit and window",
                    action.as_str()
                )));
            }
        }

        if self.permissions.cache_ttl_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PERMISSION_CACHE_TTL_SECONDS must be positive"
            )));
        }

        if self.environment == Environment::Prod {
            if self.otp.hash_secret.len() < 32 {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "OTP_HASH_SECRET must be at least 32 bytes in production"
                )));
            }

            if self.rate_limit.strategy == WindowStrategy::BestEffort {
                tracing::warn!(
                    "Rate limiter runs in best_effort mode in production; concurrent bursts may slightly exceed limits"
                );
            }
        }

        Ok(())
    }
}

pub fn validate_otp(otp: &OtpConfig) -> Result<(), AppError> {
    if !(4..=10).contains(&otp.code_length) {
        return Err(AppError::ConfigError(anyhow::anyhow!(
            "OTP_CODE_LENGTH must be between 4 and 10"
        )));
    }

    if otp.max_attempts == 0 {
        return Err(AppError::ConfigError(anyhow::anyhow!(
            "OTP_MAX_ATTEMPTS must be positive"
        )));
    }

    if otp.ttl_seconds == 0 || otp.lockout_seconds == 0 || otp.max_generations_per_hour == 0 {
        return Err(AppError::ConfigError(anyhow::anyhow!(
            "OTP TTL, lockout and generation limit must be positive"
        )));
    }

    Ok(())
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl std::str::FromStr for WindowStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "best_effort" => Ok(WindowStrategy::BestEffort),
            "atomic" => Ok(WindowStrategy::Atomic),
            _ => Err(format!("Invalid rate limit strategy: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> IdentityConfig {
        IdentityConfig {
            common: core_config::Config::default(),
            environment: Environment::Dev,
            metrics_port: 9090,
            database: DatabaseConfig {
                url: "postgres://localhost/identity_test".to_string(),
                max_connections: 5,
                min_connections: 1,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
            },
            store: StoreConfig::default(),
            jwt: JwtConfig {
                private_key_path: "private.pem".to_string(),
                public_key_path: "public.pem".to_string(),
                access_token_expiry_minutes: 15,
                refresh_token_expiry_days: 7,
            },
            otp: OtpConfig::default(),
            rate_limit: RateLimitConfig::default(),
            permissions: PermissionConfig::default(),
        }
    }

    #[test]
    fn test_defaults_are_valid_in_dev() {
        assert!(test_config().validate().is_ok());
    }

    #[test]
    fn test_prod_requires_otp_secret() {
        let mut config = test_config();
        config.environment = Environment::Prod;
        assert!(config.validate().is_err());

        config.otp.hash_secret = "x".repeat(32);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_limit_policy() {
        let mut config = test_config();
        config
            .rate_limit
            .policies
            .insert(RateAction::Login, RatePolicy::new(0, 60));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_otp_settings() {
        let mut config = test_config();
        config.otp.code_length = 3;
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.otp.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_policy_falls_back_to_action_default() {
        let config = RateLimitConfig {
            strategy: WindowStrategy::Atomic,
            policies: HashMap::new(),
        };
        assert_eq!(config.policy(RateAction::Login), RateAction::Login.default_policy());
    }

    #[test]
    fn test_parse_enums() {
        assert_eq!("PROD".parse::<Environment>(), Ok(Environment::Prod));
        assert_eq!("atomic".parse::<WindowStrategy>(), Ok(WindowStrategy::Atomic));
        assert!("sometimes".parse::<WindowStrategy>().is_err());
    }
}
