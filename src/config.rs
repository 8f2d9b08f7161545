//! Configuration management for the hifz engine.
//!
//! Configuration is read from environment variables:
//! - `HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `PORT` - Optional. Server port. Defaults to `3000`.
//! - `DEV_MODE` - Optional. Disables authentication. Defaults to `false`.
//! - `STORE_TYPE` - Optional. `sqlite` or `memory`. Defaults to `sqlite`.
//! - `DATA_DIR` - Optional. Directory holding the SQLite database. Defaults to `./data`.
//! - `RECONCILE_INTERVAL_SECS` - Optional. Orphan reconciliation interval. Defaults to `300`.
//! - `OUTBOX_INTERVAL_SECS` - Optional. Notification delivery interval. Defaults to `10`.
//! - `MAX_WRITE_RETRIES` - Optional. Attempts per engine write on conflict. Defaults to `5`.
//! - `DEFAULT_REPETITION_COUNT` - Optional. Review repetitions for new cohorts. Defaults to `80`.
//! - `SCORING_PROVIDER_A_URL`, `SCORING_PROVIDER_B_URL` - Optional. AI scoring endpoints.
//! - `SCORING_API_KEY` - Optional. Bearer token sent to scoring endpoints.
//! - `SCORING_TIMEOUT_SECS` - Optional. Scoring request timeout. Defaults to `20`.
//! - `NOTIFY_WEBHOOK_URL` - Optional. Instructor notification webhook; logged only when unset.
//! - `JWT_SECRET` - Required unless `DEV_MODE` is set.
//! - `STAFF_PASSWORD`, `ADMIN_PASSWORD`, `BOT_PASSWORD` - Login passwords per role.
//! - `JWT_TTL_DAYS` - Optional. Token lifetime. Defaults to `30`.

use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

use crate::cohort::CohortScheduleConfig;
use crate::store::StoreType;
use crate::util::{env_var_bool, non_blank};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Read `name` and parse it, falling back to `default` when unset.
fn env_parse<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|v| non_blank(&v))
}

/// External AI scoring endpoints.
#[derive(Debug, Clone)]
pub struct ScoringConfig {
    pub provider_a_url: Option<String>,
    pub provider_b_url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            provider_a_url: None,
            provider_b_url: None,
            api_key: None,
            timeout_secs: 20,
        }
    }
}

impl ScoringConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider_a_url.is_some() || self.provider_b_url.is_some()
    }
}

/// Staff and bot authentication.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub jwt_secret: Option<String>,
    /// Instructor login
    pub staff_password: Option<String>,
    pub admin_password: Option<String>,
    /// Service login for the chat front-end
    pub bot_password: Option<String>,
    pub jwt_ttl_days: i64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: None,
            staff_password: None,
            admin_password: None,
            bot_password: None,
            jwt_ttl_days: 30,
        }
    }
}

impl AuthConfig {
    /// Whether requests must carry a token.
    pub fn auth_required(&self, dev_mode: bool) -> bool {
        !dev_mode
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Skip authentication entirely (local development)
    pub dev_mode: bool,

    pub store_type: StoreType,

    /// Directory for persistent data
    pub data_dir: PathBuf,

    pub reconcile_interval_secs: u64,

    pub outbox_interval_secs: u64,

    /// Attempts per engine write before surfacing a write conflict
    pub max_write_retries: u32,

    /// Schedule for cohorts that never saved their own
    pub default_schedule: CohortScheduleConfig,

    pub scoring: ScoringConfig,

    pub notify_webhook_url: Option<String>,

    pub auth: AuthConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `JWT_SECRET` is unset outside dev mode,
    /// and `ConfigError::InvalidValue` for unparsable numbers.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env_parse("PORT", 3000)?;
        let dev_mode = env_var_bool("DEV_MODE", false);

        let store_type = match std::env::var("STORE_TYPE") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| ConfigError::InvalidValue("STORE_TYPE".to_string(), e))?,
            Err(_) => StoreType::default(),
        };
        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let default_schedule = CohortScheduleConfig {
            repetition_count: env_parse("DEFAULT_REPETITION_COUNT", 80)?,
            ..Default::default()
        };
        default_schedule.validate().map_err(|e| {
            ConfigError::InvalidValue("DEFAULT_REPETITION_COUNT".to_string(), e.to_string())
        })?;

        let scoring = ScoringConfig {
            provider_a_url: env_opt("SCORING_PROVIDER_A_URL"),
            provider_b_url: env_opt("SCORING_PROVIDER_B_URL"),
            api_key: env_opt("SCORING_API_KEY"),
            timeout_secs: env_parse("SCORING_TIMEOUT_SECS", 20)?,
        };

        let auth = AuthConfig {
            jwt_secret: env_opt("JWT_SECRET"),
            staff_password: env_opt("STAFF_PASSWORD"),
            admin_password: env_opt("ADMIN_PASSWORD"),
            bot_password: env_opt("BOT_PASSWORD"),
            jwt_ttl_days: env_parse("JWT_TTL_DAYS", 30)?,
        };
        if auth.auth_required(dev_mode) && auth.jwt_secret.is_none() {
            return Err(ConfigError::MissingEnvVar("JWT_SECRET".to_string()));
        }

        Ok(Self {
            host,
            port,
            dev_mode,
            store_type,
            data_dir,
            reconcile_interval_secs: env_parse("RECONCILE_INTERVAL_SECS", 300)?,
            outbox_interval_secs: env_parse("OUTBOX_INTERVAL_SECS", 10)?,
            max_write_retries: env_parse("MAX_WRITE_RETRIES", 5)?,
            default_schedule,
            scoring,
            notify_webhook_url: env_opt("NOTIFY_WEBHOOK_URL"),
            auth,
        })
    }

    /// Create a config for tests: in-memory store, dev mode, nothing external.
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            dev_mode: true,
            store_type: StoreType::Memory,
            data_dir,
            reconcile_interval_secs: 300,
            outbox_interval_secs: 10,
            max_write_retries: 5,
            default_schedule: CohortScheduleConfig::default(),
            scoring: ScoringConfig::default(),
            notify_webhook_url: None,
            auth: AuthConfig::default(),
        }
    }
}
