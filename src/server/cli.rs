use std::str::FromStr;

use argh::FromArgs;

use crate::guess::GuessConfig;
use crate::scoring::ScoreConfig;
use crate::store::RedisConfig;

use super::timers::TimerConfig;

/// Real-time room server for a multiplayer draw-and-guess game.
#[derive(Debug, FromArgs)]
pub struct CliOpts {
    /// port to listen on (overrides PORT)
    #[argh(option, short = 'p')]
    pub port: Option<u16>,

    /// redis host (overrides REDIS_HOST)
    #[argh(option)]
    pub redis_host: Option<String>,

    /// log filter, e.g. `info` or `scrawl=debug` (overrides LOG_LEVEL)
    #[argh(option)]
    pub log_level: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: `{1}`")]
    Invalid(&'static str, String),
}

#[derive(Clone, Debug)]
pub struct Config {
    pub port: u16,
    pub app_env: String,
    pub log_level: String,
    /// JWT signing secret shared with the auth service; unset means dev mode
    pub secret_key_base: Option<String>,
    pub redis: RedisConfig,
    pub cors_allowed_origins: Vec<String>,
    /// how long an emptied room's state survives before expiry
    pub room_idle_ttl_secs: u64,
    pub guess: GuessConfig,
    pub scoring: ScoreConfig,
    pub timers: TimerConfig,
}

impl Config {
    pub fn from_env(opts: &CliOpts) -> Result<Config, ConfigError> {
        let redis = RedisConfig {
            host: opts
                .redis_host
                .clone()
                .or_else(|| env_var("REDIS_HOST"))
                .unwrap_or_else(|| "127.0.0.1".to_owned()),
            port: env_parsed("REDIS_PORT")?.unwrap_or(6379),
            db: env_parsed("REDIS_DB")?.unwrap_or(0),
            password: env_var("REDIS_PASSWORD"),
        };

        Ok(Config {
            port: opts.port.or(env_parsed("PORT")?).unwrap_or(4000),
            app_env: env_var("APP_ENV").unwrap_or_else(|| "dev".to_owned()),
            log_level: opts
                .log_level
                .clone()
                .or_else(|| env_var("LOG_LEVEL"))
                .unwrap_or_else(|| "info".to_owned()),
            secret_key_base: env_var("SECRET_KEY_BASE"),
            redis,
            cors_allowed_origins: env_var("CORS_ALLOWED_ORIGINS")
                .map(|raw| {
                    raw.split(',')
                        .map(|origin| origin.trim().to_owned())
                        .filter(|origin| !origin.is_empty())
                        .collect()
                })
                .unwrap_or_else(|| vec!["*".to_owned()]),
            room_idle_ttl_secs: env_parsed("ROOM_IDLE_TTL_SECS")?.unwrap_or(300),
            guess: GuessConfig::default(),
            scoring: ScoreConfig::default(),
            timers: TimerConfig::default(),
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_parsed<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env_var(name) {
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid(name, raw)),
        None => Ok(None),
    }
}
