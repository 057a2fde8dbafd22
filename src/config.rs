use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use derive_more::derive::Display;
use log::warn;

#[derive(Debug, Display, PartialEq, Eq)]
pub enum ConfigError {
    #[display("Environment variable {_0} must be set")]
    Missing(&'static str),

    #[display("Environment variable {name} has an invalid value {value:?}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub development: bool,
    pub cors_origins: Vec<String>,

    /// Prefix of every generated flag, e.g. `C0D{...}`.
    pub flag_prefix: String,
    pub max_containers_per_team: i64,
    /// Command run inside a fresh container, the flag is appended as the last argument.
    pub flag_command: Vec<String>,

    pub hint_cost: i32,
    pub leaderboard_period: Duration,

    pub static_root: PathBuf,
    pub static_base_url: String,
    pub static_mount_target: String,
    pub static_token_ttl: Duration,

    pub token_secret: String,
    pub admin_key_hash: String,

    pub docker_socket: Option<String>,
    pub meta_team_count: usize,
    pub shutdown_budget: Duration,

    /// Local time of the event. Decides which pre-event problems are live today.
    pub event_offset: FixedOffset,
}

const IST_OFFSET_MINUTES: i32 = 5 * 60 + 30;

fn offset_from_minutes(minutes: i32) -> Option<FixedOffset> {
    minutes.checked_mul(60).and_then(FixedOffset::east_opt)
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            bind_addr: "0.0.0.0:9000".to_owned(),
            development: false,
            cors_origins: vec![],
            flag_prefix: "C0D".to_owned(),
            max_containers_per_team: 3,
            flag_command: vec!["/bin/bash".to_owned(), "/root/gen_flag".to_owned()],
            hint_cost: 10,
            leaderboard_period: Duration::from_secs(30),
            static_root: PathBuf::from("/var/lib/ctf-arena/static"),
            static_base_url: "http://localhost:9000/static".to_owned(),
            static_mount_target: "/srv/bundle".to_owned(),
            static_token_ttl: Duration::from_secs(6 * 3600),
            token_secret: String::new(),
            admin_key_hash: String::new(),
            docker_socket: None,
            meta_team_count: 12,
            shutdown_budget: Duration::from_secs(30),
            event_offset: offset_from_minutes(IST_OFFSET_MINUTES).unwrap_or(Utc.fix()),
        }
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name))
}

fn parsed<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        let defaults = Config::default();

        let development = matches!(env::var("MODE"), Ok(mode) if mode == "dev");
        if development {
            warn!("Under development mode.");
        }

        let cors_origins = env::var("CORS_ORIGINS")
            .map(|origins| {
                origins
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(str::to_owned)
                    .collect()
            })
            .unwrap_or_default();

        let flag_command = match env::var("FLAG_COMMAND") {
            Ok(cmd) => cmd.split_whitespace().map(str::to_owned).collect(),
            Err(_) => defaults.flag_command,
        };

        let meta_team_count = parsed("META_TEAM_COUNT", defaults.meta_team_count)?;
        if meta_team_count == 0 {
            return Err(ConfigError::Invalid {
                name: "META_TEAM_COUNT",
                value: "0".to_owned(),
            });
        }

        let offset_minutes = parsed("EVENT_UTC_OFFSET_MINUTES", IST_OFFSET_MINUTES)?;
        let event_offset =
            offset_from_minutes(offset_minutes).ok_or_else(|| ConfigError::Invalid {
                name: "EVENT_UTC_OFFSET_MINUTES",
                value: offset_minutes.to_string(),
            })?;

        let max_containers_per_team =
            parsed("MAX_CONTAINERS_PER_TEAM", defaults.max_containers_per_team)?;
        if max_containers_per_team < 1 {
            return Err(ConfigError::Invalid {
                name: "MAX_CONTAINERS_PER_TEAM",
                value: max_containers_per_team.to_string(),
            });
        }

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            bind_addr: env::var("BIND_ADDR").unwrap_or(defaults.bind_addr),
            development,
            cors_origins,
            flag_prefix: env::var("FLAG_PREFIX").unwrap_or(defaults.flag_prefix),
            max_containers_per_team,
            flag_command,
            hint_cost: parsed("HINT_COST", defaults.hint_cost)?,
            leaderboard_period: Duration::from_secs(parsed("LEADERBOARD_PERIOD_SECS", 30u64)?),
            static_root: env::var("STATIC_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.static_root),
            static_base_url: env::var("STATIC_BASE_URL").unwrap_or(defaults.static_base_url),
            static_mount_target: env::var("STATIC_MOUNT_TARGET")
                .unwrap_or(defaults.static_mount_target),
            static_token_ttl: Duration::from_secs(parsed("STATIC_TOKEN_TTL_SECS", 6 * 3600u64)?),
            token_secret: required("TOKEN_SECRET")?,
            admin_key_hash: required("ADMIN_KEY_HASH")?.to_lowercase(),
            docker_socket: env::var("DOCKER_SOCKET").ok(),
            meta_team_count,
            shutdown_budget: Duration::from_secs(parsed("SHUTDOWN_BUDGET_SECS", 30u64)?),
            event_offset,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_event_rules() {
        let config = Config::default();
        assert_eq!(config.flag_prefix, "C0D");
        assert_eq!(config.max_containers_per_team, 3);
        assert_eq!(config.leaderboard_period, Duration::from_secs(30));
        assert_eq!(config.meta_team_count, 12);
        assert_eq!(config.event_offset.local_minus_utc(), 19800);
    }

    #[test]
    fn offsets_beyond_a_day_are_rejected() {
        assert_eq!(offset_from_minutes(-300).map(|o| o.local_minus_utc()), Some(-18000));
        assert!(offset_from_minutes(24 * 60).is_none());
        assert!(offset_from_minutes(i32::MAX).is_none());
    }

    #[test]
    fn invalid_numbers_are_reported_by_name() {
        std::env::set_var("CTF_ARENA_TEST_NUMBER", "many");
        let result = parsed::<u64>("CTF_ARENA_TEST_NUMBER", 1);
        assert_eq!(
            result,
            Err(ConfigError::Invalid {
                name: "CTF_ARENA_TEST_NUMBER",
                value: "many".to_owned()
            })
        );
        std::env::remove_var("CTF_ARENA_TEST_NUMBER");
        assert_eq!(parsed::<u64>("CTF_ARENA_TEST_NUMBER", 7), Ok(7));
    }
}
