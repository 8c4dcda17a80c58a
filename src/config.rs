// Environment-driven settings. Missing credentials or directories are fatal at startup.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::rate_limiter::{DEFAULT_PERIOD, DEFAULT_RATE};
use crate::scheduler::Schedule;

const DEFAULT_API_BASE_URL: &str = "https://apis.deutschebahn.com/db-api-marketplace/apis/timetables/v1";

#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub api_key: String,
    pub client_id: String,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub production: bool,
    pub credentials: Option<ApiCredentials>,
    pub private_api_key: Option<String>,
    pub base_url: String,
    pub api_base_url: String,
    pub snapshot_dir: PathBuf,
    pub eva_dir: PathBuf,
    pub eva_file: String,
    pub alt_station_names_file: Option<PathBuf>,
    pub delete_xml_after_import: bool,
    pub database: DatabaseConfig,
    pub rate_limit: u32,
    pub rate_period: Duration,
    pub fetch_schedule: Schedule,
    pub import_schedule: Schedule,
    pub static_dir: PathBuf,
    pub bind_addr: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let or = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());
        let flag = |key: &str| var(key).is_some_and(|value| value.eq_ignore_ascii_case("true"));

        let credentials = match (var("API_KEY"), var("CLIENT_ID")) {
            (Some(api_key), Some(client_id)) => Some(ApiCredentials { api_key, client_id }),
            _ => None,
        };

        let port = or("DB_PORT", "5432");
        let port = port
            .parse()
            .map_err(|_| Error::Config(format!("DB_PORT is not a port number: {}", port)))?;

        let rate_limit = parse_number(&or("RATE_LIMIT", &DEFAULT_RATE.to_string()), "RATE_LIMIT")?;
        let rate_period = parse_number(
            &or("RATE_PERIOD_SECS", &DEFAULT_PERIOD.as_secs().to_string()),
            "RATE_PERIOD_SECS",
        )?;
        if rate_limit == 0 || rate_period == 0 {
            return Err(Error::Config("RATE_LIMIT and RATE_PERIOD_SECS must be positive".to_string()));
        }

        let fetch_every = parse_number(&or("FETCH_EVERY_HOURS", "3"), "FETCH_EVERY_HOURS")?;
        let fetch_schedule = Schedule::every_hours(fetch_every)?;
        let import_schedule = Schedule::parse_daily(&or("IMPORT_AT", "03:00"))?;

        let snapshot_dir = var("XML_DIR").or_else(|| var("DATA_DIR")).unwrap_or_else(|| "data".to_string());

        Ok(Config {
            production: flag("PRODUCTION"),
            credentials,
            private_api_key: var("PRIVATE_API_KEY"),
            base_url: or("BASE_URL", "http://localhost:5000"),
            api_base_url: or("API_BASE_URL", DEFAULT_API_BASE_URL).trim_end_matches('/').to_string(),
            snapshot_dir: PathBuf::from(snapshot_dir),
            eva_dir: PathBuf::from(or("EVA_DIR", "data")),
            eva_file: or("EVA_FILE", "current_eva_list.csv"),
            alt_station_names_file: var("ALT_STATION_NAMES_FILE").map(PathBuf::from),
            delete_xml_after_import: flag("DELETE_XML_AFTER_IMPORT"),
            database: DatabaseConfig {
                host: or("DB_HOST", "localhost"),
                port,
                name: or("DB_NAME", "deutsche_bahn_data"),
                user: or("DB_USER", "postgres"),
                password: or("DB_PASSWORD", "postgres"),
            },
            rate_limit: u32::try_from(rate_limit)
                .map_err(|_| Error::Config(format!("RATE_LIMIT must fit in 32 bits, got {}", rate_limit)))?,
            rate_period: Duration::from_secs(rate_period),
            fetch_schedule,
            import_schedule,
            static_dir: PathBuf::from(or("STATIC_DIR", "frontend/dist")),
            bind_addr: or("BIND_ADDR", "0.0.0.0:5000"),
        })
    }

    pub fn require_credentials(&self) -> Result<&ApiCredentials> {
        self.credentials
            .as_ref()
            .ok_or_else(|| Error::Config("No API Key or Client Id provided!".to_string()))
    }

    pub fn require_private_api_key(&self) -> Result<&str> {
        self.private_api_key
            .as_deref()
            .ok_or_else(|| Error::Config("No Private API Key provided!".to_string()))
    }

    pub fn eva_list_path(&self) -> PathBuf {
        self.eva_dir.join(&self.eva_file)
    }

    pub fn log_level(&self) -> tracing::Level {
        if self.production {
            tracing::Level::WARN
        } else {
            tracing::Level::INFO
        }
    }
}

fn parse_number(value: &str, key: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{} must be a positive integer, got {:?}", key, value)))
}
