#![forbid(unsafe_code)]

use anyhow::{Context, Result, anyhow};
use log::LevelFilter;
use std::{
    collections::HashMap,
    env, fs,
    net::IpAddr,
    path::{Path, PathBuf},
};

use crate::youtube::MetadataProvider;

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_DATABASE_PATH: &str = "watchparty.db";
pub const DEFAULT_WWW_ROOT: &str = "www";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_SESSION_DAYS: i64 = 7;
pub const MAX_SESSION_DAYS: i64 = 3650;

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub database_path: PathBuf,
    pub www_root: PathBuf,
    pub port: u16,
    pub host: IpAddr,
    pub metadata_provider: MetadataProvider,
    pub session_days: i64,
    pub log_level: LevelFilter,
}

/// Values passed on the command line. Anything left as `None` falls through to
/// the process environment and then to the `.env` file.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub database_path: Option<PathBuf>,
    pub www_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub metadata_provider: Option<String>,
    pub log_level: Option<String>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_settings(overrides: RuntimeOverrides) -> Result<RuntimeSettings> {
    let env_path = overrides
        .env_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(&env_path)?;
    build_runtime_settings(&file_vars, env_var_string, overrides)
}

fn build_runtime_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeSettings> {
    let database_path = overrides
        .database_path
        .or_else(|| lookup_value("WATCHPARTY_DB", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH));
    let www_root = overrides
        .www_root
        .or_else(|| lookup_value("WWW_ROOT", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WWW_ROOT));
    let port = overrides
        .port
        .or_else(|| {
            lookup_value("WATCHPARTY_PORT", file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);
    let host = overrides
        .host
        .and_then(non_blank)
        .or_else(|| lookup_value("WATCHPARTY_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    let host = host
        .trim()
        .parse::<IpAddr>()
        .with_context(|| format!("expected a valid IPv4 or IPv6 address, got {host:?}"))?;

    let provider_raw = overrides
        .metadata_provider
        .and_then(non_blank)
        .or_else(|| lookup_value("WATCHPARTY_METADATA", file_vars, &env_lookup));
    let metadata_provider = match provider_raw {
        Some(raw) => MetadataProvider::parse(&raw)
            .ok_or_else(|| anyhow!("unknown metadata provider: {raw}"))?,
        None => MetadataProvider::default(),
    };

    let session_days = match lookup_value("WATCHPARTY_SESSION_DAYS", file_vars, &env_lookup)
        .and_then(|value| value.parse::<i64>().ok())
    {
        Some(days) if (1..=MAX_SESSION_DAYS).contains(&days) => days,
        Some(days) => {
            return Err(anyhow!(
                "WATCHPARTY_SESSION_DAYS must be between 1 and {MAX_SESSION_DAYS}, got {days}"
            ));
        }
        None => DEFAULT_SESSION_DAYS,
    };

    let log_level = overrides
        .log_level
        .and_then(non_blank)
        .or_else(|| lookup_value("WATCHPARTY_LOG", file_vars, &env_lookup))
        .and_then(|value| value.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);

    Ok(RuntimeSettings {
        database_path,
        www_root,
        port,
        host,
        metadata_provider,
        session_days,
        log_level,
    })
}

fn non_blank(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(non_blank)
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
