// pgdumps3/src/config/mod.rs
use anyhow::{Context, Result};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::fs;
use std::path::Path;
use url::Url;

use crate::errors::PipelineError;

/// Every setting the tool understands. The JSON config file uses the same names in lower case.
const KNOWN_KEYS: &[&str] = &[
    "DB_HOST",
    "DB_PORT",
    "DB_USER",
    "DB_PASSWORD",
    "DB_NAME",
    "S3_BUCKET",
    "S3_ACCESS_KEY_ID",
    "S3_SECRET_ACCESS_KEY",
    "S3_REGION",
    "S3_ENDPOINT",
    "S3_SSL",
    "S3_PATH_PREFIX",
    "CRON_SCHEDULE",
    "LOG_LEVEL",
    "LOG_FORMAT",
    "RESTORE_KEY",
    "DUMP_INFIX",
    "DUMP_SUFFIX",
    "TIME_ZONE",
    "BACKUP_ON_SHUTDOWN",
    "PG_BIN_DIRS",
];

/// Database every PostgreSQL server has, used when the target database may not exist yet.
pub const MAINTENANCE_DATABASE: &str = "template1";

pub const DEFAULT_BIN_DIRS: &[&str] = &[
    "/usr/libexec/postgresql{version}",
    "/usr/lib/postgresql/{version}/bin",
];

/// Connection parameters for the database being dumped or restored.
#[derive(Clone, PartialEq, Eq)]
pub struct BackupTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
}

impl fmt::Debug for BackupTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupTarget")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

impl BackupTarget {
    /// Builds a `postgres://` URL for `database` on this server, escaping credentials.
    pub fn connection_url(&self, database: &str) -> std::result::Result<String, PipelineError> {
        let mut url = Url::parse("postgres://localhost")
            .map_err(|e| PipelineError::Config(format!("base URL: {}", e)))?;
        url.set_host(Some(&self.host))
            .map_err(|e| PipelineError::Config(format!("invalid DB_HOST {:?}: {}", self.host, e)))?;
        url.set_port(Some(self.port))
            .map_err(|_| PipelineError::Config("cannot set port on database URL".to_string()))?;
        url.set_username(&self.user)
            .map_err(|_| PipelineError::Config("cannot set user on database URL".to_string()))?;
        url.set_password(Some(&self.password))
            .map_err(|_| PipelineError::Config("cannot set password on database URL".to_string()))?;
        url.set_path(database);
        Ok(url.to_string())
    }
}

#[derive(Clone)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub ssl: bool,
}

impl fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint", &self.endpoint)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("ssl", &self.ssl)
            .finish()
    }
}

impl S3Settings {
    /// Endpoint with a scheme; `S3_SSL` decides the scheme when the configured value has none.
    pub fn endpoint_url(&self) -> Option<String> {
        self.endpoint.as_ref().map(|endpoint| {
            if endpoint.contains("://") {
                endpoint.trim_end_matches('/').to_string()
            } else {
                let scheme = if self.ssl { "https" } else { "http" };
                format!("{}://{}", scheme, endpoint.trim_end_matches('/'))
            }
        })
    }
}

/// Components of generated object keys.
#[derive(Debug, Clone)]
pub struct DumpNaming {
    pub prefix: String,
    pub infix: String,
    pub suffix: String,
    pub time_zone: Tz,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Text,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub target: BackupTarget,
    pub s3: S3Settings,
    pub naming: DumpNaming,
    pub cron_schedule: String,
    pub log_level: String,
    pub log_format: LogFormat,
    pub restore_key: Option<String>,
    pub backup_on_shutdown: bool,
    pub bin_dirs: Vec<String>,
}

impl AppConfig {
    /// Loads `.env`, then the optional `CONFIG_FILE` JSON document, then process environment
    /// variables; later sources win.
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut values = match env::var("CONFIG_FILE") {
            Ok(path) if !path.trim().is_empty() => load_json_settings(Path::new(path.trim()))?,
            _ => HashMap::new(),
        };
        for key in KNOWN_KEYS {
            if let Ok(value) = env::var(key) {
                values.insert((*key).to_string(), value);
            }
        }

        Self::from_values(&values)
    }

    /// Builds the configuration from upper-case setting names.
    pub fn from_values(values: &HashMap<String, String>) -> Result<Self> {
        let settings = Settings { values };

        let target = BackupTarget {
            host: settings.required("DB_HOST")?,
            port: settings.parsed("DB_PORT", 5432)?,
            user: settings.required("DB_USER")?,
            password: settings.required("DB_PASSWORD")?,
            database: settings.required("DB_NAME")?,
        };

        let s3 = S3Settings {
            bucket: settings.required("S3_BUCKET")?,
            region: settings.or("S3_REGION", "us-east-1"),
            endpoint: settings.optional("S3_ENDPOINT"),
            access_key_id: settings.required("S3_ACCESS_KEY_ID")?,
            secret_access_key: settings.required("S3_SECRET_ACCESS_KEY")?,
            ssl: settings.flag("S3_SSL", true)?,
        };

        let tz_name = settings.or("TIME_ZONE", "UTC");
        let time_zone: Tz = tz_name.parse().map_err(|e| {
            PipelineError::Config(format!("TIME_ZONE {:?} is not a known time zone: {}", tz_name, e))
        })?;

        let naming = DumpNaming {
            prefix: settings.or("S3_PATH_PREFIX", "backups"),
            infix: settings.raw("DUMP_INFIX").unwrap_or_default(),
            suffix: settings.raw("DUMP_SUFFIX").unwrap_or_else(|| ".sql.gz".to_string()),
            time_zone,
        };

        let log_format = match settings.or("LOG_FORMAT", "json").to_ascii_lowercase().as_str() {
            "json" => LogFormat::Json,
            "text" | "pretty" => LogFormat::Text,
            other => {
                return Err(PipelineError::Config(format!(
                    "LOG_FORMAT must be 'json' or 'text', got {:?}",
                    other
                ))
                .into());
            }
        };

        let bin_dirs = match settings.optional("PG_BIN_DIRS") {
            Some(raw) => parse_bin_dirs(&raw)?,
            None => DEFAULT_BIN_DIRS.iter().map(|d| d.to_string()).collect(),
        };

        Ok(AppConfig {
            target,
            s3,
            naming,
            cron_schedule: settings.or("CRON_SCHEDULE", "@daily"),
            log_level: settings.or("LOG_LEVEL", "info").to_ascii_lowercase(),
            log_format,
            restore_key: settings.optional("RESTORE_KEY"),
            backup_on_shutdown: settings.flag("BACKUP_ON_SHUTDOWN", false)?,
            bin_dirs,
        })
    }

    /// Child-process stderr is mirrored live only at debug verbosity.
    pub fn verbose(&self) -> bool {
        self.log_level == "debug" || self.log_level == "trace"
    }
}

struct Settings<'a> {
    values: &'a HashMap<String, String>,
}

impl Settings<'_> {
    fn raw(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }

    fn optional(&self, key: &str) -> Option<String> {
        self.values
            .get(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &str) -> Result<String> {
        self.optional(key)
            .with_context(|| format!("{} must be set", key))
    }

    fn or(&self, key: &str, default: &str) -> String {
        self.optional(key).unwrap_or_else(|| default.to_string())
    }

    fn parsed<T>(&self, key: &str, default: T) -> Result<T>
    where
        T: std::str::FromStr,
        T::Err: fmt::Display,
    {
        match self.optional(key) {
            Some(raw) => raw.parse::<T>().map_err(|e| {
                PipelineError::Config(format!("{} has invalid value {:?}: {}", key, raw, e)).into()
            }),
            None => Ok(default),
        }
    }

    fn flag(&self, key: &str, default: bool) -> Result<bool> {
        match self.optional(key) {
            Some(raw) => parse_flag(&raw).ok_or_else(|| {
                PipelineError::Config(format!("{} must be a boolean, got {:?}", key, raw)).into()
            }),
            None => Ok(default),
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_bin_dirs(raw: &str) -> Result<Vec<String>> {
    let dirs: Vec<String> = raw
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    if dirs.is_empty() {
        anyhow::bail!("PG_BIN_DIRS is set but lists no directories");
    }
    if let Some(bad) = dirs.iter().find(|d| !d.contains("{version}")) {
        return Err(PipelineError::Config(format!(
            "PG_BIN_DIRS entry {:?} must contain the {{version}} placeholder",
            bad
        ))
        .into());
    }
    Ok(dirs)
}

/// Reads a flat JSON object such as `{"db_host": "db", "db_port": 5432}` into upper-case keys.
fn load_json_settings(config_path: &Path) -> Result<HashMap<String, String>> {
    let config_content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
    let raw: HashMap<String, serde_json::Value> = serde_json::from_str(&config_content)
        .with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })?;

    let mut values = HashMap::new();
    for (key, value) in raw {
        let upper = key.to_ascii_uppercase();
        if !KNOWN_KEYS.contains(&upper.as_str()) {
            anyhow::bail!(
                "unknown setting {:?} in config file {}",
                key,
                config_path.display()
            );
        }
        let text = match value {
            serde_json::Value::String(s) => s,
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            serde_json::Value::Null => continue,
            other => anyhow::bail!(
                "setting {:?} in config file {} must be a string, number or boolean, got {}",
                key,
                config_path.display(),
                other
            ),
        };
        values.insert(upper, text);
    }
    Ok(values)
}

#[cfg(test)]
pub(crate) fn test_values() -> HashMap<String, String> {
    [
        ("DB_HOST", "db.internal"),
        ("DB_USER", "postgres"),
        ("DB_PASSWORD", "p@ss/word"),
        ("DB_NAME", "mydb"),
        ("S3_BUCKET", "test-bucket"),
        ("S3_ACCESS_KEY_ID", "minioadmin"),
        ("S3_SECRET_ACCESS_KEY", "minioadmin"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}
