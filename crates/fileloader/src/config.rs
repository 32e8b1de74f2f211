//! Configuration management
//!
//! All settings come from the environment (a `.env` file is honoured via
//! dotenvy). When `ENV_STATE=dev`, every variable is first looked up with a
//! `DEV_` prefix and falls back to the bare name. Invalid configuration is a
//! startup failure and maps to process exit code 2.

use fileloader_common::{LoadError, LoadResult};
use serde::{Deserialize, Serialize};

/// Default batch size for reader/writer hand-off.
pub const DEFAULT_BATCH_SIZE: usize = 100_000;

/// Default per-step retry attempts for transient failures.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default base backoff delay in milliseconds (doubles per attempt).
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;

/// Default per-operation timeout for external calls, in seconds.
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 300;

/// Database engine selected by the `DATABASE_URL` scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbKind {
    Postgresql,
    Mysql,
    Mssql,
    Bigquery,
    /// In-process adapter used by the test suite and local dry runs.
    Memory,
}

impl DbKind {
    pub fn from_url(url: &str) -> LoadResult<Self> {
        let scheme = url.split("://").next().unwrap_or("").to_lowercase();
        match scheme.as_str() {
            "postgresql" | "postgres" => Ok(DbKind::Postgresql),
            "mysql" => Ok(DbKind::Mysql),
            "mssql" => Ok(DbKind::Mssql),
            "bigquery" => Ok(DbKind::Bigquery),
            "memory" => Ok(DbKind::Memory),
            other => Err(LoadError::config(format!(
                "unsupported database driver '{other}' in DATABASE_URL"
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DbKind::Postgresql => "postgresql",
            DbKind::Mysql => "mysql",
            DbKind::Mssql => "mssql",
            DbKind::Bigquery => "bigquery",
            DbKind::Memory => "memory",
        }
    }
}

/// File store backend selected by `FILE_HELPER_PLATFORM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorePlatform {
    #[default]
    Local,
    Aws,
    Azure,
    Gcp,
}

impl std::str::FromStr for StorePlatform {
    type Err = LoadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" | "default" => Ok(StorePlatform::Local),
            "aws" => Ok(StorePlatform::Aws),
            "azure" => Ok(StorePlatform::Azure),
            "gcp" => Ok(StorePlatform::Gcp),
            other => Err(LoadError::config(format!(
                "unsupported FILE_HELPER_PLATFORM '{other}'"
            ))),
        }
    }
}

/// SMTP settings; the transport itself is a collaborator, the engine only
/// builds messages.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SmtpSettings {
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub from_email: Option<String>,
    /// Always CC'd on failure notifications.
    pub data_team_email: Option<String>,
}

/// Telemetry endpoints (exporter wiring is a collaborator concern).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelemetrySettings {
    pub log_endpoint: Option<String>,
    pub trace_endpoint: Option<String>,
    pub authorization_token: Option<String>,
    pub enabled: bool,
}

/// Process configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub db_kind: DbKind,
    pub directory_path: String,
    pub archive_path: String,
    pub duplicate_files_path: String,
    pub platform: StorePlatform,
    pub batch_size: usize,
    pub workers: usize,
    pub retry_attempts: u32,
    pub retry_base_delay_ms: u64,
    pub operation_timeout_secs: u64,
    pub sql_server_sqlbulkcopy: bool,
    pub smtp: SmtpSettings,
    pub webhook_url: Option<String>,
    pub telemetry: TelemetrySettings,
    pub aws_region: Option<String>,
}

/// Environment lookup honouring the `DEV_` prefix under `ENV_STATE=dev`.
fn env_var(prefix: &str, name: &str) -> Option<String> {
    if !prefix.is_empty() {
        if let Ok(v) = std::env::var(format!("{prefix}{name}")) {
            return Some(v);
        }
    }
    std::env::var(name).ok()
}

impl Settings {
    /// Load configuration from environment and defaults.
    pub fn from_env() -> LoadResult<Self> {
        dotenvy::dotenv().ok();

        let prefix = match std::env::var("ENV_STATE").ok().as_deref() {
            Some(state) if state.eq_ignore_ascii_case("dev") => "DEV_",
            _ => "",
        };

        let required = |name: &str| -> LoadResult<String> {
            env_var(prefix, name)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| LoadError::config(format!("{name} is not set")))
        };

        let database_url = required("DATABASE_URL")?;
        let db_kind = DbKind::from_url(&database_url)?;

        let platform = env_var(prefix, "FILE_HELPER_PLATFORM")
            .map(|v| v.parse())
            .transpose()?
            .unwrap_or_default();

        let settings = Settings {
            database_url,
            db_kind,
            directory_path: required("DIRECTORY_PATH")?,
            archive_path: required("ARCHIVE_PATH")?,
            duplicate_files_path: required("DUPLICATE_FILES_PATH")?,
            platform,
            batch_size: env_var(prefix, "BATCH_SIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_BATCH_SIZE),
            workers: env_var(prefix, "WORKERS")
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(num_cpus::get),
            retry_attempts: env_var(prefix, "RETRY_ATTEMPTS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_RETRY_ATTEMPTS),
            retry_base_delay_ms: env_var(prefix, "RETRY_BASE_DELAY_MS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_RETRY_BASE_DELAY_MS),
            operation_timeout_secs: env_var(prefix, "OPERATION_TIMEOUT_SECS")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_OPERATION_TIMEOUT_SECS),
            sql_server_sqlbulkcopy: env_var(prefix, "SQL_SERVER_SQLBULKCOPY_FLAG")
                .and_then(|v| v.parse().ok())
                .unwrap_or(false),
            smtp: SmtpSettings {
                host: env_var(prefix, "SMTP_HOST"),
                port: env_var(prefix, "SMTP_PORT")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(587),
                user: env_var(prefix, "SMTP_USER"),
                password: env_var(prefix, "SMTP_PASSWORD"),
                from_email: env_var(prefix, "FROM_EMAIL"),
                data_team_email: env_var(prefix, "DATA_TEAM_EMAIL"),
            },
            webhook_url: env_var(prefix, "WEBHOOK_URL"),
            telemetry: TelemetrySettings {
                log_endpoint: env_var(prefix, "OPEN_TELEMETRY_LOG_ENDPOINT"),
                trace_endpoint: env_var(prefix, "OPEN_TELEMETRY_TRACE_ENDPOINT"),
                authorization_token: env_var(prefix, "OPEN_TELEMETRY_AUTHORIZATION_TOKEN"),
                enabled: env_var(prefix, "OPEN_TELEMETRY_FLAG")
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(false),
            },
            aws_region: env_var(prefix, "AWS_REGION"),
        };

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> LoadResult<()> {
        if self.batch_size == 0 {
            return Err(LoadError::config("BATCH_SIZE must be greater than 0"));
        }
        if self.workers == 0 {
            return Err(LoadError::config("WORKERS must be greater than 0"));
        }
        let distinct = [
            &self.directory_path,
            &self.archive_path,
            &self.duplicate_files_path,
        ];
        for (i, a) in distinct.iter().enumerate() {
            for b in distinct.iter().skip(i + 1) {
                if a == b {
                    return Err(LoadError::config(
                        "DIRECTORY_PATH, ARCHIVE_PATH and DUPLICATE_FILES_PATH must be distinct",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Minimum connection pool size: one per worker plus bookkeeping.
    pub fn min_pool_size(&self) -> u32 {
        (self.workers as u32) + 2
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_fileloader_env() {
        for key in [
            "ENV_STATE",
            "DATABASE_URL",
            "DIRECTORY_PATH",
            "ARCHIVE_PATH",
            "DUPLICATE_FILES_PATH",
            "DEV_DATABASE_URL",
            "BATCH_SIZE",
            "WORKERS",
            "FILE_HELPER_PLATFORM",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    fn db_kind_from_url() {
        assert_eq!(
            DbKind::from_url("postgresql://localhost/x").unwrap(),
            DbKind::Postgresql
        );
        assert_eq!(
            DbKind::from_url("bigquery://project/dataset").unwrap(),
            DbKind::Bigquery
        );
        assert_eq!(DbKind::from_url("memory://").unwrap(), DbKind::Memory);
        assert!(DbKind::from_url("oracle://x").is_err());
    }

    #[test]
    #[serial]
    fn missing_database_url_is_a_config_error() {
        clear_fileloader_env();
        std::env::set_var("DIRECTORY_PATH", "/tmp/drop");
        std::env::set_var("ARCHIVE_PATH", "/tmp/archive");
        std::env::set_var("DUPLICATE_FILES_PATH", "/tmp/dups");
        let err = Settings::from_env().unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
        clear_fileloader_env();
    }

    #[test]
    #[serial]
    fn dev_prefix_takes_precedence() {
        clear_fileloader_env();
        std::env::set_var("ENV_STATE", "dev");
        std::env::set_var("DATABASE_URL", "postgresql://prod/db");
        std::env::set_var("DEV_DATABASE_URL", "memory://");
        std::env::set_var("DIRECTORY_PATH", "/tmp/drop");
        std::env::set_var("ARCHIVE_PATH", "/tmp/archive");
        std::env::set_var("DUPLICATE_FILES_PATH", "/tmp/dups");
        let settings = Settings::from_env().unwrap();
        assert_eq!(settings.db_kind, DbKind::Memory);
        clear_fileloader_env();
    }

    #[test]
    #[serial]
    fn coinciding_paths_are_rejected() {
        clear_fileloader_env();
        std::env::set_var("DATABASE_URL", "memory://");
        std::env::set_var("DIRECTORY_PATH", "/tmp/same");
        std::env::set_var("ARCHIVE_PATH", "/tmp/same");
        std::env::set_var("DUPLICATE_FILES_PATH", "/tmp/dups");
        assert!(Settings::from_env().is_err());
        clear_fileloader_env();
    }
}
