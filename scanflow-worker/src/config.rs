use scanflow_core::{ScanflowError, content_scan::ContentScanConfig, durable::RuntimeConfig};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use url::Url;

const DEFAULT_CONFIG_LOCATIONS: [&str; 2] = ["scanflow.toml", "config/scanflow.toml"];

/// Fully resolved worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database: DatabaseConfig,
    pub scanner: ScannerConfig,
    pub runtime: RuntimeConfig,
    pub content_scan: ContentScanConfig,
    pub log: LogConfig,
    pub metadata: ConfigMetadata,
}

#[derive(Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout_secs: u64,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"<redacted>")
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .finish()
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Endpoint the batch payloads are POSTed to.
    pub url: Url,
    pub timeout_secs: u64,
}

impl ScannerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Emit newline-delimited JSON instead of the human formatter.
    pub json: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}

/// Raw configuration as written in `scanflow.toml`.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    database: FileDatabaseConfig,
    scanner: FileScannerConfig,
    runtime: RuntimeConfig,
    content_scan: ContentScanConfig,
    log: LogConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileDatabaseConfig {
    url: Option<String>,
    max_connections: Option<u32>,
    min_connections: Option<u32>,
    acquire_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileScannerConfig {
    url: Option<String>,
    timeout_secs: Option<u64>,
}

/// Environment overrides, gathered after `.env` is applied.
#[derive(Debug, Default, Clone)]
struct EnvConfig {
    config_path: Option<PathBuf>,
    database_url: Option<String>,
    executor_id: Option<String>,
    scanner_url: Option<String>,
    batch_recv_timeout_secs: Option<String>,
    post_all_transmitted_timeout_secs: Option<String>,
}

impl EnvConfig {
    fn gather() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        Self {
            config_path: get("SCANFLOW_CONFIG").map(PathBuf::from),
            database_url: get("DATABASE_URL"),
            executor_id: get("SCANFLOW_EXECUTOR_ID"),
            scanner_url: get("SCANFLOW_SCANNER_URL"),
            batch_recv_timeout_secs: get("SCANFLOW_BATCH_RECV_TIMEOUT_SECS"),
            post_all_transmitted_timeout_secs: get("SCANFLOW_POST_ALL_TRANSMITTED_TIMEOUT_SECS"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to read .env file: {0}")]
    Dotenv(#[from] dotenvy::Error),
    #[error("config file not found at {path}")]
    MissingConfig { path: PathBuf },
    #[error("env file not found at {path}")]
    MissingEnvFile { path: PathBuf },
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("database url is not configured (set DATABASE_URL or [database].url)")]
    MissingDatabaseUrl,
    #[error("scanner url is not configured (set SCANFLOW_SCANNER_URL or [scanner].url)")]
    MissingScannerUrl,
    #[error("invalid scanner url: {source}")]
    InvalidScannerUrl {
        #[source]
        source: url::ParseError,
    },
    #[error("invalid value {value:?} for {key}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("invalid content scan settings: {0}")]
    ContentScan(#[source] ScanflowError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

/// Resolves configuration from `.env`, an optional TOML file and the process
/// environment, in that order of increasing precedence.
#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    pub fn load(&self) -> Result<WorkerConfig, ConfigLoadError> {
        let env_file_loaded = self.load_env_file()?;
        self.load_with_env(EnvConfig::gather(), env_file_loaded)
    }

    /// An explicit env file must exist; the default `.env` is optional.
    fn load_env_file(&self) -> Result<bool, ConfigLoadError> {
        match &self.options.env_file {
            Some(path) if !path.exists() => Err(ConfigLoadError::MissingEnvFile {
                path: path.clone(),
            }),
            Some(path) => Ok(dotenvy::from_path(path).map(|_| true)?),
            None => Ok(dotenvy::dotenv().map(|_| true).or_else(|err| match err {
                dotenvy::Error::Io(_) => Ok(false),
                _ => Err(err),
            })?),
        }
    }

    fn load_with_env(
        &self,
        env: EnvConfig,
        env_file_loaded: bool,
    ) -> Result<WorkerConfig, ConfigLoadError> {
        let (file, config_path) = self.load_file_config(&env)?;
        let mut config = compose(file.unwrap_or_default(), env)?;
        config.metadata = ConfigMetadata {
            config_path,
            env_file_loaded,
        };
        Ok(config)
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let explicit = self
            .options
            .config_path
            .clone()
            .or_else(|| env.config_path.clone());

        let path = match explicit {
            Some(path) if !path.exists() => return Err(ConfigLoadError::MissingConfig { path }),
            Some(path) => path,
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|candidate| candidate.exists())
            {
                Some(path) => path,
                None => return Ok((None, None)),
            },
        };

        let file = read_file_config(&path)?;
        Ok((Some(file), Some(path)))
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig, ConfigLoadError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigLoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigLoadError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_secs(key: &'static str, value: String) -> Result<u64, ConfigLoadError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigLoadError::InvalidEnv { key, value })
}

fn compose(file: FileConfig, env: EnvConfig) -> Result<WorkerConfig, ConfigLoadError> {
    let FileConfig {
        database: file_database,
        scanner: file_scanner,
        mut runtime,
        mut content_scan,
        log,
    } = file;

    let database = DatabaseConfig {
        url: env
            .database_url
            .or(file_database.url)
            .filter(|url| !url.trim().is_empty())
            .ok_or(ConfigLoadError::MissingDatabaseUrl)?,
        max_connections: file_database.max_connections.unwrap_or(10),
        min_connections: file_database.min_connections.unwrap_or(1),
        acquire_timeout_secs: file_database.acquire_timeout_secs.unwrap_or(30),
    };

    let scanner_url = env
        .scanner_url
        .or(file_scanner.url)
        .ok_or(ConfigLoadError::MissingScannerUrl)?;
    let scanner = ScannerConfig {
        url: Url::parse(scanner_url.trim())
            .map_err(|source| ConfigLoadError::InvalidScannerUrl { source })?,
        timeout_secs: file_scanner.timeout_secs.unwrap_or(120),
    };

    if let Some(executor_id) = env.executor_id {
        runtime.executor_id = executor_id;
    }
    if let Some(value) = env.batch_recv_timeout_secs {
        content_scan.batch_recv_timeout_secs =
            parse_secs("SCANFLOW_BATCH_RECV_TIMEOUT_SECS", value)?;
    }
    if let Some(value) = env.post_all_transmitted_timeout_secs {
        content_scan.post_all_transmitted_timeout_secs =
            parse_secs("SCANFLOW_POST_ALL_TRANSMITTED_TIMEOUT_SECS", value)?;
    }

    content_scan.validate().map_err(ConfigLoadError::ContentScan)?;
    if database.max_connections == 0 || database.min_connections > database.max_connections {
        return Err(ConfigLoadError::Invalid(format!(
            "database pool bounds {}..{} are inconsistent",
            database.min_connections, database.max_connections
        )));
    }

    Ok(WorkerConfig {
        database,
        scanner,
        runtime,
        content_scan,
        log,
        metadata: ConfigMetadata::default(),
    })
}
