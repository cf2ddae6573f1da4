//! Startup configuration: flags, an optional TOML file, and the resolved
//! management-cluster connection.
//!
//! Flags override the file. Everything is read once at startup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::Args;
use fleetgrid_provision::PollConfig;
use fleetgrid_store::{ObjectStore, StoreError};
use serde::Deserialize;
use thiserror::Error;

const DEFAULT_DATA_DIR: &str = "/var/lib/fleetgrid";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;
const DEFAULT_POLL_TIMEOUT_SECS: u64 = 60;
const DEFAULT_READINESS_INTERVAL_SECS: u64 = 30;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("--cluster-api-{0} requires --cluster-api-url")]
    MissingUrl(&'static str),

    #[error(
        "management cluster {0} is not supported by this build; drop the connection flags to use the embedded store"
    )]
    UnsupportedBackend(String),

    #[error("creating data directory {path}: {source}")]
    DataDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Command-line options shared by every subcommand.
#[derive(Debug, Clone, Default, Args)]
pub struct Options {
    /// TOML file with the same settings; flags take precedence.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory of the embedded object store.
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Path to the management cluster kubeconfig.
    #[arg(long, global = true)]
    pub cluster_api_kubeconfig: Option<PathBuf>,

    /// URL of the management cluster.
    #[arg(long, global = true)]
    pub cluster_api_url: Option<String>,

    /// Bearer token for the management cluster.
    #[arg(long, global = true)]
    pub cluster_api_token: Option<String>,

    /// CA bundle of the management cluster.
    #[arg(long, global = true)]
    pub cluster_api_certificate_authority_data: Option<String>,

    /// Skip TLS certificate verification. Makes connections insecure.
    #[arg(long, global = true)]
    pub cluster_api_skip_tls_verify: bool,

    /// Seconds between checks for a new unit during create.
    #[arg(long, global = true)]
    pub poll_interval_secs: Option<u64>,

    /// Seconds to wait for a new unit before rolling back.
    #[arg(long, global = true)]
    pub poll_timeout_secs: Option<u64>,

    /// Seconds between capacity class readiness passes.
    #[arg(long, global = true)]
    pub readiness_interval_secs: Option<u64>,
}

/// Contents of a `--config` file. Keys match the flag names with
/// underscores.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub data_dir: Option<PathBuf>,
    pub cluster_api_kubeconfig: Option<PathBuf>,
    pub cluster_api_url: Option<String>,
    pub cluster_api_token: Option<String>,
    pub cluster_api_certificate_authority_data: Option<String>,
    pub cluster_api_skip_tls_verify: Option<bool>,
    pub poll_interval_secs: Option<u64>,
    pub poll_timeout_secs: Option<u64>,
    pub readiness_interval_secs: Option<u64>,
}

impl FileConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Effective settings after merging flags over the file and defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub kubeconfig: Option<PathBuf>,
    pub url: Option<String>,
    pub token: Option<String>,
    pub ca_data: Option<String>,
    pub skip_tls_verify: bool,
    pub poll: PollConfig,
    pub readiness_interval: Duration,
}

impl Settings {
    pub fn load(options: &Options) -> Result<Self, ConfigError> {
        let file = match &options.config {
            Some(path) => FileConfig::from_file(path)?,
            None => FileConfig::default(),
        };
        Self::merge(options, file)
    }

    pub fn merge(options: &Options, file: FileConfig) -> Result<Self, ConfigError> {
        let non_empty = |s: Option<String>| s.filter(|s| !s.is_empty());
        let secs = |flag: Option<u64>, file: Option<u64>, default: u64, name: &str| {
            match flag.or(file).unwrap_or(default) {
                0 => Err(ConfigError::Invalid(format!("{name} must be greater than zero"))),
                n => Ok(Duration::from_secs(n)),
            }
        };

        Ok(Self {
            data_dir: options
                .data_dir
                .clone()
                .or(file.data_dir)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR)),
            kubeconfig: options
                .cluster_api_kubeconfig
                .clone()
                .or(file.cluster_api_kubeconfig)
                .filter(|p| !p.as_os_str().is_empty()),
            url: non_empty(options.cluster_api_url.clone().or(file.cluster_api_url)),
            token: non_empty(options.cluster_api_token.clone().or(file.cluster_api_token)),
            ca_data: non_empty(
                options
                    .cluster_api_certificate_authority_data
                    .clone()
                    .or(file.cluster_api_certificate_authority_data),
            ),
            skip_tls_verify: options.cluster_api_skip_tls_verify
                || file.cluster_api_skip_tls_verify.unwrap_or(false),
            poll: PollConfig {
                interval: secs(
                    options.poll_interval_secs,
                    file.poll_interval_secs,
                    DEFAULT_POLL_INTERVAL_SECS,
                    "poll interval",
                )?,
                timeout: secs(
                    options.poll_timeout_secs,
                    file.poll_timeout_secs,
                    DEFAULT_POLL_TIMEOUT_SECS,
                    "poll timeout",
                )?,
            },
            readiness_interval: secs(
                options.readiness_interval_secs,
                file.readiness_interval_secs,
                DEFAULT_READINESS_INTERVAL_SECS,
                "readiness interval",
            )?,
        })
    }
}

/// Where the groups, units and claims live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterConnection {
    Kubeconfig(PathBuf),
    Endpoint {
        url: String,
        token: Option<String>,
        ca_data: Option<String>,
        skip_tls_verify: bool,
    },
    Embedded { data_dir: PathBuf },
}

impl ClusterConnection {
    /// Kubeconfig first, then an explicit endpoint, else the embedded store.
    pub fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        if settings.url.is_none() {
            if settings.token.is_some() {
                return Err(ConfigError::MissingUrl("token"));
            }
            if settings.ca_data.is_some() {
                return Err(ConfigError::MissingUrl("certificate-authority-data"));
            }
        }

        if let Some(path) = &settings.kubeconfig {
            return Ok(Self::Kubeconfig(path.clone()));
        }
        if let Some(url) = &settings.url {
            return Ok(Self::Endpoint {
                url: url.clone(),
                token: settings.token.clone(),
                ca_data: settings.ca_data.clone(),
                skip_tls_verify: settings.skip_tls_verify,
            });
        }
        Ok(Self::Embedded {
            data_dir: settings.data_dir.clone(),
        })
    }

    /// Printable description. Never includes credentials.
    pub fn describe(&self) -> String {
        match self {
            Self::Kubeconfig(path) => format!("kubeconfig {}", path.display()),
            Self::Endpoint {
                url,
                skip_tls_verify,
                ..
            } => {
                if *skip_tls_verify {
                    format!("endpoint {url} (tls verification disabled)")
                } else {
                    format!("endpoint {url}")
                }
            }
            Self::Embedded { data_dir } => format!("embedded store in {}", data_dir.display()),
        }
    }

    pub fn open_store(&self) -> Result<ObjectStore, ConfigError> {
        match self {
            Self::Embedded { data_dir } => {
                std::fs::create_dir_all(data_dir).map_err(|source| ConfigError::DataDir {
                    path: data_dir.clone(),
                    source,
                })?;
                Ok(ObjectStore::open(&data_dir.join("fleetgrid.redb"))?)
            }
            remote => Err(ConfigError::UnsupportedBackend(remote.describe())),
        }
    }
}
