//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    collections::HashMap,
    fmt,
    net::SocketAddr,
    num::{NonZeroU32, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use chrono::NaiveDate;
use chrono_tz::Tz;
use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::domain::types::{DatasetKind, WON_STATUS_ID};

mod cli;

pub use cli::{CliArgs, Command, CommonOverrides, RefreshArgs, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "leadcache";
const ENV_PREFIX: &str = "LEADCACHE";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_PAGE_SIZE: u32 = 250;
const DEFAULT_THROTTLE_MS: u64 = 300;
const DEFAULT_RETRY_ATTEMPTS: u32 = 5;
const DEFAULT_RETRY_BASE_MS: u64 = 500;
const DEFAULT_RATE_LIMIT_BACKOFF_MS: u64 = 2_000;
const DEFAULT_MAX_BACKOFF_MS: u64 = 30_000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_MAX_CONNECTIONS: u32 = 60;
const DEFAULT_ID_CHUNK_SIZE: usize = 40;
const DEFAULT_SNAPSHOT_DIR: &str = "data";
const DEFAULT_CREATED_FROM: &str = "2025-06-01";
const DEFAULT_LEADS_MAX_PAGES: u32 = 400;
const DEFAULT_CLOSED_MAX_PAGES: u32 = 30;
const DEFAULT_TIMEZONE: &str = "America/Sao_Paulo";

/// Fully-resolved deployment settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub upstream: UpstreamSettings,
    pub cache: CacheSettings,
    pub datasets: DatasetsSettings,
    pub flatten: FlattenSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub addr: SocketAddr,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Clone)]
pub struct UpstreamSettings {
    pub base_url: Option<String>,
    pub token: Option<String>,
    pub page_size: NonZeroU32,
    pub throttle: Duration,
    pub retry_attempts: NonZeroU32,
    pub retry_base_delay: Duration,
    pub rate_limit_delay: Duration,
    pub max_backoff: Duration,
    pub request_timeout: Duration,
    pub max_connections: NonZeroU32,
    pub id_chunk_size: NonZeroUsize,
}

impl fmt::Debug for UpstreamSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamSettings")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("page_size", &self.page_size)
            .field("throttle", &self.throttle)
            .field("retry_attempts", &self.retry_attempts)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("rate_limit_delay", &self.rate_limit_delay)
            .field("max_backoff", &self.max_backoff)
            .field("request_timeout", &self.request_timeout)
            .field("max_connections", &self.max_connections)
            .field("id_chunk_size", &self.id_chunk_size)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub snapshot_dir: PathBuf,
    pub refresh_interval: Option<Duration>,
    pub refresh_on_startup: bool,
}

#[derive(Debug, Clone)]
pub struct DatasetSettings {
    pub enabled: bool,
    pub created_from: NaiveDate,
    pub max_pages: NonZeroU32,
    pub status_ids: Vec<i64>,
}

#[derive(Debug, Clone)]
pub struct DatasetsSettings {
    pub leads: DatasetSettings,
    pub closed: DatasetSettings,
}

impl DatasetsSettings {
    pub fn get(&self, kind: DatasetKind) -> &DatasetSettings {
        match kind {
            DatasetKind::Leads => &self.leads,
            DatasetKind::Closed => &self.closed,
        }
    }

    pub fn enabled(&self) -> impl Iterator<Item = DatasetKind> + '_ {
        DatasetKind::ALL
            .into_iter()
            .filter(|kind| self.get(*kind).enabled)
    }
}

#[derive(Debug, Clone)]
pub struct FlattenSettings {
    pub timezone: Tz,
    /// Status names that win over whatever the pipelines endpoint reports.
    pub status_overrides: HashMap<i64, String>,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Refresh(args)) => raw.apply_common_overrides(&args.overrides),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    upstream: RawUpstreamSettings,
    cache: RawCacheSettings,
    datasets: RawDatasetsSettings,
    flatten: RawFlattenSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        self.apply_common_overrides(&overrides.common);

        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.refresh_interval_seconds {
            self.cache.refresh_interval_seconds = Some(seconds);
        }
    }

    fn apply_common_overrides(&mut self, overrides: &CommonOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(url) = overrides.upstream_base_url.as_ref() {
            self.upstream.base_url = Some(url.clone());
        }
        if let Some(dir) = overrides.snapshot_dir.as_ref() {
            self.cache.snapshot_dir = Some(dir.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            upstream,
            cache,
            datasets,
            flatten,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            upstream: build_upstream_settings(upstream)?,
            cache: build_cache_settings(cache),
            datasets: DatasetsSettings {
                leads: build_dataset_settings(
                    datasets.leads,
                    DatasetDefaults {
                        max_pages: DEFAULT_LEADS_MAX_PAGES,
                        status_ids: &[],
                        keys: DatasetKeys::LEADS,
                    },
                )?,
                closed: build_dataset_settings(
                    datasets.closed,
                    DatasetDefaults {
                        max_pages: DEFAULT_CLOSED_MAX_PAGES,
                        status_ids: &[WON_STATUS_ID],
                        keys: DatasetKeys::CLOSED,
                    },
                )?,
            },
            flatten: build_flatten_settings(flatten)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());

    let port = server.port.unwrap_or(DEFAULT_PORT);
    if port == 0 {
        return Err(LoadError::invalid(
            "server.port",
            "port must be greater than zero",
        ));
    }

    let addr = parse_socket_addr(&host, port)
        .map_err(|reason| LoadError::invalid("server.addr", reason))?;

    Ok(ServerSettings { addr })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_upstream_settings(upstream: RawUpstreamSettings) -> Result<UpstreamSettings, LoadError> {
    let base_url = non_blank(upstream.base_url);
    if let Some(url) = base_url.as_deref() {
        url::Url::parse(url)
            .map_err(|err| LoadError::invalid("upstream.base_url", format!("{err}")))?;
    }

    let id_chunk_size = upstream.id_chunk_size.unwrap_or(DEFAULT_ID_CHUNK_SIZE);
    let id_chunk_size = NonZeroUsize::new(id_chunk_size)
        .ok_or_else(|| LoadError::invalid("upstream.id_chunk_size", "must be greater than zero"))?;

    let request_timeout_secs = upstream
        .request_timeout_seconds
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS);
    if request_timeout_secs == 0 {
        return Err(LoadError::invalid(
            "upstream.request_timeout_seconds",
            "must be greater than zero",
        ));
    }

    let retry_base_delay = millis(upstream.retry_base_ms, DEFAULT_RETRY_BASE_MS);
    let max_backoff = millis(upstream.max_backoff_ms, DEFAULT_MAX_BACKOFF_MS);
    if max_backoff < retry_base_delay {
        return Err(LoadError::invalid(
            "upstream.max_backoff_ms",
            "must not be smaller than upstream.retry_base_ms",
        ));
    }

    Ok(UpstreamSettings {
        base_url,
        token: non_blank(upstream.token),
        page_size: non_zero_u32(
            upstream.page_size.unwrap_or(DEFAULT_PAGE_SIZE).into(),
            "upstream.page_size",
        )?,
        throttle: millis(upstream.throttle_ms, DEFAULT_THROTTLE_MS),
        retry_attempts: non_zero_u32(
            upstream.retry_attempts.unwrap_or(DEFAULT_RETRY_ATTEMPTS).into(),
            "upstream.retry_attempts",
        )?,
        retry_base_delay,
        rate_limit_delay: millis(upstream.rate_limit_backoff_ms, DEFAULT_RATE_LIMIT_BACKOFF_MS),
        max_backoff,
        request_timeout: Duration::from_secs(request_timeout_secs),
        max_connections: non_zero_u32(
            upstream
                .max_connections
                .unwrap_or(DEFAULT_MAX_CONNECTIONS)
                .into(),
            "upstream.max_connections",
        )?,
        id_chunk_size,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> CacheSettings {
    CacheSettings {
        snapshot_dir: cache
            .snapshot_dir
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SNAPSHOT_DIR)),
        refresh_interval: cache
            .refresh_interval_seconds
            .filter(|seconds| *seconds > 0)
            .map(Duration::from_secs),
        refresh_on_startup: cache.refresh_on_startup.unwrap_or(false),
    }
}

struct DatasetKeys {
    created_from: &'static str,
    max_pages: &'static str,
}

impl DatasetKeys {
    const LEADS: Self = Self {
        created_from: "datasets.leads.created_from",
        max_pages: "datasets.leads.max_pages",
    };
    const CLOSED: Self = Self {
        created_from: "datasets.closed.created_from",
        max_pages: "datasets.closed.max_pages",
    };
}

struct DatasetDefaults {
    max_pages: u32,
    status_ids: &'static [i64],
    keys: DatasetKeys,
}

fn build_dataset_settings(
    dataset: RawDatasetSettings,
    defaults: DatasetDefaults,
) -> Result<DatasetSettings, LoadError> {
    let created_from = dataset
        .created_from
        .unwrap_or_else(|| DEFAULT_CREATED_FROM.to_string());
    let created_from = NaiveDate::parse_from_str(created_from.trim(), "%Y-%m-%d").map_err(|err| {
        LoadError::invalid(
            defaults.keys.created_from,
            format!("expected YYYY-MM-DD: {err}"),
        )
    })?;

    Ok(DatasetSettings {
        enabled: dataset.enabled.unwrap_or(true),
        created_from,
        max_pages: non_zero_u32(
            dataset.max_pages.unwrap_or(defaults.max_pages).into(),
            defaults.keys.max_pages,
        )?,
        status_ids: dataset
            .status_ids
            .unwrap_or_else(|| defaults.status_ids.to_vec()),
    })
}

fn build_flatten_settings(flatten: RawFlattenSettings) -> Result<FlattenSettings, LoadError> {
    let timezone = flatten
        .timezone
        .unwrap_or_else(|| DEFAULT_TIMEZONE.to_string());
    let timezone = Tz::from_str(timezone.trim())
        .map_err(|err| LoadError::invalid("flatten.timezone", format!("{err}")))?;

    let status_overrides = flatten
        .status_overrides
        .into_iter()
        .map(|(id, name)| {
            id.trim().parse::<i64>().map(|id| (id, name)).map_err(|_| {
                LoadError::invalid(
                    "flatten.status_overrides",
                    format!("status id `{id}` is not an integer"),
                )
            })
        })
        .collect::<Result<HashMap<_, _>, _>>()?;

    Ok(FlattenSettings {
        timezone,
        status_overrides,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawUpstreamSettings {
    base_url: Option<String>,
    token: Option<String>,
    page_size: Option<u32>,
    throttle_ms: Option<u64>,
    retry_attempts: Option<u32>,
    retry_base_ms: Option<u64>,
    rate_limit_backoff_ms: Option<u64>,
    max_backoff_ms: Option<u64>,
    request_timeout_seconds: Option<u64>,
    max_connections: Option<u32>,
    id_chunk_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    snapshot_dir: Option<PathBuf>,
    refresh_interval_seconds: Option<u64>,
    refresh_on_startup: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatasetsSettings {
    leads: RawDatasetSettings,
    closed: RawDatasetSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawDatasetSettings {
    enabled: Option<bool>,
    created_from: Option<String>,
    max_pages: Option<u32>,
    status_ids: Option<Vec<i64>>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawFlattenSettings {
    timezone: Option<String>,
    status_overrides: HashMap<String, String>,
}

fn parse_socket_addr(host: &str, port: u16) -> Result<SocketAddr, String> {
    let candidate = format!("{host}:{port}");
    candidate
        .parse()
        .map_err(|err| format!("invalid address `{candidate}`: {err}"))
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn millis(value: Option<u64>, default: u64) -> Duration {
    Duration::from_millis(value.unwrap_or(default))
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}
