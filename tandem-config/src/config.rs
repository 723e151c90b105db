use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::byte_size::ByteSize;

/// Defines the source of a config error.
#[derive(Debug, Default)]
enum ConfigErrorSource {
    /// An error occurring independently.
    #[default]
    None,
    /// An error originating from a configuration file.
    File(PathBuf),
    /// An error originating in a field override (an env var, or a CLI parameter).
    FieldOverride(String),
}

impl fmt::Display for ConfigErrorSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigErrorSource::None => Ok(()),
            ConfigErrorSource::File(file_name) => {
                write!(f, " (file {})", file_name.display())
            }
            ConfigErrorSource::FieldOverride(name) => write!(f, " (field {name})"),
        }
    }
}

/// The error kind of a [`ConfigError`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigErrorKind {
    /// Failed to open the file.
    #[error("could not open config file")]
    CouldNotOpenFile,
    /// Parsing YAML failed.
    #[error("could not parse yaml config file")]
    BadYaml,
    /// Parsing JSON failed.
    #[error("could not parse json config file")]
    BadJson,
    /// Invalid config value.
    #[error("invalid config value")]
    InvalidValue,
    /// A value required to run is not configured.
    #[error("missing config value")]
    MissingValue,
}

/// Indicates config related errors.
#[derive(Debug)]
pub struct ConfigError {
    source: ConfigErrorSource,
    kind: ConfigErrorKind,
    cause: Option<Box<dyn Error + Send + Sync + 'static>>,
}

impl ConfigError {
    #[inline]
    fn new(kind: ConfigErrorKind) -> Self {
        Self {
            source: ConfigErrorSource::None,
            kind,
            cause: None,
        }
    }

    #[inline]
    fn wrap<E>(cause: E, kind: ConfigErrorKind) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            source: ConfigErrorSource::None,
            kind,
            cause: Some(Box::new(cause)),
        }
    }

    #[inline]
    fn for_field<E>(cause: E, field: &'static str) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self::wrap(cause, ConfigErrorKind::InvalidValue).field(field)
    }

    #[inline]
    fn file(mut self, p: impl AsRef<Path>) -> Self {
        self.source = ConfigErrorSource::File(p.as_ref().to_path_buf());
        self
    }

    #[inline]
    fn field(mut self, name: &'static str) -> Self {
        self.source = ConfigErrorSource::FieldOverride(name.to_owned());
        self
    }

    /// Returns the error kind of the error.
    pub fn kind(&self) -> ConfigErrorKind {
        self.kind
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.kind, self.source)
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.cause.as_deref().map(|e| e as &(dyn Error + 'static))
    }
}

enum ConfigFormat {
    Yaml,
    Json,
}

impl ConfigFormat {
    fn extension(&self) -> &'static str {
        match self {
            ConfigFormat::Yaml => "yml",
            ConfigFormat::Json => "json",
        }
    }
}

trait ConfigObject: DeserializeOwned + Serialize + Default {
    /// The format in which to serialize this configuration.
    fn format() -> ConfigFormat;

    /// The basename of the config file.
    fn name() -> &'static str;

    /// The full filename of the config file, including the file extension.
    fn path(base: &Path) -> PathBuf {
        base.join(format!("{}.{}", Self::name(), Self::format().extension()))
    }

    /// Loads the config file from a file within the given directory location.
    ///
    /// Returns the default configuration if the file does not exist.
    fn load(base: &Path) -> Result<Self, ConfigError> {
        let path = Self::path(base);

        let f = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ConfigError::wrap(e, ConfigErrorKind::CouldNotOpenFile).file(&path));
            }
        };

        match Self::format() {
            ConfigFormat::Yaml => serde_yaml::from_reader(io::BufReader::new(f))
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadYaml).file(&path)),
            ConfigFormat::Json => serde_json::from_reader(io::BufReader::new(f))
                .map_err(|e| ConfigError::wrap(e, ConfigErrorKind::BadJson).file(&path)),
        }
    }
}

/// Overrides for config values from the command line or environment.
#[derive(Debug, Default)]
pub struct OverridableConfig {
    /// The host the server should bind to (network interface).
    pub host: Option<String>,
    /// The port to bind for the HTTP server.
    pub port: Option<String>,
    /// The collector base URL for configuration fetches and event delivery.
    pub upstream: Option<String>,
    /// The application id used to authenticate against the collector.
    pub application_id: Option<String>,
    /// The API version attached to every event.
    pub api_version: Option<String>,
    /// Name of the request header carrying the session token.
    pub session_token_header: Option<String>,
    /// The log level.
    pub log_level: Option<String>,
}

/// Server listening settings.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Server {
    host: IpAddr,
    port: u16,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 3000,
        }
    }
}

/// Collector endpoints and credentials.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Collector {
    upstream: String,
    application_id: Option<String>,
    application_id_header: String,
    config_path: String,
    batch_path: String,
    etag_header: String,
}

impl Default for Collector {
    fn default() -> Self {
        Self {
            upstream: "https://api.moesif.net".to_owned(),
            application_id: None,
            application_id_header: "X-Moesif-Application-Id".to_owned(),
            config_path: "/v1/config".to_owned(),
            batch_path: "/v1/events/batch".to_owned(),
            etag_header: "x-moesif-config-etag".to_owned(),
        }
    }
}

/// Static attributes added to every event.
#[derive(Serialize, Deserialize, Debug, Default)]
#[serde(default)]
struct Events {
    api_version: Option<String>,
    session_token_header: Option<String>,
}

/// Sampling configuration refresh settings, in seconds.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Sampling {
    refresh_interval: u64,
    fetch_timeout: u64,
}

impl Default for Sampling {
    fn default() -> Self {
        Self {
            refresh_interval: 300,
            fetch_timeout: 5,
        }
    }
}

/// Correlation cache settings, in seconds.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Cache {
    /// Maximum age of a pending half. `0` disables eviction.
    max_age: u64,
    eviction_interval: u64,
}

impl Default for Cache {
    fn default() -> Self {
        Self {
            max_age: 3600,
            eviction_interval: 60,
        }
    }
}

/// Outbound HTTP client settings, in seconds.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Http {
    timeout: u64,
    connection_timeout: u64,
}

impl Default for Http {
    fn default() -> Self {
        Self {
            timeout: 30,
            connection_timeout: 3,
        }
    }
}

/// Controls various limits.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Limits {
    /// The maximum payload size of an ingest request.
    max_payload_size: ByteSize,
    /// The maximum number of seconds to wait for pending work on graceful shutdown.
    shutdown_timeout: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_payload_size: ByteSize::megabytes(10),
            shutdown_timeout: 10,
        }
    }
}

/// Control the metrics.
#[derive(Serialize, Deserialize, Debug)]
#[serde(default)]
struct Metrics {
    /// host/port of statsd instance
    statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    prefix: String,
    /// Default tags that should be attached to all outgoing statsd metrics.
    default_tags: BTreeMap<String, String>,
    /// Global sample rate for all emitted metrics between `0.0` and `1.0`.
    sample_rate: f64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            statsd: None,
            prefix: "tandem".to_owned(),
            default_tags: BTreeMap::new(),
            sample_rate: 1.0,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Default)]
struct ConfigValues {
    #[serde(default)]
    server: Server,
    #[serde(default)]
    collector: Collector,
    #[serde(default)]
    events: Events,
    #[serde(default)]
    sampling: Sampling,
    #[serde(default)]
    cache: Cache,
    #[serde(default)]
    http: Http,
    #[serde(default)]
    limits: Limits,
    #[serde(default)]
    logging: tandem_log::LogConfig,
    #[serde(default)]
    metrics: Metrics,
}

impl ConfigObject for ConfigValues {
    fn format() -> ConfigFormat {
        ConfigFormat::Yaml
    }

    fn name() -> &'static str {
        "config"
    }
}

/// Config struct.
pub struct Config {
    values: ConfigValues,
    path: PathBuf,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("path", &self.path)
            .field("values", &self.values)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            values: ConfigValues::default(),
            path: PathBuf::new(),
        }
    }
}

impl Config {
    /// Loads a config from a given config folder.
    ///
    /// A missing `config.yml` yields the default configuration.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
        let path = std::env::current_dir()
            .map(|x| x.join(path.as_ref()))
            .unwrap_or_else(|_| path.as_ref().to_path_buf());

        Ok(Config {
            values: ConfigValues::load(&path)?,
            path,
        })
    }

    /// Creates a config from a JSON value.
    ///
    /// This is mostly useful for tests.
    pub fn from_json_value(value: serde_json::Value) -> Result<Config, ConfigError> {
        Ok(Config {
            values: serde_json::from_value(value)
                .map_err(|err| ConfigError::wrap(err, ConfigErrorKind::BadJson))?,
            path: PathBuf::new(),
        })
    }

    /// Override configuration with values coming from other sources (e.g. env variables or
    /// command line parameters).
    pub fn apply_override(
        &mut self,
        overrides: OverridableConfig,
    ) -> Result<&mut Self, ConfigError> {
        let server = &mut self.values.server;

        if let Some(host) = overrides.host {
            server.host = host
                .parse::<IpAddr>()
                .map_err(|err| ConfigError::for_field(err, "host"))?;
        }

        if let Some(port) = overrides.port {
            server.port = port
                .parse()
                .map_err(|err| ConfigError::for_field(err, "port"))?;
        }

        let collector = &mut self.values.collector;

        if let Some(upstream) = overrides.upstream {
            upstream
                .parse::<Url>()
                .map_err(|err| ConfigError::for_field(err, "upstream"))?;
            collector.upstream = upstream;
        }

        if let Some(application_id) = overrides.application_id {
            collector.application_id = Some(application_id).filter(|id| !id.is_empty());
        }

        let events = &mut self.values.events;

        if let Some(api_version) = overrides.api_version {
            events.api_version = Some(api_version);
        }

        if let Some(header) = overrides.session_token_header {
            events.session_token_header = Some(header);
        }

        if let Some(log_level) = overrides.log_level {
            self.values.logging.level = log_level
                .parse()
                .map_err(|err| ConfigError::for_field(err, "log_level"))?;
        }

        Ok(self)
    }

    /// Checks that all values required to run the server are present.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.application_id().is_none() {
            return Err(ConfigError::new(ConfigErrorKind::MissingValue).field("application_id"));
        }

        self.config_url()?;
        self.batch_url()?;
        Ok(())
    }

    /// Serializes the effective configuration to YAML.
    pub fn to_yaml_string(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(&self.values)
            .map_err(|err| ConfigError::wrap(err, ConfigErrorKind::BadYaml))
    }

    /// Returns the path of the config folder.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the socket address the HTTP server binds to.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.values.server.host, self.values.server.port)
    }

    /// Returns the collector base URL.
    pub fn upstream(&self) -> Result<Url, ConfigError> {
        self.values
            .collector
            .upstream
            .parse()
            .map_err(|err| ConfigError::for_field(err, "collector.upstream"))
    }

    /// Returns the URL of the sampling configuration endpoint.
    pub fn config_url(&self) -> Result<Url, ConfigError> {
        self.upstream()?
            .join(&self.values.collector.config_path)
            .map_err(|err| ConfigError::for_field(err, "collector.config_path"))
    }

    /// Returns the URL of the batch delivery endpoint.
    pub fn batch_url(&self) -> Result<Url, ConfigError> {
        self.upstream()?
            .join(&self.values.collector.batch_path)
            .map_err(|err| ConfigError::for_field(err, "collector.batch_path"))
    }

    /// Returns the application id used to authenticate against the collector.
    pub fn application_id(&self) -> Option<&str> {
        self.values.collector.application_id.as_deref()
    }

    /// Returns the name of the header carrying the application id.
    pub fn application_id_header(&self) -> &str {
        &self.values.collector.application_id_header
    }

    /// Returns the name of the response header carrying the sampling configuration version.
    pub fn etag_header(&self) -> &str {
        &self.values.collector.etag_header
    }

    /// Returns the API version attached to every event.
    pub fn api_version(&self) -> Option<&str> {
        self.values.events.api_version.as_deref()
    }

    /// Returns the name of the request header carrying the session token.
    pub fn session_token_header(&self) -> Option<&str> {
        self.values.events.session_token_header.as_deref()
    }

    /// Returns the interval after which the sampling configuration is considered stale.
    pub fn sampling_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.values.sampling.refresh_interval)
    }

    /// Returns the timeout of a single sampling configuration fetch.
    pub fn sampling_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.values.sampling.fetch_timeout)
    }

    /// Returns the maximum age of pending halves in the correlation cache.
    ///
    /// `None` if eviction is disabled.
    pub fn cache_max_age(&self) -> Option<Duration> {
        match self.values.cache.max_age {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// Returns the interval at which expired halves are evicted.
    pub fn cache_eviction_interval(&self) -> Duration {
        Duration::from_secs(self.values.cache.eviction_interval.max(1))
    }

    /// Returns the timeout for outbound HTTP requests.
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.values.http.timeout)
    }

    /// Returns the timeout for establishing outbound connections.
    pub fn http_connection_timeout(&self) -> Duration {
        Duration::from_secs(self.values.http.connection_timeout)
    }

    /// Returns the maximum size of an ingest request body in bytes.
    pub fn max_payload_size(&self) -> usize {
        self.values.limits.max_payload_size.as_bytes() as usize
    }

    /// Returns the timeout for graceful shutdown.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.values.limits.shutdown_timeout)
    }

    /// Returns the logging configuration.
    pub fn logging(&self) -> &tandem_log::LogConfig {
        &self.values.logging
    }

    /// Returns the statsd address, if metrics are enabled.
    pub fn statsd_addr(&self) -> Option<&str> {
        self.values.metrics.statsd.as_deref()
    }

    /// Returns the prefix for all metrics.
    pub fn metrics_prefix(&self) -> &str {
        &self.values.metrics.prefix
    }

    /// Returns the default tags attached to all metrics.
    pub fn metrics_default_tags(&self) -> &BTreeMap<String, String> {
        &self.values.metrics.default_tags
    }

    /// Returns the global sample rate for metrics.
    pub fn metrics_sample_rate(&self) -> f64 {
        self.values.metrics.sample_rate
    }
}
