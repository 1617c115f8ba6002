//! # Ceilometer Exporter
//!
//! A Prometheus exporter for OpenStack Ceilometer. Polls the Ceilometer
//! metering API for recent samples on every scrape and re-exposes them as
//! point-in-time gauge/counter observations, enriched with display names
//! resolved through the Nova and Neutron APIs.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────────┐
//! │                        CEILOMETER EXPORTER                             │
//! ├────────────────────────────────────────────────────────────────────────┤
//! │  /metrics → SCRAPE CYCLE → per-meter QUERY FAN-OUT → DEDUP → LABELS    │
//! │                 │                                       │              │
//! │                 └── bookkeeping observations     LOOKUP CACHE          │
//! └────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Concurrent scraping**: one query task per enabled meter per cycle
//! - **Name enrichment**: lazily-populated id→name lookup cache (pools, instances)
//! - **Glob filtering**: enable/disable meters with shell-style patterns
//! - **Partial-failure reporting**: per-meter success/duration/size meta metrics
//!
//! ## Author
//!
//! AIOps Team - Built with 🔥 and Rust

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================
// All external crate imports, organized by functionality.
// ============================================================================

#![allow(dead_code)]
#![allow(unused_imports)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::borrow::Cow;
use std::collections::HashMap;
use std::env;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::net::TcpListener;
use tokio::signal;
use tokio::task::JoinSet;
use tokio::time::timeout;

// ----------------------------------------------------------------------------
// Concurrent Data Structures
// ----------------------------------------------------------------------------
use dashmap::DashMap;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value as JsonValue};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::SmallVec;

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use ahash::{AHashMap, AHashSet};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::Result as AnyhowResult;
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn, Level};
use tracing_subscriber::{
    fmt::{self as tracing_fmt, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

// ----------------------------------------------------------------------------
// Time & Timestamps
// ----------------------------------------------------------------------------
use chrono::{DateTime, Utc};

// ----------------------------------------------------------------------------
// Networking
// ----------------------------------------------------------------------------
use reqwest::Client as HttpClient;

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Pattern Matching
// ----------------------------------------------------------------------------
use glob::Pattern;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::proto::{self, LabelPair, Metric, MetricFamily, MetricType};
use prometheus::{Encoder, TextEncoder};

// ----------------------------------------------------------------------------
// HTTP Server - Axum
// ----------------------------------------------------------------------------
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::get,
    Router,
};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================
// Global constants that define the behavior and defaults of the exporter.
// ============================================================================

/// Exporter version - follows semantic versioning
pub const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Exporter name used in CLI output and logs
pub const EXPORTER_NAME: &str = "ceilometer-exporter";

/// Prefix applied to every exported metric name
pub const NAMESPACE: &str = "openstack_ceilometer";

/// Sentinel display name for resources that cannot be resolved.
/// Fetch failures are memoized under this value so that a permanently-missing
/// identifier does not trigger a remote call on every scrape.
pub const UNKNOWN_NAME: &str = "UNKNOWN";

/// Default address the metrics HTTP server binds to
pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:9181";

/// Default URL path of the metrics endpoint
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Default maximum number of samples requested per meter query
pub const DEFAULT_MAX_RESULTS: usize = 100;

/// Default maximum age of samples to retrieve (seconds)
pub const DEFAULT_MAX_METRIC_AGE_SECS: u64 = 300;

/// Default per-meter query deadline (seconds). A query that exceeds it is
/// recorded as a failed scrape instead of stalling the whole cycle.
pub const DEFAULT_SCRAPE_TIMEOUT_SECS: u64 = 30;

/// Page size used for paginated resource listings during cache population
pub const RESOURCE_LIST_PAGE_SIZE: usize = 500;

/// Timestamp format understood by the Ceilometer query API
pub const CEILOMETER_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

/// Environment prefix for configuration overrides
pub const ENV_PREFIX: &str = "CEILO_EXPORTER_";

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// The fundamental data types flowing through the exporter: raw Ceilometer
// samples, metric descriptors, observations, and per-meter scrape outcomes.
// ============================================================================

/// Ordered label values attached to one observation.
/// Most descriptors carry between one and three labels.
pub type Labels = SmallVec<[CompactString; 4]>;

// ----------------------------------------------------------------------------
// 3.1 Samples
// ----------------------------------------------------------------------------

/// Metadata attached to a sample by the source system.
///
/// Ceilometer flattens nested resource metadata into dotted keys
/// (e.g. `flavor.name`). Values arrive as arbitrary JSON scalars and are
/// normalized to strings on deserialization; a key that is absent reads as
/// an empty string rather than an error.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata(HashMap<String, CompactString>);

impl Metadata {
    /// Create an empty metadata map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build metadata from string pairs (used heavily in tests).
    pub fn from_pairs(pairs: &[(&str, &str)]) -> Self {
        Self(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), CompactString::from(*v)))
                .collect(),
        )
    }

    /// Insert a key/value pair.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<CompactString>) {
        self.0.insert(key.into(), value.into());
    }

    /// Look up a key. Absent keys yield the empty string.
    pub fn get(&self, key: &str) -> &str {
        self.0.get(key).map(|v| v.as_str()).unwrap_or("")
    }

    /// Number of metadata entries.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<'de> Deserialize<'de> for Metadata {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Ceilometer may send `null` instead of an object, and values may be
        // any JSON scalar. Nested arrays/objects carry no useful label data
        // and are skipped.
        let raw: Option<HashMap<String, JsonValue>> = Option::deserialize(deserializer)?;
        let mut map = HashMap::new();
        if let Some(raw) = raw {
            for (key, value) in raw {
                let rendered = match value {
                    JsonValue::String(s) => CompactString::from(s),
                    JsonValue::Number(n) => CompactString::from(n.to_string()),
                    JsonValue::Bool(b) => CompactString::from(if b { "true" } else { "false" }),
                    _ => continue,
                };
                map.insert(key, rendered);
            }
        }
        Ok(Self(map))
    }
}

/// One reported measurement of a meter for a resource at a point in time,
/// as returned by `GET /v2/meters/{meter}`.
#[derive(Debug, Clone, Deserialize)]
pub struct Sample {
    /// Identifier of the resource the sample describes
    #[serde(default)]
    pub resource_id: CompactString,
    /// Meter name the sample belongs to
    #[serde(default)]
    pub counter_name: CompactString,
    /// Sample type reported by the source (`gauge`, `cumulative`, ...)
    #[serde(default)]
    pub counter_type: CompactString,
    /// Unit of the sample volume
    #[serde(default)]
    pub counter_unit: CompactString,
    /// The measured value
    #[serde(default)]
    pub counter_volume: f64,
    /// Source timestamp (kept verbatim; ordering is the source's concern)
    #[serde(default)]
    pub timestamp: String,
    /// Flattened resource metadata
    #[serde(default)]
    pub resource_metadata: Metadata,
}

// ----------------------------------------------------------------------------
// 3.2 Value Kinds
// ----------------------------------------------------------------------------

/// Prometheus value kind an observation is exported as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Point-in-time value
    Gauge,
    /// Monotonically increasing value
    Counter,
    /// Unrecognized sample type, exported without type information
    Untyped,
}

impl ValueKind {
    /// Map a sample's reported type onto a Prometheus value kind.
    /// Unknown types are exported as untyped and logged at debug level.
    pub fn for_sample(sample: &Sample) -> Self {
        match sample.counter_type.as_str() {
            "gauge" => ValueKind::Gauge,
            "cumulative" => ValueKind::Counter,
            other => {
                debug!(
                    target: "ceilo::scrape",
                    meter = %sample.counter_name,
                    sample_type = other,
                    "unknown sample type, exporting as untyped"
                );
                ValueKind::Untyped
            }
        }
    }

    /// The exposition-format family type for this kind.
    pub fn family_type(&self) -> MetricType {
        match self {
            ValueKind::Gauge => MetricType::GAUGE,
            ValueKind::Counter => MetricType::COUNTER,
            ValueKind::Untyped => MetricType::UNTYPED,
        }
    }
}

impl Display for ValueKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Gauge => write!(f, "gauge"),
            ValueKind::Counter => write!(f, "counter"),
            ValueKind::Untyped => write!(f, "untyped"),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.3 Descriptors & Observations
// ----------------------------------------------------------------------------

/// The published identity of a metric: fully-qualified name, help text and
/// ordered label names. Built once at catalog-construction time and shared
/// read-only across concurrent scrape tasks.
#[derive(Debug, PartialEq, Eq)]
pub struct MetricDescriptor {
    /// Fully-qualified metric name (`openstack_ceilometer_*`)
    pub name: String,
    /// Help text shown in the exposition output
    pub help: String,
    /// Ordered label names; extraction must produce exactly this many values
    pub label_names: &'static [&'static str],
}

impl MetricDescriptor {
    /// Create a descriptor with the exporter namespace prefix applied.
    pub fn new(suffix: &str, help: &str, label_names: &'static [&'static str]) -> Arc<Self> {
        Arc::new(Self {
            name: fq_name(suffix),
            help: help.to_string(),
            label_names,
        })
    }
}

/// Prefix a metric name with the exporter namespace.
pub fn fq_name(suffix: &str) -> String {
    format!("{}_{}", NAMESPACE, suffix)
}

/// One concrete value plus label-value tuple conforming to a descriptor,
/// produced during a scrape cycle.
#[derive(Debug)]
pub struct Observation {
    /// The descriptor this observation conforms to
    pub descriptor: Arc<MetricDescriptor>,
    /// Exported value kind
    pub kind: ValueKind,
    /// The measured value
    pub value: f64,
    /// Label values, in descriptor label-name order
    pub labels: Labels,
}

// ----------------------------------------------------------------------------
// 3.4 Scrape Outcomes
// ----------------------------------------------------------------------------

/// Per-meter result of one polling cycle. Produced and consumed entirely
/// within the cycle; feeds the bookkeeping observations.
#[derive(Debug, Clone, PartialEq)]
pub struct ScrapeOutcome {
    /// Meter name this outcome belongs to
    pub meter: CompactString,
    /// Whether the query itself succeeded (an empty result still succeeds)
    pub success: bool,
    /// Elapsed wall time of the meter's scrape task
    pub duration: Duration,
    /// Number of samples retained after deduplication
    pub result_size: usize,
}

impl ScrapeOutcome {
    /// A failed scrape: no results, success flag down.
    pub fn failed(meter: impl Into<CompactString>, duration: Duration) -> Self {
        Self {
            meter: meter.into(),
            success: false,
            duration,
            result_size: 0,
        }
    }

    /// A successful scrape with the given post-dedup result size.
    pub fn succeeded(meter: impl Into<CompactString>, duration: Duration, result_size: usize) -> Self {
        Self {
            meter: meter.into(),
            success: true,
            duration,
            result_size,
        }
    }
}

/// Convert a success flag to the 0/1 gauge value convention.
pub fn bool_to_f64(b: bool) -> f64 {
    if b {
        1.0
    } else {
        0.0
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Error types for every subsystem of the exporter. The classification
// mirrors the runtime policy: startup errors (config, auth, bulk cache
// population) are fatal; query and single-lookup failures are recoverable
// and converted to outcome data or sentinel names at the task boundary.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Top-Level Error
// ----------------------------------------------------------------------------

/// The main error type for the exporter.
/// All subsystem errors can be converted to this type.
#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    #[error("Client error: {0}")]
    Client(#[from] ClientError),

    #[error("Metrics encoding error: {0}")]
    Encode(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExporterError {
    /// Check if this error is recoverable within a running process.
    /// Auth and config failures require operator intervention.
    pub fn is_recoverable(&self) -> bool {
        match self {
            ExporterError::Config(_) => false,
            ExporterError::Auth(_) => false,
            ExporterError::Client(_) => true,
            ExporterError::Encode(_) => true,
            ExporterError::Io(_) => true,
            ExporterError::Internal(_) => false,
        }
    }

    /// Get the error category for logging.
    pub fn category(&self) -> &'static str {
        match self {
            ExporterError::Config(_) => "config",
            ExporterError::Auth(_) => "auth",
            ExporterError::Client(_) => "client",
            ExporterError::Encode(_) => "encode",
            ExporterError::Io(_) => "io",
            ExporterError::Internal(_) => "internal",
        }
    }
}

/// Convenience alias used throughout the exporter.
pub type ExporterResult<T> = Result<T, ExporterError>;

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Invalid metric pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Authentication Errors
// ----------------------------------------------------------------------------

/// Errors raised while establishing an OpenStack session. All of these are
/// fatal at startup: without a token and a service catalog the exporter
/// cannot do anything useful.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Required environment variable not set: {var}")]
    MissingEnv { var: String },

    #[error("Authentication request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Identity service rejected the credentials (status {status})")]
    Rejected { status: u16 },

    #[error("Identity service response carried no subject token")]
    MissingToken,

    #[error("Malformed identity service response: {message}")]
    MalformedResponse { message: String },

    #[error("No public endpoint for service type '{service}' in the catalog")]
    EndpointMissing { service: String },
}

// ----------------------------------------------------------------------------
// 4.4 Client Errors
// ----------------------------------------------------------------------------

/// Errors from the metering and resource-listing API clients. These are
/// per-request failures; whether they are fatal depends on where they occur
/// (bulk cache population at startup: fatal; a meter query or a single
/// lookup fetch mid-cycle: converted to outcome data).
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },

    #[error("Failed to decode API response: {message}")]
    Decode { message: String },
}

impl ClientError {
    pub fn decode(message: impl Into<String>) -> Self {
        ClientError::Decode {
            message: message.into(),
        }
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// Configuration management with TOML file parsing, environment variable
// overrides (CEILO_EXPORTER_ prefix, __ section separator), validation and
// sensible defaults matching the exporter's historical flag defaults.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Root Configuration
// ----------------------------------------------------------------------------

/// Root configuration for the exporter
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// HTTP server settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Scrape behavior settings
    #[serde(default)]
    pub scrape: ScrapeConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            scrape: ScrapeConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ExporterConfig {
    /// Load configuration, starting from defaults, merging an optional TOML
    /// file and finally environment overrides. A missing file is not an
    /// error: the exporter is fully usable from defaults plus environment.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut figment = Figment::from(Serialized::defaults(Self::default()));
        if path.exists() {
            figment = figment.merge(Toml::file(path));
        }
        let config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file that must exist (used by `validate`).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        Self::load_or_default(path)
    }

    /// Parse from a TOML string (for testing).
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scrape.max_results == 0 {
            return Err(ConfigError::invalid_value(
                "scrape.max_results",
                "must be greater than zero",
            ));
        }
        if self.scrape.enabled_metrics.is_empty() {
            return Err(ConfigError::invalid_value(
                "scrape.enabled_metrics",
                "at least one enabled pattern is required (use \"*\" to enable everything)",
            ));
        }
        if self.scrape.max_metric_age.is_zero() {
            return Err(ConfigError::invalid_value(
                "scrape.max_metric_age",
                "must be a positive duration",
            ));
        }
        if self.scrape.scrape_timeout.is_zero() {
            return Err(ConfigError::invalid_value(
                "scrape.scrape_timeout",
                "must be a positive duration",
            ));
        }
        if !self.server.metrics_path.starts_with('/') {
            return Err(ConfigError::invalid_value(
                "server.metrics_path",
                "must start with '/'",
            ));
        }
        // "/" is taken by the landing page; registering it twice would
        // panic the router at startup.
        if self.server.metrics_path == "/" {
            return Err(ConfigError::invalid_value(
                "server.metrics_path",
                "must not be \"/\" (reserved for the landing page)",
            ));
        }
        Ok(())
    }

    /// Render a default configuration file.
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 5.2 Server Configuration
// ----------------------------------------------------------------------------

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the metrics server
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// URL path of the metrics endpoint
    #[serde(default = "default_metrics_path")]
    pub metrics_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            metrics_path: default_metrics_path(),
        }
    }
}

fn default_bind_addr() -> String {
    DEFAULT_BIND_ADDR.into()
}

fn default_metrics_path() -> String {
    DEFAULT_METRICS_PATH.into()
}

// ----------------------------------------------------------------------------
// 5.3 Scrape Configuration
// ----------------------------------------------------------------------------

/// Scrape behavior settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeConfig {
    /// Maximum number of results to fetch for any meter
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Maximum age of samples to retrieve
    #[serde(with = "humantime_serde", default = "default_max_metric_age")]
    pub max_metric_age: Duration,

    /// Per-meter query deadline; a query exceeding it is recorded as a
    /// failed scrape for that meter
    #[serde(with = "humantime_serde", default = "default_scrape_timeout")]
    pub scrape_timeout: Duration,

    /// Ordered glob patterns of meters to enable
    #[serde(default = "default_enabled_metrics")]
    pub enabled_metrics: Vec<String>,

    /// Ordered glob patterns of meters to disable
    #[serde(default)]
    pub disabled_metrics: Vec<String>,
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            max_metric_age: default_max_metric_age(),
            scrape_timeout: default_scrape_timeout(),
            enabled_metrics: default_enabled_metrics(),
            disabled_metrics: Vec::new(),
        }
    }
}

impl ScrapeConfig {
    /// The options handed to the scrape orchestrator.
    pub fn options(&self) -> ScrapeOptions {
        ScrapeOptions {
            max_results: self.max_results,
            max_metric_age: self.max_metric_age,
            scrape_timeout: self.scrape_timeout,
        }
    }
}

fn default_max_results() -> usize {
    DEFAULT_MAX_RESULTS
}

fn default_max_metric_age() -> Duration {
    Duration::from_secs(DEFAULT_MAX_METRIC_AGE_SECS)
}

fn default_scrape_timeout() -> Duration {
    Duration::from_secs(DEFAULT_SCRAPE_TIMEOUT_SECS)
}

fn default_enabled_metrics() -> Vec<String> {
    vec!["*".to_string()]
}

// ----------------------------------------------------------------------------
// 5.4 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors (pretty/compact formats)
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source file and line number in log output
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

fn default_true() -> bool {
    true
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================
// Structured logging via tracing with env-filter support and json, compact
// and pretty output formats.
// ============================================================================

/// Initialize the logging system based on configuration.
pub fn init_logging(config: &LoggingConfig) -> ExporterResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ExporterError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ExporterError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ExporterError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "ceilo::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 7: METRIC FILTER
// ============================================================================
// Decides which catalog meters are scraped, from two ordered glob pattern
// lists. The first enabled pattern that matches a name gates evaluation of
// the disabled list; a name no enabled pattern matches is excluded.
// ============================================================================

/// Enable/disable filter over meter names.
///
/// Patterns are shell-glob style (`*`, `?`); they are compiled once at
/// startup so an invalid pattern fails fast as a configuration error.
#[derive(Debug)]
pub struct MetricFilter {
    enabled: Vec<Pattern>,
    disabled: Vec<Pattern>,
}

impl MetricFilter {
    /// Compile a filter from pattern lists.
    pub fn new(enabled: &[String], disabled: &[String]) -> Result<Self, ConfigError> {
        Ok(Self {
            enabled: Self::compile(enabled)?,
            disabled: Self::compile(disabled)?,
        })
    }

    /// A filter that includes everything.
    pub fn allow_all() -> Self {
        Self {
            enabled: vec![Pattern::new("*").expect("literal pattern")],
            disabled: Vec::new(),
        }
    }

    fn compile(patterns: &[String]) -> Result<Vec<Pattern>, ConfigError> {
        patterns
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| ConfigError::InvalidPattern {
                    pattern: p.clone(),
                    message: e.to_string(),
                })
            })
            .collect()
    }

    /// Whether a meter name passes the filter.
    ///
    /// Only the first matching enabled pattern gates the disabled check;
    /// the loop returns as soon as that pattern is found.
    pub fn matches(&self, name: &str) -> bool {
        for enabled in &self.enabled {
            if enabled.matches(name) {
                return !self.disabled.iter().any(|d| d.matches(name));
            }
        }
        false
    }
}

// ============================================================================
// SECTION 8: OPENSTACK API CLIENTS
// ============================================================================
// Thin HTTP clients for the OpenStack services the exporter talks to:
// Keystone (identity), Ceilometer (metering), Nova (compute) and Neutron
// LBaaS (network). The metering and resource surfaces sit behind traits so
// the orchestrator and the lookup cache are testable without a cloud.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Query Types
// ----------------------------------------------------------------------------

/// One Ceilometer sample query: `field op value`, bounded by `limit`.
#[derive(Debug, Clone)]
pub struct SampleQuery {
    /// Queried sample field
    pub field: &'static str,
    /// Comparison operator
    pub op: &'static str,
    /// Comparison value (formatted timestamp)
    pub value: String,
    /// Maximum number of samples to return
    pub limit: usize,
}

impl SampleQuery {
    /// Build the per-cycle query: samples with a timestamp newer than
    /// `now - max_age`, capped at `limit` results.
    pub fn newer_than(max_age: Duration, limit: usize) -> Self {
        let age = chrono::Duration::from_std(max_age)
            .unwrap_or_else(|_| chrono::Duration::seconds(DEFAULT_MAX_METRIC_AGE_SECS as i64));
        let cutoff = Utc::now() - age;
        Self {
            field: "timestamp",
            op: "gt",
            value: cutoff.format(CEILOMETER_TIMESTAMP_FORMAT).to_string(),
            limit,
        }
    }
}

/// An (id, name) pair from a resource listing.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NamedResource {
    /// Resource identifier
    #[serde(default)]
    pub id: CompactString,
    /// Human-readable display name
    #[serde(default)]
    pub name: CompactString,
}

impl NamedResource {
    pub fn new(id: impl Into<CompactString>, name: impl Into<CompactString>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 8.2 API Traits
// ----------------------------------------------------------------------------

/// The metering query surface consumed by the scrape orchestrator.
#[async_trait]
pub trait MeteringApi: Send + Sync {
    /// List samples for a meter matching the query.
    async fn query_samples(&self, meter: &str, query: &SampleQuery)
        -> Result<Vec<Sample>, ClientError>;
}

/// The resource listing/fetch surface consumed by the lookup cache.
#[async_trait]
pub trait ResourceApi: Send + Sync {
    /// List all load balancer pools (paginated internally).
    async fn list_pools(&self) -> Result<Vec<NamedResource>, ClientError>;

    /// List all compute instances (paginated internally).
    async fn list_instances(&self) -> Result<Vec<NamedResource>, ClientError>;

    /// Fetch a single pool's display name by id.
    async fn get_pool(&self, id: &str) -> Result<CompactString, ClientError>;

    /// Fetch a single instance's display name by id.
    async fn get_instance(&self, id: &str) -> Result<CompactString, ClientError>;
}

// ----------------------------------------------------------------------------
// 8.3 Keystone Authentication
// ----------------------------------------------------------------------------

/// OpenStack credentials sourced from the standard `OS_*` environment.
#[derive(Debug, Clone)]
pub struct AuthCredentials {
    /// Keystone v3 endpoint, e.g. `https://keystone:5000/v3`
    pub auth_url: String,
    pub username: String,
    pub password: String,
    pub project_name: String,
    pub user_domain: String,
    pub project_domain: String,
    /// Preferred region; when unset the first public endpoint wins
    pub region: Option<String>,
}

impl AuthCredentials {
    /// Read credentials from the environment. `OS_AUTH_URL`, `OS_USERNAME`,
    /// `OS_PASSWORD` and `OS_PROJECT_NAME` are required; domains default to
    /// `Default` and the region is optional.
    pub fn from_env() -> Result<Self, AuthError> {
        fn required(var: &str) -> Result<String, AuthError> {
            env::var(var).map_err(|_| AuthError::MissingEnv { var: var.into() })
        }

        Ok(Self {
            auth_url: required("OS_AUTH_URL")?,
            username: required("OS_USERNAME")?,
            password: required("OS_PASSWORD")?,
            project_name: required("OS_PROJECT_NAME")?,
            user_domain: env::var("OS_USER_DOMAIN_NAME").unwrap_or_else(|_| "Default".into()),
            project_domain: env::var("OS_PROJECT_DOMAIN_NAME").unwrap_or_else(|_| "Default".into()),
            region: env::var("OS_REGION_NAME").ok(),
        })
    }
}

/// An authenticated OpenStack session: the subject token plus the resolved
/// public endpoints of the services the exporter needs.
#[derive(Debug, Clone)]
pub struct OpenStackSession {
    /// `X-Auth-Token` value for subsequent requests
    pub token: String,
    /// Ceilometer API root
    pub metering_url: String,
    /// Nova API root
    pub compute_url: String,
    /// Neutron API root
    pub network_url: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: TokenBody,
}

#[derive(Debug, Deserialize)]
struct TokenBody {
    #[serde(default)]
    catalog: Vec<CatalogService>,
}

#[derive(Debug, Deserialize)]
struct CatalogService {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    endpoints: Vec<CatalogEndpoint>,
}

#[derive(Debug, Deserialize)]
struct CatalogEndpoint {
    #[serde(default)]
    interface: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    region: Option<String>,
}

fn endpoint_for(
    body: &TokenBody,
    service_type: &str,
    region: Option<&str>,
) -> Result<String, AuthError> {
    body.catalog
        .iter()
        .filter(|svc| svc.service_type == service_type)
        .flat_map(|svc| svc.endpoints.iter())
        .filter(|ep| ep.interface == "public")
        .find(|ep| match region {
            Some(wanted) => ep.region.as_deref() == Some(wanted),
            None => true,
        })
        .map(|ep| ep.url.trim_end_matches('/').to_string())
        .ok_or_else(|| AuthError::EndpointMissing {
            service: service_type.to_string(),
        })
}

/// Authenticate against Keystone v3 with the password method and resolve
/// the metering, compute and network endpoints from the service catalog.
pub async fn authenticate(
    http: &HttpClient,
    credentials: &AuthCredentials,
) -> Result<OpenStackSession, AuthError> {
    let url = format!("{}/auth/tokens", credentials.auth_url.trim_end_matches('/'));
    let body = json!({
        "auth": {
            "identity": {
                "methods": ["password"],
                "password": {
                    "user": {
                        "name": credentials.username,
                        "domain": { "name": credentials.user_domain },
                        "password": credentials.password,
                    }
                }
            },
            "scope": {
                "project": {
                    "name": credentials.project_name,
                    "domain": { "name": credentials.project_domain },
                }
            }
        }
    });

    debug!(target: "ceilo::auth", url = %url, user = %credentials.username, "requesting token");

    let response = http.post(&url).json(&body).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(AuthError::Rejected {
            status: status.as_u16(),
        });
    }

    let token = response
        .headers()
        .get("x-subject-token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .ok_or(AuthError::MissingToken)?;

    let payload: TokenResponse = response
        .json()
        .await
        .map_err(|e| AuthError::MalformedResponse {
            message: e.to_string(),
        })?;

    let region = credentials.region.as_deref();
    let session = OpenStackSession {
        token,
        metering_url: endpoint_for(&payload.token, "metering", region)?,
        compute_url: endpoint_for(&payload.token, "compute", region)?,
        network_url: endpoint_for(&payload.token, "network", region)?,
    };

    info!(
        target: "ceilo::auth",
        metering = %session.metering_url,
        compute = %session.compute_url,
        network = %session.network_url,
        "authenticated, service endpoints resolved"
    );

    Ok(session)
}

// ----------------------------------------------------------------------------
// 8.4 OpenStack Client Implementation
// ----------------------------------------------------------------------------

/// Concrete client for the metering and resource APIs, sharing one
/// authenticated session.
#[derive(Debug)]
pub struct OpenStackClient {
    http: HttpClient,
    session: OpenStackSession,
}

#[derive(Debug, Deserialize)]
struct PageLink {
    #[serde(default)]
    rel: String,
    #[serde(default)]
    href: String,
}

#[derive(Debug, Deserialize)]
struct ServerPage {
    #[serde(default)]
    servers: Vec<NamedResource>,
    #[serde(default, rename = "servers_links")]
    links: Vec<PageLink>,
}

#[derive(Debug, Deserialize)]
struct PoolPage {
    #[serde(default)]
    pools: Vec<NamedResource>,
    #[serde(default, rename = "pools_links")]
    links: Vec<PageLink>,
}

#[derive(Debug, Deserialize)]
struct ServerEnvelope {
    server: NamedResource,
}

#[derive(Debug, Deserialize)]
struct PoolEnvelope {
    pool: NamedResource,
}

impl OpenStackClient {
    /// Create a client over an authenticated session.
    pub fn new(http: HttpClient, session: OpenStackSession) -> Self {
        Self { http, session }
    }

    /// Issue an authenticated GET and decode the JSON body.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        params: &[(&str, String)],
    ) -> Result<T, ClientError> {
        let response = self
            .http
            .get(url)
            .header("X-Auth-Token", &self.session.token)
            .query(params)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::UnexpectedStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ClientError::decode(e.to_string()))
    }
}

#[async_trait]
impl MeteringApi for OpenStackClient {
    async fn query_samples(
        &self,
        meter: &str,
        query: &SampleQuery,
    ) -> Result<Vec<Sample>, ClientError> {
        let url = format!("{}/v2/meters/{}", self.session.metering_url, meter);
        let params = [
            ("q.field", query.field.to_string()),
            ("q.op", query.op.to_string()),
            ("q.value", query.value.clone()),
            ("limit", query.limit.to_string()),
        ];
        self.get_json(&url, &params).await
    }
}

#[async_trait]
impl ResourceApi for OpenStackClient {
    async fn list_pools(&self) -> Result<Vec<NamedResource>, ClientError> {
        let url = format!("{}/v2.0/lb/pools", self.session.network_url);
        let mut pools = Vec::new();
        let mut marker: Option<CompactString> = None;
        loop {
            let mut params = vec![("limit", RESOURCE_LIST_PAGE_SIZE.to_string())];
            if let Some(m) = &marker {
                params.push(("marker", m.to_string()));
            }
            let page: PoolPage = self.get_json(&url, &params).await?;
            let has_next = page.links.iter().any(|l| l.rel == "next");
            marker = page.pools.last().map(|p| p.id.clone());
            pools.extend(page.pools);
            if !has_next || marker.is_none() {
                break;
            }
        }
        Ok(pools)
    }

    async fn list_instances(&self) -> Result<Vec<NamedResource>, ClientError> {
        let url = format!("{}/servers", self.session.compute_url);
        let mut servers = Vec::new();
        let mut marker: Option<CompactString> = None;
        loop {
            let mut params = vec![("limit", RESOURCE_LIST_PAGE_SIZE.to_string())];
            if let Some(m) = &marker {
                params.push(("marker", m.to_string()));
            }
            let page: ServerPage = self.get_json(&url, &params).await?;
            let has_next = page.links.iter().any(|l| l.rel == "next");
            marker = page.servers.last().map(|s| s.id.clone());
            servers.extend(page.servers);
            if !has_next || marker.is_none() {
                break;
            }
        }
        Ok(servers)
    }

    async fn get_pool(&self, id: &str) -> Result<CompactString, ClientError> {
        let url = format!("{}/v2.0/lb/pools/{}", self.session.network_url, id);
        let envelope: PoolEnvelope = self.get_json(&url, &[]).await?;
        Ok(envelope.pool.name)
    }

    async fn get_instance(&self, id: &str) -> Result<CompactString, ClientError> {
        let url = format!("{}/servers/{}", self.session.compute_url, id);
        let envelope: ServerEnvelope = self.get_json(&url, &[]).await?;
        Ok(envelope.server.name)
    }
}

// ============================================================================
// SECTION 9: LOOKUP CACHE
// ============================================================================
// Identifier→display-name memoization for pools and instances. Bulk
// populated at startup from full paginated listings (a listing failure is
// fatal: the exporter cannot run without usable auth/network); cache misses
// fall back to a single-entity fetch whose result, including failure, is
// memoized. Staleness is an accepted tradeoff; entries never expire.
// ============================================================================

/// Which of the two cached mappings a lookup targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Pool,
    Instance,
}

impl Display for ResourceKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Pool => write!(f, "pool"),
            ResourceKind::Instance => write!(f, "instance"),
        }
    }
}

/// Counters describing cache behavior, exposed for logging.
#[derive(Debug, Default)]
pub struct LookupStats {
    hits: AtomicU64,
    misses: AtomicU64,
    failed_fetches: AtomicU64,
}

impl LookupStats {
    pub fn hits(&self) -> u64 {
        self.hits.load(AtomicOrdering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(AtomicOrdering::Relaxed)
    }

    pub fn failed_fetches(&self) -> u64 {
        self.failed_fetches.load(AtomicOrdering::Relaxed)
    }
}

/// Memoized id→display-name lookup over pools and instances.
///
/// Lookups run from concurrently-executing scrape tasks; the maps tolerate
/// concurrent reads and miss-fills. Two racing fetches for the same missing
/// id are acceptable: the fetch is idempotent and the last write wins.
pub struct LookupService {
    resources: Arc<dyn ResourceApi>,
    pool_names: DashMap<CompactString, CompactString>,
    instance_names: DashMap<CompactString, CompactString>,
    stats: LookupStats,
}

impl Debug for LookupService {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("LookupService")
            .field("pools", &self.pool_names.len())
            .field("instances", &self.instance_names.len())
            .finish()
    }
}

impl LookupService {
    /// Build the cache by listing every pool and instance. Either listing
    /// failing aborts construction; this runs at startup where a partial
    /// cache would mean every scrape pays the fallback-fetch cost.
    pub async fn bootstrap(resources: Arc<dyn ResourceApi>) -> Result<Self, ClientError> {
        debug!(target: "ceilo::lookup", "populating id lookup caches");

        let pools = resources.list_pools().await?;
        let instances = resources.list_instances().await?;

        let pool_names: DashMap<CompactString, CompactString> = pools
            .into_iter()
            .map(|p| (p.id, p.name))
            .collect();
        let instance_names: DashMap<CompactString, CompactString> = instances
            .into_iter()
            .map(|i| (i.id, i.name))
            .collect();

        debug!(
            target: "ceilo::lookup",
            pools = pool_names.len(),
            instances = instance_names.len(),
            "finished populating caches"
        );

        Ok(Self {
            resources,
            pool_names,
            instance_names,
            stats: LookupStats::default(),
        })
    }

    /// Resolve a pool id to its display name.
    pub async fn pool_name(&self, id: &str) -> CompactString {
        self.resolve(ResourceKind::Pool, id).await
    }

    /// Resolve an instance id to its display name.
    pub async fn instance_name(&self, id: &str) -> CompactString {
        self.resolve(ResourceKind::Instance, id).await
    }

    /// Cache behavior counters.
    pub fn stats(&self) -> &LookupStats {
        &self.stats
    }

    async fn resolve(&self, kind: ResourceKind, id: &str) -> CompactString {
        // An empty id cannot be fetched; report the sentinel without
        // touching the cache.
        if id.is_empty() {
            return CompactString::from(UNKNOWN_NAME);
        }

        let map = match kind {
            ResourceKind::Pool => &self.pool_names,
            ResourceKind::Instance => &self.instance_names,
        };

        if let Some(name) = map.get(id) {
            self.stats.hits.fetch_add(1, AtomicOrdering::Relaxed);
            return name.clone();
        }
        self.stats.misses.fetch_add(1, AtomicOrdering::Relaxed);

        let fetched = match kind {
            ResourceKind::Pool => self.resources.get_pool(id).await,
            ResourceKind::Instance => self.resources.get_instance(id).await,
        };

        let name = match fetched {
            Ok(name) => name,
            Err(error) => {
                self.stats.failed_fetches.fetch_add(1, AtomicOrdering::Relaxed);
                warn!(
                    target: "ceilo::lookup",
                    kind = %kind,
                    id,
                    %error,
                    "failure while looking up resource name"
                );
                CompactString::from(UNKNOWN_NAME)
            }
        };

        // Failures are memoized too: a permanently-missing id must not
        // trigger a remote call on every scrape.
        map.insert(CompactString::from(id), name.clone());
        name
    }
}

// ============================================================================
// SECTION 10: SAMPLE DEDUPLICATION
// ============================================================================

/// Collapse a batch to one sample per resource id, keeping the first-seen
/// occurrence in its original position. The incoming order reflects the
/// source system's own ordering, so "first seen" is its most representative
/// sample. Purely a function of one batch; no cross-batch state.
pub fn deduplicate(samples: Vec<Sample>) -> Vec<Sample> {
    let mut seen: AHashSet<CompactString> = AHashSet::with_capacity(samples.len());
    let mut unique = Vec::with_capacity(samples.len());
    for sample in samples {
        if seen.insert(sample.resource_id.clone()) {
            unique.push(sample);
        }
    }
    unique
}

// ============================================================================
// SECTION 11: METRIC CATALOG
// ============================================================================
// The fixed table mapping each Ceilometer meter to its Prometheus
// descriptor and label-extraction rules. Rules are small stateless strategy
// values; the lookup cache is passed explicitly at extraction time. A
// descriptor's rule count must equal its label-name count; the pairing is
// checked when the catalog is built and a mismatch panics, since a
// misaligned entry is a programming error, not a runtime condition.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Label Extraction Rules
// ----------------------------------------------------------------------------

/// Where a resource id used for a name lookup comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdSource {
    /// The sample's resource id
    ResourceId,
    /// A metadata key on the sample
    Metadata(&'static str),
}

impl IdSource {
    fn value<'a>(&self, sample: &'a Sample) -> &'a str {
        match self {
            IdSource::ResourceId => sample.resource_id.as_str(),
            IdSource::Metadata(key) => sample.resource_metadata.get(key),
        }
    }
}

/// One label-extraction strategy. Each rule produces exactly one label
/// value from a sample, possibly consulting the lookup cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelRule {
    /// The sample's resource id, verbatim
    ResourceId,
    /// A metadata value; absent keys yield the empty string
    Metadata(&'static str),
    /// Instance display name, resolved from an id held in a metadata key
    InstanceName { id_from: &'static str },
    /// Pool display name, resolved from the given id source
    PoolName { id_from: IdSource },
    /// `address:protocol_port` of a load balancer pool member
    AddressPort,
    /// The Swift container part of a `tenant/container` resource id
    SwiftContainer,
}

impl LabelRule {
    /// Produce the label value for one sample.
    pub async fn resolve(&self, sample: &Sample, lookup: &LookupService) -> CompactString {
        match self {
            LabelRule::ResourceId => sample.resource_id.clone(),
            LabelRule::Metadata(key) => CompactString::from(sample.resource_metadata.get(key)),
            LabelRule::InstanceName { id_from } => {
                lookup
                    .instance_name(sample.resource_metadata.get(id_from))
                    .await
            }
            LabelRule::PoolName { id_from } => lookup.pool_name(id_from.value(sample)).await,
            LabelRule::AddressPort => CompactString::from(format!(
                "{}:{}",
                sample.resource_metadata.get("address"),
                sample.resource_metadata.get("protocol_port"),
            )),
            LabelRule::SwiftContainer => CompactString::from(
                sample
                    .resource_id
                    .splitn(2, '/')
                    .nth(1)
                    .unwrap_or_default(),
            ),
        }
    }
}

// ----------------------------------------------------------------------------
// 11.2 Catalog Entries
// ----------------------------------------------------------------------------

/// One catalog entry: a descriptor plus the ordered extraction rules that
/// produce its label values.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    /// Descriptor the entry's observations conform to
    pub descriptor: Arc<MetricDescriptor>,
    /// Extraction rules, one per descriptor label name
    pub rules: &'static [LabelRule],
}

impl CatalogEntry {
    /// Pair a descriptor with its rules, enforcing the count invariant.
    pub fn new(descriptor: Arc<MetricDescriptor>, rules: &'static [LabelRule]) -> Self {
        assert_eq!(
            rules.len(),
            descriptor.label_names.len(),
            "label rule count must match descriptor label names for {}",
            descriptor.name,
        );
        Self { descriptor, rules }
    }

    /// Run every rule against a sample, yielding label values in
    /// descriptor order.
    pub async fn extract_labels(&self, sample: &Sample, lookup: &LookupService) -> Labels {
        let mut labels = Labels::with_capacity(self.rules.len());
        for rule in self.rules {
            labels.push(rule.resolve(sample, lookup).await);
        }
        labels
    }
}

/// The meter catalog: meter name → descriptor + extraction rules.
pub type Catalog = AHashMap<&'static str, CatalogEntry>;

// ----------------------------------------------------------------------------
// 11.3 Meter Definition Table
// ----------------------------------------------------------------------------

/// Declarative definition of one exported meter.
#[derive(Debug)]
struct MeterDef {
    /// Ceilometer meter name
    meter: &'static str,
    /// Exported metric name suffix (namespace applied at build time)
    name: &'static str,
    /// Help text
    help: &'static str,
    /// Ordered label names
    labels: &'static [&'static str],
    /// Ordered extraction rules, one per label
    rules: &'static [LabelRule],
}

const INSTANCE_LABELS: &[&str] = &["instance_id", "instance_name"];
const INSTANCE_DEVICE_LABELS: &[&str] = &["instance_id", "instance_name", "device"];

const INSTANCE_RULES: &[LabelRule] = &[LabelRule::ResourceId, LabelRule::Metadata("display_name")];
const INSTANCE_DEVICE_RULES: &[LabelRule] = &[
    LabelRule::ResourceId,
    LabelRule::Metadata("display_name"),
    LabelRule::Metadata("device"),
];
const NETWORK_IO_RULES: &[LabelRule] = &[
    LabelRule::Metadata("instance_id"),
    LabelRule::InstanceName {
        id_from: "instance_id",
    },
];
const POOL_FROM_RESOURCE: &[LabelRule] = &[LabelRule::PoolName {
    id_from: IdSource::ResourceId,
}];

/// Every meter the exporter knows how to translate.
const METER_TABLE: &[MeterDef] = &[
    // Hardware metrics
    MeterDef {
        meter: "cpu",
        name: "cpu_nanoseconds",
        help: "Consumed CPU time (nanoseconds)",
        labels: INSTANCE_LABELS,
        rules: INSTANCE_RULES,
    },
    MeterDef {
        meter: "cpu_util",
        name: "cpu_percent",
        help: "CPU utilization (percent)",
        labels: INSTANCE_LABELS,
        rules: INSTANCE_RULES,
    },
    MeterDef {
        meter: "disk.allocation",
        name: "disk_allocation",
        help: "Disk allocation",
        labels: INSTANCE_LABELS,
        rules: INSTANCE_RULES,
    },
    MeterDef {
        meter: "disk.capacity",
        name: "disk_capacity",
        help: "Disk capacity",
        labels: INSTANCE_DEVICE_LABELS,
        rules: INSTANCE_DEVICE_RULES,
    },
    MeterDef {
        meter: "disk.ephemeral.size",
        name: "disk_ephemeral_size",
        help: "Size of ephemeral disk",
        labels: INSTANCE_LABELS,
        rules: INSTANCE_RULES,
    },
    MeterDef {
        meter: "disk.read.bytes",
        name: "disk_read_bytes",
        help: "Disk bytes read",
        labels: INSTANCE_DEVICE_LABELS,
        rules: INSTANCE_DEVICE_RULES,
    },
    MeterDef {
        meter: "disk.read.requests",
        name: "disk_read_requests",
        help: "Disk read requests",
        labels: INSTANCE_DEVICE_LABELS,
        rules: INSTANCE_DEVICE_RULES,
    },
    MeterDef {
        meter: "disk.root.size",
        name: "disk_root_size",
        help: "Root disk size",
        labels: INSTANCE_LABELS,
        rules: INSTANCE_RULES,
    },
    MeterDef {
        meter: "disk.usage",
        name: "disk_usage",
        help: "Disk usage",
        labels: INSTANCE_LABELS,
        rules: INSTANCE_RULES,
    },
    MeterDef {
        meter: "disk.write.bytes",
        name: "disk_write_bytes",
        help: "Disk written bytes",
        labels: INSTANCE_DEVICE_LABELS,
        rules: INSTANCE_DEVICE_RULES,
    },
    MeterDef {
        meter: "disk.write.requests",
        name: "disk_write_requests",
        help: "Disk write requests",
        labels: INSTANCE_DEVICE_LABELS,
        rules: INSTANCE_DEVICE_RULES,
    },
    MeterDef {
        meter: "memory.usage",
        name: "memory_usage",
        help: "Memory utilization",
        labels: INSTANCE_LABELS,
        rules: INSTANCE_RULES,
    },
    MeterDef {
        meter: "memory",
        name: "memory",
        help: "Memory allocation",
        labels: INSTANCE_LABELS,
        rules: INSTANCE_RULES,
    },
    MeterDef {
        meter: "memory.resident",
        name: "memory_resident",
        help: "Resident memory utilization",
        labels: INSTANCE_LABELS,
        rules: INSTANCE_RULES,
    },
    MeterDef {
        meter: "network.incoming.bytes",
        name: "incoming_bytes",
        help: "Instance incoming network (bytes)",
        labels: INSTANCE_LABELS,
        rules: NETWORK_IO_RULES,
    },
    MeterDef {
        meter: "network.incoming.packets",
        name: "incoming_packets",
        help: "Instance incoming network (packets)",
        labels: INSTANCE_LABELS,
        rules: NETWORK_IO_RULES,
    },
    MeterDef {
        meter: "network.outgoing.bytes",
        name: "outgoing_bytes",
        help: "Instance outgoing network (bytes)",
        labels: INSTANCE_LABELS,
        rules: NETWORK_IO_RULES,
    },
    MeterDef {
        meter: "network.outgoing.packets",
        name: "outgoing_packets",
        help: "Instance outgoing network (packets)",
        labels: INSTANCE_LABELS,
        rules: NETWORK_IO_RULES,
    },
    // Network services
    MeterDef {
        meter: "network.services.firewall.policy",
        name: "firewall_policy",
        help: "Firewall policy",
        labels: &["name"],
        rules: &[LabelRule::Metadata("name")],
    },
    MeterDef {
        meter: "network.services.lb.vip",
        name: "loadbalancer_pool",
        help: "Load balancer pool",
        labels: &["name"],
        rules: &[LabelRule::Metadata("name")],
    },
    MeterDef {
        meter: "network.services.lb.pool",
        name: "loadbalancer_vip",
        help: "Load balancer virtual IP",
        labels: &["name"],
        rules: &[LabelRule::Metadata("name")],
    },
    MeterDef {
        meter: "network.services.lb.member",
        name: "loadbalancer_pool_member",
        help: "Load balancer pool member",
        labels: &["member", "status", "pool"],
        rules: &[
            LabelRule::AddressPort,
            LabelRule::Metadata("status"),
            LabelRule::PoolName {
                id_from: IdSource::Metadata("pool_id"),
            },
        ],
    },
    MeterDef {
        meter: "network.services.lb.incoming.bytes",
        name: "loadbalancer_pool_bytes_in",
        help: "Load balancer pool bytes-in",
        labels: &["pool"],
        rules: POOL_FROM_RESOURCE,
    },
    MeterDef {
        meter: "network.services.lb.outgoing.bytes",
        name: "loadbalancer_pool_bytes_out",
        help: "Load balancer pool bytes-out",
        labels: &["pool"],
        rules: POOL_FROM_RESOURCE,
    },
    MeterDef {
        meter: "network.services.lb.active.connections",
        name: "loadbalancer_pool_active_connections",
        help: "Load balancer pool active connections",
        labels: &["pool"],
        rules: POOL_FROM_RESOURCE,
    },
    MeterDef {
        meter: "network.services.lb.total.connections",
        name: "loadbalancer_pool_total_connections",
        help: "Load balancer pool total connections",
        labels: &["pool"],
        rules: POOL_FROM_RESOURCE,
    },
    // Swift
    MeterDef {
        meter: "storage.containers.objects",
        name: "swift_objects",
        help: "Swift container objects",
        labels: &["container_id"],
        rules: &[LabelRule::SwiftContainer],
    },
    MeterDef {
        meter: "storage.containers.objects.size",
        name: "swift_objects_size",
        help: "Swift container size (bytes)",
        labels: &["container_id"],
        rules: &[LabelRule::SwiftContainer],
    },
    // Usage
    MeterDef {
        meter: "instance",
        name: "instance",
        help: "Instances",
        labels: &["instance_id", "instance_name", "flavor"],
        rules: &[
            LabelRule::ResourceId,
            LabelRule::Metadata("display_name"),
            LabelRule::Metadata("flavor.name"),
        ],
    },
];

// ----------------------------------------------------------------------------
// 11.4 Catalog Construction
// ----------------------------------------------------------------------------

/// Build the full meter catalog from the definition table.
pub fn build_catalog() -> Catalog {
    METER_TABLE
        .iter()
        .map(|def| {
            let descriptor = MetricDescriptor::new(def.name, def.help, def.labels);
            (def.meter, CatalogEntry::new(descriptor, def.rules))
        })
        .collect()
}

/// Narrow a catalog to the meters a filter accepts.
pub fn filter_catalog(catalog: Catalog, filter: &MetricFilter) -> Catalog {
    catalog
        .into_iter()
        .filter(|(meter, _)| filter.matches(meter))
        .collect()
}

/// All meter names the exporter knows, sorted (for `list-metrics`).
pub fn catalog_meter_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = METER_TABLE.iter().map(|d| d.meter).collect();
    names.sort_unstable();
    names
}

// ============================================================================
// SECTION 12: SCRAPE ORCHESTRATION
// ============================================================================
// One cycle per exposition request: a query task is spawned per enabled
// meter, each bounded by the scrape timeout. Failures are isolated to the
// failing meter; every meter produces exactly one outcome per cycle, which
// becomes its success/duration/result-size bookkeeping observations.
// ============================================================================

/// Knobs governing one scrape cycle.
#[derive(Debug, Clone, Copy)]
pub struct ScrapeOptions {
    /// Per-meter result cap passed to the metering API
    pub max_results: usize,
    /// Only samples newer than this are queried
    pub max_metric_age: Duration,
    /// Upper bound on any single meter's query
    pub scrape_timeout: Duration,
}

/// Descriptors for the per-cycle bookkeeping metrics.
#[derive(Debug)]
struct MetaDescriptors {
    scrape_success: Arc<MetricDescriptor>,
    scrape_duration: Arc<MetricDescriptor>,
    scrape_result_size: Arc<MetricDescriptor>,
    total_duration: Arc<MetricDescriptor>,
}

impl MetaDescriptors {
    fn new() -> Self {
        Self {
            scrape_success: MetricDescriptor::new(
                "metric_scrape_success",
                "Indicates if the metric was successfully scraped",
                &["metric"],
            ),
            scrape_duration: MetricDescriptor::new(
                "metric_scrape_duration_ns",
                "The time taken to scrape the metric",
                &["metric"],
            ),
            scrape_result_size: MetricDescriptor::new(
                "metric_scrape_result_size",
                "Number of results returned by the metric query",
                &["metric"],
            ),
            total_duration: MetricDescriptor::new(
                "total_scrape_duration_ns",
                "Time taken for entire scrape",
                &[],
            ),
        }
    }
}

/// Everything one cycle produced: data observations, per-meter outcomes,
/// and the wall-clock duration of the whole cycle.
#[derive(Debug)]
pub struct CycleReport {
    /// Data plus bookkeeping observations, ready for exposition
    pub observations: Vec<Observation>,
    /// Exactly one outcome per enabled meter
    pub outcomes: Vec<ScrapeOutcome>,
    /// Wall-clock duration of the full fan-out
    pub total_duration: Duration,
}

impl CycleReport {
    /// Number of meters whose query failed this cycle.
    pub fn failed_meters(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.success).count()
    }
}

/// Orchestrates the per-meter query fan-out and translates samples into
/// labeled observations.
pub struct CeilometerScraper {
    metering: Arc<dyn MeteringApi>,
    lookup: Arc<LookupService>,
    catalog: Catalog,
    meta: MetaDescriptors,
    options: ScrapeOptions,
}

impl Debug for CeilometerScraper {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("CeilometerScraper")
            .field("meters", &self.catalog.len())
            .field("options", &self.options)
            .finish()
    }
}

impl CeilometerScraper {
    pub fn new(
        metering: Arc<dyn MeteringApi>,
        lookup: Arc<LookupService>,
        catalog: Catalog,
        options: ScrapeOptions,
    ) -> Self {
        Self {
            metering,
            lookup,
            catalog,
            meta: MetaDescriptors::new(),
            options,
        }
    }

    /// Number of meters the scraper will query each cycle.
    pub fn meter_count(&self) -> usize {
        self.catalog.len()
    }

    /// Run one full scrape cycle: fan out a query task per catalog meter,
    /// gather outcomes, and append the bookkeeping observations.
    pub async fn run_cycle(&self) -> CycleReport {
        let cycle_started = Instant::now();
        // One shared query: every meter sees the same age cutoff.
        let query = Arc::new(SampleQuery::newer_than(
            self.options.max_metric_age,
            self.options.max_results,
        ));

        let mut tasks: JoinSet<(ScrapeOutcome, Vec<Observation>)> = JoinSet::new();
        let mut pending: AHashSet<&'static str> =
            AHashSet::with_capacity(self.catalog.len());

        for (&meter, entry) in &self.catalog {
            pending.insert(meter);
            let metering = Arc::clone(&self.metering);
            let lookup = Arc::clone(&self.lookup);
            let entry = entry.clone();
            let query = Arc::clone(&query);
            let options = self.options;
            tasks.spawn(async move {
                scrape_meter(meter, entry, metering, lookup, query, options).await
            });
        }

        let mut observations = Vec::new();
        let mut outcomes = Vec::with_capacity(self.catalog.len());

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((outcome, mut obs)) => {
                    pending.remove(outcome.meter.as_str());
                    observations.append(&mut obs);
                    outcomes.push(outcome);
                }
                Err(error) => {
                    error!(target: "ceilo::scrape", %error, "scrape task aborted");
                }
            }
        }

        // A panicked task never reported; it still gets a failure outcome
        // so every meter has exactly one per cycle.
        for meter in pending {
            outcomes.push(ScrapeOutcome::failed(meter, cycle_started.elapsed()));
        }

        let total_duration = cycle_started.elapsed();
        for outcome in &outcomes {
            self.push_bookkeeping(&mut observations, outcome);
        }
        observations.push(Observation {
            descriptor: Arc::clone(&self.meta.total_duration),
            kind: ValueKind::Gauge,
            value: total_duration.as_nanos() as f64,
            labels: Labels::new(),
        });

        CycleReport {
            observations,
            outcomes,
            total_duration,
        }
    }

    fn push_bookkeeping(&self, observations: &mut Vec<Observation>, outcome: &ScrapeOutcome) {
        let meter_label = || {
            let mut labels = Labels::new();
            labels.push(outcome.meter.clone());
            labels
        };
        observations.push(Observation {
            descriptor: Arc::clone(&self.meta.scrape_success),
            kind: ValueKind::Gauge,
            value: bool_to_f64(outcome.success),
            labels: meter_label(),
        });
        observations.push(Observation {
            descriptor: Arc::clone(&self.meta.scrape_duration),
            kind: ValueKind::Gauge,
            value: outcome.duration.as_nanos() as f64,
            labels: meter_label(),
        });
        observations.push(Observation {
            descriptor: Arc::clone(&self.meta.scrape_result_size),
            kind: ValueKind::Gauge,
            value: outcome.result_size as f64,
            labels: meter_label(),
        });
    }
}

/// Query one meter and translate its samples. Infallible by construction:
/// every exit path yields an outcome, failed or not.
async fn scrape_meter(
    meter: &'static str,
    entry: CatalogEntry,
    metering: Arc<dyn MeteringApi>,
    lookup: Arc<LookupService>,
    query: Arc<SampleQuery>,
    options: ScrapeOptions,
) -> (ScrapeOutcome, Vec<Observation>) {
    let started = Instant::now();

    let samples = match timeout(
        options.scrape_timeout,
        metering.query_samples(meter, &query),
    )
    .await
    {
        Err(_elapsed) => {
            warn!(
                target: "ceilo::scrape",
                meter,
                timeout = ?options.scrape_timeout,
                "meter query timed out"
            );
            return (ScrapeOutcome::failed(meter, started.elapsed()), Vec::new());
        }
        Ok(Err(error)) => {
            warn!(target: "ceilo::scrape", meter, %error, "meter query failed");
            return (ScrapeOutcome::failed(meter, started.elapsed()), Vec::new());
        }
        Ok(Ok(samples)) => samples,
    };

    let initial_len = samples.len();
    if samples.is_empty() {
        // Worth flagging: an idle cloud or a mis-deployed pollster look
        // identical from here.
        warn!(target: "ceilo::scrape", meter, "meter query returned no samples");
        return (
            ScrapeOutcome::succeeded(meter, started.elapsed(), 0),
            Vec::new(),
        );
    }
    if initial_len == options.max_results {
        warn!(
            target: "ceilo::scrape",
            meter,
            max_results = options.max_results,
            "result hit the query limit; samples are likely truncated"
        );
    }

    let unique = deduplicate(samples);
    debug!(
        target: "ceilo::scrape",
        meter,
        initial = initial_len,
        retained = unique.len(),
        "deduplicated meter samples"
    );

    let mut observations = Vec::with_capacity(unique.len());
    for sample in &unique {
        let labels = entry.extract_labels(sample, &lookup).await;
        observations.push(Observation {
            descriptor: Arc::clone(&entry.descriptor),
            kind: ValueKind::for_sample(sample),
            value: sample.counter_volume,
            labels,
        });
    }

    (
        ScrapeOutcome::succeeded(meter, started.elapsed(), unique.len()),
        observations,
    )
}

// ============================================================================
// SECTION 13: EXPOSITION
// ============================================================================
// Translation of a cycle's observations into the version-0.0.4 text format.
// Gauge and counter observations go through `prometheus::proto` families and
// the `TextEncoder`; untyped observations are written by hand, since the
// text encoder refuses UNTYPED families. Families are emitted in first-seen
// observation order; all observations sharing a descriptor name land in the
// same family.
// ============================================================================

/// Group gauge and counter observations into metric families, preserving
/// first-seen order. Untyped observations are skipped here and rendered by
/// [`render_untyped`].
///
/// The first observation seen for a name fixes the family's type. A later
/// observation of the other kind is encoded against the family type and
/// logged: one exposition name cannot carry two types, and writing the
/// value into a proto field the family type never reads would silently
/// export 0.
pub fn render_families(observations: &[Observation]) -> Vec<MetricFamily> {
    let mut index: AHashMap<&str, usize> = AHashMap::new();
    let mut families: Vec<MetricFamily> = Vec::new();
    let mut kinds: Vec<ValueKind> = Vec::new();

    for obs in observations {
        if obs.kind == ValueKind::Untyped {
            continue;
        }
        let slot = match index.get(obs.descriptor.name.as_str()) {
            Some(&i) => i,
            None => {
                let mut family = MetricFamily::default();
                family.set_name(obs.descriptor.name.clone());
                family.set_help(obs.descriptor.help.clone());
                family.set_field_type(obs.kind.family_type());
                families.push(family);
                kinds.push(obs.kind);
                let i = families.len() - 1;
                index.insert(obs.descriptor.name.as_str(), i);
                i
            }
        };

        let family_kind = kinds[slot];
        if obs.kind != family_kind {
            warn!(
                target: "ceilo::export",
                metric = %obs.descriptor.name,
                family = %family_kind,
                observation = %obs.kind,
                "observation kind differs from its family, encoding with the family kind"
            );
        }

        let mut metric = Metric::default();
        metric.set_label(label_pairs(&obs.descriptor, &obs.labels));
        if family_kind == ValueKind::Counter {
            let mut counter = proto::Counter::default();
            counter.set_value(obs.value);
            metric.set_counter(counter);
        } else {
            let mut gauge = proto::Gauge::default();
            gauge.set_value(obs.value);
            metric.set_gauge(gauge);
        }
        families[slot].mut_metric().push(metric);
    }

    families
}

fn label_pairs(descriptor: &MetricDescriptor, labels: &Labels) -> Vec<LabelPair> {
    descriptor
        .label_names
        .iter()
        .zip(labels.iter())
        .map(|(name, value)| {
            let mut pair = LabelPair::default();
            pair.set_name((*name).to_string());
            pair.set_value(value.to_string());
            pair
        })
        .collect()
}

/// Write untyped observations directly in the 0.0.4 text format: one
/// `# HELP` / `# TYPE <name> untyped` header per metric name (first-seen
/// order), then one sample line per observation. Returns an empty string
/// when the batch carries no untyped observations.
pub fn render_untyped(observations: &[Observation]) -> String {
    let mut order: Vec<&str> = Vec::new();
    let mut grouped: AHashMap<&str, Vec<&Observation>> = AHashMap::new();
    for obs in observations {
        if obs.kind != ValueKind::Untyped {
            continue;
        }
        let name = obs.descriptor.name.as_str();
        grouped
            .entry(name)
            .or_insert_with(|| {
                order.push(name);
                Vec::new()
            })
            .push(obs);
    }

    let mut out = String::new();
    for name in order {
        let group = &grouped[name];
        let descriptor = &group[0].descriptor;
        out.push_str("# HELP ");
        out.push_str(name);
        out.push(' ');
        out.push_str(&escape_help(&descriptor.help));
        out.push('\n');
        out.push_str("# TYPE ");
        out.push_str(name);
        out.push_str(" untyped\n");
        for obs in group {
            out.push_str(name);
            if !obs.labels.is_empty() {
                out.push('{');
                for (i, (label, value)) in descriptor
                    .label_names
                    .iter()
                    .zip(obs.labels.iter())
                    .enumerate()
                {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(label);
                    out.push_str("=\"");
                    out.push_str(&escape_label_value(value));
                    out.push('"');
                }
                out.push('}');
            }
            out.push(' ');
            out.push_str(&obs.value.to_string());
            out.push('\n');
        }
    }
    out
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

/// Encode families in the Prometheus text exposition format.
pub fn encode_text(families: &[MetricFamily]) -> ExporterResult<String> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(families, &mut buffer)
        .map_err(ExporterError::Encode)?;
    String::from_utf8(buffer)
        .map_err(|e| ExporterError::Internal(format!("exposition output was not UTF-8: {e}")))
}

/// Render one cycle's observations plus any extra families (process
/// metrics) into the full exposition body.
pub fn encode_exposition(
    observations: &[Observation],
    extra: Vec<MetricFamily>,
) -> ExporterResult<String> {
    let mut families = render_families(observations);
    families.extend(extra);
    let mut body = encode_text(&families)?;
    body.push_str(&render_untyped(observations));
    Ok(body)
}

// ============================================================================
// SECTION 14: HTTP SERVER
// ============================================================================

/// Prometheus text format content type.
const EXPOSITION_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Shared server state handed to request handlers.
#[derive(Debug, Clone)]
struct AppState {
    scraper: Arc<CeilometerScraper>,
    metrics_path: String,
}

/// Serve the exporter until SIGINT/SIGTERM.
pub async fn serve(
    config: &ServerConfig,
    scraper: Arc<CeilometerScraper>,
) -> ExporterResult<()> {
    let state = AppState {
        scraper,
        metrics_path: config.metrics_path.clone(),
    };

    let app = Router::new()
        .route("/", get(landing_handler))
        .route(&config.metrics_path, get(metrics_handler))
        .with_state(state);

    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .map_err(ExporterError::Io)?;
    info!(
        target: "ceilo::server",
        addr = %config.bind_addr,
        path = %config.metrics_path,
        "exporter listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(ExporterError::Io)?;

    info!(target: "ceilo::server", "exporter shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = signal::ctrl_c().await {
            error!(target: "ceilo::server", %error, "failed to install SIGINT handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(error) => {
                error!(target: "ceilo::server", %error, "failed to install SIGTERM handler");
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(target: "ceilo::server", "received SIGINT, shutting down"),
        _ = terminate => info!(target: "ceilo::server", "received SIGTERM, shutting down"),
    }
}

/// Run a scrape cycle and expose its observations, plus the process
/// collector's own families, in text format.
async fn metrics_handler(State(state): State<AppState>) -> Response {
    let report = state.scraper.run_cycle().await;
    info!(
        target: "ceilo::server",
        meters = report.outcomes.len(),
        failed = report.failed_meters(),
        duration = ?report.total_duration,
        "scrape cycle finished"
    );

    match encode_exposition(&report.observations, prometheus::gather()) {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, EXPOSITION_CONTENT_TYPE)],
            body,
        )
            .into_response(),
        Err(error) => {
            error!(target: "ceilo::server", %error, "failed to encode exposition output");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to encode metrics\n".to_string(),
            )
                .into_response()
        }
    }
}

async fn landing_handler(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<html>\n<head><title>OpenStack Ceilometer Exporter</title></head>\n\
         <body>\n<h1>OpenStack Ceilometer Exporter</h1>\n\
         <p><a href=\"{0}\">Metrics</a></p>\n</body>\n</html>\n",
        state.metrics_path
    ))
}

// ============================================================================
// SECTION 15: COMMAND-LINE INTERFACE
// ============================================================================

/// OpenStack Ceilometer exporter for Prometheus
#[derive(Debug, Parser)]
#[command(name = EXPORTER_NAME, version = EXPORTER_VERSION, about)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(
        short,
        long,
        default_value = "ceilometer-exporter.toml",
        env = "CEILO_EXPORTER_CONFIG"
    )]
    pub config: PathBuf,

    /// Override the configured log level (trace|debug|info|warn|error)
    #[arg(long)]
    pub log_level: Option<String>,

    /// Override the configured listen address
    #[arg(long)]
    pub bind_addr: Option<String>,

    /// Comma-separated glob patterns of meters to enable
    #[arg(long, value_delimiter = ',')]
    pub enabled_metrics: Option<Vec<String>>,

    /// Comma-separated glob patterns of meters to disable
    #[arg(long, value_delimiter = ',')]
    pub disabled_metrics: Option<Vec<String>>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the exporter (default)
    Run,
    /// Print every meter the exporter can translate
    ListMetrics,
    /// Validate the configuration file and exit
    Validate {
        /// Print the effective configuration after validation
        #[arg(short, long)]
        verbose: bool,
    },
    /// Write a default configuration file
    GenerateConfig {
        /// Output path
        #[arg(short, long, default_value = "ceilometer-exporter.toml")]
        output: PathBuf,
    },
    /// Print version information
    Version,
}

impl Cli {
    /// Fold CLI overrides into a loaded configuration.
    pub fn apply_overrides(&self, config: &mut ExporterConfig) {
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(addr) = &self.bind_addr {
            config.server.bind_addr = addr.clone();
        }
        if let Some(enabled) = &self.enabled_metrics {
            config.scrape.enabled_metrics = enabled.clone();
        }
        if let Some(disabled) = &self.disabled_metrics {
            config.scrape.disabled_metrics = disabled.clone();
        }
    }
}

fn cmd_list_metrics() {
    println!("📊 Known Ceilometer meters:");
    println!();
    for meter in catalog_meter_names() {
        println!("   • {meter}");
    }
    println!();
    println!("   {} meters total", METER_TABLE.len());
}

fn cmd_validate(config_path: &Path, verbose: bool) -> AnyhowResult<()> {
    println!("🔍 Validating configuration: {}", config_path.display());
    let config = ExporterConfig::load(config_path)?;
    config.validate()?;
    MetricFilter::new(
        &config.scrape.enabled_metrics,
        &config.scrape.disabled_metrics,
    )?;
    println!("✅ Configuration is valid");
    if verbose {
        println!();
        println!("{}", toml::to_string_pretty(&config)?);
    }
    Ok(())
}

fn cmd_generate_config(output: &Path) -> AnyhowResult<()> {
    if output.exists() {
        anyhow::bail!("refusing to overwrite existing file: {}", output.display());
    }
    fs::write(output, ExporterConfig::generate_default_config())?;
    println!("✅ Wrote default configuration to {}", output.display());
    Ok(())
}

fn cmd_version() {
    println!("{} v{}", EXPORTER_NAME, EXPORTER_VERSION);
    println!("OpenStack Ceilometer exporter for Prometheus");
}

// ============================================================================
// SECTION 16: APPLICATION ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that need no logging or OpenStack session.
    match &cli.command {
        Some(Commands::ListMetrics) => {
            cmd_list_metrics();
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            return cmd_validate(&cli.config, *verbose);
        }
        Some(Commands::GenerateConfig { output }) => {
            return cmd_generate_config(output);
        }
        Some(Commands::Version) => {
            cmd_version();
            return Ok(());
        }
        Some(Commands::Run) | None => {}
    }

    let mut config = ExporterConfig::load_or_default(&cli.config)?;
    cli.apply_overrides(&mut config);
    init_logging(&config.logging)?;

    info!(
        target: "ceilo::init",
        version = EXPORTER_VERSION,
        config = %cli.config.display(),
        "starting {0}",
        EXPORTER_NAME
    );

    run(config).await
}

/// Wire the exporter together and serve until shutdown.
async fn run(config: ExporterConfig) -> AnyhowResult<()> {
    config.validate()?;
    let filter = MetricFilter::new(
        &config.scrape.enabled_metrics,
        &config.scrape.disabled_metrics,
    )?;

    let credentials = AuthCredentials::from_env()?;
    let http = HttpClient::builder()
        .timeout(config.scrape.scrape_timeout)
        .build()
        .map_err(|e| ExporterError::Internal(format!("failed to build HTTP client: {e}")))?;

    let session = authenticate(&http, &credentials).await?;
    info!(
        target: "ceilo::init",
        metering = %session.metering_url,
        "authenticated against Keystone"
    );

    let client = Arc::new(OpenStackClient::new(http, session));
    let lookup = Arc::new(LookupService::bootstrap(Arc::clone(&client) as Arc<dyn ResourceApi>).await?);

    let catalog = filter_catalog(build_catalog(), &filter);
    if catalog.is_empty() {
        warn!(
            target: "ceilo::init",
            "metric filter excludes every meter; only bookkeeping metrics will be exported"
        );
    }
    info!(
        target: "ceilo::init",
        enabled = catalog.len(),
        known = METER_TABLE.len(),
        "meter catalog assembled"
    );

    // Process metrics ride along on the same exposition endpoint.
    if let Err(error) =
        prometheus::register(Box::new(prometheus::process_collector::ProcessCollector::for_self()))
    {
        warn!(target: "ceilo::init", %error, "failed to register process collector");
    }

    let scraper = Arc::new(CeilometerScraper::new(
        client as Arc<dyn MeteringApi>,
        lookup,
        catalog,
        config.scrape.options(),
    ));

    serve(&config.server, scraper).await?;
    Ok(())
}

// ============================================================================
// SECTION 17: TESTS
// ============================================================================

#[cfg(test)]
mod core_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample(resource_id: &str, counter_type: &str, volume: f64, meta: &[(&str, &str)]) -> Sample {
        Sample {
            resource_id: CompactString::from(resource_id),
            counter_name: CompactString::new(""),
            counter_type: CompactString::from(counter_type),
            counter_unit: CompactString::new(""),
            counter_volume: volume,
            timestamp: "2026-08-30T12:00:00".to_string(),
            resource_metadata: Metadata::from_pairs(meta),
        }
    }

    #[test]
    fn test_value_kind_mapping() {
        assert_eq!(ValueKind::for_sample(&sample("r", "gauge", 1.0, &[])), ValueKind::Gauge);
        assert_eq!(
            ValueKind::for_sample(&sample("r", "cumulative", 1.0, &[])),
            ValueKind::Counter
        );
        assert_eq!(ValueKind::for_sample(&sample("r", "delta", 1.0, &[])), ValueKind::Untyped);
        assert_eq!(ValueKind::for_sample(&sample("r", "weird", 1.0, &[])), ValueKind::Untyped);
        assert_eq!(ValueKind::for_sample(&sample("r", "", 1.0, &[])), ValueKind::Untyped);
    }

    #[test]
    fn test_bool_to_f64() {
        assert_eq!(bool_to_f64(true), 1.0);
        assert_eq!(bool_to_f64(false), 0.0);
    }

    #[test]
    fn test_metadata_absent_key_reads_empty() {
        let meta = Metadata::from_pairs(&[("display_name", "vm-one")]);
        assert_eq!(meta.get("display_name"), "vm-one");
        assert_eq!(meta.get("missing"), "");
    }

    #[test]
    fn test_sample_json_null_metadata() {
        let raw = r#"{
            "resource_id": "abc",
            "counter_name": "cpu",
            "counter_type": "cumulative",
            "counter_unit": "ns",
            "counter_volume": 12500000.0,
            "timestamp": "2026-08-30T12:00:00",
            "resource_metadata": null
        }"#;
        let s: Sample = serde_json::from_str(raw).unwrap();
        assert_eq!(s.resource_id.as_str(), "abc");
        assert_eq!(s.counter_volume, 12500000.0);
        assert!(s.resource_metadata.is_empty());
    }

    #[test]
    fn test_sample_json_scalar_metadata_normalized() {
        let raw = r#"{
            "resource_id": "abc",
            "counter_volume": 2.0,
            "resource_metadata": {
                "display_name": "vm-one",
                "protocol_port": 8080,
                "admin_state_up": true,
                "fixed_ips": ["10.0.0.4"]
            }
        }"#;
        let s: Sample = serde_json::from_str(raw).unwrap();
        assert_eq!(s.resource_metadata.get("display_name"), "vm-one");
        assert_eq!(s.resource_metadata.get("protocol_port"), "8080");
        assert_eq!(s.resource_metadata.get("admin_state_up"), "true");
        // Arrays carry no usable label data and are dropped.
        assert_eq!(s.resource_metadata.get("fixed_ips"), "");
    }

    #[test]
    fn test_deduplicate_keeps_first_seen_in_order() {
        let batch = vec![
            sample("a", "gauge", 1.0, &[]),
            sample("b", "gauge", 2.0, &[]),
            sample("a", "gauge", 3.0, &[]),
            sample("c", "gauge", 4.0, &[]),
            sample("b", "gauge", 5.0, &[]),
        ];
        let unique = deduplicate(batch);
        let ids: Vec<&str> = unique.iter().map(|s| s.resource_id.as_str()).collect();
        let volumes: Vec<f64> = unique.iter().map(|s| s.counter_volume).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(volumes, vec![1.0, 2.0, 4.0]);
    }

    #[test]
    fn test_deduplicate_empty_and_unique_batches() {
        assert!(deduplicate(Vec::new()).is_empty());
        let batch = vec![sample("a", "gauge", 1.0, &[]), sample("b", "gauge", 2.0, &[])];
        assert_eq!(deduplicate(batch).len(), 2);
    }

    #[test]
    fn test_sample_query_window() {
        let query = SampleQuery::newer_than(Duration::from_secs(300), 100);
        assert_eq!(query.field, "timestamp");
        assert_eq!(query.op, "gt");
        assert_eq!(query.limit, 100);
        // "%Y-%m-%dT%H:%M:%S" renders as 19 characters.
        assert_eq!(query.value.len(), 19);
        assert!(query.value.contains('T'));
        assert!(!query.value.contains('.'));
    }
}



#[cfg(test)]
mod catalog_tests {
    use super::*;

    fn sample_with(resource_id: &str, meta: &[(&str, &str)]) -> Sample {
        Sample {
            resource_id: CompactString::from(resource_id),
            counter_name: CompactString::new(""),
            counter_type: CompactString::from("gauge"),
            counter_unit: CompactString::new(""),
            counter_volume: 1.0,
            timestamp: String::new(),
            resource_metadata: Metadata::from_pairs(meta),
        }
    }

    async fn empty_lookup() -> LookupService {
        struct Empty;
        #[async_trait]
        impl ResourceApi for Empty {
            async fn list_pools(&self) -> Result<Vec<NamedResource>, ClientError> {
                Ok(Vec::new())
            }
            async fn list_instances(&self) -> Result<Vec<NamedResource>, ClientError> {
                Ok(Vec::new())
            }
            async fn get_pool(&self, id: &str) -> Result<CompactString, ClientError> {
                Err(ClientError::UnexpectedStatus { status: 404, url: id.to_string() })
            }
            async fn get_instance(&self, id: &str) -> Result<CompactString, ClientError> {
                Err(ClientError::UnexpectedStatus { status: 404, url: id.to_string() })
            }
        }
        LookupService::bootstrap(Arc::new(Empty)).await.unwrap()
    }

    #[test]
    fn test_catalog_covers_every_definition() {
        let catalog = build_catalog();
        assert_eq!(catalog.len(), METER_TABLE.len());
        assert_eq!(catalog.len(), 29);
        for entry in catalog.values() {
            assert_eq!(entry.rules.len(), entry.descriptor.label_names.len());
            assert!(entry.descriptor.name.starts_with("openstack_ceilometer_"));
            assert!(!entry.descriptor.help.is_empty());
        }
    }

    #[test]
    fn test_catalog_names() {
        let catalog = build_catalog();
        assert_eq!(catalog["cpu"].descriptor.name, "openstack_ceilometer_cpu_nanoseconds");
        assert_eq!(catalog["cpu_util"].descriptor.name, "openstack_ceilometer_cpu_percent");
        assert_eq!(
            catalog["storage.containers.objects"].descriptor.name,
            "openstack_ceilometer_swift_objects"
        );
    }

    #[test]
    fn test_filter_catalog() {
        let enabled = vec!["cpu*".to_string()];
        let disabled = vec!["cpu_util".to_string()];
        let filter = MetricFilter::new(&enabled, &disabled).unwrap();
        let catalog = filter_catalog(build_catalog(), &filter);
        assert!(catalog.contains_key("cpu"));
        assert!(!catalog.contains_key("cpu_util"));
        assert!(!catalog.contains_key("memory"));
    }

    #[tokio::test]
    async fn test_instance_labels() {
        let lookup = empty_lookup().await;
        let catalog = build_catalog();
        let s = sample_with("vm-id-1", &[("display_name", "vm-one")]);
        let labels = catalog["cpu"].extract_labels(&s, &lookup).await;
        assert_eq!(labels.as_slice(), &["vm-id-1", "vm-one"]);
    }

    #[tokio::test]
    async fn test_network_io_labels_resolve_instance_name() {
        let lookup = LookupService::bootstrap(Arc::new({
            struct One;
            #[async_trait]
            impl ResourceApi for One {
                async fn list_pools(&self) -> Result<Vec<NamedResource>, ClientError> {
                    Ok(Vec::new())
                }
                async fn list_instances(&self) -> Result<Vec<NamedResource>, ClientError> {
                    Ok(vec![NamedResource::new("i-1", "vm-one")])
                }
                async fn get_pool(&self, id: &str) -> Result<CompactString, ClientError> {
                    Err(ClientError::UnexpectedStatus { status: 404, url: id.to_string() })
                }
                async fn get_instance(&self, id: &str) -> Result<CompactString, ClientError> {
                    Err(ClientError::UnexpectedStatus { status: 404, url: id.to_string() })
                }
            }
            One
        }))
        .await
        .unwrap();

        let catalog = build_catalog();
        let s = sample_with("tap-port-id", &[("instance_id", "i-1")]);
        let labels = catalog["network.incoming.bytes"]
            .extract_labels(&s, &lookup)
            .await;
        assert_eq!(labels.as_slice(), &["i-1", "vm-one"]);
    }

    #[tokio::test]
    async fn test_lb_member_labels() {
        let lookup = empty_lookup().await;
        let catalog = build_catalog();
        let s = sample_with(
            "member-id",
            &[
                ("address", "10.0.0.4"),
                ("protocol_port", "8080"),
                ("status", "ACTIVE"),
                ("pool_id", "p-missing"),
            ],
        );
        let labels = catalog["network.services.lb.member"]
            .extract_labels(&s, &lookup)
            .await;
        // The pool id is unknown to the API, so the name degrades to the
        // sentinel rather than failing the scrape.
        assert_eq!(labels.as_slice(), &["10.0.0.4:8080", "ACTIVE", UNKNOWN_NAME]);
    }

    #[tokio::test]
    async fn test_swift_container_label() {
        let lookup = empty_lookup().await;
        let catalog = build_catalog();

        let s = sample_with("tenant-1/backups", &[]);
        let labels = catalog["storage.containers.objects"]
            .extract_labels(&s, &lookup)
            .await;
        assert_eq!(labels.as_slice(), &["backups"]);

        // No separator means no container part.
        let s = sample_with("tenant-only", &[]);
        let labels = catalog["storage.containers.objects.size"]
            .extract_labels(&s, &lookup)
            .await;
        assert_eq!(labels.as_slice(), &[""]);
    }

    #[tokio::test]
    async fn test_instance_flavor_label() {
        let lookup = empty_lookup().await;
        let catalog = build_catalog();
        let s = sample_with(
            "vm-id-1",
            &[("display_name", "vm-one"), ("flavor.name", "m1.small")],
        );
        let labels = catalog["instance"].extract_labels(&s, &lookup).await;
        assert_eq!(labels.as_slice(), &["vm-id-1", "vm-one", "m1.small"]);
    }
}

#[cfg(test)]
mod scraper_tests {
    use super::*;

    /// MeteringApi stub driven by a per-meter script.
    enum Script {
        Fail,
        Respond(Vec<Sample>),
        Hang,
    }

    struct ScriptedMetering {
        scripts: AHashMap<&'static str, Script>,
    }

    #[async_trait]
    impl MeteringApi for ScriptedMetering {
        async fn query_samples(
            &self,
            meter: &str,
            _query: &SampleQuery,
        ) -> Result<Vec<Sample>, ClientError> {
            match self.scripts.get(meter) {
                Some(Script::Respond(samples)) => Ok(samples.clone()),
                Some(Script::Fail) => Err(ClientError::UnexpectedStatus {
                    status: 500,
                    url: meter.to_string(),
                }),
                Some(Script::Hang) => {
                    std::future::pending::<()>().await;
                    unreachable!()
                }
                None => Ok(Vec::new()),
            }
        }
    }

    struct NoResources;

    #[async_trait]
    impl ResourceApi for NoResources {
        async fn list_pools(&self) -> Result<Vec<NamedResource>, ClientError> {
            Ok(Vec::new())
        }
        async fn list_instances(&self) -> Result<Vec<NamedResource>, ClientError> {
            Ok(Vec::new())
        }
        async fn get_pool(&self, id: &str) -> Result<CompactString, ClientError> {
            Err(ClientError::UnexpectedStatus { status: 404, url: id.to_string() })
        }
        async fn get_instance(&self, id: &str) -> Result<CompactString, ClientError> {
            Err(ClientError::UnexpectedStatus { status: 404, url: id.to_string() })
        }
    }

    fn gauge_sample(resource_id: &str, volume: f64) -> Sample {
        Sample {
            resource_id: CompactString::from(resource_id),
            counter_name: CompactString::new(""),
            counter_type: CompactString::from("gauge"),
            counter_unit: CompactString::new("%"),
            counter_volume: volume,
            timestamp: "2026-08-30T12:00:00".to_string(),
            resource_metadata: Metadata::from_pairs(&[("display_name", "vm")]),
        }
    }

    fn options(max_results: usize, timeout_secs: u64) -> ScrapeOptions {
        ScrapeOptions {
            max_results,
            max_metric_age: Duration::from_secs(300),
            scrape_timeout: Duration::from_secs(timeout_secs),
        }
    }

    fn subset_catalog(meters: &[&str]) -> Catalog {
        build_catalog()
            .into_iter()
            .filter(|(meter, _)| meters.contains(meter))
            .collect()
    }

    async fn scraper_with(
        scripts: AHashMap<&'static str, Script>,
        meters: &[&str],
        options: ScrapeOptions,
    ) -> CeilometerScraper {
        let lookup = Arc::new(LookupService::bootstrap(Arc::new(NoResources)).await.unwrap());
        CeilometerScraper::new(
            Arc::new(ScriptedMetering { scripts }),
            lookup,
            subset_catalog(meters),
            options,
        )
    }

    fn outcome_for<'a>(report: &'a CycleReport, meter: &str) -> &'a ScrapeOutcome {
        report
            .outcomes
            .iter()
            .find(|o| o.meter == meter)
            .unwrap_or_else(|| panic!("no outcome for {meter}"))
    }

    #[tokio::test]
    async fn test_cycle_isolates_failures() {
        let mut scripts = AHashMap::new();
        scripts.insert("cpu", Script::Fail);
        scripts.insert("memory", Script::Respond(Vec::new()));
        scripts.insert(
            "cpu_util",
            Script::Respond(vec![
                gauge_sample("a", 10.0),
                gauge_sample("b", 20.0),
                gauge_sample("a", 30.0),
                gauge_sample("c", 40.0),
                gauge_sample("d", 50.0),
            ]),
        );

        let scraper = scraper_with(scripts, &["cpu", "memory", "cpu_util"], options(100, 30)).await;
        let report = scraper.run_cycle().await;

        assert_eq!(report.outcomes.len(), 3);
        assert!(!outcome_for(&report, "cpu").success);
        assert!(outcome_for(&report, "memory").success);
        assert_eq!(outcome_for(&report, "memory").result_size, 0);
        assert!(outcome_for(&report, "cpu_util").success);
        // 5 raw samples, one duplicate resource id.
        assert_eq!(outcome_for(&report, "cpu_util").result_size, 4);
        assert_eq!(report.failed_meters(), 1);

        // 4 deduplicated data observations + 3 meters × 3 bookkeeping + 1 total.
        let data: Vec<&Observation> = report
            .observations
            .iter()
            .filter(|o| o.descriptor.name == "openstack_ceilometer_cpu_percent")
            .collect();
        assert_eq!(data.len(), 4);
        assert_eq!(report.observations.len(), 4 + 9 + 1);
    }

    #[tokio::test]
    async fn test_cycle_bookkeeping_values() {
        let mut scripts = AHashMap::new();
        scripts.insert("cpu_util", Script::Respond(vec![gauge_sample("a", 10.0)]));

        let scraper = scraper_with(scripts, &["cpu_util"], options(100, 30)).await;
        let report = scraper.run_cycle().await;

        let success = report
            .observations
            .iter()
            .find(|o| o.descriptor.name == "openstack_ceilometer_metric_scrape_success")
            .unwrap();
        assert_eq!(success.value, 1.0);
        assert_eq!(success.labels.as_slice(), &["cpu_util"]);

        let size = report
            .observations
            .iter()
            .find(|o| o.descriptor.name == "openstack_ceilometer_metric_scrape_result_size")
            .unwrap();
        assert_eq!(size.value, 1.0);

        let total = report
            .observations
            .iter()
            .find(|o| o.descriptor.name == "openstack_ceilometer_total_scrape_duration_ns")
            .unwrap();
        assert!(total.labels.is_empty());
        assert!(total.value > 0.0);
    }

    #[tokio::test]
    async fn test_full_result_counts_as_success() {
        let mut scripts = AHashMap::new();
        scripts.insert(
            "cpu_util",
            Script::Respond(vec![
                gauge_sample("a", 1.0),
                gauge_sample("b", 2.0),
                gauge_sample("c", 3.0),
            ]),
        );

        // Exactly max_results triggers the truncation warning but remains a
        // successful scrape.
        let scraper = scraper_with(scripts, &["cpu_util"], options(3, 30)).await;
        let report = scraper.run_cycle().await;
        let outcome = outcome_for(&report, "cpu_util");
        assert!(outcome.success);
        assert_eq!(outcome.result_size, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_query_times_out_as_failure() {
        let mut scripts = AHashMap::new();
        scripts.insert("cpu", Script::Hang);
        scripts.insert("memory", Script::Respond(vec![gauge_sample("a", 1.0)]));

        let scraper = scraper_with(scripts, &["cpu", "memory"], options(100, 5)).await;
        let report = scraper.run_cycle().await;

        assert!(!outcome_for(&report, "cpu").success);
        assert!(outcome_for(&report, "memory").success);
    }

    #[tokio::test]
    async fn test_unknown_type_exports_untyped() {
        let mut scripts = AHashMap::new();
        let mut odd = gauge_sample("a", 7.0);
        odd.counter_type = CompactString::from("delta");
        scripts.insert("cpu_util", Script::Respond(vec![odd]));

        let scraper = scraper_with(scripts, &["cpu_util"], options(100, 30)).await;
        let report = scraper.run_cycle().await;
        let data = report
            .observations
            .iter()
            .find(|o| o.descriptor.name == "openstack_ceilometer_cpu_percent")
            .unwrap();
        assert_eq!(data.kind, ValueKind::Untyped);
        assert_eq!(data.value, 7.0);
    }
}


#[cfg(test)]
mod config_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = ExporterConfig::default();
        assert_eq!(config.server.bind_addr, "0.0.0.0:9181");
        assert_eq!(config.server.metrics_path, "/metrics");
        assert_eq!(config.scrape.max_results, 100);
        assert_eq!(config.scrape.max_metric_age, Duration::from_secs(300));
        assert_eq!(config.scrape.scrape_timeout, Duration::from_secs(30));
        assert_eq!(config.scrape.enabled_metrics, vec!["*".to_string()]);
        assert!(config.scrape.disabled_metrics.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_toml_str() {
        let toml_str = r#"
            [server]
            bind_addr = "127.0.0.1:9300"
            metrics_path = "/ceilometer"

            [scrape]
            max_results = 250
            max_metric_age = "10m"
            scrape_timeout = "45s"
            enabled_metrics = ["cpu*", "memory*"]
            disabled_metrics = ["cpu_util"]

            [logging]
            level = "debug"
        "#;
        let config = ExporterConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:9300");
        assert_eq!(config.scrape.max_results, 250);
        assert_eq!(config.scrape.max_metric_age, Duration::from_secs(600));
        assert_eq!(config.scrape.scrape_timeout, Duration::from_secs(45));
        assert_eq!(config.scrape.enabled_metrics.len(), 2);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = ExporterConfig::from_toml_str("[scrape]\nmax_results = 10\n").unwrap();
        assert_eq!(config.scrape.max_results, 10);
        assert_eq!(config.server.bind_addr, "0.0.0.0:9181");
        assert_eq!(config.scrape.enabled_metrics, vec!["*".to_string()]);
    }

    #[test]
    fn test_validation_rejects_zero_max_results() {
        let mut config = ExporterConfig::default();
        config.scrape.max_results = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_enable_list() {
        let mut config = ExporterConfig::default();
        config.scrape.enabled_metrics.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_relative_metrics_path() {
        let mut config = ExporterConfig::default();
        config.server.metrics_path = "metrics".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_root_metrics_path() {
        // "/" belongs to the landing page; routing metrics there would
        // register the path twice.
        let mut config = ExporterConfig::default();
        config.server.metrics_path = "/".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_generated_config_round_trips() {
        let rendered = ExporterConfig::generate_default_config();
        let parsed = ExporterConfig::from_toml_str(&rendered).unwrap();
        assert!(parsed.validate().is_ok());
        assert_eq!(parsed.scrape.max_results, ExporterConfig::default().scrape.max_results);
    }

    #[test]
    fn test_load_or_default_with_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("exporter.toml");
        fs::write(&path, "[scrape]\nmax_results = 7\n").unwrap();
        let config = ExporterConfig::load_or_default(&path).unwrap();
        assert_eq!(config.scrape.max_results, 7);
    }

    #[test]
    fn test_load_or_default_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ExporterConfig::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.scrape.max_results, 100);
    }

    #[test]
    fn test_load_requires_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            ExporterConfig::load(dir.path().join("absent.toml")),
            Err(ConfigError::FileNotFound { .. })
        ));
    }
}
