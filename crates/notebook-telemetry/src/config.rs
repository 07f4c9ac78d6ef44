//! Telemetry configuration.
//!
//! Mirrors the Application Insights setup used by the notebooks: a service
//! name and version are mandatory, the connection string falls back to
//! `APPLICATIONINSIGHTS_CONNECTION_STRING`, and export intervals default to
//! 15 seconds.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

pub const CONNECTION_STRING_ENV: &str = "APPLICATIONINSIGHTS_CONNECTION_STRING";
pub const METRIC_EXPORT_INTERVAL_ENV: &str = "OTEL_METRIC_EXPORT_INTERVAL";

pub const SERVICE_NAME: &str = "service.name";
pub const SERVICE_VERSION: &str = "service.version";
pub const SERVICE_INSTANCE_ID: &str = "service.instance.id";

fn default_logging_level() -> String {
    "info".to_string()
}

fn default_export_interval_ms() -> u64 {
    15_000
}

fn default_metric_export_interval_ms() -> u64 {
    60_000
}

/// Settings for one notebook's telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub service_name: String,
    pub service_version: String,
    /// Falls back to [`CONNECTION_STRING_ENV`] when unset.
    #[serde(default)]
    pub connection_string: Option<String>,
    /// Filter directive for the log subscriber, e.g. `info` or `debug`.
    #[serde(default = "default_logging_level")]
    pub logging_level: String,
    #[serde(default = "default_export_interval_ms")]
    pub tracing_export_interval_ms: u64,
    #[serde(default = "default_export_interval_ms")]
    pub logging_export_interval_ms: u64,
    /// Overridden by [`METRIC_EXPORT_INTERVAL_ENV`] when that is set.
    #[serde(default = "default_metric_export_interval_ms")]
    pub metric_export_interval_ms: u64,
}

impl TelemetryConfig {
    pub fn new(service_name: impl Into<String>, service_version: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            service_version: service_version.into(),
            connection_string: None,
            logging_level: default_logging_level(),
            tracing_export_interval_ms: default_export_interval_ms(),
            logging_export_interval_ms: default_export_interval_ms(),
            metric_export_interval_ms: default_metric_export_interval_ms(),
        }
    }

    /// Convention for notebooks: named after the notebook path, version `1.0`.
    pub fn for_notebook(notebook_path: impl Into<String>) -> Self {
        Self::new(notebook_path, "1.0")
    }

    pub fn with_connection_string(mut self, connection_string: impl Into<String>) -> Self {
        self.connection_string = Some(connection_string.into());
        self
    }

    pub fn with_logging_level(mut self, level: impl Into<String>) -> Self {
        self.logging_level = level.into();
        self
    }

    pub fn with_tracing_export_interval(mut self, interval_ms: u64) -> Self {
        self.tracing_export_interval_ms = interval_ms;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::MissingField("service_name"));
        }
        if self.service_version.trim().is_empty() {
            return Err(ConfigError::MissingField("service_version"));
        }
        Ok(())
    }

    pub fn tracing_export_interval(&self) -> Duration {
        Duration::from_millis(self.tracing_export_interval_ms)
    }

    pub fn logging_export_interval(&self) -> Duration {
        Duration::from_millis(self.logging_export_interval_ms)
    }

    /// Resolve the connection string from the config or the process environment.
    pub fn resolve_connection_string(&self) -> Result<Option<ConnectionString>, ConfigError> {
        self.resolve_connection_string_with(|key| std::env::var(key).ok())
    }

    pub fn resolve_connection_string_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<ConnectionString>, ConfigError> {
        self.connection_string
            .clone()
            .or_else(|| lookup(CONNECTION_STRING_ENV))
            .filter(|s| !s.trim().is_empty())
            .map(|s| s.parse())
            .transpose()
    }

    /// Metric export interval, honouring [`METRIC_EXPORT_INTERVAL_ENV`].
    ///
    /// The variable holds milliseconds, fractional values allowed. A value
    /// that is not a positive number is ignored with a warning.
    pub fn metric_export_interval_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Duration {
        let default = Duration::from_millis(self.metric_export_interval_ms);
        let Some(value) = lookup(METRIC_EXPORT_INTERVAL_ENV) else {
            return default;
        };
        match value.trim().parse::<f64>() {
            Ok(ms) if ms.is_finite() && ms > 0.0 => Duration::from_secs_f64(ms / 1000.0),
            _ => {
                warn!(
                    name = METRIC_EXPORT_INTERVAL_ENV,
                    value = %value,
                    default_ms = self.metric_export_interval_ms,
                    "invalid metric export interval, using default"
                );
                default
            }
        }
    }

    pub fn metric_export_interval(&self) -> Duration {
        self.metric_export_interval_with(|key| std::env::var(key).ok())
    }
}

/// Parsed Application Insights connection string.
///
/// Format: `Key1=Value1;Key2=Value2`. Keys are matched case-insensitively.
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionString {
    pub instrumentation_key: String,
    pub ingestion_endpoint: Option<String>,
    entries: BTreeMap<String, String>,
}

impl ConnectionString {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(&key.to_ascii_lowercase()).map(|s| s.as_str())
    }
}

impl std::fmt::Debug for ConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let prefix: String = self.instrumentation_key.chars().take(4).collect();
        let redacted = format!("{prefix}***");
        f.debug_struct("ConnectionString")
            .field("instrumentation_key", &redacted)
            .field("ingestion_endpoint", &self.ingestion_endpoint)
            .finish()
    }
}

impl std::str::FromStr for ConnectionString {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut entries = BTreeMap::new();
        for part in s.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = part.split_once('=').ok_or_else(|| {
                ConfigError::InvalidConnectionString(format!("segment {part:?} has no '='"))
            })?;
            entries.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        }

        let instrumentation_key = entries
            .get("instrumentationkey")
            .filter(|v| !v.is_empty())
            .cloned()
            .ok_or_else(|| {
                ConfigError::InvalidConnectionString("InstrumentationKey is required".to_string())
            })?;
        let ingestion_endpoint = entries.get("ingestionendpoint").cloned();

        Ok(Self {
            instrumentation_key,
            ingestion_endpoint,
            entries,
        })
    }
}

/// Resource attributes describing the service emitting telemetry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Resource {
    attributes: BTreeMap<String, String>,
}

impl Resource {
    /// Build the resource for `config` with a fresh service instance id.
    pub fn for_service(config: &TelemetryConfig) -> Self {
        let mut attributes = BTreeMap::new();
        attributes.insert(SERVICE_NAME.to_string(), config.service_name.clone());
        attributes.insert(SERVICE_VERSION.to_string(), config.service_version.clone());
        attributes.insert(SERVICE_INSTANCE_ID.to_string(), Uuid::new_v4().to_string());
        Self { attributes }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(|s| s.as_str())
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }
}

/// One-shot initialization state for process-wide telemetry setup.
///
/// Owned by the composition root and passed to
/// [`Telemetry::configure`](crate::Telemetry::configure).
#[derive(Debug, Default)]
pub struct TelemetryInit {
    initialized: AtomicBool,
}

impl TelemetryInit {
    pub const fn new() -> Self {
        Self {
            initialized: AtomicBool::new(false),
        }
    }

    /// Returns `true` for exactly one caller, the one that should run setup.
    pub fn ensure_initialized(&self) -> bool {
        self.initialized
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const CONN: &str =
        "InstrumentationKey=00000000-0000-0000-0000-000000000000;IngestionEndpoint=https://westeurope-5.in.applicationinsights.azure.com/";

    #[test]
    fn test_defaults() {
        let config = TelemetryConfig::for_notebook("/Repos/etl/sample-telemetry-notebook");
        assert_eq!(config.service_version, "1.0");
        assert_eq!(config.tracing_export_interval(), Duration::from_secs(15));
        assert_eq!(config.logging_export_interval(), Duration::from_secs(15));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_names() {
        let err = TelemetryConfig::new("", "1.0").validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("service_name")));

        let err = TelemetryConfig::new("nb", " ").validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("service_version")));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: TelemetryConfig =
            serde_json::from_str(r#"{"service_name":"nb","service_version":"2.1"}"#).unwrap();
        assert_eq!(config, TelemetryConfig::new("nb", "2.1"));
    }

    #[test]
    fn test_connection_string_from_env_fallback() {
        let config = TelemetryConfig::new("nb", "1.0");
        let resolved = config
            .resolve_connection_string_with(|key| (key == CONNECTION_STRING_ENV).then(|| CONN.to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(resolved.instrumentation_key, "00000000-0000-0000-0000-000000000000");
        assert_eq!(
            resolved.ingestion_endpoint.as_deref(),
            Some("https://westeurope-5.in.applicationinsights.azure.com/")
        );

        assert!(config.resolve_connection_string_with(|_| None).unwrap().is_none());
    }

    #[test]
    fn test_explicit_connection_string_wins() {
        let config = TelemetryConfig::new("nb", "1.0").with_connection_string("InstrumentationKey=abc");
        let resolved = config
            .resolve_connection_string_with(|_| Some(CONN.to_string()))
            .unwrap()
            .unwrap();
        assert_eq!(resolved.instrumentation_key, "abc");
        assert_eq!(resolved.get("INSTRUMENTATIONKEY"), Some("abc"));
    }

    #[test]
    fn test_invalid_connection_string() {
        assert!("IngestionEndpoint=https://x".parse::<ConnectionString>().is_err());
        assert!("InstrumentationKey".parse::<ConnectionString>().is_err());
    }

    #[test]
    fn test_connection_string_debug_is_redacted() {
        let conn: ConnectionString = CONN.parse().unwrap();
        let debug = format!("{conn:?}");
        assert!(!debug.contains("00000000-0000"));
    }

    #[test]
    fn test_metric_interval_env_override() {
        let config = TelemetryConfig::new("nb", "1.0");
        assert_eq!(config.metric_export_interval_with(|_| None), Duration::from_secs(60));
        assert_eq!(
            config.metric_export_interval_with(|_| Some("5000".to_string())),
            Duration::from_secs(5)
        );
        assert_eq!(
            config.metric_export_interval_with(|_| Some("5000.0".to_string())),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_invalid_metric_interval_env_falls_back_to_default() {
        let config = TelemetryConfig::new("nb", "1.0");
        for value in ["soon", "", "-5", "0", "NaN", "inf"] {
            assert_eq!(
                config.metric_export_interval_with(|_| Some(value.to_string())),
                Duration::from_secs(60),
                "value {value:?}"
            );
        }
    }

    #[test]
    fn test_resource_attributes() {
        let config = TelemetryConfig::new("nb", "1.0");
        let a = Resource::for_service(&config);
        let b = Resource::for_service(&config);
        assert_eq!(a.get(SERVICE_NAME), Some("nb"));
        assert_eq!(a.get(SERVICE_VERSION), Some("1.0"));
        assert_ne!(a.get(SERVICE_INSTANCE_ID), b.get(SERVICE_INSTANCE_ID));
    }

    #[test]
    fn test_ensure_initialized_once() {
        let init = Arc::new(TelemetryInit::new());
        let winners = (0..8)
            .map(|_| {
                let init = init.clone();
                std::thread::spawn(move || init.ensure_initialized())
            })
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert!(init.is_initialized());
    }
}
