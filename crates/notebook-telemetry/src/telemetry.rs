//! Telemetry composition root for one notebook execution.

use crate::config::{ConnectionString, Resource, TelemetryConfig, TelemetryInit};
use crate::error::ConfigError;
use crate::exporter::{ConsoleExporter, ExporterConfig, SpanExporter};
use crate::logging::init_logging;
use crate::metrics::Meter;
use crate::processor::{BatchSpanProcessor, SimpleSpanProcessor, SpanProcessor};
use crate::relay::{ImportOutcome, Parameters, TraceContextRelay, restore_context};
use crate::runner::NotebookRunner;
use crate::tracer::{SamplingStrategy, Tracer, TracerConfig};
use std::sync::Arc;
use tracing::{debug, info};

type EnvLookup = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Builder for [`Telemetry`].
pub struct TelemetryBuilder {
    config: TelemetryConfig,
    exporter: Option<Arc<dyn SpanExporter>>,
    sampling_strategy: SamplingStrategy,
    batch: bool,
    install_logging: bool,
    env: EnvLookup,
}

impl TelemetryBuilder {
    fn new(config: TelemetryConfig) -> Self {
        Self {
            config,
            exporter: None,
            sampling_strategy: SamplingStrategy::default(),
            batch: true,
            install_logging: true,
            env: Box::new(|key: &str| std::env::var(key).ok()),
        }
    }

    /// Export spans to `exporter` instead of the console.
    pub fn with_exporter(mut self, exporter: Arc<dyn SpanExporter>) -> Self {
        self.exporter = Some(exporter);
        self
    }

    pub fn with_sampling_strategy(mut self, strategy: SamplingStrategy) -> Self {
        self.sampling_strategy = strategy;
        self
    }

    /// Export every span as soon as it ends instead of batching.
    pub fn with_simple_processor(mut self) -> Self {
        self.batch = false;
        self
    }

    /// Leave the global log subscriber alone.
    pub fn without_logging(mut self) -> Self {
        self.install_logging = false;
        self
    }

    /// Read environment variables through `lookup` instead of the process env.
    pub fn with_env(mut self, lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static) -> Self {
        self.env = Box::new(lookup);
        self
    }

    /// Validate the configuration and build the telemetry handle.
    ///
    /// Process-wide setup only runs for the first caller sharing `init`.
    pub fn build(self, init: &TelemetryInit) -> Result<Telemetry, ConfigError> {
        let config = self.config;
        config.validate()?;
        let connection_string = config.resolve_connection_string_with(&self.env)?;
        let metric_interval = config.metric_export_interval_with(&self.env);

        if init.ensure_initialized() {
            if self.install_logging {
                init_logging(&config.logging_level);
            }
            info!(
                service = %config.service_name,
                version = %config.service_version,
                connection_string = ?connection_string,
                tracing_export_interval_ms = config.tracing_export_interval_ms,
                logging_export_interval_ms = config.logging_export_interval_ms,
                metric_export_interval_ms = metric_interval.as_millis() as u64,
                "telemetry configured"
            );
        } else {
            debug!(service = %config.service_name, "telemetry already initialized");
        }

        let exporter_config = ExporterConfig::new(config.service_name.clone())
            .with_export_interval(config.tracing_export_interval_ms);
        let exporter: Arc<dyn SpanExporter> = match self.exporter {
            Some(exporter) => exporter,
            None => Arc::new(ConsoleExporter::new(exporter_config.clone()).with_summary_only()),
        };
        let processor: Arc<dyn SpanProcessor> = if self.batch {
            Arc::new(BatchSpanProcessor::new(
                exporter,
                exporter_config.batch_size,
                exporter_config.max_queue_size,
                exporter_config.export_interval(),
            ))
        } else {
            Arc::new(SimpleSpanProcessor::new(exporter))
        };

        let tracer = Tracer::new(
            TracerConfig::new(config.service_name.clone())
                .with_version(config.service_version.clone())
                .with_sampling_strategy(self.sampling_strategy),
            processor,
        );

        Ok(Telemetry {
            resource: Resource::for_service(&config),
            meter: Arc::new(Meter::new(config.service_name.clone())),
            connection_string,
            tracer,
            config,
        })
    }
}

/// Telemetry for one notebook: its tracer, meter and relay.
pub struct Telemetry {
    config: TelemetryConfig,
    resource: Resource,
    connection_string: Option<ConnectionString>,
    tracer: Tracer,
    meter: Arc<Meter>,
}

impl Telemetry {
    pub fn builder(config: TelemetryConfig) -> TelemetryBuilder {
        TelemetryBuilder::new(config)
    }

    /// Configure with the console exporter and batching.
    pub fn configure(config: TelemetryConfig, init: &TelemetryInit) -> Result<Self, ConfigError> {
        Self::builder(config).build(init)
    }

    /// The service name; by convention the notebook path.
    pub fn notebook_name(&self) -> &str {
        &self.config.service_name
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    pub fn meter(&self) -> &Meter {
        &self.meter
    }

    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    pub fn connection_string(&self) -> Option<&ConnectionString> {
        self.connection_string.as_ref()
    }

    /// Child side: inherit the trace context passed by the parent, if any.
    pub fn restore_context(&self, parameters: &Parameters) -> ImportOutcome {
        restore_context(&self.tracer, parameters)
    }

    /// Parent side: a relay that runs children through `runner`.
    pub fn relay(&self, runner: Arc<dyn NotebookRunner>) -> TraceContextRelay {
        TraceContextRelay::new(self.tracer.clone(), runner, self.notebook_name())
    }

    pub fn force_flush(&self) -> Result<(), String> {
        self.tracer.force_flush()
    }

    pub fn shutdown(&self) -> Result<(), String> {
        self.tracer.shutdown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::InMemoryExporter;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_configure_rejects_missing_version() {
        let init = TelemetryInit::new();
        let err = Telemetry::builder(TelemetryConfig::new("nb", ""))
            .without_logging()
            .with_env(no_env)
            .build(&init)
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::MissingField("service_version")));
        assert!(!init.is_initialized());
    }

    #[test]
    fn test_second_configure_reuses_initialization() {
        let init = TelemetryInit::new();
        let first = Telemetry::builder(TelemetryConfig::for_notebook("/nb/a"))
            .without_logging()
            .with_env(no_env)
            .build(&init)
            .unwrap();
        assert!(init.is_initialized());

        let second = Telemetry::builder(TelemetryConfig::for_notebook("/nb/b"))
            .without_logging()
            .with_env(no_env)
            .build(&init)
            .unwrap();
        assert_eq!(first.notebook_name(), "/nb/a");
        assert_eq!(second.tracer().service_name(), "/nb/b");
    }

    #[test]
    fn test_connection_string_from_env() {
        let init = TelemetryInit::new();
        let telemetry = Telemetry::builder(TelemetryConfig::new("nb", "1.0"))
            .without_logging()
            .with_env(|key| {
                (key == crate::config::CONNECTION_STRING_ENV)
                    .then(|| "InstrumentationKey=abcd-1234".to_string())
            })
            .build(&init)
            .unwrap();
        assert_eq!(
            telemetry.connection_string().map(|c| c.instrumentation_key.as_str()),
            Some("abcd-1234")
        );
    }

    #[test]
    fn test_batched_spans_flush_on_shutdown() {
        let exporter = InMemoryExporter::new();
        let telemetry = Telemetry::builder(TelemetryConfig::new("nb", "1.0"))
            .without_logging()
            .with_env(no_env)
            .with_exporter(Arc::new(exporter.clone()))
            .build(&TelemetryInit::new())
            .unwrap();

        telemetry.tracer().in_span("process trips", |_| {});
        assert!(exporter.finished_spans().is_empty());

        telemetry.shutdown().unwrap();
        assert_eq!(exporter.finished_spans().len(), 1);
        assert_eq!(exporter.finished_spans()[0].service_name, "nb");
    }

    #[test]
    fn test_dropping_telemetry_exports_batched_spans() {
        let exporter = InMemoryExporter::new();
        let telemetry = Telemetry::builder(TelemetryConfig::new("nb", "1.0"))
            .without_logging()
            .with_env(no_env)
            .with_exporter(Arc::new(exporter.clone()))
            .build(&TelemetryInit::new())
            .unwrap();

        telemetry.tracer().in_span("process trips", |_| {});
        assert!(exporter.finished_spans().is_empty());

        drop(telemetry);
        assert!(exporter.find("process trips").is_some());
    }

    #[test]
    fn test_tracing_interval_drives_batch_export() {
        let exporter = InMemoryExporter::new();
        let mut config = TelemetryConfig::new("nb", "1.0");
        config.tracing_export_interval_ms = 0;
        let telemetry = Telemetry::builder(config)
            .without_logging()
            .with_env(no_env)
            .with_exporter(Arc::new(exporter.clone()))
            .build(&TelemetryInit::new())
            .unwrap();

        telemetry.tracer().in_span("process trips", |_| {});
        assert_eq!(exporter.finished_spans().len(), 1);
    }

    #[test]
    fn test_bad_metric_interval_env_does_not_fail_configure() {
        let telemetry = Telemetry::builder(TelemetryConfig::new("nb", "1.0"))
            .without_logging()
            .with_env(|key| {
                (key == crate::config::METRIC_EXPORT_INTERVAL_ENV).then(|| "soon".to_string())
            })
            .build(&TelemetryInit::new());
        assert!(telemetry.is_ok());
    }
}
