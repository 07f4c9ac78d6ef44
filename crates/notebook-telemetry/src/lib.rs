//! Notebook Telemetry - trace context relay for notebook executions
//!
//! This crate connects the traces of a parent notebook and the child
//! notebooks it runs:
//! - W3C Trace Context ids, propagation and a JSON carrier
//! - Spans that close themselves when their scope ends
//! - A relay that passes the current context to a child through its
//!   parameter map, and restores it on the child side
//! - Validated telemetry configuration with one-shot initialization
//!
//! # Example
//!
//! ```rust,no_run
//! use notebook_telemetry::{LocalRunner, Telemetry, TelemetryConfig, TelemetryInit};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let init = TelemetryInit::new();
//! let telemetry = Telemetry::configure(TelemetryConfig::for_notebook("/etl/parent"), &init)?;
//!
//! let runner = Arc::new(LocalRunner::new());
//! let relay = telemetry.relay(runner);
//! let exit_value = relay
//!     .run_with_telemetry("./sample-telemetry-notebook", Duration::from_secs(600), None)
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod exporter;
pub mod logging;
pub mod metrics;
pub mod processor;
pub mod propagator;
pub mod relay;
pub mod runner;
pub mod span;
pub mod telemetry;
pub mod tracer;

pub use config::{ConnectionString, Resource, TelemetryConfig, TelemetryInit};
pub use context::{ContextState, SpanContext, SpanId, TraceFlags, TraceId, TraceState};
pub use error::{ConfigError, PropagationError, RelayError, RunError};
pub use exporter::{ConsoleExporter, ExporterConfig, InMemoryExporter, SpanExporter};
pub use logging::init_logging;
pub use metrics::{Histogram, HistogramSnapshot, Meter};
pub use processor::{BatchSpanProcessor, SimpleSpanProcessor, SpanProcessor};
pub use propagator::{Carrier, TextMapCarrier, TracePropagator, W3CTraceContextPropagator};
pub use relay::{
    ImportOutcome, Parameters, TRACE_CONTEXT_PARAM, TraceContextRelay, decode_context,
    encode_context, restore_context,
};
pub use runner::{LocalRunner, NotebookHandler, NotebookRunner};
pub use span::{ActiveSpan, Span, SpanAttribute, SpanData, SpanEvent, SpanKind, SpanStatus};
pub use telemetry::{Telemetry, TelemetryBuilder};
pub use tracer::{SamplingStrategy, Tracer, TracerConfig};
