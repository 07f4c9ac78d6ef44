//! Trace context relay between parent and child notebook executions.
//!
//! The parent serializes its current trace context into a W3C carrier, encodes
//! the carrier as JSON and passes it to the child under
//! [`TRACE_CONTEXT_PARAM`]. The child decodes it and attaches it before
//! creating its own spans, so both executions end up in one trace.
//!
//! ```text
//! parent                                   child
//! ─────────────────────────────────────    ─────────────────────────────
//! span <notebook>
//!   span <path>  ── traceparent ──json──▶  restore_context(params)
//!                                            span ... (parent = <path>)
//! ```

use crate::context::SpanContext;
use crate::error::{PropagationError, RelayError};
use crate::propagator::{Carrier, TracePropagator, W3CTraceContextPropagator};
use crate::runner::NotebookRunner;
use crate::tracer::Tracer;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Parameter key reserved for the serialized trace context.
pub const TRACE_CONTEXT_PARAM: &str = "_opentelemetry_trace_context";

/// Invocation parameters passed from a parent to a child execution.
pub type Parameters = HashMap<String, String>;

/// Result of looking for an inherited trace context on the child side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImportOutcome {
    /// The context was decoded and is now the inherited context.
    Attached(SpanContext),
    /// No carrier was passed; the child starts a fresh root trace.
    Absent,
    /// A carrier was passed but could not be decoded; treated as absent.
    Malformed { reason: String },
    /// A context had already been inherited; the new one was ignored.
    AlreadyAttached,
}

impl ImportOutcome {
    pub fn is_attached(&self) -> bool {
        matches!(self, ImportOutcome::Attached(_))
    }
}

/// Serialize `context` into the JSON form passed under [`TRACE_CONTEXT_PARAM`].
pub fn encode_context(context: &SpanContext) -> Result<String, serde_json::Error> {
    let mut carrier = Carrier::new();
    W3CTraceContextPropagator::new().inject(context, &mut carrier);
    carrier.to_json()
}

/// Decode the JSON form produced by [`encode_context`].
pub fn decode_context(encoded: &str) -> Result<SpanContext, PropagationError> {
    let carrier = Carrier::from_json(encoded)?;
    W3CTraceContextPropagator::new().extract_checked(&carrier)
}

/// Import path: attach the trace context carried in `parameters`, if any.
///
/// Never fails. A missing or empty entry leaves the tracer without an
/// inherited context; a malformed entry is logged and ignored.
pub fn restore_context(tracer: &Tracer, parameters: &Parameters) -> ImportOutcome {
    let Some(encoded) = parameters
        .get(TRACE_CONTEXT_PARAM)
        .filter(|value| !value.is_empty())
    else {
        debug!("no inherited trace context, starting a root trace");
        return ImportOutcome::Absent;
    };

    match decode_context(encoded) {
        Ok(context) => {
            if tracer.attach(context.clone()) {
                ImportOutcome::Attached(context)
            } else {
                debug!("trace context already inherited, ignoring carrier");
                ImportOutcome::AlreadyAttached
            }
        }
        Err(e) => {
            warn!(error = %e, "ignoring malformed trace context carrier");
            ImportOutcome::Malformed {
                reason: e.to_string(),
            }
        }
    }
}

/// Export path: runs child notebooks with the current trace context attached.
///
/// Clones share the tracer's active context, so calls on one relay must be
/// awaited one after another; concurrent calls would parent each other's spans.
#[derive(Clone)]
pub struct TraceContextRelay {
    tracer: Tracer,
    runner: Arc<dyn NotebookRunner>,
    notebook_name: String,
}

impl TraceContextRelay {
    pub fn new(
        tracer: Tracer,
        runner: Arc<dyn NotebookRunner>,
        notebook_name: impl Into<String>,
    ) -> Self {
        Self {
            tracer,
            runner,
            notebook_name: notebook_name.into(),
        }
    }

    pub fn notebook_name(&self) -> &str {
        &self.notebook_name
    }

    /// Run the notebook at `path` and return its exit value.
    ///
    /// The call is wrapped in a span for the current notebook and a nested
    /// span for `path`; the nested span's context is what the child
    /// inherits. Both spans are closed on every exit path. Runner errors,
    /// timeouts included, are returned unchanged and never retried.
    pub async fn run_with_telemetry(
        &self,
        path: &str,
        timeout: Duration,
        arguments: Option<Parameters>,
    ) -> Result<String, RelayError> {
        let mut arguments = arguments.unwrap_or_default();
        if arguments.contains_key(TRACE_CONTEXT_PARAM) {
            return Err(RelayError::ReservedParameter(TRACE_CONTEXT_PARAM));
        }

        let notebook_span = self.tracer.start_as_current_span(self.notebook_name.as_str());
        let call_span = self.tracer.start_as_current_span(path);
        call_span.set_attribute("notebook.path", path);
        call_span.set_attribute("notebook.timeout_ms", timeout.as_millis() as u64);

        let result = match encode_context(&call_span.span_context()) {
            Ok(token) => {
                arguments.insert(TRACE_CONTEXT_PARAM.to_string(), token);
                self.runner
                    .run(path, timeout, arguments)
                    .await
                    .map_err(RelayError::from)
            }
            Err(e) => Err(RelayError::from(e)),
        };

        match &result {
            Ok(_) => call_span.set_ok(),
            Err(e) => {
                call_span.record_error(e);
                notebook_span.record_error(e);
            }
        }
        result
    }
}
