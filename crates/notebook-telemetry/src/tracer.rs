//! Tracer
//!
//! 创建 span 并维护一次执行的活动上下文
//! Creates spans and owns the active context of one execution

use super::context::{ActiveContext, ContextState, SpanContext, SpanId, TraceId};
use super::processor::SpanProcessor;
use super::span::{ActiveSpan, Span, SpanKind};
use std::sync::Arc;
use tracing::debug;

/// 采样策略
/// Sampling strategy
#[derive(Debug, Clone, PartialEq)]
pub enum SamplingStrategy {
    /// 始终采样
    /// Always sample
    AlwaysOn,
    /// 从不采样
    /// Never sample
    AlwaysOff,
    /// 按概率采样
    /// Probabilistic sampling
    Probabilistic(f64),
    /// 有父级时跟随父级，否则使用 root
    /// Follow the parent when there is one, otherwise use `root`
    ParentBased { root: Box<SamplingStrategy> },
}

impl Default for SamplingStrategy {
    fn default() -> Self {
        SamplingStrategy::ParentBased {
            root: Box::new(SamplingStrategy::AlwaysOn),
        }
    }
}

impl SamplingStrategy {
    /// 判断是否应该采样
    /// Determine if sampling should occur
    pub fn should_sample(&self, parent_context: Option<&SpanContext>, trace_id: &TraceId) -> bool {
        match self {
            SamplingStrategy::AlwaysOn => true,
            SamplingStrategy::AlwaysOff => false,
            SamplingStrategy::Probabilistic(probability) => {
                // same trace id, same decision
                let hash = trace_id
                    .as_bytes()
                    .iter()
                    .fold(0u64, |acc, &b| acc.wrapping_mul(31).wrapping_add(b as u64));
                (hash as f64 / u64::MAX as f64) < *probability
            }
            SamplingStrategy::ParentBased { root } => match parent_context {
                Some(parent) => parent.is_sampled(),
                None => root.should_sample(None, trace_id),
            },
        }
    }
}

/// Tracer 配置
/// Tracer configuration
#[derive(Debug, Clone)]
pub struct TracerConfig {
    pub service_name: String,
    pub service_version: Option<String>,
    pub sampling_strategy: SamplingStrategy,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown-service".to_string(),
            service_version: None,
            sampling_strategy: SamplingStrategy::default(),
        }
    }
}

impl TracerConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.service_version = Some(version.into());
        self
    }

    pub fn with_sampling_strategy(mut self, strategy: SamplingStrategy) -> Self {
        self.sampling_strategy = strategy;
        self
    }
}

struct TracerInner {
    config: TracerConfig,
    processor: Arc<dyn SpanProcessor>,
    active: Arc<ActiveContext>,
}

/// Tracer - 追踪器
/// Tracer - Tracing component
///
/// One tracer per execution. Clones share the same active context, so a
/// tracer assumes a single logical flow of control.
#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

impl Tracer {
    pub fn new(config: TracerConfig, processor: Arc<dyn SpanProcessor>) -> Self {
        Self {
            inner: Arc::new(TracerInner {
                config,
                processor,
                active: Arc::new(ActiveContext::new()),
            }),
        }
    }

    /// 创建 Span，父级为当前上下文，但不设为当前
    /// Create a span parented to the current context without making it current
    pub fn start_span(&self, name: impl Into<String>) -> Span {
        let parent = self.current_context();
        self.start_span_with_parent(name, SpanKind::Internal, parent.as_ref())
    }

    /// 创建带类型和显式父级的 Span
    /// Create a span with an explicit kind and parent
    pub fn start_span_with_parent(
        &self,
        name: impl Into<String>,
        kind: SpanKind,
        parent: Option<&SpanContext>,
    ) -> Span {
        let name = name.into();
        let parent = parent.filter(|p| p.is_valid());
        let trace_id = parent.map(|p| p.trace_id).unwrap_or_else(TraceId::new);

        let should_sample = self
            .inner
            .config
            .sampling_strategy
            .should_sample(parent, &trace_id);
        let trace_flags = parent
            .map(|p| p.trace_flags)
            .unwrap_or_default()
            .with_sampled(should_sample);

        let mut span_context = SpanContext::new(trace_id, SpanId::new(), trace_flags, false);
        if let Some(p) = parent {
            span_context.trace_state = p.trace_state.clone();
        }

        debug!(
            span = %name,
            trace_id = %span_context.trace_id,
            span_id = %span_context.span_id,
            parent_id = ?parent.map(|p| p.span_id.to_hex()),
            sampled = should_sample,
            "span started"
        );

        if !should_sample {
            return Span::non_recording(name, span_context, parent.cloned());
        }

        Span::new(
            name,
            span_context,
            parent.cloned(),
            kind,
            &self.inner.config.service_name,
        )
    }

    /// 创建 Span 并设为当前上下文，guard 释放时结束
    /// Start a span and make it current until the returned guard is dropped
    pub fn start_as_current_span(&self, name: impl Into<String>) -> ActiveSpan {
        let span = self.start_span(name);
        ActiveSpan::new(
            span,
            self.inner.active.clone(),
            self.inner.processor.clone(),
        )
    }

    /// 在当前 Span 作用域内运行闭包
    /// Run a closure inside a current span
    pub fn in_span<T>(&self, name: impl Into<String>, f: impl FnOnce(&Span) -> T) -> T {
        let guard = self.start_as_current_span(name);
        f(guard.span())
    }

    /// 结束 Span 并导出
    /// End a span and export it
    pub fn end_span(&self, span: &Span) {
        if span.end() && span.is_recording() {
            self.inner.processor.on_end(span.data());
        }
    }

    /// 当前上下文：最内层的活动 span，否则为继承的上下文
    /// Current context: innermost active span, else the inherited context
    pub fn current_context(&self) -> Option<SpanContext> {
        self.inner.active.current()
    }

    /// 附加从父执行继承的上下文
    /// Attach the context inherited from a parent execution
    pub fn attach(&self, context: SpanContext) -> bool {
        let trace_id = context.trace_id;
        let attached = self.inner.active.attach(context);
        if attached {
            debug!(trace_id = %trace_id, "inherited trace context attached");
        }
        attached
    }

    pub fn context_state(&self) -> ContextState {
        self.inner.active.state()
    }

    pub fn service_name(&self) -> &str {
        &self.inner.config.service_name
    }

    pub fn force_flush(&self) -> Result<(), String> {
        self.inner.processor.force_flush()
    }

    pub fn shutdown(&self) -> Result<(), String> {
        self.inner.processor.shutdown()
    }
}
