//! Span 定义和管理
//!
//! 实现分布式追踪的 Span 概念，以及自动关闭的活动 Span

use super::context::{ActiveContext, SpanContext, SpanId, TraceId};
use super::processor::SpanProcessor;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Deref;
use std::sync::Arc;

/// Span 类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SpanKind {
    /// 内部操作
    #[default]
    Internal,
    /// 服务器端（处理请求）
    Server,
    /// 客户端（发起请求）
    Client,
}

impl std::fmt::Display for SpanKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpanKind::Internal => write!(f, "INTERNAL"),
            SpanKind::Server => write!(f, "SERVER"),
            SpanKind::Client => write!(f, "CLIENT"),
        }
    }
}

/// Span 状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SpanStatus {
    #[default]
    Unset,
    Ok,
    Error { message: String },
}

impl SpanStatus {
    pub fn is_error(&self) -> bool {
        matches!(self, SpanStatus::Error { .. })
    }
}

/// Span 属性值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SpanAttribute {
    String(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl From<&str> for SpanAttribute {
    fn from(v: &str) -> Self {
        SpanAttribute::String(v.to_string())
    }
}

impl From<String> for SpanAttribute {
    fn from(v: String) -> Self {
        SpanAttribute::String(v)
    }
}

impl From<i64> for SpanAttribute {
    fn from(v: i64) -> Self {
        SpanAttribute::Int(v)
    }
}

impl From<u64> for SpanAttribute {
    fn from(v: u64) -> Self {
        SpanAttribute::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for SpanAttribute {
    fn from(v: f64) -> Self {
        SpanAttribute::Float(v)
    }
}

impl From<bool> for SpanAttribute {
    fn from(v: bool) -> Self {
        SpanAttribute::Bool(v)
    }
}

/// Span 事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub attributes: HashMap<String, SpanAttribute>,
}

impl SpanEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            timestamp: Utc::now(),
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(
        mut self,
        key: impl Into<String>,
        value: impl Into<SpanAttribute>,
    ) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Span 数据（导出用）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanData {
    pub span_context: SpanContext,
    pub parent_span_context: Option<SpanContext>,
    pub name: String,
    pub kind: SpanKind,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: SpanStatus,
    pub attributes: HashMap<String, SpanAttribute>,
    pub events: Vec<SpanEvent>,
    pub service_name: String,
}

impl SpanData {
    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.parent_span_context.as_ref().map(|p| p.span_id)
    }

    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }
}

/// Span 内部状态
struct SpanInner {
    data: SpanData,
    is_recording: bool,
    is_ended: bool,
}

/// Span - 追踪的基本单元
#[derive(Clone)]
pub struct Span {
    inner: Arc<RwLock<SpanInner>>,
}

impl Span {
    pub(crate) fn new(
        name: impl Into<String>,
        span_context: SpanContext,
        parent_span_context: Option<SpanContext>,
        kind: SpanKind,
        service_name: impl Into<String>,
    ) -> Self {
        Self::with_recording(
            name,
            span_context,
            parent_span_context,
            kind,
            service_name,
            true,
        )
    }

    /// 创建非记录的 Span（用于未采样的情况）
    pub(crate) fn non_recording(
        name: impl Into<String>,
        span_context: SpanContext,
        parent_span_context: Option<SpanContext>,
    ) -> Self {
        Self::with_recording(
            name,
            span_context,
            parent_span_context,
            SpanKind::Internal,
            String::new(),
            false,
        )
    }

    fn with_recording(
        name: impl Into<String>,
        span_context: SpanContext,
        parent_span_context: Option<SpanContext>,
        kind: SpanKind,
        service_name: impl Into<String>,
        is_recording: bool,
    ) -> Self {
        let inner = SpanInner {
            data: SpanData {
                span_context,
                parent_span_context,
                name: name.into(),
                kind,
                start_time: Utc::now(),
                end_time: None,
                status: SpanStatus::Unset,
                attributes: HashMap::new(),
                events: Vec::new(),
                service_name: service_name.into(),
            },
            is_recording,
            is_ended: false,
        };
        Self {
            inner: Arc::new(RwLock::new(inner)),
        }
    }

    pub fn span_context(&self) -> SpanContext {
        self.inner.read().data.span_context.clone()
    }

    pub fn trace_id(&self) -> TraceId {
        self.inner.read().data.span_context.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.inner.read().data.span_context.span_id
    }

    pub fn name(&self) -> String {
        self.inner.read().data.name.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.inner.read().is_recording
    }

    pub fn is_ended(&self) -> bool {
        self.inner.read().is_ended
    }

    /// 在仍可修改时执行写操作
    fn update(&self, f: impl FnOnce(&mut SpanData)) {
        let mut inner = self.inner.write();
        if inner.is_recording && !inner.is_ended {
            f(&mut inner.data);
        }
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<SpanAttribute>) {
        let (key, value) = (key.into(), value.into());
        self.update(|data| {
            data.attributes.insert(key, value);
        });
    }

    pub fn add_event(&self, event: SpanEvent) {
        self.update(|data| data.events.push(event));
    }

    pub fn set_status(&self, status: SpanStatus) {
        self.update(|data| data.status = status);
    }

    pub fn set_ok(&self) {
        self.set_status(SpanStatus::Ok);
    }

    pub fn set_error(&self, message: impl Into<String>) {
        self.set_status(SpanStatus::Error {
            message: message.into(),
        });
    }

    /// 记录异常：添加 exception 事件并设置错误状态
    pub fn record_error<E: std::error::Error + ?Sized>(&self, error: &E) {
        let message = error.to_string();
        let event = SpanEvent::new("exception")
            .with_attribute("exception.type", std::any::type_name::<E>())
            .with_attribute("exception.message", message.clone());
        self.add_event(event);
        self.set_error(message);
    }

    /// 结束 Span；仅第一次调用返回 true
    pub fn end(&self) -> bool {
        let mut inner = self.inner.write();
        if inner.is_ended {
            return false;
        }
        inner.is_ended = true;
        inner.data.end_time = Some(Utc::now());
        true
    }

    /// 获取 Span 数据（用于导出）
    pub fn data(&self) -> SpanData {
        self.inner.read().data.clone()
    }
}

impl std::fmt::Debug for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Span")
            .field("name", &inner.data.name)
            .field("span_context", &inner.data.span_context)
            .field("is_recording", &inner.is_recording)
            .field("is_ended", &inner.is_ended)
            .finish()
    }
}

/// 活动 Span - 作用域结束时自动关闭
///
/// While the guard is alive its span is the current context of the tracer
/// that created it. Dropping the guard ends the span, on every exit path,
/// and hands it to the span processor.
#[must_use = "the span ends as soon as the guard is dropped"]
pub struct ActiveSpan {
    span: Span,
    active: Arc<ActiveContext>,
    processor: Arc<dyn SpanProcessor>,
}

impl ActiveSpan {
    pub(crate) fn new(
        span: Span,
        active: Arc<ActiveContext>,
        processor: Arc<dyn SpanProcessor>,
    ) -> Self {
        active.push(span.span_context());
        Self {
            span,
            active,
            processor,
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }
}

impl Deref for ActiveSpan {
    type Target = Span;

    fn deref(&self) -> &Span {
        &self.span
    }
}

impl Drop for ActiveSpan {
    fn drop(&mut self) {
        self.active.remove(self.span.span_id());
        if std::thread::panicking() {
            self.span.set_error("panicked");
        }
        if self.span.end() && self.span.is_recording() {
            self.processor.on_end(self.span.data());
        }
    }
}
