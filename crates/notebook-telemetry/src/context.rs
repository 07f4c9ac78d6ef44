//! Trace Context 定义
//! Trace Context Definition
//!
//! 实现 W3C Trace Context 标准中的标识符，以及执行期内的活动上下文
//! Identifiers from the W3C Trace Context standard, plus the active context
//! of a single execution

use crate::error::PropagationError;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Trace ID - 16字节 (128位)
/// Trace ID - 16 bytes (128 bits)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceId([u8; 16]);

impl TraceId {
    /// 无效的 Trace ID
    /// Invalid Trace ID
    pub const INVALID: TraceId = TraceId([0u8; 16]);

    /// 创建新的随机 Trace ID
    /// Create a new random Trace ID
    pub fn new() -> Self {
        let mut bytes = [0u8; 16];
        // all-zero is the invalid id, so redraw until we get something else
        while bytes.iter().all(|&b| b == 0) {
            rand::thread_rng().fill(&mut bytes);
        }
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// 从十六进制字符串创建
    /// Create from a hexadecimal string
    pub fn from_hex(hex: &str) -> Result<Self, PropagationError> {
        let mut arr = [0u8; 16];
        decode_fixed(hex, &mut arr, "trace-id")?;
        Ok(Self(arr))
    }

    /// 转换为十六进制字符串
    /// Convert to a hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// 是否有效（非全零）
    /// Whether it is valid (not all zeros)
    pub fn is_valid(&self) -> bool {
        self.0.iter().any(|&b| b != 0)
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({})", self.to_hex())
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for TraceId {
    type Err = PropagationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// Span ID - 8字节 (64位)
/// Span ID - 8 bytes (64 bits)
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanId([u8; 8]);

impl SpanId {
    /// 无效的 Span ID
    /// Invalid Span ID
    pub const INVALID: SpanId = SpanId([0u8; 8]);

    /// 创建新的随机 Span ID
    /// Create a new random Span ID
    pub fn new() -> Self {
        let mut bytes = [0u8; 8];
        while bytes.iter().all(|&b| b == 0) {
            rand::thread_rng().fill(&mut bytes);
        }
        Self(bytes)
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }

    /// 从十六进制字符串创建
    /// Create from a hexadecimal string
    pub fn from_hex(hex: &str) -> Result<Self, PropagationError> {
        let mut arr = [0u8; 8];
        decode_fixed(hex, &mut arr, "parent-id")?;
        Ok(Self(arr))
    }

    /// 转换为十六进制字符串
    /// Convert to a hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 8] {
        &self.0
    }

    /// 是否有效（非全零）
    /// Whether it is valid (not all zeros)
    pub fn is_valid(&self) -> bool {
        self.0.iter().any(|&b| b != 0)
    }
}

impl Default for SpanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SpanId({})", self.to_hex())
    }
}

impl fmt::Display for SpanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for SpanId {
    type Err = PropagationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

/// W3C only allows lowercase hex in ids.
fn decode_fixed(hex: &str, out: &mut [u8], field: &'static str) -> Result<(), PropagationError> {
    if hex.len() != out.len() * 2 {
        return Err(PropagationError::InvalidField {
            field,
            reason: format!("expected {} hex characters, got {}", out.len() * 2, hex.len()),
        });
    }
    if hex.bytes().any(|b| b.is_ascii_uppercase()) {
        return Err(PropagationError::InvalidField {
            field,
            reason: "uppercase hex is not allowed".to_string(),
        });
    }
    hex::decode_to_slice(hex, out).map_err(|e| PropagationError::InvalidField {
        field,
        reason: e.to_string(),
    })
}

/// Trace Flags - 采样标志
/// Trace Flags - Sampling flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceFlags(u8);

impl TraceFlags {
    /// 已采样标志
    /// Sampled flag
    pub const SAMPLED: TraceFlags = TraceFlags(0x01);
    /// 无标志
    /// No flags
    pub const NONE: TraceFlags = TraceFlags(0x00);

    pub fn new(flags: u8) -> Self {
        Self(flags)
    }

    /// 是否已采样
    /// Whether it is sampled
    pub fn is_sampled(&self) -> bool {
        self.0 & 0x01 != 0
    }

    pub fn with_sampled(mut self, sampled: bool) -> Self {
        if sampled {
            self.0 |= 0x01;
        } else {
            self.0 &= !0x01;
        }
        self
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }
}

impl Default for TraceFlags {
    fn default() -> Self {
        Self::SAMPLED
    }
}

impl fmt::Display for TraceFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}", self.0)
    }
}

/// Trace State - 供应商特定的追踪数据
/// Trace State - Vendor-specific tracing data
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceState {
    entries: Vec<(String, String)>,
}

impl TraceState {
    /// W3C 限制的最大条目数
    /// Maximum number of list members allowed by W3C
    pub const MAX_ENTRIES: usize = 32;

    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// 添加条目，新条目位于最前
    /// Add an entry; the newest entry goes first
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        self.entries.retain(|(k, _)| k != &key);
        self.entries.insert(0, (key, value.into()));
        self.entries.truncate(Self::MAX_ENTRIES);
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn remove(&mut self, key: &str) {
        self.entries.retain(|(k, _)| k != key);
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 转换为 header 格式字符串
    /// Convert to header format string
    pub fn to_header(&self) -> String {
        self.entries
            .iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// 从 header 格式字符串解析
    /// Parse from header format string
    pub fn from_header(header: &str) -> Self {
        let entries = header
            .split(',')
            .filter_map(|part| {
                let (key, value) = part.split_once('=')?;
                let key = key.trim();
                if key.is_empty() {
                    None
                } else {
                    Some((key.to_string(), value.trim().to_string()))
                }
            })
            .take(Self::MAX_ENTRIES)
            .collect();
        Self { entries }
    }
}

/// Span Context - Span 的不可变上下文信息
/// Span Context - Immutable context information of a Span
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub trace_flags: TraceFlags,
    pub trace_state: TraceState,
    /// 是否远程（从其他执行传播过来）
    /// Whether it is remote (propagated from another execution)
    pub is_remote: bool,
}

impl SpanContext {
    pub fn new(
        trace_id: TraceId,
        span_id: SpanId,
        trace_flags: TraceFlags,
        is_remote: bool,
    ) -> Self {
        Self {
            trace_id,
            span_id,
            trace_flags,
            trace_state: TraceState::new(),
            is_remote,
        }
    }

    /// 创建无效的 SpanContext
    /// Create an invalid SpanContext
    pub fn invalid() -> Self {
        Self::new(TraceId::INVALID, SpanId::INVALID, TraceFlags::NONE, false)
    }

    pub fn is_valid(&self) -> bool {
        self.trace_id.is_valid() && self.span_id.is_valid()
    }

    pub fn is_sampled(&self) -> bool {
        self.trace_flags.is_sampled()
    }

    pub fn with_trace_state(mut self, trace_state: TraceState) -> Self {
        self.trace_state = trace_state;
        self
    }
}

impl Default for SpanContext {
    fn default() -> Self {
        Self::invalid()
    }
}

/// 继承上下文的状态
/// State of the inherited context
///
/// `NoInheritedContext` is the initial state. Once a context has been
/// inherited the state never changes again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextState {
    NoInheritedContext,
    Inherited(SpanContext),
}

/// 活动上下文 - 一次执行中当前生效的 SpanContext
/// Active context - the SpanContext in effect for one execution
///
/// Holds the stack of currently open spans plus the context inherited from
/// a parent execution, if any. The innermost open span wins; otherwise the
/// inherited context is current.
#[derive(Debug, Default)]
pub struct ActiveContext {
    frames: Mutex<Vec<SpanContext>>,
    inherited: OnceLock<SpanContext>,
}

impl ActiveContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取当前上下文
    /// Get the current context
    pub fn current(&self) -> Option<SpanContext> {
        self.frames
            .lock()
            .last()
            .cloned()
            .or_else(|| self.inherited.get().cloned())
    }

    /// 附加继承的上下文；只有第一次有效的附加会生效
    /// Attach an inherited context; only the first valid attach takes effect
    pub fn attach(&self, context: SpanContext) -> bool {
        if !context.is_valid() {
            return false;
        }
        self.inherited.set(context).is_ok()
    }

    pub fn state(&self) -> ContextState {
        match self.inherited.get() {
            Some(ctx) => ContextState::Inherited(ctx.clone()),
            None => ContextState::NoInheritedContext,
        }
    }

    /// 当前打开的 span 数量
    /// Number of currently open spans
    pub fn depth(&self) -> usize {
        self.frames.lock().len()
    }

    pub(crate) fn push(&self, context: SpanContext) {
        self.frames.lock().push(context);
    }

    /// Guards normally drop in reverse order, but a guard moved out of its
    /// scope may not, so remove by id rather than popping blindly.
    pub(crate) fn remove(&self, span_id: SpanId) {
        let mut frames = self.frames.lock();
        if let Some(pos) = frames.iter().rposition(|c| c.span_id == span_id) {
            frames.remove(pos);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trace_id() {
        let id = TraceId::new();
        assert!(id.is_valid());
        assert_eq!(id.to_hex().len(), 32);

        let parsed = TraceId::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);

        assert!(!TraceId::INVALID.is_valid());
    }

    #[test]
    fn test_span_id() {
        let id = SpanId::new();
        assert!(id.is_valid());
        assert_eq!(id.to_hex().len(), 16);

        let parsed: SpanId = id.to_hex().parse().unwrap();
        assert_eq!(id, parsed);

        assert!(!SpanId::INVALID.is_valid());
    }

    #[test]
    fn test_id_rejects_bad_hex() {
        assert!(TraceId::from_hex("0af7651916cd43dd8448eb211c80319").is_err());
        assert!(TraceId::from_hex("0AF7651916CD43DD8448EB211C80319C").is_err());
        assert!(SpanId::from_hex("b7ad6b716920333z").is_err());
    }

    #[test]
    fn test_trace_flags() {
        assert!(TraceFlags::SAMPLED.is_sampled());
        assert!(!TraceFlags::NONE.is_sampled());
        assert!(TraceFlags::NONE.with_sampled(true).is_sampled());
        assert_eq!(TraceFlags::new(0x03).with_sampled(false).as_u8(), 0x02);
        assert_eq!(TraceFlags::SAMPLED.to_string(), "01");
    }

    #[test]
    fn test_trace_state() {
        let mut state = TraceState::new();
        state.insert("vendor1", "value1");
        state.insert("vendor2", "value2");

        assert_eq!(state.get("vendor1"), Some("value1"));
        assert_eq!(state.get("vendor3"), None);
        assert_eq!(state.to_header(), "vendor2=value2,vendor1=value1");

        let parsed = TraceState::from_header("a=1, =skipped,novalue,b=2");
        assert_eq!(parsed.entries().len(), 2);
        assert_eq!(parsed.get("b"), Some("2"));
    }

    #[test]
    fn test_trace_state_is_capped() {
        let header = (0..40)
            .map(|i| format!("k{i}=v"))
            .collect::<Vec<_>>()
            .join(",");
        assert_eq!(
            TraceState::from_header(&header).entries().len(),
            TraceState::MAX_ENTRIES
        );
    }

    #[test]
    fn test_active_context_stack_and_inherited() {
        let active = ActiveContext::new();
        assert_eq!(active.state(), ContextState::NoInheritedContext);
        assert!(active.current().is_none());

        let inherited = SpanContext::new(TraceId::new(), SpanId::new(), TraceFlags::SAMPLED, true);
        assert!(active.attach(inherited.clone()));
        assert_eq!(active.current(), Some(inherited.clone()));

        let local = SpanContext::new(inherited.trace_id, SpanId::new(), TraceFlags::SAMPLED, false);
        active.push(local.clone());
        assert_eq!(active.current(), Some(local.clone()));
        active.remove(local.span_id);
        assert_eq!(active.current(), Some(inherited.clone()));

        // terminal state
        let other = SpanContext::new(TraceId::new(), SpanId::new(), TraceFlags::SAMPLED, true);
        assert!(!active.attach(other));
        assert_eq!(active.state(), ContextState::Inherited(inherited));
    }

    #[test]
    fn test_attach_rejects_invalid_context() {
        let active = ActiveContext::new();
        assert!(!active.attach(SpanContext::invalid()));
        assert_eq!(active.state(), ContextState::NoInheritedContext);
    }
}
