//! Trace Context 传播器
//! Trace Context Propagator
//!
//! 实现 W3C Trace Context 传播格式，以及在参数通道中传输的载体
//! Implements the W3C Trace Context propagation format and the carrier that
//! travels through a string-valued parameter channel

use super::context::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};
use crate::error::PropagationError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// 文本映射载体 - 用于传播追踪上下文
/// Text map carrier - Used for propagating trace context
pub trait TextMapCarrier {
    fn get(&self, key: &str) -> Option<&str>;
    fn set(&mut self, key: &str, value: String);
    fn keys(&self) -> Vec<&str>;
}

impl TextMapCarrier for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        HashMap::get(self, key).map(|s| s.as_str())
    }

    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), value);
    }

    fn keys(&self) -> Vec<&str> {
        HashMap::keys(self).map(|s| s.as_str()).collect()
    }
}

/// 载体 - 追踪上下文的可序列化映射
/// Carrier - Serializable mapping representation of a trace context
///
/// Keys are kept ordered so the JSON form of a given context is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Carrier(BTreeMap<String, String>);

impl Carrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// 编码为 JSON 字符串
    /// Encode as a JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.0)
    }

    /// 从 JSON 字符串解码
    /// Decode from a JSON string
    pub fn from_json(json: &str) -> Result<Self, PropagationError> {
        Ok(Self(serde_json::from_str(json)?))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl TextMapCarrier for Carrier {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|s| s.as_str())
    }

    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key.to_string(), value);
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(|s| s.as_str()).collect()
    }
}

/// Trace 传播器 trait
/// Trace Propagator trait
pub trait TracePropagator: Send + Sync {
    /// 从载体中提取 SpanContext
    /// Extract SpanContext from the carrier
    fn extract(&self, carrier: &dyn TextMapCarrier) -> Option<SpanContext>;

    /// 将 SpanContext 注入到载体中
    /// Inject SpanContext into the carrier
    fn inject(&self, span_context: &SpanContext, carrier: &mut dyn TextMapCarrier);

    /// 获取传播器使用的字段名称
    /// Get field names used by the propagator
    fn fields(&self) -> &[&str];
}

/// W3C Trace Context 传播器
/// W3C Trace Context Propagator
///
/// - traceparent: 包含 version, trace-id, parent-id, trace-flags
/// - traceparent: contains version, trace-id, parent-id, trace-flags
/// - tracestate: 供应商特定的追踪数据
/// - tracestate: vendor-specific tracing data
#[derive(Debug, Clone, Copy, Default)]
pub struct W3CTraceContextPropagator;

impl W3CTraceContextPropagator {
    pub const TRACEPARENT: &'static str = "traceparent";
    pub const TRACESTATE: &'static str = "tracestate";
    /// 输出使用的版本号
    /// Version emitted on injection
    pub const VERSION: &'static str = "00";
    const INVALID_VERSION: &'static str = "ff";

    pub fn new() -> Self {
        Self
    }

    /// 提取并报告失败原因
    /// Extract, reporting why extraction failed
    pub fn extract_checked(
        &self,
        carrier: &dyn TextMapCarrier,
    ) -> Result<SpanContext, PropagationError> {
        let traceparent = carrier
            .get(Self::TRACEPARENT)
            .ok_or(PropagationError::MissingField(Self::TRACEPARENT))?;
        let (trace_id, span_id, trace_flags) = Self::parse_traceparent(traceparent)?;

        let trace_state = carrier
            .get(Self::TRACESTATE)
            .map(TraceState::from_header)
            .unwrap_or_default();

        Ok(SpanContext::new(trace_id, span_id, trace_flags, true).with_trace_state(trace_state))
    }

    /// 解析 traceparent
    /// Parse traceparent
    fn parse_traceparent(value: &str) -> Result<(TraceId, SpanId, TraceFlags), PropagationError> {
        let parts: Vec<&str> = value.trim().split('-').collect();
        if parts.len() < 4 {
            return Err(invalid(
                Self::TRACEPARENT,
                format!("expected 4 fields, got {}", parts.len()),
            ));
        }

        let version = parts[0];
        if version.len() != 2 || !is_lower_hex(version) {
            return Err(invalid("version", format!("{version:?} is not two hex digits")));
        }
        if version == Self::INVALID_VERSION {
            return Err(invalid("version", "version ff is forbidden".to_string()));
        }
        // 更高版本可以追加字段，00 版本不行
        // Later versions may append fields, version 00 may not
        if version == Self::VERSION && parts.len() != 4 {
            return Err(invalid(
                Self::TRACEPARENT,
                "version 00 has exactly 4 fields".to_string(),
            ));
        }

        let trace_id = TraceId::from_hex(parts[1])?;
        if !trace_id.is_valid() {
            return Err(invalid("trace-id", "all zeroes".to_string()));
        }
        let span_id = SpanId::from_hex(parts[2])?;
        if !span_id.is_valid() {
            return Err(invalid("parent-id", "all zeroes".to_string()));
        }

        let flags = parts[3];
        if flags.len() != 2 || !is_lower_hex(flags) {
            return Err(invalid("trace-flags", format!("{flags:?} is not two hex digits")));
        }
        let flags = u8::from_str_radix(flags, 16)
            .map_err(|e| invalid("trace-flags", e.to_string()))?;

        Ok((trace_id, span_id, TraceFlags::new(flags)))
    }

    /// 格式化 traceparent
    /// Format traceparent
    fn format_traceparent(trace_id: &TraceId, span_id: &SpanId, flags: &TraceFlags) -> String {
        format!(
            "{}-{}-{}-{:02x}",
            Self::VERSION,
            trace_id.to_hex(),
            span_id.to_hex(),
            flags.as_u8()
        )
    }
}

fn invalid(field: &'static str, reason: String) -> PropagationError {
    PropagationError::InvalidField { field, reason }
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

impl TracePropagator for W3CTraceContextPropagator {
    fn extract(&self, carrier: &dyn TextMapCarrier) -> Option<SpanContext> {
        self.extract_checked(carrier).ok()
    }

    fn inject(&self, span_context: &SpanContext, carrier: &mut dyn TextMapCarrier) {
        if !span_context.is_valid() {
            return;
        }

        let traceparent = Self::format_traceparent(
            &span_context.trace_id,
            &span_context.span_id,
            &span_context.trace_flags,
        );
        carrier.set(Self::TRACEPARENT, traceparent);

        if !span_context.trace_state.is_empty() {
            carrier.set(Self::TRACESTATE, span_context.trace_state.to_header());
        }
    }

    fn fields(&self) -> &[&str] {
        &[Self::TRACEPARENT, Self::TRACESTATE]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_context() -> SpanContext {
        SpanContext::new(
            TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").unwrap(),
            SpanId::from_hex("b7ad6b7169203331").unwrap(),
            TraceFlags::SAMPLED,
            false,
        )
    }

    fn carrier_with(traceparent: &str) -> Carrier {
        let mut carrier = Carrier::new();
        carrier.set(W3CTraceContextPropagator::TRACEPARENT, traceparent.to_string());
        carrier
    }

    #[test]
    fn test_w3c_propagator_inject_extract() {
        let propagator = W3CTraceContextPropagator::new();
        let span_context = sample_context();

        let mut carrier = Carrier::new();
        propagator.inject(&span_context, &mut carrier);

        assert_eq!(
            carrier.get(W3CTraceContextPropagator::TRACEPARENT),
            Some("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01")
        );
        assert!(carrier.get(W3CTraceContextPropagator::TRACESTATE).is_none());

        let extracted = propagator.extract(&carrier).unwrap();
        assert_eq!(extracted.trace_id, span_context.trace_id);
        assert_eq!(extracted.span_id, span_context.span_id);
        assert!(extracted.is_sampled());
        assert!(extracted.is_remote);
    }

    #[test]
    fn test_tracestate_travels_with_context() {
        let propagator = W3CTraceContextPropagator::new();
        let mut state = TraceState::new();
        state.insert("congo", "t61rcWkgMzE");
        let span_context = sample_context().with_trace_state(state);

        let mut carrier: HashMap<String, String> = HashMap::new();
        propagator.inject(&span_context, &mut carrier);
        assert_eq!(carrier["tracestate"], "congo=t61rcWkgMzE");

        let extracted = propagator.extract(&carrier).unwrap();
        assert_eq!(extracted.trace_state.get("congo"), Some("t61rcWkgMzE"));
    }

    #[test]
    fn test_inject_skips_invalid_context() {
        let mut carrier = Carrier::new();
        W3CTraceContextPropagator::new().inject(&SpanContext::invalid(), &mut carrier);
        assert!(carrier.is_empty());
    }

    #[test]
    fn test_unsampled_flag_round_trips() {
        let propagator = W3CTraceContextPropagator::new();
        let carrier = carrier_with("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-00");
        let extracted = propagator.extract(&carrier).unwrap();
        assert!(!extracted.is_sampled());
    }

    #[test]
    fn test_rejects_malformed_traceparent() {
        let propagator = W3CTraceContextPropagator::new();
        let bad = [
            "",
            "garbage",
            "ff-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
            "00-00000000000000000000000000000000-b7ad6b7169203331-01",
            "00-0af7651916cd43dd8448eb211c80319c-0000000000000000-01",
            "00-0AF7651916CD43DD8448EB211C80319C-b7ad6b7169203331-01",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-1",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01-extra",
            "0-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
        ];
        for value in bad {
            assert!(
                propagator.extract(&carrier_with(value)).is_none(),
                "accepted {value:?}"
            );
        }
    }

    #[test]
    fn test_accepts_future_version_with_extra_fields() {
        let propagator = W3CTraceContextPropagator::new();
        let carrier = carrier_with("cc-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01-what");
        let extracted = propagator.extract(&carrier).unwrap();
        assert_eq!(extracted.span_id.to_hex(), "b7ad6b7169203331");
    }

    #[test]
    fn test_missing_traceparent_is_reported() {
        let err = W3CTraceContextPropagator::new()
            .extract_checked(&Carrier::new())
            .unwrap_err();
        assert!(matches!(err, PropagationError::MissingField("traceparent")));
    }

    #[test]
    fn test_carrier_json() {
        let carrier = carrier_with("00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01");
        let json = carrier.to_json().unwrap();
        assert_eq!(
            json,
            r#"{"traceparent":"00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"}"#
        );
        assert_eq!(Carrier::from_json(&json).unwrap(), carrier);

        assert!(Carrier::from_json("not json").is_err());
        assert!(Carrier::from_json(r#"{"traceparent": 7}"#).is_err());
        assert!(Carrier::from_json(r#"["traceparent"]"#).is_err());
    }
}
