//! Tracing 导出器
//! Tracing Exporter
//!
//! 支持 Console 与内存导出
//! Supports console and in-memory export

use super::span::SpanData;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// 导出器配置
/// Exporter configuration
#[derive(Debug, Clone)]
pub struct ExporterConfig {
    pub service_name: String,
    /// 批量大小
    /// Batch size
    pub batch_size: usize,
    /// 导出间隔（毫秒）
    /// Export interval (milliseconds)
    pub export_interval_ms: u64,
    /// 最大队列大小
    /// Maximum queue size
    pub max_queue_size: usize,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown-service".to_string(),
            batch_size: 512,
            export_interval_ms: 15_000,
            max_queue_size: 2048,
        }
    }
}

impl ExporterConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_export_interval(mut self, interval_ms: u64) -> Self {
        self.export_interval_ms = interval_ms;
        self
    }

    pub fn export_interval(&self) -> Duration {
        Duration::from_millis(self.export_interval_ms)
    }

    pub fn with_max_queue_size(mut self, max_size: usize) -> Self {
        self.max_queue_size = max_size;
        self
    }
}

/// Span 导出器 trait
/// Span exporter trait
pub trait SpanExporter: Send + Sync {
    /// 导出 spans
    /// Export spans
    fn export(&self, spans: Vec<SpanData>) -> Result<(), String>;

    fn shutdown(&self) -> Result<(), String> {
        Ok(())
    }

    fn force_flush(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Console 导出器 - 通过日志输出
/// Console Exporter - Writes spans through the log
pub struct ConsoleExporter {
    config: ExporterConfig,
    json_format: bool,
    summary_only: bool,
}

impl ConsoleExporter {
    pub fn new(config: ExporterConfig) -> Self {
        Self {
            config,
            json_format: false,
            summary_only: false,
        }
    }

    pub fn with_json_format(mut self) -> Self {
        self.json_format = true;
        self
    }

    pub fn with_summary_only(mut self) -> Self {
        self.summary_only = true;
        self
    }

    fn format_span(&self, span: &SpanData) -> String {
        let duration = span.duration_ms().unwrap_or(0);
        if self.json_format {
            serde_json::to_string(span).unwrap_or_else(|_| format!("{:?}", span))
        } else if self.summary_only {
            format!(
                "[{}] {} | trace={} span={} | {}ms | {:?}",
                span.kind,
                span.name,
                span.span_context.trace_id,
                span.span_context.span_id,
                duration,
                span.status
            )
        } else {
            let parent = span
                .parent_span_id()
                .map(|p| p.to_hex())
                .unwrap_or_else(|| "none".to_string());

            format!(
                r#"
┌─ Span ─────────────────────────────────────────────────────
│ Name:      {}
│ Service:   {}
│ Kind:      {}
│ TraceId:   {}
│ SpanId:    {}
│ ParentId:  {}
│ Duration:  {}ms
│ Status:    {:?}
│ Attributes: {:?}
│ Events:    {} events
└────────────────────────────────────────────────────────────"#,
                span.name,
                span.service_name,
                span.kind,
                span.span_context.trace_id,
                span.span_context.span_id,
                parent,
                duration,
                span.status,
                span.attributes,
                span.events.len()
            )
        }
    }
}

impl SpanExporter for ConsoleExporter {
    fn export(&self, spans: Vec<SpanData>) -> Result<(), String> {
        for span in spans {
            info!(service = %self.config.service_name, "{}", self.format_span(&span));
        }
        Ok(())
    }

    fn shutdown(&self) -> Result<(), String> {
        info!("Console exporter shutdown");
        Ok(())
    }
}

/// 内存导出器 - 保存已结束的 spans 以供检查
/// In-memory exporter - Keeps finished spans for inspection
///
/// Clones share the same buffer.
#[derive(Clone, Default)]
pub struct InMemoryExporter {
    spans: Arc<Mutex<Vec<SpanData>>>,
}

impl InMemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn finished_spans(&self) -> Vec<SpanData> {
        self.spans.lock().clone()
    }

    /// 按名称查找最近结束的 span
    /// Find the most recently finished span with the given name
    pub fn find(&self, name: &str) -> Option<SpanData> {
        self.spans.lock().iter().rev().find(|s| s.name == name).cloned()
    }

    pub fn reset(&self) {
        self.spans.lock().clear();
    }
}

impl SpanExporter for InMemoryExporter {
    fn export(&self, spans: Vec<SpanData>) -> Result<(), String> {
        self.spans.lock().extend(spans);
        Ok(())
    }
}
