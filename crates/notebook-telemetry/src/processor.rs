//! Span 处理器
//! Span processors
//!
//! 在 span 结束后把数据交给导出器
//! Hand finished spans to an exporter

use super::exporter::SpanExporter;
use super::span::SpanData;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::error;

/// Span 处理器 trait
/// Span processor trait
pub trait SpanProcessor: Send + Sync {
    /// Span 结束时调用
    /// Called when a Span ends
    fn on_end(&self, span: SpanData);
    fn force_flush(&self) -> Result<(), String>;
    fn shutdown(&self) -> Result<(), String>;
}

/// 简单 Span 处理器 - 直接导出
/// Simple Span Processor - Export directly
pub struct SimpleSpanProcessor {
    exporter: Arc<dyn SpanExporter>,
}

impl SimpleSpanProcessor {
    pub fn new(exporter: Arc<dyn SpanExporter>) -> Self {
        Self { exporter }
    }
}

impl SpanProcessor for SimpleSpanProcessor {
    fn on_end(&self, span: SpanData) {
        if let Err(e) = self.exporter.export(vec![span]) {
            error!("Failed to export span: {}", e);
        }
    }

    fn force_flush(&self) -> Result<(), String> {
        self.exporter.force_flush()
    }

    fn shutdown(&self) -> Result<(), String> {
        self.exporter.shutdown()
    }
}

struct BatchState {
    buffer: Vec<SpanData>,
    last_export: Instant,
    dropped: u64,
}

/// 批处理 Span 处理器
/// Batch Span Processor
///
/// Exports when `batch_size` spans are queued or when the export interval
/// has elapsed since the last export. Spans beyond `max_queue_size` are
/// dropped.
pub struct BatchSpanProcessor {
    exporter: Arc<dyn SpanExporter>,
    state: Mutex<BatchState>,
    batch_size: usize,
    max_queue_size: usize,
    export_interval: Duration,
}

impl BatchSpanProcessor {
    pub fn new(
        exporter: Arc<dyn SpanExporter>,
        batch_size: usize,
        max_queue_size: usize,
        export_interval: Duration,
    ) -> Self {
        Self {
            exporter,
            state: Mutex::new(BatchState {
                buffer: Vec::new(),
                last_export: Instant::now(),
                dropped: 0,
            }),
            batch_size: batch_size.max(1),
            max_queue_size: max_queue_size.max(1),
            export_interval,
        }
    }

    pub fn queued(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }

    fn drain(&self) -> Vec<SpanData> {
        let mut state = self.state.lock();
        state.last_export = Instant::now();
        std::mem::take(&mut state.buffer)
    }

    fn export(&self, spans: Vec<SpanData>) -> Result<(), String> {
        if spans.is_empty() {
            return Ok(());
        }
        self.exporter.export(spans)
    }
}

impl SpanProcessor for BatchSpanProcessor {
    fn on_end(&self, span: SpanData) {
        let to_export = {
            let mut state = self.state.lock();
            if state.buffer.len() < self.max_queue_size {
                state.buffer.push(span);
            } else {
                state.dropped += 1;
            }

            let due = state.buffer.len() >= self.batch_size
                || state.last_export.elapsed() >= self.export_interval;
            if due {
                state.last_export = Instant::now();
                Some(std::mem::take(&mut state.buffer))
            } else {
                None
            }
        };

        if let Some(spans) = to_export {
            if let Err(e) = self.export(spans) {
                error!("Failed to export spans: {}", e);
            }
        }
    }

    fn force_flush(&self) -> Result<(), String> {
        self.export(self.drain())?;
        self.exporter.force_flush()
    }

    fn shutdown(&self) -> Result<(), String> {
        self.force_flush()?;
        self.exporter.shutdown()
    }
}

impl Drop for BatchSpanProcessor {
    fn drop(&mut self) {
        // spans still queued when the last owner goes away
        if let Err(e) = self.export(self.drain()) {
            error!("Failed to export spans on drop: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{SpanContext, SpanId, TraceFlags, TraceId};
    use crate::exporter::InMemoryExporter;
    use crate::span::{SpanKind, SpanStatus};
    use chrono::Utc;
    use std::collections::HashMap;

    fn span_data() -> SpanData {
        SpanData {
            span_context: SpanContext::new(TraceId::new(), SpanId::new(), TraceFlags::SAMPLED, false),
            parent_span_context: None,
            name: "op".to_string(),
            kind: SpanKind::Internal,
            start_time: Utc::now(),
            end_time: Some(Utc::now()),
            status: SpanStatus::Unset,
            attributes: HashMap::new(),
            events: Vec::new(),
            service_name: "svc".to_string(),
        }
    }

    #[test]
    fn test_simple_processor_exports_immediately() {
        let exporter = InMemoryExporter::new();
        let processor = SimpleSpanProcessor::new(Arc::new(exporter.clone()));
        processor.on_end(span_data());
        assert_eq!(exporter.finished_spans().len(), 1);
    }

    #[test]
    fn test_batch_processor_exports_full_batches() {
        let exporter = InMemoryExporter::new();
        let processor = BatchSpanProcessor::new(
            Arc::new(exporter.clone()),
            3,
            10,
            Duration::from_secs(3600),
        );

        processor.on_end(span_data());
        processor.on_end(span_data());
        assert!(exporter.finished_spans().is_empty());
        assert_eq!(processor.queued(), 2);

        processor.on_end(span_data());
        assert_eq!(exporter.finished_spans().len(), 3);
        assert_eq!(processor.queued(), 0);
    }

    #[test]
    fn test_batch_processor_exports_when_interval_elapsed() {
        let exporter = InMemoryExporter::new();
        let processor =
            BatchSpanProcessor::new(Arc::new(exporter.clone()), 100, 100, Duration::ZERO);
        processor.on_end(span_data());
        assert_eq!(exporter.finished_spans().len(), 1);
    }

    #[test]
    fn test_batch_processor_flush_and_drop() {
        let exporter = InMemoryExporter::new();
        let processor = BatchSpanProcessor::new(
            Arc::new(exporter.clone()),
            100,
            2,
            Duration::from_secs(3600),
        );
        for _ in 0..4 {
            processor.on_end(span_data());
        }
        assert_eq!(processor.dropped(), 2);

        processor.shutdown().unwrap();
        assert_eq!(exporter.finished_spans().len(), 2);
    }

    #[test]
    fn test_batch_processor_exports_queued_spans_on_drop() {
        let exporter = InMemoryExporter::new();
        let processor = BatchSpanProcessor::new(
            Arc::new(exporter.clone()),
            100,
            100,
            Duration::from_secs(3600),
        );
        processor.on_end(span_data());
        processor.on_end(span_data());
        assert!(exporter.finished_spans().is_empty());

        drop(processor);
        assert_eq!(exporter.finished_spans().len(), 2);
    }
}
