mod background;
mod otel;

#[cfg(feature = "otlp")]
pub mod otlp_grpc;
#[cfg(feature = "stdout")]
pub mod stdout;

pub use background::BackgroundExporter;
pub use otel::OtelBridgeExporter;

use crate::span::FinishedSpan;
use std::sync::{Arc, Mutex};

/// Receives every finished, sampled span.
///
/// `emit` is fire-and-forget: it must not block and must not fail the caller.
pub trait SpanExporter: Send + Sync {
    fn emit(&self, span: FinishedSpan);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopExporter;

impl SpanExporter for NoopExporter {
    fn emit(&self, _span: FinishedSpan) {}
}

/// Keeps finished spans in memory. Clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct InMemoryExporter {
    spans: Arc<Mutex<Vec<FinishedSpan>>>,
}

impl InMemoryExporter {
    pub fn finished(&self) -> Vec<FinishedSpan> {
        match self.spans.lock() {
            Ok(spans) => spans.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn reset(&self) {
        match self.spans.lock() {
            Ok(mut spans) => spans.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }
}

impl SpanExporter for InMemoryExporter {
    fn emit(&self, span: FinishedSpan) {
        match self.spans.lock() {
            Ok(mut spans) => spans.push(span),
            Err(poisoned) => poisoned.into_inner().push(span),
        }
    }
}
