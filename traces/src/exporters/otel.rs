use super::SpanExporter;
use crate::span::FinishedSpan;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{
        Span, SpanBuilder, SpanContext, TraceContextExt, TraceFlags, TraceState, Tracer,
    },
    Context,
};

/// Replays finished relay spans into the installed OpenTelemetry pipeline,
/// keeping their ids, parent, timestamps, attributes and status.
pub struct OtelBridgeExporter {
    tracer: BoxedTracer,
}

impl OtelBridgeExporter {
    pub fn new(name: &'static str) -> OtelBridgeExporter {
        OtelBridgeExporter {
            tracer: global::tracer(name),
        }
    }
}

impl SpanExporter for OtelBridgeExporter {
    fn emit(&self, span: FinishedSpan) {
        let parent_cx = match span.parent_span_id {
            Some(parent_span_id) => Context::new().with_remote_span_context(SpanContext::new(
                span.trace_id,
                parent_span_id,
                TraceFlags::SAMPLED,
                true,
                TraceState::default(),
            )),
            None => Context::new(),
        };

        let builder = SpanBuilder::from_name(span.name)
            .with_kind(span.kind)
            .with_trace_id(span.trace_id)
            .with_span_id(span.span_id)
            .with_start_time(span.start_time)
            .with_attributes(span.attributes);

        let mut otel_span = self.tracer.build_with_context(builder, &parent_cx);
        otel_span.set_status(span.status);
        otel_span.end_with_timestamp(span.end_time);
    }
}
