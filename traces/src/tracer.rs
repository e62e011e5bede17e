use crate::{
    exporters::{NoopExporter, SpanExporter},
    propagation::CausalContext,
    span::Span,
};
use opentelemetry::trace::{SpanKind, TraceId};
use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};
use std::{borrow::Cow, fmt, sync::Arc};

/// Explicit tracer handle given to publishers and consumers.
///
/// Sampling is parent based: a child always inherits its parent's decision
/// and a root span is kept when its trace id falls under `sample_ratio`.
#[derive(Clone)]
pub struct Tracer {
    name: Cow<'static, str>,
    exporter: Arc<dyn SpanExporter>,
    id_generator: Arc<dyn IdGenerator>,
    sample_ratio: f64,
}

impl Tracer {
    pub fn new<N>(name: N, exporter: Arc<dyn SpanExporter>) -> Tracer
    where
        N: Into<Cow<'static, str>>,
    {
        Tracer {
            name: name.into(),
            exporter,
            id_generator: Arc::new(RandomIdGenerator::default()),
            sample_ratio: 1.0,
        }
    }

    pub fn noop() -> Tracer {
        Tracer::new("noop", Arc::new(NoopExporter))
    }

    pub fn with_sample_ratio(mut self, ratio: f64) -> Self {
        self.sample_ratio = ratio;
        self
    }

    pub fn with_id_generator(mut self, id_generator: Arc<dyn IdGenerator>) -> Self {
        self.id_generator = id_generator;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Starts a root span.
    pub fn start<N>(&self, name: N, kind: SpanKind) -> Span
    where
        N: Into<Cow<'static, str>>,
    {
        self.start_with_parent(name, kind, None)
    }

    /// Starts a child of `parent`, or a root span when there is no valid parent.
    pub fn start_with_parent<N>(
        &self,
        name: N,
        kind: SpanKind,
        parent: Option<&CausalContext>,
    ) -> Span
    where
        N: Into<Cow<'static, str>>,
    {
        let span_id = self.id_generator.new_span_id();

        let (ctx, parent_span_id) = match parent.filter(|p| p.is_valid()) {
            Some(parent) => (
                CausalContext::new(parent.trace_id(), span_id, parent.is_sampled()),
                Some(parent.span_id()),
            ),
            None => {
                let trace_id = self.id_generator.new_trace_id();
                (
                    CausalContext::new(trace_id, span_id, self.should_sample(trace_id)),
                    None,
                )
            }
        };

        Span::start(
            ctx,
            parent_span_id,
            kind,
            name.into(),
            self.exporter.clone(),
        )
    }

    fn should_sample(&self, trace_id: TraceId) -> bool {
        if self.sample_ratio >= 1.0 {
            return true;
        }
        if self.sample_ratio <= 0.0 {
            return false;
        }

        let bytes = trace_id.to_bytes();
        let mut low = [0u8; 8];
        low.copy_from_slice(&bytes[8..]);

        let bound = (self.sample_ratio * (1u64 << 63) as f64) as u64;
        (u64::from_be_bytes(low) >> 1) < bound
    }
}

impl fmt::Debug for Tracer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tracer")
            .field("name", &self.name)
            .field("sample_ratio", &self.sample_ratio)
            .finish()
    }
}
