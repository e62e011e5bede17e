use crate::{exporters::SpanExporter, propagation::CausalContext};
use opentelemetry::{
    trace::{SpanId, SpanKind, Status, TraceId},
    KeyValue,
};
use std::{
    borrow::Cow,
    error::Error,
    fmt,
    sync::Arc,
    time::{Instant, SystemTime},
};

pub const EXCEPTION_TYPE_ATTRIBUTE: &str = "exception.type";
pub const EXCEPTION_MESSAGE_ATTRIBUTE: &str = "exception.message";

/// A span after it was closed, as handed to a [`SpanExporter`].
#[derive(Debug, Clone, PartialEq)]
pub struct FinishedSpan {
    pub trace_id: TraceId,
    pub span_id: SpanId,
    pub parent_span_id: Option<SpanId>,
    pub sampled: bool,
    pub kind: SpanKind,
    pub name: Cow<'static, str>,
    pub attributes: Vec<KeyValue>,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub status: Status,
}

/// An open span.
///
/// Closing consumes the span, so it can be neither closed twice nor mutated
/// afterwards. A span dropped without [`Span::end`] is closed by its `Drop`
/// impl, which keeps the "every opened span is emitted once" rule on early
/// returns and panics.
pub struct Span {
    ctx: CausalContext,
    parent_span_id: Option<SpanId>,
    kind: SpanKind,
    name: Cow<'static, str>,
    attributes: Vec<KeyValue>,
    start_time: SystemTime,
    started_at: Instant,
    status: Status,
    exporter: Arc<dyn SpanExporter>,
    ended: bool,
}

impl Span {
    pub(crate) fn start(
        ctx: CausalContext,
        parent_span_id: Option<SpanId>,
        kind: SpanKind,
        name: Cow<'static, str>,
        exporter: Arc<dyn SpanExporter>,
    ) -> Span {
        Span {
            ctx,
            parent_span_id,
            kind,
            name,
            attributes: vec![],
            start_time: SystemTime::now(),
            started_at: Instant::now(),
            status: Status::Unset,
            exporter,
            ended: false,
        }
    }

    pub fn context(&self) -> CausalContext {
        self.ctx
    }

    /// Hex trace id, handy for log fields.
    pub fn trace_id(&self) -> String {
        format!("{:032x}", self.ctx.trace_id())
    }

    pub fn span_id(&self) -> String {
        format!("{:016x}", self.ctx.span_id())
    }

    pub fn parent_span_id(&self) -> Option<SpanId> {
        self.parent_span_id
    }

    pub fn kind(&self) -> &SpanKind {
        &self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_sampled(&self) -> bool {
        self.ctx.is_sampled()
    }

    pub fn attributes(&self) -> &[KeyValue] {
        &self.attributes
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Sets an attribute. An existing key keeps its position and takes the
    /// new value.
    pub fn set_attribute(&mut self, attribute: KeyValue) {
        match self.attributes.iter_mut().find(|kv| kv.key == attribute.key) {
            Some(existing) => existing.value = attribute.value,
            None => self.attributes.push(attribute),
        }
    }

    pub fn set_attributes<I>(&mut self, attributes: I)
    where
        I: IntoIterator<Item = KeyValue>,
    {
        for attribute in attributes {
            self.set_attribute(attribute);
        }
    }

    /// `Ok` is final, `Error` overrides `Unset` and is only replaced by a
    /// later `Error`, and `Unset` never overrides anything.
    pub fn set_status(&mut self, status: Status) {
        match (&self.status, &status) {
            (Status::Ok, _) | (_, Status::Unset) | (Status::Error { .. }, Status::Ok) => {}
            _ => self.status = status,
        }
    }

    pub fn record_error<E>(&mut self, err: &E)
    where
        E: Error + ?Sized,
    {
        let message = err.to_string();

        self.set_attribute(KeyValue::new(
            EXCEPTION_TYPE_ATTRIBUTE,
            short_type_name::<E>(),
        ));
        self.set_attribute(KeyValue::new(EXCEPTION_MESSAGE_ATTRIBUTE, message.clone()));
        self.set_status(Status::error(message));
    }

    pub fn end(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;

        if !self.ctx.is_sampled() {
            return;
        }

        let end_time = self.start_time + self.started_at.elapsed();

        self.exporter.emit(FinishedSpan {
            trace_id: self.ctx.trace_id(),
            span_id: self.ctx.span_id(),
            parent_span_id: self.parent_span_id,
            sampled: self.ctx.is_sampled(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            attributes: std::mem::take(&mut self.attributes),
            start_time: self.start_time,
            end_time,
            status: std::mem::replace(&mut self.status, Status::Unset),
        });
    }
}

impl Drop for Span {
    fn drop(&mut self) {
        self.finish();
    }
}

impl fmt::Debug for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Span")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("trace_id", &self.trace_id())
            .field("span_id", &self.span_id())
            .field("parent_span_id", &self.parent_span_id)
            .field("status", &self.status)
            .finish()
    }
}

fn short_type_name<E: ?Sized>() -> String {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_owned()
}
