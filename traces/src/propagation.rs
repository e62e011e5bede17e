//! Causal trace context and its header codec.
//!
//! A context travels as three flat string headers:
//!
//! | key        | value                         |
//! |------------|-------------------------------|
//! | `trace_id` | 32 lowercase hex digits        |
//! | `span_id`  | 16 lowercase hex digits        |
//! | `sampled`  | `"1"` or `"0"`                 |
//!
//! Decoding never fails loudly: anything malformed yields `None`. When neither
//! `trace_id` nor `span_id` is present, a W3C `traceparent` header is accepted
//! as a fallback.

use opentelemetry::trace::{SpanId, TraceId};
use std::collections::HashMap;

pub const TRACE_ID_HEADER: &str = "trace_id";
pub const SPAN_ID_HEADER: &str = "span_id";
pub const SAMPLED_HEADER: &str = "sampled";
pub const TRACEPARENT_HEADER: &str = "traceparent";

const TRACE_ID_WIDTH: usize = 32;
const SPAN_ID_WIDTH: usize = 16;
const TRACEPARENT_VERSION: &str = "00";
const TRACEPARENT_SAMPLED_FLAG: u8 = 0x01;

pub type Headers = HashMap<String, String>;

/// Identifiers needed to link a new span to one started in another process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CausalContext {
    trace_id: TraceId,
    span_id: SpanId,
    sampled: bool,
}

impl CausalContext {
    pub fn new(trace_id: TraceId, span_id: SpanId, sampled: bool) -> Self {
        CausalContext {
            trace_id,
            span_id,
            sampled,
        }
    }

    pub fn trace_id(&self) -> TraceId {
        self.trace_id
    }

    pub fn span_id(&self) -> SpanId {
        self.span_id
    }

    pub fn is_sampled(&self) -> bool {
        self.sampled
    }

    pub fn is_valid(&self) -> bool {
        self.trace_id != TraceId::INVALID && self.span_id != SpanId::INVALID
    }
}

pub fn encode(ctx: &CausalContext) -> Headers {
    let mut headers = Headers::with_capacity(3);
    inject(ctx, &mut headers);
    headers
}

/// Writes the context into an existing header map, replacing any previous
/// trace headers.
pub fn inject(ctx: &CausalContext, headers: &mut Headers) {
    headers.insert(TRACE_ID_HEADER.to_owned(), format!("{:032x}", ctx.trace_id));
    headers.insert(SPAN_ID_HEADER.to_owned(), format!("{:016x}", ctx.span_id));
    headers.insert(
        SAMPLED_HEADER.to_owned(),
        if ctx.sampled { "1" } else { "0" }.to_owned(),
    );
}

pub fn decode(headers: &Headers) -> Option<CausalContext> {
    let trace_id = headers.get(TRACE_ID_HEADER);
    let span_id = headers.get(SPAN_ID_HEADER);

    if trace_id.is_none() && span_id.is_none() {
        return headers
            .get(TRACEPARENT_HEADER)
            .and_then(|value| decode_traceparent(value));
    }

    let trace_id = parse_trace_id(trace_id?)?;
    let span_id = parse_span_id(span_id?)?;
    let sampled = match headers.get(SAMPLED_HEADER) {
        Some(value) => parse_sampled(value)?,
        None => true,
    };

    Some(CausalContext::new(trace_id, span_id, sampled))
}

fn decode_traceparent(value: &str) -> Option<CausalContext> {
    let mut parts = value.trim().split('-');

    let (Some(version), Some(trace_id), Some(span_id), Some(flags), None) = (
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
        parts.next(),
    ) else {
        return None;
    };

    if version != TRACEPARENT_VERSION || flags.len() != 2 {
        return None;
    }

    let flags = u8::from_str_radix(flags, 16).ok()?;

    Some(CausalContext::new(
        parse_trace_id(trace_id)?,
        parse_span_id(span_id)?,
        flags & TRACEPARENT_SAMPLED_FLAG == TRACEPARENT_SAMPLED_FLAG,
    ))
}

fn parse_trace_id(value: &str) -> Option<TraceId> {
    if !is_hex_of_width(value, TRACE_ID_WIDTH) {
        return None;
    }

    TraceId::from_hex(value)
        .ok()
        .filter(|id| *id != TraceId::INVALID)
}

fn parse_span_id(value: &str) -> Option<SpanId> {
    if !is_hex_of_width(value, SPAN_ID_WIDTH) {
        return None;
    }

    SpanId::from_hex(value)
        .ok()
        .filter(|id| *id != SpanId::INVALID)
}

fn parse_sampled(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" => Some(true),
        "0" | "false" => Some(false),
        _ => None,
    }
}

fn is_hex_of_width(value: &str, width: usize) -> bool {
    value.len() == width && value.bytes().all(|b| b.is_ascii_hexdigit())
}
