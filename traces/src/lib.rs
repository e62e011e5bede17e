pub mod errors;
pub mod exporters;
pub mod propagation;
pub mod provider;
pub mod span;
pub mod tracer;

pub use propagation::{CausalContext, Headers};
pub use span::{FinishedSpan, Span};
pub use tracer::Tracer;

pub use opentelemetry::{
    trace::{SpanKind, Status},
    KeyValue,
};
