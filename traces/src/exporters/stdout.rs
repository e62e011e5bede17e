use crate::errors::TracesError;
use opentelemetry::global;
use opentelemetry_sdk::trace::{Config, TracerProvider};
use tracing::debug;

pub fn install(trace_configs: Config) -> Result<(), TracesError> {
    let exporter = opentelemetry_stdout::SpanExporter::default();

    let provider = TracerProvider::builder()
        .with_config(trace_configs)
        .with_simple_exporter(exporter)
        .build();

    global::set_tracer_provider(provider);

    debug!("traces::install stdout tracer installed");

    Ok(())
}
