use crate::errors::TracesError;
use configs::{Configs, DynamicConfigs};
use opentelemetry_otlp::{Protocol, WithExportConfig};
use opentelemetry_sdk::{runtime, trace::Config};
use std::time::Duration;
use tonic::metadata::{Ascii, MetadataKey, MetadataMap, MetadataValue};
use tracing::{debug, error};

const DEFAULT_ACCESS_KEY_HEADER: &str = "api-key";

pub fn install<T>(cfg: &Configs<T>, trace_configs: Config) -> Result<(), TracesError>
where
    T: DynamicConfigs,
{
    let key = match cfg.trace.header_access_key.parse::<MetadataKey<Ascii>>() {
        Ok(key) => key,
        Err(_) => {
            error!(
                header = cfg.trace.header_access_key,
                "failure to convert cfg.trace.header_access_key, using the default header"
            );
            MetadataKey::from_static(DEFAULT_ACCESS_KEY_HEADER)
        }
    };

    let value = match cfg.trace.access_key.parse::<MetadataValue<Ascii>>() {
        Ok(value) => Ok(value),
        Err(_) => {
            error!("failure to convert cfg.trace.access_key");
            Err(TracesError::InvalidAccessKey)
        }
    }?;

    let mut map = MetadataMap::with_capacity(1);
    map.insert(key, value);

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(&cfg.trace.host)
        .with_protocol(Protocol::Grpc)
        .with_timeout(Duration::from_secs(cfg.trace.export_timeout))
        .with_metadata(map);

    match opentelemetry_otlp::new_pipeline()
        .tracing()
        .with_trace_config(trace_configs)
        .with_exporter(exporter)
        .install_batch(runtime::Tokio)
    {
        Err(err) => {
            error!(error = err.to_string(), "failure to install otlp tracing");
            Err(TracesError::ExporterProviderError(err.to_string()))
        }
        _ => {
            debug!("traces::install otlp tracer installed");
            Ok(())
        }
    }
}
