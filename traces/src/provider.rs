use crate::{
    errors::TracesError,
    exporters::{BackgroundExporter, NoopExporter, OtelBridgeExporter},
    tracer::Tracer,
};
use configs::{Configs, DynamicConfigs, Environment, TraceExporterKind};
use opentelemetry::{global, KeyValue};
use opentelemetry_sdk::{
    trace::{self, RandomIdGenerator, Sampler},
    Resource,
};
use std::{sync::Arc, vec};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

#[cfg(any(feature = "otlp", feature = "stdout"))]
use crate::exporters;

const BRIDGE_TRACER_NAME: &str = "relay";

/// Owns the export pipeline created by [`init`].
///
/// Hands out [`Tracer`]s and flushes everything on [`TraceExportHandle::shutdown`].
pub struct TraceExportHandle {
    tracer: Tracer,
    background: Option<(Arc<BackgroundExporter>, JoinHandle<()>)>,
}

impl TraceExportHandle {
    pub fn tracer(&self) -> Tracer {
        self.tracer.clone()
    }

    pub fn is_exporting(&self) -> bool {
        self.background.is_some()
    }

    pub async fn shutdown(self) {
        let Some((exporter, task)) = self.background else {
            return;
        };

        exporter.close();
        drop(self.tracer);

        if let Err(err) = task.await {
            warn!(error = err.to_string(), "span export task finished abnormally");
        }

        if let Err(err) = tokio::task::spawn_blocking(global::shutdown_tracer_provider).await {
            warn!(error = err.to_string(), "failure to shutdown the tracer provider");
        }

        debug!("traces::shutdown export pipeline flushed");
    }
}

/// Root spans are always kept in `Local`; elsewhere `export_rate_base` of them.
pub fn sample_ratio<T>(cfg: &Configs<T>) -> f64
where
    T: DynamicConfigs,
{
    if cfg.app.env == Environment::Local {
        return 1.0;
    }

    cfg.trace.export_rate_base.clamp(0.0, 1.0)
}

pub fn init<T>(cfg: &Configs<T>) -> Result<TraceExportHandle, TracesError>
where
    T: DynamicConfigs,
{
    let tracer_name = cfg.app.name.clone();

    if !cfg.trace.enable {
        debug!("traces::init skipping trace export setup");
        return Ok(TraceExportHandle {
            tracer: Tracer::new(tracer_name, Arc::new(NoopExporter))
                .with_sample_ratio(sample_ratio(cfg)),
            background: None,
        });
    }

    debug!("traces::init creating the tracer...");

    // sampling already happened when the relay span was opened
    let _trace_configs = trace::config()
        .with_sampler(Sampler::AlwaysOn)
        .with_id_generator(RandomIdGenerator::default())
        .with_max_events_per_span(64)
        .with_max_attributes_per_span(16)
        .with_resource(Resource::new(vec![
            KeyValue::new("service.name", cfg.app.name.clone()),
            KeyValue::new("service.type", cfg.trace.service_type.clone()),
            KeyValue::new("environment", format!("{}", cfg.app.env)),
            KeyValue::new("library.language", "rust"),
        ]));

    match cfg.trace.exporter {
        TraceExporterKind::Stdout => {
            #[cfg(feature = "stdout")]
            {
                exporters::stdout::install(_trace_configs)
            }

            #[cfg(not(feature = "stdout"))]
            {
                error!("stdout traces required to configure features = [stdout]");
                Err(TracesError::InvalidFeaturesError("stdout"))
            }
        }
        TraceExporterKind::OtlpGrpc => {
            #[cfg(feature = "otlp")]
            {
                exporters::otlp_grpc::install(cfg, _trace_configs)
            }

            #[cfg(not(feature = "otlp"))]
            {
                error!("otlp traces required to configure features = [otlp]");
                Err(TracesError::InvalidFeaturesError("otlp"))
            }
        }
    }?;

    let (exporter, task) =
        BackgroundExporter::spawn(Arc::new(OtelBridgeExporter::new(BRIDGE_TRACER_NAME)))?;

    Ok(TraceExportHandle {
        tracer: Tracer::new(tracer_name, exporter.clone()).with_sample_ratio(sample_ratio(cfg)),
        background: Some((exporter, task)),
    })
}
