use crate::errors::LoggingError;
use configs::{AppConfigs, Environment};
use tracing::warn;
use tracing_bunyan_formatter::BunyanFormattingLayer;
use tracing_log::LogTracer;
use tracing_subscriber::{
    filter::{LevelFilter, Targets},
    fmt::{
        format::{Format, Pretty},
        Layer,
    },
    layer::SubscriberExt,
};

/// Crates that log every frame or poll at debug level.
const NOISY_TARGETS: [&str; 9] = [
    "lapin",
    "amq_protocol",
    "pinky_swear",
    "async_io",
    "polling",
    "tonic",
    "h2",
    "hyper",
    "tower",
];

pub fn setup(cfg: &AppConfigs) -> Result<(), LoggingError> {
    if let Err(err) = LogTracer::init() {
        warn!(
            error = err.to_string(),
            "failure to initialize log bridge, probably the log was already initialized"
        );
    }

    let target_filters = target_filters(cfg);

    let mut fmt_pretty: Option<Layer<_, Pretty, Format<Pretty>>> = None;
    let mut fmt_json = None;

    if cfg.env == Environment::Local {
        fmt_pretty = Some(Layer::new().pretty());
    } else {
        fmt_json = Some(BunyanFormattingLayer::new(
            cfg.name.to_owned(),
            std::io::stdout,
        ));
    }

    match tracing::subscriber::set_global_default(
        tracing_subscriber::registry()
            .with(fmt_json)
            .with(fmt_pretty)
            .with(target_filters),
    ) {
        Err(err) => {
            warn!(error = err.to_string(), "failure to set tracing subscribe");
            Err(LoggingError::SubscriberError(err.to_string()))
        }
        _ => Ok(()),
    }
}

fn target_filters(cfg: &AppConfigs) -> Targets {
    let level_filter = get_log_level_filter(cfg);

    let targets = Targets::new().with_default(level_filter);
    if cfg.enable_external_creates_logging {
        return targets;
    }

    NOISY_TARGETS
        .iter()
        .fold(targets, |targets, target| {
            targets.with_target(*target, LevelFilter::WARN)
        })
        .with_target("log", LevelFilter::WARN)
}

fn get_log_level_filter(cfg: &AppConfigs) -> LevelFilter {
    match cfg.log_level.to_lowercase().as_str() {
        "debug" => LevelFilter::DEBUG,
        "info" => LevelFilter::INFO,
        "warn" => LevelFilter::WARN,
        "error" => LevelFilter::ERROR,
        "trace" => LevelFilter::TRACE,
        _ => LevelFilter::OFF,
    }
}
