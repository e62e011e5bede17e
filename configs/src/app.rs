use crate::Environment;

/// Process identity and logging knobs.
#[derive(Debug, Clone)]
pub struct AppConfigs {
    /// Connection and tracer name, prefixed with the environment by the
    /// builder. Default: relay-worker
    pub name: String,
    pub env: Environment,
    /// Host name reported by the worker. Default: 0.0.0.0
    pub host: String,
    /// Default: 31033
    pub port: u64,
    /// One of trace, debug, info, warn or error. Default: debug
    pub log_level: String,
    /// Lifts the WARN cap on lapin, tonic and friends.
    pub enable_external_creates_logging: bool,
}

impl Default for AppConfigs {
    fn default() -> Self {
        Self {
            name: "relay-worker".to_owned(),
            env: Environment::Local,
            host: "0.0.0.0".to_owned(),
            port: 31033,
            log_level: "debug".to_owned(),
            enable_external_creates_logging: false,
        }
    }
}
