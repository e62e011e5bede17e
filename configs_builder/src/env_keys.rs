pub const APP_NAME_ENV_KEY: &str = "APP_NAME";
pub const HOST_NAME_ENV_KEY: &str = "HOST_NAME";
pub const APP_PORT_ENV_KEY: &str = "APP_PORT";
pub const LOG_LEVEL_ENV_KEY: &str = "LOG_LEVEL";
pub const ENABLE_EXTERNAL_CRATES_LOGGING_ENV_KEY: &str = "ENABLE_EXTERNAL_CRATES_LOGGING";

pub const RABBITMQ_HOST_ENV_KEY: &str = "RABBITMQ_HOST";
pub const RABBITMQ_PORT_ENV_KEY: &str = "RABBITMQ_PORT";
pub const RABBITMQ_USER_ENV_KEY: &str = "RABBITMQ_USER";
pub const RABBITMQ_PASSWORD_ENV_KEY: &str = "RABBITMQ_PASSWORD";
pub const RABBITMQ_VHOST_ENV_KEY: &str = "RABBITMQ_VHOST";
pub const RABBITMQ_RECONNECT_DELAY_ENV_KEY: &str = "RABBITMQ_RECONNECT_DELAY_MS";
pub const RABBITMQ_MAX_RECONNECT_DELAY_ENV_KEY: &str = "RABBITMQ_MAX_RECONNECT_DELAY_MS";
pub const RABBITMQ_HEALTH_CHECK_INTERVAL_ENV_KEY: &str = "RABBITMQ_HEALTH_CHECK_INTERVAL_MS";
pub const RABBITMQ_PREFETCH_COUNT_ENV_KEY: &str = "RABBITMQ_PREFETCH_COUNT";

pub const ENABLE_TRACES_ENV_KEY: &str = "ENABLE_TRACES";
pub const OTLP_EXPORTER_ENV_KEY: &str = "OTLP_EXPORTER";
pub const OTLP_HOST_ENV_KEY: &str = "OTLP_HOST";
pub const OTLP_HEADER_ACCESS_KEY_ENV_KEY: &str = "OTLP_HEADER_ACCESS_KEY";
pub const OTLP_ACCESS_KEY_ENV_KEY: &str = "OTLP_ACCESS_KEY";
pub const OTLP_SERVICE_TYPE_ENV_KEY: &str = "OTLP_SERVICE_TYPE";
pub const OTLP_EXPORT_TIMEOUT_ENV_KEY: &str = "OTLP_EXPORT_TIMEOUT";
pub const OTLP_EXPORT_RATE_BASE_ENV_KEY: &str = "OTLP_EXPORT_RATE_BASE";
