use crate::{
    env_keys::{
        APP_NAME_ENV_KEY, APP_PORT_ENV_KEY, ENABLE_EXTERNAL_CRATES_LOGGING_ENV_KEY,
        ENABLE_TRACES_ENV_KEY, HOST_NAME_ENV_KEY, LOG_LEVEL_ENV_KEY, OTLP_ACCESS_KEY_ENV_KEY,
        OTLP_EXPORTER_ENV_KEY, OTLP_EXPORT_RATE_BASE_ENV_KEY, OTLP_EXPORT_TIMEOUT_ENV_KEY,
        OTLP_HEADER_ACCESS_KEY_ENV_KEY, OTLP_HOST_ENV_KEY, OTLP_SERVICE_TYPE_ENV_KEY,
        RABBITMQ_HEALTH_CHECK_INTERVAL_ENV_KEY, RABBITMQ_HOST_ENV_KEY,
        RABBITMQ_MAX_RECONNECT_DELAY_ENV_KEY, RABBITMQ_PASSWORD_ENV_KEY, RABBITMQ_PORT_ENV_KEY,
        RABBITMQ_PREFETCH_COUNT_ENV_KEY, RABBITMQ_RECONNECT_DELAY_ENV_KEY,
        RABBITMQ_USER_ENV_KEY, RABBITMQ_VHOST_ENV_KEY,
    },
    errors::ConfigsError,
};
use configs::{AppConfigs, Configs, DynamicConfigs, Environment, TraceExporterKind};
use dotenvy::from_filename;
use std::{env, fmt::Display, str::FromStr};
use tracing::{debug, warn};

#[derive(Default)]
pub struct ConfigBuilder {
    amqp: bool,
    otlp: bool,
}

impl ConfigBuilder {
    pub fn new() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    pub fn amqp(mut self) -> Self {
        self.amqp = true;
        self
    }

    pub fn otlp(mut self) -> Self {
        self.otlp = true;
        self
    }

    /// Reads the dotenv file of the current `RUST_ENV`, installs the logger and
    /// fills every enabled section from the process environment.
    pub fn build<T>(&self) -> Result<Configs<T>, ConfigsError>
    where
        T: DynamicConfigs,
    {
        let env = Environment::from_rust_env();
        if from_filename(env.env_file()).is_err() {
            debug!(file = env.env_file(), "dotenv file not found, using process env");
        }

        let mut cfg = Configs::<T>::default();
        cfg.app = self.app_configs(env, |key| env::var(key).ok());

        logging::setup(&cfg.app).map_err(|_| ConfigsError::LoggingError)?;

        self.fill(&mut cfg, env::vars());
        cfg.dynamic.load();

        Ok(cfg)
    }
}

impl ConfigBuilder {
    fn fill<T, I>(&self, cfg: &mut Configs<T>, vars: I)
    where
        T: DynamicConfigs,
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            if self.fill_amqp(cfg, &key, &value) {
                continue;
            };
            self.fill_otlp(cfg, &key, &value);
        }
    }

    fn app_configs<F>(&self, env: Environment, var: F) -> AppConfigs
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = AppConfigs::default();

        AppConfigs {
            name: self.fmt_name(&env, var(APP_NAME_ENV_KEY).unwrap_or(defaults.name)),
            env,
            host: var(HOST_NAME_ENV_KEY).unwrap_or(defaults.host),
            port: parse_or(APP_PORT_ENV_KEY, var(APP_PORT_ENV_KEY), defaults.port),
            log_level: var(LOG_LEVEL_ENV_KEY).unwrap_or(defaults.log_level),
            enable_external_creates_logging: parse_or(
                ENABLE_EXTERNAL_CRATES_LOGGING_ENV_KEY,
                var(ENABLE_EXTERNAL_CRATES_LOGGING_ENV_KEY),
                defaults.enable_external_creates_logging,
            ),
        }
    }

    fn fill_amqp<T>(&self, cfg: &mut Configs<T>, key: &str, value: &str) -> bool
    where
        T: DynamicConfigs,
    {
        if !self.amqp {
            return false;
        }

        let value = Some(value.to_owned());
        let rabbitmq = &mut cfg.rabbitmq;
        match key {
            RABBITMQ_HOST_ENV_KEY => rabbitmq.host = parse_or(key, value, rabbitmq.host.clone()),
            RABBITMQ_PORT_ENV_KEY => rabbitmq.port = parse_or(key, value, rabbitmq.port),
            RABBITMQ_USER_ENV_KEY => rabbitmq.user = parse_or(key, value, rabbitmq.user.clone()),
            RABBITMQ_PASSWORD_ENV_KEY => {
                rabbitmq.password = parse_or(key, value, rabbitmq.password.clone())
            }
            RABBITMQ_VHOST_ENV_KEY => {
                rabbitmq.vhost = parse_or(key, value, rabbitmq.vhost.clone())
            }
            RABBITMQ_RECONNECT_DELAY_ENV_KEY => {
                rabbitmq.reconnect_delay_ms = parse_or(key, value, rabbitmq.reconnect_delay_ms)
            }
            RABBITMQ_MAX_RECONNECT_DELAY_ENV_KEY => {
                rabbitmq.max_reconnect_delay_ms =
                    parse_or(key, value, rabbitmq.max_reconnect_delay_ms)
            }
            RABBITMQ_HEALTH_CHECK_INTERVAL_ENV_KEY => {
                rabbitmq.health_check_interval_ms =
                    parse_or(key, value, rabbitmq.health_check_interval_ms)
            }
            RABBITMQ_PREFETCH_COUNT_ENV_KEY => {
                rabbitmq.prefetch_count = parse_or(key, value, rabbitmq.prefetch_count)
            }
            _ => return false,
        }

        true
    }

    fn fill_otlp<T>(&self, cfg: &mut Configs<T>, key: &str, value: &str) -> bool
    where
        T: DynamicConfigs,
    {
        if !self.otlp {
            return false;
        }

        let value = Some(value.to_owned());
        let trace = &mut cfg.trace;
        match key {
            ENABLE_TRACES_ENV_KEY => trace.enable = parse_or(key, value, trace.enable),
            OTLP_EXPORTER_ENV_KEY => {
                trace.exporter = parse_or(key, value, TraceExporterKind::default())
            }
            OTLP_HOST_ENV_KEY => trace.host = parse_or(key, value, trace.host.clone()),
            OTLP_HEADER_ACCESS_KEY_ENV_KEY => {
                trace.header_access_key = parse_or(key, value, trace.header_access_key.clone())
            }
            OTLP_ACCESS_KEY_ENV_KEY => {
                trace.access_key = parse_or(key, value, trace.access_key.clone())
            }
            OTLP_SERVICE_TYPE_ENV_KEY => {
                trace.service_type = parse_or(key, value, trace.service_type.clone())
            }
            OTLP_EXPORT_TIMEOUT_ENV_KEY => {
                trace.export_timeout = parse_or(key, value, trace.export_timeout)
            }
            OTLP_EXPORT_RATE_BASE_ENV_KEY => {
                trace.export_rate_base = parse_or(key, value, trace.export_rate_base)
            }
            _ => return false,
        }

        true
    }

    fn fmt_name(&self, env: &Environment, name: String) -> String {
        let env_str = env.to_string();
        if name.starts_with(&env_str) {
            return name;
        }

        format!("{}-{}", env_str, name)
    }
}

fn parse_or<T>(key: &str, value: Option<String>, default: T) -> T
where
    T: FromStr,
    T::Err: Display,
{
    let Some(value) = value else {
        return default;
    };

    value.parse().unwrap_or_else(|err: T::Err| {
        warn!(key = key, value = value, error = %err, "invalid config value, using default");
        default
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use configs::Empty;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn should_fill_amqp_configs() {
        let mut cfg = Configs::<Empty>::default();

        ConfigBuilder::new().amqp().fill(
            &mut cfg,
            vars(&[
                (RABBITMQ_HOST_ENV_KEY, "template_rabbitmq"),
                (RABBITMQ_PORT_ENV_KEY, "5673"),
                (RABBITMQ_PREFETCH_COUNT_ENV_KEY, "4"),
                (RABBITMQ_RECONNECT_DELAY_ENV_KEY, "2000"),
            ]),
        );

        assert_eq!(cfg.rabbitmq.host, "template_rabbitmq");
        assert_eq!(cfg.rabbitmq.port, 5673);
        assert_eq!(cfg.rabbitmq.prefetch_count, 4);
        assert_eq!(cfg.rabbitmq.reconnect_delay_ms, 2000);
    }

    #[test]
    fn should_ignore_disabled_sections() {
        let mut cfg = Configs::<Empty>::default();

        ConfigBuilder::new().fill(
            &mut cfg,
            vars(&[(RABBITMQ_HOST_ENV_KEY, "broker"), (ENABLE_TRACES_ENV_KEY, "true")]),
        );

        assert_eq!(cfg.rabbitmq.host, "localhost");
        assert!(!cfg.trace.enable);
    }

    #[test]
    fn should_fill_otlp_configs() {
        let mut cfg = Configs::<Empty>::default();

        ConfigBuilder::new().otlp().fill(
            &mut cfg,
            vars(&[
                (ENABLE_TRACES_ENV_KEY, "true"),
                (OTLP_EXPORTER_ENV_KEY, "otlp"),
                (OTLP_EXPORT_RATE_BASE_ENV_KEY, "0.5"),
            ]),
        );

        assert!(cfg.trace.enable);
        assert_eq!(cfg.trace.exporter, TraceExporterKind::OtlpGrpc);
        assert_eq!(cfg.trace.export_rate_base, 0.5);
    }

    #[test]
    fn should_fallback_to_default_when_value_is_invalid() {
        let mut cfg = Configs::<Empty>::default();

        ConfigBuilder::new().amqp().fill(
            &mut cfg,
            vars(&[
                (RABBITMQ_PORT_ENV_KEY, "not-a-port"),
                (RABBITMQ_PREFETCH_COUNT_ENV_KEY, "-1"),
            ]),
        );

        assert_eq!(cfg.rabbitmq.port, 5672);
        assert_eq!(cfg.rabbitmq.prefetch_count, 1);
    }

    #[test]
    fn should_build_app_configs() {
        let builder = ConfigBuilder::new();

        let app = builder.app_configs(Environment::Dev, |key| match key {
            APP_NAME_ENV_KEY => Some("service1".to_owned()),
            APP_PORT_ENV_KEY => Some("8080".to_owned()),
            _ => None,
        });

        assert_eq!(app.name, "development-service1");
        assert_eq!(app.port, 8080);
        assert_eq!(app.log_level, "debug");
        assert_eq!(app.env, Environment::Dev);
    }

    #[test]
    fn should_not_prefix_name_twice() {
        let builder = ConfigBuilder::new();

        assert_eq!(
            builder.fmt_name(&Environment::Local, "local-api".to_owned()),
            "local-api"
        );
    }
}
