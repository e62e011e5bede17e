#[derive(Debug, Clone)]
pub struct RabbitMQConfigs {
    ///Default: localhost
    pub host: String,
    ///Default: 5672
    pub port: u64,
    ///Default: guest
    pub user: String,
    ///Default: guest
    pub password: String,
    ///Default: empty, the broker default vhost
    pub vhost: String,
    ///Default: 1000ms, never lower than 1s
    pub reconnect_delay_ms: u64,
    ///Default: 30000ms
    pub max_reconnect_delay_ms: u64,
    ///Default: 5000ms
    pub health_check_interval_ms: u64,
    ///Default: 1
    pub prefetch_count: u16,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 5672,
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            vhost: Default::default(),
            reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 30000,
            health_check_interval_ms: 5000,
            prefetch_count: 1,
        }
    }
}
