use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    /// When set the relay keeps records in Redis, otherwise in process memory.
    pub redis_url: Option<String>,
    pub offer_ttl_seconds: u64,
    pub answer_ttl_seconds: u64,
    pub sweep_interval_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind: env::var("DUET_RELAY_BIND").unwrap_or(defaults.bind),
            port: parse_var("DUET_RELAY_PORT").unwrap_or(defaults.port),
            redis_url: env::var("REDIS_URL")
                .ok()
                .filter(|url| !url.trim().is_empty()),
            offer_ttl_seconds: parse_var("DUET_OFFER_TTL")
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.offer_ttl_seconds),
            answer_ttl_seconds: parse_var("DUET_ANSWER_TTL")
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.answer_ttl_seconds),
            sweep_interval_seconds: parse_var("DUET_SWEEP_INTERVAL")
                .filter(|secs| *secs > 0)
                .unwrap_or(defaults.sweep_interval_seconds),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn offer_ttl(&self) -> Duration {
        Duration::from_secs(self.offer_ttl_seconds)
    }

    pub fn answer_ttl(&self) -> Duration {
        Duration::from_secs(self.answer_ttl_seconds)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_seconds)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
            redis_url: None,
            offer_ttl_seconds: 300,
            answer_ttl_seconds: 60,
            sweep_interval_seconds: 60,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.trim().parse().ok())
}
