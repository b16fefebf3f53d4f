use std::env;
use std::time::Duration;

use tracing::warn;
use url::Url;

use crate::error::CallError;

pub const DEFAULT_STUN_URLS: [&str; 2] = [
    "stun:stun.l.google.com:19302",
    "stun:stun1.l.google.com:19302",
];

/// Client-side knobs for the negotiation protocol.
#[derive(Debug, Clone)]
pub struct CallConfig {
    pub relay_url: String,
    /// Page address used to build share links.
    pub base_url: String,
    /// How long local candidates are collected before the description is
    /// published.
    pub gather_window: Duration,
    pub poll_interval: Duration,
    pub max_poll_attempts: u32,
    pub control_open_delay: Duration,
    pub media_state_debounce: Duration,
    pub ice_servers: Vec<String>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            relay_url: "http://localhost:8080".to_string(),
            base_url: "http://localhost:3000".to_string(),
            gather_window: Duration::from_millis(1500),
            poll_interval: Duration::from_millis(5000),
            max_poll_attempts: 60,
            control_open_delay: Duration::from_millis(200),
            media_state_debounce: Duration::from_millis(50),
            ice_servers: DEFAULT_STUN_URLS.iter().map(|url| url.to_string()).collect(),
        }
    }
}

impl CallConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let ice_servers = if truthy("DUET_DISABLE_STUN") {
            Vec::new()
        } else {
            env::var("DUET_STUN_URLS")
                .ok()
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|url| !url.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or(defaults.ice_servers)
        };

        Self {
            relay_url: env::var("DUET_RELAY_URL").unwrap_or(defaults.relay_url),
            base_url: env::var("DUET_BASE_URL").unwrap_or(defaults.base_url),
            gather_window: millis_var("DUET_GATHER_MS").unwrap_or(defaults.gather_window),
            poll_interval: millis_var("DUET_POLL_INTERVAL_MS")
                .filter(|interval| !interval.is_zero())
                .unwrap_or(defaults.poll_interval),
            max_poll_attempts: env::var("DUET_MAX_POLL_ATTEMPTS")
                .ok()
                .and_then(|value| value.trim().parse().ok())
                .filter(|attempts| *attempts > 0)
                .unwrap_or(defaults.max_poll_attempts),
            control_open_delay: millis_var("DUET_CONTROL_OPEN_DELAY_MS")
                .unwrap_or(defaults.control_open_delay),
            media_state_debounce: millis_var("DUET_MEDIA_STATE_DEBOUNCE_MS")
                .unwrap_or(defaults.media_state_debounce),
            ice_servers,
        }
    }

    /// Upper bound on how long an initiator waits for an answer.
    pub fn answer_budget(&self) -> Duration {
        self.poll_interval * self.max_poll_attempts
    }

    pub fn share_base(&self) -> Result<Url, CallError> {
        Url::parse(&self.base_url)
            .map_err(|err| CallError::Validation(format!("invalid base url {}: {}", self.base_url, err)))
    }
}

fn millis_var(name: &str) -> Option<Duration> {
    let raw = env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            warn!(variable = name, value = %raw, "ignoring non-numeric duration");
            None
        }
    }
}

fn truthy(name: &str) -> bool {
    env::var(name)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}
