use crate::application::retry::RetryPolicy;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Window after creation in which an intent must reach a terminal status.
    pub payment_timeout: Duration,
    /// How often the background sweeper looks for expired intents.
    pub sweep_interval: Duration,
    /// Backoff for transient approval/completion failures.
    pub retry: RetryPolicy,
    /// Buffer of the intent event broadcast channel.
    pub event_capacity: usize,
    /// How long a terminal intent's external id is remembered so late cancel/error
    /// callbacks are recognised as no-ops.
    pub retired_retention: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            payment_timeout: Duration::from_secs(300),
            sweep_interval: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            event_capacity: 256,
            retired_retention: Duration::from_secs(300),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.payment_timeout = Duration::from_secs(
            env_parse("PAYMENT_TIMEOUT_SECS").unwrap_or(cfg.payment_timeout.as_secs()),
        );
        cfg.retired_retention = cfg.payment_timeout;
        cfg.sweep_interval = Duration::from_secs(
            env_parse("PAYMENT_SWEEP_INTERVAL_SECS").unwrap_or(cfg.sweep_interval.as_secs()),
        );
        cfg.retry.max_retries = env_parse("PAYMENT_MAX_RETRIES").unwrap_or(cfg.retry.max_retries);
        cfg.retry.base_delay = Duration::from_millis(
            env_parse("PAYMENT_RETRY_BASE_DELAY_MS")
                .unwrap_or(cfg.retry.base_delay.as_millis() as u64),
        );
        cfg.retry.max_delay = Duration::from_millis(
            env_parse("PAYMENT_RETRY_MAX_DELAY_MS")
                .unwrap_or(cfg.retry.max_delay.as_millis() as u64),
        );
        cfg
    }

    pub fn with_payment_timeout(mut self, timeout: Duration) -> Self {
        self.payment_timeout = timeout;
        self.retired_retention = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}
