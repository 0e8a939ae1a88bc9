use tokio::time::Duration;

/// Retry / health check policy for a [`TransportConnection`](crate::TransportConnection)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Connect attempts after the first one
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Minimum time between two health check pings
    pub health_check_interval: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
            health_check_interval: Duration::from_secs(30),
        }
    }
}

/// Delay before retry `attempt` (1-based):
/// `min(base_delay * backoff_factor^(attempt - 1), max_delay)`
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exponent = attempt.max(1) - 1;
    let exponent = i32::try_from(exponent).unwrap_or(i32::MAX);
    let secs = config.base_delay.as_secs_f64() * config.backoff_factor.powi(exponent);

    if !secs.is_finite() || secs >= config.max_delay.as_secs_f64() {
        return config.max_delay;
    }

    Duration::from_secs_f64(secs.max(0.0))
}
