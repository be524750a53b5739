//! Configuration for the replication controller.

use rand::Rng;
use std::time::Duration;

/// Tuning for a [`ReplicationController`](crate::ReplicationController).
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Delay between `_active_tasks` polls while the replication runs.
    pub poll_interval: Duration,
    /// Backoff applied to the poll delay after consecutive poll failures.
    pub poll_backoff: RetryConfig,
    /// Polls a task may be missing from the server list before it has
    /// ever been seen, without being declared gone.
    pub appearance_grace_polls: u32,
    /// Timeout applied to each submitted request.
    pub request_timeout: Duration,
    /// Timeout for the start request of a one-shot replication, which some
    /// servers hold open until the replication finishes. `None` waits
    /// indefinitely.
    pub one_shot_start_timeout: Option<Duration>,
    /// Capacity of the controller's command mailbox.
    pub command_buffer: usize,
}

impl ControllerConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            poll_backoff: RetryConfig::default(),
            appearance_grace_polls: 3,
            request_timeout: Duration::from_secs(30),
            one_shot_start_timeout: None,
            command_buffer: 64,
        }
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the poll backoff.
    pub fn with_poll_backoff(mut self, backoff: RetryConfig) -> Self {
        self.poll_backoff = backoff;
        self
    }

    /// Sets the appearance grace.
    pub fn with_appearance_grace_polls(mut self, polls: u32) -> Self {
        self.appearance_grace_polls = polls;
        self
    }

    /// Sets the request timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the one-shot start timeout.
    pub fn with_one_shot_start_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.one_shot_start_timeout = timeout;
        self
    }

    /// Sets the command mailbox capacity.
    pub fn with_command_buffer(mut self, capacity: usize) -> Self {
        self.command_buffer = capacity.max(1);
        self
    }

    /// Delay before the next poll, given the number of consecutive failures.
    pub fn next_poll_delay(&self, failures: u32) -> Duration {
        self.poll_interval
            .max(self.poll_backoff.delay_for_attempt(failures))
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a new retry configuration.
    pub fn new() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration that never backs off.
    pub fn no_backoff() -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.add_jitter = false;
        self
    }

    /// Calculates the delay for a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let base_delay = self.initial_delay.as_secs_f64()
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1).min(i32::MAX as u32) as i32);

        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controller_config_builder() {
        let config = ControllerConfig::new()
            .with_poll_interval(Duration::from_millis(250))
            .with_appearance_grace_polls(5)
            .with_request_timeout(Duration::from_secs(5))
            .with_one_shot_start_timeout(Some(Duration::from_secs(600)))
            .with_command_buffer(0);

        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.appearance_grace_polls, 5);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.one_shot_start_timeout, Some(Duration::from_secs(600)));
        assert_eq!(config.command_buffer, 1);
        assert_eq!(ControllerConfig::default().one_shot_start_timeout, None);
    }

    #[test]
    fn retry_delay_calculation() {
        let config = RetryConfig::new()
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_multiplier(2.0);

        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);

        // Jitter makes exact values unpredictable, but bounds hold
        let delay1 = config.delay_for_attempt(1);
        assert!(delay1 >= Duration::from_millis(100));
        assert!(delay1 <= Duration::from_millis(125));

        let delay2 = config.delay_for_attempt(2);
        assert!(delay2 >= Duration::from_millis(200));
    }

    #[test]
    fn retry_delay_respects_max() {
        let config = RetryConfig::new()
            .with_initial_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_backoff_multiplier(10.0);

        let delay = config.delay_for_attempt(5);
        assert!(delay <= Duration::from_millis(6250)); // 5s + 25% jitter
    }

    #[test]
    fn poll_delay_never_below_interval() {
        let config = ControllerConfig::new()
            .with_poll_interval(Duration::from_secs(2))
            .with_poll_backoff(
                RetryConfig::new()
                    .with_initial_delay(Duration::from_secs(1))
                    .without_jitter(),
            );

        assert_eq!(config.next_poll_delay(0), Duration::from_secs(2));
        assert_eq!(config.next_poll_delay(1), Duration::from_secs(2));
        assert_eq!(config.next_poll_delay(3), Duration::from_secs(4));
        assert_eq!(
            ControllerConfig::new()
                .with_poll_backoff(RetryConfig::no_backoff())
                .next_poll_delay(10),
            Duration::from_secs(1)
        );
    }
}
