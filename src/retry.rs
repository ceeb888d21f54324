use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::EtlConfig;
use crate::error::EtlError;

pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub rate_limit_delay: Duration,
    pub failure_threshold: u32,
    pub cooldown: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_secs(10),
            rate_limit_delay: Duration::from_millis(600),
            failure_threshold: 3,
            cooldown: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &EtlConfig) -> Self {
        Self {
            max_attempts: config.max_retries,
            backoff_base: config.backoff_base,
            rate_limit_delay: config.rate_limit_delay,
            failure_threshold: config.failure_threshold,
            cooldown: config.cooldown,
        }
    }

    /// Delay after failed attempt `attempt` (1-based): base, 2x base, 4x base...
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(factor)
    }
}

#[derive(Debug, Default)]
struct Throttle {
    consecutive_failures: u32,
}

/// Shared gate in front of every upstream call.
///
/// All workers go through one instance, so the inter-call delay and the
/// consecutive-failure breaker apply to the process as a whole.
pub struct RetryController {
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    throttle: Mutex<Throttle>,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_sleeper(policy, Arc::new(ThreadSleeper))
    }

    pub fn with_sleeper(policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        Self {
            policy,
            sleeper,
            throttle: Mutex::new(Throttle::default()),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.throttle().consecutive_failures
    }

    // A worker that panicked mid-call leaves the counter itself consistent.
    fn throttle(&self) -> MutexGuard<'_, Throttle> {
        match self.throttle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Runs `op` up to `max_attempts` times. Errors that are not retryable
    /// are returned as-is on the first occurrence.
    pub fn with_retry<T>(
        &self,
        label: &str,
        mut op: impl FnMut() -> Result<T, EtlError>,
    ) -> Result<T, EtlError> {
        let max_attempts = self.policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            self.before_call(label);
            match op() {
                Ok(value) => {
                    self.record_success();
                    return Ok(value);
                }
                Err(err) if !err.is_retryable() => return Err(err),
                Err(err) => {
                    self.record_failure();
                    if attempt >= max_attempts {
                        warn!(label, attempts = attempt, error = %err, "giving up");
                        return Err(EtlError::ExhaustedRetries {
                            label: label.to_string(),
                            attempts: attempt,
                            last: err.to_string(),
                        });
                    }
                    let wait = self.policy.backoff_delay(attempt);
                    warn!(
                        label,
                        attempt,
                        max_attempts,
                        wait_secs = wait.as_secs_f64(),
                        error = %err,
                        "call failed, backing off"
                    );
                    self.sleeper.sleep(wait);
                }
            }
        }
    }

    // The lock is held across both sleeps so concurrent workers queue up
    // behind the cooldown and stay spaced by the rate-limit delay.
    fn before_call(&self, label: &str) {
        let mut throttle = self.throttle();
        if self.policy.failure_threshold > 0
            && throttle.consecutive_failures >= self.policy.failure_threshold
        {
            warn!(
                label,
                failures = throttle.consecutive_failures,
                cooldown_secs = self.policy.cooldown.as_secs(),
                "too many consecutive failures, cooling down"
            );
            self.sleeper.sleep(self.policy.cooldown);
            throttle.consecutive_failures = 0;
        }
        debug!(label, "rate limit pause");
        self.sleeper.sleep(self.policy.rate_limit_delay);
    }

    fn record_success(&self) {
        self.throttle().consecutive_failures = 0;
    }

    fn record_failure(&self) {
        self.throttle().consecutive_failures += 1;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::{RetryController, RetryPolicy, Sleeper};
    use crate::error::EtlError;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl Recorder {
        fn push(&self, event: String) {
            self.events.lock().unwrap().push(event);
        }

        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl Sleeper for Recorder {
        fn sleep(&self, duration: Duration) {
            self.push(format!("sleep {}", duration.as_millis()));
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_base: Duration::from_millis(10),
            rate_limit_delay: Duration::from_millis(1),
            failure_threshold: 3,
            cooldown: Duration::from_millis(5000),
        }
    }

    fn transient() -> EtlError {
        EtlError::Transient {
            endpoint: "leaguedashptstats".to_string(),
            message: "timed out".to_string(),
        }
    }

    #[test]
    fn cooldown_precedes_fourth_attempt_after_three_failures() {
        let recorder = Arc::new(Recorder::default());
        let controller = RetryController::with_sleeper(policy(4), recorder.clone());
        let mut calls = 0;
        let result = controller.with_retry("leaguedashptstats", || {
            calls += 1;
            recorder.push(format!("call {calls}"));
            if calls <= 3 { Err(transient()) } else { Ok(calls) }
        });
        assert_eq!(result, Ok(4));

        let events = recorder.events();
        let cooldown = events.iter().position(|e| e == "sleep 5000").expect("cooldown ran");
        let third = events.iter().position(|e| e == "call 3").unwrap();
        let fourth = events.iter().position(|e| e == "call 4").unwrap();
        assert!(third < cooldown && cooldown < fourth);
        assert_eq!(events.iter().filter(|e| *e == "sleep 5000").count(), 1);
        assert_eq!(controller.consecutive_failures(), 0);
    }

    #[test]
    fn failures_carry_over_between_calls() {
        let recorder = Arc::new(Recorder::default());
        let controller = RetryController::with_sleeper(policy(2), recorder.clone());
        let first: Result<(), _> = controller.with_retry("a", || Err(transient()));
        assert!(matches!(first, Err(EtlError::ExhaustedRetries { attempts: 2, .. })));
        assert_eq!(controller.consecutive_failures(), 2);

        let second: Result<(), _> = controller.with_retry("b", || Err(transient()));
        assert!(second.is_err());
        assert!(recorder.events().iter().any(|e| e == "sleep 5000"));
    }

    #[test]
    fn failure_count_survives_a_panicked_worker() {
        let controller = Arc::new(RetryController::with_sleeper(
            policy(1),
            Arc::new(Recorder::default()),
        ));
        let worker = controller.clone();
        let joined = std::thread::spawn(move || {
            let _guard = worker.throttle.lock().unwrap();
            panic!("worker died holding the throttle");
        })
        .join();
        assert!(joined.is_err());
        assert!(controller.throttle.is_poisoned());

        let first: Result<(), _> = controller.with_retry("a", || Err(transient()));
        assert!(first.is_err());
        assert_eq!(controller.consecutive_failures(), 1);
        let second = controller.with_retry("b", || Ok(7));
        assert_eq!(second, Ok(7));
        assert_eq!(controller.consecutive_failures(), 0);
    }

    #[test]
    fn backoff_grows_and_rejections_are_not_retried() {
        let p = policy(3);
        assert_eq!(p.backoff_delay(1), Duration::from_millis(10));
        assert_eq!(p.backoff_delay(2), Duration::from_millis(20));
        assert_eq!(p.backoff_delay(3), Duration::from_millis(40));

        let controller = RetryController::with_sleeper(p, Arc::new(Recorder::default()));
        let mut calls = 0;
        let result: Result<(), _> = controller.with_retry("playerdashptshots", || {
            calls += 1;
            Err(EtlError::Rejected {
                endpoint: "playerdashptshots".to_string(),
                status: 400,
                message: "bad".to_string(),
            })
        });
        assert_eq!(calls, 1);
        assert!(matches!(result, Err(EtlError::Rejected { .. })));
    }
}
