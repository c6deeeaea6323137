//! Retry policies
//!
//! A [`RetryPolicy`] runs a fallible async operation until it succeeds, the
//! error is not retryable, or the attempt budget is spent. Delays between
//! attempts follow a [`RetryStrategy`] and are jittered symmetrically, then
//! clamped to `[0, max_delay]`.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{self, GatewayError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    Fixed,
    Linear,
    #[default]
    Exponential,
    Fibonacci,
}

impl fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RetryStrategy::Fixed => "fixed",
            RetryStrategy::Linear => "linear",
            RetryStrategy::Exponential => "exponential",
            RetryStrategy::Fibonacci => "fibonacci",
        })
    }
}

/// Backoff parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default)]
    pub strategy: RetryStrategy,

    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Growth factor for the exponential strategy
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Fraction of the delay added or removed at random (0.0 to 1.0)
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// Attempts in total, counting the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.1
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::default(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl RetryConfig {
    /// Many quick attempts
    pub fn aggressive() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            base_delay_ms: 50,
            max_delay_ms: 2_000,
            multiplier: 1.5,
            jitter: 0.2,
            max_attempts: 5,
        }
    }

    /// Few, widely spaced attempts
    pub fn conservative() -> Self {
        Self {
            strategy: RetryStrategy::Fibonacci,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.1,
            max_attempts: 2,
        }
    }

    /// No retries at all
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(GatewayError::Config("retry.max_attempts must be at least 1".into()).into());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(GatewayError::Config(format!(
                "retry.jitter must be between 0.0 and 1.0, got {}",
                self.jitter
            ))
            .into());
        }
        if self.multiplier < 1.0 {
            return Err(GatewayError::Config(format!(
                "retry.multiplier must be at least 1.0, got {}",
                self.multiplier
            ))
            .into());
        }
        if self.max_delay_ms < self.base_delay_ms {
            return Err(GatewayError::Config(
                "retry.max_delay_ms must not be below retry.base_delay_ms".into(),
            )
            .into());
        }
        Ok(())
    }
}

/// fib(0) = 1, fib(1) = 1, fib(2) = 2, ...
fn fibonacci(n: u32) -> u64 {
    let (mut a, mut b) = (1u64, 1u64);
    for _ in 0..n {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    a
}

/// Result of a retried operation, including the bookkeeping
#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T>,
    /// Attempts made, counting the first
    pub attempts: u32,
    /// Sum of the delays slept between attempts
    pub total_delay: Duration,
}

type RetryPredicate = Arc<dyn Fn(&anyhow::Error) -> bool + Send + Sync>;

/// A named backoff policy
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use toolgate::resilience::{RetryConfig, RetryPolicy, RetryStrategy};
///
/// let policy = RetryPolicy::new(
///     "demo",
///     RetryConfig {
///         strategy: RetryStrategy::Exponential,
///         base_delay_ms: 100,
///         max_delay_ms: 300,
///         multiplier: 2.0,
///         jitter: 0.0,
///         max_attempts: 4,
///     },
/// );
/// assert_eq!(policy.calculate_delay(0), Duration::from_millis(100));
/// assert_eq!(policy.calculate_delay(1), Duration::from_millis(200));
/// assert_eq!(policy.calculate_delay(2), Duration::from_millis(300));
/// ```
#[derive(Clone)]
pub struct RetryPolicy {
    name: String,
    config: RetryConfig,
    predicate: Option<RetryPredicate>,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("custom_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new("default", RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(name: impl Into<String>, config: RetryConfig) -> Self {
        Self {
            name: name.into(),
            config,
            predicate: None,
        }
    }

    /// Replace the default predicate ([`error::is_retryable`])
    pub fn with_predicate<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&anyhow::Error) -> bool + Send + Sync + 'static,
    {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts.max(1)
    }

    /// Delay before retry number `attempt + 1`, without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay_ms as f64;
        let raw = match self.config.strategy {
            RetryStrategy::Fixed => base,
            RetryStrategy::Linear => base * f64::from(attempt.saturating_add(1)),
            RetryStrategy::Exponential => base * self.config.multiplier.powi(attempt.min(64) as i32),
            RetryStrategy::Fibonacci => base * fibonacci(attempt.min(90)) as f64,
        };
        let clamped = raw.clamp(0.0, self.config.max_delay_ms as f64);
        Duration::from_millis(clamped as u64)
    }

    /// Delay before retry number `attempt + 1`, jittered and clamped
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt).as_millis() as f64;
        let jittered = if self.config.jitter > 0.0 && delay > 0.0 {
            let spread = delay * self.config.jitter;
            delay + rand::rng().random_range(-spread..=spread)
        } else {
            delay
        };
        Duration::from_millis(jittered.clamp(0.0, self.config.max_delay_ms as f64) as u64)
    }

    fn should_retry(&self, err: &anyhow::Error) -> bool {
        match &self.predicate {
            Some(p) => p(err),
            None => error::is_retryable(err),
        }
    }

    /// Run `op` with this policy's predicate. `op` receives the zero-based
    /// attempt number.
    pub async fn execute<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_with_outcome(op).await.result
    }

    /// Run `op`, deciding retries with `is_retryable` instead of the
    /// policy's predicate
    pub async fn execute_with<T, F, Fut, P>(&self, op: F, is_retryable: P) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&anyhow::Error) -> bool,
    {
        self.run(op, is_retryable).await.result
    }

    /// Like [`RetryPolicy::execute`] but never returns early with `?`: the
    /// outcome carries the attempt count and the time spent sleeping.
    pub async fn execute_with_outcome<T, F, Fut>(&self, op: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.run(op, |e| self.should_retry(e)).await
    }

    async fn run<T, F, Fut, P>(&self, mut op: F, is_retryable: P) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
        P: Fn(&anyhow::Error) -> bool,
    {
        let max_attempts = self.max_attempts();
        let mut total_delay = Duration::ZERO;
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt + 1,
                        total_delay,
                    }
                }
                Err(e) => {
                    let attempts = attempt + 1;
                    if attempts >= max_attempts || !is_retryable(&e) {
                        if attempts > 1 {
                            tracing::debug!(
                                policy = %self.name,
                                attempts,
                                "giving up: {e:#}"
                            );
                        }
                        return RetryOutcome {
                            result: Err(e),
                            attempts,
                            total_delay,
                        };
                    }
                    let delay = self.calculate_delay(attempt);
                    tracing::warn!(
                        policy = %self.name,
                        attempt = attempts,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after error: {e:#}"
                    );
                    tokio::time::sleep(delay).await;
                    total_delay += delay;
                    attempt += 1;
                }
            }
        }
    }
}

/// Named set of policies; unknown names resolve to `default`
#[derive(Debug, Clone)]
pub struct RetryPolicies {
    policies: HashMap<String, RetryPolicy>,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self::with_default(RetryConfig::default())
    }
}

impl RetryPolicies {
    /// Presets `default`, `aggressive` and `conservative`, with `default`
    /// built from `config`
    pub fn with_default(config: RetryConfig) -> Self {
        let mut policies = HashMap::new();
        policies.insert("default".to_string(), RetryPolicy::new("default", config));
        policies.insert(
            "aggressive".to_string(),
            RetryPolicy::new("aggressive", RetryConfig::aggressive()),
        );
        policies.insert(
            "conservative".to_string(),
            RetryPolicy::new("conservative", RetryConfig::conservative()),
        );
        Self { policies }
    }

    pub fn insert(&mut self, policy: RetryPolicy) {
        self.policies.insert(policy.name().to_string(), policy);
    }

    pub fn get(&self, name: &str) -> &RetryPolicy {
        match self.policies.get(name) {
            Some(p) => p,
            None => self.default_policy(),
        }
    }

    pub fn default_policy(&self) -> &RetryPolicy {
        static FALLBACK: std::sync::OnceLock<RetryPolicy> = std::sync::OnceLock::new();
        self.policies
            .get("default")
            .unwrap_or_else(|| FALLBACK.get_or_init(RetryPolicy::default))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.policies.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
