use std::future::Future;
use std::time::{Duration, Instant};

use log::{info, warn};
use parking_lot::Mutex;
use thiserror::Error;

/// Circuit breaker tuning. Defaults match the three-strikes, half-minute
/// cooldown policy used for upstream peer calls.
#[derive(Debug, Clone, Copy)]
pub struct CircuitBreakerConfig {
    pub threshold: u32,
    pub open_timeout: Duration,
    pub max_retries: u32,
    pub retry_interval: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        CircuitBreakerConfig {
            threshold: 5,
            open_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_interval: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: State,
    failures: u32,
    last_failure: Option<Instant>,
    /// True while a HalfOpen probe is in flight, guaranteeing only one
    /// caller at a time gets to test a half-open circuit.
    probe_in_flight: bool,
}

#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    #[error("circuit open")]
    CircuitOpen,
    #[error(transparent)]
    Inner(E),
}

/// Three-state gate (Closed / Open / HalfOpen) around a fallible async
/// operation, e.g. a probe to an upstream peer.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreaker {
            config,
            inner: Mutex::new(Inner {
                state: State::Closed,
                failures: 0,
                last_failure: None,
                probe_in_flight: false,
            }),
        }
    }

    /// Returns `Ok(is_probe)` if the call is admitted, `Err(())` if the
    /// circuit is open and the caller must be rejected without running
    /// the operation.
    fn acquire(&self) -> Result<bool, ()> {
        let mut inner = self.inner.lock();
        match inner.state {
            State::Closed => Ok(false),
            State::Open => {
                let elapsed = inner
                    .last_failure
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.open_timeout {
                    inner.state = State::HalfOpen;
                    inner.probe_in_flight = true;
                    info!("circuit transitioning Open -> HalfOpen");
                    Ok(true)
                } else {
                    Err(())
                }
            }
            State::HalfOpen => {
                if inner.probe_in_flight {
                    Err(())
                } else {
                    inner.probe_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn record_success(&self, was_probe: bool) {
        let mut inner = self.inner.lock();
        if was_probe {
            info!("circuit transitioning HalfOpen -> Closed");
            inner.probe_in_flight = false;
        }
        inner.state = State::Closed;
        inner.failures = 0;
    }

    fn record_failure(&self, was_probe: bool) {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        inner.last_failure = Some(Instant::now());
        if was_probe {
            inner.probe_in_flight = false;
        }
        if was_probe || inner.failures >= self.config.threshold {
            if inner.state != State::Open {
                warn!("circuit opening after {} failures", inner.failures);
            }
            inner.state = State::Open;
        }
    }

    /// Run `op` through the breaker once. Rejects immediately with
    /// `CircuitOpen` without invoking `op` if the circuit is open and the
    /// cooldown hasn't elapsed, or if a HalfOpen probe is already in
    /// flight.
    pub async fn call<F, Fut, T, E>(&self, op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let is_probe = self.acquire().map_err(|_| CircuitBreakerError::CircuitOpen)?;
        match op().await {
            Ok(value) => {
                self.record_success(is_probe);
                Ok(value)
            }
            Err(err) => {
                self.record_failure(is_probe);
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    /// Run `op` through the breaker, retrying up to `max_retries` times
    /// with `retry_interval` between attempts while the circuit keeps
    /// admitting calls. Stops early if the circuit opens mid-retry.
    pub async fn call_with_retry<F, Fut, T, E>(&self, mut op: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match self.call(&mut op).await {
                Ok(value) => return Ok(value),
                Err(CircuitBreakerError::CircuitOpen) => return Err(CircuitBreakerError::CircuitOpen),
                Err(err @ CircuitBreakerError::Inner(_)) => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        return Err(err);
                    }
                    tokio::time::sleep(self.config.retry_interval).await;
                }
            }
        }
    }
}
