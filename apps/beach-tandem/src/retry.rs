use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::store::StoreError;

/// Errors that may go away if the same call is made again.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for StoreError {
    fn is_transient(&self) -> bool {
        StoreError::is_transient(self)
    }
}

impl Transient for transport_bus::BusError {
    fn is_transient(&self) -> bool {
        transport_bus::BusError::is_transient(self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32) -> Self {
        Self {
            attempts: attempts.max(1),
            initial_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(500),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Run `op` until it succeeds, fails permanently, or the policy runs out of attempts.
pub async fn retry_transient<T, E, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T, E>
where
    E: Transient + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut delay = policy.initial_delay;
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if err.is_transient() && attempt < policy.attempts => {
                warn!(what, attempt, error = %err, "transient failure, retrying");
                tokio::time::sleep(delay).await;
                delay = std::cmp::min(delay * 2, policy.max_delay);
                attempt += 1;
            }
            other => return other,
        }
    }
}
