//! Bounded condition polling
//!
//! All waiting in fcnest (control socket, guest network, engine socket, engine
//! liveness) is a fixed-interval poll with an explicit attempt limit. Nothing
//! waits unbounded.

use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// How often and how many times to check a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl PollPolicy {
    pub const fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            interval,
        }
    }

    /// `attempts` checks one second apart
    pub const fn seconds(attempts: u32) -> Self {
        Self::new(attempts, Duration::from_secs(1))
    }

    /// Upper bound on the time spent sleeping between checks
    pub fn max_wait(&self) -> Duration {
        self.interval * self.max_attempts
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self::seconds(30)
    }
}

/// Result of a single check
#[derive(Debug)]
pub enum Check<T, E> {
    /// Condition met, stop polling
    Ready(T),
    /// Not yet, try again after the interval
    Pending,
    /// Condition can never be met, stop immediately
    Abort(E),
}

/// Why polling stopped without a result
#[derive(Debug, Error)]
pub enum PollError<E> {
    #[error("condition not met after {attempts} attempts ({waited:?})")]
    Exhausted { attempts: u32, waited: Duration },
    #[error("polling aborted: {0}")]
    Aborted(E),
}

/// Check `probe` until it is ready, aborts, or the policy runs out of attempts
///
/// The probe runs at most `max_attempts` times with `interval` between runs,
/// so total waiting never exceeds [`PollPolicy::max_wait`].
pub async fn poll<T, E, F, Fut>(policy: PollPolicy, mut probe: F) -> Result<T, PollError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Check<T, E>>,
{
    let start = Instant::now();

    for attempt in 1..=policy.max_attempts {
        match probe(attempt).await {
            Check::Ready(value) => return Ok(value),
            Check::Abort(err) => return Err(PollError::Aborted(err)),
            Check::Pending => {}
        }
        if attempt < policy.max_attempts {
            tokio::time::sleep(policy.interval).await;
        }
    }

    Err(PollError::Exhausted {
        attempts: policy.max_attempts,
        waited: start.elapsed(),
    })
}

/// Poll a boolean condition; returns the attempt on which it became true
pub async fn poll_until<F>(
    policy: PollPolicy,
    mut condition: F,
) -> Result<u32, PollError<Infallible>>
where
    F: FnMut() -> bool,
{
    poll(policy, |attempt| {
        let ready = condition();
        async move {
            if ready {
                Check::Ready(attempt)
            } else {
                Check::Pending
            }
        }
    })
    .await
}
