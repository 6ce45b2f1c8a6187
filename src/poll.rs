//! Bounded polling with cancellation
//!
//! The snapshot service and the cluster control plane expose no push
//! notifications, so every wait in this crate is a finite poll: a fixed
//! interval, an explicit attempt ceiling, and a distinguished outcome for
//! both "ran out of attempts" and "caller cancelled".

use std::future::Future;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::aws::{JobRecord, JobState};
use crate::Error;

/// Interval and attempt ceiling for one kind of wait
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PollPolicy {
    /// Delay between polls
    pub interval: Duration,
    /// Maximum number of polls (always at least 1)
    pub max_attempts: u32,
}

impl PollPolicy {
    /// Create a policy
    pub const fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// Backup jobs: 30s x 120 (about an hour)
    pub const fn backup_job() -> Self {
        Self::new(Duration::from_secs(30), 120)
    }

    /// Restore jobs: 30s x 120 (about an hour)
    pub const fn restore_job() -> Self {
        Self::new(Duration::from_secs(30), 120)
    }

    /// Claim binding: 1s x 30
    pub const fn claim_bind() -> Self {
        Self::new(Duration::from_secs(1), 30)
    }

    /// Provider-side deletion propagation: 5s x 24
    pub const fn propagation() -> Self {
        Self::new(Duration::from_secs(5), 24)
    }

    /// Inspection workload phase: 5s x 36 (3 minutes)
    pub const fn verification() -> Self {
        Self::new(Duration::from_secs(5), 36)
    }

    /// Consumer rollout steady state: 10s x 60 (10 minutes)
    pub const fn rollout() -> Self {
        Self::new(Duration::from_secs(10), 60)
    }

    /// Upper bound on wall time spent sleeping
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts.saturating_sub(1)
    }
}

/// Poll `check` until it yields a value, errors, or the budget runs out.
///
/// `check` receives the 1-based attempt number and returns:
/// * `Ok(Some(T))` - done
/// * `Ok(None)` - not yet, keep polling
/// * `Err(e)` - stop immediately and propagate `e`
///
/// The token is checked between every attempt. Exhausting the budget yields
/// [`Error::Timeout`]; the token firing yields [`Error::Cancelled`].
pub async fn poll_until<T, F, Fut>(
    operation: &str,
    policy: &PollPolicy,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T, Error>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Option<T>, Error>>,
{
    let max_attempts = policy.max_attempts.max(1);

    for attempt in 1..=max_attempts {
        if cancel.is_cancelled() {
            return Err(Error::cancelled(operation));
        }

        if let Some(value) = check(attempt).await? {
            return Ok(value);
        }

        trace!(operation, attempt, max_attempts, "Condition not met yet");

        if attempt < max_attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::cancelled(operation)),
                _ = tokio::time::sleep(policy.interval) => {}
            }
        }
    }

    Err(Error::timeout(operation, max_attempts))
}

/// Poll a backup or restore job until it reaches a terminal state.
///
/// * `Completed` returns the final record
/// * `Failed`/`Aborted` yield [`Error::JobFailed`] with the job's own message
/// * an observation that moves the job backwards is a [`Error::Validation`]
/// * running out of attempts is [`Error::Timeout`]
pub async fn poll_job<J, F, Fut>(
    kind: &str,
    job_id: &str,
    policy: &PollPolicy,
    cancel: &CancellationToken,
    mut describe: F,
) -> Result<J, Error>
where
    J: JobRecord,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<J, Error>>,
{
    let operation = format!("{} job {}", kind, job_id);
    let last = Mutex::new(JobState::Created);

    poll_until(&operation, policy, cancel, |attempt| {
        let pending = describe();
        let last = &last;
        async move {
            let job = pending.await?;
            let state = job.state();

            let mut previous = last.lock().await;
            if !previous.can_transition_to(state) {
                return Err(Error::validation(format!(
                    "{} job {} reported {} after {}",
                    kind, job_id, state, *previous
                )));
            }
            *previous = state;
            debug!(kind, job_id, attempt, %state, "job state");

            match state {
                JobState::Completed => Ok(Some(job)),
                JobState::Failed | JobState::Aborted => Err(Error::JobFailed {
                    job_id: job_id.to_string(),
                    state: state.to_string(),
                    message: job
                        .status_message()
                        .unwrap_or("no status message")
                        .to_string(),
                }),
                JobState::Created | JobState::Running => Ok(None),
            }
        }
    })
    .await
}
