//! The pluggable unit of work a leader performs on every refresh cycle.

use async_trait::async_trait;
use tracing::debug;

use super::ElectionError;
use crate::coordination::Lease;

/// What the leader knows while doing its work.
#[derive(Debug, Clone)]
pub struct LeaderContext {
    /// Identity of this process.
    pub instance_id: String,
    /// The lease keeping the leader key alive.
    pub lease: Lease,
    /// 1-based iteration count within the current term.
    pub iteration: u64,
}

/// Work performed by the leader once per cycle, right after a successful
/// lease refresh.
///
/// A partitioned leader may keep running this for up to one lease TTL after
/// another process has taken over, so implementations must tolerate being
/// executed twice for the same logical step.
///
/// Returning an error ends the current leadership term.
#[async_trait]
pub trait LeaderWork: Send + Sync + 'static {
    /// Performs one unit of leader work.
    async fn perform(&self, ctx: &LeaderContext) -> Result<(), ElectionError>;
}

/// Default work hook: logs and does nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingLeaderWork;

#[async_trait]
impl LeaderWork for LoggingLeaderWork {
    async fn perform(&self, ctx: &LeaderContext) -> Result<(), ElectionError> {
        debug!(
            instance_id = %ctx.instance_id,
            lease_id = %ctx.lease.id,
            iteration = ctx.iteration,
            "The leader is doing work"
        );
        Ok(())
    }
}

/// Adapts a synchronous closure into a [`LeaderWork`].
///
/// ```rust
/// use le_core::election::{ElectionError, FnLeaderWork, LeaderContext};
///
/// let work = FnLeaderWork::new(|ctx: &LeaderContext| {
///     if ctx.iteration > 1000 {
///         return Err(ElectionError::leader_work("enough"));
///     }
///     Ok(())
/// });
/// # let _ = work;
/// ```
pub struct FnLeaderWork<F> {
    f: F,
}

impl<F> FnLeaderWork<F>
where
    F: Fn(&LeaderContext) -> Result<(), ElectionError> + Send + Sync + 'static,
{
    /// Wraps the closure.
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> LeaderWork for FnLeaderWork<F>
where
    F: Fn(&LeaderContext) -> Result<(), ElectionError> + Send + Sync + 'static,
{
    async fn perform(&self, ctx: &LeaderContext) -> Result<(), ElectionError> {
        (self.f)(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::LeaseId;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn context(iteration: u64) -> LeaderContext {
        LeaderContext {
            instance_id: "server-a".to_string(),
            lease: Lease::new(LeaseId::new(1), Duration::from_secs(10)),
            iteration,
        }
    }

    #[tokio::test]
    async fn test_logging_work_succeeds() {
        assert!(LoggingLeaderWork.perform(&context(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_fn_work_sees_context() {
        let seen = Arc::new(AtomicU64::new(0));
        let seen_in_work = Arc::clone(&seen);
        let work = FnLeaderWork::new(move |ctx: &LeaderContext| {
            seen_in_work.store(ctx.iteration, Ordering::SeqCst);
            if ctx.iteration == 3 {
                Err(ElectionError::leader_work("third time"))
            } else {
                Ok(())
            }
        });

        assert!(work.perform(&context(2)).await.is_ok());
        assert_eq!(seen.load(Ordering::SeqCst), 2);

        let err = work.perform(&context(3)).await.unwrap_err();
        assert_eq!(err.kind(), "leader_work");
    }
}
