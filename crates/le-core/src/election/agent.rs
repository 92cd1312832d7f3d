//! The election agent: attempt, lead, follow, repeat.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::{watch, RwLock};
use tracing::{debug, info, instrument, trace, warn};

use super::{
    ElectionConfig, ElectionError, ElectionOutcome, ElectionState, ElectionStats, FollowReason,
    FollowerExit, LeaderContext, LeaderWork, LeadershipExit, LoggingLeaderWork, Role,
};
use crate::coordination::{
    CoordinationClient, CoordinationError, Lease, WatchCallback, WatchEvent, WatchSubscription,
};

/// Runs the single-leader election protocol for one process.
///
/// Every process that shares a leader key runs an identical agent. The
/// coordination service's atomic create-if-absent write is the only
/// serialization point between them; there is no peer-to-peer traffic.
///
/// # Example
///
/// ```rust
/// use le_core::coordination::MockCoordinationService;
/// use le_core::election::{ElectionAgent, ElectionConfig};
/// use std::sync::Arc;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let service = Arc::new(MockCoordinationService::new());
/// let agent = Arc::new(ElectionAgent::new(ElectionConfig::new("server-a"), service));
///
/// let runner = {
///     let agent = Arc::clone(&agent);
///     tokio::spawn(async move { agent.run().await })
/// };
///
/// // ... later, on SIGINT:
/// agent.shutdown();
/// runner.await??;
/// # Ok(())
/// # }
/// ```
pub struct ElectionAgent {
    config: ElectionConfig,
    client: Arc<dyn CoordinationClient>,
    work: Arc<dyn LeaderWork>,
    stats: Arc<RwLock<ElectionStats>>,
    role_tx: watch::Sender<Role>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ElectionAgent {
    /// Creates an agent that logs as its leader work.
    pub fn new(config: ElectionConfig, client: Arc<dyn CoordinationClient>) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (role_tx, _) = watch::channel(Role::Attempting);
        Self {
            config,
            client,
            work: Arc::new(LoggingLeaderWork),
            stats: Arc::new(RwLock::new(ElectionStats::default())),
            role_tx,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Replaces the leader work hook.
    pub fn with_leader_work(mut self, work: Arc<dyn LeaderWork>) -> Self {
        self.work = work;
        self
    }

    /// Returns the agent configuration.
    pub fn config(&self) -> &ElectionConfig {
        &self.config
    }

    /// Returns this process's identity.
    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Returns the role the agent is currently playing.
    pub fn role(&self) -> Role {
        *self.role_tx.borrow()
    }

    /// Subscribes to role changes.
    pub fn subscribe_role(&self) -> watch::Receiver<Role> {
        self.role_tx.subscribe()
    }

    /// Returns a snapshot of the agent's counters.
    pub async fn stats(&self) -> ElectionStats {
        self.stats.read().await.clone()
    }

    /// Asks the agent to stop.
    ///
    /// The leader loop revokes its lease and the follower loop cancels its
    /// watch before [`run`](Self::run) returns. A coordination call already
    /// in flight is allowed to finish.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Returns `true` once shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Gets a clone of the shutdown receiver for external use.
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Runs the election loop until shutdown.
    ///
    /// Only an invalid configuration is reported as an error. Everything else
    /// (lost elections, connectivity failures, expired leases) is turned into
    /// a state transition.
    #[instrument(skip(self), fields(instance_id = %self.config.instance_id))]
    pub async fn run(&self) -> Result<(), ElectionError> {
        self.config.validate()?;

        info!(
            instance_id = %self.config.instance_id,
            key = %self.config.leader_key,
            lease_ttl_ms = self.config.lease_ttl.as_millis() as u64,
            "Election agent starting"
        );

        let mut state = ElectionState::Attempting;
        loop {
            state = self.step(state).await;
            if matches!(state, ElectionState::Stopped) {
                break;
            }
        }

        self.set_role(Role::Stopped);
        info!(instance_id = %self.config.instance_id, "Election agent stopped");
        Ok(())
    }

    /// Runs the handler for `state` and returns the next state.
    pub async fn step(&self, state: ElectionState) -> ElectionState {
        match state {
            ElectionState::Attempting => {
                if self.is_shutdown() {
                    return ElectionState::Stopped;
                }
                self.attempt_election().await.into_state()
            }
            ElectionState::Leading(lease) => match self.perform_leader_duties(lease).await {
                LeadershipExit::Shutdown => ElectionState::Stopped,
                LeadershipExit::RefreshFailed(_) | LeadershipExit::WorkFailed(_) => {
                    self.cool_down().await
                }
            },
            ElectionState::Following(reason) => {
                debug!(
                    instance_id = %self.config.instance_id,
                    reason = %reason,
                    "Following"
                );
                match self.wait_as_follower().await {
                    FollowerExit::Shutdown => ElectionState::Stopped,
                    FollowerExit::LeaderDeleted
                    | FollowerExit::LeaderMissing
                    | FollowerExit::WatchFailed(_) => ElectionState::Attempting,
                }
            }
            ElectionState::Stopped => ElectionState::Stopped,
        }
    }

    /// Tries once to become leader.
    ///
    /// Grants a lease and runs the create-if-absent transaction on the leader
    /// key. Never fails: a coordination error is reported as
    /// [`ElectionOutcome::Lost`] with [`FollowReason::Unreachable`], the same
    /// recovery path as losing to another candidate. A lease granted for a
    /// lost attempt is revoked right away.
    pub async fn attempt_election(&self) -> ElectionOutcome {
        self.set_role(Role::Attempting);
        self.record(|s| s.attempts += 1).await;
        debug!(
            instance_id = %self.config.instance_id,
            key = %self.config.leader_key,
            "Attempting leader election"
        );

        let lease = match self
            .call("create_lease", self.client.create_lease(self.config.lease_ttl))
            .await
        {
            Ok(lease) => lease,
            Err(e) => return self.fall_back("create_lease", e.into()).await,
        };

        let written = self
            .call(
                "put_if_absent",
                self.client
                    .put_if_absent(&self.config.leader_key, &self.config.instance_id, &lease),
            )
            .await;

        match written {
            Ok(true) => {
                self.record(|s| s.elections_won += 1).await;
                info!(
                    instance_id = %self.config.instance_id,
                    key = %self.config.leader_key,
                    lease_id = %lease.id,
                    "Became leader"
                );
                ElectionOutcome::Won(lease)
            }
            Ok(false) => {
                self.discard_lease(&lease).await;
                let reason = FollowReason::Contended {
                    holder: self.current_holder().await,
                };
                self.record(|s| s.elections_lost += 1).await;
                let lost = reason.to_error(&self.config.leader_key);
                info!(
                    instance_id = %self.config.instance_id,
                    key = %self.config.leader_key,
                    error_kind = lost.kind(),
                    "Not the leader: {}",
                    lost
                );
                ElectionOutcome::Lost(reason)
            }
            Err(e) => {
                // The write may have committed before the error surfaced;
                // revoking the lease removes the key in that case too.
                self.discard_lease(&lease).await;
                self.fall_back("put_if_absent", e.into()).await
            }
        }
    }

    /// Holds leadership until the lease can't be refreshed, the work hook
    /// fails, or shutdown is requested.
    ///
    /// Each cycle refreshes the lease, runs one unit of leader work, and
    /// sleeps `leader_work_interval`. The lease is revoked on every exit path
    /// so the leader key disappears immediately; if revocation fails the TTL
    /// takes care of it.
    pub async fn perform_leader_duties(&self, lease: Lease) -> LeadershipExit {
        self.set_role(Role::Leading);

        let exit = self.lead(&lease).await;
        self.release_lease(&lease).await;
        self.record(|s| s.leader_terms += 1).await;

        match &exit {
            LeadershipExit::Shutdown => info!(
                instance_id = %self.config.instance_id,
                lease_id = %lease.id,
                "Stepped down as leader"
            ),
            LeadershipExit::RefreshFailed(e) | LeadershipExit::WorkFailed(e) => warn!(
                instance_id = %self.config.instance_id,
                lease_id = %lease.id,
                error = %e,
                error_kind = e.kind(),
                "Lost leadership"
            ),
        }

        exit
    }

    /// Waits until the leader key is vacated.
    ///
    /// Registers a watch whose callback only flips a signal owned by this
    /// call. Wakes on that signal, on shutdown, and every
    /// `follower_poll_interval`; each poll also reads the leader key so a
    /// delete that happened before the watch was registered is not missed.
    /// The watch is cancelled on every exit path.
    pub async fn wait_as_follower(&self) -> FollowerExit {
        self.set_role(Role::Following);
        let mut shutdown_rx = self.shutdown_rx.clone();

        let (signal_tx, mut signal_rx) = watch::channel(false);
        let callback: WatchCallback = Arc::new(move |event: WatchEvent| {
            if event.is_delete() {
                let _ = signal_tx.send(true);
            }
        });

        let subscription = match self
            .call(
                "watch",
                self.client.watch(&self.config.leader_key, callback),
            )
            .await
        {
            Ok(subscription) => subscription,
            Err(e) => {
                let err = ElectionError::from(e);
                warn!(
                    instance_id = %self.config.instance_id,
                    key = %self.config.leader_key,
                    error = %err,
                    "Failed to watch leader key, retrying after poll interval"
                );
                tokio::select! {
                    biased;
                    _ = shutdown_requested(&mut shutdown_rx) => return FollowerExit::Shutdown,
                    _ = tokio::time::sleep(self.config.follower_poll_interval) => {}
                }
                return FollowerExit::WatchFailed(err);
            }
        };

        let exit = self.follow(&mut signal_rx, &mut shutdown_rx).await;
        self.teardown_watch(subscription).await;

        if matches!(exit, FollowerExit::LeaderDeleted | FollowerExit::LeaderMissing) {
            self.record(|s| s.follower_wakeups += 1).await;
            info!(
                instance_id = %self.config.instance_id,
                key = %self.config.leader_key,
                missed_notification = matches!(exit, FollowerExit::LeaderMissing),
                "Detected leader change, starting new election"
            );
        }

        exit
    }

    async fn lead(&self, lease: &Lease) -> LeadershipExit {
        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut iteration = 0u64;

        loop {
            if *shutdown_rx.borrow() {
                return LeadershipExit::Shutdown;
            }

            if let Err(e) = self
                .call("refresh_lease", self.client.refresh_lease(lease))
                .await
            {
                self.record(|s| s.refresh_failures += 1).await;
                return LeadershipExit::RefreshFailed(e.into());
            }
            self.record(|s| s.refreshes += 1).await;
            trace!(lease_id = %lease.id, "Lease refreshed");

            iteration += 1;
            let ctx = LeaderContext {
                instance_id: self.config.instance_id.clone(),
                lease: lease.clone(),
                iteration,
            };
            if let Err(e) = self.work.perform(&ctx).await {
                return LeadershipExit::WorkFailed(e);
            }

            tokio::select! {
                biased;
                _ = shutdown_requested(&mut shutdown_rx) => return LeadershipExit::Shutdown,
                _ = tokio::time::sleep(self.config.leader_work_interval) => {}
            }
        }
    }

    async fn follow(
        &self,
        signal_rx: &mut watch::Receiver<bool>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> FollowerExit {
        let mut poll = tokio::time::interval(self.config.follower_poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        poll.tick().await;

        let mut delivery_open = true;
        loop {
            tokio::select! {
                biased;
                _ = shutdown_requested(shutdown_rx) => return FollowerExit::Shutdown,
                changed = signal_rx.changed(), if delivery_open => {
                    if changed.is_err() {
                        // The delivery task ended; polling still covers us.
                        delivery_open = false;
                        let err = ElectionError::from(CoordinationError::watch_closed(
                            self.config.leader_key.as_str(),
                        ));
                        warn!(
                            instance_id = %self.config.instance_id,
                            key = %self.config.leader_key,
                            error = %err,
                            error_kind = err.kind(),
                            "Watch delivery ended, falling back to polling"
                        );
                    } else if *signal_rx.borrow() {
                        return FollowerExit::LeaderDeleted;
                    }
                }
                _ = poll.tick() => {
                    if *signal_rx.borrow() {
                        return FollowerExit::LeaderDeleted;
                    }
                    if self.leader_key_missing().await {
                        return FollowerExit::LeaderMissing;
                    }
                }
            }
        }
    }

    async fn cool_down(&self) -> ElectionState {
        let mut shutdown_rx = self.shutdown_rx.clone();
        tokio::select! {
            biased;
            _ = shutdown_requested(&mut shutdown_rx) => ElectionState::Stopped,
            _ = tokio::time::sleep(self.config.cooldown) => ElectionState::Attempting,
        }
    }

    /// Bounds a coordination call by the configured request timeout.
    async fn call<T>(
        &self,
        operation: &'static str,
        fut: impl Future<Output = Result<T, CoordinationError>>,
    ) -> Result<T, CoordinationError> {
        match tokio::time::timeout(self.config.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(CoordinationError::timeout(
                operation,
                self.config.request_timeout,
            )),
        }
    }

    async fn fall_back(&self, operation: &'static str, err: ElectionError) -> ElectionOutcome {
        self.record(|s| s.connectivity_fallbacks += 1).await;
        warn!(
            instance_id = %self.config.instance_id,
            key = %self.config.leader_key,
            operation = operation,
            error = %err,
            error_kind = err.kind(),
            "Election attempt failed, falling back to follower"
        );
        ElectionOutcome::Lost(FollowReason::Unreachable { error: err })
    }

    async fn current_holder(&self) -> Option<String> {
        match self
            .call("get", self.client.get(&self.config.leader_key))
            .await
        {
            Ok(kv) => kv.map(|kv| kv.value),
            Err(e) => {
                debug!(error = %e, "Could not read current leader");
                None
            }
        }
    }

    async fn leader_key_missing(&self) -> bool {
        matches!(
            self.call("get", self.client.get(&self.config.leader_key))
                .await,
            Ok(None)
        )
    }

    /// Revokes a lease that never became leadership.
    async fn discard_lease(&self, lease: &Lease) {
        if let Err(e) = self
            .call("revoke_lease", self.client.revoke_lease(lease))
            .await
        {
            debug!(
                lease_id = %lease.id,
                error = %e,
                "Failed to discard unused lease, leaving it to expire"
            );
        }
    }

    /// Revokes the leader's lease. Failure is logged and swallowed.
    async fn release_lease(&self, lease: &Lease) {
        match self
            .call("revoke_lease", self.client.revoke_lease(lease))
            .await
        {
            Ok(()) => debug!(lease_id = %lease.id, "Lease revoked"),
            Err(e) => {
                self.record(|s| s.revoke_failures += 1).await;
                warn!(
                    instance_id = %self.config.instance_id,
                    lease_id = %lease.id,
                    error = %e,
                    ttl_ms = lease.ttl.as_millis() as u64,
                    "Failed to revoke lease, leader key will expire with its TTL"
                );
            }
        }
    }

    async fn teardown_watch(&self, subscription: WatchSubscription) {
        let watch_id = subscription.id();
        if let Err(e) = self
            .call("cancel_watch", self.client.cancel_watch(subscription))
            .await
        {
            let err = ElectionError::watch_teardown(e.to_string());
            self.record(|s| s.watch_teardown_failures += 1).await;
            warn!(
                instance_id = %self.config.instance_id,
                watch_id = %watch_id,
                error = %err,
                "Failed to cancel watch"
            );
        }
    }

    fn set_role(&self, role: Role) {
        self.role_tx.send_if_modified(|current| {
            if *current == role {
                false
            } else {
                *current = role;
                true
            }
        });
    }

    async fn record(&self, update: impl FnOnce(&mut ElectionStats)) {
        update(&mut *self.stats.write().await);
    }
}

impl std::fmt::Debug for ElectionAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElectionAgent")
            .field("config", &self.config)
            .field("role", &self.role())
            .finish()
    }
}

/// Resolves once shutdown is requested (or the sender is gone).
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}
