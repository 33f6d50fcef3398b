//! Matchmaking engine.
//!
//! Two cooperating long-lived tasks drive pairing per environment: an
//! event-driven consumer on the shared bus and a periodic trigger that
//! fans `matching_requested` across replicas and expires stale queue rows.
//! A matching pass is single-flight per environment, guarded by the
//! `matchmaking:lock:{env}` lease, so replicas sharing the coordination
//! store never pair the same agents twice.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use arena_core::db::unix_timestamp;
use arena_core::error::{Result, ServiceError};
use arena_coord::bus::MatchmakingBus;
use arena_coord::lock::{LockError, LockManager};

use crate::executor::ExecutorClient;
use crate::matches::MatchService;
use crate::storage::{Database, MatchmakingQueueEntry};

/// Matchmaking policy knobs.
#[derive(Debug, Clone)]
pub struct MatchmakingConfig {
    /// Interval between periodic `matching_requested` triggers.
    pub interval: Duration,
    /// Per-agent cooldown between matches.
    pub cooldown: Duration,
    /// Per-agent daily match quota.
    pub daily_limit: i64,
    /// Waiting rows older than this are expired.
    pub queue_max_age: Duration,
    /// Initial rating tolerance of the opponent search.
    pub elo_range_step: i64,
    /// Tolerance ceiling of the opponent search.
    pub max_elo_range: i64,
}

impl Default for MatchmakingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            cooldown: Duration::from_secs(5 * 60),
            daily_limit: 100,
            queue_max_age: Duration::from_secs(24 * 60 * 60),
            elo_range_step: 100,
            max_elo_range: 500,
        }
    }
}

const LOCK_TTL: Duration = Duration::from_secs(5);
const LOCK_RETRIES: u32 = 3;
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const ENQUEUE_PRIORITY: i64 = 5;

/// Queue entry point shared by the build monitor and the REST surface.
#[derive(Clone)]
pub struct Enqueuer {
    db: Database,
    bus: MatchmakingBus,
}

impl Enqueuer {
    pub fn new(db: Database, bus: MatchmakingBus) -> Self {
        Self { db, bus }
    }

    /// Put an agent into the queue for an environment with a fresh rating
    /// snapshot, and announce it on the bus.
    pub async fn enqueue(&self, agent_id: &str, environment_id: &str) -> Result<()> {
        let agent = self
            .db
            .find_agent(agent_id)
            .await?
            .ok_or(ServiceError::NotFound("agent"))?;

        self.db
            .enqueue_agent(
                &uuid::Uuid::new_v4().to_string(),
                agent_id,
                environment_id,
                agent.elo,
                ENQUEUE_PRIORITY,
                unix_timestamp(),
            )
            .await?;

        self.bus.notify_agent_enqueued(environment_id, agent_id);
        Ok(())
    }

    /// Take an agent out of the queue (owner request).
    pub async fn remove(&self, agent_id: &str, environment_id: &str) -> Result<bool> {
        Ok(self.db.remove_from_queue(agent_id, environment_id).await?)
    }
}

/// The matchmaking driver.
pub struct MatchmakingEngine<E: ExecutorClient> {
    db: Database,
    bus: MatchmakingBus,
    locks: LockManager,
    match_service: Arc<MatchService<E>>,
    config: MatchmakingConfig,
    /// Identifies this replica as a lock holder.
    instance_id: String,
    cancel: CancellationToken,
}

impl<E: ExecutorClient> MatchmakingEngine<E> {
    pub fn new(
        db: Database,
        bus: MatchmakingBus,
        locks: LockManager,
        match_service: Arc<MatchService<E>>,
        config: MatchmakingConfig,
    ) -> Self {
        Self {
            db,
            bus,
            locks,
            match_service,
            config,
            instance_id: uuid::Uuid::new_v4().to_string(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Spawn the event consumer and the periodic trigger. Both stop when
    /// the shutdown signal changes.
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!(
            instance_id = %self.instance_id,
            interval_secs = self.config.interval.as_secs(),
            "starting matchmaking engine"
        );

        let cancel_guard = {
            let cancel = self.cancel.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let _ = shutdown.changed().await;
                cancel.cancel();
            })
        };

        vec![
            tokio::spawn(Arc::clone(&self).consumer_loop(shutdown.clone())),
            tokio::spawn(Arc::clone(&self).trigger_loop(shutdown)),
            cancel_guard,
        ]
    }

    /// Event-driven consumer: every bus event for an environment attempts
    /// one guarded pass there.
    async fn consumer_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut events = self.bus.subscribe();

        loop {
            tokio::select! {
                received = events.recv() => match received {
                    Ok(event) => {
                        if let Err(e) = self.match_environment(&event.environment_id).await {
                            error!(
                                environment_id = %event.environment_id,
                                error = %e,
                                "matching pass failed"
                            );
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        // Dropped events are only latency; the periodic
                        // trigger covers the gap.
                        warn!(missed, "matchmaking consumer lagged behind the bus");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                },
                _ = shutdown.changed() => {
                    info!("matchmaking consumer shutting down");
                    return;
                }
            }
        }
    }

    /// Periodic trigger: expire stale queue rows and request a pass for
    /// every active environment.
    async fn trigger_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut timer = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = timer.tick() => {
                    let now = unix_timestamp();
                    if let Err(e) = self
                        .db
                        .expire_stale_queue_entries(self.config.queue_max_age.as_secs() as i64, now)
                        .await
                    {
                        error!(error = %e, "failed to expire stale queue entries");
                    }

                    match self.db.active_environments().await {
                        Ok(environments) => {
                            for environment_id in environments {
                                self.bus.notify_matching_requested(&environment_id);
                            }
                        }
                        Err(e) => error!(error = %e, "failed to list active environments"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("matchmaking trigger shutting down");
                    return;
                }
            }
        }
    }

    /// Run one guarded matching pass on an environment.
    ///
    /// Returns the number of matches created. When another replica holds
    /// the environment lease this returns 0 without touching any state.
    pub async fn match_environment(&self, environment_id: &str) -> Result<usize> {
        let lock_key = format!("matchmaking:lock:{environment_id}");

        let lock = match self
            .locks
            .try_acquire_with_retry(
                &lock_key,
                &self.instance_id,
                LOCK_TTL,
                LOCK_RETRIES,
                LOCK_RETRY_INTERVAL,
                &self.cancel,
            )
            .await
        {
            Ok(lock) => lock,
            Err(LockError::NotAcquired) => {
                debug!(environment_id = %environment_id, "another replica is matching this environment");
                return Ok(0);
            }
            Err(LockError::Cancelled) => return Ok(0),
            Err(e) => {
                // Coordination-store trouble skips the pass; the next
                // trigger retries.
                warn!(environment_id = %environment_id, error = %e, "skipping pass, lock manager unavailable");
                return Ok(0);
            }
        };

        let result = self.run_pass(environment_id).await;

        if let Err(e) = lock.release().await {
            warn!(environment_id = %environment_id, error = %e, "failed to release matchmaking lock");
        }

        result
    }

    async fn run_pass(&self, environment_id: &str) -> Result<usize> {
        let now = unix_timestamp();
        let waiting = self
            .db
            .get_waiting_agents(
                environment_id,
                now,
                self.config.cooldown.as_secs() as i64,
                self.config.daily_limit,
            )
            .await?;

        if waiting.len() < 2 {
            if !waiting.is_empty() {
                debug!(
                    environment_id = %environment_id,
                    waiting = waiting.len(),
                    "not enough agents for matching"
                );
            }
            return Ok(0);
        }

        info!(
            environment_id = %environment_id,
            waiting = waiting.len(),
            "starting matchmaking pass"
        );

        let mut paired: HashSet<String> = HashSet::new();
        let mut created = 0usize;

        for entry in &waiting {
            if paired.contains(&entry.agent_id) {
                continue;
            }

            let Some(opponent) = self
                .find_opponent_widening(environment_id, entry, &paired)
                .await?
            else {
                continue;
            };

            paired.insert(entry.agent_id.clone());
            paired.insert(opponent.agent_id.clone());

            // Consume both rows before handing off; a completed match
            // re-enqueues them as part of its result transaction.
            self.db
                .mark_matched(&[entry.id.clone(), opponent.id.clone()], now)
                .await?;

            match self
                .match_service
                .create_and_execute(&entry.agent_id, &opponent.agent_id)
                .await
            {
                Ok(match_row) => {
                    let elo_difference = (entry.elo_rating - opponent.elo_rating).abs();
                    self.db
                        .record_matchmaking_history(
                            &entry.agent_id,
                            &opponent.agent_id,
                            environment_id,
                            Some(&match_row.id),
                            elo_difference,
                            now,
                        )
                        .await?;
                    created += 1;
                }
                Err(e) => {
                    error!(
                        agent1 = %entry.agent_id,
                        agent2 = %opponent.agent_id,
                        error = %e,
                        "failed to create match for pair"
                    );
                }
            }
        }

        if created > 0 {
            info!(
                environment_id = %environment_id,
                matches_created = created,
                "matchmaking pass completed"
            );
        }
        Ok(created)
    }

    /// Widening opponent search: start at the base tolerance and expand by
    /// one step until the ceiling, taking the closest-rated candidate at
    /// the first tolerance that has one.
    async fn find_opponent_widening(
        &self,
        environment_id: &str,
        anchor: &MatchmakingQueueEntry,
        paired: &HashSet<String>,
    ) -> Result<Option<MatchmakingQueueEntry>> {
        let mut excluded: Vec<String> = paired.iter().cloned().collect();
        excluded.push(anchor.agent_id.clone());

        let mut elo_range = self.config.elo_range_step;
        while elo_range <= self.config.max_elo_range {
            if let Some(opponent) = self
                .db
                .find_opponent(environment_id, &excluded, anchor.elo_rating, elo_range)
                .await?
            {
                debug!(
                    agent = %anchor.agent_id,
                    opponent = %opponent.agent_id,
                    elo_range,
                    "found opponent"
                );
                return Ok(Some(opponent));
            }
            elo_range += self.config.elo_range_step;
        }

        Ok(None)
    }
}
