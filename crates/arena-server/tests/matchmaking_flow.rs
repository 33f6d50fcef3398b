//! End-to-end matchmaking scenarios against in-memory stores.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use arena_coord::bus::MatchmakingBus;
use arena_coord::lock::LockManager;
use arena_coord::CoordDatabase;

use arena_server::executor::{
    ExecuteMatchRequest, ExecuteMatchResponse, ExecuteStatus, ExecutorClient, ExecutorError,
};
use arena_server::matches::MatchService;
use arena_server::matchmaking::{Enqueuer, MatchmakingConfig, MatchmakingEngine};
use arena_server::notifier::Hub;
use arena_server::storage::{Database, Match, SubmissionStatus};

/// Executor that always finishes the game with agent1 winning 21-15.
struct WinnerTakesFirst;

impl ExecutorClient for WinnerTakesFirst {
    async fn execute_match(
        &self,
        request: ExecuteMatchRequest,
    ) -> Result<ExecuteMatchResponse, ExecutorError> {
        Ok(ExecuteMatchResponse {
            match_id: request.match_id,
            status: ExecuteStatus::Success,
            winner_id: Some(request.agent1.id),
            agent1_score: 21.0,
            agent2_score: 15.0,
            replay_url: Some("https://replays/r.json".into()),
            replay_html_url: None,
            duration_ms: 1200,
            error: None,
        })
    }

    async fn health_check(&self) -> Result<(), ExecutorError> {
        Ok(())
    }
}

struct Harness {
    db: Database,
    coord: CoordDatabase,
    engine: MatchmakingEngine<WinnerTakesFirst>,
    enqueuer: Enqueuer,
    _shutdown_tx: watch::Sender<bool>,
}

async fn harness() -> Harness {
    let db = Database::open_in_memory().await.unwrap();
    let coord = CoordDatabase::open_in_memory().await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (hub, _hub_task) = Hub::spawn(64, shutdown_rx);
    let bus = MatchmakingBus::new(256);
    let locks = LockManager::new(&coord);
    let enqueuer = Enqueuer::new(db.clone(), bus.clone());

    let match_service = Arc::new(MatchService::new(
        db.clone(),
        Arc::new(WinnerTakesFirst),
        bus.clone(),
        hub,
    ));
    let engine = MatchmakingEngine::new(
        db.clone(),
        bus,
        locks,
        match_service,
        MatchmakingConfig::default(),
    );

    db.create_user("u1", "alice", "alice@example.com", "hash")
        .await
        .unwrap();

    Harness {
        db,
        coord,
        engine,
        enqueuer,
        _shutdown_tx: shutdown_tx,
    }
}

/// Create an agent with a built, active submission and the given rating.
async fn ready_agent(db: &Database, agent_id: &str, elo: i64) {
    db.create_agent(agent_id, "u1", agent_id, None, "pong")
        .await
        .unwrap();
    sqlx::query("UPDATE agents SET elo = ? WHERE id = ?")
        .bind(elo)
        .bind(agent_id)
        .execute(db.pool())
        .await
        .unwrap();

    let submission_id = format!("sub-{agent_id}");
    db.create_submission(&submission_id, agent_id, "/storage/code.py")
        .await
        .unwrap();
    db.update_submission_status(&submission_id, SubmissionStatus::Active, None, None)
        .await
        .unwrap();
    db.update_submission_build_info(
        &submission_id,
        Some(&format!("build-{submission_id}")),
        Some(&format!("registry.local/{agent_id}:{submission_id}-v1")),
        None,
    )
    .await
    .unwrap();
    db.set_active_submission(&submission_id, agent_id).await.unwrap();
}

async fn all_matches(db: &Database) -> Vec<Match> {
    sqlx::query_as("SELECT * FROM matches ORDER BY created_at")
        .fetch_all(db.pool())
        .await
        .unwrap()
}

#[tokio::test]
async fn widening_search_pairs_at_three_hundred() {
    let h = harness().await;

    // Ratings 1200 / 1490 / 1800: the anchor finds nothing at ±100 and
    // ±200, then 1490 at ±300; 1800 stays unpaired.
    for (agent, elo) in [("anchor", 1200), ("mid", 1490), ("far", 1800)] {
        ready_agent(&h.db, agent, elo).await;
        h.enqueuer.enqueue(agent, "pong").await.unwrap();
    }

    // Enqueues land within the same second; spread the queue ages so the
    // pass walks anchor, mid, far deterministically.
    for (agent, age) in [("anchor", 30), ("mid", 20), ("far", 10)] {
        sqlx::query("UPDATE matchmaking_queue SET queued_at = queued_at - ? WHERE agent_id = ?")
            .bind(age)
            .bind(agent)
            .execute(h.db.pool())
            .await
            .unwrap();
    }

    let created = h.engine.match_environment("pong").await.unwrap();
    assert_eq!(created, 1);

    let matches = all_matches(&h.db).await;
    assert_eq!(matches.len(), 1);
    assert_eq!(matches[0].status, "completed");
    assert_eq!(matches[0].agent1_id, "anchor");
    assert_eq!(matches[0].agent2_id, "mid");

    // The unpaired agent still waits with its original snapshot.
    let far = h.db.find_queue_entry("far", "pong").await.unwrap().unwrap();
    assert_eq!(far.status, "waiting");
    assert_eq!(far.elo_rating, 1800);

    // The paired agents went matched -> completed -> re-enqueued, so their
    // snapshots now carry post-match ratings.
    let anchor = h.db.find_queue_entry("anchor", "pong").await.unwrap().unwrap();
    assert_eq!(anchor.status, "waiting");
    assert!(anchor.elo_rating > 1200);

    // The audit row records the rating difference at matching time.
    let (elo_difference,): (i64,) =
        sqlx::query_as("SELECT elo_difference FROM matchmaking_history LIMIT 1")
            .fetch_one(h.db.pool())
            .await
            .unwrap();
    assert_eq!(elo_difference, 290);
}

#[tokio::test]
async fn pass_needs_two_eligible_agents() {
    let h = harness().await;
    ready_agent(&h.db, "alone", 1200).await;
    h.enqueuer.enqueue("alone", "pong").await.unwrap();

    let created = h.engine.match_environment("pong").await.unwrap();
    assert_eq!(created, 0);
    assert!(all_matches(&h.db).await.is_empty());
}

#[tokio::test]
async fn cooldown_blocks_immediate_rematch() {
    let h = harness().await;
    for (agent, elo) in [("x", 1200), ("y", 1210)] {
        ready_agent(&h.db, agent, elo).await;
        h.enqueuer.enqueue(agent, "pong").await.unwrap();
    }

    // X finished a match two minutes ago; the 5-minute cooldown holds.
    let now = arena_core::db::unix_timestamp();
    h.db.increment_match_stats("x", now - 120).await.unwrap();

    let created = h.engine.match_environment("pong").await.unwrap();
    assert_eq!(created, 0, "cooldown must prevent pairing");

    // Once the cooldown has elapsed, the next pass pairs X.
    sqlx::query("UPDATE agent_match_stats SET last_match_at = ? WHERE agent_id = 'x'")
        .bind(now - 301)
        .execute(h.db.pool())
        .await
        .unwrap();

    let created = h.engine.match_environment("pong").await.unwrap();
    assert_eq!(created, 1);
}

#[tokio::test]
async fn contending_replica_backs_off_without_mutating_state() {
    let h = harness().await;
    for (agent, elo) in [("a", 1200), ("b", 1210)] {
        ready_agent(&h.db, agent, elo).await;
        h.enqueuer.enqueue(agent, "pong").await.unwrap();
    }

    // Replica 1 holds the environment lease for longer than replica 2's
    // whole retry budget (3 attempts, 500 ms apart).
    let other_replica = LockManager::new(&h.coord);
    let lease = other_replica
        .acquire("matchmaking:lock:pong", "replica-1", Duration::from_secs(30))
        .await
        .unwrap();

    let created = h.engine.match_environment("pong").await.unwrap();
    assert_eq!(created, 0);
    assert!(all_matches(&h.db).await.is_empty());
    for agent in ["a", "b"] {
        let entry = h.db.find_queue_entry(agent, "pong").await.unwrap().unwrap();
        assert_eq!(entry.status, "waiting");
    }

    // Once replica 1 releases, this replica's pass produces exactly its
    // own matches.
    lease.release().await.unwrap();
    let created = h.engine.match_environment("pong").await.unwrap();
    assert_eq!(created, 1);
    assert_eq!(all_matches(&h.db).await.len(), 1);
}

#[tokio::test]
async fn agents_in_different_environments_never_pair() {
    let h = harness().await;
    ready_agent(&h.db, "p1", 1200).await;

    h.db.create_agent("c1", "u1", "c1", None, "chess").await.unwrap();
    let sub = "sub-c1";
    h.db.create_submission(sub, "c1", "/storage/c1.py").await.unwrap();
    h.db.update_submission_status(sub, SubmissionStatus::Active, None, None)
        .await
        .unwrap();
    h.db.set_active_submission(sub, "c1").await.unwrap();

    h.enqueuer.enqueue("p1", "pong").await.unwrap();
    h.enqueuer.enqueue("c1", "chess").await.unwrap();

    assert_eq!(h.engine.match_environment("pong").await.unwrap(), 0);
    assert_eq!(h.engine.match_environment("chess").await.unwrap(), 0);
    assert!(all_matches(&h.db).await.is_empty());
}
