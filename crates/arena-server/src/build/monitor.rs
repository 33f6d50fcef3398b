//! Build monitor: reconciles submission state from orchestrator job events.
//!
//! One watcher subscribes to the job event stream filtered by the build
//! labels. Events are idempotent: a submission that already left `building`
//! is ignored, so duplicate or replayed events are harmless. When the
//! stream drops, the monitor reconnects with exponential backoff and
//! re-runs the pending recovery pass so no submission is lost while
//! disconnected.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::matchmaking::Enqueuer;
use crate::notifier::{BuildStatusPayload, HubHandle};
use crate::orchestrator::{
    JobEvent, JobEventType, Orchestrator, BUILD_LABEL_SELECTOR, SUBMISSION_ID_LABEL,
};
use crate::storage::{Database, Submission, SubmissionStatus};

use super::dispatcher::BuildDispatcher;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Watches build jobs and drives submissions to their terminal status.
pub struct BuildMonitor<O: Orchestrator> {
    db: Database,
    orchestrator: Arc<O>,
    dispatcher: Arc<BuildDispatcher<O>>,
    hub: HubHandle,
    enqueuer: Enqueuer,
}

impl<O: Orchestrator> BuildMonitor<O> {
    pub fn new(
        db: Database,
        orchestrator: Arc<O>,
        dispatcher: Arc<BuildDispatcher<O>>,
        hub: HubHandle,
        enqueuer: Enqueuer,
    ) -> Self {
        Self {
            db,
            orchestrator,
            dispatcher,
            hub,
            enqueuer,
        }
    }

    /// Spawn the watch loop. It stops when the shutdown signal changes.
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.watch_loop(shutdown))
    }

    async fn watch_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            if *shutdown.borrow() {
                return;
            }

            // Recovery pass: dispatch anything still pending. Runs at
            // startup and again on every reconnect, covering submissions
            // that arrived while the watch was down.
            self.process_pending_submissions().await;

            match self.orchestrator.watch_jobs(BUILD_LABEL_SELECTOR).await {
                Ok(mut events) => {
                    info!(selector = BUILD_LABEL_SELECTOR, "job watch established");
                    backoff = INITIAL_BACKOFF;

                    loop {
                        tokio::select! {
                            maybe = events.recv() => match maybe {
                                Some(event) => self.handle_event(event).await,
                                None => {
                                    warn!("job watch stream closed, reconnecting");
                                    break;
                                }
                            },
                            _ = shutdown.changed() => {
                                info!("build monitor shutting down");
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "failed to establish job watch");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => return,
            }
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    /// Move every `pending` submission to `building` and dispatch its
    /// build.
    async fn process_pending_submissions(&self) {
        let pending = match self
            .db
            .find_submissions_by_status(SubmissionStatus::Pending)
            .await
        {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "failed to scan pending submissions");
                return;
            }
        };

        if pending.is_empty() {
            return;
        }

        info!(count = pending.len(), "processing pending submissions");

        for submission in pending {
            if let Err(e) = self
                .db
                .update_submission_status(&submission.id, SubmissionStatus::Building, None, None)
                .await
            {
                error!(submission_id = %submission.id, error = %e, "failed to mark submission building");
                continue;
            }

            if let Err(e) = self.dispatcher.dispatch_build(&submission).await {
                error!(submission_id = %submission.id, error = %e, "build dispatch failed");
                let message = e.to_string();
                if let Err(e) = self
                    .db
                    .update_submission_status(
                        &submission.id,
                        SubmissionStatus::BuildFailed,
                        None,
                        Some(&message),
                    )
                    .await
                {
                    error!(submission_id = %submission.id, error = %e, "failed to mark submission build_failed");
                }
            }
        }
    }

    async fn handle_event(&self, event: JobEvent) {
        if !matches!(event.event_type, JobEventType::Added | JobEventType::Modified) {
            return;
        }

        let Some(submission_id) = event.job.labels.get(SUBMISSION_ID_LABEL) else {
            warn!(job_name = %event.job.name, "build job has no submission-id label");
            return;
        };

        let submission = match self.db.find_submission(submission_id).await {
            Ok(Some(submission)) => submission,
            Ok(None) => {
                warn!(submission_id = %submission_id, "submission not found for job event");
                return;
            }
            Err(e) => {
                error!(submission_id = %submission_id, error = %e, "failed to load submission");
                return;
            }
        };

        // Idempotent reconciliation: terminal submissions ignore late or
        // duplicate events.
        if submission.status != SubmissionStatus::Building.as_str() {
            return;
        }

        if event.job.status.succeeded > 0 {
            self.handle_build_success(submission).await;
        } else if event.job.status.failed > 0 {
            self.handle_build_failure(submission).await;
        }
        // Otherwise the job is still running.
    }

    async fn handle_build_success(&self, submission: Submission) {
        info!(
            submission_id = %submission.id,
            job_name = submission.build_job_name.as_deref().unwrap_or(""),
            "build succeeded"
        );

        let build_log = self.fetch_build_log(&submission).await;

        if let Err(e) = self
            .db
            .update_submission_status(
                &submission.id,
                SubmissionStatus::Active,
                build_log.as_deref(),
                None,
            )
            .await
        {
            error!(submission_id = %submission.id, error = %e, "failed to mark submission active");
            return;
        }

        if let Err(e) = self
            .db
            .set_active_submission(&submission.id, &submission.agent_id)
            .await
        {
            warn!(submission_id = %submission.id, error = %e, "failed to set active submission");
        }

        let agent = match self.db.find_agent(&submission.agent_id).await {
            Ok(Some(agent)) => agent,
            _ => {
                warn!(agent_id = %submission.agent_id, "agent vanished before notification");
                return;
            }
        };

        self.hub
            .send_build_status(
                &agent.user_id,
                BuildStatusPayload {
                    submission_id: submission.id.clone(),
                    status: SubmissionStatus::Active.to_string(),
                    message: "Build completed successfully".to_string(),
                    image_url: submission.docker_image_url.clone().unwrap_or_default(),
                },
            )
            .await;

        if let Err(e) = self
            .enqueuer
            .enqueue(&submission.agent_id, &submission.environment_id)
            .await
        {
            error!(
                agent_id = %submission.agent_id,
                environment_id = %submission.environment_id,
                error = %e,
                "failed to enqueue agent for matchmaking"
            );
        } else {
            info!(
                agent_id = %submission.agent_id,
                environment_id = %submission.environment_id,
                "agent auto-enqueued for matchmaking"
            );
        }
    }

    async fn handle_build_failure(&self, submission: Submission) {
        warn!(
            submission_id = %submission.id,
            job_name = submission.build_job_name.as_deref().unwrap_or(""),
            "build failed"
        );

        let build_log = self.fetch_build_log(&submission).await;
        let error_message = match &build_log {
            Some(logs) => failure_message(logs),
            None => "Build failed: no pod information available".to_string(),
        };

        if let Err(e) = self
            .db
            .update_submission_status(
                &submission.id,
                SubmissionStatus::BuildFailed,
                build_log.as_deref(),
                Some(&error_message),
            )
            .await
        {
            error!(submission_id = %submission.id, error = %e, "failed to mark submission build_failed");
            return;
        }

        if let Ok(Some(agent)) = self.db.find_agent(&submission.agent_id).await {
            self.hub
                .send_build_status(
                    &agent.user_id,
                    BuildStatusPayload {
                        submission_id: submission.id.clone(),
                        status: SubmissionStatus::BuildFailed.to_string(),
                        message: error_message,
                        image_url: String::new(),
                    },
                )
                .await;
        }
        // Failed builds are not enqueued for matchmaking.
    }

    async fn fetch_build_log(&self, submission: &Submission) -> Option<String> {
        let pod_name = submission.build_pod_name.as_deref().filter(|p| !p.is_empty())?;

        match self.orchestrator.pod_logs(pod_name).await {
            Ok(logs) => Some(logs),
            Err(e) => {
                warn!(
                    submission_id = %submission.id,
                    pod_name = %pod_name,
                    error = %e,
                    "failed to fetch build logs"
                );
                None
            }
        }
    }
}

/// Error message for a failed build: the log tail, capped at 500 chars.
fn failure_message(logs: &str) -> String {
    let count = logs.chars().count();
    if count > 500 {
        let tail: String = logs.chars().skip(count - 500).collect();
        format!("Build failed. Last 500 chars: {tail}")
    } else {
        format!("Build failed: {logs}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::BuildConfig;
    use crate::notifier::Hub;
    use crate::orchestrator::{JobSnapshot, JobSpec, JobStatus, OrchestratorError};
    use arena_coord::bus::MatchmakingBus;
    use std::collections::HashMap;
    use tokio::sync::{mpsc, Mutex};

    /// Orchestrator fake with an injectable watch stream.
    struct FakeOrchestrator {
        watch_tx: Mutex<Option<mpsc::Sender<JobEvent>>>,
        logs: String,
    }

    impl FakeOrchestrator {
        fn new(logs: impl Into<String>) -> Arc<Self> {
            Arc::new(Self {
                watch_tx: Mutex::new(None),
                logs: logs.into(),
            })
        }

        async fn emit(&self, event: JobEvent) {
            let guard = self.watch_tx.lock().await;
            guard
                .as_ref()
                .expect("watch not established")
                .send(event)
                .await
                .unwrap();
        }
    }

    impl Orchestrator for FakeOrchestrator {
        async fn create_job(&self, _: &JobSpec) -> Result<(), OrchestratorError> {
            Ok(())
        }

        async fn job_status(&self, _: &str) -> Result<JobStatus, OrchestratorError> {
            Ok(JobStatus::default())
        }

        async fn watch_jobs(&self, _: &str) -> Result<mpsc::Receiver<JobEvent>, OrchestratorError> {
            let (tx, rx) = mpsc::channel(16);
            *self.watch_tx.lock().await = Some(tx);
            Ok(rx)
        }

        async fn first_pod_name(&self, job_name: &str) -> Result<Option<String>, OrchestratorError> {
            Ok(Some(format!("{job_name}-pod0")))
        }

        async fn pod_logs(&self, _: &str) -> Result<String, OrchestratorError> {
            Ok(self.logs.clone())
        }
    }

    fn job_event(event_type: JobEventType, submission_id: &str, status: JobStatus) -> JobEvent {
        let mut labels = HashMap::new();
        labels.insert("app".to_string(), "rl-arena".to_string());
        labels.insert("type".to_string(), "agent-build".to_string());
        labels.insert(SUBMISSION_ID_LABEL.to_string(), submission_id.to_string());

        JobEvent {
            event_type,
            job: JobSnapshot {
                name: format!("build-{submission_id}"),
                labels,
                status,
            },
        }
    }

    struct Harness {
        db: Database,
        orchestrator: Arc<FakeOrchestrator>,
        hub: HubHandle,
        _shutdown_tx: watch::Sender<bool>,
        _monitor_task: JoinHandle<()>,
    }

    async fn start_monitor(logs: &str) -> Harness {
        let db = Database::open_in_memory().await.unwrap();
        db.create_user("u1", "alice", "alice@example.com", "hash")
            .await
            .unwrap();
        db.create_agent("a1", "u1", "bot", None, "pong").await.unwrap();
        db.create_submission("s1", "a1", "https://github.com/u/agent.git")
            .await
            .unwrap();

        let orchestrator = FakeOrchestrator::new(logs);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (hub, _hub_task) = Hub::spawn(16, shutdown_rx.clone());
        let bus = MatchmakingBus::new(64);
        let enqueuer = Enqueuer::new(db.clone(), bus);

        let dispatcher = Arc::new(BuildDispatcher::new(
            db.clone(),
            Arc::clone(&orchestrator),
            BuildConfig {
                namespace: "rl-arena".into(),
                registry_url: "registry.local".into(),
                registry_secret: "secret".into(),
                local_cluster: false,
            },
        ));

        let monitor = Arc::new(BuildMonitor::new(
            db.clone(),
            Arc::clone(&orchestrator),
            dispatcher,
            hub.clone(),
            enqueuer,
        ));
        let monitor_task = monitor.start(shutdown_rx);

        // Let the recovery pass run and the watch establish.
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            if orchestrator.watch_tx.lock().await.is_some() {
                break;
            }
        }

        Harness {
            db,
            orchestrator,
            hub,
            _shutdown_tx: shutdown_tx,
            _monitor_task: monitor_task,
        }
    }

    async fn wait_for_status(db: &Database, id: &str, status: &str) -> Submission {
        for _ in 0..100 {
            let submission = db.get_submission(id).await.unwrap();
            if submission.status == status {
                return submission;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("submission {id} never reached {status}");
    }

    #[tokio::test]
    async fn pending_submissions_are_dispatched_on_startup() {
        let h = start_monitor("").await;

        let submission = wait_for_status(&h.db, "s1", "building").await;
        assert_eq!(submission.build_job_name.as_deref(), Some("build-s1"));
        assert_eq!(submission.build_pod_name.as_deref(), Some("build-s1-pod0"));
    }

    #[tokio::test]
    async fn success_event_activates_and_enqueues() {
        let h = start_monitor("step 1/4 ok\nbuild complete").await;
        wait_for_status(&h.db, "s1", "building").await;

        let (_cid, mut notifications) = h.hub.register("u1").await;

        h.orchestrator
            .emit(job_event(
                JobEventType::Modified,
                "s1",
                JobStatus {
                    active: 0,
                    succeeded: 1,
                    failed: 0,
                },
            ))
            .await;

        let submission = wait_for_status(&h.db, "s1", "active").await;
        assert!(submission.build_log.as_deref().unwrap().contains("build complete"));

        // The submission became the agent's active one.
        let agent = h.db.get_agent("a1").await.unwrap();
        assert_eq!(agent.active_submission_id.as_deref(), Some("s1"));

        // The owner got the build_status notification.
        let frame = notifications.recv().await.unwrap();
        assert_eq!(frame.frame_type, "build_status");
        assert_eq!(frame.payload["submissionId"], "s1");
        assert_eq!(frame.payload["status"], "active");

        // The agent entered the matchmaking queue for its environment.
        let entry = h.db.find_queue_entry("a1", "pong").await.unwrap().unwrap();
        assert_eq!(entry.status, "waiting");
        assert_eq!(entry.elo_rating, 1200);
    }

    #[tokio::test]
    async fn failure_event_records_log_tail_and_does_not_enqueue() {
        // A 4 KB log: the error message must carry only the last 500 chars.
        let long_log = "x".repeat(3500) + &"tail-marker-".repeat(50);
        let h = start_monitor(&long_log).await;
        wait_for_status(&h.db, "s1", "building").await;

        let (_cid, mut notifications) = h.hub.register("u1").await;

        h.orchestrator
            .emit(job_event(
                JobEventType::Modified,
                "s1",
                JobStatus {
                    active: 0,
                    succeeded: 0,
                    failed: 1,
                },
            ))
            .await;

        let submission = wait_for_status(&h.db, "s1", "build_failed").await;
        let message = submission.error_message.unwrap();
        assert!(message.starts_with("Build failed. Last 500 chars: "));
        let tail = message.strip_prefix("Build failed. Last 500 chars: ").unwrap();
        assert_eq!(tail.chars().count(), 500);
        assert!(tail.ends_with("tail-marker-"));

        let frame = notifications.recv().await.unwrap();
        assert_eq!(frame.payload["status"], "build_failed");

        // Failed builds never enter matchmaking.
        assert!(h.db.find_queue_entry("a1", "pong").await.unwrap().is_none());
        let agent = h.db.get_agent("a1").await.unwrap();
        assert!(agent.active_submission_id.is_none());
    }

    #[tokio::test]
    async fn terminal_submissions_ignore_late_events() {
        let h = start_monitor("logs").await;
        wait_for_status(&h.db, "s1", "building").await;

        h.orchestrator
            .emit(job_event(
                JobEventType::Modified,
                "s1",
                JobStatus {
                    active: 0,
                    succeeded: 0,
                    failed: 1,
                },
            ))
            .await;
        wait_for_status(&h.db, "s1", "build_failed").await;

        // A duplicate success event must not resurrect the submission.
        h.orchestrator
            .emit(job_event(
                JobEventType::Modified,
                "s1",
                JobStatus {
                    active: 0,
                    succeeded: 1,
                    failed: 0,
                },
            ))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let submission = h.db.get_submission("s1").await.unwrap();
        assert_eq!(submission.status, "build_failed");
    }

    #[tokio::test]
    async fn running_events_are_a_no_op() {
        let h = start_monitor("").await;
        wait_for_status(&h.db, "s1", "building").await;

        h.orchestrator
            .emit(job_event(
                JobEventType::Modified,
                "s1",
                JobStatus {
                    active: 1,
                    succeeded: 0,
                    failed: 0,
                },
            ))
            .await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let submission = h.db.get_submission("s1").await.unwrap();
        assert_eq!(submission.status, "building");
    }

    #[test]
    fn failure_message_short_log_is_verbatim() {
        assert_eq!(failure_message("boom"), "Build failed: boom");
    }
}
