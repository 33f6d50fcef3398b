//! Build dispatcher: turns a submission into an isolated build job.
//!
//! Each build is one labelled batch job: an init container materializes the
//! source into a shared scratch volume (git clone for remote URLs, a
//! synthesized placeholder for local paths), then a builder container
//! produces the image `{registry}/{agent}:{submission}-v{version}` and
//! pushes it. Finished jobs are garbage-collected by the orchestrator after
//! an hour.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use arena_core::error::{Result, ServiceError};

use crate::orchestrator::{
    ContainerSpec, JobSpec, Orchestrator, APP_LABEL, BUILD_TYPE_LABEL, SUBMISSION_ID_LABEL,
};
use crate::storage::{Database, Submission};

const BACKOFF_LIMIT: u32 = 3;
const TTL_AFTER_FINISHED_SECS: u32 = 3600;
const POD_POLL_TIMEOUT: Duration = Duration::from_secs(30);
const POD_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Build environment settings.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    pub namespace: String,
    pub registry_url: String,
    pub registry_secret: String,
    /// Local single-node development cluster (docker-in-docker builder
    /// instead of the registry-pushing builder).
    pub local_cluster: bool,
}

/// Creates build jobs in the orchestrator and records their handles.
pub struct BuildDispatcher<O: Orchestrator> {
    db: Database,
    orchestrator: Arc<O>,
    config: BuildConfig,
}

impl<O: Orchestrator> BuildDispatcher<O> {
    pub fn new(db: Database, orchestrator: Arc<O>, config: BuildConfig) -> Self {
        Self {
            db,
            orchestrator,
            config,
        }
    }

    /// Create the build job for a submission and record the job handle,
    /// target image tag, and (best-effort) first pod name on its row.
    pub async fn dispatch_build(&self, submission: &Submission) -> Result<()> {
        let image_tag = format!(
            "{}/{}:{}-v{}",
            self.config.registry_url, submission.agent_id, submission.id, submission.version
        );
        let job_name = format!("build-{}", submission.id);

        let spec = self.build_job_spec(&job_name, &submission.code_url, &image_tag, &submission.id);

        self.orchestrator
            .create_job(&spec)
            .await
            .map_err(|e| ServiceError::Orchestrator(e.to_string()))?;

        self.db
            .update_submission_build_info(&submission.id, Some(&job_name), Some(&image_tag), None)
            .await?;

        info!(
            submission_id = %submission.id,
            job_name = %job_name,
            image_tag = %image_tag,
            "build job created"
        );

        // The pod appears asynchronously; poll briefly so its name is
        // available for log retrieval later.
        match self.wait_for_pod(&job_name).await {
            Some(pod_name) => {
                self.db
                    .update_submission_build_info(&submission.id, None, None, Some(&pod_name))
                    .await?;
            }
            None => {
                warn!(
                    submission_id = %submission.id,
                    job_name = %job_name,
                    "no build pod appeared within the poll window"
                );
            }
        }

        Ok(())
    }

    async fn wait_for_pod(&self, job_name: &str) -> Option<String> {
        let deadline = tokio::time::Instant::now() + POD_POLL_TIMEOUT;

        while tokio::time::Instant::now() < deadline {
            match self.orchestrator.first_pod_name(job_name).await {
                Ok(Some(pod_name)) => return Some(pod_name),
                Ok(None) => {}
                Err(e) => {
                    debug!(job_name = %job_name, error = %e, "pod lookup failed, retrying");
                }
            }
            tokio::time::sleep(POD_POLL_INTERVAL).await;
        }

        None
    }

    fn build_job_spec(
        &self,
        job_name: &str,
        code_url: &str,
        image_tag: &str,
        submission_id: &str,
    ) -> JobSpec {
        let mut labels = HashMap::new();
        labels.insert("app".to_string(), APP_LABEL.to_string());
        labels.insert("type".to_string(), BUILD_TYPE_LABEL.to_string());
        labels.insert(SUBMISSION_ID_LABEL.to_string(), submission_id.to_string());

        let mut pod_labels = labels.clone();
        pod_labels.insert("job".to_string(), job_name.to_string());

        let is_remote = code_url.starts_with("http://") || code_url.starts_with("https://");
        let init = if is_remote {
            ContainerSpec {
                name: "git-clone".to_string(),
                image: "alpine/git:latest".to_string(),
                command: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("git clone {code_url} /workspace"),
                ],
                args: vec![],
            }
        } else {
            // Local paths cannot be mounted into the cluster; synthesize a
            // minimal agent so the build still exercises the pipeline.
            ContainerSpec {
                name: "create-code".to_string(),
                image: "busybox:latest".to_string(),
                command: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    concat!(
                        "printf 'import gymnasium as gym\\nenv = gym.make(\"CartPole-v1\")\\n' > /workspace/agent.py\n",
                        "printf 'FROM python:3.10-slim\\nWORKDIR /app\\nRUN pip install gymnasium\\nCOPY agent.py /app/\\nCMD [\"python\", \"agent.py\"]\\n' > /workspace/Dockerfile\n",
                    )
                    .to_string(),
                ],
                args: vec![],
            }
        };

        let builder = if self.config.local_cluster {
            ContainerSpec {
                name: "docker-build".to_string(),
                image: "docker:24-dind".to_string(),
                command: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!(
                        "dockerd-entrypoint.sh & sleep 5 && cd /workspace && docker build -t {image_tag} ."
                    ),
                ],
                args: vec![],
            }
        } else {
            ContainerSpec {
                name: "builder".to_string(),
                image: "gcr.io/kaniko-project/executor:latest".to_string(),
                command: vec![],
                args: vec![
                    "--dockerfile=/workspace/Dockerfile".to_string(),
                    "--context=/workspace".to_string(),
                    format!("--destination={image_tag}"),
                    "--cache=true".to_string(),
                    "--cache-ttl=24h".to_string(),
                    format!("--push-credentials-secret={}", self.config.registry_secret),
                ],
            }
        };

        JobSpec {
            name: job_name.to_string(),
            namespace: self.config.namespace.clone(),
            labels,
            pod_labels,
            backoff_limit: BACKOFF_LIMIT,
            ttl_seconds_after_finished: TTL_AFTER_FINISHED_SECS,
            init_containers: vec![init],
            containers: vec![builder],
        }
    }
}
