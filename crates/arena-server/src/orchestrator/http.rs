//! HTTP orchestrator client.
//!
//! Speaks the orchestrator's REST API: job creation and lookup under
//! `/namespaces/{ns}/jobs`, pod listing and logs under
//! `/namespaces/{ns}/pods`, and an NDJSON watch stream on
//! `/namespaces/{ns}/jobs?watch=true`.

use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{JobEvent, JobSnapshot, JobSpec, JobStatus, Orchestrator, OrchestratorError};

/// Cap on fetched pod log size.
const MAX_LOG_CHARS: usize = 10_000;

/// REST client for the orchestrator API.
#[derive(Debug, Clone)]
pub struct HttpOrchestrator {
    http: reqwest::Client,
    base_url: String,
    namespace: String,
}

impl HttpOrchestrator {
    pub fn new(
        base_url: impl Into<String>,
        namespace: impl Into<String>,
    ) -> Result<Self, OrchestratorError> {
        let http = reqwest::Client::builder()
            .connect_timeout(std::time::Duration::from_secs(10))
            .build()?;

        let base_url: String = base_url.into();
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            namespace: namespace.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/namespaces/{}{}", self.base_url, self.namespace, path)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response, OrchestratorError> {
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(OrchestratorError::NotFound(
                resp.text().await.unwrap_or_default(),
            ));
        }
        if !status.is_success() {
            return Err(OrchestratorError::Api {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(resp)
    }
}

impl Orchestrator for HttpOrchestrator {
    async fn create_job(&self, spec: &JobSpec) -> Result<(), OrchestratorError> {
        let resp = self.http.post(self.url("/jobs")).json(spec).send().await?;
        Self::check(resp).await?;
        Ok(())
    }

    async fn job_status(&self, name: &str) -> Result<JobStatus, OrchestratorError> {
        let resp = self
            .http
            .get(self.url(&format!("/jobs/{name}")))
            .send()
            .await?;
        let snapshot: JobSnapshot = Self::check(resp).await?.json().await?;
        Ok(snapshot.status)
    }

    async fn watch_jobs(
        &self,
        label_selector: &str,
    ) -> Result<mpsc::Receiver<JobEvent>, OrchestratorError> {
        let resp = self
            .http
            .get(self.url("/jobs"))
            .query(&[("watch", "true"), ("labelSelector", label_selector)])
            .send()
            .await?;
        let resp = Self::check(resp).await?;

        let (tx, rx) = mpsc::channel(64);

        // Decode the NDJSON stream into events until the connection drops;
        // closing the sender tells the monitor to reconnect.
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut buffer = Vec::new();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(error = %e, "job watch stream error");
                        return;
                    }
                };

                buffer.extend_from_slice(&chunk);
                while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&line);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }

                    match serde_json::from_str::<JobEvent>(line) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            debug!(error = %e, "skipping undecodable watch line");
                        }
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn first_pod_name(&self, job_name: &str) -> Result<Option<String>, OrchestratorError> {
        #[derive(serde::Deserialize)]
        struct PodInfo {
            name: String,
        }

        let resp = self
            .http
            .get(self.url("/pods"))
            .query(&[("labelSelector", format!("job={job_name}"))])
            .send()
            .await?;
        let pods: Vec<PodInfo> = Self::check(resp).await?.json().await?;

        Ok(pods.into_iter().next().map(|p| p.name))
    }

    async fn pod_logs(&self, pod_name: &str) -> Result<String, OrchestratorError> {
        let resp = self
            .http
            .get(self.url(&format!("/pods/{pod_name}/log")))
            .send()
            .await?;
        let text = Self::check(resp).await?.text().await?;

        if text.chars().count() > MAX_LOG_CHARS {
            Ok(text.chars().take(MAX_LOG_CHARS).collect())
        } else {
            Ok(text)
        }
    }
}
