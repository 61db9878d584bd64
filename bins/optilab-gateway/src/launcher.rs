/// Job Launcher - Sandbox Job Lifecycle
///
/// **Core Responsibility:**
/// Translate execution parameters into a one-shot sandboxed job on the
/// container engine, observe its terminal state, and clean it up.
///
/// **Critical Architectural Boundary:**
/// - The launcher knows HOW jobs run (engine API, limits, labels)
/// - The launcher does NOT classify log lines or extract results
/// - Job failure is terminal: no engine-side restarts, retries belong
///   to the caller's own policy
///
/// **Job Safety Rails:**
/// - Network disabled, fixed memory/CPU limits
/// - A watchdog kills the container at the active deadline
/// - A TTL reaper removes the container even if normal cleanup never ran
use anyhow::{bail, Context, Result};
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::models::{ContainerStateStatusEnum, HostConfig};
use bollard::Docker;
use optilab_common::types::ExecutionRecord;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::RuntimeSettings;
use crate::extract;

pub const JOB_NAME_LABEL: &str = "optilab.job-name";
pub const EXECUTION_ID_LABEL: &str = "optilab.execution-id";
pub const NAMESPACE_LABEL: &str = "optilab.namespace";

/// Handle to a submitted job. Collaborators hold this, never the
/// execution record itself.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub job_name: String,
    pub execution_id: String,
    pub container_id: String,
}

/// The running compute unit backing a job, source of live log output.
#[derive(Debug, Clone)]
pub struct PodHandle {
    pub container_id: String,
}

#[derive(Debug, Clone)]
pub enum JobTerminalState {
    Succeeded,
    Failed { exit_code: i64, status: String },
}

impl JobTerminalState {
    pub fn succeeded(&self) -> bool {
        matches!(self, JobTerminalState::Succeeded)
    }
}

/// The engine's behavior for an empty-but-present namespace value is
/// undefined, so this is rejected explicitly before any engine call.
pub fn validate_namespace(namespace: &str) -> Result<String> {
    let trimmed = namespace.trim();
    if trimmed.is_empty() {
        bail!("validation failed: job namespace must not be empty");
    }
    Ok(trimmed.to_string())
}

#[derive(Clone)]
pub struct JobLauncher {
    docker: Docker,
    settings: Arc<RuntimeSettings>,
}

impl JobLauncher {
    pub fn new(settings: Arc<RuntimeSettings>) -> Result<Self> {
        let docker =
            Docker::connect_with_local_defaults().context("Failed to connect to container engine")?;
        Ok(Self { docker, settings })
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    pub fn effective_deadline(&self, record: &ExecutionRecord) -> Duration {
        effective_deadline(&self.settings, record)
    }

    /// Build and start the job for an execution. Validation failures
    /// surface before anything reaches the engine.
    pub async fn submit(&self, record: &ExecutionRecord) -> Result<JobHandle> {
        let namespace = validate_namespace(&self.settings.namespace)?;
        let deadline = self.effective_deadline(record);

        let config = job_container_config(record, &self.settings, &namespace);

        let create_options = CreateContainerOptions {
            name: record.job_name.as_str(),
            platform: None,
        };

        let container = self
            .docker
            .create_container(Some(create_options), config)
            .await
            .context("Failed to create job container")?;
        let container_id = container.id.clone();

        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("Failed to start job container")?;

        info!(
            execution_id = %record.execution_id,
            job_name = %record.job_name,
            deadline_secs = deadline.as_secs(),
            "Job submitted"
        );

        self.spawn_deadline_watchdog(&container_id, &record.execution_id, deadline);
        self.spawn_ttl_reaper(&container_id, deadline);

        Ok(JobHandle {
            job_name: record.job_name.clone(),
            execution_id: record.execution_id.clone(),
            container_id,
        })
    }

    /// Scheduler-enforced hard ceiling on job runtime. Runs detached so
    /// it survives the orchestrator task that submitted the job.
    fn spawn_deadline_watchdog(&self, container_id: &str, execution_id: &str, deadline: Duration) {
        let docker = self.docker.clone();
        let container_id = container_id.to_string();
        let execution_id = execution_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let running = docker
                .inspect_container(&container_id, None::<InspectContainerOptions>)
                .await
                .ok()
                .and_then(|i| i.state)
                .and_then(|s| s.running)
                .unwrap_or(false);
            if running {
                warn!(
                    execution_id = %execution_id,
                    deadline_secs = deadline.as_secs(),
                    "Job exceeded active deadline, killing container"
                );
                if let Err(e) = docker
                    .kill_container(&container_id, None::<KillContainerOptions<String>>)
                    .await
                {
                    warn!(execution_id = %execution_id, error = %e, "Failed to kill expired job");
                }
            }
        });
    }

    /// Cleanup backstop: even if delete() is never reached, the
    /// container self-removes once the deadline plus TTL has passed.
    fn spawn_ttl_reaper(&self, container_id: &str, deadline: Duration) {
        let docker = self.docker.clone();
        let container_id = container_id.to_string();
        let ttl = Duration::from_secs(self.settings.ttl_after_finish_secs);
        tokio::spawn(async move {
            tokio::time::sleep(deadline + ttl).await;
            let remove_options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            match docker.remove_container(&container_id, Some(remove_options)).await {
                Ok(()) => debug!(container_id = %container_id, "TTL reaper removed leftover job"),
                // Normal cleanup already got it.
                Err(_) => {}
            }
        });
    }

    /// Poll the job until it reaches a terminal state. A 404 on the job
    /// resource is a hard error (deleted under us, usually a client
    /// stop); exhausting the poll budget is a timeout.
    pub async fn wait_for_completion(
        &self,
        handle: &JobHandle,
        redis_conn: &mut redis::aio::ConnectionManager,
    ) -> Result<JobTerminalState> {
        let interval = Duration::from_secs(self.settings.status_poll_interval_secs);

        for poll in 0..self.settings.status_poll_budget {
            match optilab_common::redis::is_cancel_requested(redis_conn, &handle.execution_id).await
            {
                Ok(true) => {
                    info!(execution_id = %handle.execution_id, "Cancellation requested, deleting job");
                    self.delete(handle).await;
                    bail!("execution cancelled by client");
                }
                Ok(false) => {}
                Err(e) => {
                    // Do not fail an execution over a flaky flag read.
                    warn!(execution_id = %handle.execution_id, error = %e, "Cancellation check failed");
                }
            }

            let inspect = match self
                .docker
                .inspect_container(&handle.container_id, None::<InspectContainerOptions>)
                .await
            {
                Ok(inspect) => inspect,
                Err(bollard::errors::Error::DockerResponseServerError {
                    status_code: 404, ..
                }) => {
                    bail!(
                        "job {} no longer exists (404) while polling",
                        handle.job_name
                    );
                }
                Err(e) => {
                    warn!(
                        execution_id = %handle.execution_id,
                        poll = poll,
                        error = %e,
                        "Status poll failed"
                    );
                    tokio::time::sleep(interval).await;
                    continue;
                }
            };

            if let Some(state) = inspect.state {
                match state.status {
                    Some(ContainerStateStatusEnum::EXITED)
                    | Some(ContainerStateStatusEnum::DEAD) => {
                        let exit_code = state.exit_code.unwrap_or(-1);
                        if exit_code == 0 {
                            info!(execution_id = %handle.execution_id, "Job succeeded");
                            return Ok(JobTerminalState::Succeeded);
                        }
                        let status =
                            serde_json::to_string(&state).unwrap_or_else(|_| "unknown".to_string());
                        info!(
                            execution_id = %handle.execution_id,
                            exit_code = exit_code,
                            "Job failed"
                        );
                        return Ok(JobTerminalState::Failed { exit_code, status });
                    }
                    _ => {}
                }
            }

            tokio::time::sleep(interval).await;
        }

        bail!(
            "timed out waiting for job {} after {} polls",
            handle.job_name,
            self.settings.status_poll_budget
        )
    }

    /// Best-effort removal. Failures are logged and swallowed: the TTL
    /// reaper is the backstop, and deletion must never block the
    /// caller's return path.
    pub async fn delete(&self, handle: &JobHandle) {
        let remove_options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self
            .docker
            .remove_container(&handle.container_id, Some(remove_options))
            .await
        {
            Ok(()) => {
                debug!(execution_id = %handle.execution_id, "Job deleted");
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(execution_id = %handle.execution_id, "Job already gone");
            }
            Err(e) => {
                warn!(execution_id = %handle.execution_id, error = %e, "Failed to delete job");
            }
        }
    }

    /// Find the compute unit backing a job by its label. Absent is not
    /// an error: the caller polls with backoff until it appears.
    pub async fn locate_pod(&self, handle: &JobHandle) -> Result<Option<PodHandle>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", JOB_NAME_LABEL, handle.job_name)],
        );

        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .context("Failed to list containers for job")?;

        Ok(containers
            .into_iter()
            .find_map(|c| c.id)
            .map(|container_id| PodHandle { container_id }))
    }
}

/// Effective hard deadline for one execution: the request may lower the
/// configured ceiling, never raise it.
pub fn effective_deadline(settings: &RuntimeSettings, record: &ExecutionRecord) -> Duration {
    let configured = settings.active_deadline_secs;
    let requested = record.request.timeout_secs.unwrap_or(configured);
    Duration::from_secs(requested.min(configured))
}

/// One container per job: fixed image, no network, bounded resources,
/// environment carrying the repository coordinates and execution id.
fn job_container_config(
    record: &ExecutionRecord,
    settings: &RuntimeSettings,
    namespace: &str,
) -> Config<String> {
    let request = &record.request;
    let env = vec![
        format!("EXECUTION_ID={}", record.execution_id),
        format!("PROBLEM_REPO={}", request.problem_name),
        format!("PROBLEM_USERNAME={}", request.problem_owner),
        format!("OPTIMIZER_REPO={}", request.optimizer_name),
        format!("OPTIMIZER_USERNAME={}", request.optimizer_owner),
        format!(
            "PROBLEM_PARAMS={}",
            serde_json::Value::Object(request.problem_params.clone())
        ),
        format!(
            "OPTIMIZER_PARAMS={}",
            serde_json::Value::Object(request.optimizer_params.clone())
        ),
        format!("GITEA_URL={}", settings.content_base_url),
        format!(
            "RESULT_PATH={}",
            extract::artifact_path(&record.execution_id)
        ),
    ];

    let mut labels = HashMap::new();
    labels.insert(JOB_NAME_LABEL.to_string(), record.job_name.clone());
    labels.insert(
        EXECUTION_ID_LABEL.to_string(),
        record.execution_id.clone(),
    );
    labels.insert(NAMESPACE_LABEL.to_string(), namespace.to_string());

    Config {
        image: Some(settings.image.clone()),
        env: Some(env),
        labels: Some(labels),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        network_disabled: Some(true),
        host_config: Some(HostConfig {
            memory: Some(settings.memory_limit_bytes),
            memory_reservation: Some(settings.memory_reservation_bytes),
            nano_cpus: Some(settings.nano_cpus),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optilab_common::types::{new_execution_id, ExecutionRequest};
    use serde_json::Map;

    fn record() -> ExecutionRecord {
        ExecutionRecord::new(
            new_execution_id(),
            ExecutionRequest {
                problem_name: "tsp".into(),
                problem_owner: "alice".into(),
                optimizer_name: "genetic".into(),
                optimizer_owner: "bob".into(),
                problem_params: Map::new(),
                optimizer_params: Map::new(),
                timeout_secs: None,
            },
        )
    }

    #[test]
    fn empty_namespace_is_rejected() {
        assert!(validate_namespace("").is_err());
        assert!(validate_namespace("   ").is_err());
        assert!(validate_namespace("\t\n").is_err());
        assert_eq!(validate_namespace(" optilab ").unwrap(), "optilab");
    }

    #[test]
    fn namespace_error_is_a_validation_error() {
        let e = validate_namespace("").unwrap_err();
        let classified = crate::errors::classify(&format!("{:#}", e), None, "submit");
        assert_eq!(classified.kind, crate::errors::ErrorKind::Validation);
        assert!(!classified.retryable);
    }

    #[test]
    fn container_config_is_sandboxed() {
        let record = record();
        let settings = RuntimeSettings::default();
        let config = job_container_config(&record, &settings, "optilab");

        assert_eq!(config.network_disabled, Some(true));
        let host = config.host_config.unwrap();
        assert_eq!(host.memory, Some(settings.memory_limit_bytes));
        assert_eq!(host.memory_reservation, Some(settings.memory_reservation_bytes));
        assert_eq!(host.nano_cpus, Some(settings.nano_cpus));

        let labels = config.labels.unwrap();
        assert_eq!(labels[JOB_NAME_LABEL], record.job_name);
        assert_eq!(labels[EXECUTION_ID_LABEL], record.execution_id);
        assert_eq!(labels[NAMESPACE_LABEL], "optilab");

        let env = config.env.unwrap();
        assert!(env.iter().any(|e| e == &format!("EXECUTION_ID={}", record.execution_id)));
        assert!(env.iter().any(|e| e == "PROBLEM_REPO=tsp"));
        assert!(env.iter().any(|e| e == "OPTIMIZER_USERNAME=bob"));
        assert!(env
            .iter()
            .any(|e| e.starts_with("RESULT_PATH=/workspace/results/")));
    }

    #[test]
    fn request_timeout_cannot_exceed_configured_deadline() {
        let settings = RuntimeSettings::default();
        let mut record = record();

        record.request.timeout_secs = Some(60);
        assert_eq!(
            effective_deadline(&settings, &record),
            Duration::from_secs(60)
        );

        record.request.timeout_secs = Some(100_000);
        assert_eq!(
            effective_deadline(&settings, &record),
            Duration::from_secs(settings.active_deadline_secs)
        );

        record.request.timeout_secs = None;
        assert_eq!(
            effective_deadline(&settings, &record),
            Duration::from_secs(settings.active_deadline_secs)
        );
    }
}
