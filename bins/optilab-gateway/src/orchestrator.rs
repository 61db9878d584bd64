/// Streaming Orchestrator - Per-Execution Lifecycle
///
/// **Responsibility:**
/// Drive one execution end to end: register the channel, submit the
/// job, stream classified logs while polling for completion, extract
/// the result, tear the job down, and emit exactly one terminal event.
///
/// **Failure Semantics:**
/// Any failure at any phase lands in Done(error). Job deletion and
/// terminal-event emission are both best-effort and double-guarded so
/// neither can mask the failure that got us there.
use anyhow::{bail, Context, Result};
use chrono::Utc;
use optilab_common::redis as record_store;
use optilab_common::types::{
    ExecutionRecord, ExecutionResult, ExecutionState, LogEvent, StreamEnvelope, SubmissionRow,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::errors::{self, with_retry};
use crate::extract;
use crate::launcher::{JobHandle, JobTerminalState, PodHandle};
use crate::metrics;
use crate::stream;
use crate::AppState;

/// Ring of recent events kept per execution to serve `request_logs`.
const RECENT_LOG_CAP: usize = 500;

/// Phases of the per-execution state machine, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Registering,
    Submitting,
    Streaming,
    Extracting,
    CleaningUp,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Registering => "registering",
            Phase::Submitting => "submitting",
            Phase::Streaming => "streaming",
            Phase::Extracting => "extracting",
            Phase::CleaningUp => "cleaning_up",
        }
    }

    fn progress(&self) -> f64 {
        match self {
            Phase::Registering => 0.05,
            Phase::Submitting => 0.15,
            Phase::Streaming => 0.4,
            Phase::Extracting => 0.8,
            Phase::CleaningUp => 0.95,
        }
    }
}

/// In-memory owner of execution records and their recent log rings.
/// All mutation is keyed by execution id; no multi-key transactions.
#[derive(Clone, Default)]
pub struct ExecutionTracker {
    records: Arc<RwLock<HashMap<String, ExecutionRecord>>>,
    logs: Arc<RwLock<HashMap<String, VecDeque<LogEvent>>>>,
}

impl ExecutionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, record: ExecutionRecord) {
        let mut records = self.records.write().await;
        records.insert(record.execution_id.clone(), record);
    }

    pub async fn get(&self, execution_id: &str) -> Option<ExecutionRecord> {
        self.records.read().await.get(execution_id).cloned()
    }

    pub async fn update_state(&self, execution_id: &str, state: ExecutionState) {
        let mut records = self.records.write().await;
        if let Some(record) = records.get_mut(execution_id) {
            record.state = state;
            if state.is_terminal() {
                record.finished_at = Some(Utc::now());
            }
        }
    }

    pub async fn append_log(&self, execution_id: &str, event: LogEvent) {
        let mut logs = self.logs.write().await;
        let ring = logs.entry(execution_id.to_string()).or_default();
        if ring.len() >= RECENT_LOG_CAP {
            ring.pop_front();
        }
        ring.push_back(event);
    }

    pub async fn recent_logs(&self, execution_id: &str, limit: usize) -> Vec<LogEvent> {
        let logs = self.logs.read().await;
        logs.get(execution_id)
            .map(|ring| {
                let skip = ring.len().saturating_sub(limit);
                ring.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    /// Drop all state for an execution. Idempotent.
    pub async fn remove(&self, execution_id: &str) {
        self.records.write().await.remove(execution_id);
        self.logs.write().await.remove(execution_id);
    }

    pub async fn in_flight(&self) -> usize {
        self.records.read().await.len()
    }
}

/// Run one execution to completion. Spawned as an independent task per
/// request; never panics the gateway and always emits one terminal
/// event for any execution that got past registration.
pub async fn run_execution(state: Arc<AppState>, record: ExecutionRecord) {
    let execution_id = record.execution_id.clone();
    let started = Instant::now();
    metrics::EXECUTIONS_STARTED.inc();

    // Registering: the record becomes visible to the channel handlers.
    state.tracker.insert(record.clone()).await;
    info!(
        execution_id = %execution_id,
        phase = Phase::Registering.as_str(),
        problem = %record.request.problem_repo(),
        optimizer = %record.request.optimizer_repo(),
        "Execution registered"
    );

    let (result, terminal) = match drive(&state, &record, started).await {
        Ok(result) => {
            let terminal = if result.success {
                ExecutionState::Completed
            } else {
                ExecutionState::Failed
            };
            (result, terminal)
        }
        Err(e) => {
            let classified = errors::classify(
                &format!("{:#}", e),
                errors::status_code_of(&e),
                "cluster_execution",
            );
            state.errors.record(classified.clone()).await;

            let terminal = if classified.kind == errors::ErrorKind::Timeout {
                ExecutionState::TimedOut
            } else {
                ExecutionState::Failed
            };
            warn!(
                execution_id = %execution_id,
                kind = %classified.kind,
                error = %e,
                "Execution failed"
            );
            let result = ExecutionResult::failed(
                &record.request,
                started.elapsed().as_secs_f64(),
                format!("{:#}", e),
                classified.kind.as_str(),
            );
            (result, terminal)
        }
    };

    finish(&state, &record, result, terminal).await;
}

/// Phases submitting → streaming → extracting → cleaning_up. Returns
/// the extracted result or the error that stopped the run; the job is
/// deleted on every path that got one submitted.
async fn drive(
    state: &Arc<AppState>,
    record: &ExecutionRecord,
    started: Instant,
) -> Result<ExecutionResult> {
    let execution_id = &record.execution_id;

    // Submitting. Validation failures surface here with zero engine
    // calls and zero channel traffic.
    let handle = with_retry(&state.errors, "cluster_execution_submit", || {
        state.launcher.submit(record)
    })
    .await
    .context("submitting job")?;

    state.tracker.update_state(execution_id, ExecutionState::Submitted).await;
    send_progress(state, execution_id, Phase::Submitting, "Job accepted by scheduler").await;

    let result = stream_and_extract(state, record, &handle, started).await;

    // CleaningUp: always runs once a job exists, regardless of outcome.
    send_progress(state, execution_id, Phase::CleaningUp, "Tearing down job").await;
    state.launcher.delete(&handle).await;
    let mut conn = state.redis.clone();
    if let Err(e) = record_store::clear_cancel(&mut conn, execution_id).await {
        warn!(execution_id = %execution_id, error = %e, "Failed to clear cancellation flag");
    }

    result
}

async fn stream_and_extract(
    state: &Arc<AppState>,
    record: &ExecutionRecord,
    handle: &JobHandle,
    started: Instant,
) -> Result<ExecutionResult> {
    let execution_id = &record.execution_id;
    let settings = &state.settings;

    // Give the scheduler a moment before looking for the pod.
    tokio::time::sleep(Duration::from_secs(settings.pod_grace_secs)).await;
    let pod = locate_pod_with_backoff(state, handle).await?;

    state.tracker.update_state(execution_id, ExecutionState::Running).await;
    send_progress(state, execution_id, Phase::Streaming, "Job running, streaming logs").await;

    let captured = Arc::new(Mutex::new(String::new()));
    let capture = tokio::spawn(stream::capture_logs(
        state.launcher.docker().clone(),
        pod.container_id.clone(),
        execution_id.clone(),
        state.registry.clone(),
        state.tracker.clone(),
        captured.clone(),
        settings.clone(),
    ));

    let mut conn = state.redis.clone();
    let status = state.launcher.wait_for_completion(handle, &mut conn).await;

    // Completion (or failure) ends the streaming phase; the capture
    // task is cancelled rather than left to race the fallback.
    capture.abort();
    let _ = capture.await;

    let status = status.context("waiting for job completion")?;

    send_progress(state, execution_id, Phase::Extracting, "Recovering result").await;
    let log_text = captured.lock().await.clone();
    let elapsed = started.elapsed().as_secs_f64();

    let job_error = match &status {
        JobTerminalState::Succeeded => None,
        JobTerminalState::Failed { exit_code, .. } => {
            Some(format!("Job failed with exit code {}", exit_code))
        }
    };

    let result = extract::extract_result(
        state.launcher.docker(),
        Some(&pod.container_id),
        execution_id,
        &record.request,
        status.succeeded(),
        job_error.as_deref(),
        &log_text,
        elapsed,
    )
    .await;

    Ok(result)
}

/// The pod may lag the job by a few seconds; look for it with a fixed
/// 1s backoff up to the configured bound.
async fn locate_pod_with_backoff(state: &Arc<AppState>, handle: &JobHandle) -> Result<PodHandle> {
    let attempts = state.settings.pod_wait_secs.max(1);
    for _ in 0..attempts {
        match state.launcher.locate_pod(handle).await {
            Ok(Some(pod)) => return Ok(pod),
            Ok(None) => {}
            Err(e) => {
                warn!(execution_id = %handle.execution_id, error = %e, "Pod lookup failed");
            }
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    bail!(
        "pod for job {} never became ready within {}s",
        handle.job_name,
        attempts
    )
}

async fn send_progress(state: &Arc<AppState>, execution_id: &str, phase: Phase, message: &str) {
    state
        .registry
        .send(
            execution_id,
            &StreamEnvelope::progress(execution_id, phase.as_str(), phase.progress(), message),
        )
        .await;
}

/// Done: persist the outcome, emit exactly one terminal event, retire
/// the channel, drop the record.
async fn finish(
    state: &Arc<AppState>,
    record: &ExecutionRecord,
    result: ExecutionResult,
    terminal: ExecutionState,
) {
    let execution_id = &record.execution_id;
    let mut conn = state.redis.clone();

    if let Err(e) = record_store::store_result(&mut conn, execution_id, terminal, &result).await {
        warn!(execution_id = %execution_id, error = %e, "Failed to persist result");
    }

    let row = SubmissionRow {
        execution_id: execution_id.clone(),
        problem: record.request.problem_repo(),
        optimizer: record.request.optimizer_repo(),
        best_value: result.best_value,
        created_at: record.started_at,
    };
    if let Err(e) = record_store::record_submission(&mut conn, &row).await {
        warn!(execution_id = %execution_id, error = %e, "Failed to record submission");
    }

    if result.success {
        if let Some(best_value) = result.best_value {
            let member = format!("{}:{}", record.request.optimizer_repo(), execution_id);
            if let Err(e) = record_store::leaderboard_upsert(
                &mut conn,
                &record.request.problem_repo(),
                &member,
                best_value,
            )
            .await
            {
                warn!(execution_id = %execution_id, error = %e, "Failed to update leaderboard");
            }
        }
    }

    let outcome = match terminal {
        ExecutionState::Completed => "completed",
        ExecutionState::TimedOut => "timed_out",
        _ => "failed",
    };
    metrics::EXECUTIONS_FINISHED.with_label_values(&[outcome]).inc();

    // The terminal event is the last message on the channel.
    state
        .registry
        .send(execution_id, &StreamEnvelope::execution_complete(execution_id, &result))
        .await;

    state.tracker.update_state(execution_id, terminal).await;
    state.registry.unregister(execution_id).await;
    state.tracker.remove(execution_id).await;

    info!(
        execution_id = %execution_id,
        outcome = outcome,
        best_value = ?result.best_value,
        execution_time = result.execution_time,
        "Execution finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use optilab_common::types::{new_execution_id, ExecutionRequest, LogLevel, LogSource};
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

    #[tokio::test]
    async fn tracker_owns_record_lifecycle() {
        let tracker = ExecutionTracker::new();
        let record = record();
        let id = record.execution_id.clone();

        tracker.insert(record).await;
        assert_eq!(tracker.in_flight().await, 1);
        assert_eq!(tracker.get(&id).await.unwrap().state, ExecutionState::Pending);

        tracker.update_state(&id, ExecutionState::Running).await;
        assert_eq!(tracker.get(&id).await.unwrap().state, ExecutionState::Running);
        assert!(tracker.get(&id).await.unwrap().finished_at.is_none());

        tracker.update_state(&id, ExecutionState::Completed).await;
        assert!(tracker.get(&id).await.unwrap().finished_at.is_some());

        tracker.remove(&id).await;
        tracker.remove(&id).await; // idempotent
        assert!(tracker.get(&id).await.is_none());
        assert_eq!(tracker.in_flight().await, 0);
    }

    #[tokio::test]
    async fn recent_logs_preserve_order_and_cap() {
        let tracker = ExecutionTracker::new();
        for n in 0..(RECENT_LOG_CAP + 10) {
            tracker
                .append_log(
                    "e1",
                    LogEvent::new(LogLevel::Info, LogSource::Optimizer, format!("line {}", n)),
                )
                .await;
        }

        let logs = tracker.recent_logs("e1", 5).await;
        assert_eq!(logs.len(), 5);
        // Newest five, still in emission order.
        for (offset, event) in logs.iter().enumerate() {
            assert_eq!(
                event.message,
                format!("line {}", RECENT_LOG_CAP + 5 + offset)
            );
        }
    }

    #[test]
    fn phases_progress_monotonically() {
        let phases = [
            Phase::Registering,
            Phase::Submitting,
            Phase::Streaming,
            Phase::Extracting,
            Phase::CleaningUp,
        ];
        for pair in phases.windows(2) {
            assert!(pair[0].progress() < pair[1].progress());
        }
    }
}
