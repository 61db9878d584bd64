/// Result Extractor
///
/// **Core Responsibility:**
/// Recover one normalized `ExecutionResult` from a finished job, trying
/// progressively weaker evidence: the artifact file the workload wrote,
/// the result marker it printed, heuristic scans of the captured log
/// text, and finally a generic record derived from the job status.
///
/// The first conclusive tier wins; tiers never produce two conflicting
/// results for one execution.
use anyhow::{Context, Result};
use bollard::container::DownloadFromContainerOptions;
use bollard::Docker;
use futures_util::StreamExt;
use lazy_static::lazy_static;
use optilab_common::types::{ExecutionRequest, ExecutionResult};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::io::Read;
use tracing::{debug, warn};

/// Prefix the workload prints in front of its final result JSON.
pub const RESULT_MARKER_PREFIX: &str = "EXECUTION_RESULT:";

/// Well-known per-execution artifact path inside the workload container.
pub fn artifact_path(execution_id: &str) -> String {
    format!("/workspace/results/{}.json", execution_id)
}

/// Loosely-shaped result as the workload writes it. Different optimizer
/// libraries populate different subsets; everything unknown lands in
/// `extra` and is carried through as metadata.
#[derive(Debug, Deserialize)]
struct RawResult {
    #[serde(default)]
    success: Option<bool>,
    #[serde(default)]
    best_value: Option<f64>,
    #[serde(default)]
    iterations: Option<u64>,
    #[serde(default)]
    execution_time: Option<f64>,
    #[serde(default)]
    runtime_seconds: Option<f64>,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

fn normalize(raw: RawResult, request: &ExecutionRequest, elapsed_secs: f64, tier: &str) -> ExecutionResult {
    let mut metadata = raw.extra;
    metadata.insert("extraction".to_string(), json!(tier));
    ExecutionResult {
        success: raw.success.unwrap_or(true),
        problem_name: request.problem_name.clone(),
        optimizer_name: request.optimizer_name.clone(),
        best_value: raw.best_value,
        iterations: raw.iterations,
        execution_time: raw.execution_time.or(raw.runtime_seconds).unwrap_or(elapsed_secs),
        error_message: raw.error_message,
        error_type: raw.error_type,
        metadata,
    }
}

lazy_static! {
    // Multiple optimizer libraries, multiple vocabularies; patterns are
    // tried in order and the first hit wins.
    static ref BEST_VALUE_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)best\s+value\s*[:=]\s*(-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?)").unwrap(),
        Regex::new(r"(?i)best\s+fitness\s*[:=]\s*(-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?)").unwrap(),
        Regex::new(r"(?i)best\s+objective\s*[:=]\s*(-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?)").unwrap(),
        Regex::new(r"(?i)best\s+solution\s+value\s*[:=]\s*(-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?)").unwrap(),
        Regex::new(r"(?i)final\s+(?:value|cost)\s*[:=]\s*(-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?)").unwrap(),
        Regex::new(r"(?i)minimum\s+(?:value\s+)?found\s*[:=]?\s*(-?\d+(?:\.\d+)?(?:[eE][+-]?\d+)?)").unwrap(),
    ];
    static ref ITERATION_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)iterations?\s*[:=]\s*(\d+)").unwrap(),
        Regex::new(r"(?i)after\s+(\d+)\s+(?:iterations?|generations?)").unwrap(),
        Regex::new(r"(?i)(\d+)\s+iterations?\b").unwrap(),
        Regex::new(r"(?i)generations?\s*[:=]\s*(\d+)").unwrap(),
    ];
    static ref TIME_PATTERNS: Vec<Regex> = vec![
        Regex::new(r"(?i)runtime\s*[:=]\s*(\d+(?:\.\d+)?)\s*s").unwrap(),
        Regex::new(r"(?i)execution\s+time\s*[:=]\s*(\d+(?:\.\d+)?)").unwrap(),
        Regex::new(r"(?i)elapsed\s*[:=]\s*(\d+(?:\.\d+)?)").unwrap(),
        Regex::new(r"(?i)took\s+(\d+(?:\.\d+)?)\s*s(?:econds)?\b").unwrap(),
    ];
}

/// Phrases that mark the run itself as failed even when metrics were
/// printed along the way.
const FAILURE_PHRASES: &[&str] = &[
    "optimization failed",
    "execution failed",
    "traceback (most recent call last)",
    "fatal error",
    "no solution found",
];

fn first_capture<T: std::str::FromStr>(patterns: &[Regex], text: &str) -> Option<T> {
    for pattern in patterns {
        if let Some(caps) = pattern.captures(text) {
            if let Ok(value) = caps[1].parse::<T>() {
                return Some(value);
            }
        }
    }
    None
}

/// Tier 2: explicit result marker printed by the workload. The last
/// marker in the stream is the final one.
pub fn from_marker(
    log_text: &str,
    request: &ExecutionRequest,
    elapsed_secs: f64,
) -> Option<ExecutionResult> {
    log_text.lines().rev().find_map(|line| {
        let payload = line.trim().strip_prefix(RESULT_MARKER_PREFIX)?;
        match serde_json::from_str::<RawResult>(payload.trim()) {
            Ok(raw) => Some(normalize(raw, request, elapsed_secs, "marker")),
            Err(e) => {
                debug!(error = %e, "Ignoring malformed result marker line");
                None
            }
        }
    })
}

/// Tier 3: heuristic scan over the full captured text. Conclusive only
/// when at least one numeric field was recovered.
pub fn from_heuristics(
    log_text: &str,
    request: &ExecutionRequest,
    elapsed_secs: f64,
) -> Option<ExecutionResult> {
    let best_value: Option<f64> = first_capture(&BEST_VALUE_PATTERNS, log_text);
    let iterations: Option<u64> = first_capture(&ITERATION_PATTERNS, log_text);
    let execution_time: Option<f64> = first_capture(&TIME_PATTERNS, log_text);

    if best_value.is_none() && iterations.is_none() && execution_time.is_none() {
        return None;
    }

    let lowered = log_text.to_lowercase();
    let failed = FAILURE_PHRASES.iter().any(|p| lowered.contains(p));

    let mut metadata = Map::new();
    metadata.insert("extraction".to_string(), json!("heuristic"));
    Some(ExecutionResult {
        success: !failed,
        problem_name: request.problem_name.clone(),
        optimizer_name: request.optimizer_name.clone(),
        best_value,
        iterations,
        execution_time: execution_time.unwrap_or(elapsed_secs),
        error_message: failed.then(|| "Failure reported in execution logs".to_string()),
        error_type: failed.then(|| "execution_error".to_string()),
        metadata,
    })
}

/// Tiers 2-4 over captured text. A job that completed successfully never
/// yields "no result at all": the final tier records the run with the
/// metrics absent and the provenance noted.
pub fn extract_from_text(
    request: &ExecutionRequest,
    job_succeeded: bool,
    job_error: Option<&str>,
    log_text: &str,
    elapsed_secs: f64,
) -> ExecutionResult {
    if let Some(result) = from_marker(log_text, request, elapsed_secs) {
        return result;
    }
    if let Some(result) = from_heuristics(log_text, request, elapsed_secs) {
        return result;
    }

    if job_succeeded {
        let mut metadata = Map::new();
        metadata.insert("extraction".to_string(), json!("log_inference"));
        metadata.insert(
            "note".to_string(),
            json!("Results inferred from job completion; no metrics were recovered from logs"),
        );
        ExecutionResult {
            success: true,
            problem_name: request.problem_name.clone(),
            optimizer_name: request.optimizer_name.clone(),
            best_value: None,
            iterations: None,
            execution_time: elapsed_secs,
            error_message: None,
            error_type: None,
            metadata,
        }
    } else {
        ExecutionResult::failed(
            request,
            elapsed_secs,
            job_error.unwrap_or("Job reached a failed state"),
            "execution_error",
        )
    }
}

/// Tier 1: read the artifact file out of the stopped container. Comes
/// back as a single-entry tar stream from the engine.
pub async fn from_artifact(
    docker: &Docker,
    container_id: &str,
    execution_id: &str,
    request: &ExecutionRequest,
    elapsed_secs: f64,
) -> Result<Option<ExecutionResult>> {
    let options = DownloadFromContainerOptions {
        path: artifact_path(execution_id),
    };

    let mut stream = docker.download_from_container(container_id, Some(options));
    let mut archive_bytes: Vec<u8> = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Failed to read artifact archive from container")?;
        archive_bytes.extend_from_slice(&chunk);
    }

    let mut archive = tar::Archive::new(archive_bytes.as_slice());
    for entry in archive.entries().context("Malformed artifact archive")? {
        let mut entry = entry.context("Malformed artifact archive entry")?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let mut contents = String::new();
        entry
            .read_to_string(&mut contents)
            .context("Artifact is not valid UTF-8")?;
        let raw: RawResult =
            serde_json::from_str(&contents).context("Artifact is not a valid result document")?;
        return Ok(Some(normalize(raw, request, elapsed_secs, "artifact")));
    }

    Ok(None)
}

/// Full extraction chain for one finished execution.
pub async fn extract_result(
    docker: &Docker,
    pod_container_id: Option<&str>,
    execution_id: &str,
    request: &ExecutionRequest,
    job_succeeded: bool,
    job_error: Option<&str>,
    log_text: &str,
    elapsed_secs: f64,
) -> ExecutionResult {
    if let Some(container_id) = pod_container_id {
        match from_artifact(docker, container_id, execution_id, request, elapsed_secs).await {
            Ok(Some(result)) => {
                debug!(execution_id = execution_id, "Result extracted from artifact");
                return result;
            }
            Ok(None) => {}
            Err(e) => {
                // Missing artifact is the common case for crashed
                // workloads; the log tiers still get their chance.
                warn!(
                    execution_id = execution_id,
                    error = %e,
                    "Artifact extraction failed, falling back to log scan"
                );
            }
        }
    }

    extract_from_text(request, job_succeeded, job_error, log_text, elapsed_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            problem_name: "tsp".into(),
            problem_owner: "alice".into(),
            optimizer_name: "genetic".into(),
            optimizer_owner: "bob".into(),
            problem_params: Map::new(),
            optimizer_params: Map::new(),
            timeout_secs: None,
        }
    }

    #[test]
    fn marker_line_is_parsed() {
        let logs = "starting\nEXECUTION_RESULT: {\"success\": true, \"best_value\": 42.5, \"iterations\": 100}\n";
        let result = from_marker(logs, &request(), 7.0).unwrap();
        assert!(result.success);
        assert_eq!(result.best_value, Some(42.5));
        assert_eq!(result.iterations, Some(100));
        assert_eq!(result.execution_time, 7.0);
        assert_eq!(result.metadata["extraction"], "marker");
    }

    #[test]
    fn last_marker_wins() {
        let logs = "EXECUTION_RESULT: {\"best_value\": 1.0}\nEXECUTION_RESULT: {\"best_value\": 2.0}\n";
        let result = from_marker(logs, &request(), 1.0).unwrap();
        assert_eq!(result.best_value, Some(2.0));
    }

    #[test]
    fn heuristics_cover_alternate_phrasings() {
        let result = from_heuristics("Best fitness: -17.25 after 300 generations", &request(), 4.0).unwrap();
        assert_eq!(result.best_value, Some(-17.25));
        assert_eq!(result.iterations, Some(300));

        let result = from_heuristics("final cost = 99.5, runtime: 12.5s", &request(), 4.0).unwrap();
        assert_eq!(result.best_value, Some(99.5));
        assert_eq!(result.execution_time, 12.5);

        let result = from_heuristics("stopped after 42 iterations", &request(), 4.0).unwrap();
        assert_eq!(result.iterations, Some(42));
        assert_eq!(result.best_value, None);
    }

    #[test]
    fn heuristics_require_at_least_one_numeric_field() {
        assert!(from_heuristics("nothing to see here", &request(), 4.0).is_none());
    }

    #[test]
    fn failure_phrase_flips_success() {
        let logs = "best value: 10.0\nOptimization failed: solver blew up";
        let result = from_heuristics(logs, &request(), 4.0).unwrap();
        assert!(!result.success);
        assert_eq!(result.best_value, Some(10.0));
        assert!(result.error_message.is_some());
    }

    #[test]
    fn marker_beats_heuristics() {
        // Both tiers could produce a result; the marker is authoritative.
        let logs = "best value: 1.0\nEXECUTION_RESULT: {\"best_value\": 2.0}";
        let result = extract_from_text(&request(), true, None, logs, 3.0);
        assert_eq!(result.best_value, Some(2.0));
        assert_eq!(result.metadata["extraction"], "marker");
    }

    #[test]
    fn successful_job_with_silent_logs_still_yields_a_result() {
        let result = extract_from_text(&request(), true, None, "no metrics here", 9.5);
        assert!(result.success);
        assert_eq!(result.best_value, None);
        assert_eq!(result.execution_time, 9.5);
        assert_eq!(result.metadata["extraction"], "log_inference");
        assert_eq!(result.problem_name, "tsp");
        assert_eq!(result.optimizer_name, "genetic");
    }

    #[test]
    fn failed_job_with_silent_logs_yields_failure() {
        let result = extract_from_text(&request(), false, Some("exit code 137"), "", 9.5);
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("exit code 137"));
        assert_eq!(result.error_type.as_deref(), Some("execution_error"));
    }

    #[test]
    fn marker_with_explicit_failure_is_respected() {
        let logs = "EXECUTION_RESULT: {\"success\": false, \"error_message\": \"infeasible\", \"error_type\": \"validation\"}";
        let result = extract_from_text(&request(), true, None, logs, 2.0);
        assert!(!result.success);
        assert_eq!(result.error_message.as_deref(), Some("infeasible"));
    }

    #[test]
    fn artifact_path_is_per_execution() {
        assert_eq!(artifact_path("abc"), "/workspace/results/abc.json");
        assert_ne!(artifact_path("abc"), artifact_path("def"));
    }

    #[test]
    fn unknown_artifact_fields_land_in_metadata() {
        let raw: RawResult = serde_json::from_str(
            r#"{"success": true, "best_value": 5.0, "termination_reason": "converged"}"#,
        )
        .unwrap();
        let result = normalize(raw, &request(), 1.0, "artifact");
        assert_eq!(result.metadata["termination_reason"], "converged");
        assert_eq!(result.metadata["extraction"], "artifact");
    }
}
