use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// Parameters for one optimization run: which problem and optimizer
/// repositories to load, and the parameter overrides for each.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub problem_name: String,
    pub problem_owner: String,
    pub optimizer_name: String,
    pub optimizer_owner: String,
    #[serde(default)]
    pub problem_params: Map<String, Value>,
    #[serde(default)]
    pub optimizer_params: Map<String, Value>,
    /// Per-execution override of the job deadline, capped by the gateway.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl ExecutionRequest {
    pub fn problem_repo(&self) -> String {
        format!("{}/{}", self.problem_owner, self.problem_name)
    }

    pub fn optimizer_repo(&self) -> String {
        format!("{}/{}", self.optimizer_owner, self.optimizer_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Pending,
    Submitted,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Completed | ExecutionState::Failed | ExecutionState::TimedOut
        )
    }
}

/// One end-to-end run of a problem+optimizer pair.
///
/// Owned exclusively by the orchestrator's tracker for its lifetime;
/// the launcher and the connection registry only ever see the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: String,
    pub job_name: String,
    pub request: ExecutionRequest,
    pub state: ExecutionState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExecutionRecord {
    pub fn new(execution_id: String, request: ExecutionRequest) -> Self {
        let job_name = job_name_for(&execution_id);
        Self {
            execution_id,
            job_name,
            request,
            state: ExecutionState::Pending,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Generate a fresh execution id (correlation key across channel, job
/// and log lines).
pub fn new_execution_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Deterministic job name for an execution. One execution, one job name;
/// the id suffix keeps concurrent jobs from colliding.
pub fn job_name_for(execution_id: &str) -> String {
    format!("optilab-exec-{}", execution_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "debug" => LogLevel::Debug,
            "warning" | "warn" => LogLevel::Warning,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a streamed log line came from. `Pod` covers raw container
/// output that no more specific rule claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    System,
    Problem,
    Optimizer,
    Dataset,
    Results,
    Qubots,
    Pod,
    Raw,
}

impl LogSource {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "system" => LogSource::System,
            "problem" => LogSource::Problem,
            "optimizer" => LogSource::Optimizer,
            "dataset" => LogSource::Dataset,
            "results" => LogSource::Results,
            "qubots" => LogSource::Qubots,
            "pod" => LogSource::Pod,
            _ => LogSource::Raw,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogSource::System => "system",
            LogSource::Problem => "problem",
            LogSource::Optimizer => "optimizer",
            LogSource::Dataset => "dataset",
            LogSource::Results => "results",
            LogSource::Qubots => "qubots",
            LogSource::Pod => "pod",
            LogSource::Raw => "raw",
        }
    }
}

impl std::fmt::Display for LogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One classified unit of streamed output. Immutable; per-execution
/// ordering is append-only FIFO.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    pub source: LogSource,
}

impl LogEvent {
    pub fn new(level: LogLevel, source: LogSource, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            source,
        }
    }
}

/// Normalized outcome of one execution. Produced exactly once, by the
/// first extraction tier that yields a conclusive result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub problem_name: String,
    pub optimizer_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_value: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iterations: Option<u64>,
    /// Wall time in seconds.
    pub execution_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Open map for solver-specific fields (termination reason, history
    /// pointers, extraction provenance).
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl ExecutionResult {
    pub fn failed(
        request: &ExecutionRequest,
        execution_time: f64,
        error_message: impl Into<String>,
        error_type: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            problem_name: request.problem_name.clone(),
            optimizer_name: request.optimizer_name.clone(),
            best_value: None,
            iterations: None,
            execution_time,
            error_message: Some(error_message.into()),
            error_type: Some(error_type.into()),
            metadata: Map::new(),
        }
    }
}

/// Durable row recorded for every accepted execution request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionRow {
    pub execution_id: String,
    pub problem: String,
    pub optimizer: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_value: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// Client-to-server messages on the execution channel.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Ping,
    StopExecution,
    RequestStatus,
    RequestLogs {
        #[serde(default)]
        data: LogWindow,
    },
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogWindow {
    #[serde(default = "default_log_limit")]
    pub limit: usize,
}

impl Default for LogWindow {
    fn default() -> Self {
        Self {
            limit: default_log_limit(),
        }
    }
}

fn default_log_limit() -> usize {
    100
}

/// Server-to-client message envelope. Every outbound message carries the
/// same four fields so clients can demultiplex on `type` alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "executionId")]
    pub execution_id: String,
}

impl StreamEnvelope {
    fn new(execution_id: &str, kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            data,
            timestamp: Utc::now(),
            execution_id: execution_id.to_string(),
        }
    }

    pub fn connection_established(execution_id: &str) -> Self {
        Self::new(
            execution_id,
            "connection_established",
            json!({
                "executionId": execution_id,
                "message": "Streaming connection ready",
            }),
        )
    }

    pub fn log(execution_id: &str, event: &LogEvent) -> Self {
        Self::new(
            execution_id,
            "optimization_log",
            json!({
                "level": event.level,
                "message": event.message,
                "source": event.source,
                "timestamp": event.timestamp,
            }),
        )
    }

    pub fn progress(execution_id: &str, step: &str, progress: f64, message: &str) -> Self {
        Self::new(
            execution_id,
            "progress",
            json!({
                "step": step,
                "progress": progress,
                "message": message,
            }),
        )
    }

    pub fn execution_complete(execution_id: &str, result: &ExecutionResult) -> Self {
        let mut data = json!({
            "success": result.success,
            "timestamp": Utc::now(),
        });
        if result.success {
            data["result"] = serde_json::to_value(result).unwrap_or(Value::Null);
        } else {
            data["error_message"] = json!(result.error_message);
            data["error_type"] = json!(result.error_type);
        }
        Self::new(execution_id, "execution_complete", data)
    }

    pub fn pong(execution_id: &str) -> Self {
        Self::new(execution_id, "pong", json!({ "timestamp": Utc::now() }))
    }

    pub fn error(execution_id: &str, message: &str, step: &str) -> Self {
        Self::new(
            execution_id,
            "error",
            json!({ "message": message, "step": step }),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_name_is_deterministic() {
        let id = new_execution_id();
        assert_eq!(job_name_for(&id), job_name_for(&id));
        assert!(job_name_for(&id).starts_with("optilab-exec-"));
        assert!(job_name_for(&id).contains(&id));
    }

    #[test]
    fn execution_ids_are_unique() {
        assert_ne!(new_execution_id(), new_execution_id());
    }

    #[test]
    fn envelope_wire_shape() {
        let env = StreamEnvelope::pong("abc123");
        let value = serde_json::to_value(&env).unwrap();
        assert_eq!(value["type"], "pong");
        assert_eq!(value["executionId"], "abc123");
        assert!(value["timestamp"].is_string());
        assert!(value["data"]["timestamp"].is_string());
    }

    #[test]
    fn client_message_parsing() {
        let ping: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(ping, ClientMessage::Ping));

        let stop: ClientMessage = serde_json::from_str(r#"{"type":"stop_execution"}"#).unwrap();
        assert!(matches!(stop, ClientMessage::StopExecution));

        let logs: ClientMessage =
            serde_json::from_str(r#"{"type":"request_logs","data":{"limit":25}}"#).unwrap();
        match logs {
            ClientMessage::RequestLogs { data } => assert_eq!(data.limit, 25),
            other => panic!("unexpected message: {:?}", other),
        }

        // limit is optional
        let logs: ClientMessage = serde_json::from_str(r#"{"type":"request_logs"}"#).unwrap();
        match logs {
            ClientMessage::RequestLogs { data } => assert_eq!(data.limit, 100),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn complete_envelope_carries_error_fields_on_failure() {
        let request = ExecutionRequest {
            problem_name: "tsp".into(),
            problem_owner: "alice".into(),
            optimizer_name: "genetic".into(),
            optimizer_owner: "bob".into(),
            problem_params: Map::new(),
            optimizer_params: Map::new(),
            timeout_secs: None,
        };
        let result = ExecutionResult::failed(&request, 1.5, "boom", "scheduler");
        let env = StreamEnvelope::execution_complete("id1", &result);
        assert_eq!(env.data["success"], false);
        assert_eq!(env.data["error_message"], "boom");
        assert_eq!(env.data["error_type"], "scheduler");
    }

    #[test]
    fn level_and_source_parse_with_fallbacks() {
        assert_eq!(LogLevel::parse("WARN"), LogLevel::Warning);
        assert_eq!(LogLevel::parse("nonsense"), LogLevel::Info);
        assert_eq!(LogSource::parse("qubots"), LogSource::Qubots);
        assert_eq!(LogSource::parse("whatever"), LogSource::Raw);
    }

    #[test]
    fn terminal_states() {
        assert!(!ExecutionState::Pending.is_terminal());
        assert!(!ExecutionState::Running.is_terminal());
        assert!(ExecutionState::Completed.is_terminal());
        assert!(ExecutionState::Failed.is_terminal());
        assert!(ExecutionState::TimedOut.is_terminal());
    }
}
