/// Error Classification & Retry Policy
///
/// **Core Responsibility:**
/// Turn raw failures into typed, retryable-or-not classifications and
/// decide backoff at the call sites that produced them.
///
/// **Critical Properties:**
/// - Classification is an ordered rule table evaluated by one loop;
///   rule order is the precedence contract.
/// - Retry budgets are per-kind, with exponential backoff and a cap.
/// - Cluster execution has no fallback: a failed job is always
///   surfaced, never silently substituted.
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const HISTORY_CAP: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    Network,
    Scheduler,
    Authentication,
    Resource,
    Timeout,
    Validation,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Scheduler => "scheduler",
            ErrorKind::Authentication => "authentication",
            ErrorKind::Resource => "resource",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Validation => "validation",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// One failure occurrence. Never mutated after creation.
#[derive(Debug, Clone, Serialize)]
pub struct ClassifiedError {
    pub id: String,
    pub kind: ErrorKind,
    pub severity: Severity,
    pub retryable: bool,
    pub message: String,
    pub operation: String,
    pub retry_count: u32,
    pub context: HashMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

/// One classification rule: a predicate over (lowercased message,
/// status code) and the outcome it assigns.
struct ClassifyRule {
    matches: fn(&str, Option<u16>) -> bool,
    kind: ErrorKind,
    retryable: bool,
    severity: Severity,
}

/// Ordered rule table. First match wins; later rules are broader, so
/// order must not be rearranged.
const CLASSIFY_RULES: &[ClassifyRule] = &[
    // Connection-level failures: refused, DNS, reset.
    ClassifyRule {
        matches: |msg, _| {
            msg.contains("connection refused")
                || msg.contains("econnrefused")
                || msg.contains("dns")
                || msg.contains("getaddrinfo")
                || msg.contains("connection reset")
                || msg.contains("broken pipe")
                || msg.contains("network")
        },
        kind: ErrorKind::Network,
        retryable: true,
        severity: Severity::High,
    },
    // Scheduler conflict: the job already exists (duplicate submit).
    ClassifyRule {
        matches: |msg, code| code == Some(409) || msg.contains("already exists"),
        kind: ErrorKind::Scheduler,
        retryable: true,
        severity: Severity::Low,
    },
    // Permission failure on a scheduler operation.
    ClassifyRule {
        matches: |_, code| code == Some(403),
        kind: ErrorKind::Authentication,
        retryable: false,
        severity: Severity::High,
    },
    // Resource momentarily missing during a scheduler operation.
    ClassifyRule {
        matches: |_, code| code == Some(404),
        kind: ErrorKind::Scheduler,
        retryable: true,
        severity: Severity::Medium,
    },
    ClassifyRule {
        matches: |msg, code| {
            code == Some(401) || msg.contains("authentication") || msg.contains("unauthorized")
        },
        kind: ErrorKind::Authentication,
        retryable: false,
        severity: Severity::High,
    },
    ClassifyRule {
        matches: |msg, _| msg.contains("insufficient") || msg.contains("resource"),
        kind: ErrorKind::Resource,
        retryable: true,
        severity: Severity::High,
    },
    ClassifyRule {
        matches: |msg, code| code == Some(408) || msg.contains("timeout") || msg.contains("timed out"),
        kind: ErrorKind::Timeout,
        retryable: true,
        severity: Severity::Medium,
    },
    ClassifyRule {
        matches: |msg, _| msg.contains("validation") || msg.contains("invalid"),
        kind: ErrorKind::Validation,
        retryable: false,
        severity: Severity::Medium,
    },
];

/// Classify a raw failure. `status_code` is the scheduler/HTTP status
/// when one exists; text matching is case-insensitive.
pub fn classify(message: &str, status_code: Option<u16>, operation: &str) -> ClassifiedError {
    let lowered = message.to_lowercase();

    let (kind, retryable, severity) = CLASSIFY_RULES
        .iter()
        .find(|rule| (rule.matches)(&lowered, status_code))
        .map(|rule| (rule.kind, rule.retryable, rule.severity))
        .unwrap_or((ErrorKind::Unknown, false, Severity::Medium));

    ClassifiedError {
        id: uuid::Uuid::new_v4().simple().to_string(),
        kind,
        severity,
        retryable,
        message: message.to_string(),
        operation: operation.to_string(),
        retry_count: 0,
        context: HashMap::new(),
        timestamp: Utc::now(),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn for_kind(kind: ErrorKind) -> Option<RetryPolicy> {
        match kind {
            ErrorKind::Network => Some(RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_secs(1),
                multiplier: 2.0,
                max_delay: Duration::from_secs(10),
            }),
            ErrorKind::Scheduler => Some(RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_secs(2),
                multiplier: 1.5,
                max_delay: Duration::from_secs(8),
            }),
            ErrorKind::Authentication => Some(RetryPolicy {
                max_attempts: 1,
                base_delay: Duration::from_millis(500),
                multiplier: 1.0,
                max_delay: Duration::from_millis(500),
            }),
            ErrorKind::Resource => Some(RetryPolicy {
                max_attempts: 5,
                base_delay: Duration::from_secs(5),
                multiplier: 1.2,
                max_delay: Duration::from_secs(30),
            }),
            ErrorKind::Timeout => Some(RetryPolicy {
                max_attempts: 2,
                base_delay: Duration::from_secs(3),
                multiplier: 2.0,
                max_delay: Duration::from_secs(15),
            }),
            ErrorKind::Validation | ErrorKind::Unknown => None,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.base_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()))
    }
}

/// Decide whether `attempt` (0-based) may be retried, and with what
/// delay. Non-retryable errors and exhausted budgets return None.
pub fn should_retry(error: &ClassifiedError, attempt: u32) -> Option<Duration> {
    if !error.retryable {
        return None;
    }
    let policy = RetryPolicy::for_kind(error.kind)?;
    if attempt >= policy.max_attempts {
        return None;
    }
    Some(policy.delay_for(attempt))
}

/// Named fallback procedures for operations that have one. Cluster
/// execution is deliberately absent from this table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackProc {
    CachedCopy,
    LocalCopy,
}

fn fallback_for(operation: &str) -> Option<FallbackProc> {
    match operation {
        "dataset_loading" => Some(FallbackProc::CachedCopy),
        "repo_content" => Some(FallbackProc::CachedCopy),
        "repo_clone" => Some(FallbackProc::LocalCopy),
        _ => None,
    }
}

/// Bounded rolling history of classified failures, shared across all
/// executions in flight.
#[derive(Clone, Default)]
pub struct ErrorTracker {
    history: Arc<RwLock<VecDeque<ClassifiedError>>>,
}

impl ErrorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, error: ClassifiedError) {
        let mut history = self.history.write().await;
        if history.len() >= HISTORY_CAP {
            history.pop_front();
        }
        history.push_back(error);
    }

    pub async fn recent(&self, limit: usize) -> Vec<ClassifiedError> {
        let history = self.history.read().await;
        history.iter().rev().take(limit).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.history.read().await.len()
    }

    /// Look up the named fallback for a failed operation, recording the
    /// dispatch decision alongside the error.
    pub fn fallback_for(&self, operation: &str) -> Option<FallbackProc> {
        fallback_for(operation)
    }
}

/// Run an operation under the retry policy: classify each failure,
/// sleep the computed backoff, give up once the per-kind budget is
/// spent. The last error is returned unwrapped so callers can surface
/// it verbatim.
pub async fn with_retry<T, F, Fut>(
    tracker: &ErrorTracker,
    operation: &str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt: u32 = 0;
    loop {
        match call().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let mut classified = classify(&format!("{:#}", e), status_code_of(&e), operation);
                classified.retry_count = attempt;
                let delay = should_retry(&classified, attempt);
                tracker.record(classified.clone()).await;

                match delay {
                    Some(delay) => {
                        warn!(
                            operation = operation,
                            kind = %classified.kind,
                            attempt = attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Operation failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        debug!(
                            operation = operation,
                            kind = %classified.kind,
                            attempt = attempt,
                            "Operation failed, not retrying"
                        );
                        return Err(e);
                    }
                }
            }
        }
    }
}

/// Pull an HTTP-ish status code out of an error chain when one exists
/// (bollard surfaces the daemon's status codes this way).
pub fn status_code_of(error: &anyhow::Error) -> Option<u16> {
    if let Some(bollard::errors::Error::DockerResponseServerError { status_code, .. }) =
        error.downcast_ref::<bollard::errors::Error>()
    {
        return Some(*status_code);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_network_errors() {
        let e = classify("connection refused by daemon", None, "submit");
        assert_eq!(e.kind, ErrorKind::Network);
        assert!(e.retryable);
        assert_eq!(e.severity, Severity::High);
    }

    #[test]
    fn classifies_conflict_as_low_severity_scheduler() {
        let e = classify("job already exists", Some(409), "submit");
        assert_eq!(e.kind, ErrorKind::Scheduler);
        assert!(e.retryable);
        assert_eq!(e.severity, Severity::Low);
    }

    #[test]
    fn forbidden_is_terminal() {
        let e = classify("forbidden", Some(403), "submit");
        assert_eq!(e.kind, ErrorKind::Authentication);
        assert!(!e.retryable);
        assert!(should_retry(&e, 0).is_none());
    }

    #[test]
    fn not_found_during_scheduler_op_is_retryable() {
        let e = classify("no such container", Some(404), "locate_pod");
        assert_eq!(e.kind, ErrorKind::Scheduler);
        assert!(e.retryable);
        assert_eq!(e.severity, Severity::Medium);
    }

    #[test]
    fn validation_is_terminal() {
        let e = classify("validation failed: namespace must not be empty", None, "submit");
        assert_eq!(e.kind, ErrorKind::Validation);
        assert!(!e.retryable);
    }

    #[test]
    fn unknown_text_is_unknown_kind() {
        let e = classify("something odd happened", None, "submit");
        assert_eq!(e.kind, ErrorKind::Unknown);
        assert!(!e.retryable);
        assert_eq!(e.severity, Severity::Medium);
    }

    #[test]
    fn rule_order_prefers_conflict_over_resource() {
        // "already exists" must win over the broader "resource" keyword.
        let e = classify("resource already exists", Some(409), "submit");
        assert_eq!(e.kind, ErrorKind::Scheduler);
        assert_eq!(e.severity, Severity::Low);
    }

    #[test]
    fn network_retry_bound() {
        let e = classify("connection refused", None, "submit");
        assert_eq!(should_retry(&e, 0), Some(Duration::from_secs(1)));
        assert_eq!(should_retry(&e, 1), Some(Duration::from_secs(2)));
        assert_eq!(should_retry(&e, 2), Some(Duration::from_secs(4)));
        assert_eq!(should_retry(&e, 3), None);
    }

    #[test]
    fn retry_delay_is_capped() {
        let e = classify("insufficient memory", None, "submit");
        assert_eq!(e.kind, ErrorKind::Resource);
        // 5s * 1.2^4 = 10.368s, still under the 30s cap
        let d = should_retry(&e, 4).unwrap();
        assert!(d <= Duration::from_secs(30));
        assert!(d > Duration::from_secs(10));
        assert!(should_retry(&e, 5).is_none());
    }

    #[test]
    fn cluster_execution_has_no_fallback() {
        assert_eq!(fallback_for("cluster_execution"), None);
        assert_eq!(fallback_for("dataset_loading"), Some(FallbackProc::CachedCopy));
        assert_eq!(fallback_for("repo_content"), Some(FallbackProc::CachedCopy));
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let tracker = ErrorTracker::new();
        for i in 0..(HISTORY_CAP + 50) {
            tracker
                .record(classify(&format!("error {}", i), None, "test"))
                .await;
        }
        assert_eq!(tracker.len().await, HISTORY_CAP);
        // Oldest entries were dropped
        let recent = tracker.recent(1).await;
        assert!(recent[0].message.contains(&format!("{}", HISTORY_CAP + 49)));
    }

    #[tokio::test]
    async fn with_retry_gives_up_after_budget() {
        let tracker = ErrorTracker::new();
        let attempts = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = attempts.clone();

        // Authentication failures are not retryable at all: exactly one
        // call, no backoff.
        let result: Result<()> = with_retry(&tracker, "login", || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                anyhow::bail!("unauthorized")
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
