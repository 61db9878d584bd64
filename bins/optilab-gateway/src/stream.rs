/// Log Capture - Live Tail With Polling Fallback
///
/// **Core Responsibility:**
/// Attach to a running job's output, split it into lines, classify each
/// line, and push classified events out through the connection registry
/// while accumulating the raw text for result extraction.
///
/// **Capture Paths:**
/// At most one capture path is active at a time. The live attach
/// (follow) is primary; only if the attach fails before producing any
/// output does capture switch to polling the full accumulated log and
/// classifying the newly appended suffix.
use bollard::container::{LogOutput, LogsOptions};
use bollard::Docker;
use futures_util::StreamExt;
use optilab_common::types::StreamEnvelope;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::classify::{classify_line, Classified};
use crate::config::RuntimeSettings;
use crate::metrics;
use crate::orchestrator::ExecutionTracker;
use crate::registry::ConnectionRegistry;

/// Splits a byte stream into complete lines, retaining the trailing
/// incomplete line across chunks.
#[derive(Default)]
pub struct LineBuffer {
    partial: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.partial.push_str(&String::from_utf8_lossy(chunk));
        let mut lines = Vec::new();
        while let Some(pos) = self.partial.find('\n') {
            let mut line: String = self.partial.drain(..=pos).collect();
            line.pop(); // the newline itself
            if line.ends_with('\r') {
                line.pop();
            }
            lines.push(line);
        }
        lines
    }

    /// The unterminated tail, if any, once the stream has ended.
    pub fn finish(self) -> Option<String> {
        if self.partial.is_empty() {
            None
        } else {
            Some(self.partial)
        }
    }
}

/// Complete lines appended to `text` past the first `seen` bytes.
/// Returns the new high-water mark; a trailing partial line stays
/// unconsumed until more output arrives.
fn new_complete_lines(text: &str, seen: usize) -> (Vec<String>, usize) {
    if text.len() <= seen {
        return (Vec::new(), seen);
    }
    let fresh = &text[seen..];
    let Some(last_newline) = fresh.rfind('\n') else {
        return (Vec::new(), seen);
    };
    let complete = &fresh[..=last_newline];
    let lines = complete
        .lines()
        .map(|l| l.trim_end_matches('\r').to_string())
        .collect();
    (lines, seen + last_newline + 1)
}

struct CaptureContext {
    registry: ConnectionRegistry,
    tracker: ExecutionTracker,
    execution_id: String,
    captured: Arc<Mutex<String>>,
}

impl CaptureContext {
    /// Route one raw line: accumulate it for extraction, classify it,
    /// and stream the classified event if any.
    async fn handle_line(&self, line: &str) {
        {
            let mut captured = self.captured.lock().await;
            captured.push_str(line);
            captured.push('\n');
        }

        match classify_line(line, &self.execution_id) {
            Classified::Emit(event) => {
                self.tracker.append_log(&self.execution_id, event.clone()).await;
                metrics::LOG_EVENTS_STREAMED.inc();
                self.registry
                    .send(
                        &self.execution_id,
                        &StreamEnvelope::log(&self.execution_id, &event),
                    )
                    .await;
            }
            Classified::Discard => {}
        }
    }
}

/// Capture a job's log output until the stream ends or the task is
/// cancelled. Never returns an error: capture failures degrade, they do
/// not abort the execution.
pub async fn capture_logs(
    docker: Docker,
    container_id: String,
    execution_id: String,
    registry: ConnectionRegistry,
    tracker: ExecutionTracker,
    captured: Arc<Mutex<String>>,
    settings: Arc<RuntimeSettings>,
) {
    let ctx = CaptureContext {
        registry,
        tracker,
        execution_id,
        captured,
    };

    match live_capture(&docker, &container_id, &ctx, &settings).await {
        LiveOutcome::Finished => {}
        LiveOutcome::AttachFailed(e) => {
            warn!(
                execution_id = %ctx.execution_id,
                error = %e,
                "Live log attach failed, falling back to polling capture"
            );
            polling_capture(&docker, &container_id, &ctx, &settings).await;
        }
    }
}

enum LiveOutcome {
    Finished,
    AttachFailed(bollard::errors::Error),
}

async fn live_capture(
    docker: &Docker,
    container_id: &str,
    ctx: &CaptureContext,
    settings: &RuntimeSettings,
) -> LiveOutcome {
    let options = LogsOptions::<String> {
        stdout: true,
        stderr: true,
        follow: true,
        tail: settings.log_tail_lines.to_string(),
        ..Default::default()
    };

    let mut stream = docker.logs(container_id, Some(options));
    let mut buffer = LineBuffer::new();
    let mut saw_output = false;

    while let Some(item) = stream.next().await {
        match item {
            Ok(LogOutput::StdOut { message }) | Ok(LogOutput::StdErr { message }) => {
                saw_output = true;
                for line in buffer.push(&message) {
                    ctx.handle_line(&line).await;
                }
            }
            Ok(_) => {}
            Err(e) if !saw_output => {
                // The attach itself failed; the polling path takes over.
                return LiveOutcome::AttachFailed(e);
            }
            Err(e) => {
                warn!(
                    execution_id = %ctx.execution_id,
                    error = %e,
                    "Log stream broke mid-capture"
                );
                break;
            }
        }
    }

    if let Some(tail) = buffer.finish() {
        ctx.handle_line(&tail).await;
    }
    LiveOutcome::Finished
}

/// Fallback transport: fetch the full accumulated log on an interval
/// and classify only the suffix past what was already seen.
async fn polling_capture(
    docker: &Docker,
    container_id: &str,
    ctx: &CaptureContext,
    settings: &RuntimeSettings,
) {
    let interval = Duration::from_secs(settings.log_poll_interval_secs);
    let mut seen: usize = 0;

    for attempt in 0..settings.log_poll_budget {
        let text = match fetch_full_logs(docker, container_id).await {
            Ok(text) => text,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                // Job was deleted under us (client stop); exit quietly.
                debug!(execution_id = %ctx.execution_id, "Job gone, ending log capture");
                return;
            }
            Err(e) => {
                warn!(
                    execution_id = %ctx.execution_id,
                    attempt = attempt,
                    error = %e,
                    "Polling log fetch failed"
                );
                tokio::time::sleep(interval).await;
                continue;
            }
        };

        let (lines, new_seen) = new_complete_lines(&text, seen);
        seen = new_seen;
        for line in lines {
            ctx.handle_line(&line).await;
        }

        if job_is_stopped(docker, container_id).await {
            // Deliver any unterminated final line before ending.
            if text.len() > seen {
                let tail = text[seen..].to_string();
                ctx.handle_line(&tail).await;
            }
            return;
        }

        tokio::time::sleep(interval).await;
    }

    warn!(
        execution_id = %ctx.execution_id,
        budget = settings.log_poll_budget,
        "Polling capture exhausted its attempt budget"
    );
}

async fn fetch_full_logs(
    docker: &Docker,
    container_id: &str,
) -> Result<String, bollard::errors::Error> {
    let options = LogsOptions::<String> {
        stdout: true,
        stderr: true,
        follow: false,
        tail: "all".to_string(),
        ..Default::default()
    };

    let mut stream = docker.logs(container_id, Some(options));
    let mut text = String::new();
    while let Some(item) = stream.next().await {
        match item? {
            LogOutput::StdOut { message } | LogOutput::StdErr { message } => {
                text.push_str(&String::from_utf8_lossy(&message));
            }
            _ => {}
        }
    }
    Ok(text)
}

async fn job_is_stopped(docker: &Docker, container_id: &str) -> bool {
    use bollard::container::InspectContainerOptions;
    match docker
        .inspect_container(container_id, None::<InspectContainerOptions>)
        .await
    {
        Ok(inspect) => inspect
            .state
            .and_then(|s| s.running)
            .map(|running| !running)
            .unwrap_or(true),
        // Gone counts as stopped.
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_buffer_splits_on_newlines() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push(b"one\ntwo\nthr");
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);

        let lines = buffer.push(b"ee\nfour");
        assert_eq!(lines, vec!["three".to_string()]);

        assert_eq!(buffer.finish(), Some("four".to_string()));
    }

    #[test]
    fn line_buffer_strips_carriage_returns() {
        let mut buffer = LineBuffer::new();
        let lines = buffer.push(b"one\r\ntwo\r\n");
        assert_eq!(lines, vec!["one".to_string(), "two".to_string()]);
        assert_eq!(buffer.finish(), None);
    }

    #[test]
    fn line_buffer_handles_chunk_boundaries_inside_a_line() {
        let mut buffer = LineBuffer::new();
        assert!(buffer.push(b"hel").is_empty());
        assert!(buffer.push(b"lo wor").is_empty());
        let lines = buffer.push(b"ld\n");
        assert_eq!(lines, vec!["hello world".to_string()]);
    }

    #[test]
    fn polling_diff_only_yields_new_complete_lines() {
        let (lines, seen) = new_complete_lines("a\nb\npartial", 0);
        assert_eq!(lines, vec!["a".to_string(), "b".to_string()]);
        assert_eq!(seen, 4);

        // Nothing new appended yet: the partial tail stays unconsumed.
        let (lines, seen) = new_complete_lines("a\nb\npartial", seen);
        assert!(lines.is_empty());
        assert_eq!(seen, 4);

        let (lines, seen) = new_complete_lines("a\nb\npartial done\nc\n", seen);
        assert_eq!(lines, vec!["partial done".to_string(), "c".to_string()]);
        assert_eq!(seen, 19);
    }

    #[test]
    fn polling_diff_tolerates_shrinking_text() {
        // A re-fetch that comes back shorter (engine hiccup) must not
        // panic on out-of-range slicing.
        let (lines, seen) = new_complete_lines("ab", 10);
        assert!(lines.is_empty());
        assert_eq!(seen, 10);
    }

    #[test]
    fn marker_lines_stream_in_order_and_result_is_extracted() {
        use crate::classify::{classify_line, Classified};
        use optilab_common::types::{ExecutionRequest, LogLevel};
        use serde_json::Map;

        // A job emits three structured lines and then its final result
        // marker; the channel sees three ordered events and extraction
        // recovers the marker payload.
        let id = "exec42";
        let raw = [
            format!(r#"STREAM_LOG: {{"execution_id":"{}","level":"info","message":"first"}}"#, id),
            format!(r#"STREAM_LOG: {{"execution_id":"{}","level":"info","message":"second"}}"#, id),
            format!(r#"STREAM_LOG: {{"execution_id":"other","level":"info","message":"cross-talk"}}"#),
            format!(r#"STREAM_LOG: {{"execution_id":"{}","level":"error","message":"third"}}"#, id),
            r#"EXECUTION_RESULT: {"best_value": 42.5, "iterations": 100, "success": true}"#.to_string(),
        ];

        let mut captured = String::new();
        let mut events = Vec::new();
        for line in &raw {
            captured.push_str(line);
            captured.push('\n');
            if let Classified::Emit(event) = classify_line(line, id) {
                events.push(event);
            }
        }

        // The cross-talk line never reaches the channel; order holds.
        let marker_events: Vec<_> = events
            .iter()
            .filter(|e| ["first", "second", "third"].contains(&e.message.as_str()))
            .collect();
        assert_eq!(marker_events.len(), 3);
        assert_eq!(marker_events[0].message, "first");
        assert_eq!(marker_events[1].message, "second");
        assert_eq!(marker_events[2].message, "third");
        assert_eq!(marker_events[2].level, LogLevel::Error);
        assert!(!events.iter().any(|e| e.message == "cross-talk"));

        let request = ExecutionRequest {
            problem_name: "tsp".into(),
            problem_owner: "alice".into(),
            optimizer_name: "genetic".into(),
            optimizer_owner: "bob".into(),
            problem_params: Map::new(),
            optimizer_params: Map::new(),
            timeout_secs: None,
        };
        let result = crate::extract::extract_from_text(&request, true, None, &captured, 3.0);
        assert!(result.success);
        assert_eq!(result.best_value, Some(42.5));
        assert_eq!(result.iterations, Some(100));
    }

    #[test]
    fn streaming_and_polling_split_identically() {
        // The fallback path must classify the same line sequence the
        // live path would have produced.
        let full = "Loading problem: a/tsp\ngeneration 1\nbest value: 9.5\n";

        let mut buffer = LineBuffer::new();
        let mut live_lines = Vec::new();
        for chunk in full.as_bytes().chunks(7) {
            live_lines.extend(buffer.push(chunk));
        }
        if let Some(tail) = buffer.finish() {
            live_lines.push(tail);
        }

        let mut polled_lines = Vec::new();
        let mut seen = 0;
        // Simulate the log growing a few bytes per poll.
        for end in (0..=full.len()).step_by(5).chain(std::iter::once(full.len())) {
            let (lines, new_seen) = new_complete_lines(&full[..end], seen);
            polled_lines.extend(lines);
            seen = new_seen;
        }

        assert_eq!(live_lines, polled_lines);
    }
}
