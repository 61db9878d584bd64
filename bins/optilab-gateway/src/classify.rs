/// Log Line Classifier
///
/// **Core Responsibility:**
/// Map one raw line of pod output to a `(level, source)` pair, or drop
/// it (cross-talk, duplicates, infra noise).
///
/// **Critical Properties:**
/// - Pure: (line, execution_id) → classification, no I/O, no state.
/// - Ordered: rules are evaluated top to bottom and the first match
///   wins. Later rules are broader and would swallow earlier, more
///   specific ones, so the order below is load-bearing.
use optilab_common::types::{LogEvent, LogLevel, LogSource};
use serde::Deserialize;

/// Prefix the workload prepends to its structured log lines.
pub const STREAM_LOG_PREFIX: &str = "STREAM_LOG:";

#[derive(Debug, Clone)]
pub enum Classified {
    Emit(LogEvent),
    Discard,
}

impl Classified {
    pub fn is_discard(&self) -> bool {
        matches!(self, Classified::Discard)
    }
}

#[derive(Debug, Deserialize)]
struct MarkerPayload {
    execution_id: String,
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

/// One keyword rule: the line matches when it contains any
/// case-insensitive keyword or any exact-case keyword.
struct KeywordRule {
    any_ci: &'static [&'static str],
    any_cs: &'static [&'static str],
    level: LogLevel,
    source: LogSource,
}

const KEYWORD_RULES: &[KeywordRule] = &[
    // Lifecycle phrases from the loader.
    KeywordRule {
        any_ci: &[
            "loading problem",
            "loading optimizer",
            "problem loaded",
            "optimizer loaded",
            "loaded problem",
            "loaded optimizer",
        ],
        any_cs: &[],
        level: LogLevel::Info,
        source: LogSource::Qubots,
    },
    // Optimization progress. "Best" is matched exact-case so that
    // lowercase "best value" result labels still reach the results
    // rule further down.
    KeywordRule {
        any_ci: &[
            "generation",
            "iteration",
            "fitness",
            "objective",
            "improvement",
            "starting optimization",
            "optimization started",
            "optimization stopped",
        ],
        any_cs: &["Best"],
        level: LogLevel::Info,
        source: LogSource::Optimizer,
    },
    KeywordRule {
        any_ci: &["dataset"],
        any_cs: &[],
        level: LogLevel::Info,
        source: LogSource::Dataset,
    },
    KeywordRule {
        any_ci: &[
            "qubots",
            "optimization",
            "executing",
            "loading",
            "starting",
            "completed",
        ],
        any_cs: &[],
        level: LogLevel::Info,
        source: LogSource::Qubots,
    },
    KeywordRule {
        any_ci: &["error", "exception", "failed", "traceback"],
        any_cs: &[],
        level: LogLevel::Error,
        source: LogSource::Pod,
    },
    KeywordRule {
        any_ci: &["best value", "runtime", "iterations", "solution found"],
        any_cs: &[],
        level: LogLevel::Info,
        source: LogSource::Results,
    },
    KeywordRule {
        any_ci: &["success", "complete", "finished"],
        any_cs: &[],
        level: LogLevel::Info,
        source: LogSource::System,
    },
];

const BRACKET_TAGS: &[(&str, LogLevel)] = &[
    ("[DEBUG]", LogLevel::Debug),
    ("[INFO]", LogLevel::Info),
    ("[WARNING]", LogLevel::Warning),
    ("[ERROR]", LogLevel::Error),
];

/// Lines carrying only infra noise are dropped rather than surfaced as
/// debug output.
const NOISE_WORDS: &[&str] = &[
    "ts=",
    "level=",
    "http2",
    "grpc",
    "rpc error",
    "kubelet",
    "containerd",
];

/// Classify one raw line of output for the given execution.
pub fn classify_line(line: &str, execution_id: &str) -> Classified {
    let trimmed = line.trim();

    // 1. Explicit structured marker. A mismatched execution id means
    //    another job's output bled into this stream: discard silently.
    //    The "metrics" source duplicates the companion metrics channel
    //    and is suppressed too.
    if let Some(payload) = trimmed.strip_prefix(STREAM_LOG_PREFIX) {
        if let Ok(marker) = serde_json::from_str::<MarkerPayload>(payload.trim()) {
            if marker.execution_id != execution_id {
                return Classified::Discard;
            }
            if marker.source.as_deref() == Some("metrics") {
                return Classified::Discard;
            }
            let level = marker
                .level
                .as_deref()
                .map(LogLevel::parse)
                .unwrap_or(LogLevel::Info);
            let source = marker
                .source
                .as_deref()
                .map(LogSource::parse)
                .unwrap_or(LogSource::Qubots);
            let message = marker.message.unwrap_or_else(|| payload.trim().to_string());
            return Classified::Emit(LogEvent::new(level, source, message));
        }
        // Malformed marker: fall through to the generic rules.
    }

    // 2. Bare JSON that still carries timestamp + execution_id is a
    //    likely duplicate of a marker line already delivered.
    if trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            if value.get("timestamp").is_some() && value.get("execution_id").is_some() {
                return Classified::Discard;
            }
        }
    }

    // 3. Bracketed level tags from the optimizer's own logger.
    if let Some((_, level)) = BRACKET_TAGS.iter().find(|(tag, _)| trimmed.contains(tag)) {
        let mut message = trimmed.to_string();
        for (tag, _) in BRACKET_TAGS {
            message = message.replace(tag, "");
        }
        return Classified::Emit(LogEvent::new(
            *level,
            LogSource::Optimizer,
            message.trim().to_string(),
        ));
    }

    // 4-10. Keyword rules, first match wins.
    let lowered = trimmed.to_lowercase();
    for rule in KEYWORD_RULES {
        let hit = rule.any_ci.iter().any(|k| lowered.contains(k))
            || rule.any_cs.iter().any(|k| trimmed.contains(k));
        if hit {
            return Classified::Emit(LogEvent::new(rule.level, rule.source, trimmed.to_string()));
        }
    }

    // 11. Anything else non-empty is debug pod output, unless it is
    //     recognizable infra noise.
    if trimmed.is_empty() || NOISE_WORDS.iter().any(|w| lowered.contains(w)) {
        return Classified::Discard;
    }

    Classified::Emit(LogEvent::new(
        LogLevel::Debug,
        LogSource::Pod,
        trimmed.to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn emit(line: &str) -> LogEvent {
        match classify_line(line, "exec1") {
            Classified::Emit(event) => event,
            Classified::Discard => panic!("expected emit for line: {}", line),
        }
    }

    fn assert_discarded(line: &str) {
        assert!(
            classify_line(line, "exec1").is_discard(),
            "expected discard for line: {}",
            line
        );
    }

    #[test]
    fn marker_with_matching_id_is_emitted_verbatim() {
        let line = r#"STREAM_LOG: {"execution_id":"exec1","level":"warning","message":"budget low","source":"optimizer","timestamp":1.0}"#;
        let event = emit(line);
        assert_eq!(event.level, LogLevel::Warning);
        assert_eq!(event.source, LogSource::Optimizer);
        assert_eq!(event.message, "budget low");
    }

    #[test]
    fn marker_with_foreign_id_is_discarded() {
        // Cross-talk guard: another execution's marker must never leak
        // into this channel.
        let line = r#"STREAM_LOG: {"execution_id":"someone-else","level":"info","message":"hi"}"#;
        assert_discarded(line);
    }

    #[test]
    fn metrics_marker_is_suppressed() {
        let line = r#"STREAM_LOG: {"execution_id":"exec1","level":"info","message":"cpu 40%","source":"metrics"}"#;
        assert_discarded(line);
    }

    #[test]
    fn bare_json_duplicate_is_discarded() {
        let line = r#"{"timestamp": 123.4, "execution_id": "exec1", "message": "dup"}"#;
        assert_discarded(line);
    }

    #[test]
    fn bare_json_without_marker_keys_is_not_discarded() {
        let event = emit(r#"{"value": 3}"#);
        assert_eq!(event.level, LogLevel::Debug);
        assert_eq!(event.source, LogSource::Pod);
    }

    #[test]
    fn bracket_tags_are_stripped() {
        let event = emit("[INFO] [DEBUG] swapping route segments");
        assert_eq!(event.level, LogLevel::Info);
        assert_eq!(event.source, LogSource::Optimizer);
        assert_eq!(event.message, "swapping route segments");
    }

    #[test]
    fn lifecycle_phrases_map_to_qubots() {
        let event = emit("Loading problem: alice/tsp");
        assert_eq!(event.level, LogLevel::Info);
        assert_eq!(event.source, LogSource::Qubots);
    }

    #[test]
    fn progress_keywords_map_to_optimizer() {
        let event = emit("generation 14: fitness 812.5");
        assert_eq!(event.source, LogSource::Optimizer);

        let event = emit("Best improvement so far: 3%");
        assert_eq!(event.source, LogSource::Optimizer);
    }

    #[test]
    fn lowercase_best_value_reaches_results_rule() {
        // "Best" (exact case) belongs to the progress rule; the
        // lowercase result label falls through to the results rule.
        let event = emit("best value: 42.5");
        assert_eq!(event.source, LogSource::Results);

        let event = emit("solution found after restart");
        assert_eq!(event.source, LogSource::Results);
    }

    #[test]
    fn dataset_lines_map_to_dataset() {
        let event = emit("Connecting to dataset server...");
        assert_eq!(event.source, LogSource::Dataset);
    }

    #[test]
    fn error_keywords_win_over_results_and_system() {
        let event = emit("Traceback (most recent call last):");
        assert_eq!(event.level, LogLevel::Error);
        assert_eq!(event.source, LogSource::Pod);

        // "failed" beats the broader "finished"/"complete" rule below it.
        let event = emit("worker failed before the run finished");
        assert_eq!(event.level, LogLevel::Error);
        assert_eq!(event.source, LogSource::Pod);
    }

    #[test]
    fn completion_phrases_map_to_system() {
        // "complete"/"finished" without the broader qubots keywords.
        let event = emit("run finished");
        assert_eq!(event.source, LogSource::System);
    }

    #[test]
    fn leftover_lines_are_debug_pod() {
        let event = emit("pid 1 exited");
        assert_eq!(event.level, LogLevel::Debug);
        assert_eq!(event.source, LogSource::Pod);
    }

    #[test]
    fn noise_and_blank_lines_are_dropped() {
        assert_discarded("");
        assert_discarded("   ");
        assert_discarded("ts=2024-01-01T00:00:00Z level=debug msg=sync");
        assert_discarded("rpc error: code = Unavailable");
    }

    #[test]
    fn classification_is_deterministic() {
        let lines = [
            "Loading optimizer: bob/genetic",
            "generation 3",
            "best value: 1.25",
            "[ERROR] out of bounds",
            "run finished",
            "pid 1 exited",
        ];
        for line in lines {
            let first = emit(line);
            let second = emit(line);
            assert_eq!(
                (first.level, first.source, &first.message),
                (second.level, second.source, &second.message),
                "two passes disagreed for: {}",
                line
            );
        }
    }
}
