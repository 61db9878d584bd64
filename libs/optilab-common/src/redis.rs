use crate::types::{ExecutionResult, ExecutionState, SubmissionRow};
use redis::{AsyncCommands, RedisResult};

/// Durable record store semantics - defines only key naming and row
/// shapes, not runtime logic. Ensures the gateway and the CLI never
/// drift and Redis keys stay deterministic.

pub const RESULT_PREFIX: &str = "optilab:result";
pub const STATUS_PREFIX: &str = "optilab:status";
pub const CANCEL_PREFIX: &str = "optilab:cancel";
pub const SUBMISSION_PREFIX: &str = "optilab:submission";
pub const LEADERBOARD_PREFIX: &str = "optilab:leaderboard";

/// Results are kept for a day; the web tier copies anything it wants to
/// keep longer into its own store.
pub const RESULT_TTL_SECS: u64 = 86400;
/// Cancellation flags only need to outlive the job deadline.
pub const CANCEL_TTL_SECS: u64 = 3600;

pub fn result_key(execution_id: &str) -> String {
    format!("{}:{}", RESULT_PREFIX, execution_id)
}

pub fn status_key(execution_id: &str) -> String {
    format!("{}:{}", STATUS_PREFIX, execution_id)
}

pub fn cancel_key(execution_id: &str) -> String {
    format!("{}:{}", CANCEL_PREFIX, execution_id)
}

pub fn submission_key(execution_id: &str) -> String {
    format!("{}:{}", SUBMISSION_PREFIX, execution_id)
}

pub fn leaderboard_key(problem: &str) -> String {
    format!("{}:{}", LEADERBOARD_PREFIX, problem)
}

fn serde_err(e: serde_json::Error) -> redis::RedisError {
    redis::RedisError::from((
        redis::ErrorKind::TypeError,
        "serialization error",
        e.to_string(),
    ))
}

/// Store the normalized result for an execution, with status alongside
/// for quick lookup.
pub async fn store_result(
    conn: &mut redis::aio::ConnectionManager,
    execution_id: &str,
    state: ExecutionState,
    result: &ExecutionResult,
) -> RedisResult<()> {
    let payload = serde_json::to_string(result).map_err(serde_err)?;
    let _: () = conn
        .set_ex(result_key(execution_id), payload, RESULT_TTL_SECS)
        .await?;

    let status = serde_json::to_string(&state).map_err(serde_err)?;
    let _: () = conn
        .set_ex(status_key(execution_id), status, RESULT_TTL_SECS)
        .await?;

    Ok(())
}

pub async fn get_result(
    conn: &mut redis::aio::ConnectionManager,
    execution_id: &str,
) -> RedisResult<Option<ExecutionResult>> {
    let payload: Option<String> = conn.get(result_key(execution_id)).await?;
    match payload {
        Some(data) => {
            let result: ExecutionResult = serde_json::from_str(&data).map_err(serde_err)?;
            Ok(Some(result))
        }
        None => Ok(None),
    }
}

pub async fn get_status(
    conn: &mut redis::aio::ConnectionManager,
    execution_id: &str,
) -> RedisResult<Option<ExecutionState>> {
    let payload: Option<String> = conn.get(status_key(execution_id)).await?;
    match payload {
        Some(data) => {
            let state: ExecutionState = serde_json::from_str(&data).map_err(serde_err)?;
            Ok(Some(state))
        }
        None => Ok(None),
    }
}

/// Flag an execution for cancellation. The orchestrator's completion
/// poll checks this flag between polls; the flag survives a gateway
/// restart so an orphaned job is still torn down.
pub async fn request_cancel(
    conn: &mut redis::aio::ConnectionManager,
    execution_id: &str,
) -> RedisResult<()> {
    conn.set_ex(cancel_key(execution_id), "1", CANCEL_TTL_SECS)
        .await
}

pub async fn is_cancel_requested(
    conn: &mut redis::aio::ConnectionManager,
    execution_id: &str,
) -> RedisResult<bool> {
    conn.exists(cancel_key(execution_id)).await
}

pub async fn clear_cancel(
    conn: &mut redis::aio::ConnectionManager,
    execution_id: &str,
) -> RedisResult<()> {
    conn.del(cancel_key(execution_id)).await
}

/// Record the submission row for an accepted request.
pub async fn record_submission(
    conn: &mut redis::aio::ConnectionManager,
    row: &SubmissionRow,
) -> RedisResult<()> {
    let payload = serde_json::to_string(row).map_err(serde_err)?;
    conn.set(submission_key(&row.execution_id), payload).await
}

/// Upsert a leaderboard entry for a problem. Scores are the best value
/// found; lower is better, so rank reads use ascending order.
pub async fn leaderboard_upsert(
    conn: &mut redis::aio::ConnectionManager,
    problem: &str,
    member: &str,
    best_value: f64,
) -> RedisResult<()> {
    conn.zadd(leaderboard_key(problem), member, best_value).await
}

pub async fn leaderboard_top(
    conn: &mut redis::aio::ConnectionManager,
    problem: &str,
    limit: isize,
) -> RedisResult<Vec<(String, f64)>> {
    conn.zrange_withscores(leaderboard_key(problem), 0, limit - 1)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_naming() {
        assert_eq!(result_key("abc"), "optilab:result:abc");
        assert_eq!(status_key("abc"), "optilab:status:abc");
        assert_eq!(cancel_key("abc"), "optilab:cancel:abc");
        assert_eq!(submission_key("abc"), "optilab:submission:abc");
        assert_eq!(leaderboard_key("tsp"), "optilab:leaderboard:tsp");
    }

    #[test]
    fn test_keys_deterministic() {
        let id = crate::types::new_execution_id();
        assert_eq!(result_key(&id), result_key(&id));
        assert!(result_key(&id).starts_with("optilab:result:"));
        assert!(result_key(&id).contains(&id));
    }
}
