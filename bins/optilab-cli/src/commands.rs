// CLI commands for interacting with the Optilab gateway
use anyhow::{bail, Context, Result};
use optilab_common::types::ExecutionRequest;
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Split an "owner/name" repository coordinate.
fn split_repo(repo: &str) -> Result<(String, String)> {
    match repo.split_once('/') {
        Some((owner, name)) if !owner.is_empty() && !name.is_empty() => {
            Ok((owner.to_string(), name.to_string()))
        }
        _ => bail!("Repository must be given as owner/name, got '{}'", repo),
    }
}

fn parse_params(raw: &str, which: &str) -> Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(raw)
        .with_context(|| format!("{} params are not valid JSON", which))?;
    match value {
        Value::Object(map) => Ok(map),
        _ => bail!("{} params must be a JSON object", which),
    }
}

/// Submit an execution, optionally polling until it finishes.
pub async fn submit(
    gateway: &str,
    problem: &str,
    optimizer: &str,
    problem_params: &str,
    optimizer_params: &str,
    timeout_secs: Option<u64>,
    wait: bool,
) -> Result<()> {
    let (problem_owner, problem_name) = split_repo(problem)?;
    let (optimizer_owner, optimizer_name) = split_repo(optimizer)?;

    let request = ExecutionRequest {
        problem_name,
        problem_owner,
        optimizer_name,
        optimizer_owner,
        problem_params: parse_params(problem_params, "problem")?,
        optimizer_params: parse_params(optimizer_params, "optimizer")?,
        timeout_secs,
    };

    println!("🚀 Submitting {} vs {}", problem, optimizer);

    let client = reqwest::Client::new();
    let response = client
        .post(format!("{}/api/execute", gateway.trim_end_matches('/')))
        .json(&request)
        .send()
        .await
        .context("Failed to reach the gateway")?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        bail!("Gateway rejected the submission ({}): {}", status, body);
    }

    let body: Value = response.json().await.context("Malformed gateway response")?;
    let execution_id = body
        .get("execution_id")
        .and_then(Value::as_str)
        .context("Gateway response missing execution_id")?
        .to_string();

    println!("✅ Execution accepted: {}", execution_id);
    println!("   Stream: {}/ws/{}", gateway.trim_end_matches('/'), execution_id);

    if wait {
        println!("⏳ Waiting for the result...");
        poll_result(gateway, &execution_id).await?;
    } else {
        println!("   Fetch later with: optilab-cli result --id {}", execution_id);
    }

    Ok(())
}

async fn poll_result(gateway: &str, execution_id: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!(
        "{}/api/executions/{}",
        gateway.trim_end_matches('/'),
        execution_id
    );

    // The gateway bounds job runtime; add headroom for scheduling.
    for _ in 0..200 {
        let response = client
            .get(&url)
            .send()
            .await
            .context("Failed to reach the gateway")?;

        match response.status().as_u16() {
            200 => {
                let result: Value = response.json().await.context("Malformed result payload")?;
                print_result(&result);
                return Ok(());
            }
            202 => {
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                bail!("Result lookup failed ({}): {}", status, body);
            }
        }
    }

    bail!("Timed out waiting for execution {}", execution_id)
}

/// Fetch and print the result of an execution.
pub async fn fetch_result(gateway: &str, execution_id: &str) -> Result<()> {
    let client = reqwest::Client::new();
    let url = format!(
        "{}/api/executions/{}",
        gateway.trim_end_matches('/'),
        execution_id
    );

    let response = client
        .get(&url)
        .send()
        .await
        .context("Failed to reach the gateway")?;

    match response.status().as_u16() {
        200 => {
            let result: Value = response.json().await.context("Malformed result payload")?;
            print_result(&result);
            Ok(())
        }
        202 => {
            println!("⏳ Execution {} is still running", execution_id);
            Ok(())
        }
        status => {
            let body = response.text().await.unwrap_or_default();
            bail!("Result lookup failed ({}): {}", status, body);
        }
    }
}

fn print_result(result: &Value) {
    let success = result.get("success").and_then(Value::as_bool).unwrap_or(false);
    if success {
        println!("✅ Execution succeeded");
    } else {
        println!("❌ Execution failed");
        if let Some(message) = result.get("error_message").and_then(Value::as_str) {
            println!("   {}", message);
        }
    }
    if let Some(best) = result.get("best_value").and_then(Value::as_f64) {
        println!("   Best value: {}", best);
    }
    if let Some(iterations) = result.get("iterations").and_then(Value::as_u64) {
        println!("   Iterations: {}", iterations);
    }
    if let Some(time) = result.get("execution_time").and_then(Value::as_f64) {
        println!("   Execution time: {:.3}s", time);
    }
    println!("{}", serde_json::to_string_pretty(result).unwrap_or_default());
}

/// Initialize a gateway project directory with a default runtime config.
pub fn init_project(path: &str) -> Result<()> {
    println!("🚀 Initializing Optilab project at: {}", path);

    let project_path = Path::new(path);
    let config_dir = project_path.join("config");
    fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
    println!("  ✅ Created: config");

    let config_path = config_dir.join("runtime.json");
    if config_path.exists() {
        println!("  ⏭  config/runtime.json already exists, leaving it alone");
        return Ok(());
    }

    let default_config = serde_json::json!({
        "namespace": "optilab",
        "image": "optilab-playground:latest",
        "active_deadline_secs": 300,
        "ttl_after_finish_secs": 300,
        "status_poll_interval_secs": 5,
        "status_poll_budget": 60,
        "pod_grace_secs": 2,
        "pod_wait_secs": 30,
        "log_tail_lines": 50,
        "log_poll_interval_secs": 2,
        "log_poll_budget": 150,
        "memory_limit_bytes": 2147483648u64,
        "memory_reservation_bytes": 536870912u64,
        "nano_cpus": 1000000000u64,
        "content_base_url": "https://hub.rastion.com",
        "bind_addr": "0.0.0.0:3000"
    });

    fs::write(
        &config_path,
        serde_json::to_string_pretty(&default_config)?,
    )
    .context("Failed to write config/runtime.json")?;
    println!("  ✅ Created: config/runtime.json");

    println!("✅ Project initialized successfully!");
    println!("\n📋 Next steps:");
    println!("  1. Adjust config/runtime.json (namespace, image, limits)");
    println!("  2. Start the gateway: optilab-gateway");
    println!("  3. Submit a run: optilab-cli submit -p alice/tsp -o bob/genetic");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_repo_requires_owner_and_name() {
        assert_eq!(
            split_repo("alice/tsp").unwrap(),
            ("alice".to_string(), "tsp".to_string())
        );
        assert!(split_repo("tsp").is_err());
        assert!(split_repo("/tsp").is_err());
        assert!(split_repo("alice/").is_err());
    }

    #[test]
    fn params_must_be_objects() {
        assert!(parse_params("{}", "problem").unwrap().is_empty());
        assert_eq!(
            parse_params(r#"{"cities": 50}"#, "problem").unwrap()["cities"],
            50
        );
        assert!(parse_params("[1,2]", "problem").is_err());
        assert!(parse_params("not json", "problem").is_err());
    }
}
