// Runtime configuration for the Optilab gateway
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Settings governing how executions are launched, streamed and bounded.
/// Loaded from config/runtime.json; addresses can be overridden from the
/// environment so the same file works across deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeSettings {
    /// Logical namespace stamped onto every job the gateway owns.
    /// Must be non-empty; an empty namespace is rejected before any
    /// engine call is made.
    pub namespace: String,
    /// Sandbox image the playground workload runs in.
    pub image: String,
    /// Hard ceiling on job runtime, enforced by a watchdog that kills
    /// the container. Survives a lost orchestrator task.
    #[serde(default = "default_active_deadline_secs")]
    pub active_deadline_secs: u64,
    /// Grace period after a job stops before the reaper removes the
    /// container, so orphans self-delete even if cleanup never ran.
    #[serde(default = "default_ttl_after_finish_secs")]
    pub ttl_after_finish_secs: u64,
    #[serde(default = "default_status_poll_interval_secs")]
    pub status_poll_interval_secs: u64,
    /// Completion-poll budget. interval * budget should exceed the
    /// active deadline so the watchdog's kill is observed first.
    #[serde(default = "default_status_poll_budget")]
    pub status_poll_budget: u32,
    /// Fixed wait after submission before the first pod lookup.
    #[serde(default = "default_pod_grace_secs")]
    pub pod_grace_secs: u64,
    /// Bounded wait for the pod to appear, 1s between lookups.
    #[serde(default = "default_pod_wait_secs")]
    pub pod_wait_secs: u64,
    /// Lines of history requested when attaching to live output.
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: u32,
    #[serde(default = "default_log_poll_interval_secs")]
    pub log_poll_interval_secs: u64,
    #[serde(default = "default_log_poll_budget")]
    pub log_poll_budget: u32,
    #[serde(default = "default_memory_limit_bytes")]
    pub memory_limit_bytes: i64,
    /// Soft reservation; the limit above is the hard ceiling.
    #[serde(default = "default_memory_reservation_bytes")]
    pub memory_reservation_bytes: i64,
    #[serde(default = "default_nano_cpus")]
    pub nano_cpus: i64,
    /// Base URL of the repository content store (Gitea-style API).
    #[serde(default = "default_content_base_url")]
    pub content_base_url: String,
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
}

fn default_active_deadline_secs() -> u64 {
    300
}

fn default_ttl_after_finish_secs() -> u64 {
    300
}

fn default_status_poll_interval_secs() -> u64 {
    5
}

fn default_status_poll_budget() -> u32 {
    60
}

fn default_pod_grace_secs() -> u64 {
    2
}

fn default_pod_wait_secs() -> u64 {
    30
}

fn default_log_tail_lines() -> u32 {
    50
}

fn default_log_poll_interval_secs() -> u64 {
    2
}

fn default_log_poll_budget() -> u32 {
    150
}

fn default_memory_limit_bytes() -> i64 {
    2 * 1024 * 1024 * 1024 // 2Gi
}

fn default_memory_reservation_bytes() -> i64 {
    512 * 1024 * 1024 // 512Mi
}

fn default_nano_cpus() -> i64 {
    1_000_000_000 // 1 CPU
}

fn default_content_base_url() -> String {
    "https://hub.rastion.com".to_string()
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            namespace: "optilab".to_string(),
            image: "optilab-playground:latest".to_string(),
            active_deadline_secs: default_active_deadline_secs(),
            ttl_after_finish_secs: default_ttl_after_finish_secs(),
            status_poll_interval_secs: default_status_poll_interval_secs(),
            status_poll_budget: default_status_poll_budget(),
            pod_grace_secs: default_pod_grace_secs(),
            pod_wait_secs: default_pod_wait_secs(),
            log_tail_lines: default_log_tail_lines(),
            log_poll_interval_secs: default_log_poll_interval_secs(),
            log_poll_budget: default_log_poll_budget(),
            memory_limit_bytes: default_memory_limit_bytes(),
            memory_reservation_bytes: default_memory_reservation_bytes(),
            nano_cpus: default_nano_cpus(),
            content_base_url: default_content_base_url(),
            bind_addr: default_bind_addr(),
        }
    }
}

impl RuntimeSettings {
    /// Load settings from a runtime.json file.
    pub fn load(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            bail!("Runtime config file not found: {}", config_path.display());
        }

        let content = fs::read_to_string(config_path).context("Failed to read runtime.json")?;

        let mut settings: RuntimeSettings =
            serde_json::from_str(&content).context("Failed to parse runtime.json")?;
        settings.apply_env_overrides();
        Ok(settings)
    }

    /// Load with default path (config/runtime.json), falling back to
    /// built-in defaults when the file is absent.
    pub fn load_default() -> Result<Self> {
        let default_path = Path::new("config/runtime.json");
        if default_path.exists() {
            Self::load(default_path)
        } else {
            let mut settings = Self::default();
            settings.apply_env_overrides();
            Ok(settings)
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(ns) = std::env::var("OPTILAB_NAMESPACE") {
            self.namespace = ns;
        }
        if let Ok(image) = std::env::var("OPTILAB_IMAGE") {
            self.image = image;
        }
        if let Ok(url) = std::env::var("OPTILAB_CONTENT_URL") {
            self.content_base_url = url;
        }
        if let Ok(addr) = std::env::var("OPTILAB_BIND_ADDR") {
            self.bind_addr = addr;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_bound_each_other() {
        let s = RuntimeSettings::default();
        // The poll budget must outlast the watchdog so the scheduler's
        // own termination is observed first in the common case.
        assert!(s.status_poll_interval_secs * s.status_poll_budget as u64 >= s.active_deadline_secs);
        assert!(!s.namespace.trim().is_empty());
    }

    #[test]
    fn parses_partial_config() {
        let settings: RuntimeSettings = serde_json::from_str(
            r#"{"namespace": "playground", "image": "playground:v2"}"#,
        )
        .unwrap();
        assert_eq!(settings.namespace, "playground");
        assert_eq!(settings.image, "playground:v2");
        assert_eq!(settings.active_deadline_secs, 300);
        assert_eq!(settings.log_poll_budget, 150);
    }
}
