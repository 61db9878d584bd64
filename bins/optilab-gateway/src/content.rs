// Repository content store client (Gitea-style API).
//
// External collaborator: the gateway only reads file contents to sanity
// check that a requested problem/optimizer repository exists and carries
// a manifest. Failures classify through the error subsystem and fall
// back to the last cached copy when one exists.
use anyhow::{Context, Result};
use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::errors::{classify, ErrorTracker, FallbackProc};

#[derive(Debug, Clone)]
pub struct FileContent {
    pub ok: bool,
    pub status: u16,
    /// Base64 file body, present on success.
    pub content: Option<String>,
}

impl FileContent {
    pub fn decoded(&self) -> Result<String> {
        let encoded = self
            .content
            .as_deref()
            .context("no content in response")?;
        let bytes = general_purpose::STANDARD
            .decode(encoded.trim())
            .context("content is not valid base64")?;
        String::from_utf8(bytes).context("content is not valid UTF-8")
    }
}

#[derive(Debug, Deserialize)]
struct ContentsResponse {
    content: Option<String>,
}

#[derive(Clone)]
pub struct ContentClient {
    http: reqwest::Client,
    base_url: String,
    errors: ErrorTracker,
    cache: Arc<RwLock<HashMap<String, FileContent>>>,
}

impl ContentClient {
    pub fn new(base_url: String, errors: ErrorTracker) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            errors,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Fetch one file from a repository. Transport failures serve the
    /// cached copy when the fallback table names one for this
    /// operation; a missing cache entry surfaces the original error.
    pub async fn get_file_content(
        &self,
        owner: &str,
        repo: &str,
        path: &str,
    ) -> Result<FileContent> {
        let key = format!("{}/{}/{}", owner, repo, path);

        match self.fetch(owner, repo, path).await {
            Ok(file) => {
                if file.ok {
                    self.cache.write().await.insert(key, file.clone());
                }
                Ok(file)
            }
            Err(e) => {
                let classified = classify(&format!("{:#}", e), None, "repo_content");
                self.errors.record(classified).await;

                if self.errors.fallback_for("repo_content") == Some(FallbackProc::CachedCopy) {
                    if let Some(cached) = self.cache.read().await.get(&key).cloned() {
                        warn!(
                            owner = owner,
                            repo = repo,
                            path = path,
                            error = %e,
                            "Content store unavailable, serving cached copy"
                        );
                        return Ok(cached);
                    }
                }
                Err(e)
            }
        }
    }

    async fn fetch(&self, owner: &str, repo: &str, path: &str) -> Result<FileContent> {
        let url = format!(
            "{}/api/v1/repos/{}/{}/contents/{}",
            self.base_url, owner, repo, path
        );
        debug!(url = %url, "Fetching repository content");

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .context("content store request failed")?;
        let status = response.status().as_u16();

        if !response.status().is_success() {
            return Ok(FileContent {
                ok: false,
                status,
                content: None,
            });
        }

        let body: ContentsResponse = response
            .json()
            .await
            .context("content store returned malformed JSON")?;
        Ok(FileContent {
            ok: true,
            status,
            content: body.content,
        })
    }

    #[cfg(test)]
    async fn seed_cache(&self, key: &str, file: FileContent) {
        self.cache.write().await.insert(key.to_string(), file);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_base64_content() {
        let file = FileContent {
            ok: true,
            status: 200,
            content: Some(general_purpose::STANDARD.encode("{\"type\": \"problem\"}")),
        };
        assert_eq!(file.decoded().unwrap(), "{\"type\": \"problem\"}");
    }

    #[test]
    fn decoding_missing_content_fails() {
        let file = FileContent {
            ok: false,
            status: 404,
            content: None,
        };
        assert!(file.decoded().is_err());
    }

    #[tokio::test]
    async fn unreachable_store_serves_cached_copy() {
        let errors = ErrorTracker::new();
        // Port 9 is discard; the request cannot succeed.
        let client = ContentClient::new("http://127.0.0.1:9".to_string(), errors.clone());
        client
            .seed_cache(
                "alice/tsp/config.json",
                FileContent {
                    ok: true,
                    status: 200,
                    content: Some(general_purpose::STANDARD.encode("{}")),
                },
            )
            .await;

        let file = client
            .get_file_content("alice", "tsp", "config.json")
            .await
            .unwrap();
        assert!(file.ok);
        assert_eq!(file.decoded().unwrap(), "{}");
        // The failure itself was recorded before the fallback served.
        assert!(errors.len().await >= 1);
    }
}
