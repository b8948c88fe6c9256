//! Web search for retrieval.
//!
//! Two independent providers (usually the same service with a primary and
//! a backup API key). [`WebSearch::search`] falls back to the backup once
//! when the primary fails and yields an empty set when both fail, so a web
//! outage never fails a chat turn.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::config::WebSearchConfig;
use crate::models::Source;

#[async_trait]
pub trait WebSearchProvider: Send + Sync {
    fn name(&self) -> &str;
    async fn search(&self, query: &str, count: usize) -> Result<Vec<Source>>;
}

/// Brave-style JSON search API (`GET ?q=..&count=..`, key in
/// `X-Subscription-Token`).
pub struct BraveSearch {
    name: String,
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl BraveSearch {
    pub fn new(
        name: impl Into<String>,
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            name: name.into(),
            http,
            endpoint: endpoint.into(),
            api_key: api_key.into(),
        })
    }
}

#[async_trait]
impl WebSearchProvider for BraveSearch {
    fn name(&self) -> &str {
        &self.name
    }

    async fn search(&self, query: &str, count: usize) -> Result<Vec<Source>> {
        let count = count.to_string();
        let response = self
            .http
            .get(&self.endpoint)
            .query(&[("q", query), ("count", count.as_str())])
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .send()
            .await
            .with_context(|| format!("{} request failed", self.name))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("{} returned {}: {}", self.name, status, body);
        }

        let body: BraveResponse = response
            .json()
            .await
            .with_context(|| format!("{} returned an unexpected body", self.name))?;
        Ok(body.into_sources())
    }
}

#[derive(Debug, Default, Deserialize)]
struct BraveResponse {
    #[serde(default)]
    web: Option<BraveWeb>,
}

#[derive(Debug, Default, Deserialize)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<BraveResult>,
}

#[derive(Debug, Deserialize)]
struct BraveResult {
    #[serde(default)]
    title: String,
    url: String,
    #[serde(default)]
    description: String,
}

impl BraveResponse {
    fn into_sources(self) -> Vec<Source> {
        self.web
            .map(|w| w.results)
            .unwrap_or_default()
            .into_iter()
            .map(|r| {
                // Snippets carry inline markup such as <strong>.
                let description = html2text::config::plain()
                    .string_from_read(r.description.as_bytes(), 10_000)
                    .map(|s| s.trim().to_string())
                    .unwrap_or(r.description);
                let text = if r.title.is_empty() {
                    description
                } else {
                    format!("{}\n{}", r.title, description)
                };
                Source::new(text, r.url)
            })
            .collect()
    }
}

/// Primary provider with a single fallback.
#[derive(Default, Clone)]
pub struct WebSearch {
    primary: Option<Arc<dyn WebSearchProvider>>,
    backup: Option<Arc<dyn WebSearchProvider>>,
}

impl WebSearch {
    pub fn new(
        primary: Option<Arc<dyn WebSearchProvider>>,
        backup: Option<Arc<dyn WebSearchProvider>>,
    ) -> Self {
        Self { primary, backup }
    }

    /// Build Brave providers from the API keys named in the config.
    /// A provider whose key variable is unset is left out.
    pub fn from_config(config: &WebSearchConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.timeout_secs);
        let provider = |name: &str, env: &str| -> Result<Option<Arc<dyn WebSearchProvider>>> {
            match std::env::var(env) {
                Ok(key) if !key.trim().is_empty() => Ok(Some(Arc::new(BraveSearch::new(
                    name,
                    config.endpoint.clone(),
                    key,
                    timeout,
                )?))),
                _ => Ok(None),
            }
        };
        Ok(Self {
            primary: provider("primary", &config.primary_key_env)?,
            backup: provider("backup", &config.backup_key_env)?,
        })
    }

    pub fn is_available(&self) -> bool {
        self.primary.is_some() || self.backup.is_some()
    }

    /// Search, falling back once. Never fails: total failure is an empty set.
    pub async fn search(&self, query: &str, count: usize) -> Vec<Source> {
        if count == 0 {
            return Vec::new();
        }
        for provider in [&self.primary, &self.backup].into_iter().flatten() {
            match provider.search(query, count).await {
                Ok(mut results) => {
                    results.truncate(count);
                    tracing::debug!(provider = provider.name(), results = results.len(), "web search");
                    return results;
                }
                Err(e) => {
                    tracing::warn!(provider = provider.name(), error = %e, "web search failed");
                }
            }
        }
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixed {
        name: &'static str,
        calls: AtomicUsize,
        fail: bool,
    }

    impl Fixed {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                calls: AtomicUsize::new(0),
                fail,
            })
        }
    }

    #[async_trait]
    impl WebSearchProvider for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn search(&self, query: &str, count: usize) -> Result<Vec<Source>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                bail!("quota exceeded");
            }
            Ok((0..count + 2)
                .map(|i| Source::new(format!("{} {}", query, i), format!("https://{}.test/{}", self.name, i)))
                .collect())
        }
    }

    #[tokio::test]
    async fn primary_success_skips_backup() {
        let primary = Fixed::new("primary", false);
        let backup = Fixed::new("backup", false);
        let web = WebSearch::new(Some(primary.clone()), Some(backup.clone()));

        let results = web.search("rust", 3).await;
        assert_eq!(results.len(), 3);
        assert!(results[0].url.starts_with("https://primary.test"));
        assert_eq!(backup.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn falls_back_once() {
        let primary = Fixed::new("primary", true);
        let backup = Fixed::new("backup", false);
        let web = WebSearch::new(Some(primary.clone()), Some(backup.clone()));

        let results = web.search("rust", 2).await;
        assert!(results[0].url.starts_with("https://backup.test"));
        assert_eq!(primary.calls.load(Ordering::SeqCst), 1);
        assert_eq!(backup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn total_failure_is_empty() {
        let web = WebSearch::new(Some(Fixed::new("a", true)), Some(Fixed::new("b", true)));
        assert!(web.search("rust", 4).await.is_empty());
        assert!(WebSearch::default().search("rust", 4).await.is_empty());
    }

    #[test]
    fn brave_results_become_sources() {
        let body: BraveResponse = serde_json::from_str(
            r#"{"web":{"results":[
                {"title":"The Rust Book","url":"https://doc.rust-lang.org/book/","description":"Learn <strong>Rust</strong>"},
                {"url":"https://example.com","description":"plain"}
            ]}}"#,
        )
        .unwrap();
        let sources = body.into_sources();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].url, "https://doc.rust-lang.org/book/");
        assert!(sources[0].text.starts_with("The Rust Book\n"));
        assert!(sources[0].text.contains("Rust"));
        assert!(!sources[0].text.contains("<strong>"));
        assert_eq!(sources[1].text, "plain");
    }
}
