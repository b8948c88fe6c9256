//! Text extraction collaborator.
//!
//! The indexer only needs `locator -> String`. [`FsExtractor`] is the
//! default: plain-text files are read as UTF-8 (lossy), PDFs go through
//! `pdf-extract`, and `http(s)` URLs are fetched and converted from HTML.
//! Applications with richer extraction inject their own [`TextExtractor`].

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

#[async_trait]
pub trait TextExtractor: Send + Sync {
    /// Return the plain text behind a file path or URL.
    async fn extract_text(&self, locator: &str) -> Result<String>;
}

pub fn is_url(locator: &str) -> bool {
    locator.starts_with("http://") || locator.starts_with("https://")
}

pub struct FsExtractor {
    client: reqwest::Client,
}

impl FsExtractor {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    async fn extract_url(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch {}", url))?;

        let status = response.status();
        if !status.is_success() {
            bail!("Fetching {} returned {}", url, status);
        }

        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("html"))
            .unwrap_or(false);
        let body = response.text().await?;

        if is_html {
            html2text::config::plain()
                .string_from_read(body.as_bytes(), 120)
                .map_err(|e| anyhow::anyhow!("HTML conversion failed for {}: {}", url, e))
        } else {
            Ok(body)
        }
    }
}

#[async_trait]
impl TextExtractor for FsExtractor {
    async fn extract_text(&self, locator: &str) -> Result<String> {
        if is_url(locator) {
            return self.extract_url(locator).await;
        }

        let path = Path::new(locator).to_path_buf();
        let is_pdf = path
            .extension()
            .map(|e| e.eq_ignore_ascii_case("pdf"))
            .unwrap_or(false);

        if is_pdf {
            let display = path.display().to_string();
            return tokio::task::spawn_blocking(move || pdf_extract::extract_text(&path))
                .await?
                .map_err(|e| anyhow::anyhow!("PDF extraction failed for {}: {}", display, e));
        }

        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}
