//! Resource indexing pipeline.
//!
//! Coordinates the flow for user-added resources: locate → extract →
//! chunk → embed → cache. Each resource keeps its chunks (with vectors)
//! in `<resources_dir>/<resource-id>/chunks.json`; a re-index reuses the
//! cached vector of any chunk whose text hash is unchanged.
//!
//! Failures are isolated per resource: one unreadable file never aborts
//! the pass. Files and folders that disappeared are dropped with a single
//! consolidated notice; URLs are never considered moved.
//!
//! The similarity index is rebuilt from the caches with
//! [`ResourceIndexer::build_index`] after a pass completes, so an
//! interrupted pass leaves the previously published index untouched.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::chunk::chunk_text;
use crate::config::IndexingConfig;
use crate::embedding::EmbeddingProvider;
use crate::extract::{is_url, TextExtractor};
use crate::index::SimilarityIndex;
use crate::models::{Chunk, IndexItem};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::store::{get_json, put_json, write_atomic, KeyValueStore};

const RESOURCES_KEY: &str = "resources";
const CACHE_FILE: &str = "chunks.json";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    File,
    Folder,
    Url,
}

/// A user-added file, folder, or URL.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Resource {
    pub id: String,
    pub locator: String,
    pub kind: ResourceKind,
    pub name: String,
    /// Set when the backing file or folder could not be found.
    #[serde(default)]
    pub moved: bool,
    pub added_at: DateTime<Utc>,
}

impl Resource {
    /// Create a resource, detecting its kind from the locator.
    pub fn new(locator: &str) -> Self {
        let (kind, locator) = if is_url(locator) {
            (ResourceKind::Url, locator.to_string())
        } else {
            let path = Path::new(locator);
            let absolute = std::fs::canonicalize(path)
                .unwrap_or_else(|_| path.to_path_buf())
                .to_string_lossy()
                .into_owned();
            let kind = if path.is_dir() {
                ResourceKind::Folder
            } else {
                ResourceKind::File
            };
            (kind, absolute)
        };

        let name = match kind {
            ResourceKind::Url => locator.clone(),
            _ => Path::new(&locator)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| locator.clone()),
        };

        Self {
            id: Uuid::new_v4().to_string(),
            locator,
            kind,
            name,
            moved: false,
            added_at: Utc::now(),
        }
    }

    pub fn is_web(&self) -> bool {
        self.kind == ResourceKind::Url
    }
}

/// Result of [`ResourceIndexer::update_index`] for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Indexed { chunks: usize, reused: usize },
    /// The backing file or folder is gone; the resource is marked moved.
    Moved,
}

/// A resource that failed every indexing attempt.
#[derive(Debug, Clone)]
pub struct ExtractionFailure {
    pub resource_id: String,
    pub name: String,
    pub error: String,
}

/// Outcome of a full index-update pass.
#[derive(Debug, Clone, Default)]
pub struct IndexReport {
    /// Resources that remain after the pass.
    pub resources: Vec<Resource>,
    /// Resources dropped because their file or folder disappeared.
    pub removed: Vec<Resource>,
    /// Single user-facing notice naming every removed resource.
    pub notice: Option<String>,
    pub failures: Vec<ExtractionFailure>,
    pub chunks_embedded: usize,
    pub chunks_reused: usize,
    /// The pass was interrupted; `resources` is the input list unchanged.
    pub cancelled: bool,
}

pub struct ResourceIndexer {
    cache_dir: PathBuf,
    max_tokens: usize,
    config: IndexingConfig,
    extractor: Arc<dyn TextExtractor>,
    provider: Arc<dyn EmbeddingProvider>,
}

impl ResourceIndexer {
    pub fn new(
        cache_dir: impl Into<PathBuf>,
        max_tokens: usize,
        config: IndexingConfig,
        extractor: Arc<dyn TextExtractor>,
        provider: Arc<dyn EmbeddingProvider>,
    ) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            max_tokens,
            config,
            extractor,
            provider,
        }
    }

    pub fn resource_dir(&self, resource: &Resource) -> PathBuf {
        self.cache_dir.join(&resource.id)
    }

    fn cache_path(&self, resource: &Resource) -> PathBuf {
        self.resource_dir(resource).join(CACHE_FILE)
    }

    /// Cached items for a resource; empty when it was never indexed.
    pub fn load_cached(&self, resource: &Resource) -> Result<Vec<IndexItem>> {
        let path = self.cache_path(resource);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .with_context(|| format!("Corrupt chunk cache {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
        }
    }

    /// Delete a resource's on-disk chunk cache.
    pub fn remove_resource(&self, resource: &Resource) -> Result<()> {
        let dir = self.resource_dir(resource);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to delete {}", dir.display())),
        }
    }

    /// Re-extract, re-chunk and re-embed one resource, then rewrite its cache.
    ///
    /// A file or folder that no longer exists marks the resource moved and
    /// returns [`UpdateOutcome::Moved`] instead of an error.
    pub async fn update_index(&self, resource: &mut Resource) -> Result<UpdateOutcome> {
        if !resource.is_web() && !Path::new(&resource.locator).exists() {
            tracing::info!(resource = %resource.name, "resource missing, marking moved");
            resource.moved = true;
            return Ok(UpdateOutcome::Moved);
        }
        resource.moved = false;

        let documents = match resource.kind {
            ResourceKind::Url | ResourceKind::File => vec![resource.locator.clone()],
            ResourceKind::Folder => self.scan_folder(Path::new(&resource.locator))?,
        };

        let mut chunks: Vec<Chunk> = Vec::new();
        let mut extracted_any = documents.is_empty();
        for doc in &documents {
            match self.extractor.extract_text(doc).await {
                Ok(text) => {
                    extracted_any = true;
                    chunks.extend(chunk_text(doc, &text, self.max_tokens));
                }
                Err(e) if resource.kind == ResourceKind::Folder => {
                    tracing::warn!(file = %doc, error = %e, "skipping unreadable file");
                }
                Err(e) => return Err(e),
            }
        }
        if !extracted_any {
            bail!("No readable files in {}", resource.locator);
        }

        let previous: HashMap<String, Vec<f32>> = self
            .load_cached(resource)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|item| item.metadata.get("hash").cloned().map(|h| (h, item.vector)))
            .collect();

        let pending: Vec<String> = chunks
            .iter()
            .filter(|c| !previous.contains_key(&c.hash))
            .map(|c| c.text.clone())
            .collect();

        let fresh = if pending.is_empty() {
            Vec::new()
        } else {
            self.provider.embed_texts(&pending).await?
        };
        if fresh.len() != pending.len() {
            bail!(
                "Embedding provider returned {} vectors for {} chunks",
                fresh.len(),
                pending.len()
            );
        }

        let reused = chunks.len() - pending.len();
        let mut fresh = fresh.into_iter();
        let mut items = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let vector = match previous.get(&chunk.hash) {
                Some(v) => v.clone(),
                None => fresh.next().unwrap_or_default(),
            };
            let mut metadata = BTreeMap::new();
            metadata.insert("hash".to_string(), chunk.hash.clone());
            metadata.insert("resource_id".to_string(), resource.id.clone());
            items.push(IndexItem {
                id: Uuid::new_v4().to_string(),
                text: chunk.text,
                source: chunk.source,
                vector,
                sequence: chunk.sequence,
                metadata,
            });
        }

        write_atomic(&self.cache_path(resource), &serde_json::to_vec(&items)?)?;

        tracing::debug!(
            resource = %resource.name,
            chunks = items.len(),
            reused,
            "resource indexed"
        );
        Ok(UpdateOutcome::Indexed {
            chunks: items.len(),
            reused,
        })
    }

    /// Update every resource, drop the ones that disappeared, and report.
    ///
    /// Progress is reported after each resource. Cancelling `cancel`
    /// stops the pass between resources; caches already rewritten stay
    /// valid and nothing is removed.
    pub async fn update_resources_index(
        &self,
        resources: Vec<Resource>,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> IndexReport {
        let total = resources.len() as u64;
        let mut report = IndexReport::default();
        let mut updated = Vec::with_capacity(resources.len());

        for (i, resource) in resources.iter().enumerate() {
            let mut working = resource.clone();
            let mut last_error = None;
            let mut finished = false;

            for attempt in 1..=self.config.max_attempts {
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => None,
                    r = self.update_index(&mut working) => Some(r),
                };
                let Some(result) = outcome else {
                    report.cancelled = true;
                    break;
                };
                match result {
                    Ok(UpdateOutcome::Indexed { chunks, reused }) => {
                        report.chunks_embedded += chunks - reused;
                        report.chunks_reused += reused;
                        finished = true;
                        break;
                    }
                    Ok(UpdateOutcome::Moved) => {
                        finished = true;
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(
                            resource = %working.name,
                            attempt,
                            error = %e,
                            "indexing attempt failed"
                        );
                        last_error = Some(e);
                    }
                }
            }

            if report.cancelled {
                tracing::info!("index update cancelled");
                report.resources = resources;
                report.removed.clear();
                return report;
            }

            if !finished {
                if let Some(e) = last_error {
                    report.failures.push(ExtractionFailure {
                        resource_id: working.id.clone(),
                        name: working.name.clone(),
                        error: format!("{:#}", e),
                    });
                }
            }

            progress.report(ProgressEvent {
                task: working.name.clone(),
                done: i as u64 + 1,
                total,
            });
            updated.push(working);
        }

        for resource in updated {
            if resource.moved && !resource.is_web() {
                if let Err(e) = self.remove_resource(&resource) {
                    tracing::warn!(resource = %resource.name, error = %e, "failed to delete chunk cache");
                }
                report.removed.push(resource);
            } else {
                report.resources.push(resource);
            }
        }

        if !report.removed.is_empty() {
            let names: Vec<&str> = report.removed.iter().map(|r| r.name.as_str()).collect();
            report.notice = Some(format!(
                "These resources were moved or deleted and have been removed: {}",
                names.join(", ")
            ));
        }

        report
    }

    /// Load every resource's cache into a fresh similarity index.
    pub fn build_index(&self, resources: &[Resource]) -> SimilarityIndex {
        let mut index = SimilarityIndex::new(Arc::clone(&self.provider));
        for resource in resources {
            match self.load_cached(resource) {
                Ok(items) => {
                    for item in items {
                        index.add_embedded(item);
                    }
                }
                Err(e) => {
                    tracing::warn!(resource = %resource.name, error = %e, "skipping unreadable cache");
                }
            }
        }
        index
    }

    /// Files under `root` matching the include globs, sorted for determinism.
    fn scan_folder(&self, root: &Path) -> Result<Vec<String>> {
        let include_set = build_globset(&self.config.include_globs)?;

        let mut excludes = vec![
            "**/.git/**".to_string(),
            "**/target/**".to_string(),
            "**/node_modules/**".to_string(),
        ];
        excludes.extend(self.config.exclude_globs.clone());
        let exclude_set = build_globset(&excludes)?;

        let mut files = Vec::new();
        for entry in WalkDir::new(root) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            let relative = path.strip_prefix(root).unwrap_or(path);
            let rel_str = relative.to_string_lossy();
            if exclude_set.is_match(rel_str.as_ref()) || !include_set.is_match(rel_str.as_ref()) {
                continue;
            }
            files.push(path.to_string_lossy().into_owned());
        }
        files.sort();
        Ok(files)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(builder.build()?)
}

/// Load the persisted resource list.
pub fn load_resources(store: &dyn KeyValueStore) -> Result<Vec<Resource>> {
    Ok(get_json(store, RESOURCES_KEY)?.unwrap_or_default())
}

/// Persist the resource list.
pub fn save_resources(store: &dyn KeyValueStore, resources: &[Resource]) -> Result<()> {
    put_json(store, RESOURCES_KEY, &resources)
}
