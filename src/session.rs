//! Application context and chat sessions.
//!
//! [`AppContext`] is the one owned object holding process-wide state:
//! configuration, the model server, the published index snapshot, the
//! resource list, the sources ledger and the tool registry. It is built
//! once at startup and shared by `Arc`; tests build a fresh one per case.
//!
//! [`ChatSession`] runs a conversation turn end to end:
//!
//! ```text
//! send() ─▶ ensure server ─▶ assemble context ─▶ stream completion ─┬─▶ reply
//!                                  ▲                                │
//!                                  └──── tool results / correction ◀┘
//! ```

use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::client::{CompleteResponse, CompletionClient};
use crate::config::Config;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::error::InferenceError;
use crate::extract::{FsExtractor, TextExtractor};
use crate::index::SimilarityIndex;
use crate::indexer::{load_resources, save_resources, IndexReport, Resource, ResourceIndexer};
use crate::models::{ChatRequest, Message, Role, Source};
use crate::process::InferenceServer;
use crate::progress::ProgressReporter;
use crate::prompt::{build_request, extract_citations, ContextAssembler, RequestParams, SourceLedger};
use crate::store::{JsonFileStore, KeyValueStore};
use crate::tools::{correction_prompt, resolve_calls, Resolution, Tool, ToolRegistry};
use crate::web::WebSearch;

pub struct AppContext {
    pub config: Config,
    pub server: Arc<InferenceServer>,
    pub client: CompletionClient,
    pub store: Arc<dyn KeyValueStore>,
    pub ledger: Arc<SourceLedger>,
    pub tools: ToolRegistry,
    assembler: ContextAssembler,
    indexer: ResourceIndexer,
    index: RwLock<Arc<SimilarityIndex>>,
    resources: tokio::sync::Mutex<Vec<Resource>>,
}

impl AppContext {
    /// Build the default context: JSON-file store under `data_dir`,
    /// configured embedding provider, file/URL extractor and Brave search.
    pub fn new(config: Config) -> Result<Self> {
        let store: Arc<dyn KeyValueStore> = Arc::new(JsonFileStore::new(config.storage.kv_dir())?);
        let embedder = create_provider(&config.embedding, &config.server.base_url())?;
        let extractor: Arc<dyn TextExtractor> = Arc::new(FsExtractor::new(Duration::from_secs(
            config.model.request_timeout_secs,
        ))?);
        let web = WebSearch::from_config(&config.web_search)?;
        Self::with_parts(config, store, embedder, extractor, web)
    }

    /// Build a context from explicit collaborators.
    pub fn with_parts(
        config: Config,
        store: Arc<dyn KeyValueStore>,
        embedder: Arc<dyn EmbeddingProvider>,
        extractor: Arc<dyn TextExtractor>,
        web: WebSearch,
    ) -> Result<Self> {
        let server = Arc::new(InferenceServer::new(config.server.clone())?);
        let client = CompletionClient::new(
            config.server.base_url(),
            config.model.name.clone(),
            Duration::from_secs(config.model.request_timeout_secs),
            Duration::from_secs(config.model.stream_idle_timeout_secs),
        )?;
        let ledger = Arc::new(SourceLedger::new(Arc::clone(&store)));
        let assembler = ContextAssembler::new(config.retrieval.clone(), web, Arc::clone(&ledger));
        let indexer = ResourceIndexer::new(
            config.storage.resources_dir(),
            config.chunking.max_tokens,
            config.indexing.clone(),
            extractor,
            embedder,
        );

        let resources = load_resources(store.as_ref())?;
        let index = indexer.build_index(&resources);
        tracing::debug!(resources = resources.len(), chunks = index.len(), "loaded index");

        Ok(Self {
            config,
            server,
            client,
            store,
            ledger,
            tools: ToolRegistry::new(),
            assembler,
            indexer,
            index: RwLock::new(Arc::new(index)),
            resources: tokio::sync::Mutex::new(resources),
        })
    }

    pub fn register_tool(&mut self, tool: Box<dyn Tool>) {
        self.tools.register(tool);
    }

    /// The currently published index. Stable for as long as it is held.
    pub fn index_snapshot(&self) -> Arc<SimilarityIndex> {
        match self.index.read() {
            Ok(guard) => Arc::clone(&guard),
            Err(poisoned) => Arc::clone(&poisoned.into_inner()),
        }
    }

    fn publish_index(&self, index: SimilarityIndex) {
        let index = Arc::new(index);
        match self.index.write() {
            Ok(mut guard) => *guard = index,
            Err(poisoned) => *poisoned.into_inner() = index,
        }
    }

    pub async fn resources(&self) -> Vec<Resource> {
        self.resources.lock().await.clone()
    }

    /// Add resources (skipping locators already present), then re-index.
    pub async fn add_resources(
        &self,
        locators: &[String],
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<IndexReport> {
        {
            let mut resources = self.resources.lock().await;
            for locator in locators {
                let resource = Resource::new(locator);
                if resources.iter().any(|r| r.locator == resource.locator) {
                    tracing::info!(locator = %resource.locator, "resource already added");
                    continue;
                }
                tracing::info!(name = %resource.name, kind = ?resource.kind, "adding resource");
                resources.push(resource);
            }
            save_resources(self.store.as_ref(), &resources)?;
        }
        self.reindex(progress, cancel).await
    }

    /// Re-index every resource and publish the rebuilt index.
    ///
    /// Passes are serialized. A cancelled pass publishes nothing.
    pub async fn reindex(
        &self,
        progress: &dyn ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<IndexReport> {
        let mut resources = self.resources.lock().await;
        let report = self
            .indexer
            .update_resources_index(resources.clone(), progress, cancel)
            .await;
        if report.cancelled {
            return Ok(report);
        }

        *resources = report.resources.clone();
        save_resources(self.store.as_ref(), &resources)?;
        self.publish_index(self.indexer.build_index(&resources));

        if let Some(notice) = &report.notice {
            tracing::warn!("{}", notice);
        }
        for failure in &report.failures {
            tracing::warn!(resource = %failure.name, error = %failure.error, "resource could not be indexed");
        }
        Ok(report)
    }

    /// Remove a resource by id and drop its chunks from the index.
    pub async fn remove_resource(&self, id: &str) -> Result<Option<Resource>> {
        let mut resources = self.resources.lock().await;
        let Some(pos) = resources.iter().position(|r| r.id == id) else {
            return Ok(None);
        };
        let removed = resources.remove(pos);
        self.indexer.remove_resource(&removed)?;
        save_resources(self.store.as_ref(), &resources)?;
        self.publish_index(self.indexer.build_index(&resources));
        tracing::info!(name = %removed.name, "resource removed");
        Ok(Some(removed))
    }

    /// Start the model server when a model file is configured. Without
    /// one, an externally managed server is assumed at `base_url`.
    pub async fn ensure_server(&self) -> Result<(), InferenceError> {
        match self.config.model.path.as_deref() {
            Some(path) => self.start_server(path).await,
            None => Ok(()),
        }
    }

    async fn start_server(&self, path: &Path) -> Result<(), InferenceError> {
        self.server
            .start(
                path,
                self.config.model.context_length,
                self.config.model.use_acceleration,
            )
            .await
    }
}

// ============ Streaming buffer ============

/// The in-flight reply. One writer appends; readers get a copy, so a
/// read never sees half of a fragment.
#[derive(Clone, Default)]
pub struct StreamBuffer {
    inner: Arc<Mutex<String>>,
}

impl StreamBuffer {
    pub fn append(&self, fragment: &str) {
        if let Ok(mut text) = self.inner.lock() {
            text.push_str(fragment);
        }
    }

    pub fn snapshot(&self) -> String {
        self.inner.lock().map(|t| t.clone()).unwrap_or_default()
    }

    pub fn clear(&self) {
        if let Ok(mut text) = self.inner.lock() {
            text.clear();
        }
    }
}

// ============ Chat session ============

/// Progress of a turn, for the UI layer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A streamed text fragment, in server order.
    Fragment(String),
    /// A retryable failure; the request is being re-sent once.
    Retrying(InferenceError),
    /// The model requested tool calls; `valid` of them were executed.
    ToolCalls { requested: usize, valid: usize },
    /// Malformed calls were sent back to the model for correction.
    Correction { malformed: usize, round: u32 },
}

#[derive(Debug, Clone, Default)]
pub struct ChatOptions {
    pub use_web: bool,
    pub attachments: Vec<Source>,
}

/// The result of one user turn.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    pub reply: Message,
    /// Every source offered to the model.
    pub sources: Vec<Source>,
    /// Urls the model cited in its trailing citation line.
    pub citations: Vec<String>,
}

pub struct ChatSession {
    ctx: Arc<AppContext>,
    history: Vec<Message>,
    buffer: StreamBuffer,
}

impl ChatSession {
    pub fn new(ctx: Arc<AppContext>) -> Self {
        Self {
            ctx,
            history: Vec::new(),
            buffer: StreamBuffer::default(),
        }
    }

    pub fn with_history(ctx: Arc<AppContext>, history: Vec<Message>) -> Self {
        Self {
            history,
            ..Self::new(ctx)
        }
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    /// Handle to the in-flight reply text.
    pub fn buffer(&self) -> StreamBuffer {
        self.buffer.clone()
    }

    /// Cancel the in-flight completion. The server keeps running.
    pub fn interrupt(&self) {
        self.ctx.server.interrupt();
    }

    /// Run one user turn, including any tool calls it triggers.
    ///
    /// On cancellation the partial reply is kept in the history and
    /// `Err(InferenceError::Cancelled)` is returned.
    pub async fn send(
        &mut self,
        text: &str,
        options: &ChatOptions,
        on_event: &mut (dyn FnMut(SessionEvent) + Send),
    ) -> Result<TurnOutcome, InferenceError> {
        let ctx = Arc::clone(&self.ctx);
        ctx.ensure_server().await?;

        let mut user = Message::new(Role::User, "");
        let index = ctx.index_snapshot();
        let assembled = ctx
            .assembler
            .assemble(&user.id, text, Some(&index), options.use_web, &options.attachments)
            .await;
        user.text = assembled.text;
        user.end();
        self.history.push(user);

        let params = RequestParams::from(&ctx.config.model);
        let schemas = ctx.tools.schemas();
        let tools = if schemas.is_empty() { None } else { Some(schemas) };

        let mut corrections = 0u32;
        let mut tool_rounds = 0u32;
        let reply = loop {
            let request = build_request(
                &ctx.config.model.system_prompt,
                &self.history,
                &params,
                tools.clone(),
            );
            let response = match self.complete(&request, on_event).await {
                Ok(response) => response,
                Err(InferenceError::Cancelled) => {
                    let partial = self.buffer.snapshot();
                    if !partial.is_empty() {
                        self.history.push(Message::ended(Role::Assistant, partial));
                    }
                    return Err(InferenceError::Cancelled);
                }
                Err(e) => return Err(e),
            };

            let mut reply = Message::new(Role::Assistant, response.text.clone());
            reply.tool_calls = response.tool_calls.clone();
            reply.metrics = response.metrics();
            reply.end();
            self.history.push(reply.clone());

            if response.tool_calls.is_empty() {
                break reply;
            }
            tool_rounds += 1;
            if tool_rounds > ctx.config.tools.max_tool_rounds {
                tracing::warn!(rounds = tool_rounds, "tool round limit reached");
                // Answer the pending calls so later turns stay well formed.
                let notice =
                    serde_json::json!({ "error": "tool round limit reached; call not executed" })
                        .to_string();
                for call in &response.tool_calls {
                    let mut answer = Message::ended(Role::Tool, notice.clone());
                    answer.tool_call_id = Some(call.id.clone());
                    self.history.push(answer);
                }
                break reply;
            }

            let requested = response.tool_calls.len();
            let mut valid = 0;
            let mut malformed = Vec::new();
            for resolution in resolve_calls(&response.tool_calls, &ctx.tools) {
                match resolution {
                    Resolution::Valid { call, args, .. } => {
                        valid += 1;
                        let result = ctx.tools.execute(&call, args).await;
                        self.history.push(result);
                    }
                    Resolution::Malformed(bad) => {
                        tracing::debug!(index = bad.index, reason = %bad.reason, "malformed tool call");
                        // Every call id gets an answer, even the broken ones.
                        let call_id = response.tool_calls[bad.index].id.clone();
                        let mut answer = Message::ended(Role::Tool, bad.feedback());
                        answer.tool_call_id = Some(call_id);
                        self.history.push(answer);
                        malformed.push(bad);
                    }
                }
            }
            on_event(SessionEvent::ToolCalls { requested, valid });

            if !malformed.is_empty() {
                if corrections < ctx.config.tools.max_correction_rounds {
                    corrections += 1;
                    self.history
                        .push(Message::ended(Role::User, correction_prompt(&malformed)));
                    on_event(SessionEvent::Correction {
                        malformed: malformed.len(),
                        round: corrections,
                    });
                } else {
                    tracing::warn!(
                        malformed = malformed.len(),
                        "correction rounds exhausted, continuing without retry"
                    );
                }
            }
        };

        let (_, citations) = extract_citations(&reply.text);
        Ok(TurnOutcome {
            reply,
            sources: assembled.sources,
            citations,
        })
    }

    /// One completion with a single automatic retry for network errors.
    async fn complete(
        &self,
        request: &ChatRequest,
        on_event: &mut (dyn FnMut(SessionEvent) + Send),
    ) -> Result<CompleteResponse, InferenceError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let guard = self.ctx.server.acquire_request().await;
            self.buffer.clear();

            let buffer = self.buffer.clone();
            let mut on_fragment = |fragment: &str| {
                buffer.append(fragment);
                on_event(SessionEvent::Fragment(fragment.to_string()));
            };
            let result = self
                .ctx
                .client
                .chat(request, &mut on_fragment, guard.token())
                .await;
            drop(guard);

            match result {
                Err(e) if e.is_retryable() && attempt == 1 => {
                    tracing::warn!(error = %e, "completion failed, retrying once");
                    on_event(SessionEvent::Retrying(e));
                }
                other => return other,
            }
        }
    }
}
