//! Prompt and context assembly.
//!
//! Turns a user query into the text actually submitted to the model:
//!
//! 1. **Local retrieval**: `search_results_multiplier × (use_context ? 1 : 2)`
//!    candidates from the similarity index. With context expansion each hit
//!    is merged with the chunk before and after it in the same source.
//! 2. **Web retrieval** (optional): `web_results` results, halved when local
//!    hits exist. Provider failures degrade to no web results.
//! 3. **Instruction block**: every source as a JSON array of `{text, url}`,
//!    plus rules for preferring local files and for citing.
//!
//! The block is appended to the query after [`SOURCES_MARKER`];
//! [`strip_sources`] removes it again for display. Every assembly is
//! recorded in the [`SourceLedger`] under the originating message id.

use anyhow::Result;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::config::{ModelConfig, RetrievalConfig};
use crate::index::SimilarityIndex;
use crate::models::{ChatMessage, ChatRequest, Message, Role, Source, StreamOptions};
use crate::store::{get_json, put_json, KeyValueStore};
use crate::web::WebSearch;

/// Separates the user's text from the appended sources block.
pub const SOURCES_MARKER: &str = "\n\n<sources>";

const CITATION_PREFIX: &str = "Sources:";

/// Displayed form of a submitted message.
pub fn strip_sources(text: &str) -> &str {
    match text.find(SOURCES_MARKER) {
        Some(pos) => &text[..pos],
        None => text,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AssembledPrompt {
    /// Query plus sources block; the submitted form of the user turn.
    pub text: String,
    /// Number of sources offered, for UI badges.
    pub source_count: usize,
    pub sources: Vec<Source>,
}

pub struct ContextAssembler {
    config: RetrievalConfig,
    web: WebSearch,
    ledger: Arc<SourceLedger>,
}

impl ContextAssembler {
    pub fn new(config: RetrievalConfig, web: WebSearch, ledger: Arc<SourceLedger>) -> Self {
        Self {
            config,
            web,
            ledger,
        }
    }

    /// Candidates requested from the similarity index.
    pub fn retrieval_budget(&self) -> usize {
        self.config.search_results_multiplier * if self.config.use_context { 1 } else { 2 }
    }

    /// Web results requested, halved when local hits already exist.
    pub fn web_budget(&self, has_local_hits: bool) -> usize {
        if has_local_hits {
            self.config.web_results / 2
        } else {
            self.config.web_results
        }
    }

    pub async fn assemble(
        &self,
        message_id: &str,
        query: &str,
        index: Option<&SimilarityIndex>,
        use_web: bool,
        attachments: &[Source],
    ) -> AssembledPrompt {
        let mut sources: Vec<Source> = attachments.to_vec();

        let local = match index {
            Some(index) => self.local_sources(index, query).await,
            None => Vec::new(),
        };
        let has_local = !local.is_empty();
        sources.extend(local);

        if use_web {
            let count = self.web_budget(has_local);
            sources.extend(self.web.search(query, count).await);
        }

        if let Err(e) = self.ledger.record(message_id, &sources) {
            tracing::warn!(message_id, error = %e, "failed to persist offered sources");
        }

        tracing::debug!(
            message_id,
            attachments = attachments.len(),
            total = sources.len(),
            "assembled context"
        );

        let text = if sources.is_empty() {
            query.to_string()
        } else {
            format!(
                "{}{}\n{}\n</sources>",
                query,
                SOURCES_MARKER,
                instruction_block(&sources)
            )
        };

        AssembledPrompt {
            text,
            source_count: sources.len(),
            sources,
        }
    }

    async fn local_sources(&self, index: &SimilarityIndex, query: &str) -> Vec<Source> {
        let hits = match index.search(query, self.retrieval_budget()).await {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(error = %e, "local retrieval failed, continuing without it");
                return Vec::new();
            }
        };

        if !self.config.use_context {
            return hits
                .into_iter()
                .map(|h| Source::new(h.item.text, h.item.source))
                .collect();
        }

        // A hit already merged into an earlier entry is not repeated.
        let mut covered: HashSet<(String, usize)> = HashSet::new();
        let mut sources = Vec::new();
        for hit in hits {
            let item = &hit.item;
            if covered.contains(&(item.source.clone(), item.sequence)) {
                continue;
            }

            let mut parts = Vec::with_capacity(3);
            let before = item
                .sequence
                .checked_sub(1)
                .and_then(|seq| index.neighbor(&item.source, seq));
            let after = index.neighbor(&item.source, item.sequence + 1);

            for chunk in [before, Some(item), after].into_iter().flatten() {
                covered.insert((chunk.source.clone(), chunk.sequence));
                parts.push(chunk.text.as_str());
            }
            sources.push(Source::new(parts.join("\n"), item.source.clone()));
        }
        sources
    }
}

fn instruction_block(sources: &[Source]) -> String {
    let json = serde_json::to_string_pretty(sources).unwrap_or_else(|_| "[]".to_string());
    format!(
        "Answer using the sources below. They are a JSON array of objects with \"text\" and \"url\" fields.\n\
         When sources disagree, trust local files over websites.\n\
         If you used any of them, end your answer with one line in exactly this format:\n\
         {prefix} [\"<url>\", \"<url>\"]\n\
         Only cite urls from this list and never cite anything else. \
         If you did not use any source, leave the {prefix} line out entirely.\n\
         {json}",
        prefix = CITATION_PREFIX,
        json = json
    )
}

/// Split an answer into its body and the urls of its trailing citation
/// line. Answers without one are returned unchanged with no citations.
pub fn extract_citations(text: &str) -> (String, Vec<String>) {
    let trimmed = text.trim_end();
    let (body, last) = match trimmed.rfind('\n') {
        Some(pos) => (&trimmed[..pos], trimmed[pos + 1..].trim()),
        None => ("", trimmed.trim()),
    };

    let Some(list) = last.strip_prefix(CITATION_PREFIX) else {
        return (trimmed.to_string(), Vec::new());
    };
    let list = list.trim();

    let urls = match serde_json::from_str::<Vec<String>>(list) {
        Ok(urls) => urls,
        Err(_) => list
            .trim_start_matches('[')
            .trim_end_matches(']')
            .split(',')
            .map(|u| u.trim().trim_matches('"').trim().to_string())
            .filter(|u| !u.is_empty())
            .collect(),
    };
    (body.trim_end().to_string(), urls)
}

// ============ Sources ledger ============

/// `message id → every source offered` for that message, cited or not.
pub struct SourceLedger {
    store: Arc<dyn KeyValueStore>,
    cache: Mutex<HashMap<String, Vec<Source>>>,
}

impl SourceLedger {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn key(message_id: &str) -> String {
        format!("sources-{}", message_id)
    }

    pub fn record(&self, message_id: &str, sources: &[Source]) -> Result<()> {
        self.cache
            .lock()
            .map_err(|_| anyhow::anyhow!("ledger lock poisoned"))?
            .insert(message_id.to_string(), sources.to_vec());
        put_json(self.store.as_ref(), &Self::key(message_id), &sources)
    }

    /// Offered sources for a message; empty when none were recorded.
    pub fn sources_for(&self, message_id: &str) -> Result<Vec<Source>> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow::anyhow!("ledger lock poisoned"))?;
        if let Some(sources) = cache.get(message_id) {
            return Ok(sources.clone());
        }
        let sources: Vec<Source> =
            get_json(self.store.as_ref(), &Self::key(message_id))?.unwrap_or_default();
        cache.insert(message_id.to_string(), sources.clone());
        Ok(sources)
    }

    pub fn forget(&self, message_id: &str) -> Result<()> {
        self.cache
            .lock()
            .map_err(|_| anyhow::anyhow!("ledger lock poisoned"))?
            .remove(message_id);
        self.store.delete(&Self::key(message_id))
    }
}

// ============ Request payload ============

#[derive(Debug, Clone)]
pub struct RequestParams {
    pub model: String,
    pub temperature: f32,
    pub context_length: Option<u32>,
}

impl From<&ModelConfig> for RequestParams {
    fn from(config: &ModelConfig) -> Self {
        Self {
            model: config.name.clone(),
            temperature: config.temperature,
            context_length: Some(config.context_length),
        }
    }
}

/// System prompt first, then the history in order (submitted forms).
pub fn build_request(
    system_prompt: &str,
    history: &[Message],
    params: &RequestParams,
    tools: Option<Vec<Value>>,
) -> ChatRequest {
    let mut messages = Vec::with_capacity(history.len() + 1);
    if !system_prompt.trim().is_empty() {
        messages.push(ChatMessage::new(Role::System, system_prompt));
    }
    messages.extend(history.iter().map(Message::to_chat_message));

    ChatRequest {
        model: params.model.clone(),
        messages,
        temperature: params.temperature,
        stream: true,
        stream_options: StreamOptions {
            include_usage: true,
        },
        n_ctx: params.context_length,
        tools: tools.filter(|t| !t.is_empty()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingProvider;
    use crate::models::IndexItem;
    use crate::store::MemoryStore;
    use crate::web::WebSearchProvider;
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Every text embeds to the same direction; ranking falls back to
    /// insertion order.
    struct FlatEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FlatEmbedder {
        fn model_name(&self) -> &str {
            "flat"
        }

        async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![1.0, 1.0]).collect())
        }
    }

    struct CountingWeb {
        requested: AtomicUsize,
    }

    #[async_trait]
    impl WebSearchProvider for CountingWeb {
        fn name(&self) -> &str {
            "counting"
        }

        async fn search(&self, _query: &str, count: usize) -> Result<Vec<Source>> {
            self.requested.store(count, Ordering::SeqCst);
            Ok((0..count)
                .map(|i| Source::new(format!("web {}", i), format!("https://web.test/{}", i)))
                .collect())
        }
    }

    fn index_with(items: &[(&str, usize)]) -> SimilarityIndex {
        let mut index = SimilarityIndex::new(Arc::new(FlatEmbedder));
        for (source, sequence) in items {
            index.add_embedded(IndexItem {
                id: format!("{}#{}", source, sequence),
                text: format!("{} part {}", source, sequence),
                source: source.to_string(),
                vector: vec![1.0, 1.0],
                sequence: *sequence,
                metadata: BTreeMap::new(),
            });
        }
        index
    }

    fn assembler(use_context: bool, web: WebSearch) -> (ContextAssembler, Arc<SourceLedger>) {
        let ledger = Arc::new(SourceLedger::new(Arc::new(MemoryStore::new())));
        let config = RetrievalConfig {
            search_results_multiplier: 2,
            use_context,
            web_results: 6,
        };
        (ContextAssembler::new(config, web, Arc::clone(&ledger)), ledger)
    }

    #[test]
    fn strip_sources_recovers_displayed_text() {
        let submitted = format!("What is Rust?{}\n[...]\n</sources>", SOURCES_MARKER);
        assert_eq!(strip_sources(&submitted), "What is Rust?");
        assert_eq!(strip_sources("No sources here"), "No sources here");
    }

    #[tokio::test]
    async fn budget_doubles_without_context_expansion() {
        let items: Vec<(&str, usize)> = ["a", "b", "c", "d", "e", "f"].iter().map(|s| (*s, 0)).collect();
        let index = index_with(&items);

        let (with_ctx, _) = assembler(true, WebSearch::default());
        let (without_ctx, _) = assembler(false, WebSearch::default());
        assert_eq!(with_ctx.retrieval_budget(), 2);
        assert_eq!(without_ctx.retrieval_budget(), 4);

        let a = with_ctx.assemble("m1", "q", Some(&index), false, &[]).await;
        let b = without_ctx.assemble("m2", "q", Some(&index), false, &[]).await;
        assert_eq!(a.source_count, 2);
        assert_eq!(b.source_count, 4);
    }

    #[tokio::test]
    async fn hits_are_expanded_with_neighbours() {
        // Insertion order makes doc.md#1 the top hit.
        let index = index_with(&[("doc.md", 1), ("doc.md", 0), ("doc.md", 2), ("other.md", 0)]);
        let (assembler, _) = assembler(true, WebSearch::default());

        let prompt = assembler.assemble("m1", "q", Some(&index), false, &[]).await;
        assert_eq!(prompt.sources[0].url, "doc.md");
        assert_eq!(
            prompt.sources[0].text,
            "doc.md part 0\ndoc.md part 1\ndoc.md part 2"
        );
        // The second hit, doc.md#0, was already merged into the first entry.
        assert_eq!(prompt.sources.len(), 1);
    }

    #[tokio::test]
    async fn web_budget_halves_with_local_hits() {
        let counting = Arc::new(CountingWeb {
            requested: AtomicUsize::new(0),
        });
        let web = WebSearch::new(Some(counting.clone()), None);
        let (assembler, _) = assembler(true, web);

        assembler.assemble("m1", "q", None, true, &[]).await;
        assert_eq!(counting.requested.load(Ordering::SeqCst), 6);

        let index = index_with(&[("doc.md", 0)]);
        let prompt = assembler.assemble("m2", "q", Some(&index), true, &[]).await;
        assert_eq!(counting.requested.load(Ordering::SeqCst), 3);
        assert_eq!(prompt.source_count, 4);
    }

    #[tokio::test]
    async fn block_lists_sources_and_rules() {
        let (assembler, ledger) = assembler(true, WebSearch::default());
        let attachments = vec![
            Source::new("Local fact", "/home/me/notes.md"),
            Source::new("Web fact", "https://example.com"),
        ];

        let prompt = assembler
            .assemble("msg-7", "What changed?", None, false, &attachments)
            .await;
        assert!(prompt.text.starts_with("What changed?"));
        assert!(prompt.text.contains("trust local files over websites"));
        assert!(prompt.text.contains("Sources: [\"<url>\""));
        assert!(prompt.text.contains("never cite anything else"));

        let block = prompt.text.split(SOURCES_MARKER).nth(1).unwrap();
        let json_start = block.find("[\n").unwrap();
        let json_end = block.rfind(']').unwrap();
        let listed: Vec<Source> = serde_json::from_str(&block[json_start..=json_end]).unwrap();
        assert_eq!(listed, attachments);

        assert_eq!(ledger.sources_for("msg-7").unwrap(), attachments);
    }

    #[tokio::test]
    async fn no_sources_leaves_query_untouched() {
        let (assembler, ledger) = assembler(true, WebSearch::default());
        let empty = index_with(&[]);
        let prompt = assembler.assemble("m", "Hello", Some(&empty), true, &[]).await;
        assert_eq!(prompt.text, "Hello");
        assert_eq!(prompt.source_count, 0);
        assert!(ledger.sources_for("m").unwrap().is_empty());
    }

    #[test]
    fn ledger_survives_restart() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let sources = vec![Source::new("t", "u")];
        SourceLedger::new(Arc::clone(&store))
            .record("abc", &sources)
            .unwrap();

        let reopened = SourceLedger::new(Arc::clone(&store));
        assert_eq!(reopened.sources_for("abc").unwrap(), sources);
        reopened.forget("abc").unwrap();
        assert!(reopened.sources_for("abc").unwrap().is_empty());
    }

    #[test]
    fn citations_are_split_from_body() {
        let (body, urls) = extract_citations(
            "Rust is memory safe.\nSources: [\"/notes/rust.md\", \"https://rust-lang.org\"]\n",
        );
        assert_eq!(body, "Rust is memory safe.");
        assert_eq!(urls, vec!["/notes/rust.md", "https://rust-lang.org"]);

        let (body, urls) = extract_citations("Line one.\nSources: [a.md, b.md]");
        assert_eq!(body, "Line one.");
        assert_eq!(urls, vec!["a.md", "b.md"]);

        let (body, urls) = extract_citations("No citations here.");
        assert_eq!(body, "No citations here.");
        assert!(urls.is_empty());
    }

    #[test]
    fn request_puts_system_prompt_first() {
        let history = vec![
            Message::ended(Role::User, "hi"),
            Message::ended(Role::Assistant, "hello"),
            Message::new(Role::User, "and now?"),
        ];
        let params = RequestParams {
            model: "local".into(),
            temperature: 0.2,
            context_length: Some(4096),
        };
        let request = build_request("Be brief.", &history, &params, Some(vec![]));

        let roles: Vec<Role> = request.messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant, Role::User]);
        assert_eq!(request.messages[0].content, "Be brief.");
        assert!(request.stream);
        assert!(request.stream_options.include_usage);
        assert!(request.tools.is_none());
    }
}
