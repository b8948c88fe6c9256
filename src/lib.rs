//! # localmind
//!
//! Local LLM inference orchestration and retrieval-augmented generation.
//!
//! localmind runs a llama.cpp-style model server as a supervised
//! subprocess, streams completions from it over its OpenAI-compatible
//! HTTP API, and grounds answers in the user's own files, folders and web
//! pages through an in-memory similarity index.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │  Resources  │──▶│   Indexer    │──▶│  Similarity  │
//! │ file/dir/url│   │ chunk+embed  │   │    Index     │
//! └─────────────┘   └──────────────┘   └──────┬───────┘
//!                                             │
//!     user turn ─▶ ┌──────────────┐ ◀─────────┘   ◀── web search
//!                  │  Assembler   │
//!                  └──────┬───────┘
//!                         ▼
//!                  ┌──────────────┐   ┌──────────────┐   ┌──────────┐
//!                  │   Session    │──▶│    Client    │──▶│  Server  │◀── watchdog
//!                  │  tool loop   │◀──│  SSE stream  │   │ process  │
//!                  └──────────────┘   └──────────────┘   └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! localmind index ~/notes ~/papers/attention.pdf   # add and embed resources
//! localmind search "positional encoding"           # query the index
//! localmind chat "Summarise my notes on tokio"     # grounded answer
//! localmind chat --web                            # interactive session
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Inference error taxonomy |
//! | [`chunk`] | Paragraph-bounded text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`index`] | In-memory cosine-similarity index |
//! | [`extract`] | Text extraction from files and URLs |
//! | [`indexer`] | Resource indexing and chunk caches |
//! | [`progress`] | Indexing progress reporting |
//! | [`process`] | Model-server lifecycle |
//! | [`watchdog`] | Heartbeat liveness protocol |
//! | [`client`] | Streaming completion client |
//! | [`prompt`] | Context assembly and the sources ledger |
//! | [`web`] | Web search with fallback |
//! | [`tools`] | Tool schemas and tool-call resolution |
//! | [`session`] | Application context and chat sessions |
//! | [`store`] | Key-value persistence |

pub mod chunk;
pub mod client;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod index;
pub mod indexer;
pub mod models;
pub mod process;
pub mod progress;
pub mod prompt;
pub mod session;
pub mod store;
pub mod tools;
pub mod watchdog;
pub mod web;
