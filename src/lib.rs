//! # notesrag — Per-client Notes Assistant
//!
//! Local retrieval-augmented assistant for practitioners who keep notes per
//! client. Documents are uploaded per client, chunked, embedded into that
//! client's own index, and questions are answered by a language model with
//! streamed, cited responses.
//!
//! ## Architecture
//!
//! - **[`config`]** — Configuration loading and validation
//! - **[`registry`]** — Known clients, document inventories, index handles
//! - **[`index`]** — Per-client SQLite + sqlite-vec embedding index
//! - **[`indexer`]** — Text extraction, chunking, ingestion pipeline
//! - **[`embedder`]** — Embedding providers (feature hashing, Ollama)
//! - **[`retriever`]** — Top-K passage retrieval with attribution
//! - **[`llm`]** — Streaming language-model providers (Ollama)
//! - **[`answer`]** — Grounded prompts and the answer event stream
//! - **[`sessions`]** — Chat session persistence
//! - **[`db`]** — Process-wide catalog database
//! - **[`context`]** — Application context wiring it all together
//! - **[`server`]** — HTTP API with a server-sent-event query endpoint

pub mod answer;
pub mod config;
pub mod context;
pub mod db;
pub mod embedder;
pub mod error;
pub mod index;
pub mod indexer;
pub mod llm;
pub mod registry;
pub mod retriever;
pub mod server;
pub mod sessions;
