//! # Text-to-MQL
//!
//! Answers natural-language questions about a MongoDB database by generating,
//! validating and running an aggregation pipeline, then phrasing the rows as
//! prose.
//!
//! ## Architecture
//!
//! ```text
//! question ─▶ select collections ─▶ sample schemas ─▶ generate pipeline
//!                                                          │
//!   answer ◀─ format rows ◀─ execute (capped) ◀─ validate + repair
//! ```
//!
//! Every request runs the same sequential chain (see [`workflow`]), exposed
//! through the `mql` CLI and an axum HTTP API ([`server`]).
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration with environment overrides |
//! | [`db`] | Database selection (MongoDB or in-memory fixtures) |
//! | [`mongo`] | MongoDB backend |
//! | [`llm`] | OpenAI and Cohere chat backends |
//! | [`catalog`] | Collection listing and schema inference |
//! | [`selector`] | Collection selection with keyword fallback |
//! | [`generator`] | Pipeline generation |
//! | [`validator`] | Pipeline validation and repair |
//! | [`executor`] | Capped pipeline execution |
//! | [`formatter`] | Prose answers with a templated fallback |
//! | [`search`] | Keyword search across collections |
//! | [`prompts`] | Prompt templates |
//! | [`workflow`] | The request state machine |
//! | [`server`] | HTTP API |
//!
//! Runtime-free types (pipelines, schemas, errors, the in-memory database)
//! live in the `text-to-mql-core` crate.

pub mod catalog;
pub mod config;
pub mod db;
pub mod executor;
pub mod formatter;
pub mod generator;
pub mod llm;
pub mod mongo;
pub mod prompts;
pub mod search;
pub mod selector;
pub mod server;
pub mod validator;
pub mod workflow;
