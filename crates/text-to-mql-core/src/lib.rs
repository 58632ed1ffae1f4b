//! # Text-to-MQL Core
//!
//! Runtime-free logic for the Text-to-MQL workflow: data models, error
//! kinds, pipeline decoding and validation, schema inference, the database
//! abstraction with an in-memory backend, and the language-model trait.
//!
//! This crate contains no tokio, network, or driver dependencies. The
//! application crate supplies the MongoDB backend and HTTP model clients.

pub mod error;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod schema;
pub mod store;

pub use error::WorkflowError;
pub use llm::{Completion, LlmError, LlmProvider};
pub use pipeline::{Pipeline, Stage, Violation};
pub use store::memory::InMemoryDatabase;
pub use store::Database;
