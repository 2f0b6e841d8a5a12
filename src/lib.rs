//! Chat core for several LLM vendors: one request shape in, one stream of
//! text deltas out, and conversation history kept in between.

pub mod commands;
pub mod config;
pub mod conversation;
pub mod db;
pub mod doc_processor;
pub mod llm;
pub mod stream;
pub mod transport;

pub use commands::chat::{ChatService, Submission, TurnOutcome};
pub use config::Settings;
