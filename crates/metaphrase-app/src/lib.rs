//! metaphrase: batch subtitle translation through LLM providers.
//!
//! The pipeline reads subtitle containers, splits them into indexed records,
//! windows the records into context-carrying batches under a token budget,
//! dispatches batches to an LLM behind a rate-limit gate with bounded
//! classified retries, validates the structured responses, and streams the
//! reassembled artifact plus a JSONL parallel corpus to the writer, in
//! batch order regardless of completion order.

pub mod cli;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod registry;
pub mod services;

pub use error::AppError;
