//! LLM transport clients.
//!
//! `openai` talks to any OpenAI-compatible chat-completions endpoint; `mock`
//! and `flaky` are offline clients for local runs and failure-path tests.

pub mod flaky;
pub mod mock;
pub mod openai;

pub use flaky::FlakyClient;
pub use mock::MockClient;
pub use openai::OpenAiClient;
