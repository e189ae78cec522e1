//! Orchestration layer: component contracts, the dispatcher, rate limiting
//! and the concrete component implementations.
//!
//! Pure transforms live in [`crate::pipeline`]; everything here either does
//! IO, owns shared state, or coordinates concurrency.

pub mod assembler;
pub mod context;
pub mod decoder;
pub mod dispatcher;
pub mod gate;
pub mod llm;
pub mod metrics;
pub mod progress;
pub mod prompt;
pub mod reader;
pub mod splitter;
pub mod writer;

pub use assembler::{LinearAssembler, LinearOptions};
pub use context::{
    Assembler, BatchLimit, Batcher, ByteStream, ChatMessage, ChatPrompt, Components, Decoder,
    FileStream, LlmClient, Prompt, PromptBuilder, Reader, Settings, Splitter, Writer,
    byte_stream_from, empty_byte_stream,
};
pub use decoder::{SrtJsonDecoder, SrtJsonOptions};
pub use gate::{Ask, LimitKey, Limits, RateGate, derive_limit_key};
pub use llm::{FlakyClient, MockClient, OpenAiClient};
pub use progress::{ProgressSink, SilentProgress, TerminalProgress};
pub use prompt::{TranslateOptions, TranslatePromptBuilder};
pub use reader::{FsReader, FsReaderOptions};
pub use splitter::{SrtOptions, SrtSplitter};
pub use writer::{FsWriter, FsWriterOptions, probe_output_dir};
