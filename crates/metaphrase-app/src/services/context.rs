//! Component contracts for the orchestration layer.
//!
//! The dispatcher consumes every collaborator through the traits defined
//! here. Implementations are synchronous from the dispatcher's point of
//! view: none of them spawn background tasks, and the only concurrency in
//! the system lives in the dispatcher itself.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::Stream;
use tokio_util::sync::CancellationToken;

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::estimate::TokenEstimator;
use crate::pipeline::fragment::{
    ArtifactId, Batch, FileId, IndexMetaMap, Raw, Record, SpanResult, Target,
};
use crate::services::gate::{LimitKey, RateGate};

/// Boxed asynchronous byte stream: artifact content flowing between
/// assembler, dispatcher and writer.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, PipelineError>> + Send>>;

/// Stream of input files yielded by a [`Reader`] in stable order.
pub type FileStream =
    Pin<Box<dyn Stream<Item = PipelineResult<(FileId, ByteStream)>> + Send>>;

/// Wraps a fully-owned buffer into a single-chunk [`ByteStream`].
pub fn byte_stream_from(bytes: Bytes) -> ByteStream {
    if bytes.is_empty() {
        return empty_byte_stream();
    }
    Box::pin(futures::stream::once(async move { Ok(bytes) }))
}

pub fn empty_byte_stream() -> ByteStream {
    Box::pin(futures::stream::empty())
}

/// One message of a chat-style prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self { role: role.into(), content: content.into() }
    }
}

/// Chat prompt plus an optional JSON schema for providers with structured
/// output modes.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatPrompt {
    pub messages: Vec<ChatMessage>,
    pub response_schema: Option<serde_json::Value>,
}

/// Prompt payload: interpreted only by the paired LLM client.
#[derive(Debug, Clone, PartialEq)]
pub enum Prompt {
    Text(String),
    Chat(ChatPrompt),
}

impl Prompt {
    /// Total byte length of the prompt content, including the serialized
    /// response schema. This is what the gate sees, so it tracks the real
    /// outgoing request size rather than the batcher's window estimate.
    pub fn content_bytes(&self) -> usize {
        match self {
            Prompt::Text(text) => text.len(),
            Prompt::Chat(chat) => {
                let mut total: usize =
                    chat.messages.iter().map(|m| m.content.len()).sum();
                if let Some(schema) = &chat.response_schema {
                    total += schema.to_string().len();
                }
                total
            }
        }
    }
}

/// Yields `(file id, byte stream)` pairs for every input under the given
/// roots, in stable order. The stdin sentinel `-` yields a single pair with
/// file id `stdin` and must not be mixed with other roots.
#[async_trait]
pub trait Reader: Send + Sync {
    async fn iterate(&self, ctx: &CancellationToken, roots: &[String]) -> PipelineResult<FileStream>;
}

/// Splits one file's byte stream into ordered records with indices starting
/// at 0. Performs CRLF→LF normalization only; invalid UTF-8 is an error.
#[async_trait]
pub trait Splitter: Send + Sync {
    async fn split(
        &self,
        ctx: &CancellationToken,
        file_id: &FileId,
        data: ByteStream,
    ) -> PipelineResult<Vec<Record>>;
}

#[derive(Debug, Clone, Copy)]
pub struct BatchLimit {
    /// Per-batch token budget; must be positive.
    pub max_tokens: usize,
}

/// Splits one file's records into context batches under a token budget.
pub trait Batcher: Send + Sync {
    fn make(&self, records: Arc<[Record]>, limit: BatchLimit) -> PipelineResult<Vec<Batch>>;
}

/// Builds a deterministic prompt for one batch. Pure computation.
pub trait PromptBuilder: Send + Sync {
    fn build(&self, batch: &Batch) -> PipelineResult<Prompt>;

    /// Approximate token cost of the fixed prompt content (system prompt,
    /// glossary, output rules, schema): everything that does not vary per
    /// batch. The dispatcher subtracts this from the run budget before
    /// batching.
    fn estimate_overhead_tokens(&self, estimator: &TokenEstimator) -> usize;
}

/// One synchronous LLM round trip. Must observe cancellation promptly.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn invoke(
        &self,
        ctx: &CancellationToken,
        batch: &Batch,
        prompt: &Prompt,
    ) -> PipelineResult<Raw>;
}

/// Decodes a raw LLM payload into validated spans covering the target range.
///
/// `decode_with_meta` receives a read-only index→meta map for the batch
/// window (source text under [`crate::pipeline::fragment::SRC_TEXT_META_KEY`])
/// so decoders can reconstruct container fields and detect protocol
/// violations such as echoed source text. The default implementation ignores
/// the map; the dispatcher always calls the with-meta form.
pub trait Decoder: Send + Sync {
    fn decode(&self, target: &Target, raw: &Raw) -> PipelineResult<Vec<SpanResult>>;

    fn decode_with_meta(
        &self,
        target: &Target,
        raw: &Raw,
        _index_meta: &IndexMetaMap,
    ) -> PipelineResult<Vec<SpanResult>> {
        self.decode(target, raw)
    }
}

/// Linearizes one batch's spans into artifact bytes. Enforces span ordering
/// invariants and returns `SequenceInvalid` on violation.
pub trait Assembler: Send + Sync {
    fn assemble(&self, file_id: &FileId, spans: &[SpanResult]) -> PipelineResult<ByteStream>;
}

/// Persists one artifact from a byte stream. Single writer per artifact id,
/// streaming, no content inspection.
#[async_trait]
pub trait Writer: Send + Sync {
    async fn write(
        &self,
        ctx: &CancellationToken,
        id: &ArtifactId,
        data: ByteStream,
    ) -> PipelineResult<()>;
}

/// The full component set one pipeline run operates on.
#[derive(Clone)]
pub struct Components {
    pub reader: Arc<dyn Reader>,
    pub splitter: Arc<dyn Splitter>,
    pub batcher: Arc<dyn Batcher>,
    pub prompt_builder: Arc<dyn PromptBuilder>,
    pub llm: Arc<dyn LlmClient>,
    pub decoder: Arc<dyn Decoder>,
    pub assembler: Arc<dyn Assembler>,
    pub writer: Arc<dyn Writer>,
}

/// Immutable run settings resolved by configuration assembly.
#[derive(Clone)]
pub struct Settings {
    pub inputs: Vec<String>,
    pub concurrency: usize,
    pub max_tokens: usize,
    pub bytes_per_token: usize,
    /// Extra attempts after the first failed one; 0 disables retries.
    pub max_retries: usize,
    pub gate: Option<Arc<RateGate>>,
    pub gate_key: LimitKey,
}
