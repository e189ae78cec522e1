//! Pure pipeline transforms: the fragment data model, token estimation,
//! batching and response validation. No IO and no concurrency; the
//! orchestration layer in [`crate::services`] drives these.

pub mod batcher;
pub mod error;
pub mod estimate;
pub mod fragment;
pub mod validate;

pub use batcher::{SlidingBatcher, SlidingOptions};
pub use error::{ErrorCode, PipelineError, PipelineResult};
pub use estimate::{DEFAULT_BYTES_PER_TOKEN, TokenEstimator, effective_budget};
pub use fragment::{
    ArtifactId, Batch, DST_TEXT_META_KEY, FileId, Index, IndexMetaMap, Meta, Raw, Record,
    SRC_TEXT_META_KEY, SpanCandidate, SpanResult, Target, normalize_file_id,
};
pub use validate::{validate_per_record, validate_whole};
