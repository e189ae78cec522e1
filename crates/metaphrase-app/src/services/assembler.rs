//! Linear span assembler.
//!
//! Concatenates span outputs in `from` order without inserting separators;
//! any block structure must already be rendered into the outputs by the
//! decoder. Spans must belong to the given file, be strictly ascending and
//! non-overlapping; violations are sequence errors, not silent reordering.

use bytes::Bytes;
use serde::Deserialize;

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::fragment::{FileId, SpanResult};
use crate::services::context::{Assembler, ByteStream, empty_byte_stream};

/// Options for the `linear` assembler. Empty; present for the registry's
/// strict-options contract.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LinearOptions {}

#[derive(Default)]
pub struct LinearAssembler;

impl LinearAssembler {
    pub fn new(_options: LinearOptions) -> Self {
        Self
    }
}

impl Assembler for LinearAssembler {
    fn assemble(&self, file_id: &FileId, spans: &[SpanResult]) -> PipelineResult<ByteStream> {
        if spans.is_empty() {
            return Ok(empty_byte_stream());
        }
        let mut prev_to = None;
        for span in spans {
            if span.file_id != *file_id {
                return Err(PipelineError::SequenceInvalid(format!(
                    "span for {} mixed into {}",
                    span.file_id, file_id
                )));
            }
            if span.from > span.to {
                return Err(PipelineError::SequenceInvalid(format!(
                    "span range inverted: {}..{}",
                    span.from, span.to
                )));
            }
            if let Some(prev) = prev_to {
                if span.from <= prev {
                    return Err(PipelineError::SequenceInvalid(format!(
                        "span {}..{} overlaps or precedes previous end {prev}",
                        span.from, span.to
                    )));
                }
            }
            prev_to = Some(span.to);
        }

        let chunks: Vec<Result<Bytes, PipelineError>> = spans
            .iter()
            .filter(|s| !s.output.is_empty())
            .map(|s| Ok(Bytes::from(s.output.clone())))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}
