//! Sliding-window batcher.
//!
//! Packs contiguous records into batches of `[left ctx][target][right ctx]`
//! under a token budget, using prefix sums for O(1) range costs. Target
//! ranges of the emitted batches partition the input with no overlap and no
//! gap; context records repeat across neighboring batches but never produce
//! output.

use std::sync::Arc;

use serde::Deserialize;

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::estimate::TokenEstimator;
use crate::pipeline::fragment::{Batch, Record};
use crate::services::context::{BatchLimit, Batcher};

/// Options for the `sliding` batcher.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SlidingOptions {
    /// Context records appended on each side of the target range.
    pub context_radius: usize,
    /// Token estimation divisor; 0 falls back to the default of 4.
    pub bytes_per_token: usize,
    /// Estimated packaging overhead per record (tag wrapping, separators).
    pub extra_bytes_per_record: usize,
}

pub struct SlidingBatcher {
    radius: usize,
    estimator: TokenEstimator,
}

impl SlidingBatcher {
    pub fn new(options: SlidingOptions) -> Self {
        Self {
            radius: options.context_radius,
            estimator: TokenEstimator::with_extra(
                options.bytes_per_token,
                options.extra_bytes_per_record,
            ),
        }
    }
}

impl Batcher for SlidingBatcher {
    fn make(&self, records: Arc<[Record]>, limit: BatchLimit) -> PipelineResult<Vec<Batch>> {
        if limit.max_tokens == 0 {
            return Err(PipelineError::invalid("batch token budget must be > 0"));
        }
        let n = records.len();
        if n == 0 {
            return Err(PipelineError::invalid("no records to batch"));
        }
        let file_id = records[0].file_id.clone();
        if records[0].index != 0 {
            return Err(PipelineError::invalid(format!(
                "first record index must be 0, got {}",
                records[0].index
            )));
        }
        for pair in records.windows(2) {
            if pair[1].file_id != file_id {
                return Err(PipelineError::invalid("records cross file boundaries"));
            }
            if pair[1].index != pair[0].index + 1 {
                return Err(PipelineError::invalid(format!(
                    "record indices must be contiguous: {} follows {}",
                    pair[1].index, pair[0].index
                )));
            }
        }

        let mut prefix = vec![0usize; n + 1];
        for (i, record) in records.iter().enumerate() {
            prefix[i + 1] = prefix[i] + self.estimator.estimate(&record.text);
        }
        let cost = |from: usize, to_inclusive: isize| -> usize {
            if (from as isize) > to_inclusive {
                return 0;
            }
            let hi = (to_inclusive as usize).min(n - 1);
            prefix[hi + 1] - prefix[from]
        };

        let budget = limit.max_tokens;
        let mut batches = Vec::new();
        let mut l = 0usize;
        while l < n {
            let left_lo = l.saturating_sub(self.radius);
            // Extend the target right edge greedily; `best_r` tracks the last
            // extension that fit with at least one target record.
            let mut best_r = l;
            let mut r = l;
            while r <= n {
                let right_hi = r as isize + self.radius as isize - 1;
                let need = cost(left_lo, l as isize - 1)
                    + cost(l, r as isize - 1)
                    + cost(r, right_hi);
                if need <= budget {
                    if r > l {
                        best_r = r;
                    }
                    r += 1;
                } else {
                    break;
                }
            }
            if best_r == l {
                return Err(PipelineError::budget(format!(
                    "record {} does not fit the batch budget of {budget} tokens with context radius {}",
                    records[l].index, self.radius
                )));
            }
            let window_hi = (best_r - 1 + self.radius).min(n - 1);
            batches.push(Batch::new(
                file_id.clone(),
                batches.len() as i64,
                Arc::clone(&records),
                left_lo..window_hi + 1,
                records[l].index,
                records[best_r - 1].index,
            ));
            l = best_r;
        }
        Ok(batches)
    }
}
