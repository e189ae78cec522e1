//! Coverage validators for decoded LLM responses.
//!
//! Decoders parse whatever shape their paired prompt requested, then hand the
//! candidates here; these functions own the coverage invariants so no decoder
//! implementation can deviate from them. Output and meta strings are copied
//! into fresh allocations so the returned spans do not borrow decoder
//! buffers.

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::fragment::{Meta, SpanCandidate, SpanResult, Target};

/// Requires exactly one single-record candidate per target index, in
/// ascending order: candidates must be `[from, from], [from+1, from+1], ...`
/// up to and including `[to, to]`.
pub fn validate_per_record(
    target: &Target,
    candidates: &[SpanCandidate],
) -> PipelineResult<Vec<SpanResult>> {
    if target.from > target.to {
        return Err(PipelineError::invalid(format!(
            "target range inverted: {}..{}",
            target.from, target.to
        )));
    }
    let need = (target.to - target.from + 1) as usize;
    if candidates.len() != need {
        return Err(PipelineError::protocol(format!(
            "expected {need} spans covering {}..{}, got {}",
            target.from,
            target.to,
            candidates.len()
        )));
    }
    let mut spans = Vec::with_capacity(candidates.len());
    let mut expect = target.from;
    for candidate in candidates {
        if candidate.from != candidate.to {
            return Err(PipelineError::protocol(format!(
                "per-record span must cover a single index, got {}..{}",
                candidate.from, candidate.to
            )));
        }
        if candidate.from != expect {
            return Err(PipelineError::protocol(format!(
                "span out of order: expected index {expect}, got {}",
                candidate.from
            )));
        }
        spans.push(bind(target, candidate));
        expect += 1;
    }
    Ok(spans)
}

/// Requires a single candidate covering exactly the whole target range.
pub fn validate_whole(
    target: &Target,
    candidates: &[SpanCandidate],
) -> PipelineResult<Vec<SpanResult>> {
    if target.from > target.to {
        return Err(PipelineError::invalid(format!(
            "target range inverted: {}..{}",
            target.from, target.to
        )));
    }
    let [candidate] = candidates else {
        return Err(PipelineError::protocol(format!(
            "expected a single whole-range span, got {}",
            candidates.len()
        )));
    };
    if candidate.from != target.from || candidate.to != target.to {
        return Err(PipelineError::protocol(format!(
            "whole span {}..{} does not match target {}..{}",
            candidate.from, candidate.to, target.from, target.to
        )));
    }
    Ok(vec![bind(target, candidate)])
}

fn bind(target: &Target, candidate: &SpanCandidate) -> SpanResult {
    SpanResult {
        file_id: target.file_id.clone(),
        from: candidate.from,
        to: candidate.to,
        output: candidate.output.clone(),
        meta: candidate.meta.as_ref().map(clone_meta),
    }
}

fn clone_meta(meta: &Meta) -> Meta {
    meta.iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::ErrorCode;
    use crate::pipeline::fragment::FileId;

    fn target(from: i64, to: i64) -> Target {
        Target { file_id: FileId::from("a.srt"), from, to }
    }

    fn cand(from: i64, to: i64, out: &str) -> SpanCandidate {
        SpanCandidate { from, to, output: out.to_string(), meta: None }
    }

    #[test]
    fn per_record_accepts_exact_cover() {
        let spans = validate_per_record(
            &target(3, 5),
            &[cand(3, 3, "a"), cand(4, 4, "b"), cand(5, 5, "c")],
        )
        .expect("exact cover must validate");
        assert_eq!(spans.len(), 3);
        assert_eq!(spans[0].file_id, FileId::from("a.srt"));
        assert_eq!(spans[2].from, 5);
        assert_eq!(spans[1].output, "b");
    }

    #[test]
    fn per_record_rejects_gaps_and_misalignment() {
        let t = target(0, 2);
        let short = validate_per_record(&t, &[cand(0, 0, "a"), cand(1, 1, "b")]);
        assert_eq!(short.unwrap_err().code(), ErrorCode::Protocol);

        let skewed = validate_per_record(&t, &[cand(0, 0, "a"), cand(2, 2, "b"), cand(1, 1, "c")]);
        assert_eq!(skewed.unwrap_err().code(), ErrorCode::Protocol);

        let wide = validate_per_record(&t, &[cand(0, 1, "a"), cand(2, 2, "b"), cand(2, 2, "c")]);
        assert_eq!(wide.unwrap_err().code(), ErrorCode::Protocol);
    }

    #[test]
    fn per_record_rejects_inverted_target_as_invalid_input() {
        let err = validate_per_record(&target(5, 3), &[]).unwrap_err();
        assert_eq!(err.code(), ErrorCode::Invariant);
    }

    #[test]
    fn whole_accepts_only_exact_range() {
        let spans = validate_whole(&target(2, 7), &[cand(2, 7, "all")])
            .expect("exact whole span must validate");
        assert_eq!(spans.len(), 1);
        assert_eq!((spans[0].from, spans[0].to), (2, 7));

        assert_eq!(
            validate_whole(&target(2, 7), &[cand(2, 6, "short")]).unwrap_err().code(),
            ErrorCode::Protocol
        );
        assert_eq!(
            validate_whole(&target(2, 7), &[cand(2, 7, "a"), cand(2, 7, "b")])
                .unwrap_err()
                .code(),
            ErrorCode::Protocol
        );
        assert_eq!(validate_whole(&target(7, 2), &[]).unwrap_err().code(), ErrorCode::Invariant);
    }

    #[test]
    fn validation_is_deterministic() {
        let t = target(0, 1);
        let cands = [cand(0, 0, "x"), cand(1, 1, "y")];
        let a = validate_per_record(&t, &cands).expect("validates");
        let b = validate_per_record(&t, &cands).expect("validates");
        assert_eq!(a, b);
    }
}
