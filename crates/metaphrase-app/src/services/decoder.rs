//! Strict per-record JSON decoder for subtitle translations.
//!
//! Expects the raw payload to be a JSON array of `{id, text, meta?}` objects
//! covering the target range exactly, one object per record. After coverage
//! validation each span's output is rendered back into a full SRT block
//! (sequence number, timecode, text, trailing blank line) using the record
//! meta captured by the splitter, so the assembler only has to concatenate.

use serde::Deserialize;

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::fragment::{
    DST_TEXT_META_KEY, Index, IndexMetaMap, Meta, Raw, SRC_TEXT_META_KEY, SpanCandidate,
    SpanResult, Target,
};
use crate::pipeline::validate::validate_per_record;
use crate::services::context::Decoder;
use crate::services::splitter::{META_SEQ, META_TIME};

/// Options for the `srt_json` decoder. No knobs yet; the struct keeps the
/// registry's strict-options contract.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SrtJsonOptions {}

#[derive(Default)]
pub struct SrtJsonDecoder;

impl SrtJsonDecoder {
    pub fn new(_options: SrtJsonOptions) -> Self {
        Self
    }

    fn parse(raw: &Raw) -> PipelineResult<Vec<Item>> {
        let items: Vec<Item> = serde_json::from_str(&raw.text)
            .map_err(|e| PipelineError::protocol(format!("per-record json: {e}")))?;
        for item in &items {
            if item.text.trim().is_empty() {
                return Err(PipelineError::protocol(format!(
                    "empty translation for id {}",
                    item.id
                )));
            }
        }
        Ok(items)
    }

    fn candidates(items: Vec<Item>, index_meta: Option<&IndexMetaMap>) -> Vec<SpanCandidate> {
        items
            .into_iter()
            .map(|item| {
                let mut meta: Meta = match item.meta {
                    Some(m) if !m.is_empty() => m,
                    _ => index_meta
                        .and_then(|im| im.get(&item.id))
                        .cloned()
                        .unwrap_or_default(),
                };
                meta.remove(SRC_TEXT_META_KEY);
                meta.insert(DST_TEXT_META_KEY.to_string(), item.text.clone());
                SpanCandidate {
                    from: item.id,
                    to: item.id,
                    output: item.text,
                    meta: Some(meta),
                }
            })
            .collect()
    }

    /// Flags responses where every target id comes back as the source text:
    /// the model ignored the translation instruction and echoed its input.
    fn detect_echo(items: &[Item], index_meta: &IndexMetaMap) -> bool {
        if items.is_empty() {
            return false;
        }
        items.iter().all(|item| {
            index_meta
                .get(&item.id)
                .and_then(|meta| meta.get(SRC_TEXT_META_KEY))
                .is_some_and(|src| {
                    let src = src.trim();
                    !src.is_empty() && src == item.text.trim()
                })
        })
    }

    fn render(spans: &mut [SpanResult]) {
        for span in spans {
            span.output = format_srt_block(span.meta.as_ref(), &span.output);
        }
    }
}

#[derive(Debug, Deserialize)]
struct Item {
    id: Index,
    text: String,
    #[serde(default)]
    meta: Option<Meta>,
}

impl Decoder for SrtJsonDecoder {
    fn decode(&self, target: &Target, raw: &Raw) -> PipelineResult<Vec<SpanResult>> {
        let items = Self::parse(raw)?;
        let candidates = Self::candidates(items, None);
        let mut spans = validate_per_record(target, &candidates)?;
        Self::render(&mut spans);
        Ok(spans)
    }

    fn decode_with_meta(
        &self,
        target: &Target,
        raw: &Raw,
        index_meta: &IndexMetaMap,
    ) -> PipelineResult<Vec<SpanResult>> {
        let items = Self::parse(raw)?;
        if Self::detect_echo(&items, index_meta) {
            return Err(PipelineError::protocol("response echoes the source text"));
        }
        let candidates = Self::candidates(items, Some(index_meta));
        let mut spans = validate_per_record(target, &candidates)?;
        Self::render(&mut spans);
        Ok(spans)
    }
}

/// Renders one cue as an SRT block: sequence line, timecode line, text, and
/// the blank separator line.
fn format_srt_block(meta: Option<&Meta>, text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 48);
    if let Some(meta) = meta {
        if let Some(seq) = meta.get(META_SEQ).filter(|s| !s.is_empty()) {
            out.push_str(seq);
            out.push('\n');
        }
        if let Some(time) = meta.get(META_TIME).filter(|s| !s.is_empty()) {
            out.push_str(time);
            out.push('\n');
        }
    }
    if !text.is_empty() {
        out.push_str(text);
        out.push('\n');
    }
    out.push('\n');
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::error::ErrorCode;
    use crate::pipeline::fragment::FileId;

    fn target(from: i64, to: i64) -> Target {
        Target { file_id: FileId::from("a.srt"), from, to }
    }

    fn meta_map(entries: &[(i64, &str, &str, &str)]) -> IndexMetaMap {
        entries
            .iter()
            .map(|(idx, seq, time, src)| {
                let meta = Meta::from([
                    (META_SEQ.to_string(), seq.to_string()),
                    (META_TIME.to_string(), time.to_string()),
                    (SRC_TEXT_META_KEY.to_string(), src.to_string()),
                ]);
                (*idx, meta)
            })
            .collect()
    }

    #[test]
    fn decodes_and_renders_srt_blocks() {
        let decoder = SrtJsonDecoder::default();
        let raw = Raw {
            text: r#"[{"id":0,"text":"你好"},{"id":1,"text":"请坐"}]"#.to_string(),
        };
        let index_meta = meta_map(&[
            (0, "1", "00:00:01,000 --> 00:00:02,000", "Hello"),
            (1, "2", "00:00:03,000 --> 00:00:04,000", "Sit down"),
        ]);
        let spans = decoder
            .decode_with_meta(&target(0, 1), &raw, &index_meta)
            .expect("valid response");
        assert_eq!(spans.len(), 2);
        assert_eq!(spans[0].output, "1\n00:00:01,000 --> 00:00:02,000\n你好\n\n");
        let meta = spans[1].meta.as_ref().expect("span meta");
        assert_eq!(meta[DST_TEXT_META_KEY], "请坐");
        assert!(!meta.contains_key(SRC_TEXT_META_KEY));
    }

    #[test]
    fn malformed_json_is_protocol_error() {
        let decoder = SrtJsonDecoder::default();
        let err = decoder
            .decode(&target(0, 0), &Raw { text: "not json".to_string() })
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Protocol);
    }

    #[test]
    fn empty_translation_is_protocol_error() {
        let decoder = SrtJsonDecoder::default();
        let err = decoder
            .decode(&target(0, 0), &Raw { text: r#"[{"id":0,"text":"   "}]"#.to_string() })
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Protocol);
    }

    #[test]
    fn incomplete_coverage_is_protocol_error() {
        let decoder = SrtJsonDecoder::default();
        let err = decoder
            .decode(&target(0, 2), &Raw { text: r#"[{"id":0,"text":"a"},{"id":1,"text":"b"}]"#.to_string() })
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Protocol);
    }

    #[test]
    fn echoed_source_is_rejected() {
        let decoder = SrtJsonDecoder::default();
        let raw = Raw {
            text: r#"[{"id":0,"text":"Hello"},{"id":1,"text":"Sit down"}]"#.to_string(),
        };
        let index_meta = meta_map(&[
            (0, "1", "00:00:01,000 --> 00:00:02,000", "Hello"),
            (1, "2", "00:00:03,000 --> 00:00:04,000", "Sit down"),
        ]);
        let err = decoder
            .decode_with_meta(&target(0, 1), &raw, &index_meta)
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Protocol);
    }

    #[test]
    fn partial_echo_is_accepted() {
        let decoder = SrtJsonDecoder::default();
        let raw = Raw {
            text: r#"[{"id":0,"text":"Hello"},{"id":1,"text":"请坐"}]"#.to_string(),
        };
        let index_meta = meta_map(&[
            (0, "1", "00:00:01,000 --> 00:00:02,000", "Hello"),
            (1, "2", "00:00:03,000 --> 00:00:04,000", "Sit down"),
        ]);
        let spans = decoder
            .decode_with_meta(&target(0, 1), &raw, &index_meta)
            .expect("one echoed line among translations is fine");
        assert_eq!(spans.len(), 2);
    }

    #[test]
    fn inline_meta_wins_over_index_meta() {
        let decoder = SrtJsonDecoder::default();
        let raw = Raw {
            text: r#"[{"id":0,"text":"你好","meta":{"seq":"9","time":"00:00:09,000 --> 00:00:10,000"}}]"#
                .to_string(),
        };
        let index_meta = meta_map(&[(0, "1", "00:00:01,000 --> 00:00:02,000", "Hello")]);
        let spans = decoder
            .decode_with_meta(&target(0, 0), &raw, &index_meta)
            .expect("valid response");
        assert!(spans[0].output.starts_with("9\n00:00:09,000"));
    }

    #[test]
    fn without_meta_renders_bare_blocks() {
        let decoder = SrtJsonDecoder::default();
        let spans = decoder
            .decode(&target(0, 0), &Raw { text: r#"[{"id":0,"text":"你好"}]"#.to_string() })
            .expect("valid response");
        assert_eq!(spans[0].output, "你好\n\n");
    }
}
