//! SRT subtitle splitter.
//!
//! One record per subtitle cue: the cue's text lines joined with `\n`, with
//! the sequence number and timecode preserved in record meta for downstream
//! reconstruction. Line handling normalizes CRLF to LF; anything that is not
//! valid UTF-8 or does not follow the `index / timecode / text` block shape
//! is an error.

use std::collections::BTreeSet;

use async_trait::async_trait;
use futures::TryStreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::fragment::{FileId, Meta, Record};
use crate::services::context::{ByteStream, Splitter};

/// Meta key carrying the cue sequence number.
pub const META_SEQ: &str = "seq";
/// Meta key carrying the cue timecode line.
pub const META_TIME: &str = "time";

static TIME_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\d{2}:\d{2}:\d{2},\d{3} --> \d{2}:\d{2}:\d{2},\d{3}")
        .expect("static timecode pattern")
});

/// Options for the `srt` splitter.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SrtOptions {
    /// Upper bound on a single cue's text bytes; 0 disables the check.
    pub max_fragment_bytes: usize,
    /// Extensions this splitter accepts (with dot, case-insensitive).
    /// Absent: defaults to `[".srt"]`. Present but empty: no restriction.
    pub allow_exts: Option<Vec<String>>,
}

pub struct SrtSplitter {
    max_bytes: usize,
    /// Lowercased allowed extensions; `None` means unrestricted.
    allow: Option<BTreeSet<String>>,
}

impl SrtSplitter {
    pub fn new(options: SrtOptions) -> Self {
        let allow = match options.allow_exts {
            None => Some(BTreeSet::from([".srt".to_string()])),
            Some(exts) if exts.is_empty() => None,
            Some(exts) => Some(
                exts.into_iter()
                    .filter(|e| !e.is_empty())
                    .map(|e| e.to_lowercase())
                    .collect(),
            ),
        };
        Self { max_bytes: options.max_fragment_bytes, allow }
    }

    fn accepts(&self, file_id: &FileId) -> bool {
        let Some(allow) = &self.allow else {
            return true;
        };
        let base = file_id.as_str().rsplit('/').next().unwrap_or("");
        let ext = base.rfind('.').map(|pos| &base[pos..]).unwrap_or("");
        allow.contains(&ext.to_lowercase())
    }

    fn check_size(&self, predicted: usize) -> PipelineResult<()> {
        if self.max_bytes > 0 && predicted > self.max_bytes {
            return Err(PipelineError::invalid(format!(
                "subtitle fragment too large: {predicted} > {} bytes",
                self.max_bytes
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Splitter for SrtSplitter {
    async fn split(
        &self,
        ctx: &CancellationToken,
        file_id: &FileId,
        data: ByteStream,
    ) -> PipelineResult<Vec<Record>> {
        if !self.accepts(file_id) {
            return Ok(Vec::new());
        }

        let mut buf = Vec::new();
        let mut stream = data;
        while let Some(chunk) = stream.try_next().await? {
            if ctx.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            buf.extend_from_slice(&chunk);
        }
        let content = String::from_utf8(buf)
            .map_err(|_| PipelineError::invalid("input is not valid UTF-8"))?;

        // str::lines strips the trailing \r of CRLF line endings.
        let mut lines = content.lines().peekable();
        let mut records = Vec::new();
        let mut index = 0i64;

        while let Some(line) = lines.next() {
            if ctx.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let seq_line = line.trim_end();
            if seq_line.is_empty() {
                continue;
            }
            if seq_line.parse::<i64>().is_err() {
                return Err(PipelineError::invalid(format!(
                    "srt format: invalid sequence line {seq_line:?}"
                )));
            }

            let time_line = lines.next().unwrap_or("").trim_end();
            if !TIME_LINE.is_match(time_line) {
                return Err(PipelineError::invalid(format!(
                    "srt format: invalid timecode line {time_line:?}"
                )));
            }

            let mut texts: Vec<&str> = Vec::new();
            let mut total = 0usize;
            for text_line in lines.by_ref() {
                let text_line = text_line.trim_end();
                if text_line.is_empty() {
                    break;
                }
                let mut predicted = total + text_line.len();
                if !texts.is_empty() {
                    predicted += texts.len();
                }
                self.check_size(predicted)?;
                total += text_line.len();
                texts.push(text_line);
            }

            let text = texts.join("\n");
            self.check_size(text.len())?;

            let meta = Meta::from([
                (META_SEQ.to_string(), seq_line.to_string()),
                (META_TIME.to_string(), time_line.to_string()),
            ]);
            records.push(Record {
                index,
                file_id: file_id.clone(),
                text,
                meta: Some(meta),
            });
            index += 1;
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::context::byte_stream_from;
    use bytes::Bytes;

    async fn split(splitter: &SrtSplitter, file: &str, content: &str) -> PipelineResult<Vec<Record>> {
        let ctx = CancellationToken::new();
        splitter
            .split(&ctx, &FileId::from(file), byte_stream_from(Bytes::from(content.to_string())))
            .await
    }

    fn default_splitter() -> SrtSplitter {
        SrtSplitter::new(SrtOptions::default())
    }

    const SAMPLE: &str = "1\n00:00:01,000 --> 00:00:02,000\nHello there\n\n2\n00:00:03,000 --> 00:00:04,500\n- Hi!\n- Welcome.\n\n";

    #[tokio::test]
    async fn splits_cues_with_meta() {
        let records = split(&default_splitter(), "a.srt", SAMPLE).await.expect("valid srt");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].index, 0);
        assert_eq!(records[0].text, "Hello there");
        let meta = records[0].meta.as_ref().expect("cue meta");
        assert_eq!(meta[META_SEQ], "1");
        assert_eq!(meta[META_TIME], "00:00:01,000 --> 00:00:02,000");

        assert_eq!(records[1].index, 1);
        assert_eq!(records[1].text, "- Hi!\n- Welcome.");
    }

    #[tokio::test]
    async fn crlf_input_is_normalized() {
        let crlf = SAMPLE.replace('\n', "\r\n");
        let records = split(&default_splitter(), "a.srt", &crlf).await.expect("valid srt");
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].text, "- Hi!\n- Welcome.");
    }

    #[tokio::test]
    async fn rejects_malformed_blocks() {
        let bad_seq = "one\n00:00:01,000 --> 00:00:02,000\nText\n";
        assert!(split(&default_splitter(), "a.srt", bad_seq).await.is_err());

        let bad_time = "1\nnot a timecode\nText\n";
        assert!(split(&default_splitter(), "a.srt", bad_time).await.is_err());
    }

    #[tokio::test]
    async fn rejects_invalid_utf8() {
        let splitter = default_splitter();
        let ctx = CancellationToken::new();
        let bytes = Bytes::from_static(&[0x31, 0x0a, 0xff, 0xfe, 0x0a]);
        let err = splitter
            .split(&ctx, &FileId::from("a.srt"), byte_stream_from(bytes))
            .await
            .unwrap_err();
        assert_eq!(err.code(), crate::pipeline::error::ErrorCode::Invariant);
    }

    #[tokio::test]
    async fn enforces_fragment_size_limit() {
        let splitter = SrtSplitter::new(SrtOptions {
            max_fragment_bytes: 8,
            allow_exts: None,
        });
        let oversized = "1\n00:00:01,000 --> 00:00:02,000\nfar too long for eight bytes\n\n";
        assert!(split(&splitter, "a.srt", oversized).await.is_err());
    }

    #[tokio::test]
    async fn non_matching_extensions_yield_no_records() {
        let records = split(&default_splitter(), "a.txt", SAMPLE).await.expect("skipped file");
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn empty_allow_list_disables_the_filter() {
        let splitter = SrtSplitter::new(SrtOptions {
            max_fragment_bytes: 0,
            allow_exts: Some(Vec::new()),
        });
        let records = split(&splitter, "stdin", SAMPLE).await.expect("unrestricted");
        assert_eq!(records.len(), 2);
    }

    #[tokio::test]
    async fn skips_blank_lines_between_cues() {
        let padded = format!("\n\n{SAMPLE}\n\n");
        let records = split(&default_splitter(), "a.srt", &padded).await.expect("valid srt");
        assert_eq!(records.len(), 2);
    }
}
