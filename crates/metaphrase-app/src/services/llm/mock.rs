//! Deterministic offline LLM client.
//!
//! Produces placeholder translations synthesized from the batch itself, so
//! the full pipeline can run without network access. The response mode
//! selects the wire shape; `translate_json_per_record` pairs with the
//! `srt_json` decoder out of the box.

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::fragment::{Batch, Raw, Record};
use crate::services::context::{LlmClient, Prompt};

/// Rate-limit grouping key used when no api key is configured.
pub const MOCK_DEBUG_KEY: &str = "MOCK_DEBUG_KEY";

/// Options for the `mock` client.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MockOptions {
    /// Placeholder-translation prefix; defaults to `MOCK`.
    pub prefix: String,
    /// Only feeds rate-limit key derivation; no network use.
    pub api_key: String,
    /// `translate_json_per_record` (default), `translate_json_span`,
    /// `line_map`, or `echo`.
    pub response_mode: String,
}

pub struct MockClient {
    prefix: String,
    mode: Mode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    PerRecordJson,
    SpanJson,
    LineMap,
    /// Returns the source text verbatim per target id; exercises the
    /// decoder's echoed-original protocol check.
    Echo,
}

impl MockClient {
    pub fn new(options: MockOptions) -> Self {
        let prefix = if options.prefix.is_empty() {
            "MOCK".to_string()
        } else {
            options.prefix
        };
        let mode = match options.response_mode.as_str() {
            "translate_json_span" => Mode::SpanJson,
            "line_map" => Mode::LineMap,
            "echo" => Mode::Echo,
            _ => Mode::PerRecordJson,
        };
        Self { prefix, mode }
    }

    fn target_record<'a>(batch: &'a Batch, index: i64) -> PipelineResult<&'a Record> {
        let window = batch.records();
        let base = window[0].index;
        let offset = index - base;
        if offset < 0 || offset as usize >= window.len() {
            return Err(PipelineError::Invariant(format!(
                "mock: target index {index} outside batch window"
            )));
        }
        Ok(&window[offset as usize])
    }
}

#[derive(serde::Serialize)]
struct Item {
    id: i64,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    meta: Option<crate::pipeline::fragment::Meta>,
}

#[async_trait]
impl LlmClient for MockClient {
    async fn invoke(
        &self,
        ctx: &CancellationToken,
        batch: &Batch,
        _prompt: &Prompt,
    ) -> PipelineResult<Raw> {
        if ctx.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        match self.mode {
            Mode::PerRecordJson | Mode::Echo => {
                let mut items = Vec::with_capacity((batch.target_to - batch.target_from + 1) as usize);
                for index in batch.target_from..=batch.target_to {
                    let record = Self::target_record(batch, index)?;
                    let text = if self.mode == Mode::Echo {
                        record.text.clone()
                    } else {
                        format!("{}: {}", self.prefix, record.text)
                    };
                    items.push(Item { id: index, text, meta: record.meta.clone() });
                }
                let text = serde_json::to_string(&items)
                    .map_err(|e| PipelineError::Invariant(format!("mock encode: {e}")))?;
                Ok(Raw { text })
            }
            Mode::SpanJson => {
                let mut lines = Vec::new();
                for index in batch.target_from..=batch.target_to {
                    lines.push(Self::target_record(batch, index)?.text.clone());
                }
                let obj = serde_json::json!({
                    "from": batch.target_from,
                    "to": batch.target_to,
                    "text": lines.join("\n"),
                });
                Ok(Raw { text: obj.to_string() })
            }
            Mode::LineMap => {
                let mut lines = Vec::new();
                for index in batch.target_from..=batch.target_to {
                    lines.push(Self::target_record(batch, index)?.text.clone());
                }
                Ok(Raw { text: lines.join("\n") })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fragment::FileId;
    use std::sync::Arc;

    fn batch(texts: &[&str], from: i64, to: i64) -> Batch {
        let records: Arc<[Record]> = texts
            .iter()
            .enumerate()
            .map(|(i, t)| Record {
                index: i as i64,
                file_id: FileId::from("a.srt"),
                text: t.to_string(),
                meta: None,
            })
            .collect::<Vec<_>>()
            .into();
        let len = records.len();
        Batch::new(FileId::from("a.srt"), 0, records, 0..len, from, to)
    }

    #[tokio::test]
    async fn per_record_mode_prefixes_each_target() {
        let client = MockClient::new(MockOptions::default());
        let raw = client
            .invoke(&CancellationToken::new(), &batch(&["a", "b", "c"], 1, 2), &Prompt::Text(String::new()))
            .await
            .expect("mock invoke");
        let items: Vec<serde_json::Value> = serde_json::from_str(&raw.text).expect("json array");
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["id"], 1);
        assert_eq!(items[0]["text"], "MOCK: b");
        assert_eq!(items[1]["text"], "MOCK: c");
    }

    #[tokio::test]
    async fn echo_mode_returns_source_text() {
        let client = MockClient::new(MockOptions {
            response_mode: "echo".to_string(),
            ..MockOptions::default()
        });
        let raw = client
            .invoke(&CancellationToken::new(), &batch(&["hello"], 0, 0), &Prompt::Text(String::new()))
            .await
            .expect("mock invoke");
        let items: Vec<serde_json::Value> = serde_json::from_str(&raw.text).expect("json array");
        assert_eq!(items[0]["text"], "hello");
    }

    #[tokio::test]
    async fn span_mode_covers_whole_target() {
        let client = MockClient::new(MockOptions {
            response_mode: "translate_json_span".to_string(),
            ..MockOptions::default()
        });
        let raw = client
            .invoke(&CancellationToken::new(), &batch(&["a", "b"], 0, 1), &Prompt::Text(String::new()))
            .await
            .expect("mock invoke");
        let obj: serde_json::Value = serde_json::from_str(&raw.text).expect("json object");
        assert_eq!(obj["from"], 0);
        assert_eq!(obj["to"], 1);
        assert_eq!(obj["text"], "a\nb");
    }
}
