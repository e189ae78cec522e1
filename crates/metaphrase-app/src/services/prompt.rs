//! Windowed translation prompt builder.
//!
//! Renders one batch as a chat prompt: a system prompt (optionally extended
//! with a glossary), a user message carrying the context window as
//! `<seg id="...">` blocks plus the list of target ids, and a JSON schema for
//! providers with structured output modes. The paired decoder expects a
//! strict JSON array of `{id, text}` objects back.

use serde::Deserialize;

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::estimate::TokenEstimator;
use crate::pipeline::fragment::{Batch, Record};
use crate::services::context::{ChatMessage, ChatPrompt, Prompt, PromptBuilder};

/// Options for the `translate` prompt builder. Template and glossary each
/// resolve inline-first, then by path; both empty falls back to the built-in
/// defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TranslateOptions {
    pub inline_system_template: String,
    pub system_template_path: String,
    pub inline_glossary: String,
    pub glossary_path: String,
}

pub struct TranslatePromptBuilder {
    system: String,
    glossary: String,
}

impl TranslatePromptBuilder {
    /// Reads template/glossary files at construction time; the builder does
    /// no IO afterwards.
    pub fn new(options: TranslateOptions) -> PipelineResult<Self> {
        let system = if !options.inline_system_template.is_empty() {
            options.inline_system_template
        } else if !options.system_template_path.is_empty() {
            std::fs::read_to_string(&options.system_template_path)?
        } else {
            DEFAULT_SYSTEM_PROMPT.to_string()
        };
        let glossary = if !options.inline_glossary.is_empty() {
            options.inline_glossary
        } else if !options.glossary_path.is_empty() {
            std::fs::read_to_string(&options.glossary_path)?
        } else {
            String::new()
        };
        Ok(Self { system, glossary })
    }

    fn system_message(&self) -> String {
        if self.glossary.is_empty() {
            return self.system.clone();
        }
        let mut out = String::with_capacity(self.system.len() + self.glossary.len() + 32);
        out.push_str(&self.system);
        out.push_str("\n\n<glossary>\n");
        out.push_str(&self.glossary);
        if !self.glossary.ends_with('\n') {
            out.push('\n');
        }
        out.push_str("</glossary>");
        out
    }

    fn user_message(window: &[Record], targets: &[&Record]) -> String {
        let mut out = String::with_capacity(1024);
        out.push_str("### Context Window\n\n<window>\n");
        for record in window {
            write_seg(&mut out, record);
        }
        out.push_str("</window>\n");
        out.push_str(OUTPUT_RULES);
        out.push_str("targets: [");
        for (i, record) in targets.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            out.push_str(&record.index.to_string());
        }
        out.push_str("]\n");
        out
    }

    fn response_schema() -> serde_json::Value {
        serde_json::json!({
            "type": "array",
            "items": {
                "type": "object",
                "additionalProperties": false,
                "properties": {
                    "id": {"type": "integer"},
                    "text": {"type": "string"}
                },
                "required": ["id", "text"]
            }
        })
    }
}

impl PromptBuilder for TranslatePromptBuilder {
    fn build(&self, batch: &Batch) -> PipelineResult<Prompt> {
        let window = batch.records();
        if window.is_empty() {
            return Err(PipelineError::invalid("prompt: empty batch window"));
        }
        let targets: Vec<&Record> = window
            .iter()
            .filter(|r| r.index >= batch.target_from && r.index <= batch.target_to)
            .collect();
        if targets.is_empty() {
            return Err(PipelineError::invalid("prompt: empty target range"));
        }

        Ok(Prompt::Chat(ChatPrompt {
            messages: vec![
                ChatMessage::new("system", self.system_message()),
                ChatMessage::new("user", Self::user_message(window, &targets)),
            ],
            response_schema: Some(Self::response_schema()),
        }))
    }

    fn estimate_overhead_tokens(&self, estimator: &TokenEstimator) -> usize {
        // Fixed content only: system prompt, glossary, the user-message
        // scaffold and the schema. Window text and target ids are dynamic
        // and excluded.
        let user_fixed = format!("### Context Window\n\n<window>\n</window>\n{OUTPUT_RULES}targets: []\n");
        estimator.estimate(&self.system_message())
            + estimator.estimate(&user_fixed)
            + estimator.estimate(&Self::response_schema().to_string())
    }
}

fn write_seg(out: &mut String, record: &Record) {
    out.push_str("<seg id=\"");
    out.push_str(&record.index.to_string());
    out.push_str("\">\n");
    out.push_str(&record.text);
    out.push_str("\n</seg>\n");
}

const OUTPUT_RULES: &str = "\nIMPORTANT OUTPUT RULES:\n\
1) Translate ONLY segs whose ids are listed in 'targets' below.\n\
2) Return ONLY strict JSON (no markdown, no code fences, no commentary).\n\
3) Schema: an array of objects [{\"id\": number, \"text\": string}] in ascending id order.\n";

const DEFAULT_SYSTEM_PROMPT: &str = r#"## Role
You are a professional subtitle translator working through a film one window
at a time. Translate accurately and idiomatically, keep character names
consistent, and resolve ambiguity from the surrounding context.

## I/O Protocol
- The user message contains a <window> of <seg id="..."> blocks. Use the
  whole window for context.
- Translate ONLY the seg ids listed under "targets". Never rewrite or emit
  other segs.
- If a <glossary> is present, its term mappings take precedence.
- Reply with strict JSON matching the requested schema; no markdown, no code
  fences, no commentary.

<example>
user: <window>
<seg id="20">Context before</seg>
<seg id="21">- Hi, everyone!\n- Hello!</seg>
<seg id="22">Please be seated.</seg>
<seg id="23">Context after</seg>
</window>
Translate ONLY segs whose ids are listed in 'targets' below.
targets: [21, 22]

assistant: [{"id": 21, "text": "- 大家好！\n- 你好！"}, {"id": 22, "text": "请坐。"}]
</example>
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::fragment::FileId;
    use std::sync::Arc;

    fn batch(texts: &[&str], target_from: i64, target_to: i64) -> Batch {
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
        Batch::new(FileId::from("a.srt"), 0, records, 0..len, target_from, target_to)
    }

    fn builder() -> TranslatePromptBuilder {
        TranslatePromptBuilder::new(TranslateOptions::default()).expect("default builder")
    }

    #[test]
    fn renders_window_and_targets() {
        let prompt = builder().build(&batch(&["ctx", "one", "two", "ctx2"], 1, 2)).expect("builds");
        let Prompt::Chat(chat) = prompt else {
            panic!("translate builder must emit a chat prompt");
        };
        assert_eq!(chat.messages.len(), 2);
        assert_eq!(chat.messages[0].role, "system");
        let user = &chat.messages[1].content;
        assert!(user.contains("<seg id=\"0\">\nctx\n</seg>"));
        assert!(user.contains("<seg id=\"2\">\ntwo\n</seg>"));
        assert!(user.contains("targets: [1,2]"));
        assert!(chat.response_schema.is_some());
    }

    #[test]
    fn glossary_is_appended_to_system() {
        let b = TranslatePromptBuilder::new(TranslateOptions {
            inline_glossary: "Foo => Bar".to_string(),
            ..TranslateOptions::default()
        })
        .expect("builder with glossary");
        let prompt = b.build(&batch(&["x"], 0, 0)).expect("builds");
        let Prompt::Chat(chat) = prompt else {
            panic!("chat prompt expected");
        };
        let system = &chat.messages[0].content;
        assert!(system.contains("<glossary>\nFoo => Bar\n</glossary>"));
    }

    #[test]
    fn overhead_excludes_window_content() {
        let est = TokenEstimator::new(4);
        let b = builder();
        let small = b.estimate_overhead_tokens(&est);
        // Overhead must not change with batch size, by construction.
        let large_text = "long subtitle line ".repeat(50);
        let prompt = b
            .build(&batch(&[large_text.as_str(), large_text.as_str()], 0, 1))
            .expect("builds");
        assert!(small > 0);
        assert!(prompt.content_bytes() / 4 > small);
        assert_eq!(small, b.estimate_overhead_tokens(&est));
    }

    #[test]
    fn empty_target_range_is_invalid() {
        // Window present but target indices outside it.
        let records: Arc<[Record]> = vec![Record {
            index: 0,
            file_id: FileId::from("a.srt"),
            text: "x".to_string(),
            meta: None,
        }]
        .into();
        let b = Batch::new(FileId::from("a.srt"), 0, records, 0..1, 5, 6);
        assert!(builder().build(&b).is_err());
    }
}
