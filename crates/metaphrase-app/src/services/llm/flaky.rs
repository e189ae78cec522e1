//! Scripted-failure LLM client for exercising the retry path.
//!
//! Call 1 fails rate-limited, call 2 returns unparseable JSON, every later
//! call returns a valid placeholder translation. With `max_retries >= 2` a
//! pipeline run over one batch succeeds after exactly three invocations.

use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::fragment::{Batch, Raw};
use crate::services::context::{LlmClient, Prompt};

/// Options for the `flaky` client.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FlakyOptions {
    /// Placeholder-translation prefix; defaults to `FLAKY`.
    pub prefix: String,
}

pub struct FlakyClient {
    prefix: String,
    calls: AtomicU32,
}

impl FlakyClient {
    pub fn new(options: FlakyOptions) -> Self {
        let prefix = if options.prefix.is_empty() {
            "FLAKY".to_string()
        } else {
            options.prefix
        };
        Self { prefix, calls: AtomicU32::new(0) }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for FlakyClient {
    async fn invoke(
        &self,
        ctx: &CancellationToken,
        batch: &Batch,
        _prompt: &Prompt,
    ) -> PipelineResult<Raw> {
        if ctx.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        match self.calls.fetch_add(1, Ordering::SeqCst) + 1 {
            1 => Err(PipelineError::RateLimited),
            2 => Ok(Raw { text: "not json".to_string() }),
            _ => {
                let window = batch.records();
                let base = window[0].index;
                let mut items = Vec::new();
                for index in batch.target_from..=batch.target_to {
                    let offset = (index - base) as usize;
                    let record = window.get(offset).ok_or_else(|| {
                        PipelineError::Invariant(format!(
                            "flaky: target index {index} outside batch window"
                        ))
                    })?;
                    items.push(serde_json::json!({
                        "id": index,
                        "text": format!("{}: {}", self.prefix, record.text),
                    }));
                }
                Ok(Raw { text: serde_json::Value::Array(items).to_string() })
            }
        }
    }
}
