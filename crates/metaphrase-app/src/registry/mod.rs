//! Compile-time component registry.
//!
//! Maps component kind × implementation name to a factory taking the raw
//! JSON options subtree from the configuration. Option structs reject
//! unknown fields, so a typo in the config fails assembly instead of being
//! silently ignored.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::services::context::{
    Assembler, Batcher, Decoder, LlmClient, PromptBuilder, Reader, Splitter, Writer,
};
use crate::services::llm::flaky::{FlakyClient, FlakyOptions};
use crate::services::llm::mock::{MockClient, MockOptions};
use crate::services::llm::openai::{OpenAiClient, OpenAiOptions};
use crate::pipeline::batcher::{SlidingBatcher, SlidingOptions};
use crate::services::{
    FsReader, FsReaderOptions, FsWriter, FsWriterOptions, LinearAssembler, LinearOptions,
    SrtJsonDecoder, SrtJsonOptions, SrtOptions, SrtSplitter, TranslateOptions,
    TranslatePromptBuilder,
};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown {kind} implementation {name:?}")]
    Unknown { kind: &'static str, name: String },
    #[error("invalid {kind} options for {name:?}: {source}")]
    Options {
        kind: &'static str,
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} {name:?} failed to initialize: {source}")]
    Init {
        kind: &'static str,
        name: String,
        #[source]
        source: crate::pipeline::error::PipelineError,
    },
}

pub type RegistryResult<T> = Result<T, RegistryError>;

fn parse_options<T: DeserializeOwned + Default>(
    kind: &'static str,
    name: &str,
    options: Option<&serde_json::Value>,
) -> RegistryResult<T> {
    match options {
        None | Some(serde_json::Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value.clone()).map_err(|source| {
            RegistryError::Options { kind, name: name.to_string(), source }
        }),
    }
}

pub fn has_reader(name: &str) -> bool {
    name == "fs"
}

pub fn build_reader(name: &str, options: Option<&serde_json::Value>) -> RegistryResult<Arc<dyn Reader>> {
    match name {
        "fs" => {
            let opts: FsReaderOptions = parse_options("reader", name, options)?;
            Ok(Arc::new(FsReader::new(opts)))
        }
        _ => Err(RegistryError::Unknown { kind: "reader", name: name.to_string() }),
    }
}

pub fn has_splitter(name: &str) -> bool {
    name == "srt"
}

pub fn build_splitter(
    name: &str,
    options: Option<&serde_json::Value>,
) -> RegistryResult<Arc<dyn Splitter>> {
    match name {
        "srt" => {
            let opts: SrtOptions = parse_options("splitter", name, options)?;
            Ok(Arc::new(SrtSplitter::new(opts)))
        }
        _ => Err(RegistryError::Unknown { kind: "splitter", name: name.to_string() }),
    }
}

pub fn has_batcher(name: &str) -> bool {
    name == "sliding"
}

pub fn build_batcher(
    name: &str,
    options: Option<&serde_json::Value>,
) -> RegistryResult<Arc<dyn Batcher>> {
    match name {
        "sliding" => {
            let opts: SlidingOptions = parse_options("batcher", name, options)?;
            Ok(Arc::new(SlidingBatcher::new(opts)))
        }
        _ => Err(RegistryError::Unknown { kind: "batcher", name: name.to_string() }),
    }
}

pub fn has_prompt_builder(name: &str) -> bool {
    name == "translate"
}

pub fn build_prompt_builder(
    name: &str,
    options: Option<&serde_json::Value>,
) -> RegistryResult<Arc<dyn PromptBuilder>> {
    match name {
        "translate" => {
            let opts: TranslateOptions = parse_options("prompt_builder", name, options)?;
            let builder = TranslatePromptBuilder::new(opts).map_err(|source| {
                RegistryError::Init { kind: "prompt_builder", name: name.to_string(), source }
            })?;
            Ok(Arc::new(builder))
        }
        _ => Err(RegistryError::Unknown { kind: "prompt_builder", name: name.to_string() }),
    }
}

pub fn has_llm_client(name: &str) -> bool {
    matches!(name, "openai" | "mock" | "flaky")
}

pub fn build_llm_client(
    name: &str,
    options: Option<&serde_json::Value>,
) -> RegistryResult<Arc<dyn LlmClient>> {
    match name {
        "openai" => {
            let opts: OpenAiOptions = parse_options("llm_client", name, options)?;
            let client = OpenAiClient::new(opts).map_err(|source| {
                RegistryError::Init { kind: "llm_client", name: name.to_string(), source }
            })?;
            Ok(Arc::new(client))
        }
        "mock" => {
            let opts: MockOptions = parse_options("llm_client", name, options)?;
            Ok(Arc::new(MockClient::new(opts)))
        }
        "flaky" => {
            let opts: FlakyOptions = parse_options("llm_client", name, options)?;
            Ok(Arc::new(FlakyClient::new(opts)))
        }
        _ => Err(RegistryError::Unknown { kind: "llm_client", name: name.to_string() }),
    }
}

pub fn has_decoder(name: &str) -> bool {
    name == "srt_json"
}

pub fn build_decoder(
    name: &str,
    options: Option<&serde_json::Value>,
) -> RegistryResult<Arc<dyn Decoder>> {
    match name {
        "srt_json" => {
            let opts: SrtJsonOptions = parse_options("decoder", name, options)?;
            Ok(Arc::new(SrtJsonDecoder::new(opts)))
        }
        _ => Err(RegistryError::Unknown { kind: "decoder", name: name.to_string() }),
    }
}

pub fn has_assembler(name: &str) -> bool {
    name == "linear"
}

pub fn build_assembler(
    name: &str,
    options: Option<&serde_json::Value>,
) -> RegistryResult<Arc<dyn Assembler>> {
    match name {
        "linear" => {
            let opts: LinearOptions = parse_options("assembler", name, options)?;
            Ok(Arc::new(LinearAssembler::new(opts)))
        }
        _ => Err(RegistryError::Unknown { kind: "assembler", name: name.to_string() }),
    }
}

pub fn has_writer(name: &str) -> bool {
    name == "fs"
}

pub fn build_writer(
    name: &str,
    options: Option<&serde_json::Value>,
) -> RegistryResult<Arc<dyn Writer>> {
    match name {
        "fs" => {
            let Some(value) = options.filter(|v| !v.is_null()) else {
                return Err(RegistryError::Init {
                    kind: "writer",
                    name: name.to_string(),
                    source: crate::pipeline::error::PipelineError::invalid(
                        "fs writer requires options with output_dir",
                    ),
                });
            };
            let opts: FsWriterOptions = serde_json::from_value(value.clone()).map_err(|source| {
                RegistryError::Options { kind: "writer", name: name.to_string(), source }
            })?;
            let writer = FsWriter::new(opts).map_err(|source| {
                RegistryError::Init { kind: "writer", name: name.to_string(), source }
            })?;
            Ok(Arc::new(writer))
        }
        _ => Err(RegistryError::Unknown { kind: "writer", name: name.to_string() }),
    }
}
