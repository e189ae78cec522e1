//! Run configuration.
//!
//! Config is strict JSON: unknown fields fail parsing at every level, so the
//! registry's option contracts hold from the top of the file down. Values
//! merge in precedence order defaults < file < environment < CLI flags;
//! optional fields model "not set" so later layers only override what they
//! actually carry.

mod assemble;
mod load;

pub use assemble::{Assembled, assemble, preflight_output_dir, validate};
pub use load::{env_overlay, load_dotenv, load_file, load_inline};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::services::gate::Limits;

pub const CONFIG_FILE_ENV: &str = "METAPHRASE_CONFIG_FILE";
pub const CONFIG_JSON_ENV: &str = "METAPHRASE_CONFIG_JSON";
pub const DEFAULT_CONFIG_FILE: &str = "config.json";

#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("config parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("config read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("config: {0}")]
    Invalid(String),
    #[error(transparent)]
    Registry(#[from] crate::registry::RegistryError),
    #[error("output directory not writable: {0}")]
    OutputDir(#[source] crate::pipeline::error::PipelineError),
}

/// Partial configuration as read from one source. All fields optional so
/// layers can be merged; [`Config::resolve`] applies defaults at the end.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub inputs: Vec<String>,
    pub concurrency: Option<usize>,
    pub max_tokens: Option<usize>,
    pub bytes_per_token: Option<usize>,
    pub max_retries: Option<usize>,
    pub logging: Logging,
    pub components: ComponentNames,
    /// Selected provider name (key into `provider`).
    pub llm: Option<String>,
    pub provider: BTreeMap<String, Provider>,
    pub options: ComponentOptions,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Logging {
    pub level: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComponentNames {
    pub reader: Option<String>,
    pub splitter: Option<String>,
    pub batcher: Option<String>,
    pub prompt_builder: Option<String>,
    pub decoder: Option<String>,
    pub assembler: Option<String>,
    pub writer: Option<String>,
}

/// Raw JSON option subtrees, passed to component factories untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ComponentOptions {
    pub reader: Option<serde_json::Value>,
    pub splitter: Option<serde_json::Value>,
    pub batcher: Option<serde_json::Value>,
    pub prompt_builder: Option<serde_json::Value>,
    pub decoder: Option<serde_json::Value>,
    pub assembler: Option<serde_json::Value>,
    pub writer: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Provider {
    pub client: String,
    pub options: Option<serde_json::Value>,
    pub limits: Limits,
}

impl Config {
    /// Overlays `other` on top of `self`: set fields win, unset fields keep
    /// the base value. Provider entries merge by name, `other` winning.
    pub fn overlay(mut self, other: Config) -> Config {
        if !other.inputs.is_empty() {
            self.inputs = other.inputs;
        }
        self.concurrency = other.concurrency.or(self.concurrency);
        self.max_tokens = other.max_tokens.or(self.max_tokens);
        self.bytes_per_token = other.bytes_per_token.or(self.bytes_per_token);
        self.max_retries = other.max_retries.or(self.max_retries);
        self.logging.level = other.logging.level.or(self.logging.level);
        self.llm = other.llm.or(self.llm);

        let names = &mut self.components;
        names.reader = other.components.reader.or(names.reader.take());
        names.splitter = other.components.splitter.or(names.splitter.take());
        names.batcher = other.components.batcher.or(names.batcher.take());
        names.prompt_builder = other.components.prompt_builder.or(names.prompt_builder.take());
        names.decoder = other.components.decoder.or(names.decoder.take());
        names.assembler = other.components.assembler.or(names.assembler.take());
        names.writer = other.components.writer.or(names.writer.take());

        let opts = &mut self.options;
        opts.reader = other.options.reader.or(opts.reader.take());
        opts.splitter = other.options.splitter.or(opts.splitter.take());
        opts.batcher = other.options.batcher.or(opts.batcher.take());
        opts.prompt_builder = other.options.prompt_builder.or(opts.prompt_builder.take());
        opts.decoder = other.options.decoder.or(opts.decoder.take());
        opts.assembler = other.options.assembler.or(opts.assembler.take());
        opts.writer = other.options.writer.or(opts.writer.take());

        for (name, provider) in other.provider {
            self.provider.insert(name, provider);
        }
        self
    }

    /// Applies defaults, producing the effective configuration.
    pub fn resolve(self) -> Effective {
        Effective {
            inputs: self.inputs,
            concurrency: self.concurrency.unwrap_or(4),
            max_tokens: self.max_tokens.unwrap_or(0),
            bytes_per_token: self.bytes_per_token.unwrap_or(0),
            max_retries: self.max_retries.unwrap_or(0),
            log_level: self.logging.level.unwrap_or_else(|| "info".to_string()),
            reader: self.components.reader.unwrap_or_else(|| "fs".to_string()),
            splitter: self.components.splitter.unwrap_or_else(|| "srt".to_string()),
            batcher: self.components.batcher.unwrap_or_else(|| "sliding".to_string()),
            prompt_builder: self
                .components
                .prompt_builder
                .unwrap_or_else(|| "translate".to_string()),
            decoder: self.components.decoder.unwrap_or_else(|| "srt_json".to_string()),
            assembler: self.components.assembler.unwrap_or_else(|| "linear".to_string()),
            writer: self.components.writer.unwrap_or_else(|| "fs".to_string()),
            llm: self.llm.unwrap_or_default(),
            provider: self.provider,
            options: self.options,
        }
    }
}

/// Fully-resolved configuration: every field has its effective value.
#[derive(Debug, Clone)]
pub struct Effective {
    pub inputs: Vec<String>,
    pub concurrency: usize,
    pub max_tokens: usize,
    pub bytes_per_token: usize,
    pub max_retries: usize,
    pub log_level: String,
    pub reader: String,
    pub splitter: String,
    pub batcher: String,
    pub prompt_builder: String,
    pub decoder: String,
    pub assembler: String,
    pub writer: String,
    pub llm: String,
    pub provider: BTreeMap<String, Provider>,
    pub options: ComponentOptions,
}

/// A runnable starter configuration: mock provider, modest budget, output
/// under `./out`. Written by `--init-config`.
pub fn template() -> Config {
    Config {
        inputs: vec!["-".to_string()],
        concurrency: Some(4),
        max_tokens: Some(2048),
        bytes_per_token: None,
        max_retries: Some(2),
        logging: Logging { level: Some("info".to_string()) },
        components: ComponentNames::default(),
        llm: Some("mock".to_string()),
        provider: BTreeMap::from([
            (
                "mock".to_string(),
                Provider {
                    client: "mock".to_string(),
                    options: Some(serde_json::json!({
                        "prefix": "",
                        "api_key": "",
                        "response_mode": "",
                    })),
                    limits: Limits { rpm: 60, tpm: 10_000, max_tokens_per_request: 4096 },
                },
            ),
            (
                "openai".to_string(),
                Provider {
                    client: "openai".to_string(),
                    options: Some(serde_json::json!({
                        "base_url": "",
                        "model": "",
                        "api_key_env": "OPENAI_API_KEY",
                        "api_key": "",
                        "timeout_seconds": 60,
                        "endpoint_path": "",
                        "disable_default_auth": false,
                        "extra_headers": {},
                    })),
                    limits: Limits::default(),
                },
            ),
        ]),
        options: ComponentOptions {
            batcher: Some(serde_json::json!({
                "context_radius": 1,
                "bytes_per_token": 4,
                "extra_bytes_per_record": 0,
            })),
            writer: Some(serde_json::json!({"output_dir": "out"})),
            ..ComponentOptions::default()
        },
    }
}
