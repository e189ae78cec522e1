//! Preflight validation and component assembly.
//!
//! Everything that can be checked before the pipeline starts is checked
//! here: input shape, budget bounds, provider resolution, registry names,
//! the per-request token cap, and writability of the filesystem writer's
//! output directory.

use std::collections::HashMap;
use std::sync::Arc;

use super::{AppConfigError, Effective};
use crate::registry;
use crate::services::context::{Components, Settings};
use crate::services::gate::{LimitKey, RateGate, derive_limit_key};
use crate::services::writer::probe_output_dir;

/// Static checks over the effective configuration.
pub fn validate(cfg: &Effective) -> Result<(), AppConfigError> {
    if cfg.inputs.is_empty() {
        return Err(AppConfigError::Invalid("inputs must not be empty".to_string()));
    }
    let mut has_stdin = false;
    for input in &cfg.inputs {
        if input.trim().is_empty() {
            return Err(AppConfigError::Invalid("input paths must not be empty".to_string()));
        }
        if input.trim() == "-" {
            has_stdin = true;
        }
    }
    if has_stdin && cfg.inputs.len() > 1 {
        return Err(AppConfigError::Invalid(
            "stdin '-' cannot be mixed with other inputs".to_string(),
        ));
    }
    if cfg.concurrency == 0 {
        return Err(AppConfigError::Invalid("concurrency must be >= 1".to_string()));
    }
    if cfg.max_tokens == 0 {
        return Err(AppConfigError::Invalid("max_tokens must be > 0".to_string()));
    }
    if cfg.llm.is_empty() {
        return Err(AppConfigError::Invalid("llm provider not selected".to_string()));
    }
    let Some(provider) = cfg.provider.get(&cfg.llm) else {
        return Err(AppConfigError::Invalid(format!("provider {:?} not found", cfg.llm)));
    };
    if provider.client.is_empty() {
        return Err(AppConfigError::Invalid(format!(
            "provider {:?} is missing a client",
            cfg.llm
        )));
    }
    let cap = provider.limits.max_tokens_per_request;
    if cap > 0 && cfg.max_tokens > cap {
        return Err(AppConfigError::Invalid(format!(
            "max_tokens ({}) exceeds the provider per-request cap ({cap})",
            cfg.max_tokens
        )));
    }

    let checks: [(&str, &str, fn(&str) -> bool); 8] = [
        ("reader", cfg.reader.as_str(), registry::has_reader),
        ("splitter", cfg.splitter.as_str(), registry::has_splitter),
        ("batcher", cfg.batcher.as_str(), registry::has_batcher),
        ("prompt_builder", cfg.prompt_builder.as_str(), registry::has_prompt_builder),
        ("decoder", cfg.decoder.as_str(), registry::has_decoder),
        ("assembler", cfg.assembler.as_str(), registry::has_assembler),
        ("writer", cfg.writer.as_str(), registry::has_writer),
        ("llm client", provider.client.as_str(), registry::has_llm_client),
    ];
    for (kind, name, known) in checks {
        if !known(name) {
            return Err(AppConfigError::Invalid(format!("{kind} {name:?} is not registered")));
        }
    }
    Ok(())
}

/// Probes the filesystem writer's output directory for writability before
/// the pipeline starts. No-op for other writers.
pub fn preflight_output_dir(cfg: &Effective) -> Result<(), AppConfigError> {
    if cfg.writer != "fs" {
        return Ok(());
    }
    let output_dir = cfg
        .options
        .writer
        .as_ref()
        .and_then(|opts| opts.get("output_dir"))
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if output_dir.trim().is_empty() {
        return Err(AppConfigError::Invalid(
            "fs writer requires options.writer.output_dir".to_string(),
        ));
    }
    probe_output_dir(output_dir).map_err(AppConfigError::OutputDir)
}

pub struct Assembled {
    pub components: Components,
    pub settings: Settings,
}

/// Builds every component instance and the rate gate from the effective
/// configuration. Assumes [`validate`] has passed.
pub fn assemble(cfg: &Effective) -> Result<Assembled, AppConfigError> {
    validate(cfg)?;
    let provider = &cfg.provider[&cfg.llm];

    let components = Components {
        reader: registry::build_reader(&cfg.reader, cfg.options.reader.as_ref())?,
        splitter: registry::build_splitter(&cfg.splitter, cfg.options.splitter.as_ref())?,
        batcher: registry::build_batcher(&cfg.batcher, cfg.options.batcher.as_ref())?,
        prompt_builder: registry::build_prompt_builder(
            &cfg.prompt_builder,
            cfg.options.prompt_builder.as_ref(),
        )?,
        llm: registry::build_llm_client(&provider.client, provider.options.as_ref())?,
        decoder: registry::build_decoder(&cfg.decoder, cfg.options.decoder.as_ref())?,
        assembler: registry::build_assembler(&cfg.assembler, cfg.options.assembler.as_ref())?,
        writer: registry::build_writer(&cfg.writer, cfg.options.writer.as_ref())?,
    };

    // Group rate limits by provider identity; fall back to the provider
    // name when no api key is available to hash.
    let gate_key = derive_limit_key(&provider.client, provider.options.as_ref())
        .unwrap_or_else(|_| LimitKey::new(cfg.llm.clone()));
    let gate = if provider.limits.is_unlimited() {
        None
    } else {
        let mut limits = HashMap::new();
        limits.insert(gate_key.clone(), provider.limits);
        Some(Arc::new(RateGate::new(limits)))
    };

    let settings = Settings {
        inputs: cfg.inputs.clone(),
        concurrency: cfg.concurrency,
        max_tokens: cfg.max_tokens,
        bytes_per_token: cfg.bytes_per_token,
        max_retries: cfg.max_retries,
        gate,
        gate_key,
    };
    Ok(Assembled { components, settings })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, template};

    fn valid_cfg() -> Effective {
        let mut cfg = template();
        cfg.inputs = vec!["movie.srt".to_string()];
        cfg.resolve()
    }

    #[test]
    fn template_with_inputs_validates() {
        validate(&valid_cfg()).expect("template config must validate");
    }

    #[test]
    fn rejects_bad_shapes() {
        let mut cfg = valid_cfg();
        cfg.inputs.clear();
        assert!(validate(&cfg).is_err());

        let mut cfg = valid_cfg();
        cfg.inputs = vec!["a.srt".to_string(), " ".to_string()];
        assert!(validate(&cfg).is_err());

        let mut cfg = valid_cfg();
        cfg.inputs = vec!["-".to_string(), "a.srt".to_string()];
        assert!(validate(&cfg).is_err());

        let mut cfg = valid_cfg();
        cfg.concurrency = 0;
        assert!(validate(&cfg).is_err());

        let mut cfg = valid_cfg();
        cfg.max_tokens = 0;
        assert!(validate(&cfg).is_err());

        let mut cfg = valid_cfg();
        cfg.llm = "missing".to_string();
        assert!(validate(&cfg).is_err());

        let mut cfg = valid_cfg();
        cfg.decoder = "xml".to_string();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn per_request_cap_bounds_max_tokens() {
        let mut cfg = valid_cfg();
        // template mock provider caps requests at 4096 tokens
        cfg.max_tokens = 4096;
        validate(&cfg).expect("exactly at the cap is allowed");
        cfg.max_tokens = 4097;
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn assemble_builds_gate_from_provider_limits() {
        let assembled = assemble(&valid_cfg()).expect("assembles");
        assert!(assembled.settings.gate.is_some());
        assert!(assembled.settings.gate_key.as_str().starts_with("mock:"));
        assert_eq!(assembled.settings.concurrency, 4);
    }

    #[test]
    fn unlimited_provider_gets_no_gate() {
        let mut base = template();
        base.provider.get_mut("mock").expect("mock provider").limits =
            crate::services::gate::Limits::default();
        base.inputs = vec!["movie.srt".to_string()];
        let assembled = assemble(&base.resolve()).expect("assembles");
        assert!(assembled.settings.gate.is_none());
    }

    #[test]
    fn preflight_creates_and_probes_output_dir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("deep/out");
        let mut base = template();
        base.inputs = vec!["movie.srt".to_string()];
        base.options.writer =
            Some(serde_json::json!({"output_dir": out.to_string_lossy()}));
        preflight_output_dir(&base.resolve()).expect("probe passes");
        assert!(out.is_dir());
    }

    #[test]
    fn preflight_requires_output_dir_for_fs_writer() {
        let mut base: Config = template();
        base.inputs = vec!["movie.srt".to_string()];
        base.options.writer = None;
        assert!(preflight_output_dir(&base.resolve()).is_err());
    }
}
