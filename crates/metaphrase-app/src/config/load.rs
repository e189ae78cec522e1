//! Configuration sources: file, inline JSON, environment overlay, `.env`.

use std::path::Path;

use super::{AppConfigError, Config};

/// Parses a config file (strict JSON).
pub fn load_file(path: &Path) -> Result<Config, AppConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| AppConfigError::Read {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&raw)?)
}

/// Parses inline config JSON (the `METAPHRASE_CONFIG_JSON` escape hatch).
pub fn load_inline(raw: &str) -> Result<Config, AppConfigError> {
    Ok(serde_json::from_str(raw)?)
}

/// Builds a partial config from `METAPHRASE_*` environment variables.
pub fn env_overlay() -> Result<Config, AppConfigError> {
    let mut config = Config::default();
    if let Ok(llm) = std::env::var("METAPHRASE_LLM") {
        if !llm.is_empty() {
            config.llm = Some(llm);
        }
    }
    config.concurrency = parse_env_usize("METAPHRASE_CONCURRENCY")?;
    config.max_tokens = parse_env_usize("METAPHRASE_MAX_TOKENS")?;
    config.max_retries = parse_env_usize("METAPHRASE_MAX_RETRIES")?;
    if let Ok(level) = std::env::var("METAPHRASE_LOG_LEVEL") {
        if !level.is_empty() {
            config.logging.level = Some(level);
        }
    }
    Ok(config)
}

fn parse_env_usize(name: &str) -> Result<Option<usize>, AppConfigError> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => value.parse().map(Some).map_err(|_| {
            AppConfigError::Invalid(format!("{name} must be a non-negative integer, got {value:?}"))
        }),
        _ => Ok(None),
    }
}

/// Loads `KEY=value` pairs from a `.env` file into the process environment
/// without overriding variables that are already set. Missing files are
/// fine; blank lines, `#` comments and an `export ` prefix are accepted, and
/// single- or double-quoted values are unwrapped (with `\n`, `\t`, `\\`,
/// `\"` handled inside double quotes).
pub fn load_dotenv(path: &Path) -> Result<(), AppConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(AppConfigError::Read { path: path.display().to_string(), source });
        }
    };
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() || std::env::var_os(key).is_some() {
            continue;
        }
        let value = unquote(value.trim());
        // SAFETY: called from main before the runtime spawns any threads.
        unsafe { std::env::set_var(key, value) };
    }
    Ok(())
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 && bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'' {
        return value[1..value.len() - 1].to_string();
    }
    if bytes.len() >= 2 && bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"' {
        let inner = &value[1..value.len() - 1];
        let mut out = String::with_capacity(inner.len());
        let mut chars = inner.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                out.push(c);
                continue;
            }
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('\\') => out.push('\\'),
                Some('"') => out.push('"'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        }
        return out;
    }
    value.to_string()
}
