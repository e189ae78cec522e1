//! Command-line surface.
//!
//! The binary has a single mode: translate the given roots. Flags override
//! the corresponding config fields; `--init-config` writes a starter
//! configuration instead of running.

use std::path::PathBuf;

use clap::{ArgAction, Parser};

use crate::config::Config;

#[derive(Debug, Default, Parser)]
#[command(
    name = "metaphrase",
    version,
    about = "Batch subtitle translation via LLM providers"
)]
pub struct Cli {
    /// Input files or directories; `-` reads stdin (not mixable with paths).
    pub roots: Vec<String>,

    /// Config file path (JSON). Defaults to ./config.json when present.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Provider name, overriding the config selection.
    #[arg(long, value_name = "NAME")]
    pub llm: Option<String>,

    /// Concurrent LLM workers per file.
    #[arg(long, value_name = "N")]
    pub concurrency: Option<usize>,

    /// Per-batch token budget, prompt overhead included.
    #[arg(long, value_name = "N")]
    pub max_tokens: Option<usize>,

    /// Extra attempts for retryable LLM/decode failures (0 = no retries).
    #[arg(long, value_name = "N")]
    pub max_retries: Option<usize>,

    /// Write a starter config.json and .env into DIR and exit.
    #[arg(long, value_name = "DIR", num_args = 0..=1, default_missing_value = ".")]
    pub init_config: Option<PathBuf>,

    /// Disable terminal progress output.
    #[arg(long)]
    pub no_status: bool,

    /// Increase logging verbosity (-v, -vv).
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    pub fn parse() -> Self {
        <Self as Parser>::parse()
    }

    /// Partial config carrying only the flags that were set.
    pub fn overlay(&self) -> Config {
        let mut config = Config::default();
        if !self.roots.is_empty() {
            config.inputs = self.roots.clone();
        }
        config.llm = self.llm.clone();
        config.concurrency = self.concurrency;
        config.max_tokens = self.max_tokens;
        config.max_retries = self.max_retries;
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn parses_roots_and_overrides() {
        let cli = Cli::try_parse_from([
            "metaphrase",
            "a.srt",
            "subs/",
            "--llm",
            "openai",
            "--max-tokens",
            "4096",
            "-vv",
        ])
        .expect("valid arguments");
        assert_eq!(cli.roots, vec!["a.srt".to_string(), "subs/".to_string()]);
        assert_eq!(cli.verbose, 2);

        let overlay = cli.overlay();
        assert_eq!(overlay.llm.as_deref(), Some("openai"));
        assert_eq!(overlay.max_tokens, Some(4096));
        assert_eq!(overlay.concurrency, None);
    }

    #[test]
    fn init_config_defaults_to_current_dir() {
        let cli = Cli::try_parse_from(["metaphrase", "--init-config"]).expect("valid arguments");
        assert_eq!(cli.init_config, Some(PathBuf::from(".")));

        let cli = Cli::try_parse_from(["metaphrase", "--init-config", "cfg"]).expect("valid");
        assert_eq!(cli.init_config, Some(PathBuf::from("cfg")));
    }

    #[test]
    fn unset_flags_leave_overlay_empty() {
        let cli = Cli::try_parse_from(["metaphrase", "a.srt"]).expect("valid arguments");
        let overlay = cli.overlay();
        assert!(overlay.llm.is_none());
        assert!(overlay.max_tokens.is_none());
        assert!(overlay.max_retries.is_none());
    }
}
