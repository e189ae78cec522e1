use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::fmt;

use metaphrase_app::AppError;
use metaphrase_app::cli::Cli;
use metaphrase_app::config::{
    self, CONFIG_FILE_ENV, CONFIG_JSON_ENV, Config, DEFAULT_CONFIG_FILE,
};
use metaphrase_app::error::EXIT_CONFIG;
use metaphrase_app::services::dispatcher;
use metaphrase_app::services::metrics;
use metaphrase_app::services::progress::{ProgressSink, SilentProgress, TerminalProgress};

fn main() {
    let cli = Cli::parse();
    // .env before any other environment read; never overrides real env.
    if let Err(err) = config::load_dotenv(Path::new(".env")) {
        eprintln!("warning: .env not loaded: {err}");
    }

    if let Some(dir) = cli.init_config.clone() {
        match write_templates(&dir) {
            Ok(()) => process::exit(0),
            Err(err) => {
                eprintln!("init-config failed: {err}");
                process::exit(EXIT_CONFIG);
            }
        }
    }

    let effective = match resolve_config(&cli) {
        Ok(effective) => effective,
        Err(err) => {
            eprintln!("configuration invalid: {err}");
            process::exit(err.exit_code());
        }
    };

    init_tracing(cli.verbose, &effective.log_level);

    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let code = runtime.block_on(run(&cli, effective));
    process::exit(code);
}

fn init_tracing(verbosity: u8, configured_level: &str) {
    let level = match verbosity {
        0 => configured_level.parse().unwrap_or(LevelFilter::INFO),
        1 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    let subscriber = fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::warn!("tracing subscriber already set; keeping the existing one");
    }
}

fn resolve_config(cli: &Cli) -> Result<config::Effective, AppError> {
    let mut merged = Config::default();

    let mut file = cli.config.clone();
    if file.is_none() {
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            if !path.is_empty() {
                file = Some(PathBuf::from(path));
            }
        }
    }
    if file.is_none() && Path::new(DEFAULT_CONFIG_FILE).is_file() {
        file = Some(PathBuf::from(DEFAULT_CONFIG_FILE));
    }
    if let Some(path) = file {
        merged = merged.overlay(config::load_file(&path)?);
    } else if let Ok(raw) = std::env::var(CONFIG_JSON_ENV) {
        if !raw.is_empty() {
            merged = merged.overlay(config::load_inline(&raw)?);
        }
    }

    merged = merged.overlay(config::env_overlay()?);
    merged = merged.overlay(cli.overlay());

    let effective = merged.resolve();
    config::validate(&effective)?;
    config::preflight_output_dir(&effective)?;
    Ok(effective)
}

async fn run(cli: &Cli, effective: config::Effective) -> i32 {
    let assembled = match config::assemble(&effective) {
        Ok(assembled) => assembled,
        Err(err) => {
            eprintln!("assembly failed: {err}");
            return AppError::from(err).exit_code();
        }
    };

    let progress: Arc<dyn ProgressSink> = if show_status(cli) {
        Arc::new(TerminalProgress::new())
    } else {
        Arc::new(SilentProgress)
    };
    progress.run_start(effective.concurrency, &effective.llm);
    tracing::debug!(
        inputs = effective.inputs.len(),
        concurrency = effective.concurrency,
        max_tokens = effective.max_tokens,
        max_retries = effective.max_retries,
        llm = %effective.llm,
        "effective configuration"
    );

    let root = CancellationToken::new();
    {
        let root = root.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, cancelling");
                root.cancel();
            }
        });
    }

    let started = Instant::now();
    let result = dispatcher::run(
        &root,
        &assembled.components,
        &assembled.settings,
        Arc::clone(&progress),
    )
    .await;
    metrics::log_summary();

    match result {
        Ok(()) => {
            progress.run_finish(true, effective.inputs.len(), started.elapsed());
            0
        }
        Err(err) => {
            if !matches!(err.code(), metaphrase_app::pipeline::ErrorCode::Cancel) {
                eprintln!("run failed: {err}");
            }
            progress.run_finish(false, effective.inputs.len(), started.elapsed());
            AppError::from(err).exit_code()
        }
    }
}

fn show_status(cli: &Cli) -> bool {
    if cli.no_status || std::env::var_os("CI").is_some() {
        return false;
    }
    use std::io::IsTerminal;
    std::io::stderr().is_terminal()
}

/// Writes config.json and .env templates into `dir`, refusing to overwrite.
fn write_templates(dir: &Path) -> Result<(), AppError> {
    std::fs::create_dir_all(dir).map_err(|source| AppError::Io {
        path: dir.display().to_string(),
        source,
    })?;

    let config_path = dir.join(DEFAULT_CONFIG_FILE);
    let rendered = serde_json::to_string_pretty(&config::template())
        .expect("template config serializes");
    write_new(&config_path, format!("{rendered}\n").as_bytes())?;

    let env_path = dir.join(".env");
    if let Err(err) = write_new(&env_path, ENV_TEMPLATE.as_bytes()) {
        // The .env template is a convenience; losing it is not fatal.
        eprintln!("note: .env template skipped: {err}");
    }
    eprintln!("wrote {}", config_path.display());
    Ok(())
}

fn write_new(path: &Path, content: &[u8]) -> Result<(), AppError> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|source| AppError::Io { path: path.display().to_string(), source })?;
    file.write_all(content).map_err(|source| AppError::Io {
        path: path.display().to_string(),
        source,
    })
}

const ENV_TEMPLATE: &str = "\
# metaphrase environment\n\
# OPENAI_API_KEY=sk-...\n\
# METAPHRASE_LLM=openai\n\
# METAPHRASE_CONCURRENCY=4\n\
# METAPHRASE_MAX_TOKENS=4096\n\
# METAPHRASE_LOG_LEVEL=info\n\
";
