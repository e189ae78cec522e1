//! Terminal progress reporting.
//!
//! The dispatcher reports through the [`ProgressSink`] trait so it stays
//! display-agnostic; the default implementation draws an indicatif bar on
//! stderr, one bar per file with batch-level granularity. Progress output is
//! informational only and never appears on stdout.

use std::sync::Mutex;
use std::time::Duration;

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

use crate::pipeline::fragment::FileId;

pub trait ProgressSink: Send + Sync {
    fn run_start(&self, concurrency: usize, provider: &str);
    fn file_start(&self, file_id: &FileId, batches: usize);
    fn file_progress(&self, done: usize, total: usize, errors: usize);
    fn file_finish(&self, ok: bool, elapsed: Duration);
    fn run_finish(&self, ok: bool, files: usize, elapsed: Duration);
}

/// Progress sink that draws nothing. Used when `--no-status` is set or
/// stderr is not a terminal.
pub struct SilentProgress;

impl ProgressSink for SilentProgress {
    fn run_start(&self, _concurrency: usize, _provider: &str) {}
    fn file_start(&self, _file_id: &FileId, _batches: usize) {}
    fn file_progress(&self, _done: usize, _total: usize, _errors: usize) {}
    fn file_finish(&self, _ok: bool, _elapsed: Duration) {}
    fn run_finish(&self, _ok: bool, _files: usize, _elapsed: Duration) {}
}

pub struct TerminalProgress {
    bar: Mutex<Option<ProgressBar>>,
}

impl TerminalProgress {
    pub fn new() -> Self {
        Self { bar: Mutex::new(None) }
    }

    fn make_bar(len: u64, file_id: &FileId) -> ProgressBar {
        let bar = ProgressBar::with_draw_target(Some(len), ProgressDrawTarget::stderr());
        bar.set_style(
            ProgressStyle::with_template(
                "{prefix:.bold} [{bar:30}] {pos}/{len} batches {msg}",
            )
            .expect("static progress template")
            .progress_chars("=> "),
        );
        bar.set_prefix(short_name(file_id.as_str()));
        bar
    }
}

impl Default for TerminalProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressSink for TerminalProgress {
    fn run_start(&self, concurrency: usize, provider: &str) {
        eprintln!("metaphrase: provider={provider} concurrency={concurrency}");
    }

    fn file_start(&self, file_id: &FileId, batches: usize) {
        let mut slot = self.bar.lock().expect("progress mutex poisoned");
        if let Some(old) = slot.take() {
            old.finish_and_clear();
        }
        *slot = Some(Self::make_bar(batches as u64, file_id));
    }

    fn file_progress(&self, done: usize, _total: usize, errors: usize) {
        let slot = self.bar.lock().expect("progress mutex poisoned");
        if let Some(bar) = slot.as_ref() {
            bar.set_position(done as u64);
            if errors > 0 {
                bar.set_message(format!("({errors} failed)"));
            }
        }
    }

    fn file_finish(&self, ok: bool, elapsed: Duration) {
        let mut slot = self.bar.lock().expect("progress mutex poisoned");
        if let Some(bar) = slot.take() {
            let status = if ok { "done" } else { "failed" };
            bar.finish_with_message(format!("{status} in {:.1}s", elapsed.as_secs_f64()));
        }
    }

    fn run_finish(&self, ok: bool, files: usize, elapsed: Duration) {
        let status = if ok { "completed" } else { "failed" };
        eprintln!(
            "metaphrase: {status}, {files} file(s) in {:.1}s",
            elapsed.as_secs_f64()
        );
    }
}

fn short_name(file_id: &str) -> String {
    let base = file_id.rsplit('/').next().unwrap_or(file_id);
    const MAX: usize = 32;
    if base.chars().count() <= MAX {
        base.to_string()
    } else {
        let tail: String = base
            .chars()
            .rev()
            .take(MAX - 1)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect();
        format!("…{tail}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_name_keeps_base_and_truncates() {
        assert_eq!(short_name("dir/sub/movie.srt"), "movie.srt");
        let long = format!("dir/{}.srt", "x".repeat(64));
        let shortened = short_name(&long);
        assert!(shortened.starts_with('…'));
        assert!(shortened.chars().count() <= 32);
    }
}
