//! Filesystem and stdin input source.
//!
//! Walks the given roots in a stable order: within a directory,
//! subdirectories are descended first (lexicographically), then regular
//! files are yielded lexicographically. Symlinks are followed only when they
//! point at regular files; directory symlinks and special files are skipped
//! silently. File contents are streamed, never buffered whole.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::fragment::{FileId, normalize_file_id};
use crate::services::context::{ByteStream, FileStream, Reader};

const DEFAULT_BUF_SIZE: usize = 64 * 1024;

/// Options for the `fs` reader.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FsReaderOptions {
    /// Read buffer size in bytes; 0 uses the 64 KiB default.
    pub buf_size: usize,
    /// Directory base names skipped during recursion (case-insensitive),
    /// e.g. `[".git", "node_modules"]`. Does not affect single-file roots.
    pub exclude_dir_names: Vec<String>,
}

pub struct FsReader {
    buf_size: usize,
    exclude_dirs: BTreeSet<String>,
}

impl FsReader {
    pub fn new(options: FsReaderOptions) -> Self {
        let buf_size = if options.buf_size == 0 {
            DEFAULT_BUF_SIZE
        } else {
            options.buf_size
        };
        let exclude_dirs = options
            .exclude_dir_names
            .into_iter()
            .filter(|name| !name.is_empty())
            .map(|name| name.to_lowercase())
            .collect();
        Self { buf_size, exclude_dirs }
    }

    /// Collects the file paths under one root, in yield order.
    fn collect_root(&self, root: &str, out: &mut Vec<PathBuf>) -> PipelineResult<()> {
        let path = Path::new(root);
        let meta = std::fs::symlink_metadata(path)?;
        if meta.file_type().is_symlink() {
            let resolved = std::fs::metadata(path)?;
            if resolved.is_file() {
                out.push(path.to_path_buf());
            }
            return Ok(());
        }
        if meta.is_dir() {
            return self.collect_dir(path, out);
        }
        if meta.is_file() {
            out.push(path.to_path_buf());
        }
        Ok(())
    }

    fn collect_dir(&self, dir: &Path, out: &mut Vec<PathBuf>) -> PipelineResult<()> {
        let mut entries: Vec<_> = std::fs::read_dir(dir)?
            .collect::<Result<Vec<_>, _>>()?;
        entries.sort_by_key(|e| e.file_name());

        // Subdirectories first, then this directory's files.
        for entry in &entries {
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                let name = entry.file_name().to_string_lossy().to_lowercase();
                if self.exclude_dirs.contains(&name) {
                    continue;
                }
                self.collect_dir(&entry.path(), out)?;
            }
        }
        for entry in &entries {
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                continue;
            }
            let path = entry.path();
            if file_type.is_symlink() {
                match std::fs::metadata(&path) {
                    Ok(m) if m.is_file() => out.push(path),
                    Ok(_) => {}
                    Err(e) => return Err(e.into()),
                }
                continue;
            }
            if file_type.is_file() {
                out.push(path);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Reader for FsReader {
    async fn iterate(
        &self,
        ctx: &CancellationToken,
        roots: &[String],
    ) -> PipelineResult<FileStream> {
        let use_stdin = roots.is_empty() || (roots.len() == 1 && roots[0] == "-");
        if !use_stdin && roots.iter().any(|r| r == "-") {
            return Err(PipelineError::invalid(
                "stdin '-' cannot be mixed with other roots",
            ));
        }

        if use_stdin {
            let buf_size = self.buf_size;
            let ctx = ctx.clone();
            let stream = try_stream! {
                if ctx.is_cancelled() {
                    Err(PipelineError::Cancelled)?;
                }
                let stdin = tokio::io::stdin();
                let data: ByteStream = Box::pin(
                    ReaderStream::with_capacity(stdin, buf_size)
                        .map(|chunk| chunk.map_err(PipelineError::from)),
                );
                yield (FileId::from("stdin"), data);
            };
            return Ok(Box::pin(stream));
        }

        let mut paths = Vec::new();
        for root in roots {
            self.collect_root(root, &mut paths)?;
        }

        let buf_size = self.buf_size;
        let ctx = ctx.clone();
        let stream = try_stream! {
            for path in paths {
                if ctx.is_cancelled() {
                    Err(PipelineError::Cancelled)?;
                }
                let file = tokio::fs::File::open(&path).await?;
                let data: ByteStream = Box::pin(
                    ReaderStream::with_capacity(file, buf_size)
                        .map(|chunk| chunk.map_err(PipelineError::from)),
                );
                yield (normalize_file_id(&path.to_string_lossy()), data);
            }
        };
        Ok(Box::pin(stream))
    }
}
