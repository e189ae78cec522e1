//! Filesystem artifact writer.
//!
//! Streams artifact bytes to disk under a configured output root. The
//! default mode writes through a same-directory temp file and renames into
//! place, so readers never observe a partial artifact; an aborted stream
//! leaves nothing behind but the error. Artifact ids map to paths either
//! flattened to their base name (default) or with their directory structure
//! preserved, in which case absolute paths and parent escapes are rejected.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;

use crate::pipeline::error::{PipelineError, PipelineResult};
use crate::pipeline::fragment::ArtifactId;
use crate::services::context::{ByteStream, Writer};

const DEFAULT_BUF_SIZE: usize = 64 * 1024;
const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Options for the `fs` writer.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FsWriterOptions {
    pub output_dir: String,
    /// Write via temp file + rename. Defaults to true.
    #[serde(default)]
    pub atomic: Option<bool>,
    /// Keep only the artifact base name. Defaults to true.
    #[serde(default)]
    pub flat: Option<bool>,
    #[serde(default)]
    pub perm_file: Option<u32>,
    #[serde(default)]
    pub perm_dir: Option<u32>,
    #[serde(default)]
    pub buf_size: Option<usize>,
}

#[derive(Debug)]
pub struct FsWriter {
    root: PathBuf,
    atomic: bool,
    flat: bool,
    file_mode: u32,
    dir_mode: u32,
    buf_size: usize,
}

impl FsWriter {
    pub fn new(options: FsWriterOptions) -> PipelineResult<Self> {
        if options.output_dir.trim().is_empty() {
            return Err(PipelineError::invalid("fs writer requires output_dir"));
        }
        Ok(Self {
            root: PathBuf::from(options.output_dir),
            atomic: options.atomic.unwrap_or(true),
            flat: options.flat.unwrap_or(true),
            file_mode: options.perm_file.unwrap_or(DEFAULT_FILE_MODE),
            dir_mode: options.perm_dir.unwrap_or(DEFAULT_DIR_MODE),
            buf_size: match options.buf_size {
                Some(size) if size > 0 => size,
                _ => DEFAULT_BUF_SIZE,
            },
        })
    }

    fn map_path(&self, id: &ArtifactId) -> PipelineResult<PathBuf> {
        let rel = id.as_str();
        if self.flat {
            let base = rel.rsplit('/').next().unwrap_or("");
            if base.is_empty() || base == "." || base == ".." {
                return Err(PipelineError::PathInvalid(format!(
                    "artifact id {rel:?} has no usable file name"
                )));
            }
            return Ok(self.root.join(base));
        }
        let path = Path::new(rel);
        if path.is_absolute() {
            return Err(PipelineError::PathInvalid(format!(
                "artifact id {rel:?} is absolute"
            )));
        }
        let mut depth = 0i32;
        for component in path.components() {
            use std::path::Component;
            match component {
                Component::Normal(_) => depth += 1,
                Component::ParentDir => {
                    depth -= 1;
                    if depth < 0 {
                        return Err(PipelineError::PathInvalid(format!(
                            "artifact id {rel:?} escapes the output root"
                        )));
                    }
                }
                Component::CurDir => {}
                Component::RootDir | Component::Prefix(_) => {
                    return Err(PipelineError::PathInvalid(format!(
                        "artifact id {rel:?} is not a relative path"
                    )));
                }
            }
        }
        if depth == 0 {
            return Err(PipelineError::PathInvalid(format!(
                "artifact id {rel:?} resolves to nothing"
            )));
        }
        Ok(self.root.join(path))
    }

    async fn copy_stream(
        &self,
        ctx: &CancellationToken,
        file: tokio::fs::File,
        mut data: ByteStream,
    ) -> PipelineResult<tokio::fs::File> {
        let mut writer = BufWriter::with_capacity(self.buf_size, file);
        while let Some(chunk) = data.next().await {
            if ctx.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
        }
        writer.flush().await?;
        Ok(writer.into_inner())
    }

    #[cfg(unix)]
    fn open_options(&self) -> tokio::fs::OpenOptions {
        let mut opts = tokio::fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true).mode(self.file_mode);
        opts
    }

    #[cfg(not(unix))]
    fn open_options(&self) -> tokio::fs::OpenOptions {
        let mut opts = tokio::fs::OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        opts
    }

    async fn create_dirs(&self, dest: &Path) -> PipelineResult<()> {
        let Some(parent) = dest.parent() else {
            return Ok(());
        };
        let mut builder = std::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::DirBuilderExt;
            builder.mode(self.dir_mode);
        }
        builder.create(parent)?;
        Ok(())
    }

    async fn write_atomic(
        &self,
        ctx: &CancellationToken,
        dest: &Path,
        data: ByteStream,
    ) -> PipelineResult<()> {
        let parent = dest.parent().unwrap_or(Path::new(".")).to_path_buf();
        let tmp = parent.join(format!(
            ".tmp-{}-{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        let file = self.open_options().open(&tmp).await?;
        let result: PipelineResult<()> = async {
            let file = self.copy_stream(ctx, file, data).await?;
            file.sync_all().await?;
            Ok(())
        }
        .await;
        if let Err(err) = result {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err);
        }
        if let Err(err) = tokio::fs::rename(&tmp, dest).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        // Best-effort directory sync for crash safety.
        if let Ok(dir) = std::fs::File::open(&parent) {
            let _ = dir.sync_all();
        }
        Ok(())
    }

    async fn write_overwrite(
        &self,
        ctx: &CancellationToken,
        dest: &Path,
        data: ByteStream,
    ) -> PipelineResult<()> {
        let file = self.open_options().open(dest).await?;
        self.copy_stream(ctx, file, data).await?;
        Ok(())
    }
}

#[async_trait]
impl Writer for FsWriter {
    async fn write(
        &self,
        ctx: &CancellationToken,
        id: &ArtifactId,
        data: ByteStream,
    ) -> PipelineResult<()> {
        let dest = self.map_path(id)?;
        self.create_dirs(&dest).await?;
        if self.atomic {
            self.write_atomic(ctx, &dest, data).await
        } else {
            self.write_overwrite(ctx, &dest, data).await
        }
    }
}

/// Preflight writability probe: ensures the output directory exists (created
/// if missing) and that a file can be created inside it.
pub fn probe_output_dir(output_dir: &str) -> PipelineResult<()> {
    let root = Path::new(output_dir);
    std::fs::create_dir_all(root)?;
    let probe = root.join(format!(
        ".probe-{}-{}",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    std::fs::write(&probe, b"")?;
    std::fs::remove_file(&probe)?;
    Ok(())
}
