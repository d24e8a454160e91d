//! `logrotate`: size-based rotation of `*.log` files.
//!
//! `app.log` larger than `max_size_bytes` becomes `app.log.1`, the previous
//! `app.log.1` becomes `app.log.2` and so on; generations beyond `keep` are
//! removed and a fresh empty `app.log` is left in place.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sitewarden_scheduler::{Handler, HandlerResult, JobContext, Status};
use tracing::info;

use crate::{
    error::Result,
    params::{str_param, u64_param},
};

pub const DEFAULT_MAX_SIZE_BYTES: u64 = 1024 * 1024;
pub const DEFAULT_KEEP: u64 = 5;

pub struct LogRotate {
    default_directory: PathBuf,
}

impl LogRotate {
    pub fn new(default_directory: impl Into<PathBuf>) -> Self {
        Self {
            default_directory: default_directory.into(),
        }
    }
}

#[async_trait]
impl Handler for LogRotate {
    async fn run(&self, ctx: &mut JobContext<'_>) -> HandlerResult {
        let params = ctx.params();
        let dir = str_param(params, "directory")?
            .map(PathBuf::from)
            .unwrap_or_else(|| self.default_directory.clone());
        let max_size = u64_param(params, "max_size_bytes", DEFAULT_MAX_SIZE_BYTES)?;
        let keep = u64_param(params, "keep", DEFAULT_KEEP)?.max(1);

        if !dir.is_dir() {
            ctx.progress(&format!("{} does not exist; nothing to rotate", dir.display()));
            return Status::Ok.exit();
        }

        let rotated = rotate_dir(&dir, max_size, keep)?;
        for path in &rotated {
            ctx.progress(&format!("rotated {}", path.display()));
        }
        info!(parent: &ctx.span, directory = %dir.display(), rotated = rotated.len(), "log rotation done");
        Status::Ok.exit()
    }
}

/// Rotate every oversized `*.log` directly inside `dir`.
pub fn rotate_dir(dir: &Path, max_size: u64, keep: u64) -> Result<Vec<PathBuf>> {
    let mut rotated = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() || meta.len() <= max_size {
            continue;
        }
        rotate_file(&path, keep)?;
        rotated.push(path);
    }
    rotated.sort();
    Ok(rotated)
}

fn rotate_file(path: &Path, keep: u64) -> Result<()> {
    let generation = |n: u64| {
        let mut name = path.as_os_str().to_owned();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    };

    let oldest = generation(keep);
    if oldest.exists() {
        std::fs::remove_file(&oldest)?;
    }
    for n in (1..keep).rev() {
        let from = generation(n);
        if from.exists() {
            std::fs::rename(&from, generation(n + 1))?;
        }
    }
    std::fs::rename(path, generation(1))?;
    std::fs::File::create(path)?;
    Ok(())
}
