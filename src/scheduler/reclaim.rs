// src/scheduler/reclaim.rs: sparse reclamation of finished artifacts.
// The execution cache treats unchanged size+timestamp as "output still
// valid", so the hole-punch must be invisible: reported length and both
// timestamps are restored exactly.

use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use filetime::FileTime;
use log::{debug, info};

use crate::config::defs::{ArtifactClass, PublishPolicy};

/// A fired refcount asking for its artifact's storage back.
#[derive(Debug, Clone)]
pub struct ReclaimRequest {
    pub sample_id: String,
    pub class: ArtifactClass,
    pub path: PathBuf,
}

/// Truncates `path` to zero real bytes while keeping it addressable at
/// its original reported size, then restores atime/mtime.
pub fn reclaim(path: &Path) -> Result<()> {
    let meta = fs::metadata(path)
        .map_err(|e| anyhow!("Cannot stat {} for reclaim: {}", path.display(), e))?;
    let len = meta.len();
    let atime = FileTime::from_last_access_time(&meta);
    let mtime = FileTime::from_last_modification_time(&meta);

    {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(0)?;
        file.set_len(len)?;
    }
    filetime::set_file_times(path, atime, mtime)?;

    info!("Reclaimed {} ({} bytes now sparse)", path.display(), len);
    Ok(())
}

/// Applies the publish policy before reclaiming. A retained class makes
/// this a no-op.
pub fn execute(req: &ReclaimRequest, publish: &PublishPolicy) -> Result<()> {
    if publish.retains(req.class) {
        debug!(
            "Retaining {} {} for {} (publish policy)",
            req.class,
            req.path.display(),
            req.sample_id
        );
        return Ok(());
    }
    reclaim(&req.path)
}
