// src/scheduler/queue.rs: the filesystem-backed sample queue

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use log::{debug, info};

use crate::config::defs::{ADMITTED_DIR, DONE_DIR, QUEUE_LOCK_FILE, RECORD_EXT, STAGED_DIR};
use crate::utils::file::{parse_quoted_fields, quote_fields};

pub const MULTI_FILE_JOIN: &str = "::";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

impl Origin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Origin::Local => "local",
            Origin::Remote => "remote",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(Origin::Local),
            "remote" => Ok(Origin::Remote),
            other => Err(anyhow!("Unknown origin: {}", other)),
        }
    }
}

/// One sample's identity and payload. Immutable once written to the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleDescriptor {
    pub sample_id: String,
    pub origin: Origin,
    /// Local: `::`-joined FASTQ paths. Remote: space-delimited run accessions.
    pub payload: String,
}

impl SampleDescriptor {
    pub fn local(sample_id: String, paths: Vec<PathBuf>) -> Self {
        let payload = paths
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(MULTI_FILE_JOIN);
        SampleDescriptor {
            sample_id,
            origin: Origin::Local,
            payload,
        }
    }

    pub fn remote(sample_id: String, runs: Vec<String>) -> Self {
        SampleDescriptor {
            sample_id,
            origin: Origin::Remote,
            payload: runs.join(" "),
        }
    }

    pub fn local_paths(&self) -> Vec<PathBuf> {
        self.payload
            .split(MULTI_FILE_JOIN)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect()
    }

    pub fn run_ids(&self) -> Vec<String> {
        self.payload
            .split_whitespace()
            .map(|s| s.to_string())
            .collect()
    }

    /// Serializes to the three-quoted-field record line.
    pub fn to_record(&self) -> String {
        quote_fields(&[&self.sample_id, &self.payload, self.origin.as_str()])
    }

    pub fn from_record(line: &str) -> Result<Self> {
        let fields = parse_quoted_fields(line)?;
        if fields.len() != 3 {
            return Err(anyhow!(
                "Malformed sample record ({} fields, expected 3): {}",
                fields.len(),
                line
            ));
        }
        Ok(SampleDescriptor {
            sample_id: fields[0].clone(),
            origin: Origin::parse(&fields[2])?,
            payload: fields[1].clone(),
        })
    }
}

/// The three queue locations plus the lock, rooted under `<workdir>/queue`.
/// Records move between locations by rename; a sample_id exists in at most
/// one location at any time.
#[derive(Debug, Clone)]
pub struct SampleQueue {
    root: PathBuf,
}

impl SampleQueue {
    /// Opens (creating if needed) the queue layout under `work_dir`.
    ///
    /// # Arguments
    ///
    /// * `work_dir` - Run-scoped working area.
    ///
    /// # Returns
    /// SampleQueue rooted at `<work_dir>/queue`.
    pub fn open(work_dir: &Path) -> Result<Self> {
        let root = work_dir.join("queue");
        for dir in [STAGED_DIR, ADMITTED_DIR, DONE_DIR] {
            fs::create_dir_all(root.join(dir))?;
        }
        Ok(SampleQueue { root })
    }

    pub fn staged_dir(&self) -> PathBuf {
        self.root.join(STAGED_DIR)
    }

    pub fn admitted_dir(&self) -> PathBuf {
        self.root.join(ADMITTED_DIR)
    }

    pub fn done_dir(&self) -> PathBuf {
        self.root.join(DONE_DIR)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join(QUEUE_LOCK_FILE)
    }

    fn record_name(sample_id: &str) -> String {
        format!("{}.{}", sample_id, RECORD_EXT)
    }

    /// Persists a descriptor into `staged`. Silently dropped when the
    /// sample_id is skip-listed or a record for it already exists in any
    /// location (a restart re-enumerates; finished work must not re-stage).
    /// Concurrent writes for distinct sample_ids touch distinct files only.
    ///
    /// # Returns
    /// true if the record was written, false if dropped.
    pub fn write(&self, desc: &SampleDescriptor, skip: &HashSet<String>) -> Result<bool> {
        if skip.contains(&desc.sample_id) {
            debug!("Sample {} is skip-listed; not staging", desc.sample_id);
            return Ok(false);
        }
        if self.location_of(&desc.sample_id).is_some() {
            debug!("Sample {} already queued; not staging", desc.sample_id);
            return Ok(false);
        }
        let path = self.staged_dir().join(Self::record_name(&desc.sample_id));
        fs::write(&path, format!("{}\n", desc.to_record()))?;
        Ok(true)
    }

    /// Which location currently holds a record for `sample_id`, if any.
    pub fn location_of(&self, sample_id: &str) -> Option<&'static str> {
        let name = Self::record_name(sample_id);
        for dir in [STAGED_DIR, ADMITTED_DIR, DONE_DIR] {
            if self.root.join(dir).join(&name).exists() {
                return Some(dir);
            }
        }
        None
    }

    fn list_records(&self, dir: &Path) -> Result<Vec<(String, PathBuf)>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT) {
                entries.push((entry.file_name().to_string_lossy().into_owned(), path));
            }
        }
        // Lexicographic by persisted name: the stable admission order.
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }

    pub fn read_record(path: &Path) -> Result<SampleDescriptor> {
        let line = fs::read_to_string(path)?;
        SampleDescriptor::from_record(line.trim_end())
    }

    /// Staged descriptors in deterministic (lexicographic) order.
    pub fn list_staged(&self) -> Result<Vec<SampleDescriptor>> {
        self.list_records(&self.staged_dir())?
            .into_iter()
            .map(|(_, path)| Self::read_record(&path))
            .collect()
    }

    pub fn list_names(&self, dir: &Path) -> Result<Vec<String>> {
        Ok(self
            .list_records(dir)?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    pub fn staged_count(&self) -> Result<usize> {
        Ok(self.list_records(&self.staged_dir())?.len())
    }

    pub fn admitted_count(&self) -> Result<usize> {
        Ok(self.list_records(&self.admitted_dir())?.len())
    }

    pub fn done_count(&self) -> Result<usize> {
        Ok(self.list_records(&self.done_dir())?.len())
    }

    /// Moves one record between locations by rename. The rename is the
    /// transition: no record is created or destroyed.
    pub fn transition(&self, sample_id: &str, from: &str, to: &str) -> Result<()> {
        let name = Self::record_name(sample_id);
        let src = self.root.join(from).join(&name);
        let dst = self.root.join(to).join(&name);
        fs::rename(&src, &dst)
            .map_err(|e| anyhow!("Failed to move {} from {} to {}: {}", sample_id, from, to, e))?;
        debug!("Queue transition: {} {} -> {}", sample_id, from, to);
        Ok(())
    }
}

/// Loads the newline-delimited skip list, empty set when no path is given.
pub fn load_skip_list(path: Option<&Path>) -> Result<HashSet<String>> {
    let mut skip = HashSet::new();
    if let Some(path) = path {
        for line in fs::read_to_string(path)?.lines() {
            let id = line.trim();
            if !id.is_empty() {
                skip.insert(id.to_string());
            }
        }
        info!("Loaded {} skip-listed samples from {}", skip.len(), path.display());
    }
    Ok(skip)
}
