//! File-backed cache of derived values for one dataset directory.
//!
//! Every artifact is a file plus an optional in-memory copy. Whether an artifact is
//! present is always re-read from the file system, so the state tag cannot drift from
//! what other worker processes have written or deleted. The in-memory copy remembers the
//! stamp of the file it came from and is dropped when another process replaces the file.

use crate::error::AnalysisError;
use anyhow::{bail, Context, Error};
use log::{debug, info, warn};
use std::any::Any;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

mod artifact;
mod codec;

pub use artifact::{check_track_name, Artifact, DiffexpMode};
pub use codec::Codec;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArtifactState {
    Missing,
    Cached,
}

type Value = Arc<dyn Any + Send + Sync>;

/// Identity of one version of an artifact file. Saves replace the file by rename, so
/// on unix a new version always has a new inode even when the clock is too coarse to
/// tell two writes apart.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileStamp {
    modified: Option<SystemTime>,
    len: u64,
    inode: u64,
}

impl FileStamp {
    pub fn of(path: &Path) -> Option<FileStamp> {
        let meta = fs::metadata(path).ok()?;
        #[cfg(unix)]
        let inode = std::os::unix::fs::MetadataExt::ino(&meta);
        #[cfg(not(unix))]
        let inode = 0;
        Some(FileStamp {
            modified: meta.modified().ok(),
            len: meta.len(),
            inode,
        })
    }

    /// Short token for cache keys.
    pub fn token(&self) -> String {
        let nanos = self
            .modified
            .and_then(|t| t.duration_since(SystemTime::UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_nanos());
        format!("{}.{}.{}", nanos, self.len, self.inode)
    }
}

#[derive(Default)]
struct Slot {
    value: Option<(Value, FileStamp)>,
    computes: usize,
}

pub struct ArtifactStore {
    dir: PathBuf,
    slots: HashMap<Artifact, Slot>,
}

/// Write `path` by writing a temp file in the same directory and renaming it over the target.
pub fn write_atomic(path: &Path, write: impl FnOnce(&mut dyn Write) -> Result<(), Error>) -> Result<(), Error> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::format_err!("atomic write of {} missing parent", path.display()))?;
    fs::create_dir_all(parent).with_context(|| parent.display().to_string())?;
    let file_name = path.file_name().and_then(|s| s.to_str()).unwrap_or("file");
    let tmp = parent.join(format!(".{}.tmp.{}", file_name, std::process::id()));
    {
        let file = File::create(&tmp).with_context(|| tmp.display().to_string())?;
        let mut w = BufWriter::new(file);
        if let Err(e) = write(&mut w) {
            drop(w);
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        let file = w.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path).with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> ArtifactStore {
        ArtifactStore {
            dir: dir.into(),
            slots: HashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, artifact: &Artifact) -> PathBuf {
        self.dir.join(artifact.file_name())
    }

    /// Stamp of the artifact's file, `None` when absent.
    pub fn stamp(&self, artifact: &Artifact) -> Option<FileStamp> {
        FileStamp::of(&self.path(artifact))
    }

    /// Current state, refreshed from the file system. An artifact whose file has
    /// disappeared loses its in-memory copy.
    pub fn state(&mut self, artifact: &Artifact) -> ArtifactState {
        if self.path(artifact).exists() {
            ArtifactState::Cached
        } else {
            if let Some(slot) = self.slots.get_mut(artifact) {
                slot.value = None;
            }
            ArtifactState::Missing
        }
    }

    pub fn exists(&mut self, artifact: &Artifact) -> bool {
        self.state(artifact) == ArtifactState::Cached
    }

    /// Load a present artifact, from memory when the file has not changed since.
    pub fn load<T: Codec + Send + Sync + 'static>(&mut self, artifact: &Artifact) -> Result<Arc<T>, Error> {
        let path = self.path(artifact);
        let Some(stamp) = FileStamp::of(&path) else {
            if let Some(slot) = self.slots.get_mut(artifact) {
                slot.value = None;
            }
            bail!(AnalysisError::not_found(artifact.to_string()));
        };
        let slot = self.slots.entry(artifact.clone()).or_default();
        if let Some((value, seen)) = &slot.value {
            if *seen == stamp {
                if let Ok(v) = value.clone().downcast::<T>() {
                    return Ok(v);
                }
            } else {
                debug!("{} changed on disk, reloading", artifact);
            }
        }
        debug!("loading {} from {}", artifact, path.display());
        let v = Arc::new(T::read(&path).with_context(|| format!("loading {artifact}"))?);
        slot.value = Some((v.clone() as Value, stamp));
        Ok(v)
    }

    /// Persist a value and keep it in memory.
    pub fn save<T: Codec + Send + Sync + 'static>(&mut self, artifact: &Artifact, value: T) -> Result<Arc<T>, Error> {
        let path = self.path(artifact);
        write_atomic(&path, |w| value.write(w)).with_context(|| format!("saving {artifact}"))?;
        debug!("saved {} to {}", artifact, path.display());
        let v = Arc::new(value);
        let slot = self.slots.entry(artifact.clone()).or_default();
        slot.value = FileStamp::of(&path).map(|stamp| (v.clone() as Value, stamp));
        Ok(v)
    }

    /// Record that `artifact` was computed rather than loaded.
    pub fn note_compute(&mut self, artifact: &Artifact) {
        info!("computing {}", artifact);
        self.slots.entry(artifact.clone()).or_default().computes += 1;
    }

    /// Number of times `artifact` was computed by this store
    pub fn compute_count(&self, artifact: &Artifact) -> usize {
        self.slots.get(artifact).map_or(0, |s| s.computes)
    }

    /// Drop the in-memory copy only.
    pub fn invalidate(&mut self, artifact: &Artifact) {
        if let Some(slot) = self.slots.get_mut(artifact) {
            slot.value = None;
        }
    }

    /// Delete the file and the in-memory copy.
    pub fn remove(&mut self, artifact: &Artifact) -> Result<(), Error> {
        self.invalidate(artifact);
        let path = self.path(artifact);
        match fs::remove_file(&path) {
            Ok(()) => {
                info!("removed {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| path.display().to_string()),
        }
    }

    /// Per-track artifacts currently on disk.
    pub fn track_artifacts(&self) -> Result<Vec<Artifact>, Error> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir).with_context(|| self.dir.display().to_string())? {
            let entry = entry?;
            if let Some(a) = entry.file_name().to_str().and_then(Artifact::parse_file_name) {
                found.push(a);
            }
        }
        found.sort_by_key(Artifact::file_name);
        Ok(found)
    }

    /// Create an empty marker file.
    pub fn touch(&self, name: &str) -> Result<(), Error> {
        let path = self.dir.join(name);
        File::create(&path).with_context(|| path.display().to_string())?;
        Ok(())
    }

    /// Remove a non-artifact file if present.
    pub fn remove_file(&self, name: &str) {
        let path = self.dir.join(name);
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove {}: {}", path.display(), e);
            }
        }
    }
}
