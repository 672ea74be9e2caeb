//! Progress reporting for long-running pipeline stages.
//!
//! Computations take a `Progress` implementation and report the fraction of work done.
//! Sub-stages get a sub-snoop that maps their own `[0, 1]` range onto a slice of the parent's.

use log::warn;
use std::path::{Path, PathBuf};

pub trait Progress: Send + Sync {
    /// sets the fractional progress. fraction should be [0.0, 1.0]
    fn set_progress(&mut self, fraction: f64);

    /// creates a new snoop whose progress is limited to the fraction passed.
    /// fraction should be between [0.0, 1.0] and also not greater than the amount of progress remaining.
    fn get_subsnoop(&mut self, fraction: f64) -> Self;
}

#[derive(Default, Copy, Clone)]
pub struct NoOpSnoop;

impl Progress for NoOpSnoop {
    fn set_progress(&mut self, _frac: f64) {}

    fn get_subsnoop(&mut self, _fraction: f64) -> Self {
        *self
    }
}

/// Writes the overall fraction done to a file so other processes can poll it.
/// Sub-snoops write to the same file, rescaled into their parent's window.
#[derive(Debug, Clone)]
pub struct FileSnoop {
    path: PathBuf,
    start: f64,
    span: f64,
    done: f64,
}

impl FileSnoop {
    pub fn new(path: impl AsRef<Path>) -> Self {
        FileSnoop {
            path: path.as_ref().to_path_buf(),
            start: 0.0,
            span: 1.0,
            done: 0.0,
        }
    }

    /// Read back a fraction written by a `FileSnoop`, if any.
    pub fn read(path: impl AsRef<Path>) -> Option<f64> {
        std::fs::read_to_string(path).ok()?.trim().parse().ok()
    }

    fn write(&self) {
        let overall = (self.start + self.span * self.done).min(1.0);
        if let Err(e) = std::fs::write(&self.path, format!("{overall:.4}\n")) {
            warn!("could not write progress to {}: {}", self.path.display(), e);
        }
    }
}

impl Progress for FileSnoop {
    fn set_progress(&mut self, fraction: f64) {
        self.done = fraction.clamp(0.0, 1.0);
        self.write();
    }

    fn get_subsnoop(&mut self, fraction: f64) -> FileSnoop {
        let child = FileSnoop {
            path: self.path.clone(),
            start: self.start + self.span * self.done,
            span: self.span * fraction,
            done: 0.0,
        };
        self.done = (self.done + fraction).min(1.0);
        child
    }
}

#[cfg(test)]
pub mod test {
    use super::*;

    #[test]
    fn test_file_snoop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("progress.txt");
        assert_eq!(FileSnoop::read(&path), None);

        let mut snoop = FileSnoop::new(&path);
        snoop.set_progress(0.2);
        assert_eq!(FileSnoop::read(&path), Some(0.2));

        // the sub-stage covers [0.2, 0.7] of the overall range
        let mut sub = snoop.get_subsnoop(0.5);
        sub.set_progress(0.5);
        assert_eq!(FileSnoop::read(&path), Some(0.45));
        sub.set_progress(1.0);
        assert_eq!(FileSnoop::read(&path), Some(0.7));
    }
}
