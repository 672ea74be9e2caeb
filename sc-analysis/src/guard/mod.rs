//! Protection against duplicate expensive work: an in-process memo cache shared by
//! request handlers, and lock files shared by worker processes.

mod lockfile;
mod memo;

pub use lockfile::{LockFile, LockHeartbeat};
pub use memo::{MemoCache, MemoKey};

/// Lock file name guarding the first diffexp computation of a color track
pub fn diffexp_lock_name(track: &str) -> String {
    format!("{track}_writing_diffexp")
}
