//! File index and version history
//!
//! `FileIndex` keeps the latest known state of every path and is the only
//! writer of history; `HistoryLog` serves version lookups.

mod file;
mod history;

pub use file::{Decision, File, FileIndex, FileMetadata, Observation, VersionStamp};
pub use history::{ChangeKind, FileHistory, HistoryLog};

pub(crate) use history::check_consistency;

use crate::error::Result;
use crate::store::{keys, Store};
use std::collections::HashMap;

/// Which records a listing covers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    /// Every root
    All,
    /// One root
    Root(&'a str),
    /// One path within a root
    Path { root: &'a str, path: &'a str },
}

/// Memoized root existence check used to hide records of removed roots
pub(crate) fn root_is_live(
    store: &Store,
    cache: &mut HashMap<String, bool>,
    root: &str,
) -> Result<bool> {
    if let Some(live) = cache.get(root) {
        return Ok(*live);
    }
    let live = store.contains(&keys::root(root))?;
    cache.insert(root.to_string(), live);
    Ok(live)
}
