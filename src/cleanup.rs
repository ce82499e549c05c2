//! Best-effort file housekeeping
//!
//! Absence of a file is never an error here.

use std::fs;
use std::io;
use std::path::Path;

use tracing::{debug, warn};

/// Remove one file; returns true if something was deleted
pub fn remove_artifact(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => {
            debug!("Removed {}", path.display());
            true
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!("Failed to remove {}: {}", path.display(), e);
            false
        }
    }
}

/// Remove the tool's known byproducts from `dir`; returns how many existed
pub fn remove_byproducts(dir: &Path, names: &[String]) -> usize {
    names
        .iter()
        .filter(|name| remove_artifact(&dir.join(name)))
        .count()
}
