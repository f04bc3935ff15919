//! Diagnostic dump of rewritten units, before and after.
//!
//! Nothing depends on the dump; a unit that cannot be written is logged and skipped.

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{trace, warn};

/// Suffix of the file written for a unit whose repair failed.
pub const FAILED_SUFFIX: &str = "$FAILED";

/// Suffix of the file holding the input bytes of a rewritten unit.
pub const ORIGINAL_SUFFIX: &str = "$ORIGINAL";

/// Writes unit binaries below a directory, one file per internal name.
#[derive(Debug, Clone)]
pub struct DumpDir {
    root: PathBuf,
}

impl DumpDir {
    /// Dumps below `root`, which is created on first use.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DumpDir { root: root.into() }
    }

    /// The dump root.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the dump of `name` (internal form), with an optional suffix before `.class`.
    #[must_use]
    pub fn path_for(&self, name: &str, suffix: &str) -> PathBuf {
        let mut path = self.root.clone();
        // keep the dump inside the root whatever the name holds
        for part in name.split('/').filter(|part| !part.is_empty() && *part != "..") {
            path.push(part);
        }
        let file = path
            .file_name()
            .map(|file| format!("{}{}.class", file.to_string_lossy(), suffix))
            .unwrap_or_else(|| format!("unnamed{suffix}.class"));
        path.set_file_name(file);
        path
    }

    /// Writes the bytes of a successfully rewritten unit.
    pub fn rewritten(&self, name: &str, bytes: &[u8]) {
        self.write(&self.path_for(name, ""), bytes);
    }

    /// Writes the input bytes of a unit that was rewritten, next to its rewritten form.
    pub fn original(&self, name: &str, bytes: &[u8]) {
        self.write(&self.path_for(name, ORIGINAL_SUFFIX), bytes);
    }

    /// Writes the original bytes of a unit whose repair failed.
    pub fn failed(&self, name: &str, bytes: &[u8]) {
        self.write(&self.path_for(name, FAILED_SUFFIX), bytes);
    }

    fn write(&self, path: &Path, bytes: &[u8]) {
        let written = path
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|()| fs::write(path, bytes));
        match written {
            Ok(()) => trace!(path = %path.display(), "unit dumped"),
            Err(err) => warn!(path = %path.display(), error = %err, "unit dump failed"),
        }
    }
}
