//! Spool files and their consolidation
//!
//! Layout under the spool root:
//!
//! ```text
//! <root>/<operation>/<entity>.spool          one per (operation, entity)
//! <root>/<operation>/<entity>.spool.partial  while the extraction is running
//! <root>/<operation>.txt                     final output after consolidation
//! <root>/.consumed/<operation>/<entity>.spool marker: merged, but not deleted
//! ```
//!
//! A spool that was merged but could not be deleted gets a marker so later
//! consolidations skip it. The marker goes away once the spool is finally
//! removed, or when the next extraction for the same pair starts.

/// Merging spools into final outputs
pub mod consolidate;
/// Staged writes of a single spool
pub mod writer;

pub use consolidate::{ConsolidationError, ConsolidationOutcome, ConsolidationReport, OutputConsolidator};
pub use writer::SpoolWriter;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::warn;

/// Extension of committed spool files
pub const SPOOL_EXTENSION: &str = "spool";

/// Directory under the spool root holding markers for merged leftovers
pub const CONSUMED_DIR: &str = ".consumed";

/// Errors raised while writing spool files
#[derive(Error, Debug)]
pub enum SpoolError {
    /// Filesystem operation on a spool path failed
    #[error("Spool I/O error on {}: {source}", .path.display())]
    Io {
        /// Path the operation touched
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Entity ID is empty or would escape the operation directory
    #[error("Entity ID '{0}' cannot be used as a file name")]
    InvalidEntityId(String),
}

impl SpoolError {
    pub(crate) fn io(path: &Path) -> impl FnOnce(std::io::Error) -> SpoolError + '_ {
        move |source| SpoolError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Root directory holding spools and final outputs
#[derive(Debug, Clone)]
pub struct SpoolDirectory {
    root: PathBuf,
}

impl SpoolDirectory {
    /// Spool directory rooted at `root`; nothing is created yet
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Spool root, also where final outputs land
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding one operation's spools
    pub fn operation_dir(&self, operation: &str) -> PathBuf {
        self.root.join(operation)
    }

    /// Committed spool file for (operation, entity)
    pub fn spool_path(&self, operation: &str, entity_id: &str) -> Result<PathBuf, SpoolError> {
        validate_entity_id(entity_id)?;
        Ok(self
            .operation_dir(operation)
            .join(format!("{}.{}", entity_id, SPOOL_EXTENSION)))
    }

    /// Final consolidated output of an operation
    pub fn final_path(&self, operation: &str) -> PathBuf {
        self.root.join(format!("{}.txt", operation))
    }

    /// Open a writer for (operation, entity)
    pub async fn writer(&self, operation: &str, entity_id: &str) -> Result<SpoolWriter, SpoolError> {
        SpoolWriter::create(self.spool_path(operation, entity_id)?).await
    }

    /// Remove whatever an earlier run left for (operation, entity): the
    /// committed spool and its consumed marker. Called before an extraction
    /// starts so a failure never leaves old rows behind for consolidation.
    pub async fn discard(&self, operation: &str, entity_id: &str) -> Result<(), SpoolError> {
        let spool = self.spool_path(operation, entity_id)?;
        remove_if_present(&spool).await?;
        if let Some(marker) = self.consumed_marker(operation, &spool) {
            remove_if_present(&marker).await?;
        }
        Ok(())
    }

    /// Directory holding the consumed markers of an operation
    pub fn consumed_dir(&self, operation: &str) -> PathBuf {
        self.root.join(CONSUMED_DIR).join(operation)
    }

    fn consumed_marker(&self, operation: &str, spool: &Path) -> Option<PathBuf> {
        spool
            .file_name()
            .map(|name| self.consumed_dir(operation).join(name))
    }

    /// Whether `spool` was already merged into the operation's output
    pub fn is_consumed(&self, operation: &str, spool: &Path) -> bool {
        self.consumed_marker(operation, spool)
            .is_some_and(|marker| marker.exists())
    }

    /// Record that `spool` was merged even though it could not be deleted
    pub fn mark_consumed(&self, operation: &str, spool: &Path) -> std::io::Result<()> {
        let marker = self.consumed_marker(operation, spool).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "spool path has no file name")
        })?;
        std::fs::create_dir_all(self.consumed_dir(operation))?;
        std::fs::File::create(marker)?;
        Ok(())
    }

    /// Try again to delete merged leftovers of an operation. Markers are only
    /// dropped once their spool is gone; returns the spools still present.
    pub fn retire_consumed(&self, operation: &str) -> Vec<PathBuf> {
        let dir = self.consumed_dir(operation);
        let markers = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };

        let mut remaining = Vec::new();
        for marker in markers.flatten() {
            let spool = self.operation_dir(operation).join(marker.file_name());
            match std::fs::remove_file(&spool) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(path = %spool.display(), error = %e, "Merged spool still cannot be deleted");
                    remaining.push(spool);
                    continue;
                }
            }
            if let Err(e) = std::fs::remove_file(marker.path()) {
                warn!(path = %marker.path().display(), error = %e, "Failed to remove consumed marker");
            }
        }

        if remaining.is_empty() {
            // Each only succeeds once empty.
            let _ = std::fs::remove_dir(self.operation_dir(operation));
            let _ = std::fs::remove_dir(&dir);
            let _ = std::fs::remove_dir(self.root.join(CONSUMED_DIR));
        }
        remaining
    }

    /// Committed spool files of an operation, ordered by file name (and so by
    /// entity ID). A missing directory means no spools; consumed leftovers
    /// are skipped.
    pub fn list_spools(&self, operation: &str) -> std::io::Result<Vec<PathBuf>> {
        let dir = self.operation_dir(operation);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut spools = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let is_spool = path.extension().is_some_and(|ext| ext == SPOOL_EXTENSION);
            if is_spool && entry.file_type()?.is_file() && !self.is_consumed(operation, &path) {
                spools.push(path);
            }
        }
        spools.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
        Ok(spools)
    }
}

async fn remove_if_present(path: &Path) -> Result<(), SpoolError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SpoolError::io(path)(e)),
    }
}

fn validate_entity_id(entity_id: &str) -> Result<(), SpoolError> {
    let unusable = entity_id.is_empty()
        || entity_id == "."
        || entity_id == ".."
        || entity_id.contains(&['/', '\\', '\0'][..]);
    if unusable {
        return Err(SpoolError::InvalidEntityId(entity_id.to_string()));
    }
    Ok(())
}
