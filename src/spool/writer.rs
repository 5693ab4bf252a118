use std::path::{Path, PathBuf};

use tokio::fs::{self, File};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::warn;

use crate::spool::SpoolError;

/// Appends formatted rows for one (operation, entity) pair.
///
/// Rows go to `<entity>.spool.partial`; [`commit`](Self::commit) renames it to
/// the final spool name, so consolidation never sees a half-written spool.
pub struct SpoolWriter {
    file: BufWriter<File>,
    partial: PathBuf,
    target: PathBuf,
    rows: usize,
}

impl SpoolWriter {
    /// Create the writer, making the operation directory if needed. An
    /// existing spool for the same pair is replaced on commit.
    pub async fn create(target: PathBuf) -> Result<Self, SpoolError> {
        if let Some(dir) = target.parent() {
            fs::create_dir_all(dir).await.map_err(SpoolError::io(dir))?;
        }

        let partial = partial_path(&target);
        let file = File::create(&partial)
            .await
            .map_err(SpoolError::io(&partial))?;

        Ok(Self {
            file: BufWriter::new(file),
            partial,
            target,
            rows: 0,
        })
    }

    /// Append one line; the newline is added here
    pub async fn append(&mut self, line: &str) -> Result<(), SpoolError> {
        self.file
            .write_all(line.as_bytes())
            .await
            .map_err(SpoolError::io(&self.partial))?;
        self.file
            .write_all(b"\n")
            .await
            .map_err(SpoolError::io(&self.partial))?;
        self.rows += 1;
        Ok(())
    }

    /// Rows appended so far
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Final spool path the rows are published under
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Flush and publish the spool under its final name. Returns the row count.
    /// On failure the partial file is removed and no spool is published.
    pub async fn commit(mut self) -> Result<usize, SpoolError> {
        match self.publish().await {
            Ok(()) => Ok(self.rows),
            Err(e) => {
                self.abort().await;
                Err(e)
            }
        }
    }

    async fn publish(&mut self) -> Result<(), SpoolError> {
        self.file.flush().await.map_err(SpoolError::io(&self.partial))?;
        self.file
            .get_ref()
            .sync_data()
            .await
            .map_err(SpoolError::io(&self.partial))?;

        fs::rename(&self.partial, &self.target)
            .await
            .map_err(SpoolError::io(&self.target))
    }

    /// Drop everything written so far
    pub async fn abort(self) {
        let Self { file, partial, .. } = self;
        drop(file);
        if let Err(e) = fs::remove_file(&partial).await {
            warn!(path = %partial.display(), error = %e, "Failed to remove partial spool file");
        }
    }
}

fn partial_path(target: &Path) -> PathBuf {
    let mut name = target.as_os_str().to_os_string();
    name.push(".partial");
    PathBuf::from(name)
}
