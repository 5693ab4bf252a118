use std::path::Path;

use tracing::info;

use crate::{Result, SolBatchError};

/// Parse an entity list: one ID per line, trimmed, blank lines skipped,
/// file order kept.
pub fn parse_entity_ids(raw: &str) -> Vec<String> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Read the entity list at `path`
pub async fn read_entity_ids(path: impl AsRef<Path>) -> Result<Vec<String>> {
    let path = path.as_ref();
    let raw = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| SolBatchError::Entities(format!("{}: {}", path.display(), e)))?;
    let ids = parse_entity_ids(&raw);
    info!(path = %path.display(), count = ids.len(), "Loaded entity list");
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_trims_and_skips_blank_lines() {
        let ids = parse_entity_ids("  S2 \n\nS1\r\n\t\nS3");
        assert_eq!(ids, vec!["S2", "S1", "S3"]);
    }

    #[tokio::test]
    async fn test_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = read_entity_ids(dir.path().join("sols.txt")).await;
        assert!(matches!(result, Err(SolBatchError::Entities(_))));
    }

    #[tokio::test]
    async fn test_empty_file_gives_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sols.txt");
        std::fs::write(&path, "\n\n").unwrap();
        assert!(read_entity_ids(&path).await.unwrap().is_empty());
    }
}
