//! Column layouts for extracted rows
//!
//! A layout lists, in order, the columns selected for an operation along with
//! the width and alignment used by fixed-width output. Layouts are read from
//! `<template_dir>/<operation>.csv` and cached for the rest of the run.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::config::is_identifier;

/// Errors related to layout loading
#[derive(Error, Debug)]
pub enum LayoutError {
    /// Template file could not be opened
    #[error("Failed to open layout {}: {source}", .path.display())]
    Open {
        /// Template file
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// Template is not valid CSV
    #[error("Malformed layout {}: {source}", .path.display())]
    Csv {
        /// Template file
        path: PathBuf,
        /// Underlying CSV error
        #[source]
        source: csv::Error,
    },

    /// Template header lacks a `name` column
    #[error("Layout {} has no 'name' column", .0.display())]
    MissingNameColumn(PathBuf),

    /// Width cell is not a non-negative integer
    #[error("Invalid width '{value}' for column {column}")]
    InvalidWidth {
        /// Column the width belongs to
        column: String,
        /// Cell as written in the template
        value: String,
    },

    /// Column name is not a plain identifier
    #[error("Invalid column name '{0}'")]
    InvalidColumn(String),

    /// Template lists no columns
    #[error("Layout for operation {0} has no columns")]
    Empty(String),

    /// No layout for the operation
    #[error("No layout registered for operation {0}")]
    NotFound(String),
}

/// Side a fixed-width value is pushed against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Alignment {
    /// Pad on the right
    #[default]
    Left,
    /// Pad on the left
    Right,
}

impl Alignment {
    /// `right` (any case) is right-justified, everything else left
    pub fn parse(raw: &str) -> Self {
        if raw.trim().eq_ignore_ascii_case("right") {
            Alignment::Right
        } else {
            Alignment::Left
        }
    }
}

/// One output column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name, also selected from the table
    pub name: String,
    /// Fixed-width cell size in characters
    pub width: usize,
    /// Side the value is pushed against
    pub alignment: Alignment,
}

impl ColumnSpec {
    /// Column from its name, width and alignment
    pub fn new(name: impl Into<String>, width: usize, alignment: Alignment) -> Self {
        Self {
            name: name.into(),
            width,
            alignment,
        }
    }
}

/// Ordered columns of one operation's extraction
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ColumnLayout {
    columns: Vec<ColumnSpec>,
}

impl ColumnLayout {
    /// Layout with columns in output order
    pub fn new(columns: Vec<ColumnSpec>) -> Self {
        Self { columns }
    }

    /// Columns in output order
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Column names in output order
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|c| c.name.as_str())
    }

    /// Total width of a fixed-width line
    pub fn total_width(&self) -> usize {
        self.columns.iter().map(|c| c.width).sum()
    }

    /// Number of columns
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Whether the layout has no columns
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Where layouts come from
#[async_trait]
pub trait LayoutSource: Send + Sync {
    /// Load the layout for `operation`
    async fn load(&self, operation: &str) -> Result<ColumnLayout, LayoutError>;
}

/// Reads `<dir>/<operation>.csv` templates with `name`, `length`, `align` headers
#[derive(Debug, Clone)]
pub struct CsvLayoutSource {
    dir: PathBuf,
}

impl CsvLayoutSource {
    /// Source reading templates from `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<dir>/<operation>.csv`
    pub fn template_path(&self, operation: &str) -> PathBuf {
        self.dir.join(format!("{}.csv", operation))
    }
}

#[async_trait]
impl LayoutSource for CsvLayoutSource {
    async fn load(&self, operation: &str) -> Result<ColumnLayout, LayoutError> {
        let path = self.template_path(operation);
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|source| LayoutError::Open {
                path: path.clone(),
                source,
            })?;
        let layout = parse_layout(&path, &raw)?;
        if layout.is_empty() {
            return Err(LayoutError::Empty(operation.to_string()));
        }
        Ok(layout)
    }
}

/// Parse a layout template. Header names are matched case-insensitively;
/// `length` and `align` are optional.
pub fn parse_layout(path: &Path, raw: &[u8]) -> Result<ColumnLayout, LayoutError> {
    let csv_err = |source| LayoutError::Csv {
        path: path.to_path_buf(),
        source,
    };

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(raw);

    let headers = reader.headers().map_err(csv_err)?.clone();
    let find = |wanted: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(wanted));

    let name_idx = find("name").ok_or_else(|| LayoutError::MissingNameColumn(path.to_path_buf()))?;
    let length_idx = find("length");
    let align_idx = find("align");

    let mut columns = Vec::new();
    for record in reader.records() {
        let record = record.map_err(csv_err)?;
        let name = record.get(name_idx).unwrap_or_default().to_string();
        if !is_identifier(&name) {
            return Err(LayoutError::InvalidColumn(name));
        }

        let width = match length_idx.and_then(|i| record.get(i)) {
            Some(raw) if !raw.is_empty() => raw.parse().map_err(|_| LayoutError::InvalidWidth {
                column: name.clone(),
                value: raw.to_string(),
            })?,
            _ => 0,
        };
        let alignment = align_idx
            .and_then(|i| record.get(i))
            .map(Alignment::parse)
            .unwrap_or_default();

        columns.push(ColumnSpec::new(name, width, alignment));
    }

    Ok(ColumnLayout::new(columns))
}

/// Per-run cache in front of a [`LayoutSource`]. Failed loads are not cached,
/// so the next entity tries again.
pub struct LayoutCache {
    source: Arc<dyn LayoutSource>,
    layouts: DashMap<String, Arc<ColumnLayout>>,
}

impl LayoutCache {
    /// Empty cache in front of `source`
    pub fn new(source: Arc<dyn LayoutSource>) -> Self {
        Self {
            source,
            layouts: DashMap::new(),
        }
    }

    /// Cached layout, loading it on first use. Failures are not cached.
    pub async fn get(&self, operation: &str) -> Result<Arc<ColumnLayout>, LayoutError> {
        if let Some(layout) = self.layouts.get(operation) {
            return Ok(Arc::clone(layout.value()));
        }

        let loaded = Arc::new(self.source.load(operation).await?);
        debug!(operation = %operation, columns = loaded.len(), "Loaded column layout");

        // Another worker may have raced us; keep whichever landed first.
        let entry = self
            .layouts
            .entry(operation.to_string())
            .or_insert(loaded);
        Ok(Arc::clone(entry.value()))
    }

    /// Number of layouts loaded so far
    pub fn cached(&self) -> usize {
        self.layouts.len()
    }
}

/// Fixed set of layouts, mostly for tests
#[derive(Debug, Clone, Default)]
pub struct StaticLayoutSource {
    layouts: std::collections::HashMap<String, ColumnLayout>,
}

impl StaticLayoutSource {
    /// Source with no layouts
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the layout for `operation`
    pub fn with_layout(mut self, operation: impl Into<String>, layout: ColumnLayout) -> Self {
        self.layouts.insert(operation.into(), layout);
        self
    }
}

#[async_trait]
impl LayoutSource for StaticLayoutSource {
    async fn load(&self, operation: &str) -> Result<ColumnLayout, LayoutError> {
        self.layouts
            .get(operation)
            .cloned()
            .ok_or_else(|| LayoutError::NotFound(operation.to_string()))
    }
}
