//! Row rendering
//!
//! Turns one extracted row into one line of text, either joined with a
//! delimiter or laid out in fixed-width columns.

use std::borrow::Cow;

use thiserror::Error;

use crate::layout::{Alignment, ColumnLayout};

/// Errors related to output format configuration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// Format name is neither `delimited` nor `fixed`
    #[error("Unknown output format '{0}': expected 'delimited' or 'fixed'")]
    UnknownFormat(String),
}

/// How rows are serialized
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFormat {
    /// Values joined with the delimiter
    Delimited {
        /// Separator placed between values
        delimiter: String,
    },
    /// Values truncated or padded to each column's width, no separator
    Fixed,
}

impl RowFormat {
    /// Resolve the configured format name
    pub fn from_config(format: &str, delimiter: &str) -> Result<Self, FormatError> {
        match format.trim().to_ascii_lowercase().as_str() {
            "delimited" => Ok(RowFormat::Delimited {
                delimiter: delimiter.to_string(),
            }),
            "fixed" => Ok(RowFormat::Fixed),
            _ => Err(FormatError::UnknownFormat(format.to_string())),
        }
    }
}

/// Replace embedded line breaks with a single space each
pub fn sanitize(value: &str) -> Cow<'_, str> {
    if value.contains(&['\n', '\r'][..]) {
        Cow::Owned(value.replace(&['\n', '\r'][..], " "))
    } else {
        Cow::Borrowed(value)
    }
}

/// Stateless renderer for one operation's rows
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFormatter {
    format: RowFormat,
}

impl RowFormatter {
    /// Formatter for a resolved format
    pub fn new(format: RowFormat) -> Self {
        Self { format }
    }

    /// Format this formatter renders
    pub fn format(&self) -> &RowFormat {
        &self.format
    }

    /// Render one row. A missing value (backend NULL) renders as empty.
    ///
    /// Fixed-width lines always have exactly `layout.total_width()` characters;
    /// delimited lines carry one field per value.
    pub fn render(&self, layout: &ColumnLayout, values: &[Option<String>]) -> String {
        match &self.format {
            RowFormat::Delimited { delimiter } => values
                .iter()
                .map(|v| sanitize(v.as_deref().unwrap_or("")))
                .collect::<Vec<_>>()
                .join(delimiter.as_str()),
            RowFormat::Fixed => {
                let mut line = String::with_capacity(layout.total_width());
                for (i, column) in layout.columns().iter().enumerate() {
                    let raw = values.get(i).and_then(|v| v.as_deref()).unwrap_or("");
                    push_fixed(&mut line, &sanitize(raw), column.width, column.alignment);
                }
                line
            }
        }
    }
}

/// Truncate to `width` characters, then pad with spaces on the side opposite
/// the alignment.
fn push_fixed(line: &mut String, value: &str, width: usize, alignment: Alignment) {
    let len = value.chars().count();
    let value = if len > width {
        match value.char_indices().nth(width) {
            Some((cut, _)) => &value[..cut],
            None => value,
        }
    } else {
        value
    };
    let padding = width.saturating_sub(len.min(width));

    match alignment {
        Alignment::Left => {
            line.push_str(value);
            line.extend(std::iter::repeat(' ').take(padding));
        }
        Alignment::Right => {
            line.extend(std::iter::repeat(' ').take(padding));
            line.push_str(value);
        }
    }
}
