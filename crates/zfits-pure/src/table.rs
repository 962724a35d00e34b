//! The container boundary: generic tabular-binary access.
//!
//! Opening the file, parsing header blocks, resolving heap pointers, and
//! seeking to a row all belong to a host-provided container reader. This
//! module defines the narrow interface the decoding pipeline needs --
//! header keywords, column names, row counts, and raw cell bytes -- plus
//! [`MemoryTable`], an in-memory implementation used by tests and by hosts
//! that assemble tables themselves.
//!
//! Cell bytes cross this boundary in the format family's declared
//! little-endian order; an adapter over a big-endian container is expected
//! to normalize scalar cells before returning them. Compressed cells are
//! opaque byte blocks either way. Adapter failures should be surfaced as
//! [`Error::Reader`](crate::error::Error::Reader) so file, extension, and
//! row context travel with them.

use crate::error::{Error, Result};

/// A parsed header keyword value.
#[derive(Debug, Clone, PartialEq)]
pub enum Keyword {
    /// Logical value (`T` or `F`).
    Logical(bool),
    /// Integer value.
    Integer(i64),
    /// Floating-point value.
    Float(f64),
    /// Character string.
    String(String),
}

impl Keyword {
    /// The logical value, if this keyword holds one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Keyword::Logical(b) => Some(*b),
            _ => None,
        }
    }

    /// The integer value, if this keyword holds one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Keyword::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// The string value, if this keyword holds one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Keyword::String(s) => Some(s),
            _ => None,
        }
    }
}

/// Read access to one container file holding named table extensions.
///
/// Implementations hold whatever file-position state they need, which is
/// why [`read_cell`](TableReader::read_cell) takes `&mut self`; a reader
/// must not be shared across decoding pipelines.
pub trait TableReader {
    /// Look up a header keyword on an extension. `Ok(None)` means the
    /// extension exists but does not carry the keyword.
    fn keyword(&self, extension: &str, key: &str) -> Result<Option<Keyword>>;

    /// The ordered column names of an extension.
    fn column_names(&self, extension: &str) -> Result<Vec<String>>;

    /// Number of table rows in an extension.
    fn row_count(&self, extension: &str) -> Result<u64>;

    /// The raw bytes of one cell.
    fn read_cell(&mut self, extension: &str, column: &str, row: u64) -> Result<Vec<u8>>;
}

/// One column of a [`MemoryTable`] extension.
#[derive(Debug, Clone)]
struct MemoryColumn {
    name: String,
    cells: Vec<Vec<u8>>,
}

/// One table extension of a [`MemoryTable`].
#[derive(Debug, Clone, Default)]
pub struct MemoryExtension {
    keywords: Vec<(String, Keyword)>,
    columns: Vec<MemoryColumn>,
}

impl MemoryExtension {
    /// Create an empty extension.
    pub fn new() -> Self {
        MemoryExtension::default()
    }

    /// Set a header keyword, replacing any existing value.
    pub fn set_keyword(&mut self, key: impl Into<String>, value: Keyword) {
        let key = key.into();
        if let Some(entry) = self.keywords.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.keywords.push((key, value));
        }
    }

    /// Append a column with one raw byte cell per row.
    pub fn push_column(&mut self, name: impl Into<String>, cells: Vec<Vec<u8>>) {
        self.columns.push(MemoryColumn {
            name: name.into(),
            cells,
        });
    }

    fn rows(&self) -> u64 {
        self.columns.first().map_or(0, |c| c.cells.len() as u64)
    }
}

/// An in-memory container of named table extensions.
#[derive(Debug, Clone, Default)]
pub struct MemoryTable {
    extensions: Vec<(String, MemoryExtension)>,
}

impl MemoryTable {
    /// Create an empty container.
    pub fn new() -> Self {
        MemoryTable::default()
    }

    /// Add a named extension.
    pub fn push_extension(&mut self, name: impl Into<String>, extension: MemoryExtension) {
        self.extensions.push((name.into(), extension));
    }

    fn extension(&self, name: &str) -> Result<&MemoryExtension> {
        self.extensions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, e)| e)
            .ok_or_else(|| Error::MissingExtension(String::from(name)))
    }
}

impl TableReader for MemoryTable {
    fn keyword(&self, extension: &str, key: &str) -> Result<Option<Keyword>> {
        let ext = self.extension(extension)?;
        Ok(ext
            .keywords
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone()))
    }

    fn column_names(&self, extension: &str) -> Result<Vec<String>> {
        let ext = self.extension(extension)?;
        Ok(ext.columns.iter().map(|c| c.name.clone()).collect())
    }

    fn row_count(&self, extension: &str) -> Result<u64> {
        Ok(self.extension(extension)?.rows())
    }

    fn read_cell(&mut self, extension: &str, column: &str, row: u64) -> Result<Vec<u8>> {
        let ext = self.extension(extension)?;
        let col = ext
            .columns
            .iter()
            .find(|c| c.name == column)
            .ok_or_else(|| Error::MissingColumn(String::from(column)))?;
        col.cells
            .get(row as usize)
            .cloned()
            .ok_or(Error::RowOutOfRange {
                row,
                rows: col.cells.len() as u64,
            })
    }
}
