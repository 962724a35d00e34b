//! Row-level access to the event table: decoded columns and raw events.

use std::collections::BTreeMap;

use ndarray::Array2;

use crate::column::{parse_descriptor, ColumnData, ColumnDescriptor};
use crate::error::{Error, Result};
use crate::table::TableReader;
use crate::tile;
use crate::NUM_PIXELS;

/// Name of the event table extension in a data file.
pub const EVENTS_EXTENSION: &str = "Events";
/// Column holding the entropy-coded raw samples of all pixels.
pub const SAMPLE_COLUMN: &str = "Data";
/// Column holding the per-pixel ring-buffer start cells.
pub const START_CELL_COLUMN: &str = "StartCellData";
/// Boolean keyword marking an extension as tile-compressed.
pub const COMPRESSED_KEYWORD: &str = "ZTABLE";

/// The declared layout of every column in a table, read once from the
/// extension metadata and immutable afterwards.
#[derive(Debug, Clone)]
pub struct ColumnCatalog {
    columns: Vec<ColumnDescriptor>,
}

impl ColumnCatalog {
    /// Build the catalog from an extension's column names and per-column
    /// format descriptors (`ZFORMn`, falling back to `TFORMn` for tables
    /// that were never compressed).
    pub fn read<R: TableReader>(reader: &R, extension: &str) -> Result<Self> {
        let names = reader.column_names(extension)?;
        let mut columns = Vec::with_capacity(names.len());
        for (index, name) in names.into_iter().enumerate() {
            let zform = format!("ZFORM{}", index + 1);
            let tform = format!("TFORM{}", index + 1);
            let descriptor = match reader.keyword(extension, &zform)? {
                Some(kw) => kw,
                None => reader
                    .keyword(extension, &tform)?
                    .ok_or(Error::MissingKeyword("ZFORMn"))?,
            };
            let descriptor = descriptor.as_str().ok_or(Error::InvalidValue)?.to_owned();
            let (repeat, element_type) = parse_descriptor(&descriptor)?;
            columns.push(ColumnDescriptor {
                name,
                repeat,
                element_type,
            });
        }
        Ok(ColumnCatalog { columns })
    }

    /// Look up a column by name.
    pub fn get(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// All columns in table order.
    pub fn iter(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.columns.iter()
    }

    /// Number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns `true` if the table has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// One decoded event row: the raw sample matrix, the start-cell vector,
/// and every other column of the row.
#[derive(Debug, Clone)]
pub struct RawEvent {
    /// Table row this event was read from.
    pub row: u64,
    /// Raw ADC samples, one row per pixel.
    pub samples: Array2<i16>,
    /// Ring-buffer start cell of each pixel.
    pub start_cells: Vec<i16>,
    /// All remaining columns of the row, decoded but untouched.
    pub columns: BTreeMap<String, ColumnData>,
}

impl RawEvent {
    /// Number of samples read out per pixel.
    pub fn roi(&self) -> usize {
        self.samples.ncols()
    }
}

/// Streams decoded rows out of an event table.
///
/// Byte retrieval is delegated to the container reader, decompression to
/// the tile decoder. The source is also an iterator over [`RawEvent`]s.
pub struct RawEventSource<R: TableReader> {
    reader: R,
    extension: String,
    catalog: ColumnCatalog,
    rows: u64,
    compressed: bool,
    next_row: u64,
}

impl<R: TableReader> RawEventSource<R> {
    /// Open an event table extension, reading its column catalog and
    /// compression flag.
    pub fn open(reader: R, extension: &str) -> Result<Self> {
        let catalog = ColumnCatalog::read(&reader, extension)?;
        let rows = reader.row_count(extension)?;
        let compressed = reader
            .keyword(extension, COMPRESSED_KEYWORD)?
            .and_then(|kw| kw.as_bool())
            .unwrap_or(false);
        Ok(RawEventSource {
            reader,
            extension: String::from(extension),
            catalog,
            rows,
            compressed,
            next_row: 0,
        })
    }

    /// Number of event rows in the table.
    pub fn rows(&self) -> u64 {
        self.rows
    }

    /// The column catalog of the table.
    pub fn catalog(&self) -> &ColumnCatalog {
        &self.catalog
    }

    /// Returns `true` if cells carry compression headers.
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    /// Decode a single cell. For a compressed table the cell's transform
    /// chain is undone; otherwise the bytes are the typed array verbatim
    /// with no header parsing attempted.
    pub fn get(&mut self, column: &str, row: u64) -> Result<ColumnData> {
        if row >= self.rows {
            return Err(Error::RowOutOfRange {
                row,
                rows: self.rows,
            });
        }
        let descriptor = self
            .catalog
            .get(column)
            .ok_or_else(|| Error::MissingColumn(String::from(column)))?
            .clone();
        let cell = self.reader.read_cell(&self.extension, column, row)?;
        if self.compressed {
            tile::decode_cell(&cell, &descriptor)
        } else {
            ColumnData::from_le_bytes(&cell, descriptor.element_type)
        }
    }

    /// Decode one full row into a [`RawEvent`].
    pub fn read_event(&mut self, row: u64) -> Result<RawEvent> {
        let samples = self
            .get(SAMPLE_COLUMN, row)?
            .into_shorts()
            .ok_or(Error::InvalidValue)?;
        if samples.is_empty() || !samples.len().is_multiple_of(NUM_PIXELS) {
            return Err(Error::UnexpectedLength {
                column: "Data",
                len: samples.len(),
            });
        }
        let roi = samples.len() / NUM_PIXELS;
        let samples = Array2::from_shape_vec((NUM_PIXELS, roi), samples)
            .map_err(|_| Error::UnexpectedLength {
                column: "Data",
                len: NUM_PIXELS * roi,
            })?;

        let start_cells = self
            .get(START_CELL_COLUMN, row)?
            .into_shorts()
            .ok_or(Error::InvalidValue)?;
        if start_cells.len() != NUM_PIXELS {
            return Err(Error::UnexpectedLength {
                column: "StartCellData",
                len: start_cells.len(),
            });
        }

        let names: Vec<String> = self
            .catalog
            .iter()
            .map(|c| c.name.clone())
            .filter(|n| n != SAMPLE_COLUMN && n != START_CELL_COLUMN)
            .collect();
        let mut columns = BTreeMap::new();
        for name in names {
            let data = self.get(&name, row)?;
            columns.insert(name, data);
        }

        Ok(RawEvent {
            row,
            samples,
            start_cells,
            columns,
        })
    }
}

impl<R: TableReader> Iterator for RawEventSource<R> {
    type Item = Result<RawEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_row >= self.rows {
            return None;
        }
        let row = self.next_row;
        self.next_row += 1;
        Some(self.read_event(row))
    }
}
