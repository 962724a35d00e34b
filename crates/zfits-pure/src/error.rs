/// All errors that can occur while decoding or calibrating zFITS data.
#[derive(Debug)]
pub enum Error {
    /// A cell or bitstream ended before its declared contents.
    Truncated,
    /// The serialized Huffman symbol table is internally inconsistent.
    MalformedTable,
    /// A compression header names a transform id this reader does not know.
    UnsupportedTransform(u16),
    /// A format descriptor or header value could not be parsed correctly.
    InvalidValue,
    /// The requested extension does not exist in the container.
    MissingExtension(String),
    /// A required column is absent from its table.
    MissingColumn(String),
    /// A required header keyword was not found.
    MissingKeyword(&'static str),
    /// A row at or past the table's row count was requested directly.
    RowOutOfRange { row: u64, rows: u64 },
    /// A decoded column does not have the length the camera layout requires.
    UnexpectedLength { column: &'static str, len: usize },
    /// A start cell lies outside the ring buffer.
    StartCellOutOfRange { pixel: usize, cell: i64 },
    /// An I/O error from the standard library.
    Io(std::io::Error),
    /// A failure reported by the external container reader.
    Reader {
        file: String,
        extension: String,
        row: Option<u64>,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;

impl Error {
    /// Wrap a container-reader failure with file/extension/row context.
    pub fn reader(
        file: impl Into<String>,
        extension: impl Into<String>,
        row: Option<u64>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Error::Reader {
            file: file.into(),
            extension: extension.into(),
            row,
            source: source.into(),
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Error::Truncated => write!(f, "cell ends before its declared contents"),
            Error::MalformedTable => write!(f, "malformed Huffman symbol table"),
            Error::UnsupportedTransform(id) => write!(f, "unsupported transform id: {id}"),
            Error::InvalidValue => write!(f, "invalid descriptor or header value"),
            Error::MissingExtension(name) => write!(f, "missing extension: {name}"),
            Error::MissingColumn(name) => write!(f, "missing column: {name}"),
            Error::MissingKeyword(kw) => write!(f, "missing required keyword: {kw}"),
            Error::RowOutOfRange { row, rows } => {
                write!(f, "row {row} out of range for table with {rows} rows")
            }
            Error::UnexpectedLength { column, len } => {
                write!(f, "column {column} has unexpected length {len}")
            }
            Error::StartCellOutOfRange { pixel, cell } => {
                write!(f, "start cell {cell} of pixel {pixel} outside the ring buffer")
            }
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Reader {
                file,
                extension,
                row,
                source,
            } => match row {
                Some(row) => {
                    write!(f, "reader error in {file}[{extension}] row {row}: {source}")
                }
                None => write!(f, "reader error in {file}[{extension}]: {source}"),
            },
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Reader { source, .. } => Some(source.as_ref()),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}
