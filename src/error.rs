use std::fmt::Display;

/// Enumeration representing the various errors that can occur within the arq client.
#[derive(Debug)]
pub enum ArqError {
    /// Client is not connected to a server
    NotConnected,
    /// Error from the underlying socket
    IOError(std::io::Error),
    /// Error payload reported by the server
    ServerError(Box<str>),
    /// Reply could not be parsed into the expected fields
    ParseError(Box<str>),
    /// Wrong element type for given operation
    DTypeError(Box<str>),
    /// Operand element counts do not match
    SizeMismatch {
        /// Left operand element count
        left: u64,
        /// Right operand element count
        right: u64,
    },
    /// Invalid slice bounds or stride
    SliceError(Box<str>),
    /// Index out of bounds
    IndexOutOfBounds {
        /// Passed index
        index: i64,
        /// Actual element count
        size: u64,
    },
}

impl ArqError {
    /// Parse error
    #[track_caller]
    pub(crate) fn parse_error(e: impl Into<String>) -> Self {
        let location = std::panic::Location::caller();
        use std::fmt::Write;
        let mut e: String = e.into();
        write!(e, ", {}:{}:{}", location.file(), location.line(), location.column()).unwrap();
        Self::ParseError(e.into())
    }

    /// DType error
    #[track_caller]
    pub(crate) fn dtype_error(e: impl Into<String>) -> Self {
        let location = std::panic::Location::caller();
        use std::fmt::Write;
        let mut e: String = e.into();
        write!(e, ", {}:{}:{}", location.file(), location.line(), location.column()).unwrap();
        Self::DTypeError(e.into())
    }
}

impl Display for ArqError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArqError::NotConnected => f.write_str("client is not connected to a server"),
            ArqError::IOError(e) => f.write_fmt(format_args!("IO {e}")),
            ArqError::ServerError(e) => f.write_fmt(format_args!("Server {e}")),
            ArqError::ParseError(e) => f.write_fmt(format_args!("Parse {e}")),
            ArqError::DTypeError(e) => f.write_fmt(format_args!("Wrong dtype {e}")),
            ArqError::SizeMismatch { left, right } => {
                f.write_fmt(format_args!("Size mismatch {left} {right}"))
            }
            ArqError::SliceError(e) => f.write_fmt(format_args!("Bad slice {e}")),
            ArqError::IndexOutOfBounds { index, size } => f.write_fmt(format_args!(
                "Index {index} is out of bounds with size {size}"
            )),
        }
    }
}

impl std::error::Error for ArqError {}

impl From<std::io::Error> for ArqError {
    #[track_caller]
    fn from(value: std::io::Error) -> Self {
        Self::IOError(value)
    }
}
