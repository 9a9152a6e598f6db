use thiserror::Error;

/// Enumeration of reasons a call monitor line cannot be turned into a call event.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected at least 6 fields but found {found}")]
    TooFewFields { found: usize },
}

/// Enumeration of errors while framing the call monitor byte stream into lines.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("line exceeded the maximum length of {max_length} bytes")]
    LineTooLong { max_length: usize },
    #[error("failed to read from the call monitor: {0}")]
    Io(#[from] std::io::Error),
}

/// Enumeration of errors that stop the call monitor reader.
#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("gave up connecting to the call monitor at {endpoint} after {attempts} attempts")]
    RetriesExhausted { endpoint: String, attempts: u32 },
}
