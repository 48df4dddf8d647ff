//! The crate-wide error surface.
//!
//! Every fallible operation in the engine returns one of these kinds.
//! Corruption errors are fatal to the current operation but leave the
//! database openable read-only; parse and schema errors are scoped to the
//! failing call.

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Invalid database file: {0}")]
    InvalidFileFormat(&'static str),
    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(&'static str),
    #[error("Corrupt page {pgnum}: {detail}")]
    CorruptPage { pgnum: usize, detail: &'static str },
    #[error("Database was not opened writable.")]
    ReadOnly,
    #[error("A transaction is already active.")]
    TransactionAlreadyActive,
    #[error("Transaction has already been committed or rolled back.")]
    TransactionCompleted,
    #[error("Schema object not found: {0}")]
    SchemaNotFound(String),
    #[error("Parse error at byte {offset}: {detail}")]
    ParseError { offset: usize, detail: String },
    #[error("Writer lacks authority for scope {0}")]
    AuthorityDenied(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Record spills past a single overflow page, which the write path does not support.")]
    OverflowLimit,
    #[error("Page transform failed: {0}")]
    EncryptionError(&'static str),
}

impl Error {
    pub(crate) fn corrupt(pgnum: usize, detail: &'static str) -> Error {
        Error::CorruptPage { pgnum, detail }
    }

    pub(crate) fn parse(offset: usize, detail: impl Into<String>) -> Error {
        Error::ParseError {
            offset,
            detail: detail.into(),
        }
    }
}
