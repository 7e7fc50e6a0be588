use olestore::OleError;
use std::io;
use thiserror::Error;

/// Errors raised while decoding a workbook
#[derive(Debug, Error)]
pub enum ExcelError {
    /// The container could not be resolved
    #[error(transparent)]
    Ole(#[from] OleError),
    /// Error from the IO layer (usually the output)
    #[error(transparent)]
    Io(#[from] io::Error),
    /// A record or a record chain is cut short
    #[error("Truncated")]
    Truncated,
    /// Structurally invalid record content
    #[error("{0}")]
    BadFormat(String),
    /// The stream does not start with a BOF record
    #[error("Format not recognized")]
    FormatNotRecognized,
    /// A BIFF variant this decoder does not handle
    #[error("{0} not supported")]
    UnsupportedVariant(&'static str),
    /// The requested sheet does not exist or is hidden
    #[error("No such sheet")]
    NoSuchSheet,
    /// The requested sheet is not a worksheet
    #[error("Not a sheet")]
    NotASheet,
}

impl ExcelError {
    pub(crate) fn bad_format<S: Into<String>>(msg: S) -> Self {
        Self::BadFormat(msg.into())
    }
}
