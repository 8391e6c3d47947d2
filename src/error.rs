use std::io;
use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

use crate::tracker::SessionState;

#[derive(Debug, Error, Diagnostic)]
pub enum AssemblerError {
    #[error("invalid file id: {0}")]
    #[diagnostic(help("file ids may contain letters, digits, '.', '_' and '-' (max 128 chars)"))]
    InvalidFileId(String),

    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    #[error("invalid chunk: {0}")]
    InvalidChunk(String),

    #[error("inconsistent chunk total for {file_id}: session expects {expected}, request declared {declared}")]
    InconsistentTotal {
        file_id: String,
        expected: u32,
        declared: u32,
    },

    #[error("upload {file_id} is {state} and no longer accepts chunks")]
    UploadClosed { file_id: String, state: SessionState },

    #[error("upload {file_id} is being combined")]
    UploadBusy { file_id: String },

    #[error("upload not found: {0}")]
    UploadNotFound(String),

    #[error("fragment {index} of {file_id} is missing")]
    MissingFragment { file_id: String, index: u32 },

    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    IoFatal {
        operation: String,
        attempts: u32,
        #[source]
        source: io::Error,
    },

    #[error("metadata sink failed: {0}")]
    MetadataSink(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl AssemblerError {
    /// Errors caused by the request itself; retrying the same request will not help.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            AssemblerError::InvalidFileId(_)
                | AssemblerError::InvalidFileName(_)
                | AssemblerError::InvalidChunk(_)
                | AssemblerError::InconsistentTotal { .. }
                | AssemblerError::UploadClosed { .. }
        )
    }
}
