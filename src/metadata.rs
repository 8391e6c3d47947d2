use std::fs::{self, OpenOptions};
use std::io::Write;
use std::sync::{Arc, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AssemblerError;

/// One completed upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedFileRecord {
    pub file_name: String,
    pub file_path: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Persistence collaborator notified once per completed upload.
pub trait MetadataSink: Send + Sync {
    fn record(&self, record: &UploadedFileRecord) -> Result<(), AssemblerError>;
}

impl<T: MetadataSink + ?Sized> MetadataSink for Arc<T> {
    fn record(&self, record: &UploadedFileRecord) -> Result<(), AssemblerError> {
        (**self).record(record)
    }
}

/// Appends each record as one JSON line.
pub struct JsonlMetadataSink {
    path: Utf8PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlMetadataSink {
    pub fn new(path: Utf8PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    pub fn read_all(path: &Utf8Path) -> Result<Vec<UploadedFileRecord>, AssemblerError> {
        if !path.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| AssemblerError::Filesystem(err.to_string()))?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|err| AssemblerError::MetadataSink(err.to_string()))
            })
            .collect()
    }
}

impl MetadataSink for JsonlMetadataSink {
    fn record(&self, record: &UploadedFileRecord) -> Result<(), AssemblerError> {
        let mut line = serde_json::to_vec(record)
            .map_err(|err| AssemblerError::MetadataSink(err.to_string()))?;
        line.push(b'\n');

        let _guard = self
            .write_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| AssemblerError::MetadataSink(err.to_string()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path.as_std_path())
            .map_err(|err| AssemblerError::MetadataSink(format!("open {}: {err}", self.path)))?;
        file.write_all(&line)
            .and_then(|()| file.sync_data())
            .map_err(|err| AssemblerError::MetadataSink(err.to_string()))
    }
}
