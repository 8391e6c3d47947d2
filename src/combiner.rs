use std::fs;
use std::io::{self, Seek, SeekFrom};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;
use tracing::{debug, info};

use crate::error::AssemblerError;
use crate::retry::RetryPolicy;
use crate::store::ChunkStore;
use crate::tracker::CombineTicket;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombinedArtifact {
    pub path: Utf8PathBuf,
    pub bytes: u64,
}

/// Concatenates fragments `0..total` into the final artifact.
///
/// Everything is written to a staging file next to the destination and only
/// renamed onto the final path once every fragment has been copied, so a
/// failed combine never leaves a partial artifact behind.
#[derive(Debug, Clone)]
pub struct Combiner {
    upload_root: Utf8PathBuf,
    retry: RetryPolicy,
}

impl Combiner {
    pub fn new(upload_root: Utf8PathBuf, retry: RetryPolicy) -> Self {
        Self { upload_root, retry }
    }

    pub fn upload_root(&self) -> &Utf8Path {
        &self.upload_root
    }

    pub fn artifact_path(&self, ticket: &CombineTicket) -> Utf8PathBuf {
        self.upload_root.join(ticket.file_name().as_str())
    }

    pub fn combine(
        &self,
        store: &dyn ChunkStore,
        ticket: &CombineTicket,
    ) -> Result<CombinedArtifact, AssemblerError> {
        let file_id = ticket.file_id();
        fs::create_dir_all(self.upload_root.as_std_path())
            .map_err(|err| AssemblerError::Filesystem(err.to_string()))?;

        let mut staging = self.retry.run("create staging file", |_| {
            Builder::new()
                .prefix(".staging-")
                .suffix(&format!(".{file_id}"))
                .tempfile_in(self.upload_root.as_std_path())
        })?;

        let mut bytes = 0u64;
        for index in 0..ticket.total_chunks() {
            let offset = staging.as_file_mut().stream_position().map_err(|err| {
                AssemblerError::IoFatal {
                    operation: "locate staging offset".to_string(),
                    attempts: 1,
                    source: err,
                }
            })?;
            let copied = self
                .retry
                .run("copy fragment", |attempt| {
                    let file = staging.as_file_mut();
                    if attempt > 1 {
                        file.set_len(offset)?;
                        file.seek(SeekFrom::Start(offset))?;
                    }
                    let mut reader = store.read(file_id, index)?;
                    io::copy(&mut reader, file)
                })
                .map_err(|err| match err {
                    AssemblerError::IoFatal { source, .. }
                        if source.kind() == io::ErrorKind::NotFound =>
                    {
                        AssemblerError::MissingFragment {
                            file_id: file_id.to_string(),
                            index,
                        }
                    }
                    other => other,
                })?;
            debug!(%file_id, index, copied, "fragment appended");
            bytes += copied;
        }

        self.retry
            .run("sync staging file", |_| staging.as_file().sync_all())?;

        let target = self.artifact_path(ticket);
        let staged = staging.into_temp_path();
        self.retry.run("publish artifact", |_| {
            fs::rename(&staged, target.as_std_path())
        })?;
        staged
            .keep()
            .map_err(|err| AssemblerError::Filesystem(err.to_string()))?;

        info!(%file_id, path = %target, bytes, "artifact published");
        Ok(CombinedArtifact {
            path: target,
            bytes,
        })
    }
}
