use std::collections::BTreeSet;
use std::io::Read;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::combiner::Combiner;
use crate::config::ResolvedConfig;
use crate::domain::{ChunkRequest, FileId, FileName};
use crate::error::AssemblerError;
use crate::metadata::{JsonlMetadataSink, MetadataSink, UploadedFileRecord};
use crate::retry::RetryPolicy;
use crate::store::{ChunkStore, FsChunkStore};
use crate::tracker::{
    Admission, Arrival, CombineTicket, ReclaimLease, SessionSnapshot, UploadTracker,
};

/// What the transport layer reports back for one chunk request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChunkOutcome {
    Accepted {
        file_id: String,
        received_count: u32,
        total_chunks: u32,
    },
    Duplicate {
        file_id: String,
        received_count: u32,
        total_chunks: u32,
    },
    AlreadyCombining {
        file_id: String,
        received_count: u32,
        total_chunks: u32,
    },
    Complete {
        file_id: String,
        final_path: String,
        bytes: u64,
        /// Set when the artifact was published but its metadata record was not.
        metadata_warning: Option<String>,
    },
}

impl ChunkOutcome {
    pub fn is_complete(&self) -> bool {
        matches!(self, ChunkOutcome::Complete { .. })
    }
}

pub struct Assembler<S: ChunkStore, M: MetadataSink> {
    store: S,
    metadata: M,
    tracker: UploadTracker,
    combiner: Combiner,
    retry: RetryPolicy,
    sweep_interval: Duration,
    last_sweep: Mutex<Instant>,
}

impl Assembler<FsChunkStore, JsonlMetadataSink> {
    /// Filesystem-backed assembler rooted at the configured directories.
    pub fn open(config: &ResolvedConfig) -> Result<Self, AssemblerError> {
        let store = FsChunkStore::new(config.temp_root.clone());
        store
            .ensure_root()
            .map_err(|err| AssemblerError::Filesystem(format!("{}: {err}", config.temp_root)))?;
        std::fs::create_dir_all(config.upload_root.as_std_path())
            .map_err(|err| AssemblerError::Filesystem(format!("{}: {err}", config.upload_root)))?;
        let metadata = JsonlMetadataSink::new(config.metadata_log.clone());
        Ok(Self::new(config, store, metadata))
    }
}

impl<S: ChunkStore, M: MetadataSink> Assembler<S, M> {
    pub fn new(config: &ResolvedConfig, store: S, metadata: M) -> Self {
        Self {
            store,
            metadata,
            tracker: UploadTracker::new(config.idle_timeout, config.tombstone_ttl),
            combiner: Combiner::new(config.upload_root.clone(), config.retry),
            retry: config.retry,
            sweep_interval: config.sweep_interval,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn tracker(&self) -> &UploadTracker {
        &self.tracker
    }

    /// Stores one fragment and, if it completes the set, combines the upload.
    pub fn accept_chunk<R: Read>(
        &self,
        request: &ChunkRequest,
        mut payload: R,
    ) -> Result<ChunkOutcome, AssemblerError> {
        request.validate()?;
        self.sweep_if_due();
        let file_id = &request.file_id;
        let index = request.chunk_index;

        let mut data = Vec::new();
        payload
            .read_to_end(&mut data)
            .map_err(|source| AssemblerError::IoFatal {
                operation: "read payload".to_string(),
                attempts: 1,
                source,
            })?;
        if data.is_empty() {
            return Err(AssemblerError::InvalidChunk("empty chunk".to_string()));
        }

        let lease = loop {
            match self.tracker.admit(file_id, index, request.total_chunks)? {
                Admission::Combining { received, total } => {
                    debug!(%file_id, index, "chunk arrived while combining");
                    return Ok(ChunkOutcome::AlreadyCombining {
                        file_id: file_id.to_string(),
                        received_count: received,
                        total_chunks: total,
                    });
                }
                Admission::Expired(lease) => self.reclaim(lease),
                Admission::New(lease) | Admission::Existing(lease) => break lease,
            }
        };

        self.retry
            .run("store fragment", |_| self.store.put(file_id, index, &data))?;
        let arrival = self.tracker.record_arrival(
            file_id,
            index,
            request.total_chunks,
            &request.file_name,
        )?;
        drop(lease);

        debug!(%file_id, index, ?arrival, "chunk recorded");
        self.settle(file_id, arrival)
    }

    /// Rebuilds a session from fragments already on disk, e.g. after a restart.
    /// Returns `None` when a session is already tracked in memory.
    pub fn recover(
        &self,
        file_id: &FileId,
        file_name: &FileName,
        total_chunks: u32,
    ) -> Result<Option<ChunkOutcome>, AssemblerError> {
        if self.tracker.snapshot(file_id).is_some() {
            return Ok(None);
        }
        let restored = {
            let _lease = self.tracker.write_lease(file_id);
            let durable = self.fragments(file_id)?;
            self.tracker
                .restore(file_id, file_name, total_chunks, &durable)?
                .map(|arrival| (arrival, durable.len()))
        };
        match restored {
            Some((arrival, fragments)) => {
                info!(%file_id, fragments, "recovered upload session from disk");
                self.settle(file_id, arrival).map(Some)
            }
            None => Ok(None),
        }
    }

    pub fn status(&self, file_id: &FileId) -> Result<SessionSnapshot, AssemblerError> {
        self.tracker
            .snapshot(file_id)
            .ok_or_else(|| AssemblerError::UploadNotFound(file_id.to_string()))
    }

    /// Fragment indices currently durable for `file_id`. Diagnostic only.
    pub fn fragments(&self, file_id: &FileId) -> Result<BTreeSet<u32>, AssemblerError> {
        self.retry
            .run("list fragments", |_| self.store.list(file_id))
    }

    /// Forgets a session that is not being combined and reclaims its storage.
    /// Returns whether a session was tracked.
    pub fn abandon(&self, file_id: &FileId) -> Result<bool, AssemblerError> {
        let (previous, lease) = self.tracker.abandon(file_id)?;
        self.reclaim(lease);
        if let Some(state) = previous {
            info!(%file_id, %state, "upload session abandoned");
        }
        Ok(previous.is_some())
    }

    /// Abandons sessions idle for longer than the configured window.
    pub fn sweep_idle(&self) -> Vec<FileId> {
        self.tracker.sweep(Instant::now(), |file_id| {
            warn!(%file_id, "reclaiming idle upload");
            self.discard(file_id);
        })
    }

    fn sweep_if_due(&self) {
        let now = Instant::now();
        {
            let mut last = self
                .last_sweep
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if now.saturating_duration_since(*last) < self.sweep_interval {
                return;
            }
            *last = now;
        }
        let retired = self.sweep_idle();
        debug!(retired = retired.len(), tracked = self.tracker.len(), "periodic sweep");
    }

    fn settle(&self, file_id: &FileId, arrival: Arrival) -> Result<ChunkOutcome, AssemblerError> {
        let file_id = file_id.to_string();
        match arrival {
            Arrival::Pending { received, total } => Ok(ChunkOutcome::Accepted {
                file_id,
                received_count: received,
                total_chunks: total,
            }),
            Arrival::Duplicate { received, total } => Ok(ChunkOutcome::Duplicate {
                file_id,
                received_count: received,
                total_chunks: total,
            }),
            Arrival::AlreadyCombining { received, total } => Ok(ChunkOutcome::AlreadyCombining {
                file_id,
                received_count: received,
                total_chunks: total,
            }),
            Arrival::ReadyToCombine(ticket) => self.complete(&ticket),
        }
    }

    fn complete(&self, ticket: &CombineTicket) -> Result<ChunkOutcome, AssemblerError> {
        let file_id = ticket.file_id();
        let combined = self.combiner.combine(&self.store, ticket);
        // Held until the namespace is gone, so the tombstone cannot expire
        // and admit a new session before cleanup.
        let lease = self.tracker.reclaim_lease(file_id);
        let artifact = match combined {
            Ok(artifact) => artifact,
            Err(err) => {
                error!(%file_id, error = %err, "combine failed");
                if let Err(mark_err) = self.tracker.mark_failed(file_id, &err.to_string()) {
                    warn!(%file_id, error = %mark_err, "could not mark session failed");
                }
                self.reclaim(lease);
                return Err(err);
            }
        };

        self.tracker.mark_done(file_id)?;

        let record = UploadedFileRecord {
            file_name: ticket.file_name().to_string(),
            file_path: artifact.path.to_string(),
            uploaded_at: Utc::now(),
        };
        let metadata_warning = match self.metadata.record(&record) {
            Ok(()) => None,
            Err(err) => {
                warn!(%file_id, error = %err, "artifact published without metadata record");
                Some(err.to_string())
            }
        };

        self.reclaim(lease);
        info!(%file_id, path = %artifact.path, "upload complete");
        Ok(ChunkOutcome::Complete {
            file_id: file_id.to_string(),
            final_path: artifact.path.to_string(),
            bytes: artifact.bytes,
            metadata_warning,
        })
    }

    fn reclaim(&self, lease: ReclaimLease<'_>) {
        self.discard(lease.file_id());
    }

    /// Best effort: failures are logged, never returned.
    fn discard(&self, file_id: &FileId) {
        if let Err(err) = self.store.cleanup(file_id) {
            warn!(%file_id, error = %err, "failed to clean up chunk storage");
        }
    }
}
