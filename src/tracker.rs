//! In-memory registry of upload sessions.
//!
//! Completion is decided here, under a per-upload mutex, instead of by
//! counting fragments on disk. The Open → Combining transition happens at
//! most once per session; whoever performs it receives the only
//! [`CombineTicket`] and is the sole combiner.
//!
//! Lock order is always table → session. The table lock is only held to look
//! up, insert or remove entries; session locks are only held across in-memory
//! transitions, never across disk I/O.
//!
//! Storage of one upload is guarded by leases: chunk writes share a
//! [`WriteLease`], deleting the namespace takes the exclusive
//! [`ReclaimLease`]. Both are plain counters in the table, released on drop.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::domain::{FileId, FileName, validate_index};
use crate::error::AssemblerError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Open,
    Combining,
    Done,
    Failed,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Open => write!(f, "open"),
            SessionState::Combining => write!(f, "combining"),
            SessionState::Done => write!(f, "done"),
            SessionState::Failed => write!(f, "failed"),
        }
    }
}

/// Exclusive right to combine one upload. Only the tracker creates these.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CombineTicket {
    file_id: FileId,
    file_name: FileName,
    total_chunks: u32,
}

impl CombineTicket {
    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }

    pub fn file_name(&self) -> &FileName {
        &self.file_name
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }
}

/// Result of recording one arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Arrival {
    Pending { received: u32, total: u32 },
    ReadyToCombine(CombineTicket),
    AlreadyCombining { received: u32, total: u32 },
    Duplicate { received: u32, total: u32 },
}

/// Decision taken before a fragment is written to storage.
#[derive(Debug)]
pub enum Admission<'a> {
    /// No session yet; the arrival will create one.
    New(WriteLease<'a>),
    /// An open session accepts the chunk.
    Existing(WriteLease<'a>),
    /// An idle session was retired. Its storage must be reclaimed under the
    /// lease before the chunk is admitted again.
    Expired(ReclaimLease<'a>),
    /// The set is already complete and being combined; nothing to store.
    Combining { received: u32, total: u32 },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub file_id: String,
    pub file_name: String,
    pub state: SessionState,
    pub received_count: u32,
    pub total_chunks: u32,
    pub received: Vec<u32>,
    pub failure: Option<String>,
}

#[derive(Debug)]
struct Session {
    file_id: FileId,
    file_name: FileName,
    total_chunks: u32,
    received: BTreeSet<u32>,
    state: SessionState,
    last_activity: Instant,
    failure: Option<String>,
    retired: bool,
}

impl Session {
    fn new(file_id: FileId, file_name: FileName, total_chunks: u32) -> Self {
        Self {
            file_id,
            file_name,
            total_chunks,
            received: BTreeSet::new(),
            state: SessionState::Open,
            last_activity: Instant::now(),
            failure: None,
            retired: false,
        }
    }

    fn received_count(&self) -> u32 {
        self.received.len() as u32
    }

    fn check_total(&self, declared: u32) -> Result<(), AssemblerError> {
        if declared != self.total_chunks {
            return Err(AssemblerError::InconsistentTotal {
                file_id: self.file_id.to_string(),
                expected: self.total_chunks,
                declared,
            });
        }
        Ok(())
    }

    fn is_idle(&self, now: Instant, idle_timeout: Duration) -> bool {
        self.state == SessionState::Open
            && now.saturating_duration_since(self.last_activity) > idle_timeout
    }

    fn is_expired_tombstone(&self, now: Instant, ttl: Duration) -> bool {
        self.state.is_terminal() && now.saturating_duration_since(self.last_activity) > ttl
    }

    fn claim_if_complete(&mut self) -> Option<CombineTicket> {
        if self.state != SessionState::Open || self.received_count() != self.total_chunks {
            return None;
        }
        self.state = SessionState::Combining;
        Some(CombineTicket {
            file_id: self.file_id.clone(),
            file_name: self.file_name.clone(),
            total_chunks: self.total_chunks,
        })
    }

    fn record(&mut self, index: u32, total: u32) -> Result<Arrival, AssemblerError> {
        self.check_total(total)?;
        let received = self.received_count();
        match self.state {
            SessionState::Open => {}
            SessionState::Combining => {
                return Ok(Arrival::AlreadyCombining { received, total });
            }
            SessionState::Done => return Ok(Arrival::Duplicate { received, total }),
            SessionState::Failed => {
                return Err(AssemblerError::UploadClosed {
                    file_id: self.file_id.to_string(),
                    state: self.state,
                });
            }
        }

        self.last_activity = Instant::now();
        if !self.received.insert(index) {
            return Ok(Arrival::Duplicate { received, total });
        }
        if let Some(ticket) = self.claim_if_complete() {
            return Ok(Arrival::ReadyToCombine(ticket));
        }
        Ok(Arrival::Pending {
            received: self.received_count(),
            total,
        })
    }

    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            file_id: self.file_id.to_string(),
            file_name: self.file_name.to_string(),
            state: self.state,
            received_count: self.received_count(),
            total_chunks: self.total_chunks,
            received: self.received.iter().copied().collect(),
            failure: self.failure.clone(),
        }
    }
}

type SessionHandle = Arc<Mutex<Session>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-upload access to the storage namespace. Writers share it; a reclaim
/// is exclusive and blocks new writers as soon as it is requested.
#[derive(Debug, Default)]
struct NamespaceAccess {
    writers: usize,
    reclaiming: bool,
}

#[derive(Debug, Default)]
struct Table {
    sessions: HashMap<FileId, SessionHandle>,
    namespaces: HashMap<FileId, NamespaceAccess>,
}

impl Table {
    fn is_reclaiming(&self, file_id: &FileId) -> bool {
        self.namespaces
            .get(file_id)
            .is_some_and(|access| access.reclaiming)
    }

    fn has_writers(&self, file_id: &FileId) -> bool {
        self.namespaces
            .get(file_id)
            .is_some_and(|access| access.writers > 0)
    }

    fn release(&mut self, file_id: &FileId, update: impl FnOnce(&mut NamespaceAccess)) {
        if let Some(access) = self.namespaces.get_mut(file_id) {
            update(access);
            if access.writers == 0 && !access.reclaiming {
                self.namespaces.remove(file_id);
            }
        }
    }
}

/// Shared right to write fragments of one upload. Reclamation of the
/// namespace waits until every write lease is dropped.
pub struct WriteLease<'a> {
    tracker: &'a UploadTracker,
    file_id: FileId,
}

impl WriteLease<'_> {
    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }
}

impl fmt::Debug for WriteLease<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteLease")
            .field("file_id", &self.file_id)
            .finish()
    }
}

impl Drop for WriteLease<'_> {
    fn drop(&mut self) {
        self.tracker
            .release(&self.file_id, |access| access.writers = access.writers.saturating_sub(1));
    }
}

/// Exclusive right to delete the storage of one upload. New arrivals for the
/// upload wait until it is dropped.
pub struct ReclaimLease<'a> {
    tracker: &'a UploadTracker,
    file_id: FileId,
}

impl ReclaimLease<'_> {
    pub fn file_id(&self) -> &FileId {
        &self.file_id
    }
}

impl fmt::Debug for ReclaimLease<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReclaimLease")
            .field("file_id", &self.file_id)
            .finish()
    }
}

impl Drop for ReclaimLease<'_> {
    fn drop(&mut self) {
        self.tracker
            .release(&self.file_id, |access| access.reclaiming = false);
    }
}

pub struct UploadTracker {
    table: Mutex<Table>,
    released: Condvar,
    idle_timeout: Duration,
    tombstone_ttl: Duration,
}

impl UploadTracker {
    pub fn new(idle_timeout: Duration, tombstone_ttl: Duration) -> Self {
        Self {
            table: Mutex::new(Table::default()),
            released: Condvar::new(),
            idle_timeout,
            tombstone_ttl,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Checks whether a chunk may be written at all. Rejects closed sessions
    /// and conflicting totals before any storage is touched.
    ///
    /// Blocks while the upload's storage is being reclaimed.
    pub fn admit(
        &self,
        file_id: &FileId,
        index: u32,
        total: u32,
    ) -> Result<Admission<'_>, AssemblerError> {
        validate_index(index, total)?;
        loop {
            let now = Instant::now();
            let mut table = self.wait_for_reclaim(lock(&self.table), file_id);
            let existing = table.sessions.get(file_id).cloned();
            let Some(handle) = existing else {
                return Ok(Admission::New(self.enter(table, file_id)));
            };
            let mut session = lock(&handle);

            if session.is_idle(now, self.idle_timeout) {
                drop(session);
                drop(table);
                if let Some(lease) = self.retire_idle(file_id, &handle, now) {
                    warn!(%file_id, "abandoning idle upload session");
                    return Ok(Admission::Expired(lease));
                }
                continue;
            }
            if session.is_expired_tombstone(now, self.tombstone_ttl) {
                session.retired = true;
                drop(session);
                table.sessions.remove(file_id);
                return Ok(Admission::New(self.enter(table, file_id)));
            }

            let state = session.state;
            return match state {
                SessionState::Open => {
                    session.check_total(total)?;
                    drop(session);
                    Ok(Admission::Existing(self.enter(table, file_id)))
                }
                SessionState::Combining => {
                    session.check_total(total)?;
                    Ok(Admission::Combining {
                        received: session.received_count(),
                        total,
                    })
                }
                SessionState::Done | SessionState::Failed => Err(AssemblerError::UploadClosed {
                    file_id: file_id.to_string(),
                    state,
                }),
            };
        }
    }

    /// Shared write access to `file_id`'s namespace, waiting out any reclaim.
    pub fn write_lease(&self, file_id: &FileId) -> WriteLease<'_> {
        let table = self.wait_for_reclaim(lock(&self.table), file_id);
        self.enter(table, file_id)
    }

    /// Exclusive access to `file_id`'s namespace. Waits for other reclaims
    /// and for in-flight writes to finish; new writes wait for the lease.
    pub fn reclaim_lease(&self, file_id: &FileId) -> ReclaimLease<'_> {
        let mut table = self.wait_for_reclaim(lock(&self.table), file_id);
        table
            .namespaces
            .entry(file_id.clone())
            .or_default()
            .reclaiming = true;
        while table.has_writers(file_id) {
            table = self.wait(table);
        }
        drop(table);
        ReclaimLease {
            tracker: self,
            file_id: file_id.clone(),
        }
    }

    /// Records that fragment `index` is durable. The single linearization
    /// point for completion.
    ///
    /// Callers writing through [`UploadTracker::admit`] must still hold the
    /// write lease; it keeps the session from being retired underneath.
    pub fn record_arrival(
        &self,
        file_id: &FileId,
        index: u32,
        total: u32,
        file_name: &FileName,
    ) -> Result<Arrival, AssemblerError> {
        validate_index(index, total)?;
        loop {
            let handle = {
                let mut table = lock(&self.table);
                table
                    .sessions
                    .entry(file_id.clone())
                    .or_insert_with(|| {
                        debug!(%file_id, total, "opening upload session");
                        Arc::new(Mutex::new(Session::new(
                            file_id.clone(),
                            file_name.clone(),
                            total,
                        )))
                    })
                    .clone()
            };
            let mut session = lock(&handle);
            if session.retired {
                continue;
            }
            return session.record(index, total);
        }
    }

    /// Seeds a session from fragments already on disk. Does nothing when a
    /// session exists. Returns the resulting arrival state otherwise.
    pub fn restore(
        &self,
        file_id: &FileId,
        file_name: &FileName,
        total: u32,
        durable: &BTreeSet<u32>,
    ) -> Result<Option<Arrival>, AssemblerError> {
        if total == 0 {
            return Err(AssemblerError::InvalidChunk(
                "totalChunks must be at least 1".to_string(),
            ));
        }
        let mut table = lock(&self.table);
        if table.sessions.contains_key(file_id) {
            return Ok(None);
        }
        let mut session = Session::new(file_id.clone(), file_name.clone(), total);
        session
            .received
            .extend(durable.iter().copied().filter(|index| *index < total));
        let arrival = match session.claim_if_complete() {
            Some(ticket) => Arrival::ReadyToCombine(ticket),
            None => Arrival::Pending {
                received: session.received_count(),
                total,
            },
        };
        debug!(%file_id, received = session.received_count(), total, "restored upload session");
        table
            .sessions
            .insert(file_id.clone(), Arc::new(Mutex::new(session)));
        Ok(Some(arrival))
    }

    pub fn mark_done(&self, file_id: &FileId) -> Result<(), AssemblerError> {
        self.finish(file_id, SessionState::Done, None)
    }

    pub fn mark_failed(&self, file_id: &FileId, reason: &str) -> Result<(), AssemblerError> {
        self.finish(file_id, SessionState::Failed, Some(reason.to_string()))
    }

    fn finish(
        &self,
        file_id: &FileId,
        state: SessionState,
        failure: Option<String>,
    ) -> Result<(), AssemblerError> {
        let handle = lock(&self.table)
            .sessions
            .get(file_id)
            .cloned()
            .ok_or_else(|| AssemblerError::UploadNotFound(file_id.to_string()))?;
        let mut session = lock(&handle);
        if state == SessionState::Done && session.state != SessionState::Combining {
            warn!(%file_id, current = %session.state, "ignoring completion of a session that is not combining");
            return Ok(());
        }
        session.state = state;
        session.failure = failure;
        session.last_activity = Instant::now();
        Ok(())
    }

    /// Drops a session that is not being combined. Returns the state it had,
    /// if there was one, and the lease under which its storage must be
    /// reclaimed.
    pub fn abandon(
        &self,
        file_id: &FileId,
    ) -> Result<(Option<SessionState>, ReclaimLease<'_>), AssemblerError> {
        let lease = self.reclaim_lease(file_id);
        let mut table = lock(&self.table);
        let existing = table.sessions.get(file_id).cloned();
        let Some(handle) = existing else {
            drop(table);
            return Ok((None, lease));
        };
        let mut session = lock(&handle);
        if session.state == SessionState::Combining {
            return Err(AssemblerError::UploadBusy {
                file_id: file_id.to_string(),
            });
        }
        session.retired = true;
        let previous = session.state;
        drop(session);
        table.sessions.remove(file_id);
        drop(table);
        Ok((Some(previous), lease))
    }

    /// Forgets expired tombstones and retires idle open sessions one at a
    /// time. `reclaim` runs for each retired upload while arrivals for it are
    /// held off. Returns the retired uploads.
    pub fn sweep(&self, now: Instant, mut reclaim: impl FnMut(&FileId)) -> Vec<FileId> {
        let idle = {
            let mut table = lock(&self.table);
            let mut idle = Vec::new();
            table.sessions.retain(|file_id, handle| {
                let mut session = lock(&**handle);
                if session.is_idle(now, self.idle_timeout) {
                    idle.push((file_id.clone(), Arc::clone(handle)));
                } else if session.is_expired_tombstone(now, self.tombstone_ttl) {
                    session.retired = true;
                    return false;
                }
                true
            });
            idle
        };

        let mut retired = Vec::new();
        for (file_id, handle) in idle {
            if let Some(lease) = self.retire_idle(&file_id, &handle, now) {
                reclaim(lease.file_id());
                retired.push(file_id);
            }
        }
        retired
    }

    pub fn snapshot(&self, file_id: &FileId) -> Option<SessionSnapshot> {
        let handle = lock(&self.table).sessions.get(file_id).cloned()?;
        let session = lock(&handle);
        Some(session.snapshot())
    }

    pub fn len(&self) -> usize {
        lock(&self.table).sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Takes the reclaim lease and retires `handle` if it is still the idle
    /// session for `file_id`. `None` when an arrival revived it or someone
    /// else retired it first.
    fn retire_idle(
        &self,
        file_id: &FileId,
        handle: &SessionHandle,
        now: Instant,
    ) -> Option<ReclaimLease<'_>> {
        let lease = self.reclaim_lease(file_id);
        let mut table = lock(&self.table);
        let current = table
            .sessions
            .get(file_id)
            .is_some_and(|entry| Arc::ptr_eq(entry, handle));
        if !current {
            return None;
        }
        let mut session = lock(handle);
        if !session.is_idle(now, self.idle_timeout) {
            return None;
        }
        session.retired = true;
        drop(session);
        table.sessions.remove(file_id);
        drop(table);
        Some(lease)
    }

    fn enter<'a>(&'a self, mut table: MutexGuard<'_, Table>, file_id: &FileId) -> WriteLease<'a> {
        table
            .namespaces
            .entry(file_id.clone())
            .or_default()
            .writers += 1;
        drop(table);
        WriteLease {
            tracker: self,
            file_id: file_id.clone(),
        }
    }

    fn release(&self, file_id: &FileId, update: impl FnOnce(&mut NamespaceAccess)) {
        lock(&self.table).release(file_id, update);
        self.released.notify_all();
    }

    fn wait<'a>(&self, table: MutexGuard<'a, Table>) -> MutexGuard<'a, Table> {
        self.released
            .wait(table)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_for_reclaim<'a>(
        &self,
        mut table: MutexGuard<'a, Table>,
        file_id: &FileId,
    ) -> MutexGuard<'a, Table> {
        while table.is_reclaiming(file_id) {
            table = self.wait(table);
        }
        table
    }
}

impl Default for UploadTracker {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60), Duration::from_secs(10 * 60))
    }
}
