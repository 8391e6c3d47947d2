use std::collections::BTreeSet;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use assert_matches::assert_matches;
use camino::Utf8PathBuf;

use chunk_assembler::assembler::{Assembler, ChunkOutcome};
use chunk_assembler::config::ResolvedConfig;
use chunk_assembler::domain::{ChunkRequest, FileId, FileName};
use chunk_assembler::error::AssemblerError;
use chunk_assembler::metadata::{JsonlMetadataSink, MetadataSink, UploadedFileRecord};
use chunk_assembler::store::{ChunkStore, FsChunkStore};
use chunk_assembler::tracker::SessionState;

const CHUNKS: [&[u8]; 4] = [b"alpha-", b"bravo-", b"charlie-", b"delta"];

#[derive(Default)]
struct MemorySink {
    records: Mutex<Vec<UploadedFileRecord>>,
}

impl MetadataSink for MemorySink {
    fn record(&self, record: &UploadedFileRecord) -> Result<(), AssemblerError> {
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

struct BrokenSink;

impl MetadataSink for BrokenSink {
    fn record(&self, _record: &UploadedFileRecord) -> Result<(), AssemblerError> {
        Err(AssemblerError::MetadataSink("database unavailable".to_string()))
    }
}

/// Wraps the filesystem store: fails the first `put_failures` writes and
/// counts how often each fragment is read.
struct InstrumentedStore {
    inner: FsChunkStore,
    put_failures: AtomicUsize,
    puts: AtomicUsize,
    reads: Mutex<Vec<u32>>,
}

impl InstrumentedStore {
    fn new(inner: FsChunkStore, put_failures: usize) -> Self {
        Self {
            inner,
            put_failures: AtomicUsize::new(put_failures),
            puts: AtomicUsize::new(0),
            reads: Mutex::new(Vec::new()),
        }
    }
}

impl ChunkStore for InstrumentedStore {
    fn put(&self, file_id: &FileId, index: u32, data: &[u8]) -> io::Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.put_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.put_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(io::Error::new(
                io::ErrorKind::ResourceBusy,
                "file locked by another process",
            ));
        }
        self.inner.put(file_id, index, data)
    }

    fn list(&self, file_id: &FileId) -> io::Result<BTreeSet<u32>> {
        self.inner.list(file_id)
    }

    fn read(&self, file_id: &FileId, index: u32) -> io::Result<Box<dyn Read + Send>> {
        self.reads.lock().unwrap().push(index);
        self.inner.read(file_id, index)
    }

    fn cleanup(&self, file_id: &FileId) -> io::Result<()> {
        self.inner.cleanup(file_id)
    }
}

/// Blocks the first cleanup between `entered` and `release`.
struct GatedStore {
    inner: FsChunkStore,
    armed: AtomicBool,
    entered: Barrier,
    release: Barrier,
}

impl ChunkStore for GatedStore {
    fn put(&self, file_id: &FileId, index: u32, data: &[u8]) -> io::Result<()> {
        self.inner.put(file_id, index, data)
    }

    fn list(&self, file_id: &FileId) -> io::Result<BTreeSet<u32>> {
        self.inner.list(file_id)
    }

    fn read(&self, file_id: &FileId, index: u32) -> io::Result<Box<dyn Read + Send>> {
        self.inner.read(file_id, index)
    }

    fn cleanup(&self, file_id: &FileId) -> io::Result<()> {
        if self.armed.swap(false, Ordering::SeqCst) {
            self.entered.wait();
            self.release.wait();
        }
        self.inner.cleanup(file_id)
    }
}

struct BrokenPipe;

impl Read for BrokenPipe {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Err(io::Error::new(io::ErrorKind::ConnectionAborted, "client went away"))
    }
}

fn setup() -> (tempfile::TempDir, ResolvedConfig) {
    let temp = tempfile::tempdir().unwrap();
    let root = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
    (temp, ResolvedConfig::under(root))
}

fn request(index: u32, total: u32) -> ChunkRequest {
    ChunkRequest::parse("abc", "report.txt", index, total).unwrap()
}

fn fs_assembler(
    config: &ResolvedConfig,
    put_failures: usize,
) -> Assembler<InstrumentedStore, Arc<MemorySink>> {
    let store = InstrumentedStore::new(FsChunkStore::new(config.temp_root.clone()), put_failures);
    Assembler::new(config, store, Arc::new(MemorySink::default()))
}

#[test]
fn out_of_order_delivery_completes_once_in_index_order() {
    let (_temp, config) = setup();
    let sink = Arc::new(MemorySink::default());
    let store = InstrumentedStore::new(FsChunkStore::new(config.temp_root.clone()), 0);
    let assembler = Assembler::new(&config, store, Arc::clone(&sink));

    for (position, index) in [2u32, 0, 3].into_iter().enumerate() {
        let outcome = assembler
            .accept_chunk(&request(index, 4), CHUNKS[index as usize])
            .unwrap();
        assert_eq!(
            outcome,
            ChunkOutcome::Accepted {
                file_id: "abc".to_string(),
                received_count: position as u32 + 1,
                total_chunks: 4,
            }
        );
    }

    let outcome = assembler.accept_chunk(&request(1, 4), CHUNKS[1]).unwrap();
    let ChunkOutcome::Complete {
        final_path,
        bytes,
        metadata_warning,
        ..
    } = outcome
    else {
        panic!("expected completion, got {outcome:?}");
    };
    assert_eq!(metadata_warning, None);
    assert_eq!(bytes, CHUNKS.concat().len() as u64);
    assert_eq!(std::fs::read(&final_path).unwrap(), CHUNKS.concat());
    assert!(final_path.ends_with("report.txt"));

    assert_eq!(*assembler.store().reads.lock().unwrap(), vec![0, 1, 2, 3]);
    let records = sink.records.lock().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].file_name, "report.txt");
    assert_eq!(records[0].file_path, final_path);

    let id: FileId = "abc".parse().unwrap();
    assert_eq!(assembler.status(&id).unwrap().state, SessionState::Done);
    assert!(assembler.fragments(&id).unwrap().is_empty());
}

#[test]
fn redelivered_chunk_is_a_duplicate() {
    let (_temp, config) = setup();
    let assembler = fs_assembler(&config, 0);
    assembler.accept_chunk(&request(0, 4), CHUNKS[0]).unwrap();
    assembler.accept_chunk(&request(1, 4), CHUNKS[1]).unwrap();

    let outcome = assembler.accept_chunk(&request(1, 4), CHUNKS[1]).unwrap();
    assert_eq!(
        outcome,
        ChunkOutcome::Duplicate {
            file_id: "abc".to_string(),
            received_count: 2,
            total_chunks: 4,
        }
    );
    let id: FileId = "abc".parse().unwrap();
    assert_eq!(assembler.status(&id).unwrap().received_count, 2);
}

#[test]
fn conflicting_total_is_rejected_before_storage() {
    let (_temp, config) = setup();
    let assembler = fs_assembler(&config, 0);
    assembler.accept_chunk(&request(0, 4), CHUNKS[0]).unwrap();

    let err = assembler
        .accept_chunk(&request(1, 5), CHUNKS[1])
        .unwrap_err();
    assert_matches!(
        err,
        AssemblerError::InconsistentTotal {
            expected: 4,
            declared: 5,
            ..
        }
    );
    assert_eq!(assembler.store().puts.load(Ordering::SeqCst), 1);
}

#[test]
fn transient_put_failures_are_retried() {
    let (_temp, config) = setup();
    let assembler = fs_assembler(&config, 2);

    let outcome = assembler.accept_chunk(&request(0, 2), CHUNKS[0]).unwrap();
    assert_matches!(outcome, ChunkOutcome::Accepted { received_count: 1, .. });
    assert_eq!(assembler.store().puts.load(Ordering::SeqCst), 3);
}

#[test]
fn exhausted_put_retries_surface_io_error() {
    let (_temp, config) = setup();
    let assembler = fs_assembler(&config, 3);

    let err = assembler
        .accept_chunk(&request(0, 2), CHUNKS[0])
        .unwrap_err();
    assert_matches!(err, AssemblerError::IoFatal { attempts: 3, .. });
    let id: FileId = "abc".parse().unwrap();
    assert!(assembler.status(&id).is_err());
}

#[test]
fn fragment_lost_before_combine_fails_the_session() {
    let (_temp, config) = setup();
    let assembler = fs_assembler(&config, 0);
    let id: FileId = "abc".parse().unwrap();
    for index in 0..3 {
        assembler
            .accept_chunk(&request(index, 4), CHUNKS[index as usize])
            .unwrap();
    }
    let lost = assembler.store().inner.fragment_path(&id, 2);
    std::fs::remove_file(lost.as_std_path()).unwrap();

    let err = assembler
        .accept_chunk(&request(3, 4), CHUNKS[3])
        .unwrap_err();
    assert_matches!(err, AssemblerError::MissingFragment { index: 2, .. });
    assert_eq!(assembler.status(&id).unwrap().state, SessionState::Failed);
    assert!(!config.upload_root.join("report.txt").as_std_path().exists());

    assert_matches!(
        assembler.accept_chunk(&request(0, 4), CHUNKS[0]),
        Err(AssemblerError::UploadClosed {
            state: SessionState::Failed,
            ..
        })
    );
}

#[test]
fn empty_and_out_of_range_chunks_are_invalid() {
    let (_temp, config) = setup();
    let assembler = fs_assembler(&config, 0);
    assert_matches!(
        assembler.accept_chunk(&request(0, 2), &b""[..]),
        Err(AssemblerError::InvalidChunk(_))
    );
    assert_matches!(
        assembler.accept_chunk(&request(2, 2), CHUNKS[0]),
        Err(AssemblerError::InvalidChunk(_))
    );
    assert_eq!(assembler.store().puts.load(Ordering::SeqCst), 0);
}

#[test]
fn concurrent_final_chunks_combine_exactly_once() {
    let (_temp, config) = setup();
    let assembler = fs_assembler(&config, 0);
    for index in 0..3 {
        assembler
            .accept_chunk(&request(index, 4), CHUNKS[index as usize])
            .unwrap();
    }

    let contenders = 8;
    let barrier = Barrier::new(contenders);
    let outcomes = thread::scope(|scope| {
        let handles = (0..contenders)
            .map(|_| {
                scope.spawn(|| {
                    barrier.wait();
                    assembler.accept_chunk(&request(3, 4), CHUNKS[3])
                })
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .collect::<Vec<_>>()
    });

    let completions = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Ok(ChunkOutcome::Complete { .. })))
        .count();
    assert_eq!(completions, 1);
    for outcome in &outcomes {
        assert_matches!(
            outcome,
            Ok(ChunkOutcome::Complete { .. })
                | Ok(ChunkOutcome::AlreadyCombining { .. })
                | Ok(ChunkOutcome::Duplicate { .. })
                | Err(AssemblerError::UploadClosed {
                    state: SessionState::Done,
                    ..
                })
        );
    }
    // Each fragment was read by exactly one combine.
    assert_eq!(*assembler.store().reads.lock().unwrap(), vec![0, 1, 2, 3]);
    assert_eq!(
        std::fs::read(config.upload_root.join("report.txt").as_std_path()).unwrap(),
        CHUNKS.concat()
    );
}

#[test]
fn parallel_distinct_chunks_complete_once() {
    let (_temp, config) = setup();
    let assembler = fs_assembler(&config, 0);
    let total = 32u32;
    let payloads = (0..total)
        .map(|index| format!("[{index:02}]").into_bytes())
        .collect::<Vec<_>>();

    let outcomes = thread::scope(|scope| {
        let handles = (0..total)
            .rev()
            .map(|index| {
                let payload = &payloads[index as usize];
                let assembler = &assembler;
                scope.spawn(move || assembler.accept_chunk(&request(index, total), &payload[..]))
            })
            .collect::<Vec<_>>();
        handles
            .into_iter()
            .map(|handle| handle.join().unwrap().unwrap())
            .collect::<Vec<_>>()
    });

    assert_eq!(outcomes.iter().filter(|outcome| outcome.is_complete()).count(), 1);
    assert_eq!(
        std::fs::read(config.upload_root.join("report.txt").as_std_path()).unwrap(),
        payloads.concat()
    );
}

#[test]
fn metadata_failure_is_a_degraded_success() {
    let (_temp, config) = setup();
    let store = FsChunkStore::new(config.temp_root.clone());
    let assembler = Assembler::new(&config, store, BrokenSink);

    let outcome = assembler
        .accept_chunk(&request(0, 1), &b"only chunk"[..])
        .unwrap();
    assert_matches!(
        outcome,
        ChunkOutcome::Complete { metadata_warning: Some(ref warning), .. } if warning.contains("database unavailable")
    );
    assert!(config.upload_root.join("report.txt").as_std_path().exists());
}

#[test]
fn recover_rebuilds_session_from_disk() {
    let (_temp, config) = setup();
    let id: FileId = "abc".parse().unwrap();
    {
        let first = Assembler::open(&config).unwrap();
        first.accept_chunk(&request(0, 3), CHUNKS[0]).unwrap();
        first.accept_chunk(&request(2, 3), CHUNKS[2]).unwrap();
    }

    let restarted = Assembler::open(&config).unwrap();
    let name: FileName = "report.txt".parse().unwrap();
    let recovered = restarted.recover(&id, &name, 3).unwrap();
    assert_eq!(
        recovered,
        Some(ChunkOutcome::Accepted {
            file_id: "abc".to_string(),
            received_count: 2,
            total_chunks: 3,
        })
    );
    assert_eq!(restarted.recover(&id, &name, 3).unwrap(), None);

    let outcome = restarted.accept_chunk(&request(1, 3), CHUNKS[1]).unwrap();
    assert!(outcome.is_complete());

    let records = JsonlMetadataSink::read_all(&config.metadata_log).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
        std::fs::read(config.upload_root.join("report.txt").as_std_path()).unwrap(),
        [CHUNKS[0], CHUNKS[1], CHUNKS[2]].concat()
    );
}

#[test]
fn abandon_reclaims_storage() {
    let (_temp, config) = setup();
    let assembler = fs_assembler(&config, 0);
    let id: FileId = "abc".parse().unwrap();
    assembler.accept_chunk(&request(0, 2), CHUNKS[0]).unwrap();
    assert_eq!(assembler.fragments(&id).unwrap(), BTreeSet::from([0]));

    assert!(assembler.abandon(&id).unwrap());
    assert!(assembler.fragments(&id).unwrap().is_empty());
    assert!(!assembler.abandon(&id).unwrap());

    let outcome = assembler.accept_chunk(&request(0, 3), CHUNKS[0]).unwrap();
    assert_matches!(outcome, ChunkOutcome::Accepted { total_chunks: 3, .. });
}

#[test]
fn idle_sessions_are_swept() {
    let (_temp, mut config) = setup();
    config.idle_timeout = Duration::from_millis(10);
    let assembler = fs_assembler(&config, 0);
    let id: FileId = "abc".parse().unwrap();
    assembler.accept_chunk(&request(0, 2), CHUNKS[0]).unwrap();

    thread::sleep(Duration::from_millis(30));
    assert_eq!(assembler.sweep_idle(), vec![id.clone()]);
    assert!(assembler.fragments(&id).unwrap().is_empty());
    assert!(assembler.status(&id).is_err());
}

#[test]
fn idle_session_is_replaced_on_next_chunk() {
    let (_temp, mut config) = setup();
    config.idle_timeout = Duration::from_millis(10);
    let assembler = fs_assembler(&config, 0);
    let id: FileId = "abc".parse().unwrap();
    assembler.accept_chunk(&request(0, 3), CHUNKS[0]).unwrap();
    assembler.accept_chunk(&request(2, 3), CHUNKS[2]).unwrap();

    thread::sleep(Duration::from_millis(30));
    let outcome = assembler.accept_chunk(&request(0, 2), CHUNKS[0]).unwrap();
    assert_matches!(
        outcome,
        ChunkOutcome::Accepted {
            received_count: 1,
            total_chunks: 2,
            ..
        }
    );
    assert_eq!(assembler.fragments(&id).unwrap(), BTreeSet::from([0]));

    let outcome = assembler.accept_chunk(&request(1, 2), CHUNKS[1]).unwrap();
    assert!(outcome.is_complete());
    assert_eq!(
        std::fs::read(config.upload_root.join("report.txt").as_std_path()).unwrap(),
        [CHUNKS[0], CHUNKS[1]].concat()
    );
}

#[test]
fn chunk_sent_during_abandon_survives_cleanup() {
    let (_temp, config) = setup();
    let store = GatedStore {
        inner: FsChunkStore::new(config.temp_root.clone()),
        armed: AtomicBool::new(true),
        entered: Barrier::new(2),
        release: Barrier::new(2),
    };
    let assembler = Assembler::new(&config, store, Arc::new(MemorySink::default()));
    let id: FileId = "abc".parse().unwrap();
    assembler.accept_chunk(&request(0, 2), CHUNKS[0]).unwrap();

    let resent = thread::scope(|scope| {
        let abandoner = scope.spawn(|| assembler.abandon(&id));
        assembler.store().entered.wait();

        let resender = scope.spawn(|| assembler.accept_chunk(&request(0, 2), CHUNKS[0]));
        thread::sleep(Duration::from_millis(50));
        assert!(!resender.is_finished());

        assembler.store().release.wait();
        assert!(abandoner.join().unwrap().unwrap());
        resender.join().unwrap()
    });
    assert_matches!(
        resent,
        Ok(ChunkOutcome::Accepted {
            received_count: 1,
            ..
        })
    );
    assert_eq!(assembler.fragments(&id).unwrap(), BTreeSet::from([0]));

    let outcome = assembler.accept_chunk(&request(1, 2), CHUNKS[1]).unwrap();
    assert!(outcome.is_complete());
    assert_eq!(
        std::fs::read(config.upload_root.join("report.txt").as_std_path()).unwrap(),
        [CHUNKS[0], CHUNKS[1]].concat()
    );
}

#[test]
fn finished_sessions_are_swept_while_serving_chunks() {
    let (_temp, mut config) = setup();
    config.idle_timeout = Duration::from_millis(20);
    config.tombstone_ttl = Duration::ZERO;
    config.sweep_interval = Duration::ZERO;
    let assembler = fs_assembler(&config, 0);

    let stalled: FileId = "stalled".parse().unwrap();
    assembler
        .accept_chunk(&ChunkRequest::parse("stalled", "s.bin", 0, 2).unwrap(), CHUNKS[0])
        .unwrap();
    for id in ["a", "b", "c"] {
        let request = ChunkRequest::parse(id, &format!("{id}.txt"), 0, 1).unwrap();
        assert!(assembler.accept_chunk(&request, CHUNKS[1]).unwrap().is_complete());
    }

    thread::sleep(Duration::from_millis(40));
    assembler
        .accept_chunk(&ChunkRequest::parse("fresh", "f.bin", 0, 2).unwrap(), CHUNKS[2])
        .unwrap();

    assert_eq!(assembler.tracker().len(), 1);
    assert!(assembler.status(&stalled).is_err());
    assert!(assembler.fragments(&stalled).unwrap().is_empty());
}

#[test]
fn metadata_log_survives_upload_with_its_name() {
    let (_temp, config) = setup();
    let assembler = Assembler::open(&config).unwrap();
    assert!(assembler.accept_chunk(&request(0, 1), CHUNKS[0]).unwrap().is_complete());

    let clash = ChunkRequest::parse("clash", "uploads.jsonl", 0, 1).unwrap();
    let outcome = assembler
        .accept_chunk(&clash, &b"not json at all\n"[..])
        .unwrap();
    assert_matches!(outcome, ChunkOutcome::Complete { metadata_warning: None, .. });

    let records = JsonlMetadataSink::read_all(&config.metadata_log).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].file_name, "uploads.jsonl");
}

#[test]
fn unreadable_payload_is_an_io_failure() {
    let (_temp, config) = setup();
    let assembler = fs_assembler(&config, 0);

    let err = assembler.accept_chunk(&request(0, 2), BrokenPipe).unwrap_err();
    assert!(!err.is_client_error());
    assert_matches!(err, AssemblerError::IoFatal { ref operation, .. } if operation == "read payload");
    assert_eq!(assembler.store().puts.load(Ordering::SeqCst), 0);
}
