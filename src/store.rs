use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::time::{Duration, SystemTime};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::Builder;
use tracing::debug;

use crate::domain::FileId;

const FRAGMENT_EXT: &str = "part";

/// Durable fragment storage, namespaced per upload.
///
/// Implementations must never expose a partially written fragment to `read`.
/// Retrying is the caller's business; errors are reported with their underlying
/// `io::ErrorKind` so the caller can tell transient failures apart.
pub trait ChunkStore: Send + Sync {
    /// Stores `data` as fragment `index`, replacing any previous copy.
    fn put(&self, file_id: &FileId, index: u32, data: &[u8]) -> io::Result<()>;

    /// Indices currently durable for `file_id`. Empty when the namespace does not exist.
    fn list(&self, file_id: &FileId) -> io::Result<BTreeSet<u32>>;

    /// Opens fragment `index`; fails with `io::ErrorKind::NotFound` when absent.
    fn read(&self, file_id: &FileId, index: u32) -> io::Result<Box<dyn Read + Send>>;

    /// Removes the whole namespace. Removing a namespace that does not exist succeeds.
    fn cleanup(&self, file_id: &FileId) -> io::Result<()>;
}

/// `<root>/<file id>/<index>.part`
#[derive(Debug, Clone)]
pub struct FsChunkStore {
    root: Utf8PathBuf,
}

impl FsChunkStore {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(self.root.as_std_path())
    }

    pub fn namespace_dir(&self, file_id: &FileId) -> Utf8PathBuf {
        self.root.join(file_id.as_str())
    }

    pub fn fragment_path(&self, file_id: &FileId, index: u32) -> Utf8PathBuf {
        self.namespace_dir(file_id)
            .join(format!("{index}.{FRAGMENT_EXT}"))
    }

    /// Namespaces whose newest entry is older than `idle`. Used to reclaim
    /// storage when no in-memory session survives, e.g. after a restart.
    pub fn stale_namespaces(&self, idle: Duration) -> io::Result<Vec<FileId>> {
        let entries = match fs::read_dir(self.root.as_std_path()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        let now = SystemTime::now();
        let mut stale = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(file_id) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<FileId>().ok())
            else {
                continue;
            };
            let newest = newest_modification(&entry.path())?;
            let age = now.duration_since(newest).unwrap_or_default();
            if age > idle {
                stale.push(file_id);
            }
        }
        stale.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(stale)
    }
}

impl ChunkStore for FsChunkStore {
    fn put(&self, file_id: &FileId, index: u32, data: &[u8]) -> io::Result<()> {
        let dir = self.namespace_dir(file_id);
        fs::create_dir_all(dir.as_std_path())?;
        let mut temp = Builder::new()
            .prefix(&format!(".{index}."))
            .suffix(".tmp")
            .tempfile_in(dir.as_std_path())?;
        temp.write_all(data)?;
        temp.as_file().sync_all()?;
        let target = self.fragment_path(file_id, index);
        temp.persist(target.as_std_path()).map_err(|err| err.error)?;
        debug!(%file_id, index, bytes = data.len(), "fragment stored");
        Ok(())
    }

    fn list(&self, file_id: &FileId) -> io::Result<BTreeSet<u32>> {
        let dir = self.namespace_dir(file_id);
        let entries = match fs::read_dir(dir.as_std_path()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
            Err(err) => return Err(err),
        };
        let mut indices = BTreeSet::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(index) = parse_fragment_name(name) {
                indices.insert(index);
            }
        }
        Ok(indices)
    }

    fn read(&self, file_id: &FileId, index: u32) -> io::Result<Box<dyn Read + Send>> {
        let file = File::open(self.fragment_path(file_id, index).as_std_path())?;
        Ok(Box::new(file))
    }

    fn cleanup(&self, file_id: &FileId) -> io::Result<()> {
        match fs::remove_dir_all(self.namespace_dir(file_id).as_std_path()) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn parse_fragment_name(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(FRAGMENT_EXT)?.strip_suffix('.')?;
    if stem.is_empty() || !stem.chars().all(|ch| ch.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

fn newest_modification(dir: &std::path::Path) -> io::Result<SystemTime> {
    let mut newest = fs::metadata(dir)?.modified()?;
    for entry in fs::read_dir(dir)? {
        let modified = entry?.metadata()?.modified()?;
        if modified > newest {
            newest = modified;
        }
    }
    Ok(newest)
}
