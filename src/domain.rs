use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::AssemblerError;

const MAX_FILE_ID_LEN: usize = 128;
const MAX_FILE_NAME_LEN: usize = 255;

fn file_id_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("valid file id pattern"))
}

/// Client-supplied upload identifier, safe to use as a directory name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId(String);

impl FileId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileId {
    type Err = AssemblerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let is_valid = !trimmed.is_empty()
            && trimmed.len() <= MAX_FILE_ID_LEN
            && trimmed != "."
            && trimmed != ".."
            && file_id_pattern().is_match(trimmed);
        if !is_valid {
            return Err(AssemblerError::InvalidFileId(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

/// Name of the final artifact. Any directory components supplied by the
/// client are dropped so the artifact always lands directly in the upload root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileName(String);

impl FileName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileName {
    type Err = AssemblerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let base = value
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .trim();
        let is_valid = !base.is_empty()
            && base.len() <= MAX_FILE_NAME_LEN
            && base != "."
            && base != ".."
            && !base.chars().any(|ch| ch.is_control());
        if !is_valid {
            return Err(AssemblerError::InvalidFileName(value.to_string()));
        }
        Ok(Self(base.to_string()))
    }
}

/// Per-request envelope handed over by the transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    pub file_id: FileId,
    pub file_name: FileName,
    pub chunk_index: u32,
    pub total_chunks: u32,
}

impl ChunkRequest {
    pub fn parse(
        file_id: &str,
        file_name: &str,
        chunk_index: u32,
        total_chunks: u32,
    ) -> Result<Self, AssemblerError> {
        Ok(Self {
            file_id: file_id.parse()?,
            file_name: file_name.parse()?,
            chunk_index,
            total_chunks,
        })
    }

    pub fn validate(&self) -> Result<(), AssemblerError> {
        validate_index(self.chunk_index, self.total_chunks)
    }
}

pub(crate) fn validate_index(index: u32, total: u32) -> Result<(), AssemblerError> {
    if total == 0 {
        return Err(AssemblerError::InvalidChunk(
            "totalChunks must be at least 1".to_string(),
        ));
    }
    if index >= total {
        return Err(AssemblerError::InvalidChunk(format!(
            "chunk index {index} outside [0, {total})"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_file_id_valid() {
        let id: FileId = " upload-42_a.b ".parse().unwrap();
        assert_eq!(id.as_str(), "upload-42_a.b");
    }

    #[test]
    fn parse_file_id_rejects_traversal() {
        assert_matches!("..".parse::<FileId>(), Err(AssemblerError::InvalidFileId(_)));
        assert_matches!("a/b".parse::<FileId>(), Err(AssemblerError::InvalidFileId(_)));
        assert_matches!("".parse::<FileId>(), Err(AssemblerError::InvalidFileId(_)));
    }

    #[test]
    fn file_name_drops_directories() {
        let name: FileName = "../../etc/passwd".parse().unwrap();
        assert_eq!(name.as_str(), "passwd");
        let name: FileName = r"C:\tmp\report.pdf".parse().unwrap();
        assert_eq!(name.as_str(), "report.pdf");
    }

    #[test]
    fn file_name_rejects_empty_base() {
        assert_matches!("dir/".parse::<FileName>(), Err(AssemblerError::InvalidFileName(_)));
        assert_matches!("..".parse::<FileName>(), Err(AssemblerError::InvalidFileName(_)));
    }

    #[test]
    fn index_bounds() {
        assert!(validate_index(3, 4).is_ok());
        assert_matches!(validate_index(4, 4), Err(AssemblerError::InvalidChunk(_)));
        assert_matches!(validate_index(0, 0), Err(AssemblerError::InvalidChunk(_)));
    }
}
