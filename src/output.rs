use std::io::{self, Write};

use serde::Serialize;

use crate::assembler::ChunkOutcome;
use crate::tracker::SessionSnapshot;

#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub file_id: String,
    pub chunk_size: usize,
    pub outcomes: Vec<ChunkOutcome>,
    pub session: Option<SessionSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FragmentsResult {
    pub file_id: String,
    pub indices: Vec<u32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SweepResult {
    pub reclaimed: Vec<String>,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_outcome(result: &ChunkOutcome) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_upload(result: &UploadReport) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_fragments(result: &FragmentsResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_sweep(result: &SweepResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
