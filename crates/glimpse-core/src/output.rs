//! Result output as JSON or JSON Lines, and reading it back.
//!
//! JSONL is written one job at a time as results arrive, so an interrupted
//! run leaves a usable file that a later run can skip over.

use serde::Deserialize;
use std::collections::HashSet;
use std::io::{self, BufRead, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use crate::batch::PathSetIndex;
use crate::types::JobResult;

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// One JSON array written when the batch ends
    Json,
    /// One JSON object per line, written as each job finishes
    JsonLines,
}

impl OutputFormat {
    /// Parse format from string (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "json" => Some(Self::Json),
            "jsonl" | "jsonlines" | "ndjson" => Some(Self::JsonLines),
            _ => None,
        }
    }
}

/// Writes job results in the chosen format.
pub struct ResultWriter<W: Write> {
    writer: W,
    format: OutputFormat,
    pretty: bool,
    pending: Vec<JobResult>,
    written: usize,
}

impl<W: Write> ResultWriter<W> {
    /// `pretty` only affects the JSON array format.
    pub fn new(writer: W, format: OutputFormat, pretty: bool) -> Self {
        Self {
            writer,
            format,
            pretty,
            pending: Vec::new(),
            written: 0,
        }
    }

    /// Record one result. JSONL writes and flushes immediately.
    pub fn push(&mut self, result: &JobResult) -> io::Result<()> {
        match self.format {
            OutputFormat::JsonLines => {
                serde_json::to_writer(&mut self.writer, result).map_err(io::Error::other)?;
                writeln!(self.writer)?;
                self.writer.flush()?;
                self.written += 1;
            }
            OutputFormat::Json => self.pending.push(result.clone()),
        }
        Ok(())
    }

    /// Write anything buffered and return the underlying writer.
    pub fn finish(mut self) -> io::Result<W> {
        if self.format == OutputFormat::Json {
            if self.pretty {
                serde_json::to_writer_pretty(&mut self.writer, &self.pending)
                    .map_err(io::Error::other)?;
            } else {
                serde_json::to_writer(&mut self.writer, &self.pending).map_err(io::Error::other)?;
            }
            writeln!(self.writer)?;
            self.written += self.pending.len();
        }
        self.writer.flush()?;
        Ok(self.writer)
    }

    /// Results written so far.
    pub fn written(&self) -> usize {
        self.written
    }
}

#[derive(Deserialize)]
struct RecordedJob {
    image: PathBuf,
}

#[derive(Deserialize)]
struct RecordedResult {
    job: RecordedJob,
    status: String,
}

/// Collect images already described in a JSONL result file.
///
/// Lines that don't parse are skipped; a partially written last line is
/// normal after an interrupted run.
pub fn described_images<R: BufRead>(reader: R) -> io::Result<PathSetIndex> {
    let mut paths = HashSet::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<RecordedResult>(&line) {
            Ok(record) if record.status == "described" => {
                paths.insert(record.job.image);
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Skipping unreadable result line: {e}"),
        }
    }
    Ok(PathSetIndex::new(paths))
}

/// End a result file that stops mid-line so appended records start on
/// their own line.
pub fn terminate_last_line<F: Read + Write + Seek>(file: &mut F) -> io::Result<()> {
    if file.seek(SeekFrom::End(0))? == 0 {
        return Ok(());
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    if last[0] != b'\n' {
        file.write_all(b"\n")?;
    }
    Ok(())
}
