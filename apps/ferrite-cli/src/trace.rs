//! Instruction trace reading.
//!
//! Traces are plain text, one memory operation per line:
//!
//! ```text
//! <inst-number> <R|W> <hex-byte-address>
//! ```
//!
//! `inst-number` is the (monotonic) instruction count at which the access
//! occurs; the gap between records models the non-memory instructions in
//! between. Blank lines and `#` comments are skipped. When the trace runs
//! out, the core rewinds it and keeps going until the instruction budget is
//! met.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TraceError {
    #[error("i/o error on trace {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: expected `<inst> <R|W> <hex addr>`")]
    Malformed { path: PathBuf, line: usize },
    #[error("{path}:{line}: bad access kind {kind:?} (expected R or W)")]
    BadKind {
        path: PathBuf,
        line: usize,
        kind: String,
    },
    #[error("trace {path} contains no records")]
    Empty { path: PathBuf },
}

/// One memory access from the trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceRecord {
    pub inst_num: u64,
    pub is_write: bool,
    /// Virtual byte address.
    pub vaddr: u64,
}

pub struct TraceReader {
    path: PathBuf,
    lines: std::io::Lines<BufReader<File>>,
    line_no: usize,
}

impl TraceReader {
    pub fn open(path: &Path) -> Result<Self, TraceError> {
        let file = File::open(path).map_err(|source| TraceError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            lines: BufReader::new(file).lines(),
            line_no: 0,
        })
    }

    /// Next record, or `None` at end of file.
    pub fn next_record(&mut self) -> Result<Option<TraceRecord>, TraceError> {
        loop {
            let Some(line) = self.lines.next() else {
                return Ok(None);
            };
            self.line_no += 1;
            let line = line.map_err(|source| TraceError::Io {
                path: self.path.clone(),
                source,
            })?;
            let body = line.split('#').next().unwrap_or("").trim();
            if body.is_empty() {
                continue;
            }
            return Ok(Some(self.parse(body)?));
        }
    }

    /// Reopens the file at the beginning.
    pub fn rewind(&mut self) -> Result<(), TraceError> {
        let file = File::open(&self.path).map_err(|source| TraceError::Io {
            path: self.path.clone(),
            source,
        })?;
        self.lines = BufReader::new(file).lines();
        self.line_no = 0;
        Ok(())
    }

    fn parse(&self, body: &str) -> Result<TraceRecord, TraceError> {
        let malformed = || TraceError::Malformed {
            path: self.path.clone(),
            line: self.line_no,
        };
        let mut fields = body.split_whitespace();
        let inst_num = fields
            .next()
            .and_then(|f| f.parse::<u64>().ok())
            .ok_or_else(malformed)?;
        let kind = fields.next().ok_or_else(malformed)?;
        let is_write = match kind {
            "R" | "r" => false,
            "W" | "w" => true,
            other => {
                return Err(TraceError::BadKind {
                    path: self.path.clone(),
                    line: self.line_no,
                    kind: other.to_string(),
                });
            }
        };
        let addr = fields.next().ok_or_else(malformed)?;
        let vaddr = u64::from_str_radix(addr.trim_start_matches("0x"), 16)
            .map_err(|_| malformed())?;
        if fields.next().is_some() {
            return Err(malformed());
        }
        Ok(TraceRecord {
            inst_num,
            is_write,
            vaddr,
        })
    }
}
