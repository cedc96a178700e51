//! Sequence I/O Module
//!
//! Provides unified reading capabilities for biological sequence files.
//! Supports both FASTA and FASTQ formats, including gzip-compressed files.
//!
//! The pipeline uses these readers to enumerate query identifiers in
//! input order (the classification table preserves that order) and to
//! count queries for the candidate selector; sequence data itself flows
//! to the external tools untouched.

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

// ============================================================================
// FASTA Format
// ============================================================================

/// A FASTA record: identifier (text after '>' up to first whitespace) and
/// the concatenated sequence lines.
#[derive(Debug, Clone)]
pub struct FastaRecord {
    pub name: String,
    pub seq: String,
}

/// Sequential FASTA reader over any byte source.
///
/// Reads records one at a time with minimal memory footprint; handles
/// multi-line sequences and strips whitespace automatically.
pub struct FastaReader<R: Read> {
    reader: BufReader<R>,
    line_buf: String,
    current_name: Option<String>,
}

impl<R: Read> FastaReader<R> {
    pub fn new(source: R) -> Result<Self> {
        let mut reader = Self {
            reader: BufReader::with_capacity(1024 * 1024, source),
            line_buf: String::with_capacity(256),
            current_name: None,
        };

        // Read first header line to initialise state
        reader.line_buf.clear();
        if reader.reader.read_line(&mut reader.line_buf)? > 0
            && reader.line_buf.starts_with('>')
        {
            reader.current_name = Some(header_name(&reader.line_buf));
        }

        Ok(reader)
    }

    pub fn read_next(&mut self) -> Result<Option<FastaRecord>> {
        let name = match self.current_name.take() {
            Some(n) => n,
            None => return Ok(None),
        };

        let mut seq = String::with_capacity(10000);

        loop {
            self.line_buf.clear();
            if self.reader.read_line(&mut self.line_buf)? == 0 {
                break;
            }

            if self.line_buf.starts_with('>') {
                self.current_name = Some(header_name(&self.line_buf));
                break;
            } else {
                seq.push_str(self.line_buf.trim_end());
            }
        }

        Ok(Some(FastaRecord { name, seq }))
    }
}

fn header_name(line: &str) -> String {
    line[1..]
        .split_whitespace()
        .next()
        .unwrap_or("")
        .to_string()
}

impl<R: Read> Iterator for FastaReader<R> {
    type Item = Result<FastaRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_next() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

/// Auto-detecting FASTA file reader. Files ending in `.gz` are opened
/// with gzip decompression, everything else as plain text.
pub enum FastaFile {
    Plain(FastaReader<File>),
    Gzipped(FastaReader<MultiGzDecoder<File>>),
}

impl FastaFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open FASTA: {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        if ext == "gz" {
            Ok(FastaFile::Gzipped(FastaReader::new(MultiGzDecoder::new(file))?))
        } else {
            Ok(FastaFile::Plain(FastaReader::new(file)?))
        }
    }

    pub fn read_next(&mut self) -> Result<Option<FastaRecord>> {
        match self {
            FastaFile::Plain(r) => r.read_next(),
            FastaFile::Gzipped(r) => r.read_next(),
        }
    }
}

impl Iterator for FastaFile {
    type Item = Result<FastaRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_next() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

// ============================================================================
// FASTQ Format
// ============================================================================

/// A FASTQ record (identifier, sequence, Phred+33 quality string).
#[derive(Debug, Clone)]
pub struct FastqRecord {
    pub name: String,
    pub seq: String,
    pub qual: String,
}

pub struct FastqReader<R: Read> {
    reader: BufReader<R>,
    line_buf: String,
}

impl<R: Read> FastqReader<R> {
    pub fn new(source: R) -> Self {
        Self {
            reader: BufReader::with_capacity(1024 * 1024, source),
            line_buf: String::with_capacity(512),
        }
    }

    /// Reads the next FASTQ record (4 lines per record).
    pub fn read_next(&mut self) -> Result<Option<FastqRecord>> {
        // Line 1: @name
        self.line_buf.clear();
        if self.reader.read_line(&mut self.line_buf)? == 0 {
            return Ok(None);
        }
        let name = self
            .line_buf
            .trim_start_matches('@')
            .trim_end()
            .split_whitespace()
            .next()
            .unwrap_or("")
            .to_string();
        if name.is_empty() {
            return Ok(None);
        }

        // Line 2: sequence
        self.line_buf.clear();
        self.reader.read_line(&mut self.line_buf)?;
        let seq = self.line_buf.trim_end().to_string();

        // Line 3: + separator, ignored
        self.line_buf.clear();
        self.reader.read_line(&mut self.line_buf)?;

        // Line 4: quality scores
        self.line_buf.clear();
        self.reader.read_line(&mut self.line_buf)?;
        let qual = self.line_buf.trim_end().to_string();

        Ok(Some(FastqRecord { name, seq, qual }))
    }
}

/// Auto-detecting FASTQ file reader (plain or `.gz`).
pub enum FastqFile {
    Plain(FastqReader<File>),
    Gzipped(FastqReader<MultiGzDecoder<File>>),
}

impl FastqFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .with_context(|| format!("Failed to open FASTQ: {}", path.display()))?;
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        if ext == "gz" {
            Ok(FastqFile::Gzipped(FastqReader::new(MultiGzDecoder::new(file))))
        } else {
            Ok(FastqFile::Plain(FastqReader::new(file)))
        }
    }

    pub fn read_next(&mut self) -> Result<Option<FastqRecord>> {
        match self {
            FastqFile::Plain(r) => r.read_next(),
            FastqFile::Gzipped(r) => r.read_next(),
        }
    }
}

/// Enumerate sequence identifiers in file order, FASTA or FASTQ decided
/// by extension (`.fq` / `.fastq`, optionally gzipped, mean FASTQ).
pub fn read_sequence_ids(path: &Path) -> Result<Vec<String>> {
    let mut ids = Vec::new();
    if is_fastq_path(path) {
        let mut reader = FastqFile::open(path)?;
        while let Some(record) = reader.read_next()? {
            ids.push(record.name);
        }
    } else {
        let mut reader = FastaFile::open(path)?;
        while let Some(record) = reader.read_next()? {
            ids.push(record.name);
        }
    }
    Ok(ids)
}

pub fn is_fastq_path(path: &Path) -> bool {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_lowercase();
    let stem = name.strip_suffix(".gz").unwrap_or(&name);
    stem.ends_with(".fq") || stem.ends_with(".fastq")
}
