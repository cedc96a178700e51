
use anyhow::{Context, Result};
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct PafRecord {

    pub query_name: String,

    pub query_len: u64,

    pub query_start: u64,

    pub query_end: u64,

    pub strand: char,

    pub target_name: String,

    pub target_len: u64,

    pub target_start: u64,

    pub target_end: u64,

    pub matches: u64,

    pub aln_len: u64,

    pub mapq: u8,
}

impl PafRecord {

    pub fn parse_line(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 12 {
            anyhow::bail!("Invalid PAF line: fewer than 12 fields");
        }

        let record = Self {
            query_name: fields[0].to_string(),
            query_len: fields[1].parse().context("Invalid query length")?,
            query_start: fields[2].parse().context("Invalid query start")?,
            query_end: fields[3].parse().context("Invalid query end")?,
            strand: fields[4].chars().next().unwrap_or('+'),
            target_name: fields[5].to_string(),
            target_len: fields[6].parse().context("Invalid target length")?,
            target_start: fields[7].parse().context("Invalid target start")?,
            target_end: fields[8].parse().context("Invalid target end")?,
            matches: fields[9].parse().context("Invalid matches count")?,
            aln_len: fields[10].parse().context("Invalid alignment block length")?,
            mapq: fields[11].parse().context("Invalid mapping quality")?,
        };

        // Reject records that violate the coordinate contract instead of
        // letting them poison coverage accounting downstream
        if record.query_start >= record.query_end {
            anyhow::bail!(
                "Invalid PAF line: query interval [{}, {}) is empty",
                record.query_start,
                record.query_end
            );
        }
        if record.query_end > record.query_len {
            anyhow::bail!(
                "Invalid PAF line: query end {} exceeds query length {}",
                record.query_end,
                record.query_len
            );
        }
        if record.matches > record.aln_len {
            anyhow::bail!(
                "Invalid PAF line: matches {} exceed block length {}",
                record.matches,
                record.aln_len
            );
        }

        Ok(record)
    }

    /// Fraction of matching bases in the aligned block, on [0, 1].
    pub fn identity(&self) -> f64 {
        if self.aln_len == 0 {
            return 0.0;
        }
        self.matches as f64 / self.aln_len as f64
    }
}

// Ordered by query name only, so an external sort groups records per
// query without imposing any within-group order.
impl PartialEq for PafRecord {
    fn eq(&self, other: &Self) -> bool {
        self.query_name == other.query_name
    }
}

impl Eq for PafRecord {}

impl PartialOrd for PafRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PafRecord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.query_name.cmp(&other.query_name)
    }
}

pub struct PafReader {
    reader: BufReader<File>,
    line_buf: String,
}

impl PafReader {

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("Failed to open PAF: {}", path.as_ref().display()))?;
        Ok(Self {
            reader: BufReader::with_capacity(1024 * 1024, file),
            line_buf: String::with_capacity(512),
        })
    }

    pub fn read_next(&mut self) -> Result<Option<PafRecord>> {
        loop {
            self.line_buf.clear();
            if self.reader.read_line(&mut self.line_buf)? == 0 {
                return Ok(None);
            }
            let line = self.line_buf.trim_end();
            if line.is_empty() {
                continue;
            }
            return Ok(Some(PafRecord::parse_line(line)?));
        }
    }
}

impl Iterator for PafReader {
    type Item = Result<PafRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_next() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_paf_line() {
        let line = "contig1\t1500\t10\t1400\t+\tNC_000913.3\t4641652\t100\t1490\t1350\t1390\t60";
        let record = PafRecord::parse_line(line).unwrap();

        assert_eq!(record.query_name, "contig1");
        assert_eq!(record.query_len, 1500);
        assert_eq!(record.query_start, 10);
        assert_eq!(record.query_end, 1400);
        assert_eq!(record.strand, '+');
        assert_eq!(record.target_name, "NC_000913.3");
        assert_eq!(record.matches, 1350);
        assert_eq!(record.aln_len, 1390);
        assert_eq!(record.mapq, 60);
    }

    #[test]
    fn test_extra_tag_columns_ignored() {
        let line = "q\t100\t0\t90\t+\tt\t200\t0\t90\t85\t90\t60\ttp:A:P\tcm:i:20";
        let record = PafRecord::parse_line(line).unwrap();
        assert_eq!(record.mapq, 60);
    }

    #[test]
    fn test_identity_on_unit_scale() {
        let line = "q\t100\t0\t100\t+\tt\t200\t0\t100\t95\t100\t60";
        let record = PafRecord::parse_line(line).unwrap();
        assert_eq!(record.identity(), 0.95);
    }

    #[test]
    fn test_empty_interval_rejected() {
        let line = "q\t100\t50\t50\t+\tt\t200\t0\t100\t95\t100\t60";
        assert!(PafRecord::parse_line(line).is_err());
    }

    #[test]
    fn test_end_past_query_len_rejected() {
        let line = "q\t100\t0\t150\t+\tt\t200\t0\t100\t95\t100\t60";
        assert!(PafRecord::parse_line(line).is_err());
    }

    #[test]
    fn test_matches_above_block_len_rejected() {
        let line = "q\t100\t0\t90\t+\tt\t200\t0\t100\t150\t100\t60";
        assert!(PafRecord::parse_line(line).is_err());
    }

    #[test]
    fn test_invalid_paf_line() {
        assert!(PafRecord::parse_line("incomplete\tline").is_err());
    }

    #[test]
    fn test_ordering_groups_by_query() {
        let a = PafRecord::parse_line("a\t100\t0\t90\t+\tt\t200\t0\t90\t85\t90\t60").unwrap();
        let b = PafRecord::parse_line("b\t100\t0\t90\t+\tt\t200\t0\t90\t85\t90\t60").unwrap();
        assert!(a < b);
    }
}
