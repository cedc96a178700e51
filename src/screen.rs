//! Screen-row parsing.
//!
//! The external screener reports one row per reference:
//! `similarity\tshared_hashes\tmedian_multiplicity\tp_value\treference_id`.
//! The schema is fixed; `shared_hashes` is `x/y` text carried through
//! unparsed because no selection policy uses it.

use anyhow::{Context, Result};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ScreenRow {

    pub similarity: f64,

    pub shared_hashes: String,

    pub median_multiplicity: u32,

    pub p_value: f64,

    pub reference_id: String,
}

impl ScreenRow {

    pub fn parse_line(line: &str) -> Result<Self> {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 5 {
            anyhow::bail!("Invalid screen row: fewer than 5 fields");
        }

        let similarity: f64 = fields[0].parse().context("Invalid similarity")?;
        if !(0.0..=1.0).contains(&similarity) {
            anyhow::bail!("Similarity {} outside [0,1]", similarity);
        }

        Ok(Self {
            similarity,
            shared_hashes: fields[1].to_string(),
            median_multiplicity: fields[2].parse().context("Invalid median multiplicity")?,
            p_value: fields[3].parse().context("Invalid p-value")?,
            reference_id: fields[4].to_string(),
        })
    }
}

/// Read a whole screen report. Empty lines are skipped; malformed rows
/// are errors because the schema is under our own pipeline's control.
pub fn read_screen_file(path: &Path) -> Result<Vec<ScreenRow>> {
    let file = File::open(path)
        .with_context(|| format!("Failed to open screen report: {}", path.display()))?;
    let reader = BufReader::new(file);

    let mut rows = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            continue;
        }
        let row = ScreenRow::parse_line(trimmed)
            .with_context(|| format!("screen row at line {}", lineno + 1))?;
        rows.push(row);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_screen_row() {
        let line = "0.991\t970/1000\t12\t0.0\tGCF_000005845.2_ASM584v2";
        let row = ScreenRow::parse_line(line).unwrap();
        assert_eq!(row.similarity, 0.991);
        assert_eq!(row.shared_hashes, "970/1000");
        assert_eq!(row.median_multiplicity, 12);
        assert_eq!(row.reference_id, "GCF_000005845.2_ASM584v2");
    }

    #[test]
    fn test_similarity_out_of_range_rejected() {
        let line = "1.2\t970/1000\t12\t0.0\tGCF_1";
        assert!(ScreenRow::parse_line(line).is_err());
    }

    #[test]
    fn test_short_row_rejected() {
        assert!(ScreenRow::parse_line("0.9\t1/2").is_err());
    }
}
