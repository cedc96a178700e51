//! Reference -> taxid registry.
//!
//! Built from the cache entry's `reference_taxonomy.tsv` once per run and
//! shared read-only. Lookups for identifiers the cache does not know
//! return the unassigned sentinel and bump a counter; they never fail the
//! stream.

use anyhow::{Context, Result};
use rustc_hash::FxHashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::taxonomy::{TaxId, Taxonomy, UNASSIGNED};

pub struct ReferenceRegistry {
    map: FxHashMap<String, TaxId>,
    unknown_lookups: AtomicU64,
}

impl ReferenceRegistry {
    /// Build from a two-column `reference_id\ttaxid` table. An optional
    /// header row is skipped. Duplicate keys whose taxids canonicalise to
    /// the same node keep the first row; a genuine conflict is a load
    /// error.
    pub fn build_from(tsv_path: &Path, taxonomy: &Taxonomy) -> Result<Self> {
        let file = File::open(tsv_path)
            .with_context(|| format!("Failed to open reference taxonomy: {}", tsv_path.display()))?;
        let reader = BufReader::new(file);

        let mut map: FxHashMap<String, TaxId> = FxHashMap::default();

        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let mut fields = line.split('\t');
            let reference_id = fields
                .next()
                .ok_or_else(|| anyhow::anyhow!("empty row at line {}", lineno + 1))?;
            let taxid_field = fields.next().ok_or_else(|| {
                anyhow::anyhow!(
                    "reference taxonomy row at line {} has no taxid column",
                    lineno + 1
                )
            })?;

            // Header row
            if lineno == 0 && taxid_field.parse::<TaxId>().is_err() {
                continue;
            }

            let taxid: TaxId = taxid_field.trim().parse().with_context(|| {
                format!("invalid taxid '{}' at line {}", taxid_field, lineno + 1)
            })?;

            match map.get(reference_id) {
                None => {
                    map.insert(reference_id.to_string(), taxid);
                }
                Some(&existing) if existing == taxid => {}
                Some(&existing) => {
                    // Rows disagreeing only through a merge keep the first
                    if taxonomy.canonical(existing) != taxonomy.canonical(taxid) {
                        anyhow::bail!(
                            "conflicting taxids for reference '{}': {} vs {} (line {})",
                            reference_id,
                            existing,
                            taxid,
                            lineno + 1
                        );
                    }
                }
            }
        }

        Ok(Self {
            map,
            unknown_lookups: AtomicU64::new(0),
        })
    }

    /// Build from in-memory rows, first entry per key winning. Used for
    /// selection-time species dedup, where the accession table exists
    /// before any cache entry does.
    pub fn from_entries<I: IntoIterator<Item = (String, TaxId)>>(entries: I) -> Self {
        let mut map = FxHashMap::default();
        for (reference_id, taxid) in entries {
            map.entry(reference_id).or_insert(taxid);
        }
        Self {
            map,
            unknown_lookups: AtomicU64::new(0),
        }
    }

    pub fn lookup(&self, reference_id: &str) -> TaxId {
        match self.map.get(reference_id) {
            Some(&taxid) => taxid,
            None => {
                let n = self.unknown_lookups.fetch_add(1, Ordering::Relaxed);
                if n < 10 {
                    eprintln!("Warning: reference '{}' not in registry, treating as unassigned", reference_id);
                }
                UNASSIGNED
            }
        }
    }

    pub fn contains(&self, reference_id: &str) -> bool {
        self.map.contains_key(reference_id)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn unknown_lookup_count(&self) -> u64 {
        self.unknown_lookups.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::tests::test_taxonomy;
    use std::io::Write;

    fn write_tsv(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f.flush().unwrap();
        f
    }

    #[test]
    fn test_build_and_lookup() {
        let tax = test_taxonomy();
        let f = write_tsv("reference_id\ttaxid\nNC_000913.3\t511145\nNZ_X1\t622\n");
        let reg = ReferenceRegistry::build_from(f.path(), &tax).unwrap();
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.lookup("NC_000913.3"), 511145);
        assert_eq!(reg.lookup("NZ_X1"), 622);
    }

    #[test]
    fn test_unknown_lookup_counts() {
        let tax = test_taxonomy();
        let f = write_tsv("NC_000913.3\t511145\n");
        let reg = ReferenceRegistry::build_from(f.path(), &tax).unwrap();
        assert_eq!(reg.lookup("missing"), 0);
        assert_eq!(reg.unknown_lookup_count(), 1);
    }

    #[test]
    fn test_merge_equivalent_duplicates_keep_first() {
        let tax = test_taxonomy();
        // 666 is merged into 562
        let f = write_tsv("NC_000913.3\t666\nNC_000913.3\t562\n");
        let reg = ReferenceRegistry::build_from(f.path(), &tax).unwrap();
        assert_eq!(reg.lookup("NC_000913.3"), 666);
    }

    #[test]
    fn test_conflicting_duplicates_fail() {
        let tax = test_taxonomy();
        let f = write_tsv("NC_000913.3\t562\nNC_000913.3\t622\n");
        assert!(ReferenceRegistry::build_from(f.path(), &tax).is_err());
    }
}
