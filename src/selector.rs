//! Candidate reference selection.
//!
//! Turns screen rows into the ordered list of references that will be
//! aligned against, via an adaptive similarity threshold: starting high
//! and stepping down until enough candidates survive, with an optional
//! one-per-species dedup and a hard cap. The sorted, deduplicated id set
//! is digested into the selection fingerprint that keys the reference
//! cache, so identical selections reuse identical cache entries no matter
//! what order the screener emitted its rows in.

use anyhow::Result;
use rustc_hash::{FxHashMap, FxHashSet};
use sha1::{Digest, Sha1};

use crate::config::Config;
use crate::registry::ReferenceRegistry;
use crate::screen::ScreenRow;
use crate::taxonomy::{Rank, TaxId, Taxonomy, UNASSIGNED};

/// One probe of the adaptive threshold walk, kept for the selection log.
#[derive(Debug, Clone)]
pub struct ThresholdProbe {
    pub threshold: f64,
    pub rows_above: usize,
}

#[derive(Debug, Clone)]
pub struct SelectionReport {
    pub n_queries: usize,
    pub min_candidates: usize,
    pub chosen_threshold: f64,
    pub probes: Vec<ThresholdProbe>,
    pub retained_after_threshold: usize,
    pub retained_after_dedup: usize,
    pub final_count: usize,
}

#[derive(Debug, Clone)]
pub struct CandidateSelection {
    /// Selected references, best similarity first. May be empty when even
    /// the floored threshold matched nothing; the orchestrator decides
    /// whether that aborts the run.
    pub references: Vec<String>,
    /// Hex SHA-1 over the sorted, deduplicated reference ids.
    pub fingerprint: String,
    pub report: SelectionReport,
}

/// Digest of a reference id set, invariant under input order and
/// duplication.
pub fn selection_fingerprint(reference_ids: &[String]) -> String {
    let mut unique: Vec<&str> = reference_ids.iter().map(|s| s.as_str()).collect();
    unique.sort_unstable();
    unique.dedup();

    let mut hasher = Sha1::new();
    for id in unique {
        hasher.update(id.as_bytes());
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

pub fn select(
    rows: &[ScreenRow],
    n_queries: usize,
    config: &Config,
    registry: Option<&ReferenceRegistry>,
    taxonomy: &Taxonomy,
) -> Result<CandidateSelection> {
    // Deterministic order: similarity descending, then id ascending
    let mut sorted: Vec<&ScreenRow> = rows.iter().collect();
    sorted.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.reference_id.cmp(&b.reference_id))
    });

    let min_candidates = ((config.cand_min_factor * n_queries as f64).ceil() as usize).max(5);

    let mut probes = Vec::new();
    let mut threshold = config.initial_threshold;
    let chosen_threshold = loop {
        let rows_above = sorted.iter().filter(|r| r.similarity > threshold).count();
        probes.push(ThresholdProbe {
            threshold,
            rows_above,
        });
        if rows_above >= min_candidates || threshold <= config.threshold_floor {
            break threshold;
        }
        // Clamp so the final probe happens exactly at the floor
        threshold = (threshold - config.threshold_step).max(config.threshold_floor);
    };

    let retained: Vec<&ScreenRow> = sorted
        .iter()
        .copied()
        .filter(|r| r.similarity > chosen_threshold)
        .collect();
    let retained_after_threshold = retained.len();

    let deduped: Vec<&ScreenRow> = if config.species_dedup {
        dedup_by_species(&retained, registry, taxonomy)
    } else {
        retained
    };
    let retained_after_dedup = deduped.len();

    let references: Vec<String> = deduped
        .into_iter()
        .take(config.cand_max)
        .map(|r| r.reference_id.clone())
        .collect();

    let fingerprint = selection_fingerprint(&references);

    Ok(CandidateSelection {
        fingerprint,
        report: SelectionReport {
            n_queries,
            min_candidates,
            chosen_threshold,
            probes,
            retained_after_threshold,
            retained_after_dedup,
            final_count: references.len(),
        },
        references,
    })
}

/// Keep only the best-similarity row per species. Rows the registry or
/// taxonomy cannot place at species level keep their own slot.
fn dedup_by_species<'a>(
    rows: &[&'a ScreenRow],
    registry: Option<&ReferenceRegistry>,
    taxonomy: &Taxonomy,
) -> Vec<&'a ScreenRow> {
    let registry = match registry {
        Some(r) => r,
        None => return rows.to_vec(),
    };

    let mut seen_species: FxHashSet<TaxId> = FxHashSet::default();
    let mut species_of: FxHashMap<&str, TaxId> = FxHashMap::default();
    let mut kept = Vec::with_capacity(rows.len());

    // rows are already similarity-descending, so first hit per species wins
    for row in rows {
        let species = *species_of
            .entry(row.reference_id.as_str())
            .or_insert_with(|| {
                let taxid = registry.lookup(&row.reference_id);
                if taxid == UNASSIGNED {
                    UNASSIGNED
                } else {
                    taxonomy.ancestor_at_rank(taxid, Rank::Species)
                }
            });
        if species == UNASSIGNED || seen_species.insert(species) {
            kept.push(*row);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::tests::test_taxonomy;
    use std::io::Write;

    fn row(similarity: f64, id: &str) -> ScreenRow {
        ScreenRow {
            similarity,
            shared_hashes: "0/1000".to_string(),
            median_multiplicity: 1,
            p_value: 0.0,
            reference_id: id.to_string(),
        }
    }

    fn base_config() -> Config {
        let mut cfg = Config::default_thresholds();
        cfg.cand_max = 100;
        cfg
    }

    #[test]
    fn test_fingerprint_invariant_under_permutation() {
        let a = vec!["r2".to_string(), "r1".to_string(), "r1".to_string()];
        let b = vec!["r1".to_string(), "r2".to_string()];
        assert_eq!(selection_fingerprint(&a), selection_fingerprint(&b));
        assert_eq!(selection_fingerprint(&a).len(), 40);
    }

    #[test]
    fn test_fingerprint_distinguishes_sets() {
        let a = vec!["r1".to_string()];
        let b = vec!["r1".to_string(), "r2".to_string()];
        assert_ne!(selection_fingerprint(&a), selection_fingerprint(&b));
    }

    #[test]
    fn test_threshold_stays_high_when_enough_rows() {
        let tax = test_taxonomy();
        let rows: Vec<ScreenRow> = (0..10).map(|i| row(0.95, &format!("r{:02}", i))).collect();
        let sel = select(&rows, 1, &base_config(), None, &tax).unwrap();
        assert_eq!(sel.report.chosen_threshold, 0.90);
        assert_eq!(sel.references.len(), 10);
    }

    #[test]
    fn test_threshold_decays_to_gather_minimum() {
        let tax = test_taxonomy();
        // 5 rows at 0.80: the walk must descend below 0.80 to find them
        let rows: Vec<ScreenRow> = (0..5).map(|i| row(0.80, &format!("r{}", i))).collect();
        let sel = select(&rows, 1, &base_config(), None, &tax).unwrap();
        assert!(sel.report.chosen_threshold < 0.80);
        assert_eq!(sel.references.len(), 5);
        assert!(sel.report.probes.len() > 1);
    }

    #[test]
    fn test_floor_reached_with_empty_result() {
        let tax = test_taxonomy();
        let rows = vec![row(0.50, "r1")];
        let sel = select(&rows, 1, &base_config(), None, &tax).unwrap();
        assert_eq!(sel.report.chosen_threshold, 0.70);
        assert!(sel.references.is_empty());
    }

    #[test]
    fn test_ordering_deterministic_on_ties() {
        let tax = test_taxonomy();
        let rows = vec![row(0.95, "b"), row(0.95, "a"), row(0.97, "c")];
        let sel = select(&rows, 1, &base_config(), None, &tax).unwrap();
        assert_eq!(sel.references, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_cand_max_truncates() {
        let tax = test_taxonomy();
        let rows: Vec<ScreenRow> = (0..50).map(|i| row(0.95, &format!("r{:02}", i))).collect();
        let mut cfg = base_config();
        cfg.cand_max = 7;
        let sel = select(&rows, 1, &cfg, None, &tax).unwrap();
        assert_eq!(sel.references.len(), 7);
        assert_eq!(sel.report.retained_after_threshold, 50);
    }

    #[test]
    fn test_species_dedup_keeps_best_per_species() {
        let tax = test_taxonomy();
        let mut reg_file = tempfile::NamedTempFile::new().unwrap();
        // r1 and r2 are both E. coli strains, r3 is Shigella
        write!(reg_file, "r1\t511145\nr2\t562\nr3\t622\n").unwrap();
        reg_file.flush().unwrap();
        let registry =
            ReferenceRegistry::build_from(reg_file.path(), &tax).unwrap();

        let rows = vec![row(0.99, "r1"), row(0.95, "r2"), row(0.93, "r3")];
        let mut cfg = base_config();
        cfg.species_dedup = true;
        let sel = select(&rows, 1, &cfg, Some(&registry), &tax).unwrap();
        assert_eq!(sel.references, vec!["r1", "r3"]);
    }
}
