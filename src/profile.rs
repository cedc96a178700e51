//! Sample-level CAMI abundance profile.
//!
//! Aggregates classified query assignments per rank by walking each
//! assignment to its ancestor at that rank and accumulating the
//! assignment's support weight there. Percentages are fixed to six
//! decimals in integer micro-percent units: bins are truncated and the
//! leftover units go to the final bin of the rank, so every rank with
//! any signal sums to exactly 100.000000.

use rustc_hash::FxHashMap;
use std::io::Write;

use crate::resolver::QueryAssignment;
use crate::taxonomy::{Rank, TaxId, Taxonomy, RANKS, UNASSIGNED};

const CAMI_VERSION: &str = "0.9.1";

/// Micro-percent units per 100%.
const FULL_SCALE: u64 = 100_000_000;

#[derive(Debug, Clone)]
pub struct ProfileRow {
    pub taxid: TaxId,
    pub rank: Rank,
    pub taxpath_ids: String,
    pub taxpath_names: String,
    /// Percentage in micro-percent units (1e-6 of a percent point).
    pub percentage_units: u64,
}

impl ProfileRow {
    pub fn percentage_string(&self) -> String {
        format!(
            "{}.{:06}",
            self.percentage_units / 1_000_000,
            self.percentage_units % 1_000_000
        )
    }
}

pub fn build_profile(assignments: &[QueryAssignment], taxonomy: &Taxonomy) -> Vec<ProfileRow> {
    let mut rows = Vec::new();

    for (rank_idx, &rank) in RANKS.iter().enumerate() {
        let mut bins: FxHashMap<TaxId, f64> = FxHashMap::default();
        let mut order: Vec<TaxId> = Vec::new();

        for assignment in assignments {
            if assignment.taxid == UNASSIGNED || assignment.support_weight <= 0.0 {
                continue;
            }
            let ancestor = taxonomy.ancestor_at_rank(assignment.taxid, rank);
            if ancestor == UNASSIGNED {
                continue;
            }
            if !bins.contains_key(&ancestor) {
                order.push(ancestor);
            }
            *bins.entry(ancestor).or_insert(0.0) += assignment.support_weight;
        }

        let total: f64 = {
            // Sum in first-seen order so the normaliser is reproducible
            order.iter().map(|t| bins[t]).sum()
        };
        if total <= 0.0 {
            continue;
        }

        // Deterministic row order: weight descending, taxid ascending
        let mut entries: Vec<(TaxId, f64)> = order.iter().map(|&t| (t, bins[&t])).collect();
        entries.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });

        // Truncate each bin to whole units, then hand the leftover units
        // to the last bin; the rank total is exactly 100.000000
        let mut units: Vec<u64> = entries
            .iter()
            .map(|(_, weight)| ((weight / total) * FULL_SCALE as f64).floor() as u64)
            .collect();
        let assigned: u64 = units.iter().sum();
        if let Some(last) = units.last_mut() {
            *last += FULL_SCALE.saturating_sub(assigned);
        }

        for ((taxid, _), unit) in entries.iter().zip(units) {
            let (taxpath_ids, taxpath_names) = taxpath(taxonomy, *taxid, rank_idx);
            rows.push(ProfileRow {
                taxid: *taxid,
                rank,
                taxpath_ids,
                taxpath_names,
                percentage_units: unit,
            });
        }
    }

    rows
}

/// `|`-joined ranked ancestors down to `rank_idx` inclusive; ranks the
/// lineage skips stay as empty segments.
fn taxpath(taxonomy: &Taxonomy, taxid: TaxId, rank_idx: usize) -> (String, String) {
    let mut ids = Vec::with_capacity(rank_idx + 1);
    let mut names = Vec::with_capacity(rank_idx + 1);
    for &rank in &RANKS[..=rank_idx] {
        let ancestor = taxonomy.ancestor_at_rank(taxid, rank);
        if ancestor == UNASSIGNED {
            ids.push(String::new());
            names.push(String::new());
        } else {
            ids.push(ancestor.to_string());
            names.push(taxonomy.name(ancestor).to_string());
        }
    }
    (ids.join("|"), names.join("|"))
}

/// Emit the CAMI profile document.
pub fn write_cami<W: Write>(out: &mut W, sample_id: &str, rows: &[ProfileRow]) -> std::io::Result<()> {
    writeln!(out, "#CAMI Submission for Taxonomic Profiling")?;
    writeln!(out, "@SampleID:{}", sample_id)?;
    writeln!(out, "@Version:{}", CAMI_VERSION)?;
    writeln!(
        out,
        "@Ranks:superkingdom|phylum|class|order|family|genus|species"
    )?;
    writeln!(out, "@@TAXID\tRANK\tTAXPATH\tTAXPATHSN\tPERCENTAGE")?;
    for row in rows {
        writeln!(
            out,
            "{}\t{}\t{}\t{}\t{}",
            row.taxid,
            row.rank.as_str(),
            row.taxpath_ids,
            row.taxpath_names,
            row.percentage_string()
        )?;
    }
    Ok(())
}
