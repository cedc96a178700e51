//! Weighted-LCA resolution.
//!
//! Turns the surviving hits of one query into exactly one assignment.
//! Votes are projected onto the seven-rank ladder (the same projection
//! the profile and the CAMI output use), rolled up root-ward, and the
//! resolver walks from the root toward species along the max-weight
//! child, advancing only while the child clears the support, confidence
//! and tie gates. Stopping because a gate failed sets the ambiguity
//! flag; running out of ranked candidates does not.
//!
//! The resolver is pure: identical hits and parameters produce the
//! identical assignment, and votes are accumulated in sorted order so
//! floating-point sums are bit-for-bit reproducible.

use rustc_hash::FxHashMap;

use crate::aggregate::QueryHits;
use crate::config::WeightingMode;
use crate::taxonomy::{Rank, TaxId, Taxonomy, RANKS, UNASSIGNED};

#[derive(Debug, Clone)]
pub struct ResolverParams {
    pub min_support_weight: f64,
    pub min_taxid_support: usize,
    pub confidence_floor: f64,
    pub tie_epsilon: f64,
    pub weighting: WeightingMode,
}

#[derive(Debug, Clone)]
pub struct QueryAssignment {
    pub query_id: String,
    pub taxid: TaxId,
    pub rank: Rank,
    pub confidence: f64,
    pub lineage: String,
    pub support_weight: f64,
    pub ambiguous: bool,
}

impl QueryAssignment {
    pub fn unclassified(query_id: &str) -> Self {
        Self {
            query_id: query_id.to_string(),
            taxid: UNASSIGNED,
            rank: Rank::NoRank,
            confidence: 0.0,
            lineage: "unclassified".to_string(),
            support_weight: 0.0,
            ambiguous: false,
        }
    }

    pub fn is_classified(&self) -> bool {
        self.taxid != UNASSIGNED
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResolverCounters {
    pub queries: u64,
    pub classified: u64,
    pub unclassified: u64,
    pub ambiguous: u64,
    pub below_min_support: u64,
}

pub struct LcaResolver<'a> {
    taxonomy: &'a Taxonomy,
    params: ResolverParams,
    counters: ResolverCounters,
}

impl<'a> LcaResolver<'a> {
    pub fn new(taxonomy: &'a Taxonomy, params: ResolverParams) -> Self {
        Self {
            taxonomy,
            params,
            counters: ResolverCounters::default(),
        }
    }

    pub fn counters(&self) -> ResolverCounters {
        self.counters
    }

    pub fn resolve(&mut self, query: &QueryHits) -> QueryAssignment {
        self.counters.queries += 1;
        let assignment = self.resolve_inner(query);
        if assignment.is_classified() {
            self.counters.classified += 1;
        } else {
            self.counters.unclassified += 1;
        }
        if assignment.ambiguous {
            self.counters.ambiguous += 1;
        }
        assignment
    }

    fn resolve_inner(&mut self, query: &QueryHits) -> QueryAssignment {
        // Merge hits into per-taxid votes. Unknown taxids cannot map into
        // the tree, but their weight still counts toward the confidence
        // denominator so unknown-heavy queries read as low-confidence.
        // One summary exists per reference, so sorting by reference id
        // fixes the accumulation order (and therefore every float sum)
        // no matter how the hits arrived.
        let mut hits: Vec<&crate::aggregate::HitSummary> = query.hits.iter().collect();
        hits.sort_by(|a, b| a.reference_id.cmp(&b.reference_id));

        let mut votes: FxHashMap<TaxId, (f64, usize)> = FxHashMap::default();
        let mut total_weight = 0.0;
        for hit in hits {
            let weight = match self.params.weighting {
                WeightingMode::Identity => hit.covered_bases as f64 * hit.weighted_identity,
                WeightingMode::Coverage => hit.covered_bases as f64,
            };
            total_weight += weight;
            let taxid = self.taxonomy.canonical(hit.taxid);
            if taxid == UNASSIGNED {
                continue;
            }
            let entry = votes.entry(taxid).or_insert((0.0, 0));
            entry.0 += weight;
            entry.1 += 1;
        }

        if total_weight < self.params.min_support_weight || votes.is_empty() {
            if total_weight > 0.0 && total_weight < self.params.min_support_weight {
                self.counters.below_min_support += 1;
            }
            return QueryAssignment::unclassified(&query.query_id);
        }

        // Sorted vote order keeps every downstream float sum reproducible
        let mut vote_list: Vec<(TaxId, f64, usize)> = votes
            .into_iter()
            .map(|(t, (w, s))| (t, w, s))
            .collect();
        vote_list.sort_by_key(|&(t, _, _)| t);

        // Project each vote onto the rank ladder and accumulate weight
        // and support per (rank, taxid)
        let mut ladder: Vec<FxHashMap<TaxId, (f64, usize)>> =
            vec![FxHashMap::default(); RANKS.len()];
        for &(taxid, weight, support) in &vote_list {
            for (i, &rank) in RANKS.iter().enumerate() {
                let ancestor = self.taxonomy.ancestor_at_rank(taxid, rank);
                if ancestor == UNASSIGNED {
                    continue;
                }
                let entry = ladder[i].entry(ancestor).or_insert((0.0, 0));
                entry.0 += weight;
                entry.1 += support;
            }
        }

        // Root-to-leaf walk along the max-weight child
        let mut chosen: Vec<(Rank, TaxId, f64)> = Vec::new();
        let mut ambiguous = false;

        for (i, &rank) in RANKS.iter().enumerate() {
            let mut candidates: Vec<(TaxId, f64, usize)> = ladder[i]
                .iter()
                .filter(|&(&taxid, _)| {
                    chosen
                        .last()
                        .map(|&(prev_rank, prev, _)| {
                            self.taxonomy.ancestor_at_rank(taxid, prev_rank) == prev
                        })
                        .unwrap_or(true)
                })
                .map(|(&taxid, &(weight, support))| (taxid, weight, support))
                .collect();
            if candidates.is_empty() {
                // Lineages may skip a rank; deeper ranks can still hold
                // consistent candidates
                continue;
            }

            // Best weight first; ties by lower taxid, then name
            candidates.sort_by(|a, b| {
                b.1.partial_cmp(&a.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.0.cmp(&b.0))
                    .then_with(|| self.taxonomy.name(a.0).cmp(self.taxonomy.name(b.0)))
            });

            let (best, best_weight, best_support) = candidates[0];

            if best_support < self.params.min_taxid_support {
                ambiguous = true;
                break;
            }
            if best_weight / total_weight < self.params.confidence_floor {
                ambiguous = true;
                break;
            }
            if let Some(&(_, second_weight, _)) = candidates.get(1) {
                if best_weight - second_weight <= self.params.tie_epsilon * best_weight {
                    ambiguous = true;
                    break;
                }
            }

            chosen.push((rank, best, best_weight));
        }

        let (_, taxid, weight) = match chosen.last() {
            Some(&last) => last,
            None => {
                // Never cleared the first gate; the data supports
                // nothing below the root
                let mut assignment = QueryAssignment::unclassified(&query.query_id);
                assignment.ambiguous = ambiguous;
                return assignment;
            }
        };

        let lineage = chosen
            .iter()
            .map(|&(rank, taxid, _)| format!("{}:{}", rank.as_str(), self.taxonomy.name(taxid)))
            .collect::<Vec<_>>()
            .join(";");

        QueryAssignment {
            query_id: query.query_id.clone(),
            taxid,
            rank: self.taxonomy.rank(taxid),
            confidence: weight / total_weight,
            lineage,
            support_weight: weight,
            ambiguous,
        }
    }
}
