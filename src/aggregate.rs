//! Streaming alignment aggregation.
//!
//! Consumes PAF records grouped by query and folds them into one
//! `HitSummary` per (query, reference) pair that survives the coverage
//! and identity filters. Coverage is tracked as a sorted set of disjoint
//! half-open intervals merged on insert, so memory is proportional to
//! the number of distinct aligned blocks, never to query length. Only
//! one query's state is alive at a time.
//!
//! The aggregator requires grouped input. When the aligner's output
//! order is not trusted (`paf_sorted` off) the stream is first run
//! through an external sort by query name; this implementation sorts
//! externally rather than buffering groups in memory, so arbitrarily
//! scrambled streams cost disk instead of RSS.

use anyhow::{Context, Result};
use extsort_iter::*;
use rustc_hash::FxHashMap;
use std::path::Path;

use crate::paf::{PafReader, PafRecord};
use crate::registry::ReferenceRegistry;
use crate::taxonomy::{TaxId, UNASSIGNED};

/// External-sort spill buffer for ungrouped PAF streams.
const SORT_BUFFER_BYTES: usize = 64 * 1024 * 1024;

/// Disjoint, sorted union of half-open intervals on one query.
#[derive(Debug, Clone, Default)]
pub struct IntervalSet {
    spans: Vec<(u64, u64)>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self { spans: Vec::new() }
    }

    /// Insert `[start, end)`, merging every overlapping or adjacent span
    /// into one.
    pub fn insert(&mut self, start: u64, end: u64) {
        debug_assert!(start < end);

        // First span that could touch the new one
        let i = self.spans.partition_point(|&(_, e)| e < start);
        let mut merged = (start, end);
        let mut j = i;
        while j < self.spans.len() && self.spans[j].0 <= end {
            merged.0 = merged.0.min(self.spans[j].0);
            merged.1 = merged.1.max(self.spans[j].1);
            j += 1;
        }
        self.spans.splice(i..j, [merged]);
    }

    pub fn covered_bases(&self) -> u64 {
        self.spans.iter().map(|&(s, e)| e - s).sum()
    }

    pub fn span_count(&self) -> usize {
        self.spans.len()
    }
}

#[derive(Debug, Clone)]
pub struct HitSummary {

    pub query_id: String,

    pub reference_id: String,

    pub query_len: u64,

    pub covered_bases: u64,

    pub weighted_identity: f64,

    pub best_mapq: u8,

    pub alignment_count: u32,

    pub taxid: TaxId,
}

/// All surviving hits of one query, references in lexicographic order.
#[derive(Debug, Clone)]
pub struct QueryHits {
    pub query_id: String,
    pub query_len: u64,
    pub hits: Vec<HitSummary>,
}

#[derive(Default)]
struct RefState {
    intervals: IntervalSet,
    sum_matches: u64,
    sum_aln_len: u64,
    best_mapq: u8,
    alignment_count: u32,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AggregateCounters {
    pub records: u64,
    pub parse_errors: u64,
    pub queries: u64,
    pub hits_emitted: u64,
    pub hits_filtered: u64,
    pub unknown_taxid_hits: u64,
}

pub struct Aggregator<'a> {
    registry: &'a ReferenceRegistry,
    rel_cov_threshold: f64,
    abs_cov_threshold: f64,
    drop_unknown_taxids: bool,
    max_parse_errors: u64,
    counters: AggregateCounters,
}

impl<'a> Aggregator<'a> {
    pub fn new(
        registry: &'a ReferenceRegistry,
        rel_cov_threshold: f64,
        abs_cov_threshold: f64,
        drop_unknown_taxids: bool,
        max_parse_errors: u64,
    ) -> Self {
        Self {
            registry,
            rel_cov_threshold,
            abs_cov_threshold,
            drop_unknown_taxids,
            max_parse_errors,
            counters: AggregateCounters::default(),
        }
    }

    pub fn counters(&self) -> AggregateCounters {
        self.counters
    }

    /// Stream a PAF file and call `emit` once per query that kept at
    /// least one hit. With `grouped` the input order is trusted; a query
    /// whose records are split across non-adjacent blocks would then be
    /// emitted once per block, which is why the pipeline only sets it on
    /// explicit operator assertion.
    pub fn run<F>(&mut self, paf_path: &Path, grouped: bool, mut emit: F) -> Result<()>
    where
        F: FnMut(QueryHits) -> Result<()>,
    {
        let reader = PafReader::open(paf_path)?;

        if grouped {
            let mut state = GroupState::default();
            let mut reader = reader;
            loop {
                match reader.read_next() {
                    Ok(Some(record)) => {
                        self.counters.records += 1;
                        self.feed(&mut state, record, &mut emit)?;
                    }
                    Ok(None) => break,
                    Err(e) => self.record_parse_error(e)?,
                }
            }
            self.flush(&mut state, &mut emit)?;
        } else {
            // Parse (counting malformed lines) before sorting; the sort
            // consumes owned records
            let mut records = Vec::new();
            let mut reader = reader;
            loop {
                match reader.read_next() {
                    Ok(Some(record)) => {
                        self.counters.records += 1;
                        records.push(record);
                    }
                    Ok(None) => break,
                    Err(e) => self.record_parse_error(e)?,
                }
            }

            let config = ExtsortConfig::create_with_buffer_size_for::<PafRecord>(SORT_BUFFER_BYTES);
            let sorted = records
                .into_iter()
                .external_sort(config)
                .context("External sort of PAF stream failed")?;

            let mut state = GroupState::default();
            for record in sorted {
                self.feed(&mut state, record, &mut emit)?;
            }
            self.flush(&mut state, &mut emit)?;
        }

        Ok(())
    }

    fn record_parse_error(&mut self, err: anyhow::Error) -> Result<()> {
        // I/O failures are not data errors; give up immediately
        if err.downcast_ref::<std::io::Error>().is_some() {
            return Err(err);
        }
        self.counters.parse_errors += 1;
        if self.counters.parse_errors <= 5 {
            eprintln!("Warning: skipping malformed PAF line: {:#}", err);
        }
        if self.counters.parse_errors > self.max_parse_errors {
            anyhow::bail!(
                "more than {} malformed PAF lines; aborting alignment stream",
                self.max_parse_errors
            );
        }
        Ok(())
    }

    fn feed<F>(&mut self, state: &mut GroupState, record: PafRecord, emit: &mut F) -> Result<()>
    where
        F: FnMut(QueryHits) -> Result<()>,
    {
        if state.query_id.as_deref() != Some(record.query_name.as_str()) {
            self.flush(state, emit)?;
            state.query_id = Some(record.query_name.clone());
            state.query_len = record.query_len;
        }

        let ref_state = state
            .refs
            .entry(record.target_name.clone())
            .or_default();
        ref_state.intervals.insert(record.query_start, record.query_end);
        ref_state.sum_matches += record.matches;
        ref_state.sum_aln_len += record.aln_len;
        ref_state.best_mapq = ref_state.best_mapq.max(record.mapq);
        ref_state.alignment_count += 1;
        Ok(())
    }

    fn flush<F>(&mut self, state: &mut GroupState, emit: &mut F) -> Result<()>
    where
        F: FnMut(QueryHits) -> Result<()>,
    {
        let query_id = match state.query_id.take() {
            Some(q) => q,
            None => return Ok(()),
        };
        let query_len = state.query_len;
        self.counters.queries += 1;

        // Deterministic hit order regardless of within-group record order
        let mut refs: Vec<(String, RefState)> = state.refs.drain().collect();
        refs.sort_by(|a, b| a.0.cmp(&b.0));

        let mut hits = Vec::new();
        for (reference_id, ref_state) in refs {
            let covered = ref_state.intervals.covered_bases();

            let rel_ok = query_len > 0
                && covered as f64 / query_len as f64 >= self.rel_cov_threshold;
            let abs_ok = covered as f64 >= self.abs_cov_threshold * query_len as f64;
            if !rel_ok || !abs_ok {
                self.counters.hits_filtered += 1;
                continue;
            }

            let weighted_identity = if ref_state.sum_aln_len > 0 {
                ref_state.sum_matches as f64 / ref_state.sum_aln_len as f64
            } else {
                0.0
            };

            let taxid = self.registry.lookup(&reference_id);
            if taxid == UNASSIGNED {
                self.counters.unknown_taxid_hits += 1;
                if self.drop_unknown_taxids {
                    self.counters.hits_filtered += 1;
                    continue;
                }
            }

            self.counters.hits_emitted += 1;
            hits.push(HitSummary {
                query_id: query_id.clone(),
                reference_id,
                query_len,
                covered_bases: covered,
                weighted_identity,
                best_mapq: ref_state.best_mapq,
                alignment_count: ref_state.alignment_count,
                taxid,
            });
        }

        if !hits.is_empty() {
            emit(QueryHits {
                query_id,
                query_len,
                hits,
            })?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct GroupState {
    query_id: Option<String>,
    query_len: u64,
    refs: FxHashMap<String, RefState>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::taxonomy::tests::test_taxonomy;
    use std::io::Write;

    #[test]
    fn test_interval_merge_on_insert() {
        let mut set = IntervalSet::new();
        set.insert(100, 200);
        set.insert(300, 400);
        assert_eq!(set.covered_bases(), 200);
        assert_eq!(set.span_count(), 2);

        // Overlap joins both spans
        set.insert(150, 350);
        assert_eq!(set.span_count(), 1);
        assert_eq!(set.covered_bases(), 300);
    }

    #[test]
    fn test_interval_adjacent_spans_fuse() {
        let mut set = IntervalSet::new();
        set.insert(0, 100);
        set.insert(100, 150);
        assert_eq!(set.span_count(), 1);
        assert_eq!(set.covered_bases(), 150);
    }

    #[test]
    fn test_interval_contained_span_is_absorbed() {
        let mut set = IntervalSet::new();
        set.insert(0, 1000);
        set.insert(200, 300);
        assert_eq!(set.span_count(), 1);
        assert_eq!(set.covered_bases(), 1000);
    }

    #[test]
    fn test_interval_insert_order_irrelevant() {
        let mut a = IntervalSet::new();
        a.insert(0, 10);
        a.insert(20, 30);
        a.insert(5, 25);

        let mut b = IntervalSet::new();
        b.insert(5, 25);
        b.insert(20, 30);
        b.insert(0, 10);

        assert_eq!(a.covered_bases(), b.covered_bases());
        assert_eq!(a.covered_bases(), 30);
    }

    fn registry_fixture() -> (tempfile::NamedTempFile, ReferenceRegistry) {
        let tax = test_taxonomy();
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "r1\t511145\nr2\t562\nr3\t622\n").unwrap();
        f.flush().unwrap();
        let reg = ReferenceRegistry::build_from(f.path(), &tax).unwrap();
        (f, reg)
    }

    fn write_paf(lines: &[&str]) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(f, "{}", line).unwrap();
        }
        f.flush().unwrap();
        f
    }

    fn collect_hits(
        paf: &tempfile::NamedTempFile,
        registry: &ReferenceRegistry,
        rel_cov: f64,
        grouped: bool,
    ) -> (Vec<QueryHits>, AggregateCounters) {
        let mut agg = Aggregator::new(registry, rel_cov, 0.0, false, 10);
        let mut out = Vec::new();
        agg.run(paf.path(), grouped, |q| {
            out.push(q);
            Ok(())
        })
        .unwrap();
        (out, agg.counters())
    }

    #[test]
    fn test_coverage_filter_drops_low_coverage() {
        let (_f, registry) = registry_fixture();
        // 100 of 1000 bases covered, threshold 0.2: dropped
        let paf = write_paf(&["q1\t1000\t0\t100\t+\tr1\t5000\t0\t100\t95\t100\t60"]);
        let (out, counters) = collect_hits(&paf, &registry, 0.2, true);
        assert!(out.is_empty());
        assert_eq!(counters.hits_filtered, 1);
        assert_eq!(counters.queries, 1);
    }

    #[test]
    fn test_overlapping_alignments_merge_coverage() {
        let (_f, registry) = registry_fixture();
        let paf = write_paf(&[
            "q1\t2000\t0\t1800\t+\tr1\t5000\t0\t1800\t1782\t1800\t60",
            "q1\t2000\t200\t1500\t+\tr1\t5000\t200\t1500\t1274\t1300\t55",
        ]);
        let (out, _) = collect_hits(&paf, &registry, 0.3, true);
        assert_eq!(out.len(), 1);
        let hit = &out[0].hits[0];
        assert_eq!(hit.covered_bases, 1800);
        assert_eq!(hit.alignment_count, 2);
        assert_eq!(hit.best_mapq, 60);
        assert_eq!(hit.taxid, 511145);
        let expected_identity = (1782 + 1274) as f64 / (1800 + 1300) as f64;
        assert!((hit.weighted_identity - expected_identity).abs() < 1e-12);
    }

    #[test]
    fn test_within_group_permutation_is_stable() {
        let (_f, registry) = registry_fixture();
        let paf_a = write_paf(&[
            "q1\t2000\t0\t1800\t+\tr1\t5000\t0\t1800\t1782\t1800\t60",
            "q1\t2000\t200\t1500\t+\tr2\t5000\t200\t1500\t1274\t1300\t55",
        ]);
        let paf_b = write_paf(&[
            "q1\t2000\t200\t1500\t+\tr2\t5000\t200\t1500\t1274\t1300\t55",
            "q1\t2000\t0\t1800\t+\tr1\t5000\t0\t1800\t1782\t1800\t60",
        ]);
        let (out_a, _) = collect_hits(&paf_a, &registry, 0.3, true);
        let (out_b, _) = collect_hits(&paf_b, &registry, 0.3, true);
        let refs_a: Vec<_> = out_a[0].hits.iter().map(|h| &h.reference_id).collect();
        let refs_b: Vec<_> = out_b[0].hits.iter().map(|h| &h.reference_id).collect();
        assert_eq!(refs_a, refs_b);
    }

    #[test]
    fn test_ungrouped_stream_is_sorted_first() {
        let (_f, registry) = registry_fixture();
        let paf = write_paf(&[
            "q2\t1000\t0\t900\t+\tr2\t5000\t0\t900\t890\t900\t60",
            "q1\t1000\t0\t900\t+\tr1\t5000\t0\t900\t890\t900\t60",
            "q2\t1000\t0\t950\t+\tr3\t5000\t0\t950\t900\t950\t60",
        ]);
        let (out, counters) = collect_hits(&paf, &registry, 0.3, false);
        assert_eq!(counters.queries, 2);
        let queries: Vec<_> = out.iter().map(|q| q.query_id.as_str()).collect();
        assert_eq!(queries, vec!["q1", "q2"]);
        assert_eq!(out[1].hits.len(), 2);
    }

    #[test]
    fn test_grouped_and_sorted_paths_agree() {
        let (_f, registry) = registry_fixture();
        let lines = [
            "q1\t1000\t0\t900\t+\tr1\t5000\t0\t900\t890\t900\t60",
            "q1\t1000\t100\t950\t+\tr2\t5000\t100\t950\t820\t850\t50",
            "q2\t1000\t0\t800\t+\tr3\t5000\t0\t800\t790\t800\t60",
        ];
        let paf = write_paf(&lines);
        let (grouped, _) = collect_hits(&paf, &registry, 0.3, true);
        let (sorted, _) = collect_hits(&paf, &registry, 0.3, false);

        assert_eq!(grouped.len(), sorted.len());
        for (a, b) in grouped.iter().zip(&sorted) {
            assert_eq!(a.query_id, b.query_id);
            let refs_a: Vec<_> = a.hits.iter().map(|h| &h.reference_id).collect();
            let refs_b: Vec<_> = b.hits.iter().map(|h| &h.reference_id).collect();
            assert_eq!(refs_a, refs_b);
            for (ha, hb) in a.hits.iter().zip(&b.hits) {
                assert_eq!(ha.covered_bases, hb.covered_bases);
                assert_eq!(ha.weighted_identity.to_bits(), hb.weighted_identity.to_bits());
            }
        }
    }

    #[test]
    fn test_malformed_lines_skipped_within_budget() {
        let (_f, registry) = registry_fixture();
        let paf = write_paf(&[
            "garbage line",
            "q1\t1000\t0\t900\t+\tr1\t5000\t0\t900\t890\t900\t60",
        ]);
        let (out, counters) = collect_hits(&paf, &registry, 0.3, true);
        assert_eq!(counters.parse_errors, 1);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn test_parse_error_budget_exceeded_aborts() {
        let (_f, registry) = registry_fixture();
        let lines: Vec<String> = (0..5).map(|i| format!("garbage {}", i)).collect();
        let refs: Vec<&str> = lines.iter().map(|s| s.as_str()).collect();
        let paf = write_paf(&refs);

        let mut agg = Aggregator::new(&registry, 0.3, 0.0, false, 2);
        let result = agg.run(paf.path(), true, |_| Ok(()));
        assert!(result.is_err());
    }

    #[test]
    fn test_unknown_reference_kept_or_dropped_by_config() {
        let (_f, registry) = registry_fixture();
        let paf = write_paf(&["q1\t1000\t0\t900\t+\tunknown_ref\t5000\t0\t900\t890\t900\t60"]);

        let (out, counters) = collect_hits(&paf, &registry, 0.3, true);
        assert_eq!(out[0].hits[0].taxid, 0);
        assert_eq!(counters.unknown_taxid_hits, 1);

        let mut agg = Aggregator::new(&registry, 0.3, 0.0, true, 10);
        let mut out = Vec::new();
        agg.run(paf.path(), true, |q| {
            out.push(q);
            Ok(())
        })
        .unwrap();
        assert!(out.is_empty());
    }
}
