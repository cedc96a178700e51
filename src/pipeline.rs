//! End-to-end run orchestration.
//!
//! Drives the whole classification: screen the queries, select candidate
//! references, resolve the reference cache (building it under the cache
//! lock on a miss), align, aggregate the PAF stream, resolve assignments
//! and write the outputs. Components report `anyhow` errors; this module
//! is the only place they are folded into exit-code classes, and `main`
//! is the only place those become process exits.
//!
//! Concurrency shape: the aggregator runs on the calling thread and
//! hands completed queries to the resolver thread over a bounded
//! channel, which gives the parser backpressure. Everything else is
//! sequential. Cancellation is a shared flag checked between stages and
//! between queries; on cancellation partial outputs land in `aborted/`,
//! never at a final path.

use serde_json::json;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};

use rustc_hash::FxHashMap;

use crate::aggregate::{AggregateCounters, Aggregator, QueryHits};
use crate::cache::{ReferenceCache, ALIGNMENT_INDEX, REFERENCES_FASTA};
use crate::config::{Config, InputKind};
use crate::error::{PipelineError, PipelineResult};
use crate::registry::ReferenceRegistry;
use crate::resolver::{LcaResolver, QueryAssignment, ResolverCounters, ResolverParams};
use crate::selector::{self, CandidateSelection};
use crate::taxonomy::{self, Taxonomy};
use crate::tools::{
    find_executable, Aligner, LocalMirrorMaterialiser, MashSketcher, Minimap2Aligner,
    ReferenceMaterialiser, Sketcher, UnavailableMaterialiser,
};
use crate::{profile, seqio};

pub const CLASSIFIED_TSV: &str = "classified_sequences.tsv";
pub const PROFILE_TSV: &str = "profile.cami.tsv";
pub const METADATA_JSON: &str = "metadata.json";

pub struct Collaborators<'a> {
    pub sketcher: &'a dyn Sketcher,
    pub aligner: &'a dyn Aligner,
    pub materialiser: &'a dyn ReferenceMaterialiser,
    /// Accession -> taxid rows for selection-time species dedup; empty
    /// when the materialiser has no such table.
    pub accession_taxids: Vec<(String, u32)>,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub queries: usize,
    pub classified: usize,
    pub unclassified: usize,
    pub fingerprint: String,
    pub cache_dir: PathBuf,
}

/// Production entry point: locates the external tools, loads the
/// taxonomy and runs the pipeline with subprocess collaborators.
pub fn run(config: &Config, cancel: Arc<AtomicBool>) -> PipelineResult<RunSummary> {
    if config.fetch_taxonomy {
        taxonomy::ensure_taxdump(&config.taxonomy_dir)
            .map_err(|e| PipelineError::Taxonomy(format!("{:#}", e)))?;
    }
    let taxonomy = Taxonomy::load(&config.taxonomy_dir)
        .map_err(|e| PipelineError::Taxonomy(format!("{:#}", e)))?;

    let mash = find_executable("mash")
        .map_err(|e| PipelineError::Config(format!("{:#}", e)))?
        .to_string_lossy()
        .to_string();
    let minimap2 = find_executable("minimap2")
        .map_err(|e| PipelineError::Config(format!("{:#}", e)))?
        .to_string_lossy()
        .to_string();

    let sketcher = MashSketcher {
        mash_path: mash,
        sketch_db: config.sketch_db.clone(),
        threads: config.threads,
        cancel: Arc::clone(&cancel),
    };
    let aligner = Minimap2Aligner {
        minimap2_path: minimap2,
        threads: config.threads,
        input_kind: config.input_kind,
        cancel: Arc::clone(&cancel),
    };

    // A warm cache works without a mirror; only a miss needs one
    match &config.assembly_dir {
        Some(assembly_dir) => {
            let materialiser = LocalMirrorMaterialiser {
                assembly_dir: assembly_dir.clone(),
            };
            let accession_taxids = materialiser.accession_taxids().unwrap_or_default();
            let collab = Collaborators {
                sketcher: &sketcher,
                aligner: &aligner,
                materialiser: &materialiser,
                accession_taxids,
            };
            run_pipeline(config, &taxonomy, &collab, cancel)
        }
        None => {
            let materialiser = UnavailableMaterialiser;
            let collab = Collaborators {
                sketcher: &sketcher,
                aligner: &aligner,
                materialiser: &materialiser,
                accession_taxids: Vec::new(),
            };
            run_pipeline(config, &taxonomy, &collab, cancel)
        }
    }
}

/// Pipeline core, collaborators injected. Everything observable about a
/// run (outputs, logs, metadata, exit class) is decided here.
pub fn run_pipeline(
    config: &Config,
    taxonomy: &Taxonomy,
    collab: &Collaborators,
    cancel: Arc<AtomicBool>,
) -> PipelineResult<RunSummary> {
    let started_at = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();

    if !config.input.exists() {
        return Err(PipelineError::MissingInput(
            config.input.display().to_string(),
        ));
    }

    fs::create_dir_all(&config.out_dir)?;
    let logs_dir = config.out_dir.join("logs");
    fs::create_dir_all(&logs_dir)?;
    let work_dir = config.out_dir.join("work");
    fs::create_dir_all(&work_dir)?;

    let result = run_stages(config, taxonomy, collab, &cancel, &work_dir, &logs_dir, &started_at);

    let result = match result {
        Err(PipelineError::Cancelled) => {
            eprintln!("Run cancelled");
            Err(PipelineError::Cancelled)
        }
        other => other,
    };

    if !config.keep_work {
        fs::remove_dir_all(&work_dir).ok();
    }
    result
}

#[allow(clippy::too_many_arguments)]
fn run_stages(
    config: &Config,
    taxonomy: &Taxonomy,
    collab: &Collaborators,
    cancel: &Arc<AtomicBool>,
    work_dir: &Path,
    logs_dir: &Path,
    started_at: &str,
) -> PipelineResult<RunSummary> {
    let check_cancel = || -> PipelineResult<()> {
        if cancel.load(Ordering::Relaxed) {
            Err(PipelineError::Cancelled)
        } else {
            Ok(())
        }
    };

    // [1/6] enumerate queries in input order
    if config.verbose {
        eprintln!("  [1/6] Reading query identifiers...");
    }
    let query_ids = seqio::read_sequence_ids(&config.input)
        .map_err(|e| PipelineError::MissingInput(format!("{:#}", e)))?;
    if config.verbose {
        eprintln!("        Queries: {}", query_ids.len());
    }
    check_cancel()?;

    // [2/6] screen
    if config.verbose {
        eprintln!("  [2/6] Screening queries against reference sketches...");
    }
    let screen_rows = collab
        .sketcher
        .screen(&config.input, work_dir)
        .map_err(classify_cancelled)?;
    check_cancel()?;

    // [3/6] candidate selection
    if config.verbose {
        eprintln!("  [3/6] Selecting candidate references...");
    }
    let dedup_registry = if config.species_dedup && !collab.accession_taxids.is_empty() {
        Some(ReferenceRegistry::from_entries(
            collab.accession_taxids.iter().cloned(),
        ))
    } else {
        None
    };
    let selection = selector::select(
        &screen_rows,
        query_ids.len(),
        config,
        dedup_registry.as_ref(),
        taxonomy,
    )
    .map_err(PipelineError::from)?;
    write_selection_log(&logs_dir.join("candidate_limit.log"), &selection)?;
    {
        let mut out = BufWriter::new(File::create(work_dir.join("selected_references.tsv"))?);
        for reference in &selection.references {
            writeln!(out, "{}", reference)?;
        }
        out.flush()?;
    }
    if config.verbose {
        eprintln!(
            "        Threshold {:.2}, candidates: {}",
            selection.report.chosen_threshold, selection.report.final_count
        );
    }

    if selection.references.is_empty() {
        if config.allow_empty {
            let assignments: Vec<QueryAssignment> = query_ids
                .iter()
                .map(|q| QueryAssignment::unclassified(q))
                .collect();
            write_outputs(config, taxonomy, &config.out_dir, &query_ids, &assignments)?;
        }
        return Err(PipelineError::EmptyCandidates(format!(
            "no screen row above floored threshold {:.2}",
            selection.report.chosen_threshold
        )));
    }
    check_cancel()?;

    // [4/6] cache resolution
    if config.verbose {
        eprintln!("  [4/6] Resolving reference cache...");
    }
    let cache = ReferenceCache::new(&config.cache_root)
        .map_err(|e| PipelineError::CacheBuild(format!("{:#}", e)))?;
    if config.force_download {
        cache
            .invalidate(&selection.fingerprint)
            .map_err(|e| PipelineError::CacheBuild(format!("{:#}", e)))?;
    }
    let guard = cache
        .resolve(&selection.fingerprint, &selection.references, |scratch| {
            collab.materialiser.materialise(&selection.references, scratch)?;
            collab
                .aligner
                .build_index(&scratch.join(REFERENCES_FASTA), &scratch.join(ALIGNMENT_INDEX))?;
            let mut versions = BTreeMap::new();
            versions.insert("sketcher".to_string(), collab.sketcher.version());
            versions.insert("aligner".to_string(), collab.aligner.version());
            Ok(versions)
        })
        .map_err(|e| match PipelineError::from(e) {
            PipelineError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::CacheBuild(other.to_string()),
        })?;
    check_cancel()?;

    let registry = ReferenceRegistry::build_from(&guard.reference_taxonomy(), taxonomy)
        .map_err(|e| PipelineError::Taxonomy(format!("{:#}", e)))?;

    // A pruned or hand-deleted index inside a ready entry is rebuilt in
    // place; content is derived, so concurrent rebuilds converge
    if !guard.alignment_index().exists() {
        let tmp = work_dir.join("alignment.index.tmp");
        collab
            .aligner
            .build_index(&guard.references_fasta(), &tmp)
            .map_err(|e| PipelineError::CacheBuild(format!("{:#}", e)))?;
        fs::rename(&tmp, guard.alignment_index())
            .map_err(|e| PipelineError::CacheBuild(e.to_string()))?;
    }

    // [5/6] alignment
    if config.verbose {
        eprintln!("  [5/6] Aligning queries against selected references...");
    }
    let paf_path = work_dir.join("alignment.paf");
    collab
        .aligner
        .align(&config.input, &guard.alignment_index(), &paf_path)
        .map_err(|e| match PipelineError::from(e) {
            PipelineError::Cancelled => PipelineError::Cancelled,
            other => PipelineError::AlignmentStream(other.to_string()),
        })?;
    check_cancel()?;

    // [6/6] aggregate + resolve across the bounded channel
    if config.verbose {
        eprintln!("  [6/6] Aggregating alignments and resolving assignments...");
    }
    let resolver_params = ResolverParams {
        min_support_weight: config.min_support_weight,
        min_taxid_support: config.min_taxid_support,
        confidence_floor: config.confidence_floor,
        tie_epsilon: config.tie_epsilon,
        weighting: config.weighting,
    };
    let mut aggregator = Aggregator::new(
        &registry,
        config.rel_cov_threshold,
        config.abs_cov_threshold,
        config.drop_unknown_taxids,
        config.max_parse_errors,
    );

    let (tx, rx) = mpsc::sync_channel::<QueryHits>(config.queue_cap);
    let (agg_result, resolved, resolver_counters) = std::thread::scope(|scope| {
        let resolver_handle = scope.spawn(move || {
            let mut resolver = LcaResolver::new(taxonomy, resolver_params);
            let mut out = Vec::new();
            for query in rx.iter() {
                out.push(resolver.resolve(&query));
            }
            (out, resolver.counters())
        });

        let agg_result = aggregator.run(&paf_path, config.paf_sorted, |query| {
            // The current query is always drained before stopping
            tx.send(query)
                .map_err(|_| anyhow::anyhow!("resolver thread terminated early"))?;
            if cancel.load(Ordering::Relaxed) {
                return Err(anyhow::Error::new(PipelineError::Cancelled));
            }
            Ok(())
        });
        drop(tx);

        let (resolved, counters) = resolver_handle
            .join()
            .unwrap_or_else(|_| (Vec::new(), ResolverCounters::default()));
        (agg_result, resolved, counters)
    });

    let agg_counters = aggregator.counters();
    write_resolver_log(
        &logs_dir.join("resolver.log"),
        &agg_counters,
        &resolver_counters,
        taxonomy,
        &registry,
    )?;

    // Input order, one row per query; queries the stream never produced
    // an assignment for are unclassified
    let mut by_query: FxHashMap<&str, &QueryAssignment> = FxHashMap::default();
    for assignment in &resolved {
        by_query.entry(assignment.query_id.as_str()).or_insert(assignment);
    }
    let assignments: Vec<QueryAssignment> = query_ids
        .iter()
        .map(|q| {
            by_query
                .get(q.as_str())
                .map(|a| (*a).clone())
                .unwrap_or_else(|| QueryAssignment::unclassified(q))
        })
        .collect();

    if let Err(e) = agg_result {
        return match PipelineError::from(e) {
            PipelineError::Cancelled => {
                let aborted = config.out_dir.join("aborted");
                fs::create_dir_all(&aborted)?;
                write_outputs(config, taxonomy, &aborted, &query_ids, &assignments)?;
                Err(PipelineError::Cancelled)
            }
            other => Err(PipelineError::AlignmentStream(other.to_string())),
        };
    }
    check_cancel()?;

    write_outputs(config, taxonomy, &config.out_dir, &query_ids, &assignments)?;

    let classified = assignments.iter().filter(|a| a.is_classified()).count();
    let finished_at = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
    let tool_versions = guard
        .meta()
        .map(|m| m.tool_versions)
        .unwrap_or_default();
    write_metadata(
        &config.out_dir.join(METADATA_JSON),
        config,
        &selection,
        guard.dir(),
        &tool_versions,
        started_at,
        &finished_at,
        classified,
        assignments.len(),
    )?;

    Ok(RunSummary {
        queries: query_ids.len(),
        classified,
        unclassified: assignments.len() - classified,
        fingerprint: selection.fingerprint.clone(),
        cache_dir: guard.dir().to_path_buf(),
    })
}

fn classify_cancelled(e: anyhow::Error) -> PipelineError {
    match PipelineError::from(e) {
        PipelineError::Cancelled => PipelineError::Cancelled,
        other => other,
    }
}

/// Write the per-query table and the CAMI profile. Both are staged next
/// to their final name and renamed, so a crash cannot leave a truncated
/// file at a final path.
fn write_outputs(
    config: &Config,
    taxonomy: &Taxonomy,
    dir: &Path,
    query_ids: &[String],
    assignments: &[QueryAssignment],
) -> PipelineResult<()> {
    fs::create_dir_all(dir)?;

    let classified_tmp = dir.join(format!("{}.tmp", CLASSIFIED_TSV));
    {
        let mut out = BufWriter::new(File::create(&classified_tmp)?);
        writeln!(out, "Query\tLineage\tTaxonomicLevel\tConfidence\tTaxID\tAmbiguous")?;
        for (query_id, assignment) in query_ids.iter().zip(assignments) {
            writeln!(
                out,
                "{}\t{}\t{}\t{:.4}\t{}\t{}",
                query_id,
                assignment.lineage,
                assignment.rank.as_str(),
                assignment.confidence,
                assignment.taxid,
                assignment.ambiguous
            )?;
        }
        out.flush()?;
    }
    fs::rename(&classified_tmp, dir.join(CLASSIFIED_TSV))?;

    let profile_tmp = dir.join(format!("{}.tmp", PROFILE_TSV));
    {
        let rows = profile::build_profile(assignments, taxonomy);
        let mut out = BufWriter::new(File::create(&profile_tmp)?);
        profile::write_cami(&mut out, &config.sample_id, &rows)?;
        out.flush()?;
    }
    fs::rename(&profile_tmp, dir.join(PROFILE_TSV))?;

    Ok(())
}

fn write_selection_log(path: &Path, selection: &CandidateSelection) -> PipelineResult<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "queries\t{}", selection.report.n_queries)?;
    writeln!(out, "min_candidates\t{}", selection.report.min_candidates)?;
    for probe in &selection.report.probes {
        writeln!(out, "probe\t{:.2}\t{}", probe.threshold, probe.rows_above)?;
    }
    writeln!(out, "chosen_threshold\t{:.2}", selection.report.chosen_threshold)?;
    writeln!(
        out,
        "retained_after_threshold\t{}",
        selection.report.retained_after_threshold
    )?;
    writeln!(
        out,
        "retained_after_dedup\t{}",
        selection.report.retained_after_dedup
    )?;
    writeln!(out, "final_count\t{}", selection.report.final_count)?;
    writeln!(out, "fingerprint\t{}", selection.fingerprint)?;
    out.flush()?;
    Ok(())
}

fn write_resolver_log(
    path: &Path,
    agg: &AggregateCounters,
    resolver: &ResolverCounters,
    taxonomy: &Taxonomy,
    registry: &ReferenceRegistry,
) -> PipelineResult<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "paf_records\t{}", agg.records)?;
    writeln!(out, "paf_parse_errors\t{}", agg.parse_errors)?;
    writeln!(out, "queries_with_alignments\t{}", agg.queries)?;
    writeln!(out, "hits_emitted\t{}", agg.hits_emitted)?;
    writeln!(out, "hits_filtered\t{}", agg.hits_filtered)?;
    writeln!(out, "unknown_taxid_hits\t{}", agg.unknown_taxid_hits)?;
    writeln!(out, "queries_resolved\t{}", resolver.queries)?;
    writeln!(out, "classified\t{}", resolver.classified)?;
    writeln!(out, "unclassified\t{}", resolver.unclassified)?;
    writeln!(out, "ambiguous\t{}", resolver.ambiguous)?;
    writeln!(out, "below_min_support\t{}", resolver.below_min_support)?;
    writeln!(out, "taxonomy_unknown_queries\t{}", taxonomy.unknown_query_count())?;
    writeln!(out, "registry_unknown_lookups\t{}", registry.unknown_lookup_count())?;
    out.flush()?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn write_metadata(
    path: &Path,
    config: &Config,
    selection: &CandidateSelection,
    cache_dir: &Path,
    tool_versions: &BTreeMap<String, String>,
    started_at: &str,
    finished_at: &str,
    classified: usize,
    total: usize,
) -> PipelineResult<()> {
    let doc = json!({
        "commit": option_env!("HYMET_BUILD_COMMIT").unwrap_or("unknown"),
        "version": env!("CARGO_PKG_VERSION"),
        "started_at": started_at,
        "finished_at": finished_at,
        "selection_fingerprint": selection.fingerprint,
        "cache_dir": cache_dir.display().to_string(),
        "tool_versions": tool_versions,
        "queries": total,
        "classified": classified,
        "config": {
            "input": config.input.display().to_string(),
            "input_kind": match config.input_kind {
                InputKind::Contigs => "contigs",
                InputKind::Reads => "reads",
            },
            "threads": config.threads,
            "initial_threshold": config.initial_threshold,
            "threshold_floor": config.threshold_floor,
            "cand_min_factor": config.cand_min_factor,
            "cand_max": config.cand_max,
            "species_dedup": config.species_dedup,
            "rel_cov_threshold": config.rel_cov_threshold,
            "abs_cov_threshold": config.abs_cov_threshold,
            "min_support_weight": config.min_support_weight,
            "min_taxid_support": config.min_taxid_support,
            "confidence_floor": config.confidence_floor,
            "tie_epsilon": config.tie_epsilon,
            "drop_unknown_taxids": config.drop_unknown_taxids,
            "paf_sorted": config.paf_sorted,
            "sample_id": config.sample_id,
        },
    });
    let rendered = serde_json::to_string_pretty(&doc)
        .map_err(|e| PipelineError::Other(e.to_string()))?;
    fs::write(path, rendered).map_err(PipelineError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::ScreenRow;
    use crate::taxonomy::tests::test_taxonomy;
    use anyhow::Result;
    use std::sync::Mutex;

    struct MockSketcher {
        rows: Vec<ScreenRow>,
    }

    impl Sketcher for MockSketcher {
        fn screen(&self, _queries: &Path, _scratch: &Path) -> Result<Vec<ScreenRow>> {
            Ok(self.rows.clone())
        }

        fn version(&self) -> String {
            "mock-sketcher 1.0".to_string()
        }
    }

    struct MockAligner {
        paf: String,
        align_calls: Mutex<usize>,
    }

    impl Aligner for MockAligner {
        fn build_index(&self, _references_fasta: &Path, index_out: &Path) -> Result<()> {
            fs::write(index_out, b"mock index")?;
            Ok(())
        }

        fn align(&self, _queries: &Path, _index: &Path, paf_out: &Path) -> Result<()> {
            *self.align_calls.lock().unwrap() += 1;
            fs::write(paf_out, &self.paf)?;
            Ok(())
        }

        fn version(&self) -> String {
            "mock-aligner 1.0".to_string()
        }
    }

    struct MockMaterialiser {
        table: String,
        build_calls: Mutex<usize>,
    }

    impl ReferenceMaterialiser for MockMaterialiser {
        fn materialise(&self, references: &[String], scratch: &Path) -> Result<()> {
            *self.build_calls.lock().unwrap() += 1;
            let mut fasta = String::new();
            for reference in references {
                fasta.push_str(&format!(">{}\nACGT\n", reference));
            }
            fs::write(scratch.join(REFERENCES_FASTA), fasta)?;
            fs::write(scratch.join(crate::cache::REFERENCE_TAXONOMY), &self.table)?;
            Ok(())
        }
    }

    fn screen_row(similarity: f64, id: &str) -> ScreenRow {
        ScreenRow {
            similarity,
            shared_hashes: "900/1000".to_string(),
            median_multiplicity: 1,
            p_value: 0.0,
            reference_id: id.to_string(),
        }
    }

    struct Fixture {
        _dirs: (tempfile::TempDir, tempfile::TempDir),
        config: Config,
    }

    fn fixture(contigs: &str) -> Fixture {
        let out = tempfile::tempdir().unwrap();
        let input_dir = tempfile::tempdir().unwrap();
        let input = input_dir.path().join("contigs.fna");
        fs::write(&input, contigs).unwrap();

        let mut config = Config::default_thresholds();
        config.input = input;
        config.out_dir = out.path().join("run");
        config.cache_root = out.path().join("cache");
        config.keep_work = false;
        Fixture {
            config,
            _dirs: (out, input_dir),
        }
    }

    fn run_fixture(
        config: &Config,
        rows: Vec<ScreenRow>,
        paf: &str,
        table: &str,
    ) -> PipelineResult<RunSummary> {
        let tax = test_taxonomy();
        let sketcher = MockSketcher { rows };
        let aligner = MockAligner {
            paf: paf.to_string(),
            align_calls: Mutex::new(0),
        };
        let materialiser = MockMaterialiser {
            table: table.to_string(),
            build_calls: Mutex::new(0),
        };
        let collab = Collaborators {
            sketcher: &sketcher,
            aligner: &aligner,
            materialiser: &materialiser,
            accession_taxids: Vec::new(),
        };
        run_pipeline(config, &tax, &collab, Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn test_end_to_end_confident_species_call() {
        let fx = fixture(">q2\nACGTACGT\n");
        let paf = "q2\t2000\t0\t1800\t+\tr1\t5000\t0\t1800\t1782\t1800\t60\n\
                   q2\t2000\t200\t1500\t+\tr2\t5000\t200\t1500\t1274\t1300\t55\n";
        let summary = run_fixture(
            &fx.config,
            vec![screen_row(0.99, "r1"), screen_row(0.98, "r2")],
            paf,
            "r1\t511145\nr2\t511145\n",
        )
        .unwrap();

        assert_eq!(summary.queries, 1);
        assert_eq!(summary.classified, 1);

        let table =
            fs::read_to_string(fx.config.out_dir.join(CLASSIFIED_TSV)).unwrap();
        let mut lines = table.lines();
        assert_eq!(
            lines.next().unwrap(),
            "Query\tLineage\tTaxonomicLevel\tConfidence\tTaxID\tAmbiguous"
        );
        let row = lines.next().unwrap();
        assert!(row.starts_with("q2\t"), "row: {}", row);
        assert!(row.contains("species:Escherichia coli"));
        assert!(row.contains("\tspecies\t1.0000\t562\tfalse"));

        let cami = fs::read_to_string(fx.config.out_dir.join(PROFILE_TSV)).unwrap();
        assert!(cami.contains("562\tspecies\t"));
        assert!(cami.contains("\t100.000000"));

        let metadata =
            fs::read_to_string(fx.config.out_dir.join(METADATA_JSON)).unwrap();
        assert!(metadata.contains(&summary.fingerprint));

        // work/ is removed without --keep-work
        assert!(!fx.config.out_dir.join("work").exists());
        assert!(fx.config.out_dir.join("logs/candidate_limit.log").exists());
        assert!(fx.config.out_dir.join("logs/resolver.log").exists());
    }

    #[test]
    fn test_low_coverage_hit_is_unclassified() {
        let fx = fixture(">q1\nACGT\n");
        // 100 of 1000 bases covered, below the 0.30 default
        let paf = "q1\t1000\t0\t100\t+\tr1\t5000\t0\t100\t95\t100\t60\n";
        let summary = run_fixture(
            &fx.config,
            vec![screen_row(0.95, "r1")],
            paf,
            "r1\t511145\n",
        )
        .unwrap();
        assert_eq!(summary.classified, 0);

        let table = fs::read_to_string(fx.config.out_dir.join(CLASSIFIED_TSV)).unwrap();
        let row = table.lines().nth(1).unwrap();
        assert_eq!(row, "q1\tunclassified\tno_rank\t0.0000\t0\tfalse");

        // Profile holds headers only
        let cami = fs::read_to_string(fx.config.out_dir.join(PROFILE_TSV)).unwrap();
        assert_eq!(cami.lines().count(), 5);
    }

    #[test]
    fn test_empty_candidates_exits_7_with_unclassified_rows() {
        let fx = fixture(">q1\nACGT\n>q2\nGGTT\n");
        let err = run_fixture(&fx.config, vec![screen_row(0.30, "r1")], "", "r1\t562\n")
            .unwrap_err();
        assert_eq!(err.exit_code(), 7);

        // allow_empty (default) still writes the table, all unclassified
        let table = fs::read_to_string(fx.config.out_dir.join(CLASSIFIED_TSV)).unwrap();
        assert_eq!(table.lines().count(), 3);
        assert!(table.lines().skip(1).all(|l| l.contains("unclassified")));
    }

    #[test]
    fn test_empty_candidates_without_allow_empty_writes_nothing() {
        let mut fx = fixture(">q1\nACGT\n");
        fx.config.allow_empty = false;
        let err = run_fixture(&fx.config, vec![], "", "").unwrap_err();
        assert_eq!(err.exit_code(), 7);
        assert!(!fx.config.out_dir.join(CLASSIFIED_TSV).exists());
    }

    #[test]
    fn test_missing_input_exits_3() {
        let mut fx = fixture(">q1\nACGT\n");
        fx.config.input = PathBuf::from("/nonexistent/contigs.fna");
        let err = run_fixture(&fx.config, vec![], "", "").unwrap_err();
        assert_eq!(err.exit_code(), 3);
    }

    #[test]
    fn test_rerun_reuses_cache_and_reproduces_outputs() {
        let fx = fixture(">q2\nACGTACGT\n");
        let paf = "q2\t2000\t0\t1800\t+\tr1\t5000\t0\t1800\t1782\t1800\t60\n";
        let rows = vec![screen_row(0.99, "r1")];
        let table = "r1\t511145\n";

        let tax = test_taxonomy();
        let sketcher = MockSketcher { rows };
        let aligner = MockAligner {
            paf: paf.to_string(),
            align_calls: Mutex::new(0),
        };
        let materialiser = MockMaterialiser {
            table: table.to_string(),
            build_calls: Mutex::new(0),
        };
        let collab = Collaborators {
            sketcher: &sketcher,
            aligner: &aligner,
            materialiser: &materialiser,
            accession_taxids: Vec::new(),
        };

        let s1 =
            run_pipeline(&fx.config, &tax, &collab, Arc::new(AtomicBool::new(false))).unwrap();
        let table1 = fs::read_to_string(fx.config.out_dir.join(CLASSIFIED_TSV)).unwrap();
        let cami1 = fs::read_to_string(fx.config.out_dir.join(PROFILE_TSV)).unwrap();

        let s2 =
            run_pipeline(&fx.config, &tax, &collab, Arc::new(AtomicBool::new(false))).unwrap();
        let table2 = fs::read_to_string(fx.config.out_dir.join(CLASSIFIED_TSV)).unwrap();
        let cami2 = fs::read_to_string(fx.config.out_dir.join(PROFILE_TSV)).unwrap();

        assert_eq!(s1.fingerprint, s2.fingerprint);
        assert_eq!(*materialiser.build_calls.lock().unwrap(), 1);
        assert_eq!(table1, table2);
        assert_eq!(cami1, cami2);
    }

    #[test]
    fn test_deleted_index_is_rebuilt() {
        let fx = fixture(">q2\nACGTACGT\n");
        let paf = "q2\t2000\t0\t1800\t+\tr1\t5000\t0\t1800\t1782\t1800\t60\n";
        let summary = run_fixture(
            &fx.config,
            vec![screen_row(0.99, "r1")],
            paf,
            "r1\t511145\n",
        )
        .unwrap();
        let table1 = fs::read_to_string(fx.config.out_dir.join(CLASSIFIED_TSV)).unwrap();

        fs::remove_file(summary.cache_dir.join(ALIGNMENT_INDEX)).unwrap();
        let summary2 = run_fixture(
            &fx.config,
            vec![screen_row(0.99, "r1")],
            paf,
            "r1\t511145\n",
        )
        .unwrap();
        assert_eq!(summary.fingerprint, summary2.fingerprint);
        assert!(summary2.cache_dir.join(ALIGNMENT_INDEX).exists());
        let table2 = fs::read_to_string(fx.config.out_dir.join(CLASSIFIED_TSV)).unwrap();
        assert_eq!(table1, table2);
    }

    #[test]
    fn test_cancellation_leaves_no_final_outputs() {
        let fx = fixture(">q2\nACGTACGT\n");
        let paf = "q2\t2000\t0\t1800\t+\tr1\t5000\t0\t1800\t1782\t1800\t60\n";

        let tax = test_taxonomy();
        let sketcher = MockSketcher {
            rows: vec![screen_row(0.99, "r1")],
        };
        let aligner = MockAligner {
            paf: paf.to_string(),
            align_calls: Mutex::new(0),
        };
        let materialiser = MockMaterialiser {
            table: "r1\t511145\n".to_string(),
            build_calls: Mutex::new(0),
        };
        let collab = Collaborators {
            sketcher: &sketcher,
            aligner: &aligner,
            materialiser: &materialiser,
            accession_taxids: Vec::new(),
        };

        // Flag set before the aggregation stage: the run must stop with
        // 130 and leave nothing at the final output paths
        let cancel = Arc::new(AtomicBool::new(true));
        let err = run_pipeline(&fx.config, &tax, &collab, cancel).unwrap_err();
        assert_eq!(err.exit_code(), 130);
        assert!(!fx.config.out_dir.join(CLASSIFIED_TSV).exists());
    }

    #[test]
    fn test_permuted_paf_within_group_is_byte_identical() {
        let paf_a = "q2\t2000\t0\t1800\t+\tr1\t5000\t0\t1800\t1782\t1800\t60\n\
                     q2\t2000\t200\t1500\t+\tr2\t5000\t200\t1500\t1274\t1300\t55\n";
        let paf_b = "q2\t2000\t200\t1500\t+\tr2\t5000\t200\t1500\t1274\t1300\t55\n\
                     q2\t2000\t0\t1800\t+\tr1\t5000\t0\t1800\t1782\t1800\t60\n";
        let table = "r1\t511145\nr2\t562\n";
        let rows = || vec![screen_row(0.99, "r1"), screen_row(0.98, "r2")];

        let fx_a = fixture(">q2\nACGTACGT\n");
        run_fixture(&fx_a.config, rows(), paf_a, table).unwrap();
        let out_a = fs::read_to_string(fx_a.config.out_dir.join(CLASSIFIED_TSV)).unwrap();
        let cami_a = fs::read_to_string(fx_a.config.out_dir.join(PROFILE_TSV)).unwrap();

        let fx_b = fixture(">q2\nACGTACGT\n");
        run_fixture(&fx_b.config, rows(), paf_b, table).unwrap();
        let out_b = fs::read_to_string(fx_b.config.out_dir.join(CLASSIFIED_TSV)).unwrap();
        let cami_b = fs::read_to_string(fx_b.config.out_dir.join(PROFILE_TSV)).unwrap();

        assert_eq!(out_a, out_b);
        assert_eq!(cami_a, cami_b);
    }

    #[test]
    fn test_permuted_screen_rows_share_fingerprint() {
        let paf = "q2\t2000\t0\t1800\t+\tr1\t5000\t0\t1800\t1782\t1800\t60\n";
        let table = "r1\t511145\nr2\t562\n";

        let fx_a = fixture(">q2\nACGTACGT\n");
        let s_a = run_fixture(
            &fx_a.config,
            vec![screen_row(0.99, "r1"), screen_row(0.99, "r2")],
            paf,
            table,
        )
        .unwrap();

        let fx_b = fixture(">q2\nACGTACGT\n");
        let s_b = run_fixture(
            &fx_b.config,
            vec![screen_row(0.99, "r2"), screen_row(0.99, "r1")],
            paf,
            table,
        )
        .unwrap();

        assert_eq!(s_a.fingerprint, s_b.fingerprint);
    }

    #[test]
    fn test_keep_work_retains_alignment() {
        let mut fx = fixture(">q2\nACGTACGT\n");
        fx.config.keep_work = true;
        let paf = "q2\t2000\t0\t1800\t+\tr1\t5000\t0\t1800\t1782\t1800\t60\n";
        run_fixture(
            &fx.config,
            vec![screen_row(0.99, "r1")],
            paf,
            "r1\t511145\n",
        )
        .unwrap();
        assert!(fx.config.out_dir.join("work/alignment.paf").exists());
    }
}
