mod aggregate;
mod cache;
mod config;
mod error;
mod paf;
mod pipeline;
mod profile;
mod registry;
mod resolver;
mod screen;
mod selector;
mod seqio;
mod taxonomy;
mod tools;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use config::{Config, InputKind, WeightingMode};

/// Parse and validate a fraction argument (must be within [0,1])
fn parse_fraction(s: &str) -> Result<f64, String> {
    let val: f64 = s.parse().map_err(|_| format!("Invalid number: {}", s))?;
    if !(0.0..=1.0).contains(&val) {
        Err(format!("Value must be between 0.0 and 1.0, got {}", val))
    } else {
        Ok(val)
    }
}

#[derive(Parser)]
#[command(name = "hymet")]
#[command(version)]
#[command(about = "Hybrid metagenomic classifier (sketch screen + alignment + weighted LCA)")]
#[command(long_about = r#"
hymet - hybrid metagenomic taxonomic classifier

Assigns each query contig (or read) a taxonomic lineage in three stages:
  1. Sketch screen selects candidate reference genomes
  2. Long-sequence alignment against the selected references
  3. Weighted lowest-common-ancestor resolution per query

WORKFLOW:
  Queries → mash screen → candidate selection → reference cache →
  minimap2 → coverage aggregation → weighted LCA → assignments + profile

OUTPUT FILES (under --out):
  classified_sequences.tsv   One row per query, input order
    Columns: Query, Lineage, TaxonomicLevel, Confidence, TaxID, Ambiguous
  profile.cami.tsv           CAMI-format per-rank abundance profile
  metadata.json              Provenance: config, fingerprint, tool versions
  logs/                      Candidate-selection and resolver counters
  work/                      Intermediate files (kept with --keep-work)

EXIT CODES:
  0 success        2 configuration error   3 missing input
  4 taxonomy load  5 cache build           6 alignment stream
  7 empty candidate set                  130 cancelled
"#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Classify a query set and write assignments plus a CAMI profile
    Run(RunArgs),
    /// Evict old or oversized reference cache entries
    Prune {
        /// Cache root directory
        #[arg(long, value_name = "DIR")]
        cache_root: PathBuf,

        /// Evict ready entries older than this many days
        #[arg(long, value_name = "DAYS")]
        max_age_days: Option<u64>,

        /// Evict oldest entries until the cache fits this many GB
        #[arg(long, value_name = "GB")]
        max_total_gb: Option<u64>,
    },
}

#[derive(Parser)]
struct RunArgs {
    // ===== INPUT OPTIONS =====
    /// Query contigs (FASTA, optionally gzipped)
    #[arg(long, value_name = "PATH", conflicts_with = "reads", help_heading = "Input")]
    contigs: Option<PathBuf>,

    /// Query reads (FASTQ, optionally gzipped)
    #[arg(long, value_name = "PATH", help_heading = "Input")]
    reads: Option<PathBuf>,

    // ===== OUTPUT OPTIONS =====
    /// Output directory (created if not exists)
    #[arg(long, value_name = "DIR", help_heading = "Output")]
    out: PathBuf,

    /// Sample identifier written into the CAMI profile header
    #[arg(long, value_name = "ID", default_value = "sample_0", help_heading = "Output")]
    sample_id: String,

    /// Keep intermediate work directory (raw alignment, screen report)
    #[arg(long, help_heading = "Output")]
    keep_work: bool,

    /// Do not write outputs when the candidate set comes up empty
    #[arg(long, help_heading = "Output")]
    fail_empty: bool,

    /// Verbose output to stderr (progress and statistics)
    #[arg(short = 'v', long, help_heading = "Output")]
    verbose: bool,

    // ===== CANDIDATE SELECTION =====
    /// Initial screen similarity threshold
    #[arg(long, value_name = "FLOAT", default_value = "0.90",
          value_parser = parse_fraction, help_heading = "Candidate Selection")]
    min_similarity: f64,

    /// Similarity threshold floor for the adaptive walk
    #[arg(long, value_name = "FLOAT", default_value = "0.70",
          value_parser = parse_fraction, help_heading = "Candidate Selection")]
    similarity_floor: f64,

    /// Minimum-candidate factor (target = max(5, ceil(factor × queries)))
    #[arg(long, value_name = "FLOAT", default_value = "3.25", help_heading = "Candidate Selection")]
    cand_min_factor: f64,

    /// Hard cap on selected references
    #[arg(long, value_name = "N", default_value = "500", help_heading = "Candidate Selection")]
    cand_max: usize,

    /// Keep only the best reference per species
    #[arg(long, help_heading = "Candidate Selection")]
    species_dedup: bool,

    // ===== REFERENCES =====
    /// Reference cache root (env CACHE_ROOT overrides the default)
    #[arg(long, value_name = "DIR", help_heading = "References")]
    cache_root: Option<PathBuf>,

    /// Local assembly mirror: assembly_summary table + genomes/
    #[arg(long = "assembly-summary-dir", value_name = "DIR", help_heading = "References")]
    assembly_summary_dir: Option<PathBuf>,

    /// Pre-built sketch database for the screener
    #[arg(long, value_name = "FILE", default_value = "data/reference_sketches.msh", help_heading = "References")]
    sketch_db: PathBuf,

    // ===== TAXONOMY =====
    /// NCBI taxdump directory (nodes/names/merged/delnodes.dmp)
    #[arg(long, value_name = "DIR", default_value = "taxonomy_files", help_heading = "Taxonomy")]
    taxonomy_dir: PathBuf,

    /// Download the taxdump into --taxonomy-dir when missing
    #[arg(long, help_heading = "Taxonomy")]
    fetch_taxonomy: bool,

    // ===== FILTERS & RESOLUTION =====
    /// Minimum covered fraction of the query per reference [0-1]
    #[arg(long, value_name = "FLOAT", default_value = "0.30",
          value_parser = parse_fraction, help_heading = "Filters")]
    rel_cov: f64,

    /// Absolute coverage threshold as a fraction of query length [0-1]
    #[arg(long, value_name = "FLOAT", default_value = "0.0",
          value_parser = parse_fraction, help_heading = "Filters")]
    abs_cov: f64,

    /// Drop hits whose reference has no known taxid
    #[arg(long, help_heading = "Filters")]
    drop_unknown_taxids: bool,

    /// Abort after this many malformed PAF lines
    #[arg(long, value_name = "N", default_value = "1000", help_heading = "Filters")]
    max_parse_errors: u64,

    /// Trust the aligner's PAF output to be grouped by query
    #[arg(long, help_heading = "Filters")]
    paf_sorted: bool,

    /// Minimum cumulative vote weight for any classification
    #[arg(long, value_name = "FLOAT", default_value = "50.0", help_heading = "Resolution")]
    min_support_weight: f64,

    /// Minimum distinct references behind the chosen taxon
    #[arg(long, value_name = "N", default_value = "1", help_heading = "Resolution")]
    min_taxid_support: usize,

    /// Minimum confidence to descend another rank [0-1]
    #[arg(long, value_name = "FLOAT", default_value = "0.60",
          value_parser = parse_fraction, help_heading = "Resolution")]
    confidence_floor: f64,

    /// Relative weight margin treating sibling taxa as tied [0-1]
    #[arg(long, value_name = "FLOAT", default_value = "0.05",
          value_parser = parse_fraction, help_heading = "Resolution")]
    tie_epsilon: f64,

    /// Vote weighting: 'identity' or 'coverage' (for short reads)
    #[arg(long = "reads-weighting", value_name = "MODE", default_value = "identity", help_heading = "Resolution")]
    weighting: String,

    // ===== RUNTIME =====
    /// Number of threads for external tools [0 = auto-detect]
    #[arg(long, value_name = "NUM", default_value = "0", help_heading = "Runtime")]
    threads: usize,

    /// Validate configuration and print the run plan without executing
    #[arg(long, help_heading = "Runtime")]
    dry_run: bool,
}

fn build_config(args: &RunArgs) -> Result<Config, error::PipelineError> {
    let (input, input_kind) = match (&args.contigs, &args.reads) {
        (Some(path), None) => (path.clone(), InputKind::Contigs),
        (None, Some(path)) => (path.clone(), InputKind::Reads),
        _ => {
            return Err(error::PipelineError::Config(
                "exactly one of --contigs or --reads is required".to_string(),
            ))
        }
    };

    let weighting = match args.weighting.as_str() {
        "identity" => WeightingMode::Identity,
        "coverage" => WeightingMode::Coverage,
        other => {
            return Err(error::PipelineError::Config(format!(
                "unknown weighting mode '{}'; use 'identity' or 'coverage'",
                other
            )))
        }
    };

    let mut config = Config::default_thresholds();
    config.input = input;
    config.input_kind = input_kind;
    config.out_dir = args.out.clone();
    config.threads = if args.threads == 0 {
        num_cpus::get()
    } else {
        args.threads
    };
    config.initial_threshold = args.min_similarity;
    config.threshold_floor = args.similarity_floor;
    config.cand_min_factor = args.cand_min_factor;
    config.cand_max = args.cand_max;
    config.species_dedup = args.species_dedup;
    if let Some(root) = &args.cache_root {
        config.cache_root = root.clone();
    }
    config.assembly_dir = args.assembly_summary_dir.clone();
    config.sketch_db = args.sketch_db.clone();
    config.taxonomy_dir = args.taxonomy_dir.clone();
    config.fetch_taxonomy = args.fetch_taxonomy;
    config.rel_cov_threshold = args.rel_cov;
    config.abs_cov_threshold = args.abs_cov;
    config.drop_unknown_taxids = args.drop_unknown_taxids;
    config.max_parse_errors = args.max_parse_errors;
    config.paf_sorted = args.paf_sorted;
    config.min_support_weight = args.min_support_weight;
    config.min_taxid_support = args.min_taxid_support;
    config.confidence_floor = args.confidence_floor;
    config.tie_epsilon = args.tie_epsilon;
    config.weighting = weighting;
    config.sample_id = args.sample_id.clone();
    config.allow_empty = !args.fail_empty;
    config.keep_work = args.keep_work;
    config.verbose = args.verbose;

    config.apply_env(args.cache_root.is_some());
    config.validate()?;
    Ok(config)
}

fn run_command(args: &RunArgs) -> Result<(), error::PipelineError> {
    let config = build_config(args)?;

    if args.dry_run {
        eprintln!("Dry run; configuration is valid.");
        eprintln!("  Input:        {} ({})", config.input.display(), match config.input_kind {
            InputKind::Contigs => "contigs",
            InputKind::Reads => "reads",
        });
        eprintln!("  Output:       {}", config.out_dir.display());
        eprintln!("  Cache root:   {}", config.cache_root.display());
        eprintln!("  Taxonomy:     {}", config.taxonomy_dir.display());
        eprintln!("  Sketch db:    {}", config.sketch_db.display());
        eprintln!("  Threads:      {}", config.threads);
        eprintln!(
            "  Selection:    threshold {:.2} -> {:.2}, factor {:.2}, cap {}",
            config.initial_threshold,
            config.threshold_floor,
            config.cand_min_factor,
            config.cand_max
        );
        eprintln!(
            "  Filters:      rel_cov {:.2}, abs_cov {:.2}",
            config.rel_cov_threshold, config.abs_cov_threshold
        );
        eprintln!(
            "  Resolution:   support {:.1}, refs {}, confidence {:.2}, tie {:.2}",
            config.min_support_weight,
            config.min_taxid_support,
            config.confidence_floor,
            config.tie_epsilon
        );
        return Ok(());
    }

    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        ctrlc::set_handler(move || {
            eprintln!("Cancellation requested, draining current query...");
            cancel.store(true, Ordering::Relaxed);
        })
        .map_err(|e| error::PipelineError::Other(format!("failed to install signal handler: {}", e)))?;
    }

    if config.verbose {
        eprintln!(
            "Classifying {} with {} threads",
            config.input.display(),
            config.threads
        );
    }

    let summary = pipeline::run(&config, cancel)?;

    if config.verbose {
        eprintln!(
            "\nDone: {} queries, {} classified, {} unclassified",
            summary.queries, summary.classified, summary.unclassified
        );
        eprintln!("Selection fingerprint: {}", summary.fingerprint);
        eprintln!("Cache entry: {}", summary.cache_dir.display());
    }
    Ok(())
}

fn prune_command(
    cache_root: &PathBuf,
    max_age_days: Option<u64>,
    max_total_gb: Option<u64>,
) -> Result<(), error::PipelineError> {
    if max_age_days.is_none() && max_total_gb.is_none() {
        return Err(error::PipelineError::Config(
            "prune requires --max-age-days and/or --max-total-gb".to_string(),
        ));
    }
    let cache = cache::ReferenceCache::new(cache_root)
        .map_err(|e| error::PipelineError::CacheBuild(format!("{:#}", e)))?;
    let evicted = cache
        .prune(max_age_days, max_total_gb.map(|gb| gb * 1024 * 1024 * 1024))
        .map_err(|e| error::PipelineError::CacheBuild(format!("{:#}", e)))?;

    eprintln!("Evicted {} cache entries", evicted.len());
    for fingerprint in evicted {
        eprintln!("  {}", fingerprint);
    }
    Ok(())
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Run(args) => run_command(args),
        Commands::Prune {
            cache_root,
            max_age_days,
            max_total_gb,
        } => prune_command(cache_root, *max_age_days, *max_total_gb),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("ERROR: {}", err);
            ExitCode::from(err.exit_code().clamp(0, 255) as u8)
        }
    }
}
