//! Run configuration.
//!
//! Everything tunable is resolved exactly once at startup (CLI flags plus
//! the `CACHE_ROOT`, `FORCE_DOWNLOAD` and `KEEP_HYMET_WORK` environment
//! variables) into an immutable `Config` that downstream components
//! receive by reference. Nothing below the orchestrator reads the
//! environment.

use anyhow::Result;
use std::env;
use std::path::PathBuf;

use crate::error::PipelineError;

/// What the query sequences are. Reads mode switches the aligner preset;
/// the classification core is identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Contigs,
    Reads,
}

/// How a hit's vote weight is computed.
///
/// `Identity` weights covered bases by the alignment identity
/// (`covered_bases * weighted_identity`). `Coverage` uses covered bases
/// alone, which is more stable for short reads where per-read identity is
/// noisy. Only the vote weight changes; the reported identity in hit
/// summaries is always the measured one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightingMode {
    Identity,
    Coverage,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub input: PathBuf,
    pub input_kind: InputKind,
    pub out_dir: PathBuf,
    pub threads: usize,

    // Candidate selection
    pub initial_threshold: f64,
    pub threshold_step: f64,
    pub threshold_floor: f64,
    pub cand_min_factor: f64,
    pub cand_max: usize,
    pub species_dedup: bool,

    // Reference cache
    pub cache_root: PathBuf,
    pub force_download: bool,
    pub assembly_dir: Option<PathBuf>,

    /// Pre-built sketch database the external screener runs against.
    pub sketch_db: PathBuf,

    // Taxonomy
    pub taxonomy_dir: PathBuf,
    pub fetch_taxonomy: bool,

    // Aggregation filters
    pub rel_cov_threshold: f64,
    pub abs_cov_threshold: f64,
    pub drop_unknown_taxids: bool,
    pub max_parse_errors: u64,
    pub paf_sorted: bool,

    // LCA resolution
    pub min_support_weight: f64,
    pub min_taxid_support: usize,
    pub confidence_floor: f64,
    pub tie_epsilon: f64,
    pub weighting: WeightingMode,

    // Output
    pub sample_id: String,
    pub allow_empty: bool,
    pub keep_work: bool,
    pub verbose: bool,

    /// Capacity of the aggregator -> resolver hand-off queue.
    pub queue_cap: usize,
}

impl Config {
    pub fn default_thresholds() -> Config {
        Config {
            input: PathBuf::new(),
            input_kind: InputKind::Contigs,
            out_dir: PathBuf::new(),
            threads: 1,
            initial_threshold: 0.90,
            threshold_step: 0.02,
            threshold_floor: 0.70,
            cand_min_factor: 3.25,
            cand_max: 500,
            species_dedup: false,
            cache_root: PathBuf::from("hymet_cache"),
            force_download: false,
            assembly_dir: None,
            sketch_db: PathBuf::from("data/reference_sketches.msh"),
            taxonomy_dir: PathBuf::from("taxonomy_files"),
            fetch_taxonomy: false,
            rel_cov_threshold: 0.30,
            abs_cov_threshold: 0.0,
            drop_unknown_taxids: false,
            max_parse_errors: 1000,
            paf_sorted: false,
            min_support_weight: 50.0,
            min_taxid_support: 1,
            confidence_floor: 0.60,
            tie_epsilon: 0.05,
            weighting: WeightingMode::Identity,
            sample_id: "sample_0".to_string(),
            allow_empty: true,
            keep_work: false,
            verbose: false,
            queue_cap: 256,
        }
    }

    /// Apply environment overrides. Flags given explicitly on the command
    /// line win over the environment; the caller signals that by passing
    /// `cache_root_from_cli`.
    pub fn apply_env(&mut self, cache_root_from_cli: bool) {
        if !cache_root_from_cli {
            if let Ok(root) = env::var("CACHE_ROOT") {
                if !root.is_empty() {
                    self.cache_root = PathBuf::from(root);
                }
            }
        }
        if env_flag("FORCE_DOWNLOAD") {
            self.force_download = true;
        }
        if env_flag("KEEP_HYMET_WORK") {
            self.keep_work = true;
        }
    }

    /// Startup validation. Violations are configuration errors (exit 2).
    pub fn validate(&self) -> Result<(), PipelineError> {
        let in_unit = |v: f64| (0.0..=1.0).contains(&v);

        if !in_unit(self.initial_threshold) || !in_unit(self.threshold_floor) {
            return Err(PipelineError::Config(format!(
                "similarity thresholds must be within [0,1], got initial={} floor={}",
                self.initial_threshold, self.threshold_floor
            )));
        }
        if self.threshold_floor > self.initial_threshold {
            return Err(PipelineError::Config(format!(
                "threshold floor {} exceeds initial threshold {}",
                self.threshold_floor, self.initial_threshold
            )));
        }
        if self.threshold_step <= 0.0 {
            return Err(PipelineError::Config(format!(
                "threshold step must be positive, got {}",
                self.threshold_step
            )));
        }
        if !in_unit(self.rel_cov_threshold) || !in_unit(self.abs_cov_threshold) {
            return Err(PipelineError::Config(format!(
                "coverage thresholds must be within [0,1], got rel={} abs={}",
                self.rel_cov_threshold, self.abs_cov_threshold
            )));
        }
        if !in_unit(self.confidence_floor) {
            return Err(PipelineError::Config(format!(
                "confidence floor must be within [0,1], got {}",
                self.confidence_floor
            )));
        }
        if !in_unit(self.tie_epsilon) {
            return Err(PipelineError::Config(format!(
                "tie epsilon must be within [0,1], got {}",
                self.tie_epsilon
            )));
        }
        if self.min_support_weight < 0.0 {
            return Err(PipelineError::Config(format!(
                "minimum support weight must be non-negative, got {}",
                self.min_support_weight
            )));
        }
        if self.cand_min_factor <= 0.0 {
            return Err(PipelineError::Config(format!(
                "candidate minimum factor must be positive, got {}",
                self.cand_min_factor
            )));
        }
        if self.cand_max == 0 {
            return Err(PipelineError::Config(
                "candidate cap must be at least 1".to_string(),
            ));
        }
        if self.queue_cap == 0 {
            return Err(PipelineError::Config(
                "queue capacity must be at least 1".to_string(),
            ));
        }
        if self.sample_id.is_empty() {
            return Err(PipelineError::Config(
                "sample id must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_flag(name: &str) -> bool {
    match env::var(name) {
        Ok(v) => !v.is_empty() && v != "0" && v.to_lowercase() != "false",
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let mut cfg = Config::default_thresholds();
        cfg.input = PathBuf::from("contigs.fna");
        cfg.out_dir = PathBuf::from("out");
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_floor_above_initial_rejected() {
        let mut cfg = Config::default_thresholds();
        cfg.threshold_floor = 0.95;
        let err = cfg.validate().unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn test_out_of_range_confidence_rejected() {
        let mut cfg = Config::default_thresholds();
        cfg.confidence_floor = 1.5;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_zero_cand_max_rejected() {
        let mut cfg = Config::default_thresholds();
        cfg.cand_max = 0;
        assert!(cfg.validate().is_err());
    }
}
