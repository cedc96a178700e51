//! External tool collaborators.
//!
//! Sketching, alignment and reference materialisation are subprocesses
//! behind narrow traits, so the pipeline can be driven with mocks in
//! tests and the shell-level coupling stays in one place. Every adapter
//! writes only inside the scratch or output path it is handed.

use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use rustc_hash::FxHashMap;
use std::env;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::config::InputKind;
use crate::screen::{read_screen_file, ScreenRow};

/// Produces screen rows for the query set against the sketch database.
pub trait Sketcher {
    fn screen(&self, queries: &Path, scratch: &Path) -> Result<Vec<ScreenRow>>;
    fn version(&self) -> String;
}

/// Builds the reference index and aligns queries against it.
pub trait Aligner {
    fn build_index(&self, references_fasta: &Path, index_out: &Path) -> Result<()>;
    fn align(&self, queries: &Path, index: &Path, paf_out: &Path) -> Result<()>;
    fn version(&self) -> String;
}

/// Materialises the selected references into a scratch directory:
/// `references.fasta` plus the per-sequence `reference_taxonomy.tsv`.
pub trait ReferenceMaterialiser {
    fn materialise(&self, references: &[String], scratch: &Path) -> Result<()>;
}

/// Find executable in system PATH
pub fn find_executable(name: &str) -> Result<PathBuf> {
    let path = Path::new(name);
    if path.is_absolute() && path.exists() {
        return Ok(path.to_path_buf());
    }

    if let Ok(paths) = env::var("PATH") {
        for dir in env::split_paths(&paths) {
            let full_path = dir.join(name);
            if full_path.exists() && full_path.is_file() {
                return Ok(full_path);
            }
        }
    }

    anyhow::bail!("{} not found in PATH. Please install it or add it to your PATH.", name)
}

/// First line of `<tool> --version`, or "unknown".
pub fn tool_version(tool_path: &str) -> String {
    Command::new(tool_path)
        .arg("--version")
        .output()
        .ok()
        .and_then(|o| {
            let text = if o.stdout.is_empty() { o.stderr } else { o.stdout };
            String::from_utf8(text).ok()
        })
        .and_then(|s| s.lines().next().map(|l| l.trim().to_string()))
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// How long a cancelled child gets to exit on SIGTERM before SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(5);

/// Ask a process to terminate (SIGTERM on Unix).
#[cfg(unix)]
fn request_termination(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
fn request_termination(_pid: u32) {}

/// Run a child to completion. When the cancellation flag flips, the
/// child gets SIGTERM and a grace period to exit before being killed
/// outright. Waiting on the child is the only suspension point.
fn run_with_cancel(mut cmd: Command, cancel: &AtomicBool, what: &str) -> Result<()> {
    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to start {}", what))?;

    loop {
        if cancel.load(Ordering::Relaxed) {
            request_termination(child.id());
            let deadline = std::time::Instant::now() + TERM_GRACE;
            while child.try_wait()?.is_none() {
                if std::time::Instant::now() >= deadline {
                    child.kill().ok();
                    break;
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            child.wait().ok();
            // Typed so the orchestrator classifies this as exit 130
            return Err(anyhow::Error::new(crate::error::PipelineError::Cancelled));
        }
        match child.try_wait()? {
            Some(status) if status.success() => return Ok(()),
            Some(status) => anyhow::bail!("{} failed with {}", what, status),
            None => std::thread::sleep(Duration::from_millis(100)),
        }
    }
}

// ============================================================================
// Subprocess adapters
// ============================================================================

pub struct MashSketcher {
    pub mash_path: String,
    pub sketch_db: PathBuf,
    pub threads: usize,
    pub cancel: Arc<AtomicBool>,
}

impl Sketcher for MashSketcher {
    fn screen(&self, queries: &Path, scratch: &Path) -> Result<Vec<ScreenRow>> {
        let report = scratch.join("screen.tsv");
        let out_file = File::create(&report)
            .with_context(|| format!("Failed to create {}", report.display()))?;

        let mut cmd = Command::new(&self.mash_path);
        cmd.arg("screen")
            .args(["-p", &self.threads.to_string()])
            .arg(&self.sketch_db)
            .arg(queries)
            .stdout(Stdio::from(out_file))
            .stderr(Stdio::null());
        run_with_cancel(cmd, &self.cancel, "mash screen")?;

        read_screen_file(&report)
    }

    fn version(&self) -> String {
        format!("mash {}", tool_version(&self.mash_path))
    }
}

pub struct Minimap2Aligner {
    pub minimap2_path: String,
    pub threads: usize,
    pub input_kind: InputKind,
    pub cancel: Arc<AtomicBool>,
}

impl Minimap2Aligner {
    fn preset(&self) -> &'static str {
        match self.input_kind {
            InputKind::Contigs => "asm20",
            InputKind::Reads => "sr",
        }
    }
}

impl Aligner for Minimap2Aligner {
    fn build_index(&self, references_fasta: &Path, index_out: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.minimap2_path);
        cmd.args(["-x", self.preset()])
            .args(["-t", &self.threads.to_string()])
            .arg("-d")
            .arg(index_out)
            .arg(references_fasta)
            .stderr(Stdio::null());
        run_with_cancel(cmd, &self.cancel, "minimap2 indexing")
    }

    fn align(&self, queries: &Path, index: &Path, paf_out: &Path) -> Result<()> {
        let mut cmd = Command::new(&self.minimap2_path);
        cmd.args(["-x", self.preset()])
            .args(["-t", &self.threads.to_string()])
            .args(["--secondary=yes", "-N", "20"])
            .arg(index)
            .arg(queries)
            .arg("-o")
            .arg(paf_out)
            .stderr(Stdio::null());
        run_with_cancel(cmd, &self.cancel, "minimap2 alignment")
    }

    fn version(&self) -> String {
        format!("minimap2 {}", tool_version(&self.minimap2_path))
    }
}

/// Materialises references from a local assembly mirror: an
/// `assembly_summary` table mapping accessions to taxids, next to a
/// `genomes/` directory of per-accession FASTA files (plain or gzipped).
/// Downloading is someone else's job; a selected accession without a
/// local genome fails the cache build.
pub struct LocalMirrorMaterialiser {
    pub assembly_dir: PathBuf,
}

impl LocalMirrorMaterialiser {
    /// Parse every `assembly_summary*` table in the mirror directory.
    /// NCBI layout: accession in column 1, taxid in column 6, comment
    /// lines lead with '#'.
    fn load_taxid_table(&self) -> Result<FxHashMap<String, u32>> {
        let mut table = FxHashMap::default();
        let mut found_any = false;

        for entry in std::fs::read_dir(&self.assembly_dir).with_context(|| {
            format!("Failed to read assembly dir: {}", self.assembly_dir.display())
        })? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.starts_with("assembly_summary") {
                continue;
            }
            found_any = true;
            let file = File::open(entry.path())?;
            for line in BufReader::new(file).lines() {
                let line = line?;
                if line.starts_with('#') || line.is_empty() {
                    continue;
                }
                let fields: Vec<&str> = line.split('\t').collect();
                if fields.len() < 6 {
                    continue;
                }
                if let Ok(taxid) = fields[5].trim().parse::<u32>() {
                    table.insert(fields[0].trim().to_string(), taxid);
                }
            }
        }

        if !found_any {
            anyhow::bail!(
                "no assembly_summary table found in {}",
                self.assembly_dir.display()
            );
        }
        Ok(table)
    }

    /// Accession -> taxid rows in sorted order, for selection-time
    /// species dedup.
    pub fn accession_taxids(&self) -> Result<Vec<(String, u32)>> {
        let mut rows: Vec<(String, u32)> = self.load_taxid_table()?.into_iter().collect();
        rows.sort();
        Ok(rows)
    }

    fn genome_path(&self, accession: &str) -> Option<PathBuf> {
        let genomes = self.assembly_dir.join("genomes");
        for candidate in [
            format!("{}.fna", accession),
            format!("{}.fna.gz", accession),
            format!("{}_genomic.fna", accession),
            format!("{}_genomic.fna.gz", accession),
        ] {
            let path = genomes.join(candidate);
            if path.exists() {
                return Some(path);
            }
        }
        None
    }
}

impl ReferenceMaterialiser for LocalMirrorMaterialiser {
    fn materialise(&self, references: &[String], scratch: &Path) -> Result<()> {
        let taxids = self.load_taxid_table()?;

        let fasta_path = scratch.join(crate::cache::REFERENCES_FASTA);
        let table_path = scratch.join(crate::cache::REFERENCE_TAXONOMY);
        let mut fasta_out = BufWriter::new(File::create(&fasta_path)?);
        let mut table_out = BufWriter::new(File::create(&table_path)?);

        for accession in references {
            let taxid = *taxids.get(accession).ok_or_else(|| {
                anyhow::anyhow!("accession {} missing from assembly_summary", accession)
            })?;
            let genome = self.genome_path(accession).ok_or_else(|| {
                anyhow::anyhow!(
                    "no local genome for accession {} under {}",
                    accession,
                    self.assembly_dir.join("genomes").display()
                )
            })?;

            // Concatenate the genome and map each of its sequence ids to
            // the assembly's taxid; alignment targets are sequence ids,
            // not accessions
            let reader: Box<dyn Read> = if genome.extension().and_then(|e| e.to_str()) == Some("gz")
            {
                Box::new(MultiGzDecoder::new(File::open(&genome)?))
            } else {
                Box::new(File::open(&genome)?)
            };
            for line in BufReader::new(reader).lines() {
                let line = line?;
                if let Some(header) = line.strip_prefix('>') {
                    let seq_id = header.split_whitespace().next().unwrap_or("");
                    writeln!(table_out, "{}\t{}", seq_id, taxid)?;
                }
                writeln!(fasta_out, "{}", line)?;
            }
        }

        fasta_out.flush()?;
        table_out.flush()?;
        Ok(())
    }
}

/// Stand-in when no assembly mirror is configured. Cache hits never
/// reach it; a miss fails the build with a pointer at the missing flag.
pub struct UnavailableMaterialiser;

impl ReferenceMaterialiser for UnavailableMaterialiser {
    fn materialise(&self, _references: &[String], _scratch: &Path) -> Result<()> {
        anyhow::bail!(
            "cache entry must be built but no --assembly-summary-dir was given"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_executable_absolute_path() {
        // Any file that certainly exists
        let path = std::env::current_exe().unwrap();
        let found = find_executable(path.to_str().unwrap()).unwrap();
        assert_eq!(found, path);
    }

    #[test]
    fn test_find_executable_missing() {
        assert!(find_executable("definitely_not_a_real_tool_xyz").is_err());
    }

    #[test]
    fn test_local_mirror_materialises_sequences() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("assembly_summary.txt"),
            "# comment line\nGCF_1\tx\tx\tx\tx\t511145\tmore\nGCF_2\tx\tx\tx\tx\t622\tmore\n",
        )
        .unwrap();
        let genomes = dir.path().join("genomes");
        std::fs::create_dir_all(&genomes).unwrap();
        std::fs::write(genomes.join("GCF_1.fna"), ">seq1 desc\nACGT\n>seq2\nGGTT\n").unwrap();
        std::fs::write(genomes.join("GCF_2.fna"), ">seq3\nTTAA\n").unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let materialiser = LocalMirrorMaterialiser {
            assembly_dir: dir.path().to_path_buf(),
        };
        materialiser
            .materialise(&["GCF_1".to_string(), "GCF_2".to_string()], scratch.path())
            .unwrap();

        let fasta =
            std::fs::read_to_string(scratch.path().join(crate::cache::REFERENCES_FASTA)).unwrap();
        assert!(fasta.contains(">seq1 desc"));
        assert!(fasta.contains(">seq3"));

        let table =
            std::fs::read_to_string(scratch.path().join(crate::cache::REFERENCE_TAXONOMY)).unwrap();
        assert_eq!(table, "seq1\t511145\nseq2\t511145\nseq3\t622\n");
    }

    #[test]
    fn test_local_mirror_missing_genome_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("assembly_summary.txt"),
            "GCF_1\tx\tx\tx\tx\t511145\n",
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("genomes")).unwrap();

        let scratch = tempfile::tempdir().unwrap();
        let materialiser = LocalMirrorMaterialiser {
            assembly_dir: dir.path().to_path_buf(),
        };
        let err = materialiser
            .materialise(&["GCF_1".to_string()], scratch.path())
            .unwrap_err();
        assert!(err.to_string().contains("no local genome"));
    }
}
