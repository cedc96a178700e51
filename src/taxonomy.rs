//! NCBI-style taxonomy store.
//!
//! Loads a taxdump (nodes.dmp / names.dmp / merged.dmp / delnodes.dmp)
//! into an arena of nodes plus a taxid -> arena-index map, and answers
//! parent / rank / name / lineage / LCA / ancestor-at-rank queries in
//! constant or depth-bounded time. The store is immutable after `load`
//! and shared read-only across the pipeline.
//!
//! Load-time problems (missing files, malformed rows, cycles) are fatal.
//! Query-time problems (unknown taxids) return the unassigned sentinel
//! `0` and bump an atomic counter instead of failing the run.

use anyhow::{Context, Result};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

pub type TaxId = u32;

/// Reserved taxid for "unassigned".
pub const UNASSIGNED: TaxId = 0;

/// NCBI root taxid.
pub const ROOT: TaxId = 1;

const NCBI_TAXDUMP_URL: &str = "https://ftp.ncbi.nlm.nih.gov/pub/taxonomy/taxdump.tar.gz";

/// Hop cap when following merged-id chains. Well-formed dumps need one
/// hop; anything deeper is a corrupt dump.
const MAX_MERGE_HOPS: usize = 64;

/// Depth cap for root-ward walks. NCBI lineages are < 60 deep; exceeding
/// this at load time means the parent relation has a cycle.
const MAX_DEPTH: usize = 128;

/// The seven ranked levels, root-ward first. `NoRank` sorts after all
/// ranked levels and marks intermediate nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Rank {
    Superkingdom,
    Phylum,
    Class,
    Order,
    Family,
    Genus,
    Species,
    NoRank,
}

/// All ranked levels in root -> leaf order.
pub const RANKS: [Rank; 7] = [
    Rank::Superkingdom,
    Rank::Phylum,
    Rank::Class,
    Rank::Order,
    Rank::Family,
    Rank::Genus,
    Rank::Species,
];

impl Rank {
    pub fn as_str(&self) -> &'static str {
        match self {
            Rank::Superkingdom => "superkingdom",
            Rank::Phylum => "phylum",
            Rank::Class => "class",
            Rank::Order => "order",
            Rank::Family => "family",
            Rank::Genus => "genus",
            Rank::Species => "species",
            Rank::NoRank => "no_rank",
        }
    }

    /// Parse a nodes.dmp rank string. "domain" and "kingdom" are treated
    /// as superkingdom (newer dumps renamed the level); every rank
    /// outside the seven-level ladder maps to `NoRank`.
    pub fn parse(s: &str) -> Rank {
        match s {
            "superkingdom" | "domain" | "kingdom" => Rank::Superkingdom,
            "phylum" => Rank::Phylum,
            "class" => Rank::Class,
            "order" => Rank::Order,
            "family" => Rank::Family,
            "genus" => Rank::Genus,
            "species" => Rank::Species,
            _ => Rank::NoRank,
        }
    }
}

#[derive(Debug)]
struct Node {
    taxid: TaxId,
    parent: usize,
    rank: Rank,
    name: String,
}

#[derive(Debug)]
pub struct Taxonomy {
    nodes: Vec<Node>,
    index: FxHashMap<TaxId, usize>,
    merged: FxHashMap<TaxId, TaxId>,
    deleted: FxHashSet<TaxId>,
    unknown_queries: AtomicU64,
}

impl Taxonomy {
    /// Load the store from a taxdump directory. All four relations must
    /// be present; a malformed required field or a parent cycle fails the
    /// load.
    pub fn load(taxdump_dir: &Path) -> Result<Self> {
        for file in ["nodes.dmp", "names.dmp", "merged.dmp", "delnodes.dmp"] {
            if !taxdump_dir.join(file).exists() {
                anyhow::bail!(
                    "{} not found in taxdump directory: {}",
                    file,
                    taxdump_dir.display()
                );
            }
        }

        let nodes_raw = parse_nodes_dmp(&taxdump_dir.join("nodes.dmp"))?;
        let names = parse_names_dmp(&taxdump_dir.join("names.dmp"))?;
        let merged = parse_merged_dmp(&taxdump_dir.join("merged.dmp"))?;
        let deleted = parse_delnodes_dmp(&taxdump_dir.join("delnodes.dmp"))?;

        Self::build(nodes_raw, names, merged, deleted)
    }

    /// Assemble a store from already-parsed relations. Public so tests
    /// and embedders can construct synthetic taxonomies without dump
    /// files.
    pub fn from_records(
        nodes: &[(TaxId, TaxId, Rank, &str)],
        merged: &[(TaxId, TaxId)],
        deleted: &[TaxId],
    ) -> Result<Self> {
        let raw: Vec<(TaxId, TaxId, Rank)> = nodes.iter().map(|&(t, p, r, _)| (t, p, r)).collect();
        let names: FxHashMap<TaxId, String> = nodes
            .iter()
            .map(|&(t, _, _, n)| (t, n.to_string()))
            .collect();
        let merged: FxHashMap<TaxId, TaxId> = merged.iter().copied().collect();
        let deleted: FxHashSet<TaxId> = deleted.iter().copied().collect();
        Self::build(raw, names, merged, deleted)
    }

    fn build(
        raw: Vec<(TaxId, TaxId, Rank)>,
        names: FxHashMap<TaxId, String>,
        merged: FxHashMap<TaxId, TaxId>,
        deleted: FxHashSet<TaxId>,
    ) -> Result<Self> {
        if raw.is_empty() {
            anyhow::bail!("taxonomy has no nodes");
        }

        let mut index = FxHashMap::default();
        index.reserve(raw.len());
        for (i, &(taxid, _, _)) in raw.iter().enumerate() {
            if index.insert(taxid, i).is_some() {
                anyhow::bail!("duplicate taxid {} in nodes relation", taxid);
            }
        }

        let mut nodes = Vec::with_capacity(raw.len());
        for &(taxid, parent_taxid, rank) in &raw {
            // Unknown parents attach to the node itself; the cycle check
            // below rejects anything that never reaches a root.
            let parent = index
                .get(&parent_taxid)
                .copied()
                .unwrap_or_else(|| index[&taxid]);
            let name = names.get(&taxid).cloned().unwrap_or_default();
            nodes.push(Node {
                taxid,
                parent,
                rank,
                name,
            });
        }

        let store = Taxonomy {
            nodes,
            index,
            merged,
            deleted,
            unknown_queries: AtomicU64::new(0),
        };

        // Depth-bounded walk from every node; a walk that neither reaches
        // a self-parent root within MAX_DEPTH steps has a cycle.
        for i in 0..store.nodes.len() {
            let mut current = i;
            let mut steps = 0;
            loop {
                let parent = store.nodes[current].parent;
                if parent == current {
                    break;
                }
                current = parent;
                steps += 1;
                if steps > MAX_DEPTH {
                    anyhow::bail!(
                        "cycle detected in taxonomy at taxid {}",
                        store.nodes[i].taxid
                    );
                }
            }
        }

        Ok(store)
    }

    /// Resolve merges and deletions. Deleted ids and ids that cannot be
    /// resolved map to `0`.
    pub fn canonical(&self, taxid: TaxId) -> TaxId {
        if taxid == UNASSIGNED || self.deleted.contains(&taxid) {
            return UNASSIGNED;
        }
        let mut current = taxid;
        let mut hops = 0;
        while let Some(&next) = self.merged.get(&current) {
            current = next;
            hops += 1;
            if hops > MAX_MERGE_HOPS {
                eprintln!(
                    "Warning: merged-id chain for taxid {} exceeds {} hops, treating as unassigned",
                    taxid, MAX_MERGE_HOPS
                );
                self.unknown_queries.fetch_add(1, Ordering::Relaxed);
                return UNASSIGNED;
            }
        }
        if self.deleted.contains(&current) {
            return UNASSIGNED;
        }
        current
    }

    fn idx(&self, taxid: TaxId) -> Option<usize> {
        let canonical = self.canonical(taxid);
        if canonical == UNASSIGNED {
            if taxid != UNASSIGNED {
                self.unknown_queries.fetch_add(1, Ordering::Relaxed);
            }
            return None;
        }
        match self.index.get(&canonical) {
            Some(&i) => Some(i),
            None => {
                self.unknown_queries.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn contains(&self, taxid: TaxId) -> bool {
        let canonical = self.canonical(taxid);
        canonical != UNASSIGNED && self.index.contains_key(&canonical)
    }

    /// Parent taxid, or `0` for unknown ids. The root is its own parent.
    pub fn parent(&self, taxid: TaxId) -> TaxId {
        match self.idx(taxid) {
            Some(i) => self.nodes[self.nodes[i].parent].taxid,
            None => UNASSIGNED,
        }
    }

    pub fn rank(&self, taxid: TaxId) -> Rank {
        match self.idx(taxid) {
            Some(i) => self.nodes[i].rank,
            None => Rank::NoRank,
        }
    }

    pub fn name(&self, taxid: TaxId) -> &str {
        match self.idx(taxid) {
            Some(i) => &self.nodes[i].name,
            None => "",
        }
    }

    /// Leaf-ward-first chain from `taxid` (inclusive) to the root. Empty
    /// for unknown ids. The walk is depth-bounded, so it is finite even
    /// on a store whose invariants were somehow violated after load.
    pub fn lineage(&self, taxid: TaxId) -> Vec<TaxId> {
        let mut chain = Vec::new();
        let mut current = match self.idx(taxid) {
            Some(i) => i,
            None => return chain,
        };
        for _ in 0..MAX_DEPTH {
            chain.push(self.nodes[current].taxid);
            let parent = self.nodes[current].parent;
            if parent == current {
                break;
            }
            current = parent;
        }
        chain
    }

    /// Classic LCA: collect one lineage into a set, walk the other until
    /// a member is found. Returns the root when either input is unknown.
    pub fn lca(&self, a: TaxId, b: TaxId) -> TaxId {
        let (ia, ib) = match (self.idx(a), self.idx(b)) {
            (Some(ia), Some(ib)) => (ia, ib),
            _ => return ROOT,
        };
        if ia == ib {
            return self.nodes[ia].taxid;
        }

        let mut path = FxHashSet::default();
        let mut current = ia;
        for _ in 0..MAX_DEPTH {
            path.insert(current);
            let parent = self.nodes[current].parent;
            if parent == current {
                break;
            }
            current = parent;
        }

        let mut current = ib;
        for _ in 0..MAX_DEPTH {
            if path.contains(&current) {
                return self.nodes[current].taxid;
            }
            let parent = self.nodes[current].parent;
            if parent == current {
                break;
            }
            current = parent;
        }
        ROOT
    }

    /// First ancestor of `taxid` (inclusive) at exactly rank `rank`, or
    /// `0` when the lineage has no node at that rank.
    pub fn ancestor_at_rank(&self, taxid: TaxId, rank: Rank) -> TaxId {
        let mut current = match self.idx(taxid) {
            Some(i) => i,
            None => return UNASSIGNED,
        };
        for _ in 0..MAX_DEPTH {
            if self.nodes[current].rank == rank {
                return self.nodes[current].taxid;
            }
            let parent = self.nodes[current].parent;
            if parent == current {
                break;
            }
            current = parent;
        }
        UNASSIGNED
    }

    /// How many queries hit an unknown / deleted / unresolvable taxid.
    pub fn unknown_query_count(&self) -> u64 {
        self.unknown_queries.load(Ordering::Relaxed)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

/// Format: taxid | parent_taxid | rank | ...
fn parse_nodes_dmp(path: &Path) -> Result<Vec<(TaxId, TaxId, Rank)>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut nodes = Vec::new();

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split("\t|\t").collect();
        if fields.len() < 3 {
            anyhow::bail!("malformed nodes.dmp row at line {}", lineno + 1);
        }
        let taxid: TaxId = fields[0]
            .trim()
            .parse()
            .with_context(|| format!("invalid taxid in nodes.dmp line {}", lineno + 1))?;
        let parent: TaxId = fields[1]
            .trim()
            .parse()
            .with_context(|| format!("invalid parent taxid in nodes.dmp line {}", lineno + 1))?;
        let rank = Rank::parse(fields[2].trim().trim_end_matches("\t|"));
        nodes.push((taxid, parent, rank));
    }

    Ok(nodes)
}

/// Format: taxid | name | unique name | name class |
/// Only "scientific name" rows are kept.
fn parse_names_dmp(path: &Path) -> Result<FxHashMap<TaxId, String>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut names = FxHashMap::default();

    for line in reader.lines() {
        let line = line?;
        let fields: Vec<&str> = line.split("\t|\t").collect();
        if fields.len() >= 4 {
            let name_class = fields[3].trim_end_matches("\t|").trim_end_matches('|').trim();
            if name_class == "scientific name" {
                if let Ok(taxid) = fields[0].trim().parse::<TaxId>() {
                    names.insert(taxid, fields[1].to_string());
                }
            }
        }
    }

    Ok(names)
}

/// Format: old_taxid | new_taxid |
fn parse_merged_dmp(path: &Path) -> Result<FxHashMap<TaxId, TaxId>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut merged = FxHashMap::default();

    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split("\t|\t").collect();
        if fields.len() < 2 {
            anyhow::bail!("malformed merged.dmp row at line {}", lineno + 1);
        }
        let old: TaxId = fields[0]
            .trim()
            .parse()
            .with_context(|| format!("invalid old taxid in merged.dmp line {}", lineno + 1))?;
        let new: TaxId = fields[1]
            .trim()
            .trim_end_matches("\t|")
            .trim_end_matches('|')
            .trim()
            .parse()
            .with_context(|| format!("invalid new taxid in merged.dmp line {}", lineno + 1))?;
        merged.insert(old, new);
    }

    Ok(merged)
}

/// Format: taxid |
fn parse_delnodes_dmp(path: &Path) -> Result<FxHashSet<TaxId>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut deleted = FxHashSet::default();

    for line in reader.lines() {
        let line = line?;
        let field = line
            .split('|')
            .next()
            .unwrap_or("")
            .trim();
        if field.is_empty() {
            continue;
        }
        if let Ok(taxid) = field.parse::<TaxId>() {
            deleted.insert(taxid);
        }
    }

    Ok(deleted)
}

/// Ensure a taxdump is present, downloading and extracting it when asked.
pub fn ensure_taxdump(taxdump_dir: &Path) -> Result<()> {
    let nodes_path = taxdump_dir.join("nodes.dmp");
    let names_path = taxdump_dir.join("names.dmp");

    if nodes_path.exists() && names_path.exists() {
        return Ok(());
    }

    eprintln!("Taxdump not found. Downloading from NCBI (~60MB)...");
    std::fs::create_dir_all(taxdump_dir)?;

    let tar_path = taxdump_dir.join("taxdump.tar.gz");
    download_file_with_retry(NCBI_TAXDUMP_URL, &tar_path)?;

    eprintln!("  Extracting taxdump...");
    let tar_arg = tar_path
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("non-UTF8 taxdump path"))?;
    let dir_arg = taxdump_dir
        .to_str()
        .ok_or_else(|| anyhow::anyhow!("non-UTF8 taxdump directory"))?;
    let status = Command::new("tar")
        .args(["-xzf", tar_arg, "-C", dir_arg])
        .status()
        .with_context(|| "Failed to extract taxdump")?;
    if !status.success() {
        anyhow::bail!("tar extraction failed");
    }

    std::fs::remove_file(&tar_path).ok();
    eprintln!("  Taxdump downloaded and extracted");
    Ok(())
}

fn download_file_with_retry(url: &str, output_path: &Path) -> Result<()> {
    for attempt in 0..3 {
        match download_file_once(url, output_path) {
            Ok(_) => return Ok(()),
            Err(e) if attempt < 2 => {
                eprintln!("    Download failed (attempt {}): {}", attempt + 1, e);
                eprintln!("    Retrying in 5 seconds...");
                std::thread::sleep(Duration::from_secs(5));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn download_file_once(url: &str, output_path: &Path) -> Result<()> {
    let response = ureq::get(url)
        .timeout(Duration::from_secs(3600))
        .call()
        .with_context(|| format!("Failed to download {}", url))?;

    let mut file = File::create(output_path)?;
    std::io::copy(&mut response.into_reader(), &mut file)?;
    Ok(())
}
