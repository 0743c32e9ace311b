//! Families descriptor: the manifest listing every gene family to process.
//!
//! ```text
//! [FAMILIES]
//! - family_1
//! alignment = path/to/family_1.fasta
//! mapping = path/to/family_1.map
//! starting_gene_tree = path/to/family_1.newick
//! subst_model = GTR
//! ```
//!
//! Filtering runs in two passes: the first drops families whose files do
//! not validate on their own, the second drops families with insufficient
//! species coverage against the current species tree. Dropped families are
//! logged, not fatal; an empty remainder is.

use crate::errors::{FamilyError, FileError};
use crate::io;
use crate::mapping::GeneSpeciesMapping;
use crate::trees::SpeciesTree;
use anyhow::{Context, Result};
use log::*;
use rayon::prelude::*;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

pub const RANDOM_GENE_TREE: &str = "__random__";

#[derive(Clone, Debug)]
pub struct Family {
    pub name: String,
    pub alignment: Option<PathBuf>,
    pub mapping: PathBuf,
    pub starting_gene_tree: Option<String>,
    pub subst_model: String,
    /// Per-family statistics file written by the family job.
    pub stats_file: Option<PathBuf>,
}

pub type Families = Vec<Family>;

pub fn parse_families_file(path: &Path) -> Result<Families> {
    let file = File::open(path).map_err(|source| FileError::CannotOpen {
        source,
        filename: path.display().to_string(),
    })?;
    let mut families: Families = Vec::new();
    let mut in_section = false;
    for (number, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if line == "[FAMILIES]" {
            in_section = true;
            continue;
        }
        if !in_section {
            return Err(FamilyError::BadDescriptor {
                filename: path.display().to_string(),
                reason: format!("line {}: content before [FAMILIES]", number + 1),
            }
            .into());
        }
        if let Some(name) = line.strip_prefix('-') {
            families.push(Family {
                name: name.trim().to_string(),
                alignment: None,
                mapping: PathBuf::new(),
                starting_gene_tree: None,
                subst_model: "GTR".to_string(),
                stats_file: None,
            });
            continue;
        }
        let (key, value) = line.split_once('=').ok_or_else(|| FamilyError::BadDescriptor {
            filename: path.display().to_string(),
            reason: format!("line {}: expected `key = value`", number + 1),
        })?;
        let family = families.last_mut().ok_or_else(|| FamilyError::BadDescriptor {
            filename: path.display().to_string(),
            reason: format!("line {}: property before any family", number + 1),
        })?;
        let value = value.trim();
        match key.trim() {
            "alignment" => family.alignment = Some(PathBuf::from(value)),
            "mapping" => family.mapping = PathBuf::from(value),
            "starting_gene_tree" => family.starting_gene_tree = Some(value.to_string()),
            "subst_model" => family.subst_model = value.to_string(),
            other => {
                debug!("ignoring unknown family property `{}`", other);
            }
        }
    }
    if families.is_empty() {
        return Err(FamilyError::BadDescriptor {
            filename: path.display().to_string(),
            reason: "no family declared".to_string(),
        }
        .into());
    }
    Ok(families)
}

fn validate_family(
    family: &Family,
    species_labels: Option<&std::collections::HashSet<String>>,
    need_alignments: bool,
    check_coverage: bool,
) -> Result<()> {
    let mapping = GeneSpeciesMapping::from_file(&family.mapping)
        .with_context(|| format!("family {}", family.name))?;
    if mapping.is_empty() {
        return Err(FileError::Empty(family.mapping.display().to_string()).into());
    }
    if let Some(species_labels) = species_labels {
        for species in mapping.species() {
            if !species_labels.contains(species) {
                return Err(FamilyError::SpeciesNotFound(species.to_string()).into());
            }
        }
    }
    if let Some(tree) = &family.starting_gene_tree {
        if tree != RANDOM_GENE_TREE {
            let gene = io::newick::read_gene_tree(Path::new(tree))?;
            for label in gene.leaf_labels() {
                if mapping.species_of(&label).is_none() {
                    return Err(FamilyError::UnmappedGene(label).into());
                }
            }
        }
    }
    if need_alignments {
        let alignment = family
            .alignment
            .as_ref()
            .ok_or_else(|| FileError::NotFound(format!("alignment of {}", family.name)))?;
        let records = io::fasta::read_fasta(alignment)?;
        for record in &records {
            if mapping.species_of(&record.label).is_none() {
                return Err(FamilyError::UnmappedGene(record.label.clone()).into());
            }
        }
    }
    if check_coverage {
        // A family restricted to one species carries no topological signal.
        if mapping.species().len() < 2 {
            return Err(FamilyError::NoValidFamily.into());
        }
    }
    Ok(())
}

/// Drop families that do not validate; the caller aborts with code 10 when
/// none survive.
pub fn filter_families(
    families: Families,
    species: Option<&SpeciesTree>,
    need_alignments: bool,
    check_coverage: bool,
) -> Families {
    let species_labels = species.map(|s| s.leaf_labels());
    let verdicts: Vec<(Family, Result<()>)> = families
        .into_par_iter()
        .map(|family| {
            let verdict =
                validate_family(&family, species_labels.as_ref(), need_alignments, check_coverage);
            (family, verdict)
        })
        .collect();
    let mut kept = Vec::new();
    for (family, verdict) in verdicts {
        match verdict {
            Ok(()) => kept.push(family),
            Err(error) => {
                info!("dropping family {}: {:#}", family.name, error);
            }
        }
    }
    kept
}

/// The union of the species named by every family mapping; used to seed
/// random and NJ starting species trees.
pub fn covered_species(families: &Families) -> Result<Vec<String>> {
    let mut all = std::collections::BTreeSet::new();
    for family in families {
        let mapping = GeneSpeciesMapping::from_file(&family.mapping)?;
        for species in mapping.species() {
            all.insert(species.to_string());
        }
    }
    Ok(all.into_iter().collect())
}

/// Approximate per-family cost used by the scheduler for load balancing.
pub fn family_sizes(families: &Families) -> Vec<usize> {
    families
        .iter()
        .map(|family| {
            GeneSpeciesMapping::from_file(&family.mapping).map(|m| m.len()).unwrap_or(1).max(1)
        })
        .collect()
}
