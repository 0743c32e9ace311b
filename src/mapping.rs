//! Gene-to-species leaf mapping.
//!
//! Two on-disk formats are accepted: one `species:gene1;gene2;...` entry per
//! line, or one `gene species` pair per line. Each gene must be mapped
//! exactly once; many genes may map to the same species.

use crate::errors::{FamilyError, FileError};
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

#[derive(Clone, Debug, Default)]
pub struct GeneSpeciesMapping {
    gene_to_species: HashMap<String, String>,
}

impl GeneSpeciesMapping {
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|source| FileError::CannotOpen {
            source,
            filename: path.display().to_string(),
        })?;
        let mut gene_to_species = HashMap::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if let Some((species, genes)) = line.split_once(':') {
                for gene in genes.split(';').filter(|g| !g.is_empty()) {
                    insert_once(&mut gene_to_species, gene, species)?;
                }
            } else {
                let mut fields = line.split_whitespace();
                let gene = fields
                    .next()
                    .ok_or_else(|| FamilyError::UnmappedGene(line.to_string()))?;
                let species = fields
                    .next()
                    .ok_or_else(|| FamilyError::UnmappedGene(gene.to_string()))?;
                insert_once(&mut gene_to_species, gene, species)?;
            }
        }
        Ok(GeneSpeciesMapping { gene_to_species })
    }

    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Result<Self> {
        let mut gene_to_species = HashMap::new();
        for (gene, species) in pairs {
            insert_once(&mut gene_to_species, gene, species)?;
        }
        Ok(GeneSpeciesMapping { gene_to_species })
    }

    pub fn len(&self) -> usize {
        self.gene_to_species.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gene_to_species.is_empty()
    }

    pub fn species_of(&self, gene: &str) -> Option<&str> {
        self.gene_to_species.get(gene).map(|s| s.as_str())
    }

    pub fn genes(&self) -> impl Iterator<Item = &str> {
        self.gene_to_species.keys().map(|g| g.as_str())
    }

    pub fn species(&self) -> HashSet<&str> {
        self.gene_to_species.values().map(|s| s.as_str()).collect()
    }

    /// Every gene label must be mapped, and every mapped species must exist.
    pub fn check_coverage<'a>(
        &self,
        gene_labels: impl Iterator<Item = &'a str>,
        species_labels: &HashSet<String>,
    ) -> Result<()> {
        for gene in gene_labels {
            let species = self
                .species_of(gene)
                .with_context(|| FamilyError::UnmappedGene(gene.to_string()))?;
            if !species_labels.contains(species) {
                return Err(FamilyError::SpeciesNotFound(species.to_string()).into());
            }
        }
        Ok(())
    }
}

fn insert_once(
    map: &mut HashMap<String, String>,
    gene: &str,
    species: &str,
) -> Result<()> {
    if map.insert(gene.to_string(), species.to_string()).is_some() {
        return Err(FamilyError::DuplicatedGene(gene.to_string()).into());
    }
    Ok(())
}
