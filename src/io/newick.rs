//! Newick ingestion and emission.
//!
//! Parsing goes through the `newick` crate and is immediately converted to
//! the flat arenas; serialisation is hand-written from the arenas. Nothing
//! outside this module touches the parser's tree representation.

use crate::errors::{FileError, TreeError};
use crate::trees::{GeneTree, SpeciesTree, TopoNode};
use anyhow::{Context, Result};
use newick::{Newick, NewickTree};
use std::fs::File;
use std::io::Write;
use std::path::Path;

fn convert(tree: &NewickTree, node: usize) -> TopoNode {
    let children = tree
        .children(node)
        .unwrap_or(&[])
        .iter()
        .map(|&c| convert(tree, c))
        .collect::<Vec<_>>();
    TopoNode {
        label: tree.name(node).map(|s| s.to_string()),
        length: tree.get(node).ok().and_then(|n| n.branch()).map(|l| *l as f64).unwrap_or(1.0),
        children,
    }
}

fn parse_file(path: &Path) -> Result<TopoNode> {
    let tree = newick::one_from_filename(&path.display().to_string())
        .map_err(|e| TreeError::BadNewick(e.to_string()))
        .with_context(|| FileError::NotFound(path.display().to_string()))?;
    Ok(convert(&tree, tree.root()))
}

fn parse_string(newick: &str) -> Result<TopoNode> {
    let trees = newick::from_string(newick).map_err(|e| TreeError::BadNewick(e.to_string()))?;
    let tree = trees.first().ok_or_else(|| TreeError::BadNewick("no tree found".to_string()))?;
    Ok(convert(tree, tree.root()))
}

pub fn read_species_tree(path: &Path) -> Result<SpeciesTree> {
    SpeciesTree::from_topology(&parse_file(path)?)
        .with_context(|| format!("while reading the species tree {}", path.display()))
}

pub fn species_tree_from_string(newick: &str) -> Result<SpeciesTree> {
    SpeciesTree::from_topology(&parse_string(newick)?)
}

pub fn read_gene_tree(path: &Path) -> Result<GeneTree> {
    GeneTree::from_topology(&parse_file(path)?)
        .with_context(|| format!("while reading the gene tree {}", path.display()))
}

pub fn gene_tree_from_string(newick: &str) -> Result<GeneTree> {
    GeneTree::from_topology(&parse_string(newick)?)
}

pub fn save_species_tree(tree: &SpeciesTree, path: &Path) -> Result<()> {
    let mut out = File::create(path).map_err(|source| FileError::WhileCreating {
        source,
        filename: path.display().to_string(),
    })?;
    writeln!(out, "{}", tree.to_newick())?;
    Ok(())
}
