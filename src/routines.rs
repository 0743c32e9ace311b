//! Shared routines of the run pipeline: per-rank joint-tree construction,
//! rate optimisation, random starting trees, reconciliation emission,
//! likelihood gathering and super-matrix assembly.

use crate::families::{Families, Family, RANDOM_GENE_TREE};
use crate::io;
use crate::joint::JointTree;
use crate::mapping::GeneSpeciesMapping;
use crate::maths::Parameters;
use crate::model::{rates_vector_from, RecModel};
use crate::optim::{self, RecOpt};
use crate::parallel::Comm;
use crate::rng;
use crate::search::spr_search;
use crate::seqlik::SequenceEvaluator;
use crate::trees::{GeneTree, SpeciesTree};
use anyhow::{Context, Result};
use log::*;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GeneSearchStrategy {
    Spr,
    Eval,
}

pub fn load_gene_tree(family: &Family) -> Result<GeneTree> {
    let path = family
        .starting_gene_tree
        .as_ref()
        .ok_or_else(|| crate::errors::FileError::NotFound(format!(
            "starting gene tree of {}",
            family.name
        )))?;
    io::newick::read_gene_tree(Path::new(path))
}

pub fn build_joint_tree(
    family: &Family,
    species: &SpeciesTree,
    model: RecModel,
    rooted_gene_tree: bool,
) -> Result<JointTree> {
    let gene = load_gene_tree(family)?;
    let mapping = GeneSpeciesMapping::from_file(&family.mapping)
        .with_context(|| format!("family {}", family.name))?;
    JointTree::new(
        &family.name,
        gene,
        mapping,
        species,
        model,
        rooted_gene_tree,
        SequenceEvaluator::null(&family.name),
    )
}

/// This rank's slice of families, as bound joint trees. A mapping that no
/// longer matches the species tree is a consistency failure, not a
/// filterable family.
pub fn build_joint_trees(
    families: &Families,
    species: &SpeciesTree,
    model: RecModel,
    rooted_gene_tree: bool,
    comm: &Comm,
) -> Result<Vec<JointTree>> {
    let (begin, end) = comm.begin_end(families.len());
    families[begin..end]
        .iter()
        .map(|family| {
            build_joint_tree(family, species, model, rooted_gene_tree).map_err(|error| {
                if error.downcast_ref::<crate::errors::FamilyError>().is_some() {
                    error!("invalid mappings: {:#}", error);
                    comm.abort(42);
                }
                error
            })
        })
        .collect()
}

/// Optimise the DTL(+I) rates over this rank's engines; the objective is
/// reduced across ranks.
#[allow(clippy::too_many_arguments)]
pub fn optimize_rates(
    joints: &mut [JointTree],
    species: &SpeciesTree,
    model: RecModel,
    per_species: bool,
    start: &Parameters,
    method: RecOpt,
    comm: &Comm,
) -> Result<Parameters> {
    let species_count = species.node_count();
    let seeds = if per_species { Some(empirical_rate_seeds(joints, species, model)?) } else { None };
    let mut objective = |params: &Parameters| -> Result<f64> {
        let rates = rates_vector_from(model, params, species_count);
        let mut total = 0.0;
        for joint in joints.iter_mut() {
            joint.set_rates(species, &rates)?;
            total += joint.compute_reconciliation_ll(species)?;
        }
        Ok(comm.sum_double(total))
    };
    let best = if per_species {
        optim::optimize_parameters_per_species(
            &mut objective,
            start,
            species_count,
            model.free_parameters(),
            seeds.as_deref(),
        )?
    } else {
        optim::optimize_parameters_global(&mut objective, start, method)?
    };
    comm.barrier();
    Ok(best)
}

/// Seed per-species rates from the event frequencies of a best
/// reconciliation pass (add-one smoothing against the speciation count).
fn empirical_rate_seeds(
    joints: &mut [JointTree],
    species: &SpeciesTree,
    model: RecModel,
) -> Result<Vec<Vec<f64>>> {
    let k = model.free_parameters();
    let mut counts = vec![[0.0f64; 5]; species.node_count()];
    for joint in joints.iter_mut() {
        let scenario = joint.infer_ml_scenario(species, false)?;
        for e in 0..species.node_count() {
            let per_species = scenario.per_species_counts(e);
            for j in 0..counts[e].len() {
                counts[e][j] += per_species[j];
            }
        }
    }
    Ok(counts
        .iter()
        .map(|freq| {
            let s = freq[0] + 1.0;
            (0..k).map(|j| (freq[j + 1] + 1.0) / s).collect()
        })
        .collect())
}

/// Replace `__random__` starting trees with seeded random topologies,
/// written by the master rank.
pub fn create_random_trees(
    output_dir: &Path,
    families: &mut Families,
    comm: &Comm,
) -> Result<bool> {
    let starting_dir = output_dir.join("startingTrees");
    let mut created = false;
    let seed = rng::snapshot();
    for family in families.iter_mut() {
        let random = match &family.starting_gene_tree {
            None => true,
            Some(tree) => tree == RANDOM_GENE_TREE,
        };
        if !random {
            continue;
        }
        if !created {
            std::fs::create_dir_all(&starting_dir)?;
            created = true;
        }
        let mapping = GeneSpeciesMapping::from_file(&family.mapping)?;
        let mut labels: Vec<String> = mapping.genes().map(|g| g.to_string()).collect();
        labels.sort();
        let gene = GeneTree::random(&labels)?;
        let path = starting_dir.join(format!("{}.newick", family.name));
        if comm.is_master() {
            let mut out = File::create(&path)?;
            writeln!(out, "{}", gene.to_newick(gene.canonical(0)))?;
        }
        family.starting_gene_tree = Some(path.display().to_string());
    }
    rng::restore(seed);
    comm.barrier();
    Ok(created)
}

/// One per-family optimisation job: search the gene tree at the given
/// radius, then save the tree and its `libpllLL / recLL` statistics.
#[allow(clippy::too_many_arguments)]
pub fn optimize_gene_tree_job(
    family: &Family,
    species: &SpeciesTree,
    model: RecModel,
    rooted_gene_tree: bool,
    rates: &Parameters,
    radius: usize,
    strategy: GeneSearchStrategy,
    output_gene_tree: &Path,
    stats_file: &Path,
    comm: &Comm,
) -> Result<()> {
    let mut joint = build_joint_tree(family, species, model, rooted_gene_tree)?;
    let rates = rates_vector_from(model, rates, species.node_count());
    joint.set_rates(species, &rates)?;
    joint.optimize_sequence_parameters()?;
    match strategy {
        GeneSearchStrategy::Spr => {
            spr_search::spr_search(&mut joint, species, radius, true, comm)?;
        }
        GeneSearchStrategy::Eval => {}
    }
    let libpll_ll = joint.compute_sequence_ll()?;
    let rec_ll = joint.compute_reconciliation_ll(species)?;
    joint.save(output_gene_tree)?;
    let mut stats = File::create(stats_file)?;
    writeln!(stats, "{}", libpll_ll)?;
    writeln!(stats, "{}", rec_ll)?;
    Ok(())
}

/// Sum the per-family statistics written by the last job round.
pub fn gather_likelihoods(families: &Families, comm: &Comm) -> Result<(f64, f64)> {
    comm.barrier();
    let mut total_libpll = 0.0;
    let mut total_rec = 0.0;
    let (begin, end) = comm.begin_end(families.len());
    for family in &families[begin..end] {
        let Some(stats_file) = &family.stats_file else {
            continue;
        };
        let file = File::open(stats_file)
            .with_context(|| format!("while reading {}", stats_file.display()))?;
        let mut lines = BufReader::new(file).lines();
        let libpll: f64 = lines.next().transpose()?.unwrap_or_default().trim().parse().unwrap_or(0.0);
        let rec: f64 = lines.next().transpose()?.unwrap_or_default().trim().parse().unwrap_or(0.0);
        total_libpll += libpll;
        total_rec += rec;
    }
    Ok((comm.sum_double(total_libpll), comm.sum_double(total_rec)))
}

/// Emit best and/or sampled reconciliations for every family of this rank.
#[allow(clippy::too_many_arguments)]
pub fn infer_reconciliations(
    species: &SpeciesTree,
    families: &Families,
    model: RecModel,
    rates: &Parameters,
    output_dir: &Path,
    best_reconciliation: bool,
    samples: usize,
    save_transfers_only: bool,
    comm: &Comm,
) -> Result<()> {
    let seed = rng::snapshot();
    comm.barrier();
    let reconciliations = output_dir.join("reconciliations");
    std::fs::create_dir_all(&reconciliations)?;
    let rates = rates_vector_from(model, rates, species.node_count());
    let (begin, end) = comm.begin_end(families.len());
    for family in &families[begin..end] {
        let mut joint = build_joint_tree(family, species, model, true)?;
        joint.set_rates(species, &rates)?;
        if best_reconciliation {
            let scenario = joint.infer_ml_scenario(species, false)?;
            if !save_transfers_only {
                io::recwriter::save_events_counts(
                    &scenario,
                    &reconciliations.join(format!("{}_eventCounts.txt", family.name)),
                )?;
                io::recwriter::save_per_species_events_counts(
                    &scenario,
                    species,
                    model,
                    &reconciliations.join(format!("{}_speciesEventCounts.txt", family.name)),
                )?;
                io::recwriter::save_reconciliation_nhx(
                    joint.gene(),
                    species,
                    &scenario,
                    &reconciliations.join(format!("{}_reconciliated.nhx", family.name)),
                )?;
                io::recwriter::save_reconciliation_xml(
                    joint.gene(),
                    species,
                    &scenario,
                    &reconciliations.join(format!("{}_reconciliated.xml", family.name)),
                )?;
                let groups = io::recwriter::orthogroups(joint.gene(), &scenario);
                io::recwriter::save_orthogroups(
                    &groups,
                    &reconciliations.join(format!("{}_orthogroups.txt", family.name)),
                    true,
                )?;
                io::recwriter::save_orthogroups(
                    &groups,
                    &reconciliations.join(format!("{}_orthogroups_all.txt", family.name)),
                    false,
                )?;
            }
            io::recwriter::save_transfers(
                &scenario,
                species,
                &reconciliations.join(format!("{}_transfers.txt", family.name)),
            )?;
        }
        if samples > 0 {
            let samples_path = reconciliations.join(format!("{}_samples.nhx", family.name));
            let mut out = File::create(&samples_path)?;
            for sample in 0..samples {
                let scenario = joint.infer_ml_scenario(species, true)?;
                if !save_transfers_only {
                    io::recwriter::append_reconciliation_nhx(
                        &mut out,
                        joint.gene(),
                        species,
                        &scenario,
                    )?;
                }
                io::recwriter::save_transfers(
                    &scenario,
                    species,
                    &reconciliations.join(format!("{}_{}_transfers.txt", family.name, sample)),
                )?;
            }
        }
    }
    rng::restore(seed);
    comm.barrier();
    Ok(())
}

/// Concatenate one-sequence-per-species orthogroup alignments into a
/// super-matrix, with a RAxML-style partition file.
pub fn compute_super_matrix(
    families: &Families,
    species: &SpeciesTree,
    output_dir: &Path,
    comm: &Comm,
) -> Result<()> {
    if !comm.is_master() {
        comm.barrier();
        return Ok(());
    }
    let reconciliations = output_dir.join("reconciliations");
    let mut labels: Vec<String> = species.leaf_labels().into_iter().collect();
    labels.sort();
    let mut concatenated: std::collections::HashMap<String, String> =
        labels.iter().map(|l| (l.clone(), String::new())).collect();
    let mut partitions: Vec<(String, String, usize, usize)> = Vec::new();
    let mut offset = 0usize;

    for family in families {
        let Some(alignment_path) = &family.alignment else {
            continue;
        };
        let orthogroup_path = reconciliations.join(format!("{}_orthogroups.txt", family.name));
        let Ok(file) = File::open(&orthogroup_path) else {
            continue;
        };
        let group: Vec<String> = BufReader::new(file)
            .lines()
            .next()
            .transpose()?
            .unwrap_or_default()
            .split_whitespace()
            .map(|g| g.to_string())
            .collect();
        if group.len() < 2 {
            continue;
        }
        let mapping = GeneSpeciesMapping::from_file(&family.mapping)?;
        let records = io::fasta::read_fasta(alignment_path)?;
        let width = records.first().map(|r| r.sequence.len()).unwrap_or(0);
        if width == 0 {
            continue;
        }
        let mut per_species: std::collections::HashMap<&str, &str> = Default::default();
        for record in &records {
            if !group.contains(&record.label) {
                continue;
            }
            if let Some(species_label) = mapping.species_of(&record.label) {
                per_species.entry(species_label).or_insert(record.sequence.as_str());
            }
        }
        if per_species.len() < 2 {
            continue;
        }
        for label in &labels {
            let row = concatenated.get_mut(label).expect("all species are seeded");
            match per_species.get(label.as_str()) {
                Some(sequence) => row.push_str(sequence),
                None => row.push_str(&"-".repeat(width)),
            }
        }
        partitions.push((family.subst_model.clone(), family.name.clone(), offset + 1, offset + width));
        offset += width;
    }

    let records: Vec<(String, String)> = labels
        .into_iter()
        .filter_map(|label| {
            let row = concatenated.remove(&label)?;
            if row.is_empty() {
                None
            } else {
                Some((label, row))
            }
        })
        .collect();
    io::fasta::write_fasta(&records, &output_dir.join("superMatrix.fasta"))?;
    let mut part = File::create(output_dir.join("superMatrix.part"))?;
    for (model, name, start, end) in partitions {
        writeln!(part, "{}, {} = {}-{}", model, name, start, end)?;
    }
    comm.barrier();
    info!("wrote the orthogroup super-matrix");
    Ok(())
}
