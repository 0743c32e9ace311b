//! End-to-end run control flow: instance initialisation, starting trees,
//! the alternating rate/gene-tree/species-tree optimisation schedule, the
//! reconciliation emission and the final statistics.

use crate::families::{self, Families};
use crate::io;
use crate::mapping::GeneSpeciesMapping;
use crate::maths::Parameters;
use crate::model::RecModel;
use crate::optim::RecOpt;
use crate::parallel::Comm;
use crate::rng;
use crate::routines::{self, GeneSearchStrategy};
use crate::scheduler::{self, Job};
use crate::search::species_opt::{SpeciesSearchStrategy, SpeciesTreeOptimizer};
use crate::trees::{SpeciesTree, TopoNode};
use anyhow::{Context, Result};
use log::*;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::Instant;

#[derive(Clone, Debug)]
pub struct RunArgs {
    pub families: PathBuf,
    pub species_tree: String,
    pub rec_model: RecModel,
    pub rec_opt: RecOpt,
    pub prefix: PathBuf,
    pub seed: u64,
    pub strategy: GeneSearchStrategy,
    pub species_strategy: SpeciesSearchStrategy,
    pub rooted_gene_tree: bool,
    pub per_species_rates: bool,
    pub user_rates: bool,
    pub dup_rate: f64,
    pub loss_rate: f64,
    pub transfer_rate: f64,
    pub fast_radius: usize,
    pub slow_radius: usize,
    pub final_gene_radius: usize,
    pub reconcile: bool,
    pub reconciliation_samples: usize,
    pub optimize_species_tree: bool,
    pub build_super_matrix: bool,
    pub allow_split: bool,
}

pub struct Instance {
    args: RunArgs,
    comm: Comm,
    species: SpeciesTree,
    families: Families,
    rates: Parameters,
    total_rec_ll: f64,
    total_libpll_ll: f64,
    iteration: usize,
    run_log: File,
    started: Instant,
}

pub fn run(args: RunArgs, comm: Comm) -> Result<()> {
    let mut instance = init_instance(args, comm)?;
    init_random_gene_trees(&mut instance)?;
    gene_tree_joint_search(&mut instance)?;
    species_tree_search(&mut instance)?;
    reconcile(&mut instance)?;
    terminate(&mut instance)
}

fn starting_rates(args: &RunArgs) -> Parameters {
    match args.rec_model {
        RecModel::UndatedDL => Parameters::of(&[args.dup_rate, args.loss_rate]),
        RecModel::UndatedDTL => {
            Parameters::of(&[args.dup_rate, args.loss_rate, args.transfer_rate])
        }
        RecModel::UndatedIDTL => {
            Parameters::of(&[args.dup_rate, args.loss_rate, args.transfer_rate, 0.1])
        }
    }
}

fn init_instance(args: RunArgs, comm: Comm) -> Result<Instance> {
    rng::init(args.seed);
    std::fs::create_dir_all(&args.prefix)
        .with_context(|| format!("while creating {}", args.prefix.display()))?;
    let mut run_log = File::create(args.prefix.join("generax"))?;
    writeln!(run_log, "seed: {}", args.seed)?;
    writeln!(run_log, "reconciliation model: {}", args.rec_model.name())?;
    writeln!(run_log, "rate optimizer: {}", args.rec_opt.name())?;
    comm.assert_rand_consistent();

    info!("filtering invalid families");
    let parsed = families::parse_families_file(&args.families)?;
    let parsed = families::filter_families(parsed, None, false, false);

    let species = build_starting_species_tree(&args, &parsed, &comm)?;
    io::newick::save_species_tree(&species, &args.prefix.join("starting_species_tree.newick"))?;

    info!("filtering families against the starting species tree");
    let mut kept = families::filter_families(parsed, Some(&species), false, true);
    if kept.is_empty() {
        error!("no valid family left");
        comm.abort(10);
    }
    comm.barrier();

    let results = args.prefix.join("results");
    let proposals = args.prefix.join("proposals");
    std::fs::create_dir_all(&results)?;
    std::fs::create_dir_all(&proposals)?;
    for family in kept.iter_mut() {
        let family_dir = results.join(&family.name);
        std::fs::create_dir_all(&family_dir)?;
        std::fs::create_dir_all(proposals.join(&family.name))?;
        family.stats_file = Some(family_dir.join("stats.txt"));
    }

    let rates = starting_rates(&args);
    Ok(Instance {
        args,
        comm,
        species,
        families: kept,
        rates,
        total_rec_ll: 0.0,
        total_libpll_ll: 0.0,
        iteration: 0,
        run_log,
        started: Instant::now(),
    })
}

fn build_starting_species_tree(
    args: &RunArgs,
    families: &Families,
    comm: &Comm,
) -> Result<SpeciesTree> {
    match args.species_tree.as_str() {
        "random" => {
            info!("generating a random starting species tree");
            let labels = families::covered_species(families)?;
            let seed = rng::snapshot();
            let mut parts: Vec<TopoNode> =
                labels.iter().map(|l| TopoNode::leaf(l)).collect();
            while parts.len() > 2 {
                let i = rng::gen_range(parts.len());
                let a = parts.swap_remove(i);
                let j = rng::gen_range(parts.len());
                let b = parts.swap_remove(j);
                parts.push(TopoNode::join(vec![a, b]));
            }
            rng::restore(seed);
            comm.barrier();
            SpeciesTree::from_topology(&TopoNode::join(parts))
        }
        "NJ" => {
            info!("generating a coverage-profile NJ starting species tree");
            let (matrix, labels) = coverage_profile_distances(families)?;
            crate::trees::nj::nj_tree(&matrix, &labels)
        }
        "NJst" => {
            info!("generating a gene-tree NJ starting species tree");
            let (matrix, labels) = gene_tree_distances(families)?;
            crate::trees::nj::nj_tree(&matrix, &labels)
        }
        path => io::newick::read_species_tree(Path::new(path)),
    }
}

/// Jaccard-style distance between the per-family presence profiles of two
/// species.
fn coverage_profile_distances(families: &Families) -> Result<(Vec<Vec<f64>>, Vec<String>)> {
    let labels = families::covered_species(families)?;
    let index: HashMap<&str, usize> =
        labels.iter().enumerate().map(|(i, l)| (l.as_str(), i)).collect();
    let n = labels.len();
    let mut both = vec![vec![0.0f64; n]; n];
    let mut has = vec![0.0f64; n];
    for family in families {
        let mapping = GeneSpeciesMapping::from_file(&family.mapping)?;
        let present: Vec<usize> =
            mapping.species().iter().filter_map(|s| index.get(s).copied()).collect();
        for &i in &present {
            has[i] += 1.0;
            for &j in &present {
                both[i][j] += 1.0;
            }
        }
    }
    let mut matrix = vec![vec![0.0f64; n]; n];
    for i in 0..n {
        for j in 0..n {
            if i != j {
                let either = has[i] + has[j] - both[i][j];
                matrix[i][j] = 1.0 - crate::maths::safe_div(both[i][j], either);
            }
        }
    }
    Ok((matrix, labels))
}

/// Average topological distance between species across the starting gene
/// trees.
fn gene_tree_distances(families: &Families) -> Result<(Vec<Vec<f64>>, Vec<String>)> {
    let labels = families::covered_species(families)?;
    let index: HashMap<&str, usize> =
        labels.iter().enumerate().map(|(i, l)| (l.as_str(), i)).collect();
    let n = labels.len();
    let mut sums = vec![vec![0.0f64; n]; n];
    let mut counts = vec![vec![0.0f64; n]; n];
    for family in families {
        let Some(tree) = &family.starting_gene_tree else {
            continue;
        };
        if tree == families::RANDOM_GENE_TREE {
            continue;
        }
        let gene = io::newick::read_gene_tree(Path::new(tree))?;
        let mapping = GeneSpeciesMapping::from_file(&family.mapping)?;
        for (from, to, distance) in gene.leaf_distances() {
            let (Some(sf), Some(st)) = (mapping.species_of(&from), mapping.species_of(&to)) else {
                continue;
            };
            let (Some(&i), Some(&j)) = (index.get(sf), index.get(st)) else {
                continue;
            };
            if i != j {
                sums[i][j] += distance as f64;
                counts[i][j] += 1.0;
            }
        }
    }
    let mut matrix = vec![vec![0.0f64; n]; n];
    let mut max_seen = 1.0f64;
    for i in 0..n {
        for j in 0..n {
            if counts[i][j] > 0.0 {
                matrix[i][j] = sums[i][j] / counts[i][j];
                max_seen = max_seen.max(matrix[i][j]);
            }
        }
    }
    for i in 0..n {
        for j in 0..n {
            if i != j && matrix[i][j] == 0.0 {
                matrix[i][j] = max_seen;
            }
        }
    }
    Ok((matrix, labels))
}

fn init_random_gene_trees(instance: &mut Instance) -> Result<()> {
    instance.comm.assert_rand_consistent();
    let created = routines::create_random_trees(
        &instance.args.prefix,
        &mut instance.families,
        &instance.comm,
    )?;
    if created {
        info!("random starting gene trees generated; running an initial evaluation round");
        run_gene_optimization_round(instance, 1, GeneSearchStrategy::Eval)?;
    }
    Ok(())
}

fn run_gene_optimization_round(
    instance: &mut Instance,
    radius: usize,
    strategy: GeneSearchStrategy,
) -> Result<()> {
    let results = instance.args.prefix.join("results");
    let scheduler_dir = instance.args.prefix.join("scheduler");
    std::fs::create_dir_all(&scheduler_dir)?;
    let command_file = scheduler_dir.join(format!("command_{}.txt", instance.iteration));
    instance.iteration += 1;

    let costs = families::family_sizes(&instance.families);
    let by_name: HashMap<String, crate::families::Family> = instance
        .families
        .iter()
        .cloned()
        .map(|family| (family.name.clone(), family))
        .collect();
    let mut jobs: Vec<Job> = instance
        .families
        .iter()
        .zip(costs)
        .map(|(family, cost)| Job {
            name: family.name.clone(),
            cores: 1,
            cost,
            args: family_worker_args(instance, family, radius, strategy),
        })
        .collect();
    let species = instance.species.clone();
    let model = instance.args.rec_model;
    let rooted = instance.args.rooted_gene_tree;
    let rates = instance.rates.clone();
    let comm = instance.comm.clone();
    scheduler::run_jobs(&instance.comm, &mut jobs, &command_file, false, |job| {
        let family = by_name.get(&job.name).expect("jobs come from the family set");
        let family_dir = results.join(&family.name);
        routines::optimize_gene_tree_job(
            family,
            &species,
            model,
            rooted,
            &rates,
            radius,
            strategy,
            &family_dir.join("geneTree.newick"),
            &family_dir.join("stats.txt"),
            &comm,
        )
    })?;

    // Subsequent rounds continue from the trees this round produced.
    for family in instance.families.iter_mut() {
        let tree = results.join(&family.name).join("geneTree.newick");
        if tree.exists() {
            family.starting_gene_tree = Some(tree.display().to_string());
        }
    }
    Ok(())
}

fn family_worker_args(
    instance: &Instance,
    family: &crate::families::Family,
    radius: usize,
    strategy: GeneSearchStrategy,
) -> Vec<String> {
    let results = instance.args.prefix.join("results").join(&family.name);
    vec![
        family.starting_gene_tree.clone().unwrap_or_else(|| "-".to_string()),
        family.mapping.display().to_string(),
        family
            .alignment
            .as_ref()
            .map(|a| a.display().to_string())
            .unwrap_or_else(|| "-".to_string()),
        instance.args.prefix.join("starting_species_tree.newick").display().to_string(),
        family.subst_model.clone(),
        instance.args.rec_model.name().to_string(),
        if instance.args.rooted_gene_tree { "1" } else { "0" }.to_string(),
        instance
            .rates
            .values()
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(":"),
        radius.to_string(),
        match strategy {
            GeneSearchStrategy::Spr => "SPR",
            GeneSearchStrategy::Eval => "EVAL",
        }
        .to_string(),
        results.join("geneTree.newick").display().to_string(),
        results.join("stats.txt").display().to_string(),
    ]
}

fn gene_tree_joint_search(instance: &mut Instance) -> Result<()> {
    instance.comm.assert_rand_consistent();
    for radius in 1..=instance.args.final_gene_radius {
        let per_species = instance.args.per_species_rates
            && radius + 1 >= instance.args.final_gene_radius;
        if !instance.args.user_rates {
            let phase_start = Instant::now();
            info!("reconciliation rates optimization");
            let mut joints = routines::build_joint_trees(
                &instance.families,
                &instance.species,
                instance.args.rec_model,
                instance.args.rooted_gene_tree,
                &instance.comm,
            )?;
            instance.rates = routines::optimize_rates(
                &mut joints,
                &instance.species,
                instance.args.rec_model,
                per_species,
                &instance.rates,
                instance.args.rec_opt,
                &instance.comm,
            )?;
            if instance.rates.dimensions() <= 4 {
                info!("rates: {}", instance.rates);
            } else {
                info!("per-species rates, RecLL={:.4}", instance.rates.score());
            }
            debug!("rates phase took {:.1}s", phase_start.elapsed().as_secs_f64());
        }
        let phase_start = Instant::now();
        info!("optimizing gene trees with radius={}", radius);
        run_gene_optimization_round(instance, radius, instance.args.strategy)?;
        let (libpll_ll, rec_ll) = routines::gather_likelihoods(&instance.families, &instance.comm)?;
        instance.total_libpll_ll = libpll_ll;
        instance.total_rec_ll = rec_ll;
        info!(
            "JointLL={:.4} RecLL={:.4} LibpllLL={:.4} ({:.1}s)",
            libpll_ll + rec_ll,
            rec_ll,
            libpll_ll,
            phase_start.elapsed().as_secs_f64()
        );
    }
    Ok(())
}

fn species_tree_search(instance: &mut Instance) -> Result<()> {
    instance.comm.assert_rand_consistent();
    if !instance.args.optimize_species_tree {
        return Ok(());
    }
    info!("starting the species tree search");
    let joints = routines::build_joint_trees(
        &instance.families,
        &instance.species,
        instance.args.rec_model,
        instance.args.rooted_gene_tree,
        &instance.comm,
    )?;
    let mut optimizer = SpeciesTreeOptimizer::new(
        instance.species.clone(),
        joints,
        instance.args.rec_model,
        instance.rates.clone(),
        instance.args.user_rates,
        instance.args.rec_opt,
        &instance.args.prefix,
        instance.comm.clone(),
    )?;
    let rec_ll = optimizer.run_strategy(
        instance.args.species_strategy,
        instance.args.fast_radius,
        instance.args.slow_radius,
    )?;
    instance.total_rec_ll = rec_ll;
    instance.rates = optimizer.rates().clone();
    instance.species = optimizer.into_species_tree();
    info!("species tree search done, RecLL={:.4}", rec_ll);
    instance.comm.barrier();
    Ok(())
}

fn reconcile(instance: &mut Instance) -> Result<()> {
    instance.comm.assert_rand_consistent();
    if !instance.args.reconcile && instance.args.reconciliation_samples == 0 {
        return Ok(());
    }
    info!("reconciling gene trees with the species tree");
    routines::infer_reconciliations(
        &instance.species,
        &instance.families,
        instance.args.rec_model,
        &instance.rates,
        &instance.args.prefix,
        instance.args.reconcile,
        instance.args.reconciliation_samples,
        false,
        &instance.comm,
    )?;
    if instance.args.build_super_matrix {
        routines::compute_super_matrix(
            &instance.families,
            &instance.species,
            &instance.args.prefix,
            &instance.comm,
        )?;
    }
    Ok(())
}

fn terminate(instance: &mut Instance) -> Result<()> {
    instance.comm.assert_rand_consistent();
    io::newick::save_species_tree(
        &instance.species,
        &instance.args.prefix.join("inferred_species_tree.newick"),
    )?;
    if instance.comm.is_master() {
        let mut stats = File::create(instance.args.prefix.join("stats.txt"))?;
        writeln!(stats, "JointLL: {}", instance.total_libpll_ll + instance.total_rec_ll)?;
        writeln!(stats, "LibpllLL: {}", instance.total_libpll_ll)?;
        write!(stats, "RecLL: {}", instance.total_rec_ll)?;
    }
    if instance.rates.dimensions() <= 4 {
        info!("final rates: {}", instance.rates);
        writeln!(instance.run_log, "final rates: {}", instance.rates)?;
    }
    info!("reconciliation likelihood: {:.4}", instance.total_rec_ll);
    if instance.total_libpll_ll != 0.0 {
        info!("phylogenetic likelihood: {:.4}", instance.total_libpll_ll);
        info!(
            "joint likelihood: {:.4}",
            instance.total_libpll_ll + instance.total_rec_ll
        );
    }
    writeln!(
        instance.run_log,
        "RecLL: {} LibpllLL: {} elapsed: {}s",
        instance.total_rec_ll,
        instance.total_libpll_ll,
        instance.started.elapsed().as_secs()
    )?;
    info!("results directory: {}", instance.args.prefix.display());
    info!("end of the run");
    Ok(())
}

/// Entry point of the split-scheduler worker: replay one family job from
/// the command file.
pub fn run_family_worker(command_file: &Path, name: &str, comm: &Comm) -> Result<()> {
    let jobs = scheduler::read_command_file(command_file)?;
    let job = jobs
        .into_iter()
        .find(|job| job.name == name)
        .ok_or_else(|| crate::errors::FileError::NotFound(format!("job {}", name)))?;
    let args = &job.args;
    anyhow::ensure!(args.len() >= 12, "malformed worker command for {}", name);
    let family = crate::families::Family {
        name: name.to_string(),
        alignment: (args[2] != "-").then(|| PathBuf::from(&args[2])),
        mapping: PathBuf::from(&args[1]),
        starting_gene_tree: (args[0] != "-").then(|| args[0].clone()),
        subst_model: args[4].clone(),
        stats_file: Some(PathBuf::from(&args[11])),
    };
    let species = io::newick::read_species_tree(Path::new(&args[3]))?;
    let model = crate::cli_enums::parse_rec_model(&args[5]);
    let rooted = args[6] == "1";
    let rates_values: Vec<f64> =
        args[7].split(':').filter_map(|v| v.parse().ok()).collect();
    let radius: usize = args[8].parse().unwrap_or(1);
    let strategy = match args[9].as_str() {
        "EVAL" => GeneSearchStrategy::Eval,
        _ => GeneSearchStrategy::Spr,
    };
    routines::optimize_gene_tree_job(
        &family,
        &species,
        model,
        rooted,
        &Parameters::of(&rates_values),
        radius,
        strategy,
        Path::new(&args[10]),
        Path::new(&args[11]),
        comm,
    )
}
