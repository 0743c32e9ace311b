use anyhow::Result;
use clap::Parser;
use generax::cli_enums;
use generax::parallel::Comm;
use generax::pipeline::{self, RunArgs};
use log::*;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(name = "generax", version, about = "Joint species and gene tree inference under DTL")]
struct Cli {
    /// Families descriptor file.
    #[clap(short, long)]
    families: PathBuf,

    /// Starting species tree: a newick file, `random`, `NJ` or `NJst`.
    #[clap(short, long, default_value = "random")]
    species_tree: String,

    /// Reconciliation model: UndatedDL, UndatedDTL or UndatedIDTL.
    #[clap(short, long, default_value = "UndatedDTL")]
    rec_model: String,

    /// Rate optimization method: grid, simplex or gradient.
    #[clap(long, default_value = "grid")]
    rec_opt: String,

    /// Output directory.
    #[clap(short, long)]
    prefix: PathBuf,

    /// Random seed.
    #[clap(long, default_value_t = 42)]
    seed: u64,

    /// Gene tree search strategy: SPR or EVAL.
    #[clap(long, default_value = "SPR")]
    strategy: String,

    /// Species tree search strategy: SPR, TRANSFERS or HYBRID.
    #[clap(long, default_value = "SPR")]
    species_strategy: String,

    /// Disable the rooted gene tree mode.
    #[clap(long)]
    unrooted_gene_tree: bool,

    /// Optimize one rate set per species branch.
    #[clap(long)]
    per_species_rates: bool,

    /// Starting duplication rate; setting any rate switches to user rates.
    #[clap(long = "dupRate")]
    dup_rate: Option<f64>,

    /// Starting loss rate.
    #[clap(long = "lossRate")]
    loss_rate: Option<f64>,

    /// Starting transfer rate.
    #[clap(long = "transferRate")]
    transfer_rate: Option<f64>,

    /// Species SPR radius of the fast (fixed gene trees) search.
    #[clap(long, default_value_t = 0)]
    fast_radius: usize,

    /// Species SPR radius of the slow (joint) search.
    #[clap(long, default_value_t = 0)]
    slow_radius: usize,

    /// Largest gene SPR radius of the joint search schedule.
    #[clap(long, default_value_t = 5)]
    final_gene_radius: usize,

    /// Infer and save the ML reconciliations.
    #[clap(long)]
    reconcile: bool,

    /// Number of stochastic reconciliation samples to emit.
    #[clap(long, default_value_t = 0)]
    reconciliation_samples: usize,

    /// Search the species tree topology as well.
    #[clap(long)]
    optimize_species_tree: bool,

    /// Concatenate one-per-species orthogroups into a super-matrix.
    #[clap(long)]
    build_super_matrix: bool,

    /// Allow the scheduler to fan families out as worker processes.
    #[clap(long)]
    split_implementation: bool,

    #[clap(short, long)]
    verbose: bool,
}

#[derive(Parser, Debug)]
struct WorkerCli {
    #[clap(long)]
    command_file: PathBuf,
    #[clap(long)]
    name: String,
}

fn init_logging(verbose: bool) {
    stderrlog::new()
        .timestamp(stderrlog::Timestamp::Off)
        .verbosity(if verbose { 4 } else { 3 })
        .show_level(false)
        .init()
        .unwrap();
}

fn main() {
    let mut argv: Vec<String> = std::env::args().collect();
    if argv.get(1).map(|a| a == "family-worker").unwrap_or(false) {
        argv.remove(1);
        let worker = match WorkerCli::try_parse_from(&argv) {
            Ok(worker) => worker,
            Err(error) => {
                eprintln!("{}", error);
                std::process::exit(1);
            }
        };
        init_logging(false);
        let comm = Comm::serial();
        if let Err(error) = pipeline::run_family_worker(&worker.command_file, &worker.name, &comm) {
            error!("family worker failed: {:#}", error);
            std::process::exit(20);
        }
        return;
    }

    let cli = match Cli::try_parse_from(&argv) {
        Ok(cli) => cli,
        Err(error) => {
            // Argument errors (unknown flags included) all exit with 1.
            let _ = error.print();
            std::process::exit(if error.use_stderr() { 1 } else { 0 });
        }
    };
    init_logging(cli.verbose);
    if let Err(error) = run(cli) {
        error!("{:#}", error);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let user_rates =
        cli.dup_rate.is_some() || cli.loss_rate.is_some() || cli.transfer_rate.is_some();
    let args = RunArgs {
        families: cli.families,
        species_tree: cli.species_tree,
        rec_model: cli_enums::parse_rec_model(&cli.rec_model),
        rec_opt: cli_enums::parse_rec_opt(&cli.rec_opt),
        prefix: cli.prefix,
        seed: cli.seed,
        strategy: cli_enums::parse_strategy(&cli.strategy),
        species_strategy: cli_enums::parse_species_strategy(&cli.species_strategy),
        rooted_gene_tree: !cli.unrooted_gene_tree,
        per_species_rates: cli.per_species_rates,
        user_rates,
        dup_rate: cli.dup_rate.unwrap_or(0.1),
        loss_rate: cli.loss_rate.unwrap_or(0.1),
        transfer_rate: cli.transfer_rate.unwrap_or(0.1),
        fast_radius: cli.fast_radius,
        slow_radius: cli.slow_radius,
        final_gene_radius: cli.final_gene_radius,
        reconcile: cli.reconcile,
        reconciliation_samples: cli.reconciliation_samples,
        optimize_species_tree: cli.optimize_species_tree,
        build_super_matrix: cli.build_super_matrix,
        allow_split: cli.split_implementation,
    };
    let comm = Comm::serial().with_split(args.allow_split);
    pipeline::run(args, comm)
}
