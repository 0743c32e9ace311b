use generax::model::RecModel;
use generax::optim::RecOpt;
use generax::parallel::Comm;
use generax::pipeline::{self, RunArgs};
use generax::routines::GeneSearchStrategy;
use generax::search::species_opt::SpeciesSearchStrategy;
use std::fs;
use std::path::{Path, PathBuf};

fn write(path: &Path, content: &str) {
    fs::write(path, content).expect("fixture file writes");
}

fn setup_dataset(dir: &Path) -> PathBuf {
    fs::create_dir_all(dir).expect("dataset dir");
    write(&dir.join("species.newick"), "((a,b)x,(c,d)y)r;\n");
    write(
        &dir.join("family_1.map"),
        "g1_a a\ng1_b b\ng1_c c\ng1_d d\n",
    );
    write(&dir.join("family_1.newick"), "((g1_a,g1_b),(g1_c,g1_d));\n");
    write(
        &dir.join("family_2.map"),
        "g2_a a\ng2_b b\ng2_c c\ng2_d d\n",
    );
    write(&dir.join("family_2.newick"), "((g2_a,g2_c),(g2_b,g2_d));\n");
    let descriptor = dir.join("families.txt");
    write(
        &descriptor,
        &format!(
            "[FAMILIES]\n\
             - family_1\n\
             mapping = {}\n\
             starting_gene_tree = {}\n\
             - family_2\n\
             mapping = {}\n\
             starting_gene_tree = {}\n",
            dir.join("family_1.map").display(),
            dir.join("family_1.newick").display(),
            dir.join("family_2.map").display(),
            dir.join("family_2.newick").display(),
        ),
    );
    descriptor
}

fn run_once(dataset: &Path, descriptor: &Path, prefix: &Path) {
    let args = RunArgs {
        families: descriptor.to_path_buf(),
        species_tree: dataset.join("species.newick").display().to_string(),
        rec_model: RecModel::UndatedDTL,
        rec_opt: RecOpt::Simplex,
        prefix: prefix.to_path_buf(),
        seed: 42,
        strategy: GeneSearchStrategy::Spr,
        species_strategy: SpeciesSearchStrategy::Spr,
        rooted_gene_tree: true,
        per_species_rates: false,
        user_rates: false,
        dup_rate: 0.1,
        loss_rate: 0.1,
        transfer_rate: 0.1,
        fast_radius: 0,
        slow_radius: 0,
        final_gene_radius: 1,
        reconcile: true,
        reconciliation_samples: 2,
        optimize_species_tree: false,
        build_super_matrix: false,
        allow_split: false,
    };
    pipeline::run(args, Comm::serial()).expect("pipeline run succeeds");
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_else(|_| panic!("missing output {}", path.display()))
}

// Two runs with the same seed and inputs produce byte-identical outputs.
#[test]
fn same_seed_same_outputs() {
    let base = std::env::temp_dir().join(format!("generax_determinism_{}", std::process::id()));
    let dataset = base.join("dataset");
    let descriptor = setup_dataset(&dataset);
    let first = base.join("run_1");
    let second = base.join("run_2");
    run_once(&dataset, &descriptor, &first);
    run_once(&dataset, &descriptor, &second);

    for relative in [
        "stats.txt",
        "inferred_species_tree.newick",
        "starting_species_tree.newick",
        "results/family_1/geneTree.newick",
        "results/family_1/stats.txt",
        "results/family_2/geneTree.newick",
        "results/family_2/stats.txt",
        "reconciliations/family_1_samples.nhx",
        "reconciliations/family_2_samples.nhx",
        "reconciliations/family_1_reconciliated.nhx",
        "reconciliations/family_1_eventCounts.txt",
        "reconciliations/family_1_transfers.txt",
    ] {
        assert_eq!(
            read(&first.join(relative)),
            read(&second.join(relative)),
            "output {} differs between identically seeded runs",
            relative
        );
    }

    // The per-family statistics feed the final joint likelihood.
    let stats = read(&first.join("stats.txt"));
    assert!(stats.starts_with("JointLL: "));
    assert!(stats.contains("LibpllLL: "));
    assert!(stats.contains("RecLL: "));

    let xml = read(&first.join("reconciliations/family_1_reconciliated.xml"));
    assert!(xml.contains("<recPhylo "));
    assert!(xml.contains("<spTree>"));
    assert!(xml.contains("<recGeneTree>"));
    assert!(xml.contains("speciesLocation"));

    fs::remove_dir_all(&base).ok();
}
