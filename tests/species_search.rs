use generax::io::newick;
use generax::joint::JointTree;
use generax::mapping::GeneSpeciesMapping;
use generax::maths::Parameters;
use generax::model::RecModel;
use generax::optim::RecOpt;
use generax::parallel::Comm;
use generax::rng;
use generax::search::species_opt::SpeciesTreeOptimizer;
use generax::seqlik::SequenceEvaluator;
use generax::trees::SpeciesTree;

fn identity_mapping() -> GeneSpeciesMapping {
    GeneSpeciesMapping::from_pairs([("a", "a"), ("b", "b"), ("c", "c"), ("d", "d")])
        .expect("mapping builds")
}

fn congruent_families(species: &SpeciesTree, count: usize, model: RecModel) -> Vec<JointTree> {
    (0..count)
        .map(|i| {
            let gene =
                newick::gene_tree_from_string("((a,b),(c,d));").expect("gene tree parses");
            JointTree::new(
                &format!("family_{}", i),
                gene,
                identity_mapping(),
                species,
                model,
                true,
                SequenceEvaluator::null("family"),
            )
            .expect("joint tree builds")
        })
        .collect()
}

fn make_optimizer(
    start_newick: &str,
    model: RecModel,
    rates: &[f64],
    out: &std::path::Path,
) -> SpeciesTreeOptimizer {
    let species = newick::species_tree_from_string(start_newick).expect("species parses");
    let joints = congruent_families(&species, 10, model);
    SpeciesTreeOptimizer::new(
        species,
        joints,
        model,
        Parameters::of(rates),
        true,
        RecOpt::Simplex,
        out,
        Comm::serial(),
    )
    .expect("optimizer builds")
}

// Ten congruent families pull the species tree from the wrong quartet to
// the true one.
#[test]
fn spr_search_recovers_true_quartet() {
    rng::init(42);
    let out = std::env::temp_dir().join(format!("generax_spr_{}", std::process::id()));
    std::fs::create_dir_all(&out).expect("temp dir");
    let truth = newick::species_tree_from_string("((a,b)x,(c,d)y)r;").expect("truth parses");
    let mut optimizer =
        make_optimizer("((a,c)x,(b,d)y)r;", RecModel::UndatedDL, &[0.1, 0.1], &out);

    let before = optimizer.reconciliation_likelihood().expect("initial likelihood");
    let after = optimizer.spr_search(3, false).expect("SPR search succeeds");
    assert!(after > before, "the search must improve the likelihood");
    assert_eq!(
        optimizer.species_tree().hash() % 100000,
        truth.hash() % 100000,
        "the search must recover the true quartet"
    );
    std::fs::remove_dir_all(&out).ok();
}

#[test]
fn root_search_visits_all_roots() {
    rng::init(42);
    let out = std::env::temp_dir().join(format!("generax_root_{}", std::process::id()));
    std::fs::create_dir_all(&out).expect("temp dir");
    let mut optimizer =
        make_optimizer("((a,b)x,(c,d)y)r;", RecModel::UndatedDL, &[0.1, 0.1], &out);
    let before = optimizer.reconciliation_likelihood().expect("initial likelihood");
    let after = optimizer.root_exhaustive_search().expect("root search succeeds");
    assert!(after + 1e-9 >= before, "re-rooting never loses likelihood");
    std::fs::remove_dir_all(&out).ok();
}

#[test]
fn transfer_guided_search_runs_to_completion() {
    rng::init(42);
    let out = std::env::temp_dir().join(format!("generax_transfers_{}", std::process::id()));
    std::fs::create_dir_all(&out).expect("temp dir");
    let mut optimizer =
        make_optimizer("((a,c)x,(b,d)y)r;", RecModel::UndatedDTL, &[0.1, 0.1, 0.2], &out);
    let before = optimizer.reconciliation_likelihood().expect("initial likelihood");
    let after = optimizer.transfer_search().expect("transfer search succeeds");
    assert!(after + 1e-9 >= before, "transfer-guided moves never lose likelihood");
    assert!(out.join("transfers.txt").exists(), "transfer frequencies are materialised");
    std::fs::remove_dir_all(&out).ok();
}
