use generax::io::newick;
use generax::mapping::GeneSpeciesMapping;
use generax::model::scenario::EventKind;
use generax::model::{RatesVector, RecModel, ReconciliationEvaluation};
use generax::rng;

fn approx_eq(a: f64, b: f64, eps: f64) {
    assert!(
        (a - b).abs() <= eps,
        "expected {a} ~= {b} within eps={eps}, got diff={}",
        (a - b).abs()
    );
}

fn four_species() -> generax::trees::SpeciesTree {
    newick::species_tree_from_string("((a,b)x,(c,d)y)r;").expect("species tree parses")
}

fn dtl_engine(
    gene_newick: &str,
    transfer_rate: f64,
) -> (ReconciliationEvaluation, generax::trees::GeneTree, generax::trees::SpeciesTree) {
    let species = four_species();
    let gene = newick::gene_tree_from_string(gene_newick).expect("gene tree parses");
    let mapping =
        GeneSpeciesMapping::from_pairs([("a", "a"), ("b", "b"), ("c", "c"), ("d", "d")])
            .expect("mapping builds");
    let mut eval = ReconciliationEvaluation::new(RecModel::UndatedDTL, false);
    eval.bind_gene_tree(&gene, &mapping, &species).expect("binding succeeds");
    eval.set_rates(
        &species,
        &RatesVector::global(
            RecModel::UndatedDTL,
            &[0.1, 0.1, transfer_rate],
            species.node_count(),
        ),
    )
    .expect("rates are accepted");
    (eval, gene, species)
}

// A two-leaf family spanning the two sides of the species root: with a
// substantial transfer rate the ML scenario uses a transfer between
// non-ancestor species, and forbidding transfers leaves only the
// double-loss explanation.
#[test]
fn transfer_recovery() {
    let (mut with_t, gene, species) = dtl_engine("(a,c);", 0.3);
    let ll_with_t = with_t.evaluate(&gene, &species, false).expect("evaluation succeeds");
    let scenario = with_t.infer_ml_scenario(&gene, &species, false).expect("backtrace succeeds");
    let transfers = scenario.count(EventKind::T) + scenario.count(EventKind::Tl);
    assert!(transfers >= 1, "expected at least one transfer event");
    for event in scenario.events() {
        if event.is_transfer() {
            let dest = event.dest_species.expect("transfer carries a recipient");
            assert!(
                !species.ancestors(event.species).contains(&dest),
                "transfers must never point at an ancestor"
            );
        }
    }

    let (mut without_t, gene, species) = dtl_engine("(a,c);", 0.0);
    let ll_without_t = without_t.evaluate(&gene, &species, false).expect("evaluation succeeds");
    assert!(ll_without_t.is_finite());
    assert!(
        ll_with_t > ll_without_t,
        "transfers must explain the family better: {ll_with_t} vs {ll_without_t}"
    );
}

// Re-orientations of the same unrooted topology score identically when the
// gene tree is unrooted.
#[test]
fn rooting_invariance() {
    let orientations = ["((a,b),(c,d));", "(a,(b,(c,d)));", "(((a,b),c),d);"];
    let mut values = Vec::new();
    for newick_string in orientations {
        let (mut eval, gene, species) = dtl_engine(newick_string, 0.1);
        values.push(eval.evaluate(&gene, &species, false).expect("evaluation succeeds"));
    }
    approx_eq(values[0], values[1], 1e-9);
    approx_eq(values[0], values[2], 1e-9);
}

#[test]
fn stochastic_backtrace_is_consistent() {
    rng::init(42);
    let (mut eval, gene, species) = dtl_engine("((a,b),(c,d));", 0.2);
    eval.evaluate(&gene, &species, false).expect("evaluation succeeds");
    for _ in 0..20 {
        let scenario =
            eval.infer_ml_scenario(&gene, &species, true).expect("sampling succeeds");
        assert_eq!(scenario.count(EventKind::Invalid), 0);
        assert_eq!(scenario.count(EventKind::Leaf), 4);
        for event in scenario.events() {
            if event.is_transfer() {
                let dest = event.dest_species.expect("transfer carries a recipient");
                assert!(!species.ancestors(event.species).contains(&dest));
            }
        }
    }
}

// The fast path must agree with the exact path when nothing changed.
#[test]
fn fast_mode_matches_exact_without_changes() {
    use generax::model::PartialMode;
    let (mut eval, gene, species) = dtl_engine("((a,b),(c,d));", 0.1);
    eval.set_partial_mode(PartialMode::PartialSpecies);
    let exact = eval.evaluate(&gene, &species, false).expect("exact evaluation succeeds");
    // Touch every species node so the fast path rescores all of them.
    let all: identity_hash::IntSet<usize> = (0..species.node_count()).collect();
    eval.on_species_tree_change(&species, Some(&all)).expect("broadcast succeeds");
    let fast = eval.evaluate(&gene, &species, true).expect("fast evaluation succeeds");
    approx_eq(exact, fast, 0.1);
}
