use generax::io::newick;
use generax::joint::JointTree;
use generax::mapping::GeneSpeciesMapping;
use generax::model::{RatesVector, RecModel};
use generax::search::spr_search::enumerate_moves;
use generax::seqlik::SequenceEvaluator;

fn approx_eq(a: f64, b: f64, eps: f64) {
    assert!(
        (a - b).abs() <= eps,
        "expected {a} ~= {b} within eps={eps}, got diff={}",
        (a - b).abs()
    );
}

fn build_joint() -> (JointTree, generax::trees::SpeciesTree) {
    let species = newick::species_tree_from_string("((a,b)x,(c,d)y)r;").expect("species parses");
    let gene = newick::gene_tree_from_string("((a,b),(c,d));").expect("gene parses");
    let mapping =
        GeneSpeciesMapping::from_pairs([("a", "a"), ("b", "b"), ("c", "c"), ("d", "d")])
            .expect("mapping builds");
    let mut joint = JointTree::new(
        "family",
        gene,
        mapping,
        &species,
        RecModel::UndatedDL,
        false,
        SequenceEvaluator::null("family"),
    )
    .expect("joint tree builds");
    let rates = RatesVector::global(RecModel::UndatedDL, &[0.1, 0.1], species.node_count());
    joint.set_rates(&species, &rates).expect("rates are accepted");
    (joint, species)
}

// Apply then roll back: same structural hash, same likelihood.
#[test]
fn spr_rollback_restores_tree_and_likelihood() {
    let (mut joint, species) = build_joint();
    let hash_before = joint.unrooted_hash();
    let ll_before = joint.compute_reconciliation_ll(&species).expect("evaluation succeeds");

    let moves = enumerate_moves(joint.gene(), 3);
    assert!(!moves.is_empty(), "a 4-leaf tree has SPR moves at radius 3");
    let mut tested = 0;
    for mv in &moves {
        joint.apply_move(mv).expect("move applies");
        let changed = joint.unrooted_hash();
        joint.rollback_last_move().expect("rollback succeeds");
        assert_eq!(joint.unrooted_hash(), hash_before, "rollback must restore the topology");
        let ll_after = joint.compute_reconciliation_ll(&species).expect("evaluation succeeds");
        approx_eq(ll_before, ll_after, 1e-9);
        if changed != hash_before {
            tested += 1;
        }
    }
    assert!(tested > 0, "at least one move must change the topology");
}

// A quartet swap reached by SPR scores differently and is fully reverted.
#[test]
fn quartet_swap_and_revert() {
    let (mut joint, species) = build_joint();
    let hash_before = joint.unrooted_hash();
    let ll_before = joint.compute_reconciliation_ll(&species).expect("evaluation succeeds");

    let moves = enumerate_moves(joint.gene(), 3);
    let mut seen_other_quartet = false;
    for mv in &moves {
        joint.apply_move(mv).expect("move applies");
        if joint.unrooted_hash() != hash_before {
            seen_other_quartet = true;
            let ll_moved = joint.compute_reconciliation_ll(&species).expect("evaluation succeeds");
            // The congruent quartet is the best one.
            assert!(ll_moved < ll_before + 1e-9);
        }
        joint.rollback_last_move().expect("rollback succeeds");
    }
    assert!(seen_other_quartet);
    approx_eq(
        joint.compute_reconciliation_ll(&species).expect("evaluation succeeds"),
        ll_before,
        1e-9,
    );
}

// Moves are consumed in LIFO order.
#[test]
fn nested_moves_roll_back_in_order() {
    let (mut joint, _species) = build_joint();
    let hash_before = joint.unrooted_hash();
    let moves = enumerate_moves(joint.gene(), 2);
    joint.apply_move(&moves[0]).expect("first move applies");
    let nested = enumerate_moves(joint.gene(), 2);
    joint.apply_move(&nested[0]).expect("second move applies");
    joint.rollback_last_move().expect("inner rollback succeeds");
    joint.rollback_last_move().expect("outer rollback succeeds");
    assert_eq!(joint.unrooted_hash(), hash_before);
}

#[test]
fn species_spr_and_root_moves_roll_back() {
    let mut species =
        newick::species_tree_from_string("(((a,b)x,(c,d)y)z,(e,f)w)r;").expect("species parses");
    let hash_before = species.hash();

    let prunes = species.possible_prunes();
    assert!(!prunes.is_empty());
    let prune = prunes[0];
    let regrafts = species.possible_regrafts(prune, 3);
    assert!(!regrafts.is_empty());
    let (rollback, affected) = species.apply_spr(prune, regrafts[0]);
    assert!(!affected.is_empty());
    species.rollback(rollback);
    assert_eq!(species.hash(), hash_before);

    for direction in 0..4 {
        if species.can_change_root(direction) {
            let rollback = species.change_root(direction);
            assert_ne!(species.hash(), hash_before, "re-rooting changes the rooted hash");
            species.rollback(rollback);
            assert_eq!(species.hash(), hash_before);
        }
    }
}
