use generax::io::newick;
use generax::mapping::GeneSpeciesMapping;
use generax::model::scenario::EventKind;
use generax::model::{RatesVector, RecModel, ReconciliationEvaluation};

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

fn identity_mapping() -> GeneSpeciesMapping {
    GeneSpeciesMapping::from_pairs([("a", "a"), ("b", "b"), ("c", "c"), ("d", "d")])
        .expect("mapping builds")
}

fn bound_engine(
    model: RecModel,
    gene_newick: &str,
    mapping: &GeneSpeciesMapping,
    rates: &[f64],
) -> (ReconciliationEvaluation, generax::trees::GeneTree, generax::trees::SpeciesTree) {
    let species = four_species();
    let gene = newick::gene_tree_from_string(gene_newick).expect("gene tree parses");
    let mut eval = ReconciliationEvaluation::new(model, false);
    eval.bind_gene_tree(&gene, mapping, &species).expect("binding succeeds");
    eval.set_rates(&species, &RatesVector::global(model, rates, species.node_count()))
        .expect("rates are accepted");
    (eval, gene, species)
}

#[test]
fn operations_fail_before_binding() {
    let species = four_species();
    let mut eval = ReconciliationEvaluation::new(RecModel::UndatedDL, false);
    let err = eval
        .set_rates(&species, &RatesVector::global(RecModel::UndatedDL, &[0.1, 0.1], 7))
        .expect_err("unbound engine must refuse setRates");
    assert!(err.to_string().contains("no gene tree bound"));
}

#[test]
fn rates_kind_mismatch_is_rejected() {
    let mapping = identity_mapping();
    let (mut eval, _gene, species) =
        bound_engine(RecModel::UndatedDL, "((a,b),(c,d));", &mapping, &[0.1, 0.1]);
    let err = eval
        .set_rates(&species, &RatesVector::global(RecModel::UndatedDTL, &[0.1, 0.1, 0.1], 7))
        .expect_err("kind mismatch must be rejected");
    assert!(err.to_string().contains("UndatedDTL"));
}

#[test]
fn dtl_normalisation_sums_to_one() {
    let mapping = identity_mapping();
    let (eval, _gene, species) =
        bound_engine(RecModel::UndatedDTL, "((a,b),(c,d));", &mapping, &[0.3, 0.2, 0.1]);
    let rows = eval.normalized_rates();
    for e in 0..species.node_count() {
        let sum: f64 = rows.iter().map(|row| row[e]).sum();
        approx_eq(sum, 1.0, 1e-12);
    }
}

// The per-species sum under IDTL folds the children's Pi into the parent's
// normalisation; this pins the formula as implemented.
#[test]
fn idtl_normalisation_includes_children_ils() {
    let mapping = identity_mapping();
    let (eval, _gene, species) = bound_engine(
        RecModel::UndatedIDTL,
        "((a,b),(c,d));",
        &mapping,
        &[0.2, 0.2, 0.1, 0.3],
    );
    let rows = eval.normalized_rates();
    let [pd, pl, pt, pi, ps] = match &rows[..] {
        [pd, pl, pt, pi, ps] => [pd, pl, pt, pi, ps],
        _ => panic!("IDTL exposes five rows"),
    };
    for e in 0..species.node_count() {
        let mut sum = pd[e] + pl[e] + pt[e] + ps[e];
        if let Some((f, g)) = species.children(e) {
            sum += pi[f] + pi[g];
        }
        approx_eq(sum, 1.0, 1e-12);
        if species.is_leaf(e) || species.parent(e).is_none() {
            approx_eq(pi[e], 0.0, 1e-12);
        }
    }
}

#[test]
fn extinction_probabilities_stay_probabilities() {
    let mapping = identity_mapping();
    for model in [RecModel::UndatedDL, RecModel::UndatedDTL, RecModel::UndatedIDTL] {
        let rates: Vec<f64> = (0..model.free_parameters()).map(|_| 0.2).collect();
        let (mut eval, gene, species) = bound_engine(model, "((a,b),(c,d));", &mapping, &rates);
        eval.evaluate(&gene, &species, false).expect("evaluation succeeds");
        for ue in eval.extinction_probabilities() {
            assert!((0.0..=1.0 + 1e-6).contains(&ue), "uE out of range: {ue}");
        }
    }
}

// A single DL family whose gene tree matches the species tree: three
// speciations, no duplication, no loss.
#[test]
fn congruent_dl_family() {
    let mapping = identity_mapping();
    let (mut eval, gene, species) =
        bound_engine(RecModel::UndatedDL, "((a,b),(c,d));", &mapping, &[0.1, 0.1]);
    let ll = eval.evaluate(&gene, &species, false).expect("evaluation succeeds");
    assert!(ll.is_finite());
    assert!(ll < 0.0);

    // Symmetric cherries see symmetric extinction.
    let ue = eval.extinction_probabilities();
    let x = species.node_id("x").unwrap();
    let y = species.node_id("y").unwrap();
    approx_eq(ue[x], ue[y], 1e-12);

    let scenario = eval.infer_ml_scenario(&gene, &species, false).expect("backtrace succeeds");
    assert_eq!(scenario.count(EventKind::S), 3);
    assert_eq!(scenario.count(EventKind::D), 0);
    assert_eq!(scenario.count(EventKind::Sl), 0);
    assert_eq!(scenario.count(EventKind::Leaf), 4);
}

// With tiny rates the marginal is dominated by the congruent scenario:
// seven speciation-probability factors against the rooting normaliser.
#[test]
fn congruent_dl_family_likelihood_value() {
    let mapping = identity_mapping();
    let (mut eval, gene, species) =
        bound_engine(RecModel::UndatedDL, "((a,b),(c,d));", &mapping, &[1e-4, 1e-4]);
    let ll = eval.evaluate(&gene, &species, false).expect("evaluation succeeds");
    let ps = (1.0f64 + 2e-4).recip();
    let factor: f64 = eval.extinction_probabilities().iter().map(|ue| 1.0 - ue).sum();
    let expected = 7.0 * ps.ln() - factor.ln();
    approx_eq(ll, expected, 1e-2);
}

// Two genes per species force at least one duplication; without the
// duplication rate the family has no explanation at all.
#[test]
fn forced_duplication() {
    let mapping = GeneSpeciesMapping::from_pairs([
        ("a1", "a"),
        ("a2", "a"),
        ("b1", "b"),
        ("b2", "b"),
    ])
    .expect("mapping builds");
    let (mut eval, gene, species) =
        bound_engine(RecModel::UndatedDL, "((a1,a2),(b1,b2));", &mapping, &[0.1, 0.1]);
    eval.evaluate(&gene, &species, false).expect("evaluation succeeds");
    let scenario = eval.infer_ml_scenario(&gene, &species, false).expect("backtrace succeeds");
    assert!(scenario.count(EventKind::D) >= 1);
    let a = species.leaf_id("a").unwrap();
    let b = species.leaf_id("b").unwrap();
    assert!(scenario
        .events()
        .iter()
        .any(|e| e.kind == EventKind::D && (e.species == a || e.species == b)));

    let (mut dead, gene, species) =
        bound_engine(RecModel::UndatedDL, "((a1,a2),(b1,b2));", &mapping, &[0.0, 0.1]);
    let ll = dead.evaluate(&gene, &species, false).expect("evaluation still runs");
    assert!(ll <= -1e300, "without duplications the likelihood must floor, got {ll}");
}

#[test]
fn evaluate_is_cached_until_invalidation() {
    let mapping = identity_mapping();
    let (mut eval, gene, species) =
        bound_engine(RecModel::UndatedDTL, "((a,b),(c,d));", &mapping, &[0.1, 0.1, 0.05]);
    let first = eval.evaluate(&gene, &species, false).expect("evaluation succeeds");
    let second = eval.evaluate(&gene, &species, false).expect("cached evaluation succeeds");
    assert_eq!(first, second);
}
