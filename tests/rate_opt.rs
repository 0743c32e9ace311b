use generax::io::newick;
use generax::joint::JointTree;
use generax::mapping::GeneSpeciesMapping;
use generax::maths::Parameters;
use generax::model::{rates_vector_from, RecModel};
use generax::optim::{optimize_parameters_global, RecOpt};
use generax::seqlik::SequenceEvaluator;

fn build_family_set() -> (Vec<JointTree>, generax::trees::SpeciesTree) {
    let species =
        newick::species_tree_from_string("(((a,b)x,(c,d)y)z,e)w;").expect("species parses");
    let mapping = GeneSpeciesMapping::from_pairs([
        ("a", "a"),
        ("b", "b"),
        ("c", "c"),
        ("d", "d"),
        ("e", "e"),
    ])
    .expect("mapping builds");
    let topologies = [
        "(((a,b),(c,d)),e);",
        "(((a,b),(c,d)),e);",
        "(((a,b),c),(d,e));",
        "((a,b),((c,d),e));",
        "(((a,b),(c,d)),e);",
    ];
    let joints = topologies
        .iter()
        .enumerate()
        .map(|(i, newick_string)| {
            let gene = newick::gene_tree_from_string(newick_string).expect("gene parses");
            JointTree::new(
                &format!("family_{}", i),
                gene,
                mapping.clone(),
                &species,
                RecModel::UndatedDL,
                false,
                SequenceEvaluator::null("family"),
            )
            .expect("joint tree builds")
        })
        .collect();
    (joints, species)
}

// Grid, simplex and gradient settle on the same optimum of the summed
// reconciliation likelihood.
#[test]
fn optimizers_agree_on_synthetic_families() {
    let (mut joints, species) = build_family_set();
    let species_count = species.node_count();
    let mut objective = |params: &Parameters| -> anyhow::Result<f64> {
        let rates = rates_vector_from(RecModel::UndatedDL, params, species_count);
        let mut total = 0.0;
        for joint in joints.iter_mut() {
            joint.set_rates(&species, &rates)?;
            total += joint.compute_reconciliation_ll(&species)?;
        }
        Ok(total)
    };

    let start = Parameters::of(&[0.3, 0.3]);
    let grid = optimize_parameters_global(&mut objective, &start, RecOpt::Grid)
        .expect("grid optimization succeeds");
    let simplex = optimize_parameters_global(&mut objective, &start, RecOpt::Simplex)
        .expect("simplex optimization succeeds");
    let gradient = optimize_parameters_global(&mut objective, &start, RecOpt::Gradient)
        .expect("gradient optimization succeeds");

    for (left, right) in [(&grid, &simplex), (&grid, &gradient), (&simplex, &gradient)] {
        assert!(
            (left.score() - right.score()).abs() <= 1e-3,
            "optimizers disagree: {} vs {}",
            left,
            right
        );
        for d in 0..left.dimensions() {
            assert!(
                (left[d] - right[d]).abs() <= 1e-2,
                "argmax coordinates diverged: {} vs {}",
                left,
                right
            );
        }
    }
    assert!(grid.score() >= objective(&start).expect("objective evaluates"));
}

// Per-species optimisation starts from the global optimum and can only
// improve the summed likelihood.
#[test]
fn per_species_rates_improve_on_global() {
    let (mut joints, species) = build_family_set();
    let species_count = species.node_count();
    let mut objective = |params: &Parameters| -> anyhow::Result<f64> {
        let rates = rates_vector_from(RecModel::UndatedDL, params, species_count);
        let mut total = 0.0;
        for joint in joints.iter_mut() {
            joint.set_rates(&species, &rates)?;
            total += joint.compute_reconciliation_ll(&species)?;
        }
        Ok(total)
    };
    let start = Parameters::of(&[0.3, 0.3]);
    let global = optimize_parameters_global(&mut objective, &start, RecOpt::Simplex)
        .expect("global optimization succeeds");
    let per_species = generax::optim::optimize_parameters_per_species(
        &mut objective,
        &global,
        species_count,
        2,
        None,
    )
    .expect("per-species optimization succeeds");
    assert_eq!(per_species.dimensions(), species_count * 2);
    assert!(per_species.score() + 1e-6 >= global.score());
}
