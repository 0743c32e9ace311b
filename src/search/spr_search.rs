//! Gene-tree SPR search.
//!
//! Candidates are pre-filtered on the reconciliation likelihood alone
//! against a damped running mean of recent improvements, and only the
//! survivors pay for a full joint rescore. Ranks evaluate disjoint slices
//! of the candidate set; the winning move is agreed on by max-reduction.

use crate::joint::JointTree;
use crate::parallel::Comm;
use crate::search::moves::SprMove;
use crate::trees::{GeneTree, HalfEdgeId, SpeciesTree};
use anyhow::Result;
use log::*;

const ACCEPT_MARGIN: f64 = 1e-9;

fn gather_regrafts_rec(
    gene: &GeneTree,
    prune: HalfEdgeId,
    regraft: HalfEdgeId,
    radius: usize,
    path: &mut Vec<HalfEdgeId>,
    moves: &mut Vec<SprMove>,
) {
    if !path.is_empty() {
        moves.push(SprMove::new(prune, regraft, path.clone()));
    }
    if path.len() < radius {
        if let Some((left, right)) = gene.children(regraft) {
            path.push(regraft);
            gather_regrafts_rec(gene, prune, left, radius, path, moves);
            gather_regrafts_rec(gene, prune, right, radius, path, moves);
            path.pop();
        }
    }
}

/// All valid moves pruning at internal half-edges and regrafting within
/// `radius` traversal steps.
pub fn enumerate_moves(gene: &GeneTree, radius: usize) -> Vec<SprMove> {
    let mut moves = Vec::new();
    for prune in gene.prune_candidates() {
        let pn = gene.next(prune).expect("prune handle is internal");
        let pnn = gene.next(pn).expect("internal node has a 3-cycle");
        let mut path = Vec::new();
        gather_regrafts_rec(gene, prune, gene.back(pn), radius, &mut path, &mut moves);
        gather_regrafts_rec(gene, prune, gene.back(pnn), radius, &mut path, &mut moves);
    }
    moves.retain(|mv| !gene.spr_yields_same_tree(mv.prune, mv.regraft));
    moves
}

/// Apply, score, and always roll the move back; `None` when the
/// reconciliation pre-filter rejected it.
#[allow(clippy::too_many_arguments)]
fn test_move(
    joint: &mut JointTree,
    species: &SpeciesTree,
    mv: &SprMove,
    initial_rec_ll: f64,
    average_diff: &mut f64,
    blo: bool,
) -> Result<Option<f64>> {
    joint.apply_move(mv)?;
    let rec_ll = joint.compute_reconciliation_ll(species)?;
    let improvement = rec_ll - initial_rec_ll;
    // Damped mean of recent improvements (alpha = 1/51).
    *average_diff = (*average_diff * 50.0 + improvement) / 51.0;
    if improvement < *average_diff {
        joint.rollback_last_move()?;
        return Ok(None);
    }
    if blo {
        joint.optimize_move(mv)?;
    }
    let new_ll = rec_ll + joint.compute_sequence_ll()?;
    joint.rollback_last_move()?;
    Ok(Some(new_ll))
}

fn find_best_move(
    joint: &mut JointTree,
    species: &SpeciesTree,
    moves: &[SprMove],
    best_ll: &mut f64,
    blo: bool,
    comm: &Comm,
) -> Result<Option<usize>> {
    let initial_rec_ll = joint.compute_reconciliation_ll(species)?;
    let mut average_diff = 0.0;
    let mut best_index: Option<usize> = None;
    let (begin, end) = comm.begin_end(moves.len());
    for (i, mv) in moves.iter().enumerate().take(end).skip(begin) {
        if let Some(ll) = test_move(joint, species, mv, initial_rec_ll, &mut average_diff, blo)? {
            if ll > *best_ll + ACCEPT_MARGIN {
                *best_ll = ll;
                best_index = Some(i);
            }
        }
    }
    let (global_best, owner) = comm.max_double(*best_ll);
    *best_ll = global_best;
    let mut index = best_index.unwrap_or(usize::MAX);
    comm.broadcast_usize(owner, &mut index);
    Ok(if index == usize::MAX { None } else { Some(index) })
}

/// One SPR round; applies the best improving move and reports whether one
/// was found.
pub fn apply_spr_round(
    joint: &mut JointTree,
    species: &SpeciesTree,
    radius: usize,
    best_ll: &mut f64,
    blo: bool,
    comm: &Comm,
) -> Result<bool> {
    let moves = enumerate_moves(joint.gene(), radius);
    debug!(
        "SPR round: hash={}, best ll={:.4}, radius={}, {} candidate moves",
        joint.unrooted_hash(),
        best_ll,
        radius,
        moves.len()
    );
    match find_best_move(joint, species, &moves, best_ll, blo, comm)? {
        Some(index) => {
            joint.apply_move(&moves[index])?;
            Ok(true)
        }
        None => Ok(false),
    }
}

/// Loop rounds at a fixed radius until no move is accepted.
pub fn spr_search(
    joint: &mut JointTree,
    species: &SpeciesTree,
    radius: usize,
    blo: bool,
    comm: &Comm,
) -> Result<f64> {
    let mut best_ll = joint.compute_joint_ll(species)?;
    while apply_spr_round(joint, species, radius, &mut best_ll, blo, comm)? {}
    Ok(best_ll)
}
