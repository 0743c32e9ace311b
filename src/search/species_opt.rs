//! Species-tree optimiser.
//!
//! Three move kinds over a shared set of per-family reconciliation engines:
//! exhaustive re-rooting, radius-bounded SPR (fast pre-filter on the
//! approximate likelihood, exact confirmation, optional top-K rescoring
//! with proposal gene trees), and transfer-guided SPR driven by sampled
//! reconciliations. Every mutation of the species tree is broadcast to the
//! engines; every rejection restores both the tree and the engine
//! snapshots.

use crate::joint::JointTree;
use crate::maths::Parameters;
use crate::model::{PartialMode, RatesVector, RecModel};
use crate::optim::{self, RecOpt};
use crate::parallel::Comm;
use crate::rng;
use crate::search::spr_search;
use crate::seqlik::SequenceEvaluator;
use crate::trees::{SpeciesNodeId, SpeciesTree};
use crate::{io, rates_vector_from};
use anyhow::Result;
use identity_hash::IntSet;
use itertools::Itertools;
use log::*;
use ordered_float::OrderedFloat;
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

const SLOW_RESCORE_MOVES: usize = 20;
const TRANSFER_EARLY_STOP: usize = 50;
const TRANSFER_SAMPLES: usize = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpeciesSearchStrategy {
    Spr,
    Transfers,
    Hybrid,
}

struct EvaluatedMove {
    prune: SpeciesNodeId,
    regraft: SpeciesNodeId,
    ll: f64,
}

pub struct SpeciesTreeOptimizer {
    species: SpeciesTree,
    joints: Vec<JointTree>,
    model: RecModel,
    rates: Parameters,
    user_rates: bool,
    rec_opt: RecOpt,
    output_dir: PathBuf,
    comm: Comm,
}

impl SpeciesTreeOptimizer {
    pub fn new(
        species: SpeciesTree,
        mut joints: Vec<JointTree>,
        model: RecModel,
        starting_rates: Parameters,
        user_rates: bool,
        rec_opt: RecOpt,
        output_dir: &Path,
        comm: Comm,
    ) -> Result<Self> {
        for joint in joints.iter_mut() {
            joint.set_partial_mode(PartialMode::PartialSpecies);
        }
        let mut optimizer = SpeciesTreeOptimizer {
            species,
            joints,
            model,
            rates: starting_rates,
            user_rates,
            rec_opt,
            output_dir: output_dir.to_path_buf(),
            comm,
        };
        optimizer.apply_rates()?;
        io::newick::save_species_tree(
            &optimizer.species,
            &optimizer.output_dir.join("starting_species_tree.newick"),
        )?;
        Ok(optimizer)
    }

    pub fn species_tree(&self) -> &SpeciesTree {
        &self.species
    }

    pub fn into_species_tree(self) -> SpeciesTree {
        self.species
    }

    pub fn rates(&self) -> &Parameters {
        &self.rates
    }

    fn apply_rates(&mut self) -> Result<()> {
        let rates = rates_vector_from(self.model, &self.rates, self.species.node_count());
        for joint in self.joints.iter_mut() {
            joint.set_rates(&self.species, &rates)?;
        }
        Ok(())
    }

    fn broadcast_species_change(&mut self, affected: Option<&IntSet<SpeciesNodeId>>) -> Result<()> {
        for joint in self.joints.iter_mut() {
            joint.reconciliation().on_species_tree_change(&self.species, affected)?;
        }
        Ok(())
    }

    pub fn reconciliation_likelihood(&mut self) -> Result<f64> {
        let mut total = 0.0;
        for joint in self.joints.iter_mut() {
            total += joint.compute_reconciliation_ll(&self.species)?;
        }
        Ok(self.comm.sum_double(total))
    }

    fn approximate_likelihood(&mut self) -> Result<f64> {
        let mut total = 0.0;
        for joint in self.joints.iter_mut() {
            total += joint.compute_reconciliation_ll_approx(&self.species)?;
        }
        Ok(self.comm.sum_double(total))
    }

    fn reject_move(
        &mut self,
        rollback: crate::trees::SpeciesRollback,
        affected: &IntSet<SpeciesNodeId>,
        exact_was_computed: bool,
    ) -> Result<()> {
        self.species.rollback(rollback);
        if exact_was_computed {
            for joint in self.joints.iter_mut() {
                joint.reconciliation().rollback_to_last_state()?;
            }
        }
        self.broadcast_species_change(Some(affected))
    }

    /// Greedy SPR round: accept the first move that survives both the
    /// approximate pre-filter and the exact rescoring.
    pub fn spr_round(&mut self, radius: usize) -> Result<f64> {
        let best_ll = self.reconciliation_likelihood()?;
        for prune in self.species.possible_prunes() {
            for regraft in self.species.possible_regrafts(prune, radius) {
                let (rollback, affected) = self.species.apply_spr(prune, regraft);
                self.broadcast_species_change(Some(&affected))?;
                let approx = self.approximate_likelihood()?;
                if approx >= best_ll {
                    let exact = self.reconciliation_likelihood()?;
                    if exact > best_ll {
                        debug!(
                            "species SPR accepted: hash={} ll={:.4} (previous {:.4})",
                            self.species.hash(),
                            exact,
                            best_ll
                        );
                        self.save_current_species_tree("inferred_species_tree.newick")?;
                        return Ok(exact);
                    }
                    self.reject_move(rollback, &affected, true)?;
                } else {
                    self.reject_move(rollback, &affected, false)?;
                }
            }
        }
        Ok(best_ll)
    }

    /// Slow SPR round: rank all moves on the approximate likelihood, then
    /// rescore the best K with proposal gene trees at gene radius 1.
    pub fn sorted_spr_round(&mut self, radius: usize, best_ll: f64) -> Result<f64> {
        info!("starting sorted species SPR round from tree hash={}", self.species.hash());
        let mut evaluated: Vec<EvaluatedMove> = Vec::new();
        for prune in self.species.possible_prunes() {
            for regraft in self.species.possible_regrafts(prune, radius) {
                let (rollback, affected) = self.species.apply_spr(prune, regraft);
                self.broadcast_species_change(Some(&affected))?;
                let ll = self.approximate_likelihood()?;
                evaluated.push(EvaluatedMove { prune, regraft, ll });
                self.reject_move(rollback, &affected, false)?;
            }
        }
        evaluated.sort_by_key(|em| OrderedFloat(-em.ll));
        let reference = self.proposal_joint_likelihood(1)?;
        info!("likelihood to beat: {:.4}", reference);
        for em in evaluated.into_iter().take(SLOW_RESCORE_MOVES) {
            let (rollback, affected) = self.species.apply_spr(em.prune, em.regraft);
            self.broadcast_species_change(Some(&affected))?;
            let joint_ll = self.proposal_joint_likelihood(1)?;
            if joint_ll > reference {
                info!(
                    "found better species tree: hash={} ll={:.4} (previous {:.4})",
                    self.species.hash(),
                    joint_ll,
                    reference
                );
                self.save_current_species_tree("inferred_species_tree.newick")?;
                return Ok(joint_ll);
            }
            // The committed engines were never rescored here, only the
            // proposal copies; no snapshot to roll back.
            self.reject_move(rollback, &affected, false)?;
        }
        Ok(best_ll)
    }

    /// Joint likelihood of proposal gene trees optimised at the given gene
    /// SPR radius against the current species tree; the committed per-family
    /// state is left untouched.
    fn proposal_joint_likelihood(&mut self, gene_radius: usize) -> Result<f64> {
        let proposals = self.output_dir.join("proposals");
        let rates = rates_vector_from(self.model, &self.rates, self.species.node_count());
        let mut total = 0.0;
        for joint in self.joints.iter() {
            let mut proposal = JointTree::new(
                joint.name(),
                joint.gene().clone(),
                joint.mapping().clone(),
                &self.species,
                self.model,
                true,
                SequenceEvaluator::null(joint.name()),
            )?;
            proposal.set_rates(&self.species, &rates)?;
            let ll =
                spr_search::spr_search(&mut proposal, &self.species, gene_radius, false, &self.comm)?;
            let family_dir = proposals.join(proposal.name());
            if family_dir.exists() {
                proposal.save(&family_dir.join("geneTree.newick"))?;
            }
            total += ll;
        }
        Ok(self.comm.sum_double(total))
    }

    fn root_edge_key(&self) -> (SpeciesNodeId, SpeciesNodeId) {
        let (a, b) = self.species.children(self.species.root()).expect("root is internal");
        (a.min(b), a.max(b))
    }

    /// Exhaustive re-rooting: walk the root across every branch of the
    /// unrooted topology, score each rooting once, keep the best.
    pub fn root_exhaustive_search(&mut self) -> Result<f64> {
        let mut best_ll = self.reconciliation_likelihood()?;
        let mut best_history: Vec<usize> = Vec::new();
        let mut history: Vec<usize> = Vec::new();
        let mut visited = std::collections::HashSet::new();
        visited.insert(self.root_edge_key());
        let mut visits = 1;
        self.root_search_aux(
            &mut history,
            &mut best_history,
            &mut best_ll,
            &mut visited,
            &mut visits,
        )?;
        debug_assert_eq!(
            visits,
            2 * self.species.leaf_count() - 3,
            "root search must visit every root"
        );
        for &direction in best_history.iter() {
            self.species.change_root(direction);
            let affected = self.species.root_change_affected();
            self.broadcast_species_change(Some(&affected))?;
        }
        self.save_current_species_tree("inferred_species_tree.newick")?;
        self.reconciliation_likelihood()
    }

    fn root_search_aux(
        &mut self,
        history: &mut Vec<usize>,
        best_history: &mut Vec<usize>,
        best_ll: &mut f64,
        visited: &mut std::collections::HashSet<(SpeciesNodeId, SpeciesNodeId)>,
        visits: &mut usize,
    ) -> Result<()> {
        for direction in 0..4 {
            if !self.species.can_change_root(direction) {
                continue;
            }
            let rollback = self.species.change_root(direction);
            if !visited.insert(self.root_edge_key()) {
                self.species.rollback(rollback);
                continue;
            }
            history.push(direction);
            let affected = self.species.root_change_affected();
            self.broadcast_species_change(Some(&affected))?;
            let ll = self.reconciliation_likelihood()?;
            *visits += 1;
            if ll > *best_ll {
                *best_ll = ll;
                *best_history = history.clone();
            }
            self.root_search_aux(history, best_history, best_ll, visited, visits)?;
            self.species.rollback(rollback);
            let affected = self.species.root_change_affected();
            self.broadcast_species_change(Some(&affected))?;
            history.pop();
        }
        Ok(())
    }

    /// Sample reconciliations, accumulate ordered transfer pair counts, and
    /// test the most frequent (donor, recipient) pairs as SPR moves.
    pub fn transfer_search(&mut self) -> Result<f64> {
        let seed = rng::snapshot();
        let mut frequencies: HashMap<(String, String), u64> = HashMap::new();
        for index in 0..self.joints.len() {
            for _ in 0..TRANSFER_SAMPLES {
                let scenario = {
                    let species = &self.species;
                    self.joints[index].infer_ml_scenario(species, true)?
                };
                for (donor, recipient) in scenario.transfers() {
                    let key = (
                        self.species.label(donor).to_string(),
                        self.species.label(recipient).to_string(),
                    );
                    *frequencies.entry(key).or_insert(0) += 1;
                }
            }
        }
        rng::restore(seed);
        let sorted: Vec<((String, String), u64)> = frequencies
            .into_iter()
            .sorted_by_key(|((donor, recipient), count)| {
                (std::cmp::Reverse(*count), donor.clone(), recipient.clone())
            })
            .collect();
        // Materialise before the barrier so every rank reads the same list.
        let transfers_path = self.output_dir.join("transfers.txt");
        let mut out = File::create(&transfers_path)?;
        for ((donor, recipient), count) in &sorted {
            writeln!(out, "{} {} {}", donor, recipient, count)?;
        }
        self.comm.barrier();
        info!("finished writing transfer frequencies ({} pairs)", sorted.len());

        let mut best_ll = self.reconciliation_likelihood()?;
        let min_trials = self.species.node_count();
        let mut trials = 0;
        let mut consecutive_failures = 0;
        let mut improvements = 0;
        for ((donor, recipient), _) in sorted {
            if trials >= min_trials
                && (consecutive_failures >= TRANSFER_EARLY_STOP
                    || improvements >= TRANSFER_EARLY_STOP)
            {
                break;
            }
            let (Some(donor_id), Some(recipient_id)) =
                (self.species.node_id(&donor), self.species.node_id(&recipient))
            else {
                continue;
            };
            if !self.is_valid_transfer_move(recipient_id, donor_id) {
                continue;
            }
            trials += 1;
            let (rollback, affected) = self.species.apply_spr(recipient_id, donor_id);
            self.broadcast_species_change(Some(&affected))?;
            let approx = self.approximate_likelihood()?;
            let mut accepted = false;
            if approx >= best_ll {
                let exact = self.reconciliation_likelihood()?;
                if exact > best_ll {
                    best_ll = exact;
                    improvements += 1;
                    consecutive_failures = 0;
                    accepted = true;
                    debug!(
                        "transfer-guided move {} -> {} accepted, ll={:.4}",
                        donor, recipient, exact
                    );
                    self.save_current_species_tree("inferred_species_tree.newick")?;
                } else {
                    self.reject_move(rollback, &affected, true)?;
                }
            } else {
                self.reject_move(rollback, &affected, false)?;
            }
            if !accepted {
                consecutive_failures += 1;
            }
        }
        Ok(best_ll)
    }

    fn is_valid_transfer_move(&self, prune: SpeciesNodeId, regraft: SpeciesNodeId) -> bool {
        if prune == regraft {
            return false;
        }
        let Some(parent) = self.species.parent(prune) else {
            return false;
        };
        if parent == self.species.root() || regraft == parent {
            return false;
        }
        if self.species.parent(regraft).is_none() {
            return false;
        }
        if self.species.subtree(prune).contains(&regraft) {
            return false;
        }
        self.species.sibling(prune) != regraft
    }

    /// Repeated SPR rounds until the improvement stalls.
    pub fn spr_search(&mut self, radius: usize, with_gene_trees: bool) -> Result<f64> {
        let mut best_ll = self.reconciliation_likelihood()?;
        info!("starting species SPR search, radius={}, ll={:.4}", radius, best_ll);
        loop {
            let new_ll = if with_gene_trees {
                self.sorted_spr_round(radius, best_ll)?
            } else {
                self.spr_round(radius)?
            };
            if new_ll - best_ll <= 0.001 {
                best_ll = best_ll.max(new_ll);
                break;
            }
            best_ll = new_ll;
        }
        self.save_current_species_tree("inferred_species_tree.newick")?;
        Ok(best_ll)
    }

    pub fn optimize_dtl_rates(&mut self) -> Result<()> {
        if self.user_rates {
            return Ok(());
        }
        let model = self.model;
        let species = &self.species;
        let joints = &mut self.joints;
        let comm = &self.comm;
        let mut objective = |params: &Parameters| -> Result<f64> {
            let rates = rates_vector_from(model, params, species.node_count());
            let mut total = 0.0;
            for joint in joints.iter_mut() {
                joint.set_rates(species, &rates)?;
                total += joint.compute_reconciliation_ll(species)?;
            }
            Ok(comm.sum_double(total))
        };
        let best = optim::optimize_parameters_global(&mut objective, &self.rates, self.rec_opt)?;
        self.rates = best;
        self.apply_rates()
    }

    pub fn save_current_species_tree(&self, name: &str) -> Result<()> {
        if self.comm.is_master() {
            io::newick::save_species_tree(&self.species, &self.output_dir.join(name))?;
        }
        Ok(())
    }

    /// Outer strategies of the species search.
    pub fn run_strategy(
        &mut self,
        strategy: SpeciesSearchStrategy,
        fast_radius: usize,
        slow_radius: usize,
    ) -> Result<f64> {
        let mut ll = self.reconciliation_likelihood()?;
        match strategy {
            SpeciesSearchStrategy::Spr => {
                for radius in 1..=fast_radius {
                    self.optimize_dtl_rates()?;
                    self.spr_search(radius, false)?;
                    ll = self.root_exhaustive_search()?;
                }
            }
            SpeciesSearchStrategy::Transfers => {
                for _ in 0..3 {
                    self.optimize_dtl_rates()?;
                    ll = self.transfer_search()?;
                }
            }
            SpeciesSearchStrategy::Hybrid => {
                for _ in 0..2 {
                    self.optimize_dtl_rates()?;
                    self.transfer_search()?;
                    ll = self.spr_search(1, false)?;
                }
            }
        }
        if slow_radius > 0 {
            ll = self.spr_search(slow_radius, true)?;
        }
        self.save_current_species_tree("inferred_species_tree.newick")?;
        Ok(ll)
    }
}
