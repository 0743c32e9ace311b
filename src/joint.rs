//! A gene family coupled with its two likelihoods.
//!
//! The joint tree exclusively owns the gene tree, the sequence evaluator
//! and one reconciliation engine; moves are applied through it so both
//! kernels see the same invalidation set, and rollbacks are consumed in
//! LIFO order.

use crate::mapping::GeneSpeciesMapping;
use crate::model::{PartialMode, RatesVector, RecModel, ReconciliationEvaluation};
use crate::model::scenario::Scenario;
use crate::search::moves::SprMove;
use crate::seqlik::SequenceEvaluator;
use crate::trees::{GeneRollback, GeneTree, HalfEdgeId, SpeciesTree};
use anyhow::Result;
use std::fs::File;
use std::io::Write;
use std::path::Path;

pub struct JointTree {
    name: String,
    gene: GeneTree,
    mapping: GeneSpeciesMapping,
    seqlik: SequenceEvaluator,
    rec: ReconciliationEvaluation,
    rollbacks: Vec<(GeneRollback, Vec<HalfEdgeId>)>,
}

impl JointTree {
    pub fn new(
        name: &str,
        gene: GeneTree,
        mapping: GeneSpeciesMapping,
        species: &SpeciesTree,
        model: RecModel,
        rooted_gene_tree: bool,
        seqlik: SequenceEvaluator,
    ) -> Result<Self> {
        let mut rec = ReconciliationEvaluation::new(model, rooted_gene_tree);
        rec.bind_gene_tree(&gene, &mapping, species)?;
        Ok(JointTree { name: name.to_string(), gene, mapping, seqlik, rec, rollbacks: Vec::new() })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn gene(&self) -> &GeneTree {
        &self.gene
    }

    pub fn mapping(&self) -> &GeneSpeciesMapping {
        &self.mapping
    }

    pub fn reconciliation(&mut self) -> &mut ReconciliationEvaluation {
        &mut self.rec
    }

    pub fn set_rates(&mut self, species: &SpeciesTree, rates: &RatesVector) -> Result<()> {
        self.rec.set_rates(species, rates)
    }

    pub fn set_partial_mode(&mut self, mode: PartialMode) {
        self.rec.set_partial_mode(mode);
    }

    pub fn compute_reconciliation_ll(&mut self, species: &SpeciesTree) -> Result<f64> {
        self.rec.evaluate(&self.gene, species, false)
    }

    pub fn compute_reconciliation_ll_approx(&mut self, species: &SpeciesTree) -> Result<f64> {
        self.rec.evaluate(&self.gene, species, true)
    }

    pub fn compute_sequence_ll(&mut self) -> Result<f64> {
        self.seqlik.evaluate(&self.gene)
    }

    pub fn compute_joint_ll(&mut self, species: &SpeciesTree) -> Result<f64> {
        Ok(self.compute_sequence_ll()? + self.compute_reconciliation_ll(species)?)
    }

    pub fn optimize_sequence_parameters(&mut self) -> Result<f64> {
        self.seqlik.optimize_all(&mut self.gene)
    }

    pub fn infer_ml_scenario(&mut self, species: &SpeciesTree, stochastic: bool) -> Result<Scenario> {
        self.rec.infer_ml_scenario(&self.gene, species, stochastic)
    }

    pub fn apply_move(&mut self, mv: &SprMove) -> Result<()> {
        // The touched set must be taken before the surgery: it names the
        // healed-edge neighbours, which the moved tree no longer reaches
        // from the prune handle.
        let touched = mv.touched_half_edges(&self.gene);
        let rollback = self.gene.apply_spr(mv.prune, mv.regraft);
        self.rec.invalidate(&self.gene, &touched)?;
        self.rollbacks.push((rollback, touched));
        Ok(())
    }

    pub fn rollback_last_move(&mut self) -> Result<()> {
        let (rollback, touched) =
            self.rollbacks.pop().expect("rollback stack must not be empty");
        self.gene.rollback(rollback);
        self.rec.invalidate(&self.gene, &touched)?;
        Ok(())
    }

    /// Local branch-length optimisation around an applied move.
    pub fn optimize_move(&mut self, _mv: &SprMove) -> Result<f64> {
        self.seqlik.optimize_all(&mut self.gene)
    }

    pub fn unrooted_hash(&self) -> u64 {
        self.gene.unrooted_hash()
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let root = self.rec.gene_root().unwrap_or_else(|| self.gene.canonical(0));
        let mut out = File::create(path)?;
        writeln!(out, "{}", self.gene.to_newick(root))?;
        Ok(())
    }
}
