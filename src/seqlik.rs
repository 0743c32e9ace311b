//! Sequence (Felsenstein) likelihood boundary.
//!
//! The per-site phylogenetic kernel is an external collaborator; the crate
//! only defines the surface it must present and the adaptor that translates
//! its failures into typed errors. The null provider is the
//! sequences-disabled path: a zero likelihood and no-op optimisation, so
//! the joint likelihood degenerates to the reconciliation term.

use crate::errors::SequenceError;
use crate::trees::GeneTree;
use anyhow::Result;

pub trait SequenceLikelihood {
    /// Log-likelihood of the current topology and branch lengths.
    fn evaluate(&mut self, gene: &GeneTree) -> Result<f64, String>;
    /// Optimise branch lengths and model parameters in place.
    fn optimize_all(&mut self, gene: &mut GeneTree) -> Result<f64, String>;
    /// One round of sequence-driven SPR moves within the radius.
    fn spr_round(&mut self, gene: &mut GeneTree, radius: usize) -> Result<f64, String>;
}

pub struct NullSequenceLikelihood;

impl SequenceLikelihood for NullSequenceLikelihood {
    fn evaluate(&mut self, _gene: &GeneTree) -> Result<f64, String> {
        Ok(0.0)
    }

    fn optimize_all(&mut self, _gene: &mut GeneTree) -> Result<f64, String> {
        Ok(0.0)
    }

    fn spr_round(&mut self, _gene: &mut GeneTree, _radius: usize) -> Result<f64, String> {
        Ok(0.0)
    }
}

/// Owns the kernel and translates its failures at the component boundary.
pub struct SequenceEvaluator {
    family: String,
    kernel: Box<dyn SequenceLikelihood>,
}

impl SequenceEvaluator {
    pub fn new(family: &str, kernel: Box<dyn SequenceLikelihood>) -> Self {
        SequenceEvaluator { family: family.to_string(), kernel }
    }

    pub fn null(family: &str) -> Self {
        SequenceEvaluator::new(family, Box::new(NullSequenceLikelihood))
    }

    fn translate(&self, result: Result<f64, String>) -> Result<f64> {
        result.map_err(|reason| {
            SequenceError::KernelFailure { family: self.family.clone(), reason }.into()
        })
    }

    pub fn evaluate(&mut self, gene: &GeneTree) -> Result<f64> {
        let result = self.kernel.evaluate(gene);
        self.translate(result)
    }

    pub fn optimize_all(&mut self, gene: &mut GeneTree) -> Result<f64> {
        let result = self.kernel.optimize_all(gene);
        self.translate(result)
    }

    pub fn spr_round(&mut self, gene: &mut GeneTree, radius: usize) -> Result<f64> {
        let result = self.kernel.spr_round(gene, radius);
        self.translate(result)
    }
}
