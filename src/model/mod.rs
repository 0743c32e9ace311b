//! Reconciliation likelihood engines.

pub mod base;
pub mod dl;
pub mod dtl;
pub mod idtl;
pub mod scenario;

use crate::errors::EngineError;
use crate::mapping::GeneSpeciesMapping;
use crate::maths::ScaledValue;
use crate::trees::{GeneTree, HalfEdgeId, SpeciesNodeId, SpeciesTree};
use anyhow::Result;
use base::{compute_log_likelihood, infer_scenario, DpKernel};
use identity_hash::IntSet;
use scenario::Scenario;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecModel {
    UndatedDL,
    UndatedDTL,
    UndatedIDTL,
}

impl RecModel {
    pub fn free_parameters(&self) -> usize {
        match self {
            RecModel::UndatedDL => 2,
            RecModel::UndatedDTL => 3,
            RecModel::UndatedIDTL => 4,
        }
    }

    pub fn accounts_for_transfers(&self) -> bool {
        !matches!(self, RecModel::UndatedDL)
    }

    pub fn implements_approx(&self) -> bool {
        !matches!(self, RecModel::UndatedDL)
    }

    pub fn name(&self) -> &'static str {
        match self {
            RecModel::UndatedDL => "UndatedDL",
            RecModel::UndatedDTL => "UndatedDTL",
            RecModel::UndatedIDTL => "UndatedIDTL",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PartialMode {
    PartialGenes,
    PartialSpecies,
    NoPartial,
}

/// Per-species rate probabilities, one vector per free parameter of the
/// variant (duplication, loss, then transfer, then ILS).
#[derive(Clone, Debug)]
pub struct RatesVector {
    pub kind: RecModel,
    pub rates: Vec<Vec<f64>>,
}

impl RatesVector {
    pub fn global(kind: RecModel, values: &[f64], species_count: usize) -> Self {
        assert_eq!(values.len(), kind.free_parameters());
        RatesVector {
            kind,
            rates: values.iter().map(|&v| vec![v; species_count]).collect(),
        }
    }

    /// Flat per-species parameter layout: `species * free_parameters + kind`.
    pub fn per_species(kind: RecModel, flat: &[f64], species_count: usize) -> Self {
        let k = kind.free_parameters();
        assert_eq!(flat.len(), k * species_count);
        let mut rates = vec![vec![0.0; species_count]; k];
        for e in 0..species_count {
            for j in 0..k {
                rates[j][e] = flat[e * k + j];
            }
        }
        RatesVector { kind, rates }
    }

    pub fn species_count(&self) -> usize {
        self.rates.first().map(|r| r.len()).unwrap_or(0)
    }

    pub fn check_for(&self, kind: RecModel, species_count: usize) -> Result<()> {
        if self.kind != kind {
            return Err(EngineError::RatesMismatch { expected: kind, found: self.kind }.into());
        }
        if self.species_count() != species_count {
            return Err(EngineError::RatesDimension {
                expected: species_count,
                found: self.species_count(),
            }
            .into());
        }
        Ok(())
    }
}

/// Expand a flat optimiser point into per-species rates: a vector of
/// `free_parameters` entries is global, anything larger is per-species.
pub fn rates_vector_from(
    kind: RecModel,
    params: &crate::maths::Parameters,
    species_count: usize,
) -> RatesVector {
    if params.dimensions() == kind.free_parameters() {
        RatesVector::global(kind, params.values(), species_count)
    } else {
        RatesVector::per_species(kind, params.values(), species_count)
    }
}

/// Public surface of a reconciliation engine.
pub trait ReconciliationModel {
    fn bind_gene_tree(
        &mut self,
        gene: &GeneTree,
        mapping: &GeneSpeciesMapping,
        species: &SpeciesTree,
    ) -> Result<()>;
    fn set_rates(&mut self, species: &SpeciesTree, rates: &RatesVector) -> Result<()>;
    fn invalidate(&mut self, gene: &GeneTree, half_edges: &[HalfEdgeId]) -> Result<()>;
    fn on_species_tree_change(
        &mut self,
        species: &SpeciesTree,
        nodes: Option<&IntSet<SpeciesNodeId>>,
    ) -> Result<()>;
    fn evaluate(&mut self, gene: &GeneTree, species: &SpeciesTree, approx: bool) -> Result<f64>;
    fn infer_ml_scenario(
        &mut self,
        gene: &GeneTree,
        species: &SpeciesTree,
        stochastic: bool,
    ) -> Result<Scenario>;
    fn rollback_to_last_state(&mut self) -> Result<()>;
    fn set_partial_mode(&mut self, mode: PartialMode);
    fn gene_root(&self) -> Option<HalfEdgeId>;
    fn set_gene_root(&mut self, root: Option<HalfEdgeId>);
    fn clamp_warnings(&self) -> u64;
    fn extinction_probabilities(&self) -> Vec<f64>;
    fn normalized_rates(&self) -> Vec<Vec<f64>>;
}

impl<K: DpKernel> ReconciliationModel for K {
    fn bind_gene_tree(
        &mut self,
        gene: &GeneTree,
        mapping: &GeneSpeciesMapping,
        species: &SpeciesTree,
    ) -> Result<()> {
        self.core_mut().bind(gene, mapping, species)?;
        self.resize(gene, species);
        Ok(())
    }

    fn set_rates(&mut self, species: &SpeciesTree, rates: &RatesVector) -> Result<()> {
        self.core().ensure_bound()?;
        self.apply_rates(species, rates)?;
        self.core_mut().gene_root = None;
        // New rates invalidate the species fixpoint everywhere, whatever the
        // update subset of a pending fast round was.
        let all = self.core().all_species.clone();
        self.core_mut().species_to_update = all;
        self.core_mut().species_dirty = true;
        self.core_mut().invalidate_all();
        Ok(())
    }

    fn invalidate(&mut self, gene: &GeneTree, half_edges: &[HalfEdgeId]) -> Result<()> {
        self.core().ensure_bound()?;
        self.core_mut().invalidate(gene, half_edges);
        Ok(())
    }

    fn on_species_tree_change(
        &mut self,
        species: &SpeciesTree,
        nodes: Option<&IntSet<SpeciesNodeId>>,
    ) -> Result<()> {
        self.core().ensure_bound()?;
        self.core_mut().on_species_change(species, nodes);
        Ok(())
    }

    fn evaluate(&mut self, gene: &GeneTree, species: &SpeciesTree, approx: bool) -> Result<f64> {
        let fast = approx
            && self.core().partial_mode == PartialMode::PartialSpecies
            && !self.core().species_to_update.is_empty();
        self.core_mut().fast_mode = fast;
        if self.core().partial_mode == PartialMode::NoPartial {
            self.core_mut().invalidate_all();
        }
        let ll = compute_log_likelihood(self, gene, species)?;
        if fast {
            // The probe restored the pre-move CLVs; nothing it touched may
            // be considered up to date.
            self.core_mut().invalidate_all();
            self.core_mut().fast_mode = false;
        }
        Ok(ll)
    }

    fn infer_ml_scenario(
        &mut self,
        gene: &GeneTree,
        species: &SpeciesTree,
        stochastic: bool,
    ) -> Result<Scenario> {
        self.core_mut().fast_mode = false;
        infer_scenario(self, gene, species, stochastic)
    }

    fn rollback_to_last_state(&mut self) -> Result<()> {
        self.core().ensure_bound()?;
        self.rollback_clvs();
        self.core_mut().invalidate_all();
        Ok(())
    }

    fn set_partial_mode(&mut self, mode: PartialMode) {
        self.core_mut().partial_mode = mode;
    }

    fn gene_root(&self) -> Option<HalfEdgeId> {
        self.core().gene_root
    }

    fn set_gene_root(&mut self, root: Option<HalfEdgeId>) {
        self.core_mut().gene_root = root;
    }

    fn clamp_warnings(&self) -> u64 {
        self.core().clamp_warnings
    }

    fn extinction_probabilities(&self) -> Vec<f64> {
        DpKernel::extinction_probabilities(self)
    }

    fn normalized_rates(&self) -> Vec<Vec<f64>> {
        DpKernel::normalized_rates(self)
    }
}

/// Variant-dispatching wrapper owned by a joint tree or the species-tree
/// optimiser; always runs on scaled values.
pub struct ReconciliationEvaluation {
    kind: RecModel,
    model: Box<dyn ReconciliationModel>,
}

impl ReconciliationEvaluation {
    pub fn new(kind: RecModel, rooted_gene_tree: bool) -> Self {
        let model: Box<dyn ReconciliationModel> = match kind {
            RecModel::UndatedDL => Box::new(dl::UndatedDlModel::<ScaledValue>::new(rooted_gene_tree)),
            RecModel::UndatedDTL => {
                Box::new(dtl::UndatedDtlModel::<ScaledValue>::new(rooted_gene_tree))
            }
            RecModel::UndatedIDTL => {
                Box::new(idtl::UndatedIdtlModel::<ScaledValue>::new(rooted_gene_tree))
            }
        };
        ReconciliationEvaluation { kind, model }
    }

    pub fn kind(&self) -> RecModel {
        self.kind
    }

    pub fn model(&mut self) -> &mut dyn ReconciliationModel {
        self.model.as_mut()
    }

    pub fn bind_gene_tree(
        &mut self,
        gene: &GeneTree,
        mapping: &GeneSpeciesMapping,
        species: &SpeciesTree,
    ) -> Result<()> {
        self.model.bind_gene_tree(gene, mapping, species)
    }

    pub fn set_rates(&mut self, species: &SpeciesTree, rates: &RatesVector) -> Result<()> {
        rates.check_for(self.kind, species.node_count())?;
        self.model.set_rates(species, rates)
    }

    pub fn invalidate(&mut self, gene: &GeneTree, half_edges: &[HalfEdgeId]) -> Result<()> {
        self.model.invalidate(gene, half_edges)
    }

    pub fn on_species_tree_change(
        &mut self,
        species: &SpeciesTree,
        nodes: Option<&IntSet<SpeciesNodeId>>,
    ) -> Result<()> {
        self.model.on_species_tree_change(species, nodes)
    }

    pub fn evaluate(&mut self, gene: &GeneTree, species: &SpeciesTree, approx: bool) -> Result<f64> {
        self.model.evaluate(gene, species, approx)
    }

    pub fn infer_ml_scenario(
        &mut self,
        gene: &GeneTree,
        species: &SpeciesTree,
        stochastic: bool,
    ) -> Result<Scenario> {
        self.model.infer_ml_scenario(gene, species, stochastic)
    }

    pub fn rollback_to_last_state(&mut self) -> Result<()> {
        self.model.rollback_to_last_state()
    }

    pub fn set_partial_mode(&mut self, mode: PartialMode) {
        self.model.set_partial_mode(mode)
    }

    pub fn gene_root(&self) -> Option<HalfEdgeId> {
        self.model.gene_root()
    }

    pub fn extinction_probabilities(&self) -> Vec<f64> {
        self.model.extinction_probabilities()
    }

    pub fn normalized_rates(&self) -> Vec<Vec<f64>> {
        self.model.normalized_rates()
    }
}
