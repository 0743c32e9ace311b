//! Shared machinery of the reconciliation models: binding, CLV invalidation
//! and traversal order, virtual-root enumeration, the generic likelihood
//! driver and the backtrace driver.

use crate::errors::EngineError;
use crate::mapping::GeneSpeciesMapping;
use crate::maths::scaled::ScaledReal;
use crate::maths::{LOG_LIKELIHOOD_FLOOR, PROBA_EPSILON};
use crate::model::scenario::{Event, EventKind, Scenario};
use crate::model::{PartialMode, RatesVector};
use crate::rng;
use crate::trees::{GeneTree, HalfEdgeId, SpeciesNodeId, SpeciesTree};
use anyhow::Result;
use identity_hash::IntSet;

/// Engine state shared by the three model variants.
#[derive(Clone, Debug)]
pub struct EngineCore {
    pub rooted_gene_tree: bool,
    pub partial_mode: PartialMode,
    pub fast_mode: bool,
    bound: bool,
    pub max_gene_id: usize,
    pub gene_to_species: Vec<Option<SpeciesNodeId>>,
    pub gene_root: Option<HalfEdgeId>,
    pub species_count: usize,
    pub all_species: Vec<SpeciesNodeId>,
    pub species_to_update: Vec<SpeciesNodeId>,
    pub species_dirty: bool,
    clv_updated: Vec<bool>,
    last_ll: Option<f64>,
    pub clamp_warnings: u64,
}

impl EngineCore {
    pub fn new(rooted_gene_tree: bool) -> Self {
        EngineCore {
            rooted_gene_tree,
            partial_mode: PartialMode::PartialGenes,
            fast_mode: false,
            bound: false,
            max_gene_id: 0,
            gene_to_species: Vec::new(),
            gene_root: None,
            species_count: 0,
            all_species: Vec::new(),
            species_to_update: Vec::new(),
            species_dirty: true,
            clv_updated: Vec::new(),
            last_ll: None,
            clamp_warnings: 0,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.bound
    }

    pub fn ensure_bound(&self) -> Result<()> {
        if !self.bound {
            return Err(EngineError::NotBound.into());
        }
        Ok(())
    }

    pub fn bind(
        &mut self,
        gene: &GeneTree,
        mapping: &GeneSpeciesMapping,
        species: &SpeciesTree,
    ) -> Result<()> {
        self.max_gene_id = gene.max_half_edge();
        self.gene_to_species = vec![None; gene.half_edge_count()];
        for u in gene.leaves() {
            let label = gene
                .label(u)
                .ok_or(crate::errors::TreeError::UnlabelledLeaf(u))?;
            let species_label = mapping
                .species_of(label)
                .ok_or_else(|| crate::errors::FamilyError::UnmappedGene(label.to_string()))?;
            let e = species
                .leaf_id(species_label)
                .ok_or_else(|| {
                    crate::errors::FamilyError::SpeciesNotFound(species_label.to_string())
                })?;
            self.gene_to_species[u] = Some(e);
        }
        self.species_count = species.node_count();
        self.all_species = species.post_order();
        self.species_to_update = Vec::new();
        self.species_dirty = true;
        self.clv_updated = vec![false; gene.half_edge_count()];
        self.gene_root = if self.rooted_gene_tree { Some(gene.canonical(0)) } else { None };
        self.last_ll = None;
        self.bound = true;
        Ok(())
    }

    /// Species nodes scored in the current mode.
    pub fn species_nodes(&self) -> &[SpeciesNodeId] {
        if self.fast_mode {
            &self.species_to_update
        } else {
            &self.all_species
        }
    }

    pub fn invalidate_all(&mut self) {
        for flag in self.clv_updated.iter_mut() {
            *flag = false;
        }
        self.last_ll = None;
    }

    /// Mark the half-edges dirty, together with every half-edge whose
    /// subtree contains them.
    pub fn invalidate(&mut self, gene: &GeneTree, half_edges: &[HalfEdgeId]) {
        let mut visited: IntSet<HalfEdgeId> = IntSet::default();
        let mut stack: Vec<HalfEdgeId> = half_edges.to_vec();
        while let Some(u) = stack.pop() {
            if !visited.insert(u) {
                continue;
            }
            self.clv_updated[u] = false;
            for parent in gene.parents(u) {
                stack.push(parent);
            }
        }
        self.last_ll = None;
    }

    pub fn on_species_change(&mut self, species: &SpeciesTree, nodes: Option<&IntSet<SpeciesNodeId>>) {
        self.all_species = species.post_order();
        self.species_count = species.node_count();
        match nodes {
            Some(set) => {
                self.species_to_update =
                    self.all_species.iter().copied().filter(|e| set.contains(e)).collect();
            }
            None => self.species_to_update = self.all_species.clone(),
        }
        self.species_dirty = true;
        // Transfer sums couple every gene CLV to the species side.
        self.invalidate_all();
    }

    pub fn last_ll(&self) -> Option<f64> {
        self.last_ll
    }

    pub fn set_last_ll(&mut self, ll: f64) {
        self.last_ll = Some(ll);
    }

    /// Candidate virtual roots: every branch until a root is cached, then
    /// only the cached root's neighbourhood.
    pub fn root_candidates(&self, gene: &GeneTree) -> Vec<HalfEdgeId> {
        match self.gene_root {
            Some(root) => gene.neighbour_branches(root),
            None => gene.branches().collect(),
        }
    }

    /// Post-order list of the half-edges whose CLV must be recomputed to
    /// score the current root candidates; marks them as updated.
    pub fn pending_updates(&mut self, gene: &GeneTree) -> Vec<HalfEdgeId> {
        let mut order = Vec::new();
        for root in self.root_candidates(gene) {
            for side in [root, gene.back(root)] {
                self.pending_updates_rec(gene, side, &mut order);
            }
        }
        order
    }

    fn pending_updates_rec(&mut self, gene: &GeneTree, u: HalfEdgeId, order: &mut Vec<HalfEdgeId>) {
        if self.clv_updated[u] {
            return;
        }
        if let Some((left, right)) = gene.children(u) {
            self.pending_updates_rec(gene, left, order);
            self.pending_updates_rec(gene, right, order);
        }
        self.clv_updated[u] = true;
        order.push(u);
    }

    /// CLV slot of the virtual root over the branch `(u, back(u))`.
    pub fn virtual_index(&self, u: HalfEdgeId) -> usize {
        u + self.max_gene_id + 1
    }

    pub fn clv_slots(&self) -> usize {
        2 * (self.max_gene_id + 1)
    }
}

/// Probability validation: assert in debug, clamp (and count) in release.
pub fn check_proba<R: ScaledReal>(x: &mut R, warnings: &mut u64) {
    let one_plus = R::of(1.0 + PROBA_EPSILON);
    debug_assert!(
        !(*x > one_plus),
        "probability above 1: {:?}",
        x
    );
    if *x > one_plus {
        *x = R::one();
        *warnings += 1;
    }
}

/// Proportional draw from the global generator; `None` when all weights
/// vanish.
pub fn sample_index<R: ScaledReal>(values: &[R]) -> Option<usize> {
    let mut total = R::zero();
    for v in values {
        total += *v;
    }
    if total.is_zero() {
        return None;
    }
    let draw = rng::uniform();
    let mut cumulated = 0.0;
    let mut last_valid = None;
    for (i, v) in values.iter().enumerate() {
        if v.is_zero() {
            continue;
        }
        last_valid = Some(i);
        cumulated += v.ratio_to(&total);
        if cumulated >= draw {
            return Some(i);
        }
    }
    last_valid
}

/// The per-variant arithmetic behind the generic drivers.
pub trait DpKernel {
    type Real: ScaledReal;

    fn core(&self) -> &EngineCore;
    fn core_mut(&mut self) -> &mut EngineCore;

    fn resize(&mut self, gene: &GeneTree, species: &SpeciesTree);
    fn apply_rates(&mut self, species: &SpeciesTree, rates: &RatesVector) -> Result<()>;
    fn recompute_species_probabilities(&mut self, species: &SpeciesTree);
    fn update_clv(&mut self, gene: &GeneTree, species: &SpeciesTree, u: HalfEdgeId);
    fn compute_root_clv(&mut self, gene: &GeneTree, species: &SpeciesTree, root: HalfEdgeId);
    fn root_likelihood(&self, root: HalfEdgeId) -> Self::Real;
    fn root_likelihood_at(&self, root: HalfEdgeId, e: SpeciesNodeId) -> Self::Real;
    fn likelihood_factor(&self) -> Self::Real;
    /// Per-species extinction probabilities, as plain doubles.
    fn extinction_probabilities(&self) -> Vec<f64>;
    /// Normalised per-event probabilities, one row per kind
    /// (duplication, loss, transfer..., speciation last).
    fn normalized_rates(&self) -> Vec<Vec<f64>>;
    fn before_compute(&mut self);
    fn after_compute(&mut self);
    fn rollback_clvs(&mut self);
    /// Re-derive the event chosen at `(u, e)` for the backtrace.
    fn backtrace_event(
        &mut self,
        gene: &GeneTree,
        species: &SpeciesTree,
        u: HalfEdgeId,
        e: SpeciesNodeId,
        is_virtual_root: bool,
        scenario: &mut Scenario,
        stochastic: bool,
    ) -> Event;
}

/// Shared `evaluate` driver: reconverge dirty CLVs, rescore the candidate
/// roots, marginalise and cache the best root.
pub fn compute_log_likelihood<K: DpKernel>(
    kernel: &mut K,
    gene: &GeneTree,
    species: &SpeciesTree,
) -> Result<f64> {
    kernel.core().ensure_bound()?;
    if !kernel.core().fast_mode {
        if let Some(ll) = kernel.core().last_ll() {
            return Ok(ll);
        }
    }
    kernel.before_compute();
    if kernel.core().species_dirty {
        kernel.recompute_species_probabilities(species);
        if !kernel.core().fast_mode {
            kernel.core_mut().species_dirty = false;
        }
    }
    let order = kernel.core_mut().pending_updates(gene);
    for u in order {
        kernel.update_clv(gene, species, u);
    }
    let roots = kernel.core().root_candidates(gene);
    let mut sum = K::Real::zero();
    let mut best: Option<(HalfEdgeId, K::Real)> = None;
    for root in roots {
        kernel.compute_root_clv(gene, species, root);
        let value = kernel.root_likelihood(root);
        sum += value;
        if best.as_ref().map(|(_, b)| value > *b).unwrap_or(true) {
            best = Some((root, value));
        }
    }
    let factor = kernel.likelihood_factor();
    assert!(
        !factor.is_zero() && factor > K::Real::zero(),
        "likelihood factor must be positive"
    );
    let ll = if sum.is_zero() {
        LOG_LIKELIHOOD_FLOOR
    } else {
        sum.ln() - factor.ln()
    };
    if let Some((root, _)) = best {
        kernel.core_mut().gene_root = Some(root);
    }
    kernel.after_compute();
    // A fast evaluation is a throwaway probe; only exact values are cached.
    if !kernel.core().fast_mode {
        kernel.core_mut().set_last_ll(ll);
    }
    Ok(ll)
}

/// Best (virtual root, species root) pair, or a proportional sample.
fn choose_root<K: DpKernel>(
    kernel: &mut K,
    gene: &GeneTree,
    stochastic: bool,
) -> Result<(HalfEdgeId, SpeciesNodeId)> {
    let roots = kernel.core().root_candidates(gene);
    let species = kernel.core().all_species.clone();
    if stochastic {
        let mut weights = Vec::new();
        let mut cells = Vec::new();
        for &root in &roots {
            for &e in &species {
                weights.push(kernel.root_likelihood_at(root, e));
                cells.push((root, e));
            }
        }
        let index = sample_index(&weights)
            .ok_or(EngineError::InvalidBacktrace { gene: 0, species: 0 })?;
        return Ok(cells[index]);
    }
    let mut best: Option<((HalfEdgeId, SpeciesNodeId), K::Real)> = None;
    for &root in &roots {
        for &e in &species {
            let value = kernel.root_likelihood_at(root, e);
            if best.as_ref().map(|(_, b)| value > *b).unwrap_or(true) {
                best = Some(((root, e), value));
            }
        }
    }
    best.map(|(cell, _)| cell)
        .ok_or_else(|| EngineError::InvalidBacktrace { gene: 0, species: 0 }.into())
}

/// Shared backtrace driver; assumes a preceding `evaluate` left the CLVs
/// converged.
pub fn infer_scenario<K: DpKernel>(
    kernel: &mut K,
    gene: &GeneTree,
    species: &SpeciesTree,
    stochastic: bool,
) -> Result<Scenario> {
    kernel.core().ensure_bound()?;
    if kernel.core().last_ll().is_none() {
        compute_log_likelihood(kernel, gene, species)?;
    }
    let (root, species_root) = choose_root(kernel, gene, stochastic)?;
    let mut scenario = Scenario::new(gene, species, root);
    backtrace_rec(kernel, gene, species, root, species_root, true, &mut scenario, stochastic)?;
    Ok(scenario)
}

#[allow(clippy::too_many_arguments)]
fn backtrace_rec<K: DpKernel>(
    kernel: &mut K,
    gene: &GeneTree,
    species: &SpeciesTree,
    u: HalfEdgeId,
    e: SpeciesNodeId,
    is_virtual_root: bool,
    scenario: &mut Scenario,
    stochastic: bool,
) -> Result<()> {
    let event =
        kernel.backtrace_event(gene, species, u, e, is_virtual_root, scenario, stochastic);
    let kind = event.kind;
    let dest = event.dest_species;
    let transferred = event.transferred_gene;
    let cross = event.cross;
    scenario.add_event(event);

    let children = if is_virtual_root {
        Some((u, gene.back(u)))
    } else {
        gene.children(u)
    };
    match kind {
        EventKind::Leaf => {}
        EventKind::S => {
            let (left, right) = children.expect("speciation on an internal gene node");
            let (f, g) = species.children(e).expect("speciation on an internal species node");
            let (sl, sr) = if cross { (g, f) } else { (f, g) };
            backtrace_rec(kernel, gene, species, left, sl, false, scenario, stochastic)?;
            backtrace_rec(kernel, gene, species, right, sr, false, scenario, stochastic)?;
        }
        EventKind::D => {
            let (left, right) = children.expect("duplication on an internal gene node");
            backtrace_rec(kernel, gene, species, left, e, false, scenario, stochastic)?;
            backtrace_rec(kernel, gene, species, right, e, false, scenario, stochastic)?;
        }
        EventKind::Sl => {
            let dest = dest.expect("speciation-loss carries its surviving species");
            backtrace_rec(kernel, gene, species, u, dest, is_virtual_root, scenario, stochastic)?;
        }
        EventKind::T => {
            let (left, right) = children.expect("transfer on an internal gene node");
            let moved = transferred.expect("transfer carries the moved gene");
            let stayed = if moved == left { right } else { left };
            let dest = dest.expect("transfer carries its recipient species");
            backtrace_rec(kernel, gene, species, moved, dest, false, scenario, stochastic)?;
            backtrace_rec(kernel, gene, species, stayed, e, false, scenario, stochastic)?;
        }
        EventKind::Tl => {
            let dest = dest.expect("transfer-loss carries its recipient species");
            backtrace_rec(kernel, gene, species, u, dest, is_virtual_root, scenario, stochastic)?;
        }
        EventKind::L | EventKind::Invalid => {
            return Err(EngineError::InvalidBacktrace { gene: u, species: e }.into());
        }
    }
    Ok(())
}
