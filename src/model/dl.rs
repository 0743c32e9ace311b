//! Undated duplication-loss model.
//!
//! Without transfers nothing couples the species branches through a global
//! mean, so the extinction probabilities admit a closed form (the smallest
//! root of the per-branch quadratic) and the CLVs converge in a single
//! post-order pass.

use crate::maths::scaled::ScaledReal;
use crate::maths::{is_proba, PROBA_EPSILON};
use crate::model::base::{sample_index, DpKernel, EngineCore};
use crate::model::scenario::{Event, EventKind, Scenario};
use crate::model::{RatesVector, RecModel};
use crate::trees::{GeneTree, HalfEdgeId, SpeciesNodeId, SpeciesTree};
use anyhow::Result;

pub struct UndatedDlModel<R: ScaledReal> {
    core: EngineCore,
    pd: Vec<f64>,
    pl: Vec<f64>,
    ps: Vec<f64>,
    ue: Vec<f64>,
    clvs: Vec<Vec<R>>,
    backup: Vec<Vec<R>>,
}

impl<R: ScaledReal> UndatedDlModel<R> {
    pub fn new(rooted_gene_tree: bool) -> Self {
        UndatedDlModel {
            core: EngineCore::new(rooted_gene_tree),
            pd: Vec::new(),
            pl: Vec::new(),
            ps: Vec::new(),
            ue: Vec::new(),
            clvs: Vec::new(),
            backup: Vec::new(),
        }
    }

    fn compute_probability(
        &self,
        gene: &GeneTree,
        species: &SpeciesTree,
        u: HalfEdgeId,
        e: SpeciesNodeId,
        is_virtual_root: bool,
    ) -> R {
        let gid = if is_virtual_root { self.core.virtual_index(u) } else { u };
        let is_gene_leaf = !is_virtual_root && gene.is_leaf(u);
        let is_species_leaf = species.is_leaf(e);

        if is_species_leaf && is_gene_leaf && self.core.gene_to_species[u] == Some(e) {
            return R::of(self.ps[e]);
        }

        let mut proba = R::zero();
        let species_children = species.children(e);
        if !is_gene_leaf {
            let (left, right) = if is_virtual_root {
                (u, gene.back(u))
            } else {
                gene.children(u).expect("internal gene node")
            };
            if let Some((f, g)) = species_children {
                let mut straight = self.clvs[left][f];
                straight *= self.clvs[right][g];
                straight = straight.mul_f64(self.ps[e]);
                straight.scale();
                proba += straight;
                let mut crossed = self.clvs[left][g];
                crossed *= self.clvs[right][f];
                crossed = crossed.mul_f64(self.ps[e]);
                crossed.scale();
                proba += crossed;
            }
            let mut dup = self.clvs[left][e];
            dup *= self.clvs[right][e];
            dup = dup.mul_f64(self.pd[e]);
            dup.scale();
            proba += dup;
        }
        if let Some((f, g)) = species_children {
            let mut sl = self.clvs[gid][f];
            sl = sl.mul_f64(self.ue[g] * self.ps[e]);
            sl.scale();
            proba += sl;
            let mut slr = self.clvs[gid][g];
            slr = slr.mul_f64(self.ue[f] * self.ps[e]);
            slr.scale();
            proba += slr;
        }
        proba
    }
}

impl<R: ScaledReal> DpKernel for UndatedDlModel<R> {
    type Real = R;

    fn core(&self) -> &EngineCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut EngineCore {
        &mut self.core
    }

    fn resize(&mut self, _gene: &GeneTree, species: &SpeciesTree) {
        let slots = self.core.clv_slots();
        let n = species.node_count();
        self.clvs = vec![vec![R::zero(); n]; slots];
        self.backup = vec![vec![R::zero(); n]; slots];
        self.ue = vec![0.0; n];
    }

    fn apply_rates(&mut self, species: &SpeciesTree, rates: &RatesVector) -> Result<()> {
        rates.check_for(RecModel::UndatedDL, species.node_count())?;
        self.pd = rates.rates[0].clone();
        self.pl = rates.rates[1].clone();
        self.ps = vec![0.0; species.node_count()];
        for &e in &self.core.all_species {
            let sum = self.pd[e] + self.pl[e] + 1.0;
            self.pd[e] /= sum;
            self.pl[e] /= sum;
            self.ps[e] = 1.0 / sum;
        }
        Ok(())
    }

    fn recompute_species_probabilities(&mut self, species: &SpeciesTree) {
        if self.ue.len() != self.core.species_count {
            self.ue = vec![0.0; self.core.species_count];
        }
        // uE = PL + PD uE^2 + PS uE_f uE_g: keep the smallest root of the
        // quadratic, which is the extinction probability.
        for &e in &self.core.all_species.clone() {
            let mut c = self.pl[e];
            if let Some((f, g)) = species.children(e) {
                c += self.ps[e] * self.ue[f] * self.ue[g];
            }
            let a = self.pd[e];
            let proba = if a < 1e-12 {
                c
            } else {
                (1.0 - (1.0 - 4.0 * a * c).max(0.0).sqrt()) / (2.0 * a)
            };
            debug_assert!(is_proba(proba));
            self.ue[e] = proba.clamp(0.0, 1.0 + PROBA_EPSILON).min(1.0);
        }
    }

    fn update_clv(&mut self, gene: &GeneTree, species: &SpeciesTree, u: HalfEdgeId) {
        for index in 0..self.core.species_nodes().len() {
            let e = self.core.species_nodes()[index];
            let proba = self.compute_probability(gene, species, u, e, false);
            self.clvs[u][e] = proba;
        }
    }

    fn compute_root_clv(&mut self, gene: &GeneTree, species: &SpeciesTree, root: HalfEdgeId) {
        let gid = self.core.virtual_index(root);
        for index in 0..self.core.species_nodes().len() {
            let e = self.core.species_nodes()[index];
            let proba = self.compute_probability(gene, species, root, e, true);
            self.clvs[gid][e] = proba;
        }
    }

    fn root_likelihood(&self, root: HalfEdgeId) -> R {
        let gid = self.core.virtual_index(root);
        let mut sum = R::zero();
        for &e in &self.core.all_species {
            sum += self.clvs[gid][e];
        }
        sum
    }

    fn root_likelihood_at(&self, root: HalfEdgeId, e: SpeciesNodeId) -> R {
        self.clvs[self.core.virtual_index(root)][e]
    }

    fn likelihood_factor(&self) -> R {
        let mut factor = R::zero();
        for &e in &self.core.all_species {
            factor += R::of(1.0 - self.ue[e]);
        }
        factor
    }

    fn extinction_probabilities(&self) -> Vec<f64> {
        self.ue.clone()
    }

    fn normalized_rates(&self) -> Vec<Vec<f64>> {
        vec![self.pd.clone(), self.pl.clone(), self.ps.clone()]
    }

    fn before_compute(&mut self) {
        if self.core.partial_mode == crate::model::PartialMode::PartialSpecies
            && !self.core.fast_mode
        {
            std::mem::swap(&mut self.clvs, &mut self.backup);
        }
    }

    fn after_compute(&mut self) {}

    fn rollback_clvs(&mut self) {
        std::mem::swap(&mut self.clvs, &mut self.backup);
    }

    fn backtrace_event(
        &mut self,
        gene: &GeneTree,
        species: &SpeciesTree,
        u: HalfEdgeId,
        e: SpeciesNodeId,
        is_virtual_root: bool,
        _scenario: &mut Scenario,
        stochastic: bool,
    ) -> Event {
        let gid = if is_virtual_root { self.core.virtual_index(u) } else { u };
        let is_gene_leaf = !is_virtual_root && gene.is_leaf(u);
        let is_species_leaf = species.is_leaf(e);

        if is_species_leaf && is_gene_leaf && self.core.gene_to_species[u] == Some(e) {
            return Event::none(gid, e);
        }

        let mut values = [R::zero(); 5];
        let gene_children = if is_virtual_root {
            Some((u, gene.back(u)))
        } else {
            gene.children(u)
        };
        let species_children = species.children(e);
        if let Some((left, right)) = gene_children {
            if let Some((f, g)) = species_children {
                let mut straight = self.clvs[left][f];
                straight *= self.clvs[right][g];
                values[0] = straight.mul_f64(self.ps[e]);
                let mut crossed = self.clvs[left][g];
                crossed *= self.clvs[right][f];
                values[1] = crossed.mul_f64(self.ps[e]);
            }
            let mut dup = self.clvs[left][e];
            dup *= self.clvs[right][e];
            values[2] = dup.mul_f64(self.pd[e]);
        }
        if let Some((f, g)) = species_children {
            values[3] = self.clvs[gid][f].mul_f64(self.ue[g] * self.ps[e]);
            values[4] = self.clvs[gid][g].mul_f64(self.ue[f] * self.ps[e]);
        }

        let chosen = if stochastic {
            sample_index(&values)
        } else {
            let mut best = 0;
            for i in 1..values.len() {
                if values[i] > values[best] {
                    best = i;
                }
            }
            Some(best)
        };
        let chosen = match chosen {
            Some(i) if !values[i].is_zero() => i,
            _ => {
                return Event {
                    kind: EventKind::Invalid,
                    gene: gid,
                    species: e,
                    dest_species: None,
                    transferred_gene: None,
                    cross: false,
                }
            }
        };
        let mut event = Event::none(gid, e);
        match chosen {
            0 => event.kind = EventKind::S,
            1 => {
                event.kind = EventKind::S;
                event.cross = true;
            }
            2 => event.kind = EventKind::D,
            3 => {
                event.kind = EventKind::Sl;
                event.dest_species = species_children.map(|(f, _)| f);
            }
            4 => {
                event.kind = EventKind::Sl;
                event.dest_species = species_children.map(|(_, g)| g);
            }
            _ => unreachable!(),
        }
        event
    }
}
