//! Undated duplication-transfer-loss model.
//!
//! Transfers are averaged over recipient species through per-gene
//! `survivingTransferSum` marginals, which makes the recurrence
//! self-referential: both the extinction vector and the CLVs are converged
//! by fixed-point iteration (5 rounds exact, 1 round in fast mode). When
//! reconstructing explicit transfer scenarios, the recipient scan excludes
//! the donor and all its ancestors.

use crate::maths::scaled::ScaledReal;
use crate::model::base::{check_proba, sample_index, DpKernel, EngineCore};
use crate::model::scenario::{Event, EventKind, Scenario};
use crate::model::{RatesVector, RecModel};
use crate::trees::{GeneTree, HalfEdgeId, SpeciesNodeId, SpeciesTree};
use anyhow::Result;
use identity_hash::IntSet;

/// Per-gene CLV matrix and transfer-sum book-keeping: the full `uq` rows,
/// the per-gene surviving-transfer marginal, the invariant tail retained in
/// fast mode, and the one-more-iteration value the invariant is derived
/// from.
#[derive(Clone, Debug)]
pub(crate) struct DtlClvs<R> {
    pub uq: Vec<Vec<R>>,
    pub surviving: Vec<R>,
    pub invariant: Vec<R>,
    pub one_more: Vec<R>,
}

impl<R: ScaledReal> DtlClvs<R> {
    pub fn empty() -> Self {
        DtlClvs {
            uq: Vec::new(),
            surviving: Vec::new(),
            invariant: Vec::new(),
            one_more: Vec::new(),
        }
    }

    pub fn sized(slots: usize, species_count: usize) -> Self {
        DtlClvs {
            uq: vec![vec![R::zero(); species_count]; slots],
            surviving: vec![R::zero(); slots],
            invariant: vec![R::zero(); slots],
            one_more: vec![R::zero(); slots],
        }
    }

    pub fn len(&self) -> usize {
        self.surviving.len()
    }
}

pub struct UndatedDtlModel<R: ScaledReal> {
    core: EngineCore,
    pd: Vec<f64>,
    pl: Vec<f64>,
    pt: Vec<f64>,
    ps: Vec<f64>,
    ue: Vec<R>,
    transfer_extinction_sum: R,
    transfer_extinction_backup: R,
    clvs: DtlClvs<R>,
    backup: DtlClvs<R>,
}

impl<R: ScaledReal> UndatedDtlModel<R> {
    pub fn new(rooted_gene_tree: bool) -> Self {
        UndatedDtlModel {
            core: EngineCore::new(rooted_gene_tree),
            pd: Vec::new(),
            pl: Vec::new(),
            pt: Vec::new(),
            ps: Vec::new(),
            ue: Vec::new(),
            transfer_extinction_sum: R::zero(),
            transfer_extinction_backup: R::zero(),
            clvs: DtlClvs::empty(),
            backup: DtlClvs::empty(),
        }
    }

    fn iterations(&self) -> usize {
        if self.core.fast_mode {
            1
        } else {
            5
        }
    }

    /// Contribution of the species nodes *not* being rescored; only
    /// meaningful in fast mode.
    fn reset_transfer_sums(&self, transfer_sum: R, probabilities: &[R]) -> R {
        if !self.core.fast_mode {
            return R::zero();
        }
        let mut diff = R::zero();
        for &e in self.core.species_nodes() {
            diff += probabilities[e];
        }
        diff = diff.div_usize(self.core.species_count);
        transfer_sum.minus(diff)
    }

    fn update_transfer_sums(&self, invariant: R, probabilities: &[R]) -> R {
        let mut sum = R::zero();
        for &e in self.core.species_nodes() {
            sum += probabilities[e];
        }
        sum = sum.div_usize(self.core.species_count);
        if self.core.fast_mode {
            sum += invariant;
        }
        sum
    }

    fn corrected_transfer_extinction(&self, e: SpeciesNodeId) -> R {
        self.transfer_extinction_sum.mul_f64(self.pt[e])
    }

    fn corrected_transfer_sum(&self, gid: usize, e: SpeciesNodeId) -> R {
        self.clvs.surviving[gid].mul_f64(self.pt[e])
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
                let mut straight = self.clvs.uq[left][f];
                straight *= self.clvs.uq[right][g];
                straight = straight.mul_f64(self.ps[e]);
                straight.scale();
                proba += straight;
                let mut crossed = self.clvs.uq[left][g];
                crossed *= self.clvs.uq[right][f];
                crossed = crossed.mul_f64(self.ps[e]);
                crossed.scale();
                proba += crossed;
            }
            let mut dup = self.clvs.uq[left][e];
            dup *= self.clvs.uq[right][e];
            dup = dup.mul_f64(self.pd[e]);
            dup.scale();
            proba += dup;

            let mut t_left = self.corrected_transfer_sum(left, e);
            t_left *= self.clvs.uq[right][e];
            t_left.scale();
            proba += t_left;
            let mut t_right = self.corrected_transfer_sum(right, e);
            t_right *= self.clvs.uq[left][e];
            t_right.scale();
            proba += t_right;
        }
        if let Some((f, g)) = species_children {
            let mut sl = self.clvs.uq[gid][f];
            sl *= self.ue[g].mul_f64(self.ps[e]);
            sl.scale();
            proba += sl;
            let mut slr = self.clvs.uq[gid][g];
            slr *= self.ue[f].mul_f64(self.ps[e]);
            slr.scale();
            proba += slr;
        }
        let mut tl = self.corrected_transfer_sum(gid, e);
        tl *= self.ue[e];
        tl.scale();
        proba += tl;
        proba
    }

    fn run_clv_fixpoint(
        &mut self,
        gene: &GeneTree,
        species: &SpeciesTree,
        u: HalfEdgeId,
        is_virtual_root: bool,
    ) {
        let gid = if is_virtual_root { self.core.virtual_index(u) } else { u };
        let source = if self.core.fast_mode {
            self.clvs.one_more[gid]
        } else {
            self.clvs.surviving[gid]
        };
        self.clvs.invariant[gid] = self.reset_transfer_sums(source, &self.clvs.uq[gid]);
        if !self.core.fast_mode {
            for index in 0..self.core.species_nodes().len() {
                let e = self.core.species_nodes()[index];
                self.clvs.uq[gid][e] = R::zero();
            }
        }
        for _ in 0..self.iterations() {
            self.clvs.surviving[gid] =
                self.update_transfer_sums(self.clvs.invariant[gid], &self.clvs.uq[gid]);
            for index in 0..self.core.species_nodes().len() {
                let e = self.core.species_nodes()[index];
                let proba = self.compute_probability(gene, species, u, e, is_virtual_root);
                self.clvs.uq[gid][e] = proba;
            }
        }
    }

    /// Ancestors (donor included) are forbidden recipients.
    fn forbidden_recipients(&self, species: &SpeciesTree, e: SpeciesNodeId) -> IntSet<SpeciesNodeId> {
        species.ancestors(e)
    }

    /// Best or sampled transfer event under `(u, e)`; returns
    /// `(moved gene, recipient species, probability)`.
    fn best_transfer(
        &self,
        gene: &GeneTree,
        species: &SpeciesTree,
        u: HalfEdgeId,
        e: SpeciesNodeId,
        is_virtual_root: bool,
        stochastic: bool,
    ) -> Option<(HalfEdgeId, SpeciesNodeId, R)> {
        let (left, right) = if is_virtual_root {
            (u, gene.back(u))
        } else {
            gene.children(u)?
        };
        let n = self.core.species_count;
        let parents = self.forbidden_recipients(species, e);
        let factor = self.pt[e] / n as f64;
        let mut probas = vec![R::zero(); 2 * n];
        for &h in &self.core.all_species {
            if parents.contains(&h) {
                continue;
            }
            let mut moved_left = self.clvs.uq[left][h];
            moved_left *= self.clvs.uq[right][e];
            probas[h] = moved_left.mul_f64(factor);
            let mut moved_right = self.clvs.uq[right][h];
            moved_right *= self.clvs.uq[left][e];
            probas[h + n] = moved_right.mul_f64(factor);
        }
        if stochastic {
            let mut total = R::zero();
            for p in &probas {
                total += *p;
            }
            let index = sample_index(&probas)?;
            let moved = if index < n { left } else { right };
            Some((moved, index % n, total))
        } else {
            let mut best: Option<(HalfEdgeId, SpeciesNodeId, R)> = None;
            for h in 0..n {
                if best.as_ref().map(|(_, _, b)| probas[h] > *b).unwrap_or(!probas[h].is_zero()) {
                    best = Some((left, h, probas[h]));
                }
                if best
                    .as_ref()
                    .map(|(_, _, b)| probas[h + n] > *b)
                    .unwrap_or(!probas[h + n].is_zero())
                {
                    best = Some((right, h, probas[h + n]));
                }
            }
            best
        }
    }

    /// Best or sampled transfer-loss recipient for the gene CLV `gid`.
    fn best_transfer_loss(
        &self,
        species: &SpeciesTree,
        gid: usize,
        e: SpeciesNodeId,
        scenario: &mut Scenario,
        stochastic: bool,
    ) -> Option<(SpeciesNodeId, R)> {
        let n = self.core.species_count;
        let parents = self.forbidden_recipients(species, e);
        let factor = self.ue[e].mul_f64(self.pt[e] / n as f64);
        let mut probas = vec![R::zero(); n];
        for &h in &self.core.all_species {
            if parents.contains(&h) {
                continue;
            }
            let mut p = self.clvs.uq[gid][h];
            p *= factor;
            probas[h] = p;
        }
        if stochastic {
            let mut total = R::zero();
            for p in &probas {
                total += *p;
            }
            loop {
                let h = sample_index(&probas)?;
                probas[h] = R::zero();
                if !scenario.is_blacklisted(gid, h) {
                    scenario.blacklist(gid, h);
                    return Some((h, total));
                }
            }
        } else {
            let mut best: Option<(SpeciesNodeId, R)> = None;
            for h in 0..n {
                let better =
                    best.as_ref().map(|(_, b)| probas[h] > *b).unwrap_or(!probas[h].is_zero());
                if better && !scenario.is_blacklisted(gid, h) {
                    scenario.blacklist(gid, h);
                    best = Some((h, probas[h]));
                }
            }
            best
        }
    }
}

impl<R: ScaledReal> DpKernel for UndatedDtlModel<R> {
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
        self.clvs = DtlClvs::sized(slots, n);
        self.backup = DtlClvs::sized(slots, n);
        self.ue = vec![R::zero(); n];
    }

    fn apply_rates(&mut self, species: &SpeciesTree, rates: &RatesVector) -> Result<()> {
        rates.check_for(RecModel::UndatedDTL, species.node_count())?;
        self.pd = rates.rates[0].clone();
        self.pl = rates.rates[1].clone();
        self.pt = rates.rates[2].clone();
        self.ps = vec![0.0; species.node_count()];
        for &e in &self.core.all_species {
            let sum = self.pd[e] + self.pl[e] + self.pt[e] + 1.0;
            self.pd[e] /= sum;
            self.pl[e] /= sum;
            self.pt[e] /= sum;
            self.ps[e] = 1.0 / sum;
        }
        Ok(())
    }

    fn recompute_species_probabilities(&mut self, species: &SpeciesTree) {
        if self.ue.len() != self.core.species_count {
            self.ue = vec![R::zero(); self.core.species_count];
        }
        let invariant = self.reset_transfer_sums(self.transfer_extinction_sum, &self.ue);
        for _ in 0..self.iterations() {
            for index in 0..self.core.species_nodes().len() {
                let e = self.core.species_nodes()[index];
                let mut proba = R::of(self.pl[e]);
                let mut dup = self.ue[e];
                dup *= self.ue[e];
                dup = dup.mul_f64(self.pd[e]);
                dup.scale();
                proba += dup;
                let mut t = self.corrected_transfer_extinction(e);
                t *= self.ue[e];
                t.scale();
                proba += t;
                if let Some((f, g)) = species.children(e) {
                    let mut s = self.ue[f];
                    s *= self.ue[g];
                    s = s.mul_f64(self.ps[e]);
                    s.scale();
                    proba += s;
                }
                check_proba(&mut proba, &mut self.core.clamp_warnings);
                self.ue[e] = proba;
            }
            self.transfer_extinction_sum = self.update_transfer_sums(invariant, &self.ue);
        }
    }

    fn update_clv(&mut self, gene: &GeneTree, species: &SpeciesTree, u: HalfEdgeId) {
        self.run_clv_fixpoint(gene, species, u, false);
        if self.core.partial_mode == crate::model::PartialMode::PartialSpecies
            && !self.core.fast_mode
        {
            self.clvs.one_more[u] =
                self.update_transfer_sums(self.clvs.invariant[u], &self.clvs.uq[u]);
        }
    }

    fn compute_root_clv(&mut self, gene: &GeneTree, species: &SpeciesTree, root: HalfEdgeId) {
        self.run_clv_fixpoint(gene, species, root, true);
        if !self.core.fast_mode {
            let gid = self.core.virtual_index(root);
            self.clvs.one_more[gid] =
                self.update_transfer_sums(self.clvs.invariant[gid], &self.clvs.uq[gid]);
        }
    }

    fn root_likelihood(&self, root: HalfEdgeId) -> R {
        let gid = self.core.virtual_index(root);
        let mut sum = R::zero();
        for &e in &self.core.all_species {
            sum += self.clvs.uq[gid][e];
        }
        sum
    }

    fn root_likelihood_at(&self, root: HalfEdgeId, e: SpeciesNodeId) -> R {
        self.clvs.uq[self.core.virtual_index(root)][e]
    }

    fn likelihood_factor(&self) -> R {
        let mut factor = R::zero();
        for &e in &self.core.all_species {
            factor += R::one().minus(self.ue[e]);
        }
        factor
    }

    fn extinction_probabilities(&self) -> Vec<f64> {
        self.ue.iter().map(|u| u.ln().exp()).collect()
    }

    fn normalized_rates(&self) -> Vec<Vec<f64>> {
        vec![self.pd.clone(), self.pl.clone(), self.pt.clone(), self.ps.clone()]
    }

    fn before_compute(&mut self) {
        if self.core.partial_mode != crate::model::PartialMode::PartialSpecies {
            return;
        }
        if self.core.fast_mode {
            self.transfer_extinction_backup = self.transfer_extinction_sum;
            for gid in 0..self.clvs.len() {
                self.backup.surviving[gid] = self.clvs.surviving[gid];
                for index in 0..self.core.species_to_update.len() {
                    let e = self.core.species_to_update[index];
                    self.backup.uq[gid][e] = self.clvs.uq[gid][e];
                }
            }
        } else {
            std::mem::swap(&mut self.clvs, &mut self.backup);
        }
    }

    fn after_compute(&mut self) {
        if self.core.partial_mode != crate::model::PartialMode::PartialSpecies {
            return;
        }
        if self.core.fast_mode {
            self.transfer_extinction_sum = self.transfer_extinction_backup;
            for gid in 0..self.clvs.len() {
                self.clvs.surviving[gid] = self.backup.surviving[gid];
                for index in 0..self.core.species_to_update.len() {
                    let e = self.core.species_to_update[index];
                    self.clvs.uq[gid][e] = self.backup.uq[gid][e];
                }
            }
        }
    }

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
        scenario: &mut Scenario,
        stochastic: bool,
    ) -> Event {
        let gid = if is_virtual_root { self.core.virtual_index(u) } else { u };
        let is_gene_leaf = !is_virtual_root && gene.is_leaf(u);
        let is_species_leaf = species.is_leaf(e);

        if is_species_leaf && is_gene_leaf && self.core.gene_to_species[u] == Some(e) {
            return Event::none(gid, e);
        }

        let mut values = [R::zero(); 8];
        let gene_children = if is_virtual_root {
            Some((u, gene.back(u)))
        } else {
            gene.children(u)
        };
        let species_children = species.children(e);
        if let Some((left, right)) = gene_children {
            if let Some((f, g)) = species_children {
                let mut straight = self.clvs.uq[left][f];
                straight *= self.clvs.uq[right][g];
                values[0] = straight.mul_f64(self.ps[e]);
                let mut crossed = self.clvs.uq[left][g];
                crossed *= self.clvs.uq[right][f];
                values[1] = crossed.mul_f64(self.ps[e]);
            }
            let mut dup = self.clvs.uq[left][e];
            dup *= self.clvs.uq[right][e];
            values[2] = dup.mul_f64(self.pd[e]);
        }
        if let Some((f, g)) = species_children {
            let mut sl = self.clvs.uq[gid][f];
            sl *= self.ue[g].mul_f64(self.ps[e]);
            values[3] = sl;
            let mut slr = self.clvs.uq[gid][g];
            slr *= self.ue[f].mul_f64(self.ps[e]);
            values[4] = slr;
        }
        let transfer = if gene_children.is_some() {
            self.best_transfer(gene, species, u, e, is_virtual_root, stochastic)
        } else {
            None
        };
        if let Some((_, _, proba)) = &transfer {
            values[5] = *proba;
        }
        let transfer_loss = self.best_transfer_loss(species, gid, e, scenario, stochastic);
        if let Some((_, proba)) = &transfer_loss {
            values[7] = *proba;
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
            5 => {
                let (moved, recipient, _) = transfer.expect("transfer value implies a transfer");
                event.kind = EventKind::T;
                event.transferred_gene = Some(moved);
                event.dest_species = Some(recipient);
            }
            7 => {
                let (recipient, _) = transfer_loss.expect("TL value implies a recipient");
                event.kind = EventKind::Tl;
                event.transferred_gene = Some(gid);
                event.dest_species = Some(recipient);
            }
            _ => unreachable!("slot 6 is never filled"),
        }
        event
    }
}
