//! Reconciliation scenarios: the event sequence recovered by the backtrace.

use crate::trees::{GeneTree, HalfEdgeId, SpeciesNodeId, SpeciesTree};
use std::collections::HashSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    S,
    Sl,
    D,
    T,
    Tl,
    L,
    Leaf,
    Invalid,
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::S => "S",
            EventKind::Sl => "SL",
            EventKind::D => "D",
            EventKind::T => "T",
            EventKind::Tl => "TL",
            EventKind::L => "L",
            EventKind::Leaf => "None",
            EventKind::Invalid => "Invalid",
        }
    }

    fn count_index(&self) -> usize {
        match self {
            EventKind::S => 0,
            EventKind::Sl => 1,
            EventKind::D => 2,
            EventKind::T => 3,
            EventKind::Tl => 4,
            EventKind::L => 5,
            EventKind::Leaf => 6,
            EventKind::Invalid => 7,
        }
    }
}

pub const EVENT_COUNT: usize = 8;

#[derive(Clone, Debug)]
pub struct Event {
    pub kind: EventKind,
    pub gene: usize,
    pub species: SpeciesNodeId,
    pub dest_species: Option<SpeciesNodeId>,
    pub transferred_gene: Option<usize>,
    /// For speciations: left gene child follows the right species child.
    pub cross: bool,
}

impl Event {
    pub fn none(gene: usize, species: SpeciesNodeId) -> Self {
        Event {
            kind: EventKind::Leaf,
            gene,
            species,
            dest_species: None,
            transferred_gene: None,
            cross: false,
        }
    }

    pub fn is_transfer(&self) -> bool {
        matches!(self.kind, EventKind::T | EventKind::Tl)
    }
}

/// One full reconciliation of a gene tree: the ordered events, the events
/// hanging off each gene branch, and the transfer blacklist preventing the
/// backtrace from sampling the same (gene, species) transfer twice.
#[derive(Clone, Debug)]
pub struct Scenario {
    events: Vec<Event>,
    per_gene: Vec<Vec<Event>>,
    counts: [u64; EVENT_COUNT],
    per_species: Vec<[f64; 5]>,
    blacklist: HashSet<(usize, SpeciesNodeId)>,
    gene_root: HalfEdgeId,
    virtual_root_index: usize,
}

impl Scenario {
    pub fn new(gene: &GeneTree, species: &SpeciesTree, gene_root: HalfEdgeId) -> Self {
        let slots = 2 * (gene.max_half_edge() + 1);
        Scenario {
            events: Vec::new(),
            per_gene: vec![Vec::new(); slots],
            counts: [0; EVENT_COUNT],
            per_species: vec![[0.0; 5]; species.node_count()],
            blacklist: HashSet::new(),
            gene_root,
            virtual_root_index: gene_root + gene.max_half_edge() + 1,
        }
    }

    pub fn gene_root(&self) -> HalfEdgeId {
        self.gene_root
    }

    pub fn virtual_root_index(&self) -> usize {
        self.virtual_root_index
    }

    pub fn add_event(&mut self, event: Event) {
        self.counts[event.kind.count_index()] += 1;
        let column = match event.kind {
            EventKind::S | EventKind::Sl => Some(0),
            EventKind::D => Some(1),
            EventKind::L => Some(2),
            EventKind::T | EventKind::Tl => Some(3),
            _ => None,
        };
        if let Some(column) = column {
            self.per_species[event.species][column] += 1.0;
        }
        self.per_gene[event.gene].push(event.clone());
        self.events.push(event);
    }

    pub fn events(&self) -> &[Event] {
        &self.events
    }

    pub fn events_of(&self, gene: usize) -> &[Event] {
        &self.per_gene[gene]
    }

    pub fn count(&self, kind: EventKind) -> u64 {
        self.counts[kind.count_index()]
    }

    pub fn per_species_counts(&self, species: SpeciesNodeId) -> &[f64; 5] {
        &self.per_species[species]
    }

    /// Ordered (donor, recipient) species pairs of every transfer event.
    pub fn transfers(&self) -> impl Iterator<Item = (SpeciesNodeId, SpeciesNodeId)> + '_ {
        self.events.iter().filter(|e| e.is_transfer()).filter_map(|e| {
            e.dest_species.map(|dest| (e.species, dest))
        })
    }

    pub fn is_blacklisted(&self, gene: usize, species: SpeciesNodeId) -> bool {
        self.blacklist.contains(&(gene, species))
    }

    pub fn blacklist(&mut self, gene: usize, species: SpeciesNodeId) {
        self.blacklist.insert((gene, species));
    }

    pub fn reset_blacklist(&mut self) {
        self.blacklist.clear();
    }
}
