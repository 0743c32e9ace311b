pub mod gene_tree;
pub mod nj;
pub mod species_tree;

pub use gene_tree::{GeneRollback, GeneTree, HalfEdgeId, TopoNode};
pub use species_tree::{SpeciesNodeId, SpeciesRollback, SpeciesTree};
