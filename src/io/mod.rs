pub mod fasta;
pub mod newick;
pub mod recwriter;
