use colored::Colorize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FileError {
    #[error("failed to open {}", .filename.bright_yellow().bold())]
    CannotOpen { source: std::io::Error, filename: String },

    #[error("{} not found", .0.bright_yellow().bold())]
    NotFound(String),

    #[error("while creating {filename}")]
    WhileCreating { source: std::io::Error, filename: String },

    #[error("{} is empty", .0.yellow().bold())]
    Empty(String),
}

#[derive(Error, Debug)]
pub enum FamilyError {
    #[error("species {} not found in the species tree", .0.yellow().bold())]
    SpeciesNotFound(String),

    #[error("gene {} has no species mapping", .0.yellow().bold())]
    UnmappedGene(String),

    #[error("gene {} is mapped more than once", .0.yellow().bold())]
    DuplicatedGene(String),

    #[error("no valid family left after filtering")]
    NoValidFamily,

    #[error("failed to parse the families descriptor {}: {reason}", .filename.yellow().bold())]
    BadDescriptor { filename: String, reason: String },
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("no gene tree bound to the reconciliation engine")]
    NotBound,

    #[error("rates vector is for {found:?}, engine expects {expected:?}")]
    RatesMismatch { expected: crate::model::RecModel, found: crate::model::RecModel },

    #[error("rates vector covers {found} species, engine expects {expected}")]
    RatesDimension { expected: usize, found: usize },

    #[error("backtrace produced an invalid event at gene {gene}, species {species}")]
    InvalidBacktrace { gene: usize, species: usize },
}

#[derive(Error, Debug)]
pub enum TreeError {
    #[error("species tree is not binary at node {}", .0.yellow().bold())]
    NotBinary(String),

    #[error("gene tree has fewer than 3 leaves")]
    TooSmall,

    #[error("leaf {} does not carry a label", .0)]
    UnlabelledLeaf(usize),

    #[error("failed to parse newick: {0}")]
    BadNewick(String),
}

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("family job {} exited with code {code}", .name.yellow().bold())]
    JobFailed { name: String, code: i32 },

    #[error("too many family jobs failed ({failed}/{total})")]
    FailureBudgetExceeded { failed: usize, total: usize },
}

#[derive(Error, Debug)]
pub enum SequenceError {
    #[error("sequence kernel failed on {}: {reason}", .family.yellow().bold())]
    KernelFailure { family: String, reason: String },
}
