//! String conversions for the CLI enums. An invalid value is a user error
//! with its own exit code.

use crate::model::RecModel;
use crate::optim::RecOpt;
use crate::routines::GeneSearchStrategy;
use crate::search::species_opt::SpeciesSearchStrategy;
use log::*;

const INVALID_ENUM_EXIT: i32 = 41;

pub fn parse_rec_model(value: &str) -> RecModel {
    match value {
        "UndatedDL" => RecModel::UndatedDL,
        "UndatedDTL" => RecModel::UndatedDTL,
        "UndatedIDTL" => RecModel::UndatedIDTL,
        other => {
            error!("invalid reconciliation model {}", other);
            std::process::exit(INVALID_ENUM_EXIT);
        }
    }
}

pub fn parse_rec_opt(value: &str) -> RecOpt {
    match value {
        "grid" => RecOpt::Grid,
        "simplex" => RecOpt::Simplex,
        "gradient" => RecOpt::Gradient,
        other => {
            error!("invalid rate optimization method {}", other);
            std::process::exit(INVALID_ENUM_EXIT);
        }
    }
}

pub fn parse_strategy(value: &str) -> GeneSearchStrategy {
    match value {
        "SPR" => GeneSearchStrategy::Spr,
        "EVAL" => GeneSearchStrategy::Eval,
        other => {
            error!("invalid strategy {}", other);
            std::process::exit(INVALID_ENUM_EXIT);
        }
    }
}

pub fn parse_species_strategy(value: &str) -> SpeciesSearchStrategy {
    match value {
        "SPR" => SpeciesSearchStrategy::Spr,
        "TRANSFERS" => SpeciesSearchStrategy::Transfers,
        "HYBRID" => SpeciesSearchStrategy::Hybrid,
        other => {
            error!("invalid species search strategy {}", other);
            std::process::exit(INVALID_ENUM_EXIT);
        }
    }
}
