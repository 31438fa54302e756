//! Planner output handling: prompt construction, response parsing, and
//! schema validation.

pub mod parser;
pub mod prompt;

pub use parser::{PlanParseError, parse_plan};

use serde::{Deserialize, Serialize};

/// A validated plan: ordered phases, each with parallel experts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanSpec {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub phases: Vec<PhaseSpec>,
}

/// One planned phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseSpec {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub experts: Vec<ExpertSpec>,
}

/// One planned expert within a phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpertSpec {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub expertise: String,
    #[serde(default)]
    pub persona: String,
    #[serde(default)]
    pub task: String,
}
