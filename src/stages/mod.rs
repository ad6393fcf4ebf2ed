pub mod stage1_extract;
pub mod stage2_anonymize;
pub mod stage3_structure;
pub mod stage4_enrich;

pub use stage1_extract::*;
pub use stage2_anonymize::*;
pub use stage3_structure::*;
pub use stage4_enrich::*;

use std::fmt;

use thiserror::Error;

use crate::llm::{ModelError, RetryError};

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Extraction,
    Anonymization,
    Structuring,
    Enrichment,
}

impl Stage {
    pub const ORDER: [Stage; 4] = [
        Stage::Extraction,
        Stage::Anonymization,
        Stage::Structuring,
        Stage::Enrichment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Extraction => "extraction",
            Stage::Anonymization => "anonymization",
            Stage::Structuring => "structuring",
            Stage::Enrichment => "enrichment",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecoverable failure inside a stage
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error(transparent)]
    Model(#[from] ModelError),

    #[error("model output does not match the lab results shape: {0}")]
    Schema(String),
}
