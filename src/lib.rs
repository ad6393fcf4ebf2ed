pub mod batch;
pub mod config;
pub mod heuristics;
pub mod io;
pub mod llm;
pub mod models;
pub mod pipeline;
pub mod stages;
pub mod storage;

pub use config::{Config, ConfigError};
pub use heuristics::{CodeMatcher, PatternEngine, RegexScrubber};
pub use llm::{
    ModelClient, ModelConfig, ModelError, ModelProvider, RetryPolicy, ValidityClassifier,
    build_client,
};
pub use models::{
    AnonymizedText, DocumentRecord, DocumentStatus, LabItem, LabValue, LaboratoryResults,
};
pub use pipeline::{IngestOptions, Pipeline, PipelineError, PipelineSettings, ProcessMode, ProcessOutput};
pub use stages::{
    AnonymizationMode, Anonymizer, EnrichmentMode, Enricher, Extractor, Stage, StageError,
    Structurer,
};
pub use storage::{FsObjectStore, MetadataStore, ObjectStore, SqliteMetadataStore};
