//! Deterministic orchestration of the four stages over stored documents.
//!
//! Every stage entry point takes a document id, reads its input through the
//! previous stage's pointer on the record, stores its own output and advances
//! the record's status. A stage whose pointer is already set is skipped, so
//! re-running a document only redoes what is missing.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::config::{Config, ConfigError};
use crate::io::media_type_for;
use crate::llm::{ModelClient, ModelError, RetryPolicy, build_client};
use crate::models::{DocumentRecord, DocumentStatus, LaboratoryResults, RecordUpdate};
use crate::stages::{
    AnonymizationMode, Anonymizer, EnrichmentMode, Enricher, ExtractionConfig, Extractor, Stage,
    StageError, Structurer, build_anonymizer,
};
use crate::storage::{
    FsObjectStore, MetadataStore, ObjectStore, ObjectStoreError, SqliteMetadataStore, StoreError,
    keys, sha256_hex,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{stage} failed for document '{doc_id}': {source}")]
    Stage {
        stage: Stage,
        doc_id: String,
        #[source]
        source: StageError,
    },

    #[error("{stage} for document '{doc_id}' needs {missing}; run the earlier stage first")]
    MissingInput {
        stage: Stage,
        doc_id: String,
        missing: &'static str,
    },

    #[error("document '{0}' not found")]
    NotFound(String),

    #[error("content {content_hash} was already ingested as document '{existing_id}'")]
    Duplicate {
        content_hash: String,
        existing_id: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    ObjectStore(#[from] ObjectStoreError),

    #[error("stored lab results are not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Model(#[from] ModelError),
}

impl PipelineError {
    fn stage(stage: Stage, doc_id: &str, source: StageError) -> Self {
        PipelineError::Stage {
            stage,
            doc_id: doc_id.to_string(),
            source,
        }
    }

    /// Whether this failure should be written onto the document record
    fn is_recorded(&self) -> bool {
        !matches!(
            self,
            PipelineError::MissingInput { .. }
                | PipelineError::NotFound(_)
                | PipelineError::Duplicate { .. }
        )
    }
}

/// How far [`Pipeline::process`] drives a new document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessMode {
    IngestOnly,
    ThroughAnonymization,
    ThroughStructuring,
    #[default]
    Full,
}

impl ProcessMode {
    fn runs(&self, stage: Stage) -> bool {
        let last = match self {
            ProcessMode::IngestOnly => return false,
            ProcessMode::ThroughAnonymization => Stage::Anonymization,
            ProcessMode::ThroughStructuring => Stage::Structuring,
            ProcessMode::Full => Stage::Enrichment,
        };
        Stage::ORDER.iter().position(|s| *s == stage) <= Stage::ORDER.iter().position(|s| *s == last)
    }
}

/// Caller-supplied details stored on a new record
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// OCR/extraction language hint, e.g. `mkd+eng`
    pub language: Option<String>,
    pub uploaded_by: Option<String>,
}

/// Result of [`Pipeline::process`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessOutput {
    pub doc_id: String,
    pub text_key: Option<String>,
    pub anonymized_key: Option<String>,
    pub json_key: Option<String>,
    /// Last artifact produced: anonymized text, or the lab results JSON
    pub output: Value,
}

/// Knobs for building the default stages
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub bronze_bucket: String,
    pub silver_bucket: String,
    pub retry: RetryPolicy,
    pub anonymization_mode: AnonymizationMode,
    pub anonymization_prefilter: bool,
    pub enrichment_mode: EnrichmentMode,
    pub ocr_language: String,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            bronze_bucket: "bronze".to_string(),
            silver_bucket: "silver".to_string(),
            retry: RetryPolicy::default(),
            anonymization_mode: AnonymizationMode::default(),
            anonymization_prefilter: false,
            enrichment_mode: EnrichmentMode::default(),
            ocr_language: "eng".to_string(),
        }
    }
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            bronze_bucket: config.bronze_bucket.clone(),
            silver_bucket: config.silver_bucket.clone(),
            retry: RetryPolicy::new(config.max_attempts, Some(config.attempt_timeout)),
            anonymization_mode: config.anonymization_mode,
            anonymization_prefilter: config.anonymization_prefilter,
            enrichment_mode: config.enrichment_mode,
            ocr_language: config.ocr_language.clone(),
        }
    }
}

pub struct Pipeline {
    objects: Arc<dyn ObjectStore>,
    metadata: Arc<dyn MetadataStore>,
    model_provider: String,
    model_name: String,
    extractor: Extractor,
    anonymizer: Arc<dyn Anonymizer>,
    structurer: Structurer,
    enricher: Enricher,
    bronze_bucket: String,
    silver_bucket: String,
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl Pipeline {
    pub fn new(
        objects: Arc<dyn ObjectStore>,
        metadata: Arc<dyn MetadataStore>,
        model: Arc<dyn ModelClient>,
        settings: PipelineSettings,
    ) -> Self {
        let extraction = ExtractionConfig {
            retry: settings.retry.clone().best_effort(),
            default_language: settings.ocr_language.clone(),
            ..Default::default()
        };
        Self {
            objects,
            metadata,
            model_provider: model.provider().to_string(),
            model_name: model.model_name().to_string(),
            extractor: Extractor::new(model.clone(), extraction),
            anonymizer: build_anonymizer(
                settings.anonymization_mode,
                model.clone(),
                settings.retry.clone(),
                settings.anonymization_prefilter,
            ),
            structurer: Structurer::new(model.clone(), settings.retry.clone()),
            enricher: Enricher::new(model, settings.retry, settings.enrichment_mode),
            bronze_bucket: settings.bronze_bucket,
            silver_bucket: settings.silver_bucket,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Filesystem object store, SQLite metadata and the configured model backend
    pub fn from_config(config: &Config) -> Result<Self, PipelineError> {
        let model = build_client(&config.model)?;
        if let Some(parent) = config.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let metadata = SqliteMetadataStore::open(&config.db_path)?;
        Ok(Self::new(
            Arc::new(FsObjectStore::new(&config.storage_root)),
            Arc::new(metadata),
            model,
            PipelineSettings::from_config(config),
        ))
    }

    pub fn with_extractor(mut self, extractor: Extractor) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_anonymizer(mut self, anonymizer: Arc<dyn Anonymizer>) -> Self {
        self.anonymizer = anonymizer;
        self
    }

    pub fn with_structurer(mut self, structurer: Structurer) -> Self {
        self.structurer = structurer;
        self
    }

    pub fn with_enricher(mut self, enricher: Enricher) -> Self {
        self.enricher = enricher;
        self
    }

    /// Store a new upload and create its record in the `uploaded` state.
    ///
    /// The original is stored before the record exists, so a failed upload
    /// leaves nothing behind that blocks a retry. Byte-identical content is
    /// rejected with [`PipelineError::Duplicate`].
    pub async fn ingest(
        &self,
        bytes: &[u8],
        filename: &str,
        options: &IngestOptions,
    ) -> Result<String, PipelineError> {
        let doc_id = uuid::Uuid::new_v4().to_string();
        let content_hash = sha256_hex(bytes);
        let original_key = keys::original_key(&doc_id, filename);
        let content_type = media_type_for(Path::new(filename));

        if let Some(existing) = self.metadata.find_by_hash(&content_hash).await? {
            warn!("Duplicate upload of {}, existing document {}", filename, existing.id);
            return Err(PipelineError::Duplicate {
                content_hash,
                existing_id: existing.id,
            });
        }

        let etag = self
            .put(&self.bronze_bucket, &original_key, bytes, content_type)
            .await?;

        let mut record = DocumentRecord::new(
            &doc_id,
            filename,
            content_type,
            bytes.len() as u64,
            &content_hash,
            &self.bronze_bucket,
            &original_key,
        );
        record.etag_original = Some(etag);
        record.language = options.language.clone();
        record.uploaded_by = options.uploaded_by.clone();
        record.model_provider = Some(self.model_provider.clone());
        record.model_name = Some(self.model_name.clone());

        match self.metadata.create(&record).await {
            Ok(()) => {}
            Err(StoreError::DuplicateContent {
                content_hash,
                existing_id,
            }) => {
                // Lost a race with a concurrent upload of the same bytes
                warn!(
                    "Duplicate upload of {}, existing document {}; {} left unreferenced",
                    filename, existing_id, original_key
                );
                return Err(PipelineError::Duplicate {
                    content_hash,
                    existing_id,
                });
            }
            Err(e) => return Err(e.into()),
        }

        info!("Ingested {} as document {} ({} bytes)", filename, doc_id, bytes.len());
        Ok(doc_id)
    }

    pub async fn extract(&self, doc_id: &str) -> Result<String, PipelineError> {
        let lock = self.document_lock(doc_id);
        let _guard = lock.lock().await;
        self.extract_locked(doc_id).await
    }

    pub async fn anonymize(&self, doc_id: &str) -> Result<String, PipelineError> {
        let lock = self.document_lock(doc_id);
        let _guard = lock.lock().await;
        self.anonymize_locked(doc_id).await
    }

    pub async fn structure(&self, doc_id: &str) -> Result<String, PipelineError> {
        let lock = self.document_lock(doc_id);
        let _guard = lock.lock().await;
        self.structure_locked(doc_id).await
    }

    pub async fn enrich(&self, doc_id: &str) -> Result<String, PipelineError> {
        let lock = self.document_lock(doc_id);
        let _guard = lock.lock().await;
        self.enrich_locked(doc_id).await
    }

    /// Drive every stage in order, skipping the ones already completed
    pub async fn run(&self, doc_id: &str) -> Result<DocumentRecord, PipelineError> {
        self.run_through(doc_id, ProcessMode::Full).await
    }

    /// Ingest `bytes` and run it as far as `mode` asks
    pub async fn process(
        &self,
        bytes: &[u8],
        filename: &str,
        mode: ProcessMode,
        options: &IngestOptions,
    ) -> Result<ProcessOutput, PipelineError> {
        let doc_id = self.ingest(bytes, filename, options).await?;
        let record = self.run_through(&doc_id, mode).await?;
        let output = self.latest_output(&record).await?;
        Ok(ProcessOutput {
            doc_id,
            text_key: record.text_key,
            anonymized_key: record.anonymized_key,
            json_key: record.json_key,
            output,
        })
    }

    pub async fn status(&self, doc_id: &str) -> Result<DocumentRecord, PipelineError> {
        self.load(doc_id).await
    }

    pub async fn documents(&self) -> Result<Vec<DocumentRecord>, PipelineError> {
        Ok(self.metadata.list().await?)
    }

    async fn run_through(
        &self,
        doc_id: &str,
        mode: ProcessMode,
    ) -> Result<DocumentRecord, PipelineError> {
        let lock = self.document_lock(doc_id);
        let _guard = lock.lock().await;

        for stage in Stage::ORDER.into_iter().filter(|s| mode.runs(*s)) {
            match stage {
                Stage::Extraction => self.extract_locked(doc_id).await?,
                Stage::Anonymization => self.anonymize_locked(doc_id).await?,
                Stage::Structuring => self.structure_locked(doc_id).await?,
                Stage::Enrichment => self.enrich_locked(doc_id).await?,
            };
        }
        self.load(doc_id).await
    }

    async fn extract_locked(&self, doc_id: &str) -> Result<String, PipelineError> {
        let record = self.load(doc_id).await?;
        if let Some(key) = record.text_key {
            info!("Document {}: text already extracted, skipping", doc_id);
            return Ok(key);
        }

        let result = async {
            let bytes = self.objects.get(&record.bucket, &record.original_key).await?;
            let suffix = Path::new(&record.original_key)
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| format!(".{}", e))
                .unwrap_or_default();
            let staged = tempfile::Builder::new()
                .prefix("bloodwork-")
                .suffix(&suffix)
                .tempfile()?;
            tokio::fs::write(staged.path(), &bytes).await?;

            info!("Document {}: extracting text", doc_id);
            let extraction = self
                .extractor
                .extract_detailed(staged.path(), record.language.as_deref())
                .await;
            info!(
                "Document {}: extracted {} chars ({:?}, {} pages)",
                doc_id,
                extraction.text.chars().count(),
                extraction.method,
                extraction.pages.len()
            );

            let key = keys::text_key(doc_id);
            let etag = self
                .put(&self.bronze_bucket, &key, extraction.text.as_bytes(), "text/plain")
                .await?;
            self.metadata
                .update(
                    doc_id,
                    RecordUpdate::status(DocumentStatus::Processed)
                        .with_text_key(&key)
                        .with_etag_text(etag),
                )
                .await?;
            Ok::<_, PipelineError>(key)
        }
        .await;
        self.settle(doc_id, Stage::Extraction.as_str(), result).await
    }

    async fn anonymize_locked(&self, doc_id: &str) -> Result<String, PipelineError> {
        let record = self.load(doc_id).await?;
        if let Some(key) = record.anonymized_key {
            info!("Document {}: already anonymized, skipping", doc_id);
            return Ok(key);
        }
        let Some(text_key) = record.text_key else {
            return Err(PipelineError::MissingInput {
                stage: Stage::Anonymization,
                doc_id: doc_id.to_string(),
                missing: "text_key",
            });
        };

        let result = async {
            let text = self.get_text(&self.bronze_bucket, &text_key).await?;
            let anonymized = self
                .anonymizer
                .anonymize(&text)
                .await
                .map_err(|e| PipelineError::stage(Stage::Anonymization, doc_id, e))?;
            info!(
                "Document {}: anonymized with {} ({} pattern replacements)",
                doc_id,
                self.anonymizer.name(),
                anonymized.total_replacements()
            );

            let key = keys::anonymized_key(doc_id);
            self.put(&self.bronze_bucket, &key, anonymized.text.as_bytes(), "text/plain")
                .await?;
            self.metadata
                .update(
                    doc_id,
                    RecordUpdate::status(DocumentStatus::Anonymized).with_anonymized_key(&key),
                )
                .await?;
            Ok::<_, PipelineError>(key)
        }
        .await;
        self.settle(doc_id, Stage::Anonymization.as_str(), result).await
    }

    async fn structure_locked(&self, doc_id: &str) -> Result<String, PipelineError> {
        let record = self.load(doc_id).await?;
        if let Some(key) = record.json_key {
            info!("Document {}: already structured, skipping", doc_id);
            return Ok(key);
        }
        let Some(anonymized_key) = record.anonymized_key else {
            return Err(PipelineError::MissingInput {
                stage: Stage::Structuring,
                doc_id: doc_id.to_string(),
                missing: "anonymized_key",
            });
        };

        let result = async {
            let text = self.get_text(&self.bronze_bucket, &anonymized_key).await?;
            let results = self
                .structurer
                .structure(&text)
                .await
                .map_err(|e| PipelineError::stage(Stage::Structuring, doc_id, e))?;

            let key = keys::json_key(doc_id);
            let body = serde_json::to_vec_pretty(&results)?;
            self.put(&self.silver_bucket, &key, &body, "application/json")
                .await?;
            self.metadata
                .update(
                    doc_id,
                    RecordUpdate::status(DocumentStatus::JsonSerialized).with_json_key(&key),
                )
                .await?;
            info!("Document {}: stored {} lab items", doc_id, results.tests.len());
            Ok::<_, PipelineError>(key)
        }
        .await;
        self.settle(doc_id, Stage::Structuring.as_str(), result).await
    }

    async fn enrich_locked(&self, doc_id: &str) -> Result<String, PipelineError> {
        let record = self.load(doc_id).await?;
        if let Some(key) = record.enriched_key {
            info!("Document {}: codes already validated, skipping", doc_id);
            return Ok(key);
        }
        let Some(json_key) = record.json_key else {
            return Err(PipelineError::MissingInput {
                stage: Stage::Enrichment,
                doc_id: doc_id.to_string(),
                missing: "json_key",
            });
        };

        let result = async {
            let body = self.objects.get(&self.silver_bucket, &json_key).await?;
            let results: LaboratoryResults = serde_json::from_slice(&body)?;
            let enriched = self
                .enricher
                .enrich(results)
                .await
                .map_err(|e| PipelineError::stage(Stage::Enrichment, doc_id, e))?;

            let body = serde_json::to_vec_pretty(&enriched)?;
            self.put(&self.silver_bucket, &json_key, &body, "application/json")
                .await?;
            let coverage = serde_json::to_value(enriched.coverage())?;
            self.metadata
                .update(
                    doc_id,
                    RecordUpdate::status(DocumentStatus::LoincValidated)
                        .with_enriched_key(&json_key)
                        .with_lab_cache(coverage),
                )
                .await?;
            Ok::<_, PipelineError>(json_key.clone())
        }
        .await;
        self.settle(doc_id, Stage::Enrichment.as_str(), result).await
    }

    async fn load(&self, doc_id: &str) -> Result<DocumentRecord, PipelineError> {
        self.metadata
            .read(doc_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(doc_id.to_string()))
    }

    /// Record a failure on the document before handing it back
    async fn settle<T>(
        &self,
        doc_id: &str,
        step: &str,
        result: Result<T, PipelineError>,
    ) -> Result<T, PipelineError> {
        let err = match result {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if err.is_recorded() {
            error!("Document {}: {} failed: {}", doc_id, step, err);
            if let Err(store_err) = self
                .metadata
                .update(doc_id, RecordUpdate::failed(err.to_string()))
                .await
            {
                error!("Document {}: could not record failure: {}", doc_id, store_err);
            }
        }
        Err(err)
    }

    /// Put into `bucket`, creating it first; returns the etag
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<String, PipelineError> {
        self.objects.ensure_bucket(bucket).await?;
        let put = self.objects.put(bucket, key, bytes, content_type).await?;
        Ok(put.etag)
    }

    async fn get_text(&self, bucket: &str, key: &str) -> Result<String, PipelineError> {
        let bytes = self.objects.get(bucket, key).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    async fn latest_output(&self, record: &DocumentRecord) -> Result<Value, PipelineError> {
        if let Some(key) = &record.json_key {
            let body = self.objects.get(&self.silver_bucket, key).await?;
            return Ok(serde_json::from_slice(&body)?);
        }
        if let Some(key) = &record.anonymized_key {
            return Ok(Value::String(self.get_text(&self.bronze_bucket, key).await?));
        }
        Ok(Value::Null)
    }

    /// Per-document lock; idle entries are dropped as new ones are handed out
    fn document_lock(&self, doc_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry(doc_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}
