//! Directory batch driver: one task per report, bounded by a semaphore.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::pipeline::{IngestOptions, Pipeline, PipelineError, ProcessMode};

/// File extensions the pipeline can read
pub const PROCESSABLE_EXTENSIONS: &[&str] = &["pdf", "png", "jpg", "jpeg", "tiff", "tif", "bmp"];

#[derive(Debug, Clone)]
pub struct BatchOptions {
    /// Concurrent documents
    pub workers: usize,
    pub mode: ProcessMode,
    pub ingest: IngestOptions,
    /// Only list what would be processed
    pub dry_run: bool,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            workers: 2,
            mode: ProcessMode::Full,
            ingest: IngestOptions::default(),
            dry_run: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FileOutcome {
    Succeeded { doc_id: String },
    Duplicate { existing_id: String },
    Failed { error: String },
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    #[serde(flatten)]
    pub outcome: FileOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchSummary {
    pub succeeded: usize,
    pub duplicate: usize,
    pub failed: usize,
    pub files: Vec<FileReport>,
}

impl BatchSummary {
    fn record(&mut self, report: FileReport) {
        match report.outcome {
            FileOutcome::Succeeded { .. } => self.succeeded += 1,
            FileOutcome::Duplicate { .. } => self.duplicate += 1,
            FileOutcome::Failed { .. } => self.failed += 1,
            FileOutcome::Skipped => {}
        }
        self.files.push(report);
    }
}

pub fn is_processable(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| PROCESSABLE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Processable files directly inside `dir`, sorted by path
pub fn collect_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file() && is_processable(path))
        .collect();
    files.sort();
    Ok(files)
}

/// Run every processable file in `dir` through the pipeline.
///
/// Per-file failures are reported in the summary and never stop the batch.
pub async fn run_batch(
    pipeline: Arc<Pipeline>,
    dir: &Path,
    options: &BatchOptions,
) -> std::io::Result<BatchSummary> {
    let files = collect_files(dir)?;
    info!("Batch: {} files in {}", files.len(), dir.display());

    let mut summary = BatchSummary::default();
    if options.dry_run {
        for path in files {
            info!("Would process {}", path.display());
            summary.record(FileReport {
                path,
                outcome: FileOutcome::Skipped,
            });
        }
        return Ok(summary);
    }

    let semaphore = Arc::new(Semaphore::new(options.workers.max(1)));
    let mut tasks = JoinSet::new();
    for (index, path) in files.into_iter().enumerate() {
        let pipeline = pipeline.clone();
        let semaphore = semaphore.clone();
        let mode = options.mode;
        let ingest = options.ingest.clone();
        tasks.spawn(async move {
            let outcome = match semaphore.acquire_owned().await {
                Ok(_permit) => process_file(&pipeline, &path, mode, &ingest).await,
                Err(e) => FileOutcome::Failed {
                    error: e.to_string(),
                },
            };
            (index, FileReport { path, outcome })
        });
    }

    let mut reports = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(report) => reports.push(report),
            Err(e) => error!("Batch worker panicked: {}", e),
        }
    }
    reports.sort_by_key(|(index, _)| *index);
    for (_, report) in reports {
        summary.record(report);
    }

    info!(
        "Batch complete: {} succeeded, {} duplicate, {} failed",
        summary.succeeded, summary.duplicate, summary.failed
    );
    Ok(summary)
}

async fn process_file(
    pipeline: &Pipeline,
    path: &Path,
    mode: ProcessMode,
    ingest: &IngestOptions,
) -> FileOutcome {
    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Could not read {}: {}", path.display(), e);
            return FileOutcome::Failed {
                error: e.to_string(),
            };
        }
    };
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    match pipeline.process(&bytes, &filename, mode, ingest).await {
        Ok(output) => {
            info!("{} -> {}", filename, output.doc_id);
            FileOutcome::Succeeded {
                doc_id: output.doc_id,
            }
        }
        Err(PipelineError::Duplicate { existing_id, .. }) => {
            info!("{} already ingested as {}, skipping", filename, existing_id);
            FileOutcome::Duplicate { existing_id }
        }
        Err(e) => {
            error!("{} failed: {}", filename, e);
            FileOutcome::Failed {
                error: e.to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collects_sorted_processable_files() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["b.PDF", "a.png", "notes.txt", "c.jpeg"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        std::fs::create_dir(dir.path().join("nested.pdf")).unwrap();

        let names: Vec<String> = collect_files(dir.path())
            .unwrap()
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.png", "b.PDF", "c.jpeg"]);
    }
}
