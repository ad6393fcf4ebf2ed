use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use bloodwork::batch::{BatchOptions, run_batch};
use bloodwork::{Config, DocumentRecord, IngestOptions, Pipeline, ProcessMode};

#[derive(Parser)]
#[command(name = "bloodwork")]
#[command(author, version, about = "Blood test report extraction, anonymization and coding pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    /// Store the upload only
    Ingest,
    /// Extract and anonymize
    Anonymize,
    /// Extract, anonymize and structure
    Structure,
    /// All stages including code enrichment
    Full,
}

impl From<Mode> for ProcessMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Ingest => ProcessMode::IngestOnly,
            Mode::Anonymize => ProcessMode::ThroughAnonymization,
            Mode::Structure => ProcessMode::ThroughStructuring,
            Mode::Full => ProcessMode::Full,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Process a single report (PDF or image)
    Process {
        /// Input report file
        #[arg(short, long)]
        input: PathBuf,

        /// How far to run the pipeline
        #[arg(long, value_enum, default_value = "full")]
        mode: Mode,

        /// Language hint for extraction and OCR (e.g. "mkd+eng")
        #[arg(long)]
        language: Option<String>,

        /// Recorded as the uploader on the document
        #[arg(long)]
        uploaded_by: Option<String>,

        /// Write the pipeline output JSON here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Verbose output
        #[arg(short, long)]
        verbose: bool,
    },

    /// Process every report in a directory
    Batch {
        /// Directory with reports (not searched recursively)
        #[arg(short, long)]
        dir: PathBuf,

        /// Documents processed concurrently
        #[arg(long, default_value = "2")]
        workers: usize,

        #[arg(long, value_enum, default_value = "full")]
        mode: Mode,

        #[arg(long)]
        language: Option<String>,

        /// List the files without processing them
        #[arg(long)]
        dry_run: bool,

        #[arg(short, long)]
        verbose: bool,
    },

    /// Re-run the missing stages of an existing document
    Resume {
        doc_id: String,

        #[arg(short, long)]
        verbose: bool,
    },

    /// Show one document record, or list all of them
    Status {
        doc_id: Option<String>,

        #[arg(short, long)]
        verbose: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Process {
            input,
            mode,
            language,
            uploaded_by,
            output,
            verbose,
        } => {
            setup_logging(verbose);
            let options = IngestOptions {
                language,
                uploaded_by,
            };
            process_report(input, mode.into(), options, output).await
        }
        Commands::Batch {
            dir,
            workers,
            mode,
            language,
            dry_run,
            verbose,
        } => {
            setup_logging(verbose);
            let options = BatchOptions {
                workers,
                mode: mode.into(),
                ingest: IngestOptions {
                    language,
                    uploaded_by: None,
                },
                dry_run,
            };
            batch_process(dir, options).await
        }
        Commands::Resume { doc_id, verbose } => {
            setup_logging(verbose);
            resume_document(&doc_id).await
        }
        Commands::Status { doc_id, verbose } => {
            setup_logging(verbose);
            show_status(doc_id.as_deref()).await
        }
    }
}

fn setup_logging(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .ok();
}

fn build_pipeline() -> Result<Pipeline> {
    let config = Config::from_env().context("Invalid configuration")?;
    info!(
        "Using {} model {} (anonymization: {}, enrichment: {})",
        config.model.provider,
        config.model.model_name,
        config.anonymization_mode.as_str(),
        config.enrichment_mode.as_str()
    );
    Pipeline::from_config(&config).context("Failed to open storage or model backend")
}

async fn process_report(
    input: PathBuf,
    mode: ProcessMode,
    options: IngestOptions,
    output: Option<PathBuf>,
) -> Result<()> {
    let pipeline = build_pipeline()?;

    info!("Loading report from {:?}", input);
    let bytes = tokio::fs::read(&input)
        .await
        .with_context(|| format!("Failed to read {}", input.display()))?;
    let filename = input
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .context("Input path has no file name")?;

    let result = pipeline
        .process(&bytes, &filename, mode, &options)
        .await
        .with_context(|| format!("Processing {} failed", filename))?;

    let json = serde_json::to_string_pretty(&result)?;
    match output {
        Some(path) => {
            std::fs::write(&path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!("Output written to {:?}", path);
        }
        None => println!("{}", json),
    }
    Ok(())
}

async fn batch_process(dir: PathBuf, options: BatchOptions) -> Result<()> {
    let pipeline = Arc::new(build_pipeline()?);
    let summary = run_batch(pipeline, &dir, &options)
        .await
        .with_context(|| format!("Failed to read directory {}", dir.display()))?;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    if summary.failed > 0 {
        anyhow::bail!("{} of {} files failed", summary.failed, summary.files.len());
    }
    Ok(())
}

async fn resume_document(doc_id: &str) -> Result<()> {
    let pipeline = build_pipeline()?;
    let record = pipeline
        .run(doc_id)
        .await
        .with_context(|| format!("Document {} did not complete", doc_id))?;
    print_record(&record);
    Ok(())
}

async fn show_status(doc_id: Option<&str>) -> Result<()> {
    let pipeline = build_pipeline()?;
    match doc_id {
        Some(id) => print_record(&pipeline.status(id).await?),
        None => {
            let records = pipeline.documents().await?;
            println!("{} documents", records.len());
            for record in records {
                println!(
                    "{}  {:<16} {}",
                    record.id,
                    record.status.as_str(),
                    record.filename
                );
            }
        }
    }
    Ok(())
}

fn print_record(record: &DocumentRecord) {
    println!("Document {}", record.id);
    println!("==================");
    println!("File: {} ({}, {} bytes)", record.filename, record.content_type, record.size_bytes);
    println!("Status: {}", record.status);
    if let Some(error) = &record.error {
        println!("Error: {}", error);
    }
    let pointer = |p: &Option<String>| p.clone().unwrap_or_else(|| "-".to_string());
    println!("Text: {}", pointer(&record.text_key));
    println!("Anonymized: {}", pointer(&record.anonymized_key));
    println!("Lab results: {}", pointer(&record.json_key));
    if let Some(cache) = &record.lab_cache {
        println!("Coverage: {}", cache);
    }
}
