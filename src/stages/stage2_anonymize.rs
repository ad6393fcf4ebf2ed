use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::StageError;
use crate::config::ConfigError;
use crate::heuristics::{PatternEngine, RegexScrubber};
use crate::llm::prompts::{
    ANONYMIZATION_VARIANTS, anonymization_system_prompt, anonymization_user_prompt,
};
use crate::llm::{
    CandidateKind, CompletionRequest, ModelClient, RetryOutcome, RetryPolicy, ValidityClassifier,
    ValidityContext, retry_with_variants,
};
use crate::models::AnonymizedText;

/// Which anonymization strategy the pipeline uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnonymizationMode {
    /// Model rewrite with retries
    #[default]
    Model,
    /// Scored pattern recognizers, falling back to regexes
    Patterns,
    /// Regex scrubber only
    Regex,
}

impl AnonymizationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnonymizationMode::Model => "model",
            AnonymizationMode::Patterns => "patterns",
            AnonymizationMode::Regex => "regex",
        }
    }
}

impl FromStr for AnonymizationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "model" | "llm" | "rewrite" => Ok(Self::Model),
            "patterns" | "pattern" | "presidio" => Ok(Self::Patterns),
            "regex" => Ok(Self::Regex),
            other => Err(ConfigError::UnknownMode {
                variable: "ANONYMIZATION_MODE",
                value: other.to_string(),
            }),
        }
    }
}

/// Removes personally identifying information from extracted text
#[async_trait]
pub trait Anonymizer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn anonymize(&self, text: &str) -> Result<AnonymizedText, StageError>;
}

pub struct PatternAnonymizer {
    engine: PatternEngine,
}

impl PatternAnonymizer {
    pub fn new(engine: PatternEngine) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl Anonymizer for PatternAnonymizer {
    fn name(&self) -> &'static str {
        "patterns"
    }

    async fn anonymize(&self, text: &str) -> Result<AnonymizedText, StageError> {
        Ok(self.engine.anonymize(text))
    }
}

#[derive(Default)]
pub struct RegexAnonymizer {
    scrubber: RegexScrubber,
}

impl RegexAnonymizer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Anonymizer for RegexAnonymizer {
    fn name(&self) -> &'static str {
        "regex"
    }

    async fn anonymize(&self, text: &str) -> Result<AnonymizedText, StageError> {
        Ok(self.scrubber.scrub(text))
    }
}

/// Model rewrite of the whole text with PII removed.
///
/// Classifier rejections never fail the stage: after the last attempt the
/// last candidate is returned with a warning. Only a backend failure on every
/// attempt is an error.
pub struct ModelRewriteAnonymizer {
    model: Arc<dyn ModelClient>,
    classifier: ValidityClassifier,
    retry: RetryPolicy,
    prefilter: Option<RegexScrubber>,
    max_tokens: u32,
}

impl ModelRewriteAnonymizer {
    pub fn new(model: Arc<dyn ModelClient>, retry: RetryPolicy) -> Self {
        Self {
            model,
            classifier: ValidityClassifier::default(),
            retry: retry.best_effort(),
            prefilter: None,
            max_tokens: 4096,
        }
    }

    /// Scrub with regexes before the model sees the text
    pub fn with_prefilter(mut self) -> Self {
        self.prefilter = Some(RegexScrubber::new());
        self
    }

    pub fn with_classifier(mut self, classifier: ValidityClassifier) -> Self {
        self.classifier = classifier;
        self
    }
}

#[async_trait]
impl Anonymizer for ModelRewriteAnonymizer {
    fn name(&self) -> &'static str {
        "model"
    }

    async fn anonymize(&self, text: &str) -> Result<AnonymizedText, StageError> {
        let prefiltered = self.prefilter.map(|scrubber| scrubber.scrub(text));
        let input = prefiltered.as_ref().map(|p| p.text.as_str()).unwrap_or(text);
        let context = ValidityContext::new(CandidateKind::AnonymizedText).with_original(input);

        let outcome = retry_with_variants(
            &self.retry,
            "anonymize",
            ANONYMIZATION_VARIANTS,
            |variant| {
                let request = CompletionRequest::new(anonymization_user_prompt(variant, input))
                    .with_system(anonymization_system_prompt(variant))
                    .with_temperature(0.0)
                    .with_max_tokens(self.max_tokens);
                let model = &self.model;
                async move { model.complete(request).await }
            },
            |candidate: &String| self.classifier.check(candidate, context),
        )
        .await?;

        let text = match outcome {
            RetryOutcome::Accepted { value, attempt } => {
                info!("Anonymization accepted on attempt {}", attempt);
                value
            }
            RetryOutcome::BestEffort {
                value,
                attempts,
                reasons,
            } => {
                warn!(
                    "Anonymization failed validation after {} attempts ({:?}); returning last result",
                    attempts, reasons
                );
                value
            }
        };

        let mut result = AnonymizedText::new(text.trim());
        if let Some(prefiltered) = prefiltered {
            result.merge_stats(&prefiltered.stats);
        }
        Ok(result)
    }
}

/// Anonymizer for `mode`. If the pattern engine cannot be built, the regex
/// scrubber takes its place.
pub fn build_anonymizer(
    mode: AnonymizationMode,
    model: Arc<dyn ModelClient>,
    retry: RetryPolicy,
    prefilter: bool,
) -> Arc<dyn Anonymizer> {
    match mode {
        AnonymizationMode::Model => {
            let anonymizer = ModelRewriteAnonymizer::new(model, retry);
            if prefilter {
                Arc::new(anonymizer.with_prefilter())
            } else {
                Arc::new(anonymizer)
            }
        }
        AnonymizationMode::Patterns => match PatternEngine::new() {
            Ok(engine) => Arc::new(PatternAnonymizer::new(engine)),
            Err(e) => {
                warn!("Pattern engine unavailable ({}); using regex scrubber", e);
                Arc::new(RegexAnonymizer::new())
            }
        },
        AnonymizationMode::Regex => Arc::new(RegexAnonymizer::new()),
    }
}
