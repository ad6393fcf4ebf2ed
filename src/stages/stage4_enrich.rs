use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::StageError;
use super::stage3_structure::lab_results_schema;
use crate::config::ConfigError;
use crate::heuristics::CodeMatcher;
use crate::llm::prompts::{ENRICHMENT_VARIANTS, enrichment_system_prompt, enrichment_user_prompt};
use crate::llm::{
    CandidateKind, CompletionRequest, ModelClient, RetryPolicy, ValidityClassifier,
    ValidityContext, retry_with_variants,
};
use crate::models::{LabItem, LaboratoryResults};

/// How lab codes are assigned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnrichmentMode {
    /// One gated model call
    #[default]
    Model,
    /// Fuzzy matching against the built-in reference table only
    ReferenceTable,
    /// Reference table first; the model fills what is still uncoded
    ReferenceTableThenModel,
}

impl EnrichmentMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrichmentMode::Model => "model",
            EnrichmentMode::ReferenceTable => "reference",
            EnrichmentMode::ReferenceTableThenModel => "reference-then-model",
        }
    }
}

impl FromStr for EnrichmentMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "model" | "llm" => Ok(Self::Model),
            "reference" | "reference-table" | "fuzzy" => Ok(Self::ReferenceTable),
            "reference-then-model" | "reference-table-then-model" => {
                Ok(Self::ReferenceTableThenModel)
            }
            other => Err(ConfigError::UnknownMode {
                variable: "ENRICHMENT_MODE",
                value: other.to_string(),
            }),
        }
    }
}

/// Validates and fills standardized lab codes.
///
/// Unlike the earlier stages this one is not best-effort: a rejected or
/// failed model call is returned as an error.
pub struct Enricher {
    model: Arc<dyn ModelClient>,
    matcher: CodeMatcher,
    classifier: ValidityClassifier,
    retry: RetryPolicy,
    mode: EnrichmentMode,
    max_tokens: u32,
}

impl Enricher {
    pub fn new(model: Arc<dyn ModelClient>, retry: RetryPolicy, mode: EnrichmentMode) -> Self {
        Self {
            model,
            matcher: CodeMatcher::default(),
            classifier: ValidityClassifier::default(),
            retry: retry.raising(),
            mode,
            max_tokens: 4096,
        }
    }

    pub fn with_matcher(mut self, matcher: CodeMatcher) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn mode(&self) -> EnrichmentMode {
        self.mode
    }

    pub async fn enrich(&self, results: LaboratoryResults) -> Result<LaboratoryResults, StageError> {
        if results.is_empty() {
            info!("Enrichment: no lab items, nothing to code");
            return Ok(results);
        }

        let mut results = results;
        match self.mode {
            EnrichmentMode::ReferenceTable => {
                let filled = self.matcher.enrich(&mut results);
                info!("Enrichment: reference table coded {} items", filled);
            }
            EnrichmentMode::Model => {
                let coded = self.model_codes(&results).await?;
                merge_codes(&mut results, &coded, true);
            }
            EnrichmentMode::ReferenceTableThenModel => {
                let filled = self.matcher.enrich(&mut results);
                info!("Enrichment: reference table coded {} items", filled);
                if results.tests.iter().any(|t| !t.has_code()) {
                    let coded = self.model_codes(&results).await?;
                    merge_codes(&mut results, &coded, false);
                }
            }
        }

        let coverage = results.coverage();
        info!(
            "Enrichment: {}/{} items coded ({:.1}%)",
            coverage.tests_with_loinc, coverage.total_tests, coverage.coverage_percentage
        );
        Ok(results)
    }

    async fn model_codes(&self, results: &LaboratoryResults) -> Result<LaboratoryResults, StageError> {
        let input = serde_json::to_string_pretty(results)
            .map_err(|e| StageError::Schema(e.to_string()))?;
        let schema = lab_results_schema();
        let context = ValidityContext::new(CandidateKind::StructuredRecord);

        let outcome = retry_with_variants(
            &self.retry,
            "enrich",
            ENRICHMENT_VARIANTS,
            |variant| {
                let request = CompletionRequest::new(enrichment_user_prompt(&input))
                    .with_system(enrichment_system_prompt(variant))
                    .with_temperature(0.0)
                    .with_max_tokens(self.max_tokens);
                let model = &self.model;
                let schema = &schema;
                async move { model.complete_structured(request, schema).await }
            },
            |candidate: &Value| self.classifier.check(&candidate.to_string(), context),
        )
        .await?;

        LaboratoryResults::from_model_value(&outcome.into_value()).map_err(StageError::Schema)
    }
}

/// Copy code fields from the model's answer onto the original items.
///
/// Items are paired by position when the counts agree, otherwise by
/// case-insensitive parameter name. Values, units and ranges are never
/// taken from the model. With `overwrite` false, existing codes are kept.
fn merge_codes(results: &mut LaboratoryResults, coded: &LaboratoryResults, overwrite: bool) {
    let by_position = results.tests.len() == coded.tests.len();
    if !by_position {
        warn!(
            "Enrichment: model returned {} items for {} inputs, pairing by name",
            coded.tests.len(),
            results.tests.len()
        );
    }

    let mut merged = 0;
    for (index, item) in results.tests.iter_mut().enumerate() {
        if item.has_code() && !overwrite {
            continue;
        }
        let source = if by_position {
            coded.tests.get(index)
        } else {
            let name = item.parameter.trim().to_lowercase();
            coded
                .tests
                .iter()
                .find(|c| c.parameter.trim().to_lowercase() == name)
        };
        if let Some(source) = source.filter(|s| s.has_code()) {
            copy_code(item, source);
            merged += 1;
        }
    }
    debug!("Enrichment: merged codes onto {} items", merged);
}

fn copy_code(item: &mut LabItem, source: &LabItem) {
    item.loinc_code = source.loinc_code.as_ref().map(|c| c.trim().to_string());
    item.loinc_display = source.loinc_display.clone();
    item.loinc_class = source.loinc_class.clone();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::fake::{Reply, ScriptedModel};
    use crate::llm::RetryError;
    use crate::models::LabValue;
    use serde_json::json;

    fn results() -> LaboratoryResults {
        let mut hemoglobin = LabItem::new("Hemoglobin", LabValue::Number(13.5));
        hemoglobin.unit = Some("g/dL".to_string());
        LaboratoryResults {
            tests: vec![hemoglobin, LabItem::new("Mystery Marker", LabValue::Number(2.0))],
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy::new(2, None)
    }

    #[test]
    fn test_mode_parsing() {
        assert_eq!("reference".parse::<EnrichmentMode>().unwrap(), EnrichmentMode::ReferenceTable);
        assert_eq!(
            "reference-then-model".parse::<EnrichmentMode>().unwrap(),
            EnrichmentMode::ReferenceTableThenModel
        );
        assert!("loinc".parse::<EnrichmentMode>().is_err());
    }

    #[tokio::test]
    async fn test_reference_table_mode_skips_model() {
        let model = Arc::new(ScriptedModel::new(vec![]));
        let enriched = Enricher::new(model.clone(), policy(), EnrichmentMode::ReferenceTable)
            .enrich(results())
            .await
            .unwrap();
        assert_eq!(enriched.tests[0].loinc_code.as_deref(), Some("718-7"));
        assert!(enriched.tests[1].loinc_code.is_none());
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_model_codes_merge_without_touching_values() {
        let model = Arc::new(ScriptedModel::new(vec![Reply::Json(json!({
            "tests": [
                {"parameter": "Hemoglobin", "value": 99, "loinc_code": "718-7", "loinc_display": "Hemoglobin [Mass/volume] in Blood"},
                {"parameter": "Mystery Marker", "value": 2, "loinc_code": null, "loinc_display": null}
            ]
        }))]));
        let enriched = Enricher::new(model.clone(), policy(), EnrichmentMode::Model)
            .enrich(results())
            .await
            .unwrap();

        assert_eq!(enriched.tests[0].loinc_code.as_deref(), Some("718-7"));
        assert_eq!(enriched.tests[0].value, LabValue::Number(13.5));
        assert_eq!(enriched.tests[0].unit.as_deref(), Some("g/dL"));
        assert!(enriched.tests[1].loinc_code.is_none());
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_backend_failure_is_fatal() {
        let model = Arc::new(ScriptedModel::new(vec![Reply::Fail]));
        let err = Enricher::new(model.clone(), policy(), EnrichmentMode::Model)
            .enrich(results())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Retry(RetryError::BackendFailed { .. })));
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test]
    async fn test_rejected_output_is_fatal() {
        let model = Arc::new(ScriptedModel::new(vec![Reply::Json(json!({"tests": []}))]));
        let err = Enricher::new(model, policy(), EnrichmentMode::Model)
            .enrich(results())
            .await
            .unwrap_err();
        assert!(matches!(err, StageError::Retry(RetryError::Rejected { .. })));
    }

    #[tokio::test]
    async fn test_reference_then_model_keeps_table_codes() {
        let model = Arc::new(ScriptedModel::new(vec![Reply::Json(json!({
            "tests": [
                {"parameter": "Hemoglobin", "value": 13.5, "loinc_code": "0000-0", "loinc_display": "wrong"},
                {"parameter": "Mystery Marker", "value": 2, "loinc_code": "12345-6", "loinc_display": "Mystery"}
            ]
        }))]));
        let enriched = Enricher::new(model, policy(), EnrichmentMode::ReferenceTableThenModel)
            .enrich(results())
            .await
            .unwrap();
        assert_eq!(enriched.tests[0].loinc_code.as_deref(), Some("718-7"));
        assert_eq!(enriched.tests[1].loinc_code.as_deref(), Some("12345-6"));
    }

    #[test]
    fn test_merge_pairs_by_name_when_counts_differ() {
        let mut original = results();
        let coded = LaboratoryResults {
            tests: vec![{
                let mut item = LabItem::new("hemoglobin", LabValue::Number(1.0));
                item.loinc_code = Some(" 718-7 ".to_string());
                item
            }],
        };
        merge_codes(&mut original, &coded, true);
        assert_eq!(original.tests[0].loinc_code.as_deref(), Some("718-7"));
        assert_eq!(original.tests[0].value, LabValue::Number(13.5));
        assert!(original.tests[1].loinc_code.is_none());
    }
}
