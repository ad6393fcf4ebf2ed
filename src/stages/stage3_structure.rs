use std::sync::Arc;

use serde_json::{Value, json};
use tracing::{info, warn};

use super::StageError;
use crate::llm::prompts::{STRUCTURING_VARIANTS, structuring_system_prompt, structuring_user_prompt};
use crate::llm::{
    CandidateKind, CompletionRequest, ModelClient, RetryOutcome, RetryPolicy, StructuredSchema,
    ValidityClassifier, ValidityContext, retry_with_variants,
};
use crate::models::LaboratoryResults;

pub fn lab_results_schema() -> StructuredSchema {
    StructuredSchema::new(
        "laboratory_results",
        "Laboratory test results in document order",
        LaboratoryResults::json_schema(),
    )
}

/// Wrap a bare array or an `items` list so the record check sees `tests`
fn as_record_json(value: &Value) -> String {
    match value {
        Value::Array(_) => json!({ "tests": value }).to_string(),
        Value::Object(map) if !map.contains_key("tests") => match map.get("items") {
            Some(items) => json!({ "tests": items }).to_string(),
            None => value.to_string(),
        },
        _ => value.to_string(),
    }
}

/// Free text to [`LaboratoryResults`] via schema-constrained completions
pub struct Structurer {
    model: Arc<dyn ModelClient>,
    classifier: ValidityClassifier,
    retry: RetryPolicy,
    max_tokens: u32,
}

impl Structurer {
    pub fn new(model: Arc<dyn ModelClient>, retry: RetryPolicy) -> Self {
        Self {
            model,
            classifier: ValidityClassifier::default(),
            retry: retry.best_effort(),
            max_tokens: 4096,
        }
    }

    pub fn with_classifier(mut self, classifier: ValidityClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    /// Structure `text`. An output that never validates is still returned
    /// after the last attempt; only an unparseable shape or a backend failure
    /// on every attempt is an error.
    pub async fn structure(&self, text: &str) -> Result<LaboratoryResults, StageError> {
        let schema = lab_results_schema();
        let context = ValidityContext::new(CandidateKind::StructuredRecord);

        let outcome = retry_with_variants(
            &self.retry,
            "structure",
            STRUCTURING_VARIANTS,
            |variant| {
                let request = CompletionRequest::new(structuring_user_prompt(variant, text))
                    .with_system(structuring_system_prompt(variant))
                    .with_temperature(0.0)
                    .with_max_tokens(self.max_tokens);
                let model = &self.model;
                let schema = &schema;
                async move { model.complete_structured(request, schema).await }
            },
            |candidate: &Value| self.classifier.check(&as_record_json(candidate), context),
        )
        .await?;

        let raw = match outcome {
            RetryOutcome::Accepted { value, attempt } => {
                info!("Structuring accepted on attempt {}", attempt);
                value
            }
            RetryOutcome::BestEffort {
                value,
                attempts,
                reasons,
            } => {
                warn!(
                    "Structuring failed validation after {} attempts ({:?}); returning last result",
                    attempts, reasons
                );
                value
            }
        };

        let results = LaboratoryResults::from_model_value(&raw).map_err(StageError::Schema)?;
        info!("Structured {} lab items", results.tests.len());
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::fake::{Reply, ScriptedModel};
    use crate::models::LabValue;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, None)
    }

    #[tokio::test]
    async fn test_structures_and_coerces_ranges() {
        let model = Arc::new(ScriptedModel::new(vec![Reply::Json(json!({
            "tests": [
                {"parameter": "Hemoglobin", "value": "13.5", "reference_min": "12-16", "reference_max": null, "unit": "g/dL"},
                {"parameter": "CRP", "value": "<5", "reference_min": null, "reference_max": 5, "unit": "mg/L"}
            ]
        }))]));
        let results = Structurer::new(model.clone(), policy())
            .structure("Hemoglobin 13.5 g/dL 12-16\nCRP <5 mg/L")
            .await
            .unwrap();

        assert_eq!(results.tests.len(), 2);
        assert_eq!(results.tests[0].value, LabValue::Number(13.5));
        assert_eq!(results.tests[0].reference_min, Some(12.0));
        assert_eq!(results.tests[0].reference_max, Some(16.0));
        assert_eq!(results.tests[1].value, LabValue::Text("<5".to_string()));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_retries_then_returns_last_parsed_result() {
        let model = Arc::new(ScriptedModel::new(vec![
            Reply::Json(json!({"tests": []})),
            Reply::Json(json!({"tests": []})),
            Reply::Json(json!({"tests": [{"parameter": "I'm sorry, I cannot", "value": 1}]})),
        ]));
        let results = Structurer::new(model.clone(), policy())
            .structure("unreadable")
            .await
            .unwrap();

        assert_eq!(model.calls(), 3);
        assert_eq!(results.tests.len(), 1);
        assert_eq!(results.tests[0].parameter, "I'm sorry, I cannot");
    }

    #[tokio::test]
    async fn test_bare_array_is_accepted() {
        let model = Arc::new(ScriptedModel::new(vec![Reply::Json(json!([
            {"parameter": "WBC", "value": 6.1, "units": "10^9/L"}
        ]))]));
        let results = Structurer::new(model.clone(), policy()).structure("WBC 6.1").await.unwrap();
        assert_eq!(results.tests[0].parameter, "WBC");
        assert_eq!(results.tests[0].unit.as_deref(), Some("10^9/L"));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test]
    async fn test_unusable_shape_is_a_schema_error() {
        let model = Arc::new(ScriptedModel::new(vec![Reply::Json(json!("nothing"))]));
        let err = Structurer::new(model, policy()).structure("x").await.unwrap_err();
        assert!(matches!(err, StageError::Schema(_)));
    }

    #[tokio::test]
    async fn test_backend_failure_propagates() {
        let model = Arc::new(ScriptedModel::new(vec![Reply::Fail]));
        let err = Structurer::new(model.clone(), policy()).structure("x").await.unwrap_err();
        assert!(matches!(err, StageError::Retry(_)));
        assert_eq!(model.calls(), 3);
    }
}
