use serde_json::Value;

/// Kind of model output being judged
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateKind {
    ExtractedText,
    AnonymizedText,
    StructuredRecord,
}

/// What the classifier knows about the request that produced a candidate
#[derive(Debug, Clone, Copy)]
pub struct ValidityContext<'a> {
    /// Input the model was asked to transform, when there is one
    pub original: Option<&'a str>,
    pub kind: CandidateKind,
}

impl<'a> ValidityContext<'a> {
    pub fn new(kind: CandidateKind) -> Self {
        Self {
            original: None,
            kind,
        }
    }

    pub fn with_original(mut self, original: &'a str) -> Self {
        self.original = Some(original);
        self
    }
}

/// Result of judging one candidate
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateValidation {
    pub is_valid: bool,
    pub reasons: Vec<String>,
}

impl CandidateValidation {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            reasons: Vec::new(),
        }
    }

    pub fn invalid(reasons: Vec<String>) -> Self {
        Self {
            is_valid: false,
            reasons,
        }
    }
}

/// Configuration for the validity heuristics
#[derive(Debug, Clone)]
pub struct ValidityClassifier {
    /// Lowercase substrings that mark a refusal or apology
    pub refusal_phrases: Vec<String>,
    /// Lowercase terms that mark medical content in anonymized output
    pub medical_terms: Vec<String>,
    /// Shortest acceptable output, in characters
    pub min_chars: usize,
    /// Anonymized output shorter than this fraction of the original is rejected
    pub min_anonymized_ratio: f64,
    /// Extracted text shorter than this must contain a digit or punctuation
    pub short_text_chars: usize,
}

impl Default for ValidityClassifier {
    fn default() -> Self {
        let to_strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            refusal_phrases: to_strings(&[
                "i can't assist",
                "i cannot assist",
                "cannot assist",
                "i can't help",
                "i cannot help",
                "i'm unable to",
                "i am unable to",
                "unable to extract",
                "unable to process",
                "i'm not able",
                "i am not able",
                "cannot extract",
                "cannot process",
                "there is no text",
                "no text to extract",
                "i don't see",
                "i do not see",
                "there doesn't appear",
                "there does not appear",
                "sorry, but",
                "i'm sorry",
                "i apologize",
                "as an ai",
            ]),
            medical_terms: to_strings(&[
                "test",
                "result",
                "value",
                "range",
                "unit",
                "hemoglobin",
                "rbc",
                "wbc",
                "platelet",
            ]),
            min_chars: 10,
            min_anonymized_ratio: 0.1,
            short_text_chars: 50,
        }
    }
}

/// Extra substrings that mark a refused or failed structured field
const FIELD_REFUSALS: &[&str] = &["i can't", "i cannot", "sorry", "unable", "error"];

impl ValidityClassifier {
    pub fn is_valid(&self, candidate: &str, context: ValidityContext<'_>) -> bool {
        self.check(candidate, context).is_valid
    }

    /// Judge a candidate and report every rule it breaks
    pub fn check(&self, candidate: &str, context: ValidityContext<'_>) -> CandidateValidation {
        let mut reasons = Vec::new();
        let trimmed = candidate.trim();

        // 1. Near-empty output
        if trimmed.chars().count() < self.min_chars {
            reasons.push(format!(
                "output too short ({} chars)",
                trimmed.chars().count()
            ));
            return CandidateValidation::invalid(reasons);
        }

        let lower = trimmed.to_lowercase();

        match context.kind {
            CandidateKind::StructuredRecord => {
                self.check_structured(trimmed, &mut reasons);
            }
            CandidateKind::ExtractedText => {
                self.check_refusal(&lower, &mut reasons);
                // 2. Short text should still look like document content
                if trimmed.chars().count() < self.short_text_chars {
                    let has_digit = trimmed.chars().any(|c| c.is_ascii_digit());
                    let has_punct = trimmed.chars().any(|c| matches!(c, '-' | ':' | '/' | '.'));
                    if !has_digit && !has_punct {
                        reasons.push("short output without digits or punctuation".to_string());
                    }
                }
            }
            CandidateKind::AnonymizedText => {
                self.check_refusal(&lower, &mut reasons);
                // 3. Over-deletion
                if let Some(original) = context.original {
                    let floor = original.trim().chars().count() as f64 * self.min_anonymized_ratio;
                    if (trimmed.chars().count() as f64) < floor {
                        reasons.push(format!(
                            "output is under {:.0}% of the original length",
                            self.min_anonymized_ratio * 100.0
                        ));
                    }
                }
                // 4. Medical content must survive
                let has_digit = trimmed.chars().any(|c| c.is_ascii_digit());
                let has_term = self.medical_terms.iter().any(|t| lower.contains(t.as_str()));
                if !has_digit && !has_term {
                    reasons.push("no numbers or medical terms left".to_string());
                }
            }
        }

        if reasons.is_empty() {
            CandidateValidation::valid()
        } else {
            CandidateValidation::invalid(reasons)
        }
    }

    fn check_refusal(&self, lower: &str, reasons: &mut Vec<String>) {
        if let Some(phrase) = self.refusal_phrases.iter().find(|p| lower.contains(p.as_str())) {
            reasons.push(format!("refusal phrasing: '{}'", phrase));
        }
    }

    fn check_structured(&self, candidate: &str, reasons: &mut Vec<String>) {
        let value: Value = match serde_json::from_str(candidate) {
            Ok(value) => value,
            Err(e) => {
                reasons.push(format!("not valid JSON: {}", e));
                return;
            }
        };

        let tests = match value.get("tests").and_then(Value::as_array) {
            Some(tests) if !tests.is_empty() => tests,
            Some(_) => {
                reasons.push("'tests' is empty".to_string());
                return;
            }
            None => {
                reasons.push("missing 'tests' array".to_string());
                return;
            }
        };

        let Some(first) = tests[0].as_object() else {
            reasons.push("first test is not an object".to_string());
            return;
        };

        for field in ["parameter", "value"] {
            match first.get(field) {
                None | Some(Value::Null) => reasons.push(format!("first test is missing '{}'", field)),
                Some(Value::String(s)) if s.trim().is_empty() => {
                    reasons.push(format!("first test has empty '{}'", field))
                }
                _ => {}
            }
        }

        if let Some(parameter) = first.get("parameter").and_then(Value::as_str) {
            let lower = parameter.to_lowercase();
            if let Some(phrase) = FIELD_REFUSALS.iter().find(|p| lower.contains(**p)) {
                reasons.push(format!("refusal phrasing in parameter: '{}'", phrase));
            }
        }

        for item in tests.iter().filter_map(Value::as_object) {
            for field in item.values().filter_map(Value::as_str) {
                let lower = field.to_lowercase();
                if let Some(phrase) = self.refusal_phrases.iter().find(|p| lower.contains(p.as_str())) {
                    reasons.push(format!("refusal phrasing in field value: '{}'", phrase));
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> ValidityClassifier {
        ValidityClassifier::default()
    }

    #[test]
    fn test_rejects_near_empty() {
        let ctx = ValidityContext::new(CandidateKind::ExtractedText);
        assert!(!classifier().is_valid("", ctx));
        assert!(!classifier().is_valid("   abc   ", ctx));
    }

    #[test]
    fn test_rejects_refusals_case_insensitively() {
        let ctx = ValidityContext::new(CandidateKind::ExtractedText);
        assert!(!classifier().is_valid("I'm sorry, but I CANNOT ASSIST with that request.", ctx));
        assert!(!classifier().is_valid("As an AI language model I can only describe images.", ctx));
    }

    #[test]
    fn test_short_extracted_text_needs_document_characters() {
        let ctx = ValidityContext::new(CandidateKind::ExtractedText);
        assert!(!classifier().is_valid("nothing useful here", ctx));
        assert!(classifier().is_valid("Hemoglobin 13.5", ctx));
        assert!(classifier().is_valid("Result: negative", ctx));
    }

    #[test]
    fn test_anonymized_over_deletion() {
        let original = "Patient: John Doe\n".repeat(20) + "Hemoglobin 13.5 g/dL 12-16";
        let ctx = ValidityContext::new(CandidateKind::AnonymizedText).with_original(&original);
        let validation = classifier().check("Hb 13.5 ok", ctx);
        assert!(!validation.is_valid);
        assert!(validation.reasons[0].contains("original length"));

        let ok = "Patient: <NAME>\nHemoglobin 13.5 g/dL 12-16";
        let ctx = ValidityContext::new(CandidateKind::AnonymizedText)
            .with_original("Patient: John Doe\nHemoglobin 13.5 g/dL 12-16");
        assert!(classifier().is_valid(ok, ctx));
    }

    #[test]
    fn test_anonymized_needs_medical_content() {
        let ctx = ValidityContext::new(CandidateKind::AnonymizedText);
        assert!(!classifier().is_valid("Nothing remains in this document", ctx));
    }

    #[test]
    fn test_structured_record_rules() {
        let ctx = ValidityContext::new(CandidateKind::StructuredRecord);
        let c = classifier();

        assert!(c.is_valid(r#"{"tests":[{"parameter":"Hemoglobin","value":13.5}]}"#, ctx));
        assert!(!c.is_valid(r#"{"tests":[]}"#, ctx));
        assert!(!c.is_valid(r#"{"results":[{"parameter":"x"}]}"#, ctx));
        assert!(!c.is_valid(r#"{"tests":[{"parameter":"Hemoglobin"}]}"#, ctx));
        assert!(!c.is_valid(r#"{"tests":[{"parameter":"Sorry, unreadable","value":"n/a"}]}"#, ctx));
        assert!(!c.is_valid(
            r#"{"tests":[{"parameter":"RBC","value":4.5},{"parameter":"WBC","value":"I am unable to read this"}]}"#,
            ctx
        ));
        assert!(!c.is_valid("this is not json at all", ctx));
    }
}
