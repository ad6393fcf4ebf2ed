use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use tracing::debug;

use crate::models::AnonymizedText;

pub const EMAIL_ADDRESS: &str = "EMAIL_ADDRESS";
pub const PHONE_NUMBER: &str = "PHONE_NUMBER";
pub const DATE_TIME: &str = "DATE_TIME";
pub const MEDICAL_RECORD: &str = "MEDICAL_RECORD";
pub const PATIENT_LINE: &str = "PATIENT_LINE";

/// Replacement for entities without an explicit one
pub const DEFAULT_REPLACEMENT: &str = "<PII>";

/// (entity, name, pattern, score)
const BUILTIN_RECOGNIZERS: &[(&str, &str, &str, f32)] = &[
    (
        EMAIL_ADDRESS,
        "EMAIL",
        r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b",
        1.0,
    ),
    (
        PHONE_NUMBER,
        "MK_PHONE",
        r"(?:\+389|\b0)\s?\d{2}\s?\d{3}\s?\d{3}\b",
        0.7,
    ),
    (
        PHONE_NUMBER,
        "INTL_PHONE",
        r"\+\d{1,3}[\s-]?\(?\d{1,4}\)?(?:[\s-]?\d{2,4}){2,4}\b",
        0.5,
    ),
    (DATE_TIME, "NUM_DATE", r"\b\d{1,2}[./-]\d{1,2}[./-]\d{4}\b", 0.7),
    (DATE_TIME, "ISO_DATE", r"\b\d{4}-\d{2}-\d{2}\b", 0.7),
    (
        DATE_TIME,
        "TXT_DATE",
        r"(?i)\b(?:јан|фев|мар|апр|мај|јун|јул|авг|септ?|окт|ноем|дек|Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Sept|Oct|Nov|Dec)\p{L}*\.?\s+\d{1,2},?\s+\d{4}\b",
        0.6,
    ),
    (
        MEDICAL_RECORD,
        "MRN",
        r"\b(?:MRN|EMR|Record|Досие)[\s:#-]*[A-ZА-Ш0-9-]{4,}\b",
        0.65,
    ),
    (
        PATIENT_LINE,
        "PATIENT_LINE",
        r"(?m)^[ \t]*(?:Patient(?:[ \t]+name)?|Пациент|Име)[ \t]*[:\-–][^\n]*$",
        0.9,
    ),
];

/// A single regex recognizer for one entity type
#[derive(Debug, Clone)]
pub struct Recognizer {
    pub entity: String,
    pub name: String,
    pub pattern: Regex,
    pub score: f32,
}

/// A detected span
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub entity: String,
    pub start: usize,
    pub end: usize,
    pub score: f32,
}

impl Detection {
    fn len(&self) -> usize {
        self.end - self.start
    }

    fn overlaps(&self, other: &Detection) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Scored pattern recognizers with per-entity replacements.
///
/// Overlapping detections are resolved by score, then by span length; the
/// surviving spans are replaced and counted per entity type.
///
/// There is no named-entity model: person names are only caught on labelled
/// lines (`Patient:`, `Patient name:`, `Пациент:`, `Име:`). A name anywhere
/// else in the text passes through unchanged.
#[derive(Debug, Clone)]
pub struct PatternEngine {
    recognizers: Vec<Recognizer>,
    replacements: HashMap<String, String>,
}

impl PatternEngine {
    /// Engine with the built-in recognizers
    pub fn new() -> Result<Self, regex::Error> {
        let mut engine = Self {
            recognizers: Vec::new(),
            replacements: HashMap::new(),
        };
        for (entity, name, pattern, score) in BUILTIN_RECOGNIZERS {
            engine = engine.with_recognizer(entity, name, pattern, *score)?;
        }
        engine.replacements = [
            (PHONE_NUMBER, "<PHONE>"),
            (DATE_TIME, "<DATE>"),
            (MEDICAL_RECORD, "<ID>"),
            (PATIENT_LINE, "Patient: <NAME>"),
        ]
        .into_iter()
        .map(|(entity, replacement)| (entity.to_string(), replacement.to_string()))
        .collect();
        Ok(engine)
    }

    /// Add a recognizer
    pub fn with_recognizer(
        mut self,
        entity: &str,
        name: &str,
        pattern: &str,
        score: f32,
    ) -> Result<Self, regex::Error> {
        self.recognizers.push(Recognizer {
            entity: entity.to_string(),
            name: name.to_string(),
            pattern: Regex::new(pattern)?,
            score,
        });
        Ok(self)
    }

    /// Override the replacement for an entity type
    pub fn with_replacement(mut self, entity: &str, replacement: &str) -> Self {
        self.replacements
            .insert(entity.to_string(), replacement.to_string());
        self
    }

    /// All non-overlapping detections, in text order
    pub fn analyze(&self, text: &str) -> Vec<Detection> {
        let mut candidates: Vec<Detection> = self
            .recognizers
            .iter()
            .flat_map(|recognizer| {
                recognizer.pattern.find_iter(text).map(|m| Detection {
                    entity: recognizer.entity.clone(),
                    start: m.start(),
                    end: m.end(),
                    score: recognizer.score,
                })
            })
            .filter(|d| d.end > d.start)
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(b.len().cmp(&a.len()))
                .then(a.start.cmp(&b.start))
        });

        let mut accepted: Vec<Detection> = Vec::new();
        for candidate in candidates {
            if !accepted.iter().any(|a| a.overlaps(&candidate)) {
                accepted.push(candidate);
            }
        }
        accepted.sort_by_key(|d| d.start);
        accepted
    }

    pub fn anonymize(&self, text: &str) -> AnonymizedText {
        let detections = self.analyze(text);

        let mut out = String::with_capacity(text.len());
        let mut stats: BTreeMap<String, usize> = BTreeMap::new();
        let mut cursor = 0;
        for detection in &detections {
            out.push_str(&text[cursor..detection.start]);
            out.push_str(
                self.replacements
                    .get(&detection.entity)
                    .map(String::as_str)
                    .unwrap_or(DEFAULT_REPLACEMENT),
            );
            cursor = detection.end;
            *stats.entry(detection.entity.clone()).or_default() += 1;
        }
        out.push_str(&text[cursor..]);

        debug!("Pattern engine replaced {} spans", detections.len());
        AnonymizedText { text: out, stats }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> PatternEngine {
        PatternEngine::new().unwrap()
    }

    #[test]
    fn test_unlabelled_names_pass_through() {
        let text = "Referred by Dr. Jane Smith\nHemoglobin 13.5 g/dL";
        let result = engine().anonymize(text);
        assert_eq!(result.text, text);
        assert_eq!(result.stats.get(PATIENT_LINE).copied().unwrap_or(0), 0);
    }

    #[test]
    fn test_patient_line_replaced() {
        let result = engine().anonymize("Patient: John Doe\nHemoglobin 13.5 g/dL 12-16");
        assert_eq!(result.text, "Patient: <NAME>\nHemoglobin 13.5 g/dL 12-16");
        assert_eq!(result.stats[PATIENT_LINE], 1);
    }

    #[test]
    fn test_patient_line_wins_over_date_on_same_line() {
        let result = engine().anonymize("Patient: Jane Roe 01.02.1980\nRBC 4.2");
        assert_eq!(result.text, "Patient: <NAME>\nRBC 4.2");
        assert!(!result.stats.contains_key(DATE_TIME));
    }

    #[test]
    fn test_placeholders_per_category() {
        let text = "Tel: +389 70 123 456\n\
                    Sampled 2024-03-12 and 12/03/2024, signed мар 14, 2024\n\
                    MRN: 88-1234\n\
                    Mail lab@clinic.mk";
        let result = engine().anonymize(text);

        assert!(result.text.contains("Tel: <PHONE>"));
        assert_eq!(result.stats[DATE_TIME], 3);
        assert!(result.text.contains("<ID>"));
        assert!(result.text.contains("Mail <PII>"));
        assert_eq!(result.stats[PHONE_NUMBER], 1);
        assert_eq!(result.stats[MEDICAL_RECORD], 1);
        assert_eq!(result.stats[EMAIL_ADDRESS], 1);
    }

    #[test]
    fn test_custom_recognizer_and_bad_pattern() {
        let engine = engine()
            .with_recognizer("LAB_NAME", "LAB", r"\bAcme Labs\b", 0.8)
            .unwrap()
            .with_replacement("LAB_NAME", "<LAB>");
        assert_eq!(engine.anonymize("Acme Labs report").text, "<LAB> report");

        assert!(PatternEngine::new().unwrap().with_recognizer("X", "X", "(", 0.5).is_err());
    }

    #[test]
    fn test_medical_values_survive() {
        let text = "WBC 6.2 10^9/L 4.0-10.0\nPLT 250 150-400";
        assert_eq!(engine().anonymize(text).text, text);
    }
}
