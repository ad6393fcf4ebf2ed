use std::sync::LazyLock;

use regex::Regex;

use crate::models::AnonymizedText;

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("valid regex")
});
static PHONE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:\+389|\b0)\s?\d{2}\s?\d{3}\s?\d{3}\b").expect("valid regex"));
static DATE_NUMERIC: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,2}[./-]\d{1,2}[./-]\d{4}\b").expect("valid regex"));
static DATE_TEXTUAL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:Jan|Feb|Mar|Apr|May|Jun|Jul|Aug|Sep|Sept|Oct|Nov|Dec)[a-z]*\s+\d{1,2},\s+\d{4}\b")
        .expect("valid regex")
});
static ID_LIKE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(?:ID|MRN|EMR|Patient\s*ID)[:#]?\s*[A-Z0-9-]{5,}\b").expect("valid regex")
});
static PATIENT_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[ \t]*(?:Patient|Пациент)[ \t]*[:\-][^\n]*$").expect("valid regex")
});

/// Regex-only scrubber, used when the pattern engine is unavailable.
///
/// Rules run in a fixed order and each counts its replacements under
/// `EMAIL`, `PHONE`, `DATE`, `ID` or `NAME`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RegexScrubber;

impl RegexScrubber {
    pub fn new() -> Self {
        Self
    }

    pub fn scrub(&self, text: &str) -> AnonymizedText {
        let rules: [(&Regex, &str, &str); 6] = [
            (&EMAIL, "<EMAIL>", "EMAIL"),
            (&PHONE, "<PHONE>", "PHONE"),
            (&DATE_NUMERIC, "<DATE>", "DATE"),
            (&DATE_TEXTUAL, "<DATE>", "DATE"),
            (&ID_LIKE, "<ID>", "ID"),
            (&PATIENT_LINE, "Patient: <NAME>", "NAME"),
        ];

        let mut result = AnonymizedText::new(text);
        for key in ["EMAIL", "PHONE", "DATE", "ID", "NAME"] {
            result.stats.insert(key.to_string(), 0);
        }

        for (pattern, replacement, key) in rules {
            let count = pattern.find_iter(&result.text).count();
            if count == 0 {
                continue;
            }
            result.text = pattern
                .replace_all(&result.text, regex::NoExpand(replacement))
                .into_owned();
            *result.stats.entry(key.to_string()).or_default() += count;
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scrubs_each_category() {
        let text = "Patient: John Doe\n\
                    Contact: john.doe@example.com, 070 123 456\n\
                    Collected 12.03.2024, reported March 14, 2024\n\
                    MRN: AB12345\n\
                    Hemoglobin 14.1 g/dL 12-16";

        let result = RegexScrubber::new().scrub(text);

        assert!(result.text.starts_with("Patient: <NAME>"));
        assert!(result.text.contains("<EMAIL>"));
        assert!(result.text.contains("<PHONE>"));
        assert!(!result.text.contains("12.03.2024"));
        assert!(!result.text.contains("March 14, 2024"));
        assert!(result.text.contains("<ID>"));
        assert!(result.text.contains("Hemoglobin 14.1 g/dL 12-16"));

        assert_eq!(result.stats["EMAIL"], 1);
        assert_eq!(result.stats["PHONE"], 1);
        assert_eq!(result.stats["DATE"], 2);
        assert_eq!(result.stats["ID"], 1);
        assert_eq!(result.stats["NAME"], 1);
    }

    #[test]
    fn test_clean_text_is_untouched() {
        let text = "WBC 6.2 10^9/L 4.0-10.0";
        let result = RegexScrubber::new().scrub(text);
        assert_eq!(result.text, text);
        assert_eq!(result.total_replacements(), 0);
        assert_eq!(result.stats.len(), 5);
    }

    #[test]
    fn test_cyrillic_patient_line() {
        let result = RegexScrubber::new().scrub("Пациент: Петар Петровски\nRBC 4.5");
        assert_eq!(result.text, "Patient: <NAME>\nRBC 4.5");
    }
}
