//! Prompt variants for every model-backed stage.
//!
//! Each stage has an ordered list of variants; later ones are shorter and
//! more directive and are used on retries.

use crate::heuristics::code_matching::reference_table_prompt;

/// Page transcription instructions, most detailed first
pub const EXTRACTION_PROMPTS: &[&str] = &[
    "This image is one page of a laboratory blood test report. Transcribe every piece of \
     visible text, preserving the reading order, line breaks and table layout as closely as \
     plain text allows. Keep numbers, units, reference ranges and flags exactly as printed. \
     Do not summarize, translate or add commentary.",
    "You are an OCR engine. Your only task is to transcribe all visible text in this image. \
     Return the raw text exactly as it appears, with no explanations, apologies or commentary. \
     If there is no text, return an empty response. Do not refuse. Only transcribe.",
    "Return all text visible in this image. Text only. No explanations, no apologies, no commentary.",
];

/// Extraction prompt for a retry variant, with an optional document language hint
pub fn extraction_prompt(variant: usize, language: Option<&str>) -> String {
    let base = EXTRACTION_PROMPTS[variant.min(EXTRACTION_PROMPTS.len() - 1)];
    match language.map(str::trim).filter(|l| !l.is_empty()) {
        Some(lang) => format!("{base}\nThe document language is '{lang}'. Keep the original script."),
        None => base.to_string(),
    }
}

/// De-identification system prompts
pub const ANONYMIZATION_SYSTEM_PROMPTS: &[&str] = &[
    "You de-identify medical documents. Remove every piece of personally identifiable \
     information (names, birth dates, addresses, phone numbers, e-mail addresses, record and \
     insurance numbers) and irrelevant metadata from the blood test report you are given, while \
     keeping all medical data and its formatting. Return the same text with only that \
     information removed.",
    "You are an anonymization system. Remove all personal identifiers (names, dates, addresses, \
     IDs, phone numbers) from the medical text and keep every test, value and result intact. \
     Return the anonymized text only, without explanations.",
    "Remove personal identifiers from this medical text. Keep all medical content. Return only the text.",
];

pub const ANONYMIZATION_VARIANTS: usize = 3;

/// De-identification user prompt for a retry variant
pub fn anonymization_user_prompt(variant: usize, text: &str) -> String {
    match variant {
        0 => format!(
            "De-identify this blood test report.\n\
             Keep the text exactly as written: formatting, line breaks, test names, values, units, \
             reference ranges and any physician notes about the results. Remove all personal \
             identifiers and irrelevant metadata such as laboratory letterheads, page numbers, \
             headers and footers. Do not reformat, summarize or comment.\n\n\
             Report:\n{text}"
        ),
        1 => format!(
            "Anonymize this blood test text. Remove names, dates, IDs, phone numbers and \
             addresses. Keep all test names, values and medical data.\n\n{text}\n\n\
             Return the anonymized text only."
        ),
        _ => format!("Remove personal data from this text. Keep the medical data.\n\n{text}"),
    }
}

pub fn anonymization_system_prompt(variant: usize) -> &'static str {
    ANONYMIZATION_SYSTEM_PROMPTS[variant.min(ANONYMIZATION_SYSTEM_PROMPTS.len() - 1)]
}

/// Structuring system prompts; the first spells out the schema and coercion rules
pub const STRUCTURING_SYSTEM_PROMPTS: &[&str] = &[
    r#"You extract laboratory test results from report text into strict JSON.

Return exactly this shape:
{
  "tests": [
    {
      "parameter": string,
      "value": number | string,
      "reference_min": number | null,
      "reference_max": number | null,
      "unit": string | null,
      "loinc_code": string | null,
      "loinc_display": string | null
    }
  ]
}

Rules:
1. One top-level key, "tests", listing every test in document order.
2. JSON only. No prose.
3. Split a range such as "12-16" into reference_min 12 and reference_max 16.
4. When several ranges are listed (for example male/female, "P=13.0-18.0 W=12.0-16.0"), use the general range if one is given, otherwise the first one.
5. Copy units exactly as written ("g/dL", "10^9/L", "%").
6. A value that is not a plain number (for example "<5" or "negative") stays a string.
7. If no lab code is obvious, set loinc_code and loinc_display to null.
8. Never add keys that are not in the shape above."#,
    "Extract the laboratory test results from the text. Return JSON with a 'tests' array of \
     test names, values, units and reference ranges. Include every test. No explanations.",
    "Extract lab test data from the text. Return JSON with a 'tests' array.",
];

pub const STRUCTURING_VARIANTS: usize = 3;

pub fn structuring_system_prompt(variant: usize) -> &'static str {
    STRUCTURING_SYSTEM_PROMPTS[variant.min(STRUCTURING_SYSTEM_PROMPTS.len() - 1)]
}

pub fn structuring_user_prompt(variant: usize, text: &str) -> String {
    match variant {
        0 => format!("Extract all laboratory test results from this text and return JSON:\n\n{text}"),
        1 => format!("Extract the lab results as JSON with 'tests':\n\n{text}"),
        _ => format!("Lab tests from this text:\n\n{text}"),
    }
}

pub const ENRICHMENT_VARIANTS: usize = 2;

/// Enrichment system prompt with the reference table embedded
pub fn enrichment_system_prompt(variant: usize) -> String {
    let table = reference_table_prompt();
    if variant == 0 {
        format!(
            "You are a medical coding specialist for LOINC laboratory codes.\n\
             For every test in the input:\n\
             1. Check whether its loinc_code (if any) matches the parameter.\n\
             2. Fill in or correct loinc_code when needed.\n\
             3. Set loinc_display to the code's display name and loinc_class to its class.\n\
             4. Leave loinc_code null when a test cannot be mapped reliably.\n\
             Never change parameter, value, unit or the reference range, and keep the tests in \
             their original order.\n\n\
             Common codes:\n{table}"
        )
    } else {
        format!(
            "Add LOINC codes to each lab test. Keep every other field and the order unchanged. \
             Use null when unsure.\n\nCommon codes:\n{table}"
        )
    }
}

pub fn enrichment_user_prompt(results_json: &str) -> String {
    format!("Validate and complete the lab codes for these results:\n\n{results_json}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extraction_prompt_clamps_variant_and_adds_language() {
        assert_eq!(extraction_prompt(10, None), EXTRACTION_PROMPTS[2]);
        assert!(extraction_prompt(0, Some("mk")).contains("'mk'"));
        assert_eq!(extraction_prompt(1, Some("  ")), EXTRACTION_PROMPTS[1]);
    }

    #[test]
    fn test_prompts_embed_input() {
        for variant in 0..ANONYMIZATION_VARIANTS {
            assert!(anonymization_user_prompt(variant, "RBC 4.5").contains("RBC 4.5"));
        }
        for variant in 0..STRUCTURING_VARIANTS {
            assert!(structuring_user_prompt(variant, "RBC 4.5").contains("RBC 4.5"));
        }
    }

    #[test]
    fn test_enrichment_prompt_has_reference_codes() {
        assert!(enrichment_system_prompt(0).contains("718-7"));
        assert!(enrichment_system_prompt(1).contains("2093-3"));
    }
}
