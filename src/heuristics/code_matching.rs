//! Offline lab-code matching against a built-in reference table.
//!
//! Scores are on a 0-100 scale: the best of a plain edit-distance ratio, a
//! token-sorted ratio and a token-set ratio between the normalized test name
//! and each alias of a reference entry.

use crate::models::LaboratoryResults;

/// Canonical lab code with its display name, semantic class and known spellings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceCode {
    pub code: &'static str,
    pub display: &'static str,
    pub class: &'static str,
    pub aliases: &'static [&'static str],
}

const fn entry(
    code: &'static str,
    display: &'static str,
    class: &'static str,
    aliases: &'static [&'static str],
) -> ReferenceCode {
    ReferenceCode {
        code,
        display,
        class,
        aliases,
    }
}

/// Common blood-test codes, complete blood count first
pub static REFERENCE_CODES: &[ReferenceCode] = &[
    entry("718-7", "Hemoglobin [Mass/volume] in Blood", "HEM/BC", &["hemoglobin", "haemoglobin", "hgb", "hb", "хемоглобин"]),
    entry("4544-3", "Hematocrit [Volume Fraction] of Blood by Automated count", "HEM/BC", &["hematocrit", "haematocrit", "hct", "хематокрит"]),
    entry("6690-2", "Leukocytes [#/volume] in Blood by Automated count", "HEM/BC", &["leukocytes", "white blood cells", "white blood cell count", "wbc", "леукоцити"]),
    entry("789-8", "Erythrocytes [#/volume] in Blood by Automated count", "HEM/BC", &["erythrocytes", "red blood cells", "red blood cell count", "rbc", "еритроцити"]),
    entry("777-3", "Platelets [#/volume] in Blood by Automated count", "HEM/BC", &["platelets", "platelet count", "thrombocytes", "plt", "тромбоцити"]),
    entry("787-2", "MCV [Entitic volume] by Automated count", "HEM/BC", &["mcv", "mean corpuscular volume"]),
    entry("785-6", "MCH [Entitic mass] by Automated count", "HEM/BC", &["mch", "mean corpuscular hemoglobin"]),
    entry("786-4", "MCHC [Mass/volume] by Automated count", "HEM/BC", &["mchc", "mean corpuscular hemoglobin concentration"]),
    entry("788-0", "Erythrocyte distribution width [Ratio] by Automated count", "HEM/BC", &["rdw", "red cell distribution width"]),
    entry("2345-7", "Glucose [Mass/volume] in Serum or Plasma", "CHEM", &["glucose", "blood glucose", "fasting glucose", "гликемија", "глукоза", "шеќер"]),
    entry("4548-4", "Hemoglobin A1c/Hemoglobin.total in Blood", "CHEM", &["hba1c", "hemoglobin a1c", "glycated hemoglobin"]),
    entry("2093-3", "Cholesterol [Mass/volume] in Serum or Plasma", "CHEM", &["cholesterol", "total cholesterol", "холестерол"]),
    entry("2085-9", "Cholesterol in HDL [Mass/volume] in Serum or Plasma", "CHEM", &["hdl", "hdl cholesterol", "hdl-c"]),
    entry("2089-1", "Cholesterol in LDL [Mass/volume] in Serum or Plasma", "CHEM", &["ldl", "ldl cholesterol", "ldl-c"]),
    entry("2571-8", "Triglyceride [Mass/volume] in Serum or Plasma", "CHEM", &["triglycerides", "triglyceride", "триглицериди"]),
    entry("2160-0", "Creatinine [Mass/volume] in Serum or Plasma", "CHEM", &["creatinine", "креатинин"]),
    entry("3094-0", "Urea nitrogen [Mass/volume] in Serum or Plasma", "CHEM", &["urea", "urea nitrogen", "bun", "уреа"]),
    entry("3084-1", "Urate [Mass/volume] in Serum or Plasma", "CHEM", &["uric acid", "urate", "урична киселина"]),
    entry("1742-6", "Alanine aminotransferase [Enzymatic activity/volume] in Serum or Plasma", "CHEM", &["alt", "sgpt", "alanine aminotransferase"]),
    entry("1920-8", "Aspartate aminotransferase [Enzymatic activity/volume] in Serum or Plasma", "CHEM", &["ast", "sgot", "aspartate aminotransferase"]),
    entry("2324-2", "Gamma glutamyl transferase [Enzymatic activity/volume] in Serum or Plasma", "CHEM", &["ggt", "gamma gt", "gamma glutamyl transferase"]),
    entry("1975-2", "Bilirubin.total [Mass/volume] in Serum or Plasma", "CHEM", &["bilirubin", "total bilirubin", "билирубин"]),
    entry("2951-2", "Sodium [Moles/volume] in Serum or Plasma", "CHEM", &["sodium", "na", "натриум"]),
    entry("2823-3", "Potassium [Moles/volume] in Serum or Plasma", "CHEM", &["potassium", "k", "калиум"]),
    entry("2498-4", "Iron [Mass/volume] in Serum or Plasma", "CHEM", &["iron", "serum iron", "железо"]),
    entry("2276-4", "Ferritin [Mass/volume] in Serum or Plasma", "CHEM", &["ferritin", "феритин"]),
    entry("1988-5", "C reactive protein [Mass/volume] in Serum or Plasma", "CHEM", &["crp", "c reactive protein", "c-reactive protein"]),
    entry("4537-7", "Erythrocyte sedimentation rate by Westergren method", "HEM/BC", &["esr", "sedimentation rate", "седиментација"]),
    entry("3016-3", "Thyrotropin [Units/volume] in Serum or Plasma", "CHEM", &["tsh", "thyrotropin", "thyroid stimulating hormone"]),
];

/// Default acceptance threshold
pub const DEFAULT_MATCH_THRESHOLD: f64 = 80.0;

/// Best reference entry for a test name
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CodeMatch {
    pub reference: &'static ReferenceCode,
    pub score: f64,
}

/// Fuzzy matcher over a reference table
#[derive(Debug, Clone)]
pub struct CodeMatcher {
    table: &'static [ReferenceCode],
    threshold: f64,
}

impl Default for CodeMatcher {
    fn default() -> Self {
        Self::new(DEFAULT_MATCH_THRESHOLD)
    }
}

impl CodeMatcher {
    pub fn new(threshold: f64) -> Self {
        Self {
            table: REFERENCE_CODES,
            threshold,
        }
    }

    /// Best entry scoring at or above the threshold
    pub fn best_match(&self, parameter: &str) -> Option<CodeMatch> {
        let query = normalize(parameter);
        if query.is_empty() {
            return None;
        }

        // Ties on score go to the entry whose alias has the same token set
        self.table
            .iter()
            .map(|reference| {
                let (score, tiebreak) = reference
                    .aliases
                    .iter()
                    .map(|alias| {
                        let alias = normalize(alias);
                        (similarity(&query, &alias), token_sort_ratio(&query, &alias))
                    })
                    .fold((0.0_f64, 0.0_f64), |best, next| {
                        if next.0 > best.0 || (next.0 == best.0 && next.1 > best.1) {
                            next
                        } else {
                            best
                        }
                    });
                (CodeMatch { reference, score }, tiebreak)
            })
            .filter(|(m, _)| m.score >= self.threshold)
            .max_by(|(a, ta), (b, tb)| a.score.total_cmp(&b.score).then(ta.total_cmp(tb)))
            .map(|(m, _)| m)
    }

    /// Fill code fields of items that have none; returns how many were filled.
    ///
    /// Items that already carry a code keep it, gaining display and class if
    /// the code is in the table.
    pub fn enrich(&self, results: &mut LaboratoryResults) -> usize {
        let mut filled = 0;
        for item in &mut results.tests {
            if item.has_code() {
                let known = item
                    .loinc_code
                    .as_deref()
                    .and_then(|code| self.table.iter().find(|r| r.code == code.trim()));
                if let Some(reference) = known {
                    item.loinc_display.get_or_insert_with(|| reference.display.to_string());
                    item.loinc_class.get_or_insert_with(|| reference.class.to_string());
                }
                continue;
            }
            if let Some(found) = self.best_match(&item.parameter) {
                item.loinc_code = Some(found.reference.code.to_string());
                item.loinc_display = Some(found.reference.display.to_string());
                item.loinc_class = Some(found.reference.class.to_string());
                filled += 1;
            }
        }
        filled
    }
}

/// Reference table rendered as prompt lines
pub fn reference_table_prompt() -> String {
    REFERENCE_CODES
        .iter()
        .map(|r| {
            format!(
                "- {}: {} ({}) [{}]",
                r.aliases.first().copied().unwrap_or(r.display),
                r.code,
                r.display,
                r.class
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Lowercase, strip punctuation and collapse whitespace
pub fn normalize(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Similarity of two normalized strings, 0-100
pub fn similarity(a: &str, b: &str) -> f64 {
    ratio(a, b)
        .max(token_sort_ratio(a, b))
        .max(token_set_ratio(a, b))
}

fn ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 100.0;
    }
    (1.0 - levenshtein(&a, &b) as f64 / longest as f64) * 100.0
}

fn token_sort_ratio(a: &str, b: &str) -> f64 {
    ratio(&sorted_tokens(a).join(" "), &sorted_tokens(b).join(" "))
}

/// Compares the shared tokens against each side's full token set.
/// Requires at least four shared characters so short codes like "k" or "hb"
/// never match on a single token.
fn token_set_ratio(a: &str, b: &str) -> f64 {
    let ta = sorted_tokens(a);
    let tb = sorted_tokens(b);
    let common: Vec<&str> = ta.iter().filter(|t| tb.contains(t)).copied().collect();
    if common.iter().map(|t| t.chars().count()).sum::<usize>() < 4 {
        return 0.0;
    }

    let rest = |tokens: &[&str]| -> String {
        let mut all = common.clone();
        all.extend(tokens.iter().filter(|t| !common.contains(t)));
        all.join(" ")
    };
    let joined = common.join(" ");
    let with_a = rest(&ta);
    let with_b = rest(&tb);

    ratio(&joined, &with_a)
        .max(ratio(&joined, &with_b))
        .max(ratio(&with_a, &with_b))
}

fn sorted_tokens(text: &str) -> Vec<&str> {
    let mut tokens: Vec<&str> = text.split_whitespace().collect();
    tokens.sort_unstable();
    tokens.dedup();
    tokens
}

fn levenshtein(a: &[char], b: &[char]) -> usize {
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut curr = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        curr[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != cb);
            curr[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(curr[j] + 1);
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LabItem, LabValue};

    #[test]
    fn test_exact_and_misspelled_names() {
        let matcher = CodeMatcher::default();
        assert_eq!(matcher.best_match("Hemoglobin").unwrap().reference.code, "718-7");
        assert_eq!(matcher.best_match("Haemoglobine").unwrap().reference.code, "718-7");
        assert_eq!(matcher.best_match("WBC").unwrap().reference.code, "6690-2");
        assert_eq!(matcher.best_match("Cholesterol, total").unwrap().reference.code, "2093-3");
    }

    #[test]
    fn test_token_order_and_extra_tokens() {
        let matcher = CodeMatcher::default();
        assert_eq!(matcher.best_match("Count, Platelet").unwrap().reference.code, "777-3");
        assert_eq!(matcher.best_match("Hemoglobin (HGB)").unwrap().reference.code, "718-7");
        assert_eq!(matcher.best_match("HDL Cholesterol").unwrap().reference.code, "2085-9");
        assert_eq!(matcher.best_match("Cholesterol LDL").unwrap().reference.code, "2089-1");
    }

    #[test]
    fn test_below_threshold_is_rejected() {
        let matcher = CodeMatcher::default();
        assert!(matcher.best_match("Vitamin Q").is_none());
        assert!(matcher.best_match("").is_none());
    }

    #[test]
    fn test_similarity_scale() {
        assert_eq!(similarity("abc", "abc"), 100.0);
        assert!(similarity("abc", "xyz") < 1.0);
        assert_eq!(levenshtein(&['k', 'i', 't'], &['s', 'i', 't']), 1);
    }

    #[test]
    fn test_enrich_keeps_existing_codes() {
        let mut existing = LabItem::new("Hgb", LabValue::Number(14.0));
        existing.loinc_code = Some("718-7".to_string());
        let mut results = LaboratoryResults {
            tests: vec![
                existing,
                LabItem::new("Glucose", LabValue::Number(5.1)),
                LabItem::new("Unobtainium", LabValue::Number(1.0)),
            ],
        };

        let filled = CodeMatcher::default().enrich(&mut results);
        assert_eq!(filled, 1);
        assert_eq!(
            results.tests[0].loinc_display.as_deref(),
            Some("Hemoglobin [Mass/volume] in Blood")
        );
        assert_eq!(results.tests[1].loinc_code.as_deref(), Some("2345-7"));
        assert_eq!(results.tests[1].loinc_class.as_deref(), Some("CHEM"));
        assert!(results.tests[2].loinc_code.is_none());
    }

    #[test]
    fn test_reference_table_prompt_lists_codes() {
        let table = reference_table_prompt();
        assert!(table.contains("- hemoglobin: 718-7"));
        assert!(table.contains("2160-0"));
    }
}
