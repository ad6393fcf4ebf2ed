use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A lab value: numeric when it parses as a number, otherwise kept literally (e.g. "<5")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LabValue {
    Number(f64),
    Text(String),
}

impl LabValue {
    /// Coerce a raw string, keeping non-numeric results as literal text
    pub fn from_raw(raw: &str) -> Self {
        match parse_number(raw) {
            Some(n) => LabValue::Number(n),
            None => LabValue::Text(raw.trim().to_string()),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            LabValue::Number(n) => Some(*n),
            LabValue::Text(_) => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, LabValue::Text(t) if t.trim().is_empty())
    }
}

/// Out-of-range marker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flag {
    High,
    Low,
}

impl Flag {
    fn from_raw(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "h" | "high" | "hi" | "+" | "↑" => Some(Flag::High),
            "l" | "low" | "lo" | "-" | "↓" => Some(Flag::Low),
            _ => None,
        }
    }
}

/// A single laboratory observation, in document order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabItem {
    /// Free-text test name as printed (e.g. "Hemoglobin")
    pub parameter: String,
    pub value: LabValue,
    #[serde(default)]
    pub reference_min: Option<f64>,
    #[serde(default)]
    pub reference_max: Option<f64>,
    /// Free-text range kept when it could not be split into min/max
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ref_range: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flags: Option<Flag>,
    #[serde(default)]
    pub loinc_code: Option<String>,
    #[serde(default)]
    pub loinc_display: Option<String>,
    /// Semantic class of the code (e.g. "HEM/BC", "CHEM")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loinc_class: Option<String>,
}

impl LabItem {
    pub fn new(parameter: impl Into<String>, value: LabValue) -> Self {
        Self {
            parameter: parameter.into(),
            value,
            reference_min: None,
            reference_max: None,
            ref_range: None,
            unit: None,
            flags: None,
            loinc_code: None,
            loinc_display: None,
            loinc_class: None,
        }
    }

    pub fn has_code(&self) -> bool {
        self.loinc_code.as_deref().is_some_and(|c| !c.trim().is_empty())
    }

    /// Derive high/low when the value is numeric and a bound is known
    fn derive_flag(&mut self) {
        if self.flags.is_some() {
            return;
        }
        let Some(value) = self.value.as_number() else {
            return;
        };
        if self.reference_min.is_some_and(|min| value < min) {
            self.flags = Some(Flag::Low);
        } else if self.reference_max.is_some_and(|max| value > max) {
            self.flags = Some(Flag::High);
        }
    }
}

/// Ordered collection of lab items; insertion order is document order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LaboratoryResults {
    #[serde(default)]
    pub tests: Vec<LabItem>,
}

/// Code coverage summary stored alongside the enriched results
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeCoverage {
    pub total_tests: usize,
    pub tests_with_loinc: usize,
    pub tests_without_loinc: usize,
    pub coverage_percentage: f64,
}

impl LaboratoryResults {
    pub fn is_empty(&self) -> bool {
        self.tests.is_empty()
    }

    pub fn coverage(&self) -> CodeCoverage {
        let total_tests = self.tests.len();
        let tests_with_loinc = self.tests.iter().filter(|t| t.has_code()).count();
        let coverage_percentage = if total_tests > 0 {
            (tests_with_loinc as f64 / total_tests as f64 * 10_000.0).round() / 100.0
        } else {
            0.0
        };
        CodeCoverage {
            total_tests,
            tests_with_loinc,
            tests_without_loinc: total_tests - tests_with_loinc,
            coverage_percentage,
        }
    }

    /// Parse a model response leniently into the typed shape.
    ///
    /// Accepts `{"tests": [...]}`, `{"items": [...]}` or a bare array. Numeric
    /// strings become numbers, free-text ranges are split into
    /// `reference_min`/`reference_max`, and items without a parameter are dropped.
    pub fn from_model_value(value: &Value) -> Result<Self, String> {
        let items = match value {
            Value::Array(items) => items,
            Value::Object(map) => match map.get("tests").or_else(|| map.get("items")) {
                Some(Value::Array(items)) => items,
                Some(other) => return Err(format!("'tests' is not an array: {}", kind(other))),
                None => return Err("missing 'tests' array".to_string()),
            },
            other => return Err(format!("expected an object, got {}", kind(other))),
        };

        let tests = items
            .iter()
            .filter_map(Value::as_object)
            .filter_map(item_from_map)
            .collect();

        Ok(Self { tests })
    }

    /// JSON schema of the shape requested from the model
    pub fn json_schema() -> Value {
        let nullable_number = serde_json::json!({"type": ["number", "null"]});
        let nullable_string = serde_json::json!({"type": ["string", "null"]});
        serde_json::json!({
            "type": "object",
            "properties": {
                "tests": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "parameter": {"type": "string", "description": "Test name as printed, e.g. 'Haemoglobin', 'RBC'"},
                            "value": {"type": ["number", "string"], "description": "Numeric when possible; string for non-numeric results such as '<5'"},
                            "reference_min": nullable_number,
                            "reference_max": nullable_number,
                            "unit": nullable_string,
                            "loinc_code": nullable_string,
                            "loinc_display": nullable_string,
                            "loinc_class": nullable_string
                        },
                        "required": ["parameter", "value", "reference_min", "reference_max", "unit", "loinc_code", "loinc_display"]
                    }
                }
            },
            "required": ["tests"]
        })
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn string_field(map: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| map.get(*k))
        .find_map(|v| match v {
            Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn item_from_map(map: &Map<String, Value>) -> Option<LabItem> {
    let parameter = string_field(map, &["parameter", "name", "test"])?;

    let value = match map.get("value").or_else(|| map.get("result")) {
        Some(Value::Number(n)) => n
            .as_f64()
            .map(LabValue::Number)
            .unwrap_or_else(|| LabValue::Text(n.to_string())),
        Some(Value::String(s)) => LabValue::from_raw(s),
        Some(Value::Bool(b)) => LabValue::Text(b.to_string()),
        _ => LabValue::Text(String::new()),
    };

    let mut item = LabItem::new(parameter, value);
    item.unit = string_field(map, &["unit", "units"]);
    item.loinc_code = string_field(map, &["loinc_code", "code"]);
    item.loinc_display = string_field(map, &["loinc_display", "loinc_long_name", "display"]);
    item.loinc_class = string_field(map, &["loinc_class", "class_name", "class"]);
    item.flags = string_field(map, &["flags", "flag"]).and_then(|f| Flag::from_raw(&f));

    let (min, min_range) = bound_field(map.get("reference_min"));
    let (max, max_range) = bound_field(map.get("reference_max"));
    item.reference_min = min;
    item.reference_max = max;

    if item.reference_min.is_none() && item.reference_max.is_none() {
        let free_text = string_field(map, &["ref_range", "reference_range", "range"])
            .or(min_range)
            .or(max_range);
        if let Some(text) = free_text {
            match parse_reference_range(&text) {
                Some(range) => {
                    item.reference_min = range.min;
                    item.reference_max = range.max;
                }
                None => item.ref_range = Some(text),
            }
        }
    }

    item.derive_flag();
    Some(item)
}

/// A bound is either numeric, or a string that may hold a whole range
fn bound_field(value: Option<&Value>) -> (Option<f64>, Option<String>) {
    match value {
        Some(Value::Number(n)) => (n.as_f64(), None),
        Some(Value::String(s)) => match parse_number(s) {
            Some(n) => (Some(n), None),
            None if !s.trim().is_empty() => (None, Some(s.trim().to_string())),
            None => (None, None),
        },
        _ => (None, None),
    }
}

/// Parse a full string as a number; accepts a single decimal comma
pub fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    let normalized = if !trimmed.contains('.') && trimmed.matches(',').count() == 1 {
        trimmed.replace(',', ".")
    } else {
        trimmed.to_string()
    };
    normalized.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// Lower/upper bound pulled out of a free-text reference range
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReferenceRange {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

static RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:(?P<label>[^\W\d_]+)\s*[:=]\s*)?(?P<lo>\d+(?:[.,]\d+)?)\s*(?:-|–|—|to|до)\s*(?P<hi>\d+(?:[.,]\d+)?)",
    )
    .expect("valid regex")
});

static UPPER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:<=?|≤)\s*(\d+(?:[.,]\d+)?)").expect("valid regex"));

static LOWER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*(?:>=?|≥)\s*(\d+(?:[.,]\d+)?)").expect("valid regex"));

/// Split a free-text range into bounds.
///
/// When several demographic ranges are listed ("M: 13-17 F: 12-16",
/// "P=13.0-18.0 W=12.0-16.0"), an unlabeled (general) range wins, otherwise
/// the first one listed. "<5" gives only an upper bound, ">5" only a lower one.
pub fn parse_reference_range(text: &str) -> Option<ReferenceRange> {
    let ranges: Vec<(bool, Option<f64>, Option<f64>)> = RANGE_RE
        .captures_iter(text)
        .map(|caps| {
            (
                caps.name("label").is_some(),
                caps.name("lo").and_then(|m| parse_number(m.as_str())),
                caps.name("hi").and_then(|m| parse_number(m.as_str())),
            )
        })
        .collect();

    let chosen = ranges
        .iter()
        .find(|(labeled, _, _)| !labeled)
        .or_else(|| ranges.first());

    if let Some((_, min, max)) = chosen {
        return Some(ReferenceRange {
            min: *min,
            max: *max,
        });
    }

    if let Some(caps) = UPPER_RE.captures(text) {
        return Some(ReferenceRange {
            min: None,
            max: parse_number(&caps[1]),
        });
    }
    if let Some(caps) = LOWER_RE.captures(text) {
        return Some(ReferenceRange {
            min: parse_number(&caps[1]),
            max: None,
        });
    }
    None
}
