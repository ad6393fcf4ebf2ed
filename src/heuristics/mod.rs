//! Deterministic alternatives to model calls: PII pattern recognition,
//! regex scrubbing and reference-table code matching.

pub mod code_matching;
pub mod pii_patterns;
pub mod pii_regex;

pub use code_matching::{CodeMatch, CodeMatcher, DEFAULT_MATCH_THRESHOLD, REFERENCE_CODES, ReferenceCode};
pub use pii_patterns::{Detection, PatternEngine, Recognizer};
pub use pii_regex::RegexScrubber;
