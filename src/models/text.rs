use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// De-identified text plus the number of replacements per category
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnonymizedText {
    pub text: String,
    #[serde(default)]
    pub stats: BTreeMap<String, usize>,
}

impl AnonymizedText {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            stats: BTreeMap::new(),
        }
    }

    pub fn total_replacements(&self) -> usize {
        self.stats.values().sum()
    }

    /// Add another pass's counts onto these
    pub fn merge_stats(&mut self, other: &BTreeMap<String, usize>) {
        for (category, count) in other {
            *self.stats.entry(category.clone()).or_default() += count;
        }
    }
}
