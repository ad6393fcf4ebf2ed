use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum length of a stored error message
pub const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Processing state of a document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Uploaded,
    /// Text extracted
    Processed,
    Anonymized,
    JsonSerialized,
    LoincValidated,
    Error,
}

impl DocumentStatus {
    pub const ALL: [DocumentStatus; 6] = [
        DocumentStatus::Uploaded,
        DocumentStatus::Processed,
        DocumentStatus::Anonymized,
        DocumentStatus::JsonSerialized,
        DocumentStatus::LoincValidated,
        DocumentStatus::Error,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Uploaded => "uploaded",
            DocumentStatus::Processed => "processed",
            DocumentStatus::Anonymized => "anonymized",
            DocumentStatus::JsonSerialized => "json_serialized",
            DocumentStatus::LoincValidated => "loinc_validated",
            DocumentStatus::Error => "error",
        }
    }

    /// Position in the forward chain; `None` for the error state
    fn rank(&self) -> Option<u8> {
        match self {
            DocumentStatus::Uploaded => Some(0),
            DocumentStatus::Processed => Some(1),
            DocumentStatus::Anonymized => Some(2),
            DocumentStatus::JsonSerialized => Some(3),
            DocumentStatus::LoincValidated => Some(4),
            DocumentStatus::Error => None,
        }
    }

    /// Whether moving from `self` to `next` is allowed.
    ///
    /// Forward moves and moves into `error` are always allowed. A document in
    /// `error` may move to any status, which is how a manual retry resumes.
    pub fn can_transition_to(&self, next: DocumentStatus) -> bool {
        match (self.rank(), next.rank()) {
            (_, None) => true,
            (None, Some(_)) => true,
            (Some(from), Some(to)) => to >= from,
        }
    }
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown document status '{0}'")]
pub struct UnknownStatus(pub String);

impl FromStr for DocumentStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        DocumentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid status transition from {from} to {to}")]
pub struct StatusTransitionError {
    pub from: DocumentStatus,
    pub to: DocumentStatus,
}

/// Metadata record tracking one uploaded report through the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    /// Bucket holding the original upload
    pub bucket: String,
    pub original_key: String,
    pub filename: String,
    #[serde(default)]
    pub language: Option<String>,
    pub content_type: String,
    pub size_bytes: u64,
    /// Hex SHA-256 of the uploaded bytes
    pub content_hash: String,
    #[serde(default)]
    pub etag_original: Option<String>,
    #[serde(default)]
    pub etag_text: Option<String>,
    pub status: DocumentStatus,
    /// Last failure message; only present in the `error` state
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub text_key: Option<String>,
    #[serde(default)]
    pub anonymized_key: Option<String>,
    #[serde(default)]
    pub json_key: Option<String>,
    #[serde(default)]
    pub enriched_key: Option<String>,
    /// Code coverage statistics of the enriched results
    #[serde(default)]
    pub lab_cache: Option<Value>,
    #[serde(default)]
    pub patient_id: Option<String>,
    #[serde(default)]
    pub model_provider: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub uploaded_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DocumentRecord {
    /// Fresh record in the `uploaded` state
    pub fn new(
        id: impl Into<String>,
        filename: impl Into<String>,
        content_type: impl Into<String>,
        size_bytes: u64,
        content_hash: impl Into<String>,
        bucket: impl Into<String>,
        original_key: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            bucket: bucket.into(),
            original_key: original_key.into(),
            filename: filename.into(),
            language: None,
            content_type: content_type.into(),
            size_bytes,
            content_hash: content_hash.into(),
            etag_original: None,
            etag_text: None,
            status: DocumentStatus::Uploaded,
            error: None,
            text_key: None,
            anonymized_key: None,
            json_key: None,
            enriched_key: None,
            lab_cache: None,
            patient_id: None,
            model_provider: None,
            model_name: None,
            uploaded_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a partial update, enforcing the status transition rules.
    ///
    /// `updated_at` is always refreshed. Moving to a non-error status clears
    /// the stored error.
    pub fn apply(&mut self, update: RecordUpdate) -> Result<(), StatusTransitionError> {
        if let Some(next) = update.status {
            if !self.status.can_transition_to(next) {
                return Err(StatusTransitionError {
                    from: self.status,
                    to: next,
                });
            }
            self.status = next;
            if next != DocumentStatus::Error {
                self.error = None;
            }
        }

        macro_rules! set {
            ($($field:ident),*) => {
                $(if let Some(v) = update.$field { self.$field = Some(v); })*
            };
        }
        set!(
            etag_original,
            etag_text,
            text_key,
            anonymized_key,
            json_key,
            enriched_key,
            lab_cache,
            error
        );

        self.updated_at = Utc::now();
        Ok(())
    }
}

/// Partial update of a document record; unset fields are left untouched
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordUpdate {
    pub status: Option<DocumentStatus>,
    pub etag_original: Option<String>,
    pub etag_text: Option<String>,
    pub text_key: Option<String>,
    pub anonymized_key: Option<String>,
    pub json_key: Option<String>,
    pub enriched_key: Option<String>,
    pub lab_cache: Option<Value>,
    pub error: Option<String>,
}

impl RecordUpdate {
    pub fn status(status: DocumentStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    /// Move to `error`, keeping at most the first 500 characters of the message
    pub fn failed(message: impl AsRef<str>) -> Self {
        let message: String = message
            .as_ref()
            .chars()
            .take(MAX_ERROR_MESSAGE_LEN)
            .collect();
        Self {
            status: Some(DocumentStatus::Error),
            error: Some(message),
            ..Default::default()
        }
    }

    pub fn with_etag_original(mut self, etag: impl Into<String>) -> Self {
        self.etag_original = Some(etag.into());
        self
    }

    pub fn with_etag_text(mut self, etag: impl Into<String>) -> Self {
        self.etag_text = Some(etag.into());
        self
    }

    pub fn with_text_key(mut self, key: impl Into<String>) -> Self {
        self.text_key = Some(key.into());
        self
    }

    pub fn with_anonymized_key(mut self, key: impl Into<String>) -> Self {
        self.anonymized_key = Some(key.into());
        self
    }

    pub fn with_json_key(mut self, key: impl Into<String>) -> Self {
        self.json_key = Some(key.into());
        self
    }

    pub fn with_enriched_key(mut self, key: impl Into<String>) -> Self {
        self.enriched_key = Some(key.into());
        self
    }

    pub fn with_lab_cache(mut self, cache: Value) -> Self {
        self.lab_cache = Some(cache);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> DocumentRecord {
        DocumentRecord::new(
            "doc-1",
            "report.pdf",
            "application/pdf",
            10,
            "abc",
            "bronze",
            "documents/doc-1/doc-1.pdf",
        )
    }

    #[test]
    fn test_status_parses_from_str() {
        for status in DocumentStatus::ALL {
            assert_eq!(status.as_str().parse::<DocumentStatus>().unwrap(), status);
        }
        assert!("done".parse::<DocumentStatus>().is_err());
    }

    #[test]
    fn test_transitions() {
        use DocumentStatus::*;
        assert!(Uploaded.can_transition_to(Processed));
        assert!(Uploaded.can_transition_to(JsonSerialized));
        assert!(Anonymized.can_transition_to(Error));
        assert!(Error.can_transition_to(Uploaded));
        assert!(Anonymized.can_transition_to(Anonymized));
        assert!(!JsonSerialized.can_transition_to(Processed));
        assert!(!LoincValidated.can_transition_to(Uploaded));
    }

    #[test]
    fn test_apply_rejects_backward_move() {
        let mut rec = record();
        rec.apply(RecordUpdate::status(DocumentStatus::Anonymized))
            .unwrap();
        let err = rec
            .apply(RecordUpdate::status(DocumentStatus::Processed))
            .unwrap_err();
        assert_eq!(err.from, DocumentStatus::Anonymized);
        assert_eq!(rec.status, DocumentStatus::Anonymized);
    }

    #[test]
    fn test_failed_truncates_and_recovery_clears() {
        let mut rec = record();
        rec.apply(RecordUpdate::failed("x".repeat(800))).unwrap();
        assert_eq!(rec.status, DocumentStatus::Error);
        assert_eq!(rec.error.as_ref().unwrap().len(), MAX_ERROR_MESSAGE_LEN);

        rec.apply(RecordUpdate::status(DocumentStatus::Processed).with_text_key("t"))
            .unwrap();
        assert_eq!(rec.error, None);
        assert_eq!(rec.text_key.as_deref(), Some("t"));
    }
}
