//! Object key layout for a document's artifacts.
//!
//! Every artifact of document `id` lives under `documents/{id}/`.

use std::path::Path;

fn prefix(doc_id: &str) -> String {
    format!("documents/{}", doc_id)
}

/// Original upload, keeping the source extension (lowercased, with dot)
pub fn original_key(doc_id: &str, filename: &str) -> String {
    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{}", e.to_lowercase()))
        .unwrap_or_default();
    format!("{}/{}{}", prefix(doc_id), doc_id, ext)
}

pub fn text_key(doc_id: &str) -> String {
    format!("{}/{}.txt", prefix(doc_id), doc_id)
}

pub fn anonymized_key(doc_id: &str) -> String {
    format!("{}/anon_{}.txt", prefix(doc_id), doc_id)
}

/// Structured record; the enriched record overwrites the same key
pub fn json_key(doc_id: &str) -> String {
    format!("{}/{}.json", prefix(doc_id), doc_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(original_key("abc", "Report.PDF"), "documents/abc/abc.pdf");
        assert_eq!(original_key("abc", "scan"), "documents/abc/abc");
        assert_eq!(text_key("abc"), "documents/abc/abc.txt");
        assert_eq!(anonymized_key("abc"), "documents/abc/anon_abc.txt");
        assert_eq!(json_key("abc"), "documents/abc/abc.json");
    }
}
