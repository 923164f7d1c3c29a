use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::enums::DocumentType;

/// Immutable pipeline input. Identity is the content hash.
#[derive(Debug, Clone, Serialize)]
pub struct RawDocument {
    #[serde(skip)]
    pub content: Arc<[u8]>,
    pub type_hint: Option<DocumentType>,
    pub session_id: Uuid,
    /// Display name for progress reporting only.
    pub file_name: Option<String>,
    pub content_hash: String,
    /// Zero-based page when `content` is a PDF rendered page by page.
    pub page: Option<usize>,
}

impl RawDocument {
    pub fn new(content: impl Into<Arc<[u8]>>, type_hint: Option<DocumentType>, session_id: Uuid) -> Self {
        let content = content.into();
        let content_hash = content_hash(&content);
        Self {
            content,
            type_hint,
            session_id,
            file_name: None,
            content_hash,
            page: None,
        }
    }

    /// One page of a PDF upload. Pages of the same file share `content` but
    /// not identity.
    pub fn pdf_page(pdf: Arc<[u8]>, page: usize, type_hint: Option<DocumentType>, session_id: Uuid) -> Self {
        let content_hash = format!("{}:{}", content_hash(&pdf), page + 1);
        Self {
            content: pdf,
            type_hint,
            session_id,
            file_name: None,
            content_hash,
            page: Some(page),
        }
    }

    pub fn with_file_name(mut self, name: &str) -> Self {
        self.file_name = Some(name.to_string());
        self
    }
}

pub fn is_pdf(bytes: &[u8]) -> bool {
    bytes.starts_with(b"%PDF-")
}

/// SHA-256 of the bytes, lowercase hex.
pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_bytes_share_identity() {
        let session = Uuid::new_v4();
        let a = RawDocument::new(b"same bytes".to_vec(), None, session);
        let b = RawDocument::new(b"same bytes".to_vec(), Some(DocumentType::Passport), Uuid::new_v4());
        assert_eq!(a.content_hash, b.content_hash);
        assert_eq!(a.content_hash.len(), 64);
    }

    #[test]
    fn different_bytes_differ() {
        assert_ne!(content_hash(b"a"), content_hash(b"b"));
    }

    #[test]
    fn pdf_pages_have_distinct_identity() {
        let pdf: Arc<[u8]> = b"%PDF-1.7 two pages".to_vec().into();
        assert!(is_pdf(&pdf));
        assert!(!is_pdf(b"\x89PNG"));

        let session = Uuid::new_v4();
        let first = RawDocument::pdf_page(Arc::clone(&pdf), 0, None, session);
        let second = RawDocument::pdf_page(Arc::clone(&pdf), 1, None, session);
        assert_ne!(first.content_hash, second.content_hash);
        assert_eq!(first.content_hash, format!("{}:1", content_hash(&pdf)));
        assert_eq!(second.page, Some(1));
    }

    #[test]
    fn known_digest() {
        assert_eq!(
            content_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
