//! Opaque cursor pagination for the audit query surface.
//!
//! Cursors are base64-encoded UUIDs. Audit entry ids are UUIDv7, so the id
//! alone gives a stable time-ordered position.

use anyhow::{Context, Result};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Serialize;
use uuid::Uuid;

/// Opaque cursor for pagination (base64-encoded UUID).
#[derive(Debug, Clone)]
pub struct Cursor(Uuid);

impl Cursor {
    pub fn new(id: Uuid) -> Self {
        Cursor(id)
    }

    /// Encode the cursor as a base64 string.
    pub fn encode(&self) -> String {
        URL_SAFE_NO_PAD.encode(self.0.as_bytes())
    }

    /// Decode a cursor string back to a Cursor.
    pub fn decode(s: &str) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(s)
            .context("Invalid cursor: not valid base64")?;
        let uuid = Uuid::from_slice(&bytes).context("Invalid cursor: not a valid UUID")?;
        Ok(Cursor(uuid))
    }

    pub fn into_uuid(self) -> Uuid {
        self.0
    }
}

/// One page of results plus the cursor for the next page, if any.
#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    /// Build a page from `limit + 1` fetched rows: the extra row signals a
    /// next page and is dropped from the output.
    pub fn from_rows(mut rows: Vec<T>, limit: usize, cursor_of: impl Fn(&T) -> Uuid) -> Self {
        let has_more = rows.len() > limit;
        if has_more {
            rows.truncate(limit);
        }
        let next_cursor = if has_more {
            rows.last().map(|row| Cursor::new(cursor_of(row)).encode())
        } else {
            None
        };
        Page {
            items: rows,
            next_cursor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_roundtrip() {
        let id = Uuid::new_v4();
        let encoded = Cursor::new(id).encode();
        let decoded = Cursor::decode(&encoded).unwrap();
        assert_eq!(decoded.into_uuid(), id);
    }

    #[test]
    fn invalid_cursor_is_rejected() {
        assert!(Cursor::decode("not base64!!").is_err());
        assert!(Cursor::decode("aGVsbG8").is_err()); // valid base64, wrong length
    }

    #[test]
    fn page_truncates_and_sets_next_cursor() {
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let page = Page::from_rows(ids.clone(), 3, |id| *id);
        assert_eq!(page.items.len(), 3);
        assert_eq!(
            page.next_cursor,
            Some(Cursor::new(ids[2]).encode()),
        );
    }

    #[test]
    fn short_page_has_no_next_cursor() {
        let ids: Vec<Uuid> = (0..2).map(|_| Uuid::new_v4()).collect();
        let page = Page::from_rows(ids, 3, |id| *id);
        assert_eq!(page.items.len(), 2);
        assert!(page.next_cursor.is_none());
    }
}
