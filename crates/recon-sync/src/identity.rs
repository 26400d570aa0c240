//! Identifier and email lookup tables over one snapshot.

use std::collections::HashMap;

use recon_core::{normalize_identifier, Snapshot};

/// Lowercased, trimmed email; `None` when nothing usable remains.
pub fn normalize_email(raw: &str) -> Option<String> {
    let email = raw.trim().to_lowercase();
    if recon_core::is_effectively_empty(&email) {
        None
    } else {
        Some(email)
    }
}

/// Which lookup produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchedBy {
    Identifier,
    Email,
}

/// Row positions keyed by identifier (integer and text forms) and by email.
///
/// Numeric identifiers are keyed by value so `"0042"`, `"42"` and `42.0` resolve to
/// the same row. Built per run; later rows win on email collisions.
#[derive(Debug, Default)]
pub struct IdentityIndex {
    by_int: HashMap<i64, usize>,
    by_text: HashMap<String, usize>,
    by_email: HashMap<String, usize>,
}

impl IdentityIndex {
    pub fn build(snapshot: &Snapshot, email_column: Option<&str>) -> Self {
        let mut index = Self::default();
        let email_column = email_column.filter(|c| snapshot.has_column(c));

        for (pos, record) in snapshot.records().iter().enumerate() {
            index.insert_identifier(&record.identifier, pos);
            if let Some(column) = email_column {
                if let Some(email) = normalize_email(&record.text(column)) {
                    index.by_email.insert(email, pos);
                }
            }
        }
        index
    }

    fn insert_identifier(&mut self, identifier: &str, pos: usize) {
        if identifier.is_empty() {
            return;
        }
        match identifier.parse::<i64>() {
            Ok(n) => {
                self.by_int.insert(n, pos);
            }
            Err(_) => {
                self.by_text.insert(identifier.to_string(), pos);
            }
        }
    }

    pub fn by_identifier(&self, raw: &str) -> Option<usize> {
        let key = normalize_identifier(raw);
        if key.is_empty() {
            return None;
        }
        match key.parse::<i64>() {
            Ok(n) => self.by_int.get(&n).copied(),
            Err(_) => self.by_text.get(&key).copied(),
        }
    }

    pub fn by_email(&self, raw: &str) -> Option<usize> {
        normalize_email(raw).and_then(|email| self.by_email.get(&email).copied())
    }

    /// Identifier first; email only when the identifier is absent or unknown.
    pub fn resolve(
        &self,
        identifier: Option<&str>,
        email: Option<&str>,
    ) -> Option<(usize, MatchedBy)> {
        identifier
            .and_then(|id| self.by_identifier(id))
            .map(|pos| (pos, MatchedBy::Identifier))
            .or_else(|| {
                email
                    .and_then(|e| self.by_email(e))
                    .map(|pos| (pos, MatchedBy::Email))
            })
    }

    pub fn len(&self) -> usize {
        self.by_int.len() + self.by_text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
