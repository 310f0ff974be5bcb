// Copyright (c) Weibo Archiver Team
// SPDX-License-Identifier: Apache-2.0

//! Field-level update policy shared by the post and author upserts.
//!
//! For each incoming field: missing stored value means "set and log an
//! addition"; a differing stored value means "log removal of the old and
//! addition of the new, then overwrite". Count-like fields skip the logging
//! entirely, append-only fields union instead of overwriting, and clearable
//! fields are explicitly nulled when a full refresh no longer carries them.

use crate::error::{ArchiveError, Result};
use crate::transcript::Transcript;

/// Guard for values about to be persisted: truthy or exactly zero. Catches
/// empty-string placeholders before they reach the store.
pub trait Writable {
    fn is_writable(&self) -> bool;
}

impl Writable for String {
    fn is_writable(&self) -> bool {
        !self.is_empty()
    }
}
impl Writable for i32 {
    fn is_writable(&self) -> bool {
        true
    }
}
impl Writable for i64 {
    fn is_writable(&self) -> bool {
        true
    }
}
impl Writable for f64 {
    fn is_writable(&self) -> bool {
        true
    }
}
impl Writable for bool {
    fn is_writable(&self) -> bool {
        true
    }
}

/// Merge one overwritable scalar field, logging the diff.
pub fn merge_field<T>(
    tx: &mut Transcript,
    entity: &str,
    field: &str,
    stored: Option<T>,
    incoming: Option<T>,
) -> Result<Option<T>>
where
    T: PartialEq + std::fmt::Display + Writable,
{
    match incoming {
        None => Ok(stored),
        Some(new) => {
            if !new.is_writable() {
                return Err(ArchiveError::validation(format!(
                    "{entity}: refusing to write empty value into {field}"
                )));
            }
            match stored {
                None => {
                    tx.added(entity, field, &new.to_string());
                    Ok(Some(new))
                }
                Some(old) if old == new => Ok(Some(old)),
                Some(old) => {
                    tx.conflict(entity, field, &old.to_string(), &new.to_string());
                    tx.removed(entity, field, &old.to_string());
                    tx.added(entity, field, &new.to_string());
                    Ok(Some(new))
                }
            }
        }
    }
}

/// Merge a count-like field. Counts churn constantly; logging every delta
/// would drown the transcript, so they update silently.
pub fn merge_count(stored: Option<i64>, incoming: Option<i64>) -> Option<i64> {
    incoming.or(stored)
}

/// Merge an append-only list field stored as a newline-joined string.
/// Entries are unioned in first-seen order; nothing is ever removed.
pub fn merge_union(
    tx: &mut Transcript,
    entity: &str,
    field: &str,
    stored: Option<String>,
    incoming: &[String],
) -> Option<String> {
    let mut entries: Vec<String> = stored
        .as_deref()
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default();
    for item in incoming {
        if item.is_empty() {
            continue;
        }
        if !entries.iter().any(|e| e == item) {
            tx.added(entity, field, item);
            entries.push(item.clone());
        }
    }
    if entries.is_empty() {
        None
    } else {
        Some(entries.join("\n"))
    }
}

/// Merge a field that can only ever be cleared explicitly. On a full
/// refresh, absence upstream means the value really went away; null it with
/// a logged removal instead of letting schema drift erase it silently.
pub fn merge_clearable<T>(
    tx: &mut Transcript,
    entity: &str,
    field: &str,
    stored: Option<T>,
    incoming: Option<T>,
    full_refresh: bool,
) -> Result<Option<T>>
where
    T: PartialEq + std::fmt::Display + Writable,
{
    match (&incoming, full_refresh) {
        (None, true) => {
            if let Some(old) = stored {
                tx.removed(entity, field, &old.to_string());
            }
            Ok(None)
        }
        _ => merge_field(tx, entity, field, stored, incoming),
    }
}
