// Copyright (c) Weibo Archiver Team
// SPDX-License-Identifier: Apache-2.0

//! Session transcript: the human-readable audit trail of a run.
//!
//! Every field addition, removal, conflict and skip lands here and in the
//! tracing log; the transcript is additionally flushed to an HTML file when
//! a command finishes or dies, because grepping a terminal scrollback is a
//! poor way to audit an archive. Watch mode flushes and drains after every
//! cycle instead, one file per cycle, so the log never grows unbounded.

use chrono::{DateTime, Utc};
use std::fmt::Write as _;
use std::path::Path;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Added,
    Removed,
    Conflict,
    Skipped,
    Note,
}

impl Kind {
    fn label(&self) -> &'static str {
        match self {
            Kind::Added => "added",
            Kind::Removed => "removed",
            Kind::Conflict => "conflict",
            Kind::Skipped => "skipped",
            Kind::Note => "note",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub at: DateTime<Utc>,
    pub kind: Kind,
    pub entity: String,
    pub detail: String,
}

#[derive(Debug, Default)]
pub struct Transcript {
    entries: Vec<Entry>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, kind: Kind, entity: &str, detail: String) {
        self.entries.push(Entry {
            at: Utc::now(),
            kind,
            entity: entity.to_string(),
            detail,
        });
    }

    pub fn added(&mut self, entity: &str, field: &str, value: &str) {
        info!(entity, field, value, "field added");
        self.push(Kind::Added, entity, format!("{field} = {value}"));
    }

    pub fn removed(&mut self, entity: &str, field: &str, value: &str) {
        info!(entity, field, value, "field removed");
        self.push(Kind::Removed, entity, format!("{field} was {value}"));
    }

    pub fn conflict(&mut self, entity: &str, field: &str, old: &str, new: &str) {
        warn!(entity, field, old, new, "field conflict");
        self.push(
            Kind::Conflict,
            entity,
            format!("{field}: {old} -> {new}"),
        );
    }

    pub fn skipped(&mut self, entity: &str, reason: &str) {
        warn!(entity, reason, "item skipped");
        self.push(Kind::Skipped, entity, reason.to_string());
    }

    pub fn note(&mut self, entity: &str, detail: &str) {
        info!(entity, detail, "note");
        self.push(Kind::Note, entity, detail.to_string());
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Take every entry out of the transcript, leaving it empty. Watch mode
    /// flushes each cycle to its own file this way so the in-memory log
    /// never grows across cycles.
    pub fn drain(&mut self) -> Vec<Entry> {
        std::mem::take(&mut self.entries)
    }

    /// Count of diff-producing lines (everything except notes). Used by
    /// tests to assert that an unchanged upsert is silent.
    pub fn diff_len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.kind != Kind::Note)
            .count()
    }

    pub fn render_html(&self, title: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "<!DOCTYPE html><html><head><meta charset=\"utf-8\">");
        let _ = writeln!(out, "<title>{}</title>", escape(title));
        let _ = writeln!(
            out,
            "<style>body{{font-family:monospace}} .conflict{{color:#b00}} \
             .removed{{color:#777;text-decoration:line-through}} \
             .skipped{{color:#a60}}</style></head><body>"
        );
        let _ = writeln!(out, "<h1>{}</h1><table>", escape(title));
        for e in &self.entries {
            let _ = writeln!(
                out,
                "<tr class=\"{}\"><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                e.kind.label(),
                e.at.format("%Y-%m-%d %H:%M:%S"),
                e.kind.label(),
                escape(&e.entity),
                escape(&e.detail),
            );
        }
        let _ = writeln!(out, "</table></body></html>");
        out
    }

    pub fn write_html(&self, path: &Path, title: &str) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.render_html(title))
    }
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_every_decision_kind() {
        let mut t = Transcript::new();
        t.added("post 1", "text", "hello");
        t.removed("post 1", "video_url", "http://v");
        t.conflict("author 2", "hometown", "上海", "北京");
        t.skipped("post 3", "gone upstream");
        t.note("run", "2 posts fetched");
        assert_eq!(t.entries().len(), 5);
        assert_eq!(t.diff_len(), 4);
    }

    #[test]
    fn draining_leaves_the_transcript_empty() {
        let mut t = Transcript::new();
        t.added("post 1", "text", "hello");
        t.skipped("post 2", "gone");
        let drained = t.drain();
        assert_eq!(drained.len(), 2);
        assert!(t.is_empty());
        assert_eq!(t.diff_len(), 0);
        // A drained transcript keeps accepting entries.
        t.note("run", "next cycle");
        assert_eq!(t.entries().len(), 1);
    }

    #[test]
    fn html_escapes_payloads() {
        let mut t = Transcript::new();
        t.added("post 1", "text", "<script>alert(1)</script>");
        let html = t.render_html("run");
        assert!(!html.contains("<script>alert"));
        assert!(html.contains("&lt;script&gt;"));
    }
}
