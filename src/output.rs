//! CLI output formatting.
//!
//! Output is **document-centric, not file-centric**. Each run leads with its
//! key and the published path, followed by indented context lines for
//! rendered formats and diagnostics. The `parse-usfm` outline leads with the
//! book and lists chapters by their positional index.
//!
//! ## Assemble
//!
//! ```text
//! 3f9c0a1b2d4e5f60 → output/3f9c0a1b2d4e5f60.html
//!     pdf: output/3f9c0a1b2d4e5f60.pdf
//!     Diagnostics
//!         xx/ulb/jud: ResourceAssetFileNotFound: not in catalog
//! ```
//!
//! ## Parse USFM
//!
//! ```text
//! Jude (jud)
//!     001 Chapter 1 (25 verses)
//!         bridges: 3-4
//! ```
//!
//! Each view has a `format_*` function returning `Vec<String>` and a
//! `print_*` wrapper that writes to stdout. Format functions do no I/O.

use crate::generate::{RunFailure, RunOutcome};
use crate::usfm::UsfmDocument;

/// Format a 1-based positional index as 3-digit zero-padded.
fn format_index(pos: usize) -> String {
    format!("{:0>3}", pos)
}

/// Return indentation string: 4 spaces per depth level.
fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

/// Truncate text to `max` characters, appending `...` if truncated.
fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

// ============================================================================
// Assemble
// ============================================================================

pub fn format_run_outcome(outcome: &RunOutcome) -> Vec<String> {
    let mut lines = Vec::new();
    let reused = if outcome.reused { " (reused)" } else { "" };
    lines.push(format!(
        "{} → {}{}",
        outcome.key,
        outcome.html_path.display(),
        reused
    ));
    for path in &outcome.rendered {
        let ext = path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();
        lines.push(format!("{}{}: {}", indent(1), ext, path.display()));
    }
    if !outcome.diagnostics.is_empty() {
        lines.push(format!("{}Diagnostics", indent(1)));
        for diagnostic in &outcome.diagnostics {
            lines.push(format!("{}{}", indent(2), truncate(&diagnostic.to_string(), 120)));
        }
    }
    lines
}

pub fn format_run_failure(failure: &RunFailure) -> Vec<String> {
    let key = if failure.key.is_empty() {
        "(no key)"
    } else {
        failure.key.as_str()
    };
    let mut lines = vec![format!("{} failed: {}", key, failure.kind)];
    lines.push(format!("{}{}", indent(1), failure.message));
    for diagnostic in &failure.diagnostics {
        lines.push(format!("{}{}", indent(1), truncate(&diagnostic.to_string(), 120)));
    }
    lines
}

pub fn print_run_outcome(outcome: &RunOutcome) {
    for line in format_run_outcome(outcome) {
        println!("{}", line);
    }
}

pub fn print_run_failure(failure: &RunFailure) {
    for line in format_run_failure(failure) {
        eprintln!("{}", line);
    }
}

// ============================================================================
// Parse USFM
// ============================================================================

pub fn format_usfm_outline(doc: &UsfmDocument) -> Vec<String> {
    let book = &doc.book;
    let mut lines = vec![format!("{} ({})", book.display_name, book.book_id)];
    if book.book_intro.is_some() {
        lines.push(format!("{}intro", indent(1)));
    }
    for (i, chapter) in book.chapters.iter().enumerate() {
        lines.push(format!(
            "{}{} {} ({} verses)",
            indent(1),
            format_index(i + 1),
            chapter.label,
            chapter.verses.len()
        ));
        let bridges: Vec<String> = chapter
            .verses
            .iter()
            .filter(|v| v.is_bridge())
            .map(|v| format!("{}-{}", v.number, v.last))
            .collect();
        if !bridges.is_empty() {
            lines.push(format!("{}bridges: {}", indent(2), bridges.join(", ")));
        }
    }
    if !doc.warnings.is_empty() {
        lines.push(String::new());
        lines.push("Warnings".to_string());
        for warning in &doc.warnings {
            lines.push(format!("{}{}", indent(1), warning));
        }
    }
    lines
}

pub fn print_usfm_outline(doc: &UsfmDocument) {
    for line in format_usfm_outline(doc) {
        println!("{}", line);
    }
}
