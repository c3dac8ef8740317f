//! # Scripture Assembler
//!
//! Builds one interleaved HTML document from several scripture and
//! translation-helps resources. A document request names resources as
//! `(lang, type, book)` triples and an assembly strategy; the assembler
//! resolves each through a resource catalog, fetches and unpacks the asset,
//! parses it into a per-book model, and weaves all models into a single page
//! keyed by a hash of the request.
//!
//! # Architecture: One Run, Five Phases
//!
//! ```text
//! 1. Resolve    request  →  ResourceLookupDto    (catalog, cached on disk)
//! 2. Fetch      dto      →  LocalAssetHandle     (download + unpack)
//! 3. Parse      asset    →  ResourceModel        (USFM / markdown / TSV)
//! 4. Assemble   models   →  Assembly             (strategy-driven interleave)
//! 5. Publish    assembly →  output/{key}.html    (+ optional renderer handoff)
//! ```
//!
//! A resource that fails to resolve, fetch or parse leaves a diagnostic and
//! the run continues without it. The run itself fails only when nothing
//! usable remains.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`types`] | Document and resource requests, strategies, catalog lookup results |
//! | [`key`] | Deterministic document request key |
//! | [`naming`] | Book table, resource kinds, display names, script direction |
//! | [`config`] | Layered `config.toml` loading and validation |
//! | [`http`] | Blocking HTTP client seam with retry and backoff |
//! | [`catalog`] | Catalog download, disk cache and lookup |
//! | [`fetch`] | Asset download and archive unpacking |
//! | [`usfm`] | USFM scripture parser |
//! | [`links`] | Translation-helps link rewriting |
//! | [`helps`] | Notes, questions and words parsers |
//! | [`model`] | Parsed book and helps models, slot lookup |
//! | [`assembly`] | Interleaving strategies |
//! | [`control`] | Cancellation, wall clock, working directory |
//! | [`render`] | PDF / EPUB / DOCX handoff to external tools |
//! | [`generate`] | One document run end to end |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## Scripture First
//!
//! Scripture is parsed before any helps. Notes link to verses, word articles
//! record where their terms occur, and both need to know which books the
//! document actually contains.
//!
//! ## Maud For All Markup
//!
//! Every fragment the assembler writes goes through [Maud](https://maud.lambda.xyz/).
//! Text is escaped by default; helps markdown is rendered by pulldown-cmark
//! and spliced in as pre-escaped HTML.
//!
//! ## Deterministic Output
//!
//! The key, the anchors and the assembled bytes depend only on the request
//! and the fetched assets. Nothing reads the clock or iterates a hash map
//! while producing output.

pub mod assembly;
pub mod catalog;
pub mod config;
pub mod control;
pub mod fetch;
pub mod generate;
pub mod helps;
pub mod http;
pub mod key;
pub mod links;
pub mod model;
pub mod naming;
pub mod output;
pub mod render;
pub mod types;
pub mod usfm;

#[cfg(test)]
pub(crate) mod test_helpers;
