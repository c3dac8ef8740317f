//! Document generation: one run from request to published HTML.
//!
//! ## Run phases
//!
//! ```text
//! validate → key → [reuse?] → resolve + fetch (per request)
//!          → parse scripture → link context → parse helps
//!          → assemble → shell → publish → render handoff
//! ```
//!
//! Scripture is parsed before any helps so that note links, verse headings
//! and word occurrences can see which books are present. Models are kept
//! in request order throughout; a request that fails at any phase leaves a
//! [`Diagnostic`] behind and the run continues without it.
//!
//! ## Files
//!
//! ```text
//! working_dir/{key}/sources/{lang}_{type}_{book}/   unpacked assets
//! working_dir/{key}/{key}.html                      intermediate
//! output_dir/.{key}.html.part                       staged copy
//! output_dir/{key}.html                             published
//! output_dir/{key}.{pdf,epub,docx}                  renderer outputs
//! ```
//!
//! The shell (cover, embedded CSS) is rendered with maud. Nothing in it
//! depends on the clock, so identical inputs give identical bytes.

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use maud::{DOCTYPE, Markup, PreEscaped, html};
use serde::Serialize;
use thiserror::Error;

use crate::assembly::{self, Assembly, AssemblyError};
use crate::catalog::{self, CatalogClient};
use crate::config::AssemblerConfig;
use crate::control::{Interrupt, RunControl, WorkingDir};
use crate::fetch::{Fetcher, LocalAssetHandle};
use crate::helps::{self, HelpsSource, WordArticle};
use crate::http::HttpClient;
use crate::key::document_request_key;
use crate::links::LinkContext;
use crate::model::{AuxKind, ModelBody, ParsedBook, ResourceModel};
use crate::naming::{self, ResourceKind};
use crate::render::Renderer;
use crate::types::{DocumentRequest, ResourceLookupDto, ResourceRequest};
use crate::usfm::{UsfmError, UsfmOptions, parse_usfm};

const CSS: &str = include_str!("../static/style.css");

// ============================================================================
// Outcomes
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiagnosticKind {
    ResourceAssetFileNotFound,
    MissingChapterMarker,
    MalformedSource,
    MissingVerses,
    Transient,
    RendererFailed,
}

/// A per-resource problem the run recovered from.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    /// `None` for problems that belong to the run, like renderer failures.
    pub request: Option<ResourceRequest>,
    pub kind: DiagnosticKind,
    pub message: String,
}

impl Diagnostic {
    fn for_request(request: &ResourceRequest, kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            request: Some(request.clone()),
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.request {
            Some(request) => write!(f, "{request}: {:?}: {}", self.kind, self.message),
            None => write!(f, "{:?}: {}", self.kind, self.message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    InvalidDocumentRequest,
    NoBooks,
    NoSharedResources,
    Transient,
    Cancelled,
    Io,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A run-level failure. Nothing was published.
#[derive(Error, Debug, Clone)]
#[error("run {key} failed ({kind}): {message}")]
pub struct RunFailure {
    pub key: String,
    pub kind: FailureKind,
    pub message: String,
    pub diagnostics: Vec<Diagnostic>,
}

/// A published document.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub key: String,
    pub html_path: PathBuf,
    /// An existing fresh output was served instead of regenerating.
    pub reused: bool,
    /// Renderer outputs written after publishing.
    pub rendered: Vec<PathBuf>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Internal abort reason, wrapped into a [`RunFailure`] at the top.
#[derive(Debug)]
struct Abort {
    kind: FailureKind,
    message: String,
}

impl Abort {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<Interrupt> for Abort {
    fn from(interrupt: Interrupt) -> Self {
        let kind = match interrupt {
            Interrupt::Cancelled => FailureKind::Cancelled,
            Interrupt::TimedOut => FailureKind::Transient,
        };
        Abort::new(kind, interrupt.to_string())
    }
}

impl From<AssemblyError> for Abort {
    fn from(e: AssemblyError) -> Self {
        match e {
            AssemblyError::NoBooks => Abort::new(FailureKind::NoBooks, e.to_string()),
            AssemblyError::NoSharedResources => {
                Abort::new(FailureKind::NoSharedResources, e.to_string())
            }
            AssemblyError::Interrupted(interrupt) => interrupt.into(),
        }
    }
}

impl From<std::io::Error> for Abort {
    fn from(e: std::io::Error) -> Self {
        Abort::new(FailureKind::Io, e.to_string())
    }
}

// ============================================================================
// Pipeline
// ============================================================================

/// Collaborators shared by every run.
pub struct Pipeline<'a> {
    pub config: &'a AssemblerConfig,
    pub catalog: &'a CatalogClient,
    pub http: &'a dyn HttpClient,
    pub renderer: &'a dyn Renderer,
}

/// Parse a JSON request and run it.
pub fn generate_from_json(
    pipeline: &Pipeline<'_>,
    json: &str,
    control: &RunControl,
) -> Result<RunOutcome, RunFailure> {
    let request: DocumentRequest = serde_json::from_str(json).map_err(|e| RunFailure {
        key: String::new(),
        kind: FailureKind::InvalidDocumentRequest,
        message: e.to_string(),
        diagnostics: Vec::new(),
    })?;
    generate_document(pipeline, &request, control)
}

/// Run one document request to a published `{key}.html`.
pub fn generate_document(
    pipeline: &Pipeline<'_>,
    request: &DocumentRequest,
    control: &RunControl,
) -> Result<RunOutcome, RunFailure> {
    let key = document_request_key(request);
    let fail = |abort: Abort, diagnostics: Vec<Diagnostic>| RunFailure {
        key: key.clone(),
        kind: abort.kind,
        message: abort.message,
        diagnostics,
    };

    if let Err(e) = request.validate() {
        return Err(fail(
            Abort::new(FailureKind::InvalidDocumentRequest, e.to_string()),
            Vec::new(),
        ));
    }

    let config = pipeline.config;
    let output_dir = &config.paths.output_dir;
    let html_path = output_dir.join(format!("{key}.html"));
    if let Some(window) = config.run.reuse_window()
        && catalog::file_is_fresh(&html_path, window)
    {
        tracing::info!(key = %key, "reusing published document");
        return Ok(RunOutcome {
            key,
            html_path,
            reused: true,
            rendered: Vec::new(),
            diagnostics: Vec::new(),
        });
    }

    tracing::info!(
        key = %key,
        strategy = %request.assembly_strategy_kind,
        resources = request.resource_requests.len(),
        "starting run"
    );

    let working = WorkingDir::create(
        &config.paths.working_dir,
        &key,
        config.run.retain_working_dir_on_failure,
    )
    .map_err(|e| fail(e.into(), Vec::new()))?;

    let mut diagnostics = Vec::new();
    let built = build(pipeline, request, &key, &working, control, &mut diagnostics)
        .and_then(|html| publish(&html, &working, output_dir, &key).map_err(Abort::from));

    match built {
        Ok(html_path) => {
            working.succeed();
            let rendered = render_outputs(pipeline.renderer, request, &html_path, &key, &mut diagnostics);
            tracing::info!(
                key = %key,
                path = %html_path.display(),
                diagnostics = diagnostics.len(),
                "published"
            );
            Ok(RunOutcome {
                key,
                html_path,
                reused: false,
                rendered,
                diagnostics,
            })
        }
        Err(abort) => {
            tracing::warn!(key = %key, kind = %abort.kind, message = %abort.message, "run failed");
            if abort.kind == FailureKind::Cancelled {
                working.cancelled();
            } else {
                working.fail();
            }
            Err(fail(abort, diagnostics))
        }
    }
}

/// Everything up to the final HTML string.
fn build(
    pipeline: &Pipeline<'_>,
    request: &DocumentRequest,
    key: &str,
    working: &WorkingDir,
    control: &RunControl,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<String, Abort> {
    let requests = request.unique_requests();
    let fetched = resolve_all(pipeline, &requests, working, control, diagnostics)?;
    control.check()?;
    let models = parse_all(&requests, fetched, control, diagnostics)?;

    let resolved: Vec<ResourceModel> = models.into_iter().flatten().collect();
    if !resolved.iter().any(|m| m.scripture().is_some())
        && diagnostics.iter().any(|d| d.kind == DiagnosticKind::Transient)
    {
        return Err(Abort::new(
            FailureKind::Transient,
            "no scripture resolved and at least one resource failed transiently",
        ));
    }

    let assembly = assembly::assemble(&resolved, request.assembly_strategy_kind, control)?;
    for missing in &assembly.missing {
        let verses: Vec<String> = missing
            .keys
            .iter()
            .map(|k| format!("{}:{}", k.chapter, k.verse))
            .collect();
        diagnostics.push(Diagnostic::for_request(
            &missing.request,
            DiagnosticKind::MissingVerses,
            format!("lacks verses present elsewhere: {}", verses.join(", ")),
        ));
    }

    let unresolved: Vec<&ResourceRequest> = requests
        .iter()
        .filter(|r| !resolved.iter().any(|m| &m.request == *r))
        .collect();
    tracing::debug!(key, blocks = assembly.blocks.len(), "assembled");
    Ok(render_document(&assembly, &resolved, &unresolved).into_string())
}

// ============================================================================
// Resolution
// ============================================================================

struct Fetched {
    index: usize,
    dto: ResourceLookupDto,
    handle: LocalAssetHandle,
}

fn resolve_all(
    pipeline: &Pipeline<'_>,
    requests: &[ResourceRequest],
    working: &WorkingDir,
    control: &RunControl,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<Vec<Fetched>, Abort> {
    let fetcher =
        Fetcher::new(pipeline.http, &pipeline.config.http, &working.sources()).with_control(control);
    let mut catalog_refreshed = false;
    let mut fetched = Vec::new();
    for (index, request) in requests.iter().enumerate() {
        control.check()?;
        let Some(mut dto) = lookup(pipeline, request, control, diagnostics)? else {
            continue;
        };
        let mut result = fetcher.fetch(&dto, request);
        // A cached catalog may still point at an asset that has moved.
        if !catalog_refreshed && matches!(&result, Err(e) if e.is_not_found()) {
            catalog_refreshed = true;
            if let Some(fresh) = lookup_after_refresh(pipeline, request, control)?
                && fresh.url != dto.url
            {
                tracing::info!(request = %request, url = fresh.url.as_deref().unwrap_or(""), "asset moved");
                dto = fresh;
                result = fetcher.fetch(&dto, request);
            }
        }
        match result {
            Ok(handle) => fetched.push(Fetched { index, dto, handle }),
            Err(e) => {
                if let Some(interrupt) = e.interrupt() {
                    return Err(interrupt.into());
                }
                tracing::warn!(request = %request, error = %e, "fetch failed");
                let kind = if e.is_transient() {
                    DiagnosticKind::Transient
                } else {
                    DiagnosticKind::ResourceAssetFileNotFound
                };
                diagnostics.push(Diagnostic::for_request(request, kind, e.to_string()));
            }
        }
    }
    Ok(fetched)
}

/// Catalog lookup for one request. Misses and catalog failures become
/// diagnostics; only an interrupted run is an error.
fn lookup(
    pipeline: &Pipeline<'_>,
    request: &ResourceRequest,
    control: &RunControl,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<Option<ResourceLookupDto>, Abort> {
    match pipeline.catalog.lookup(request, control) {
        Ok(Some(dto)) => Ok(Some(dto)),
        Ok(None) => {
            tracing::warn!(lang = %request.lang_code, resource_type = %request.resource_type, book = %request.resource_code, "not in catalog");
            diagnostics.push(Diagnostic::for_request(
                request,
                DiagnosticKind::ResourceAssetFileNotFound,
                "no matching catalog entry",
            ));
            Ok(None)
        }
        Err(e) => {
            if let Some(interrupt) = e.interrupt() {
                return Err(interrupt.into());
            }
            let kind = if e.is_transient() {
                DiagnosticKind::Transient
            } else {
                DiagnosticKind::ResourceAssetFileNotFound
            };
            diagnostics.push(Diagnostic::for_request(request, kind, e.to_string()));
            Ok(None)
        }
    }
}

/// Fetch a new catalog and look `request` up in it.
fn lookup_after_refresh(
    pipeline: &Pipeline<'_>,
    request: &ResourceRequest,
    control: &RunControl,
) -> Result<Option<ResourceLookupDto>, Abort> {
    tracing::warn!(request = %request, "asset url not found, refreshing catalog");
    match pipeline.catalog.refresh(control) {
        Ok(snapshot) => Ok(snapshot.lookup(request, &pipeline.config.catalog.format_priority)),
        Err(e) => {
            if let Some(interrupt) = e.interrupt() {
                return Err(interrupt.into());
            }
            tracing::warn!(error = %e, "catalog refresh failed");
            Ok(None)
        }
    }
}

// ============================================================================
// Parsing
// ============================================================================

/// `{lang}-{type}-`, restricted to characters safe in an id.
fn anchor_prefix(request: &ResourceRequest) -> String {
    let slug = |s: &str| -> String {
        s.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect()
    };
    format!("{}-{}-", slug(&request.lang_code), slug(&request.resource_type))
}

fn model(request: &ResourceRequest, dto: &ResourceLookupDto, body: ModelBody) -> ResourceModel {
    ResourceModel {
        request: request.clone(),
        kind: ResourceKind::for_type(&request.resource_type),
        lang_name: dto.lang_name.clone(),
        resource_type_name: dto.resource_type_name.clone(),
        rtl: dto.rtl,
        body,
    }
}

fn parse_scripture(
    request: &ResourceRequest,
    handle: &LocalAssetHandle,
    prefix: &str,
) -> Result<ParsedBook, Diagnostic> {
    let book_id = request.book_id();
    let source = match handle.usfm_file(book_id) {
        Some(path) => fs::read_to_string(path).map_err(|e| {
            Diagnostic::for_request(request, DiagnosticKind::MalformedSource, format!("{}: {e}", path.display()))
        })?,
        None => handle.verse_file_tree(book_id).ok_or_else(|| {
            Diagnostic::for_request(
                request,
                DiagnosticKind::ResourceAssetFileNotFound,
                format!("no USFM for {book_id} in asset"),
            )
        })?,
    };
    let options = UsfmOptions {
        anchor_prefix: prefix.to_string(),
    };
    match parse_usfm(&source, book_id, &options) {
        Ok(document) => {
            for warning in &document.warnings {
                tracing::warn!(request = %request, warning = %warning, "usfm");
            }
            Ok(document.book)
        }
        Err(e @ UsfmError::MissingChapterMarker { .. }) => Err(Diagnostic::for_request(
            request,
            DiagnosticKind::MissingChapterMarker,
            e.to_string(),
        )),
        Err(e) => Err(Diagnostic::for_request(
            request,
            DiagnosticKind::MalformedSource,
            e.to_string(),
        )),
    }
}

/// Scripture of `book_id`, preferring the language of the helps.
fn scripture_for<'m>(
    models: &'m [Option<ResourceModel>],
    lang: &str,
    book_id: &str,
) -> Option<&'m ParsedBook> {
    let scriptures: Vec<&ResourceModel> = models
        .iter()
        .flatten()
        .filter(|m| m.request.book_id() == book_id && m.scripture().is_some())
        .collect();
    scriptures
        .iter()
        .copied()
        .find(|m| m.request.lang_code == lang)
        .or(scriptures.first().copied())
        .and_then(|m| m.scripture())
}

/// Occurrences of words only count in scripture of the same language.
fn same_language_scripture<'m>(
    models: &'m [Option<ResourceModel>],
    lang: &str,
    book_id: &str,
) -> Option<&'m ParsedBook> {
    models
        .iter()
        .flatten()
        .filter(|m| m.request.book_id() == book_id && m.request.lang_code == lang)
        .find_map(|m| m.scripture())
}

fn parse_all(
    requests: &[ResourceRequest],
    fetched: Vec<Fetched>,
    control: &RunControl,
    diagnostics: &mut Vec<Diagnostic>,
) -> Result<Vec<Option<ResourceModel>>, Abort> {
    let mut models: Vec<Option<ResourceModel>> = vec![None; requests.len()];
    let kind_of = |f: &Fetched| ResourceKind::for_type(&requests[f.index].resource_type);

    // Scripture first: the first book of each id owns the bare anchors.
    let mut anchored: BTreeSet<String> = BTreeSet::new();
    let mut links = LinkContext::new();
    for f in fetched.iter().filter(|f| kind_of(*f) == ResourceKind::Scripture) {
        control.check()?;
        let request = &requests[f.index];
        let prefix = if anchored.contains(request.book_id()) {
            anchor_prefix(request)
        } else {
            String::new()
        };
        match parse_scripture(request, &f.handle, &prefix) {
            Ok(book) => {
                tracing::debug!(request = %request, chapters = book.chapters.len(), verses = book.verse_count(), "parsed scripture");
                anchored.insert(request.book_id().to_string());
                links.add_book(request.book_id());
                models[f.index] = Some(model(request, &f.dto, ModelBody::Scripture(book)));
            }
            Err(diagnostic) => {
                tracing::warn!(request = %request, message = %diagnostic.message, "dropping scripture");
                diagnostics.push(diagnostic);
            }
        }
    }

    // Words next, so notes can link into the glossary.
    let mut articles: Vec<(usize, Vec<WordArticle>)> = Vec::new();
    for f in fetched.iter().filter(|f| kind_of(*f) == ResourceKind::Words) {
        let request = &requests[f.index];
        let Some(dir) = f.handle.words_dir() else {
            diagnostics.push(Diagnostic::for_request(
                request,
                DiagnosticKind::ResourceAssetFileNotFound,
                "no kt/names/other directories in asset",
            ));
            continue;
        };
        let scripture = same_language_scripture(&models, &request.lang_code, request.book_id());
        let loaded = helps::load_words(&dir).and_then(|loaded| {
            // Unused entries are dropped from the glossary, so they are
            // not link targets either.
            for article in helps::words_in_use(&loaded, scripture)? {
                links.add_word(&request.lang_code, &article.slug, &article.term);
            }
            Ok(loaded)
        });
        match loaded {
            Ok(loaded) => articles.push((f.index, loaded)),
            Err(e) => diagnostics.push(Diagnostic::for_request(
                request,
                DiagnosticKind::MalformedSource,
                e.to_string(),
            )),
        }
    }

    for f in fetched.iter() {
        let kind = kind_of(f);
        if !matches!(kind, ResourceKind::Notes | ResourceKind::Questions) {
            continue;
        }
        control.check()?;
        let request = &requests[f.index];
        let book_id = request.book_id();
        let book_name = scripture_for(&models, &request.lang_code, book_id)
            .map(|b| b.display_name.clone())
            .unwrap_or_else(|| naming::book_name(book_id));
        let source = HelpsSource {
            lang: &request.lang_code,
            book_id,
            book_name: &book_name,
            links: &links,
        };
        let aux_kind = if kind == ResourceKind::Notes {
            AuxKind::Note
        } else {
            AuxKind::Question
        };
        let parsed = match (f.handle.book_dir(book_id), f.handle.tsv_file(book_id)) {
            (Some(dir), _) => helps::parse_markdown_tree(&dir, aux_kind, &source),
            (None, Some(tsv)) if kind == ResourceKind::Notes => helps::parse_notes_tsv(tsv, &source),
            _ => {
                diagnostics.push(Diagnostic::for_request(
                    request,
                    DiagnosticKind::ResourceAssetFileNotFound,
                    format!("no {book_id} directory or TSV in asset"),
                ));
                continue;
            }
        };
        match parsed {
            Ok(aux) => models[f.index] = Some(model(request, &f.dto, ModelBody::Aux(aux))),
            Err(e) => diagnostics.push(Diagnostic::for_request(
                request,
                DiagnosticKind::MalformedSource,
                e.to_string(),
            )),
        }
    }

    for (index, loaded) in articles {
        control.check()?;
        let request = &requests[index];
        let Some(f) = fetched.iter().find(|f| f.index == index) else {
            continue;
        };
        let book_id = request.book_id();
        let scripture = same_language_scripture(&models, &request.lang_code, book_id);
        let book_name = scripture
            .map(|b| b.display_name.clone())
            .unwrap_or_else(|| naming::book_name(book_id));
        let source = HelpsSource {
            lang: &request.lang_code,
            book_id,
            book_name: &book_name,
            links: &links,
        };
        match helps::build_words_book(&loaded, scripture, &source) {
            Ok(aux) => models[index] = Some(model(request, &f.dto, ModelBody::Aux(aux))),
            Err(e) => diagnostics.push(Diagnostic::for_request(
                request,
                DiagnosticKind::MalformedSource,
                e.to_string(),
            )),
        }
    }

    Ok(models)
}

// ============================================================================
// Document shell
// ============================================================================

fn render_document(
    assembly: &Assembly,
    models: &[ResourceModel],
    unresolved: &[&ResourceRequest],
) -> Markup {
    let title = assembly.book_names.join(", ");
    let lang = models
        .first()
        .map(|m| m.request.lang_code.as_str())
        .unwrap_or("en");
    html! {
        (DOCTYPE)
        html lang=(lang) {
            head {
                meta charset="UTF-8";
                title { (title) }
                style { (PreEscaped(CSS)) }
            }
            body {
                (cover(&title, models, unresolved))
                main {
                    @for block in &assembly.blocks {
                        (PreEscaped(block))
                    }
                }
            }
        }
    }
}

fn cover(title: &str, models: &[ResourceModel], unresolved: &[&ResourceRequest]) -> Markup {
    html! {
        header.cover {
            h1.document-title { (title) }
            ul.resources {
                @for model in models {
                    li lang=(model.request.lang_code) {
                        (model.resource_type_name) " (" (model.lang_name) ")"
                    }
                }
            }
            @if !unresolved.is_empty() {
                div.unresolved {
                    h2 { "Resources not found" }
                    ul {
                        @for request in unresolved {
                            li { (request.to_string()) }
                        }
                    }
                }
            }
        }
    }
}

// ============================================================================
// Publishing and rendering
// ============================================================================

/// Write the intermediate copy, stage it next to the output and rename it
/// into place.
fn publish(html: &str, working: &WorkingDir, output_dir: &Path, key: &str) -> std::io::Result<PathBuf> {
    let intermediate = working.path().join(format!("{key}.html"));
    fs::write(&intermediate, html)?;
    fs::create_dir_all(output_dir)?;
    let staged = output_dir.join(format!(".{key}.html.part"));
    fs::copy(&intermediate, &staged)?;
    let published = output_dir.join(format!("{key}.html"));
    fs::rename(&staged, &published)?;
    Ok(published)
}

fn render_outputs(
    renderer: &dyn Renderer,
    request: &DocumentRequest,
    html_path: &Path,
    key: &str,
    diagnostics: &mut Vec<Diagnostic>,
) -> Vec<PathBuf> {
    let mut rendered = Vec::new();
    for format in request.requested_formats() {
        let output = html_path.with_file_name(format!("{key}.{}", format.extension()));
        match renderer.render(html_path, format, &output) {
            Ok(()) => rendered.push(output),
            Err(e) => {
                tracing::warn!(key, format = %format, error = %e, "render failed");
                diagnostics.push(Diagnostic {
                    request: None,
                    kind: DiagnosticKind::RendererFailed,
                    message: format!("{format}: {e}"),
                });
            }
        }
    }
    rendered
}
