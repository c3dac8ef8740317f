//! Request and lookup types shared across the pipeline.
//!
//! A [`DocumentRequest`] arrives as JSON from the submission layer and is the
//! only input that determines a document's identity (see [`crate::key`]).
//! [`ResourceLookupDto`] is what the catalog hands to the fetcher.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::naming;

#[derive(Error, Debug)]
pub enum RequestError {
    #[error("malformed document request: {0}")]
    Json(#[from] serde_json::Error),
    #[error("document request has no resource requests")]
    Empty,
    #[error("resource request #{index}: {reason}")]
    InvalidResource { index: usize, reason: String },
}

/// How resources are interleaved in the assembled document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssemblyStrategy {
    /// Whole chapters grouped per resource.
    Book,
    /// Verse-interleaved within each chapter, in request order.
    Chapter,
    /// Verse-interleaved with intros and helps grouped by kind after scripture.
    Verse,
}

impl AssemblyStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            AssemblyStrategy::Book => "book",
            AssemblyStrategy::Chapter => "chapter",
            AssemblyStrategy::Verse => "verse",
        }
    }
}

impl fmt::Display for AssemblyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One (language, resource type, book) unit of content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub lang_code: String,
    pub resource_type: String,
    /// Canonical three-letter lowercase book id, e.g. `jud`.
    pub resource_code: String,
}

impl ResourceRequest {
    pub fn new(lang_code: &str, resource_type: &str, resource_code: &str) -> Self {
        Self {
            lang_code: lang_code.to_string(),
            resource_type: resource_type.to_string(),
            resource_code: resource_code.to_string(),
        }
    }

    pub fn book_id(&self) -> &str {
        &self.resource_code
    }
}

impl fmt::Display for ResourceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.lang_code, self.resource_type, self.resource_code
        )
    }
}

/// Inbound document request.
///
/// Fields beyond the strategy and the resource list are passthroughs for
/// collaborators: the core only reads the output format toggles, to know
/// which renderer targets to signal after publishing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRequest {
    pub assembly_strategy_kind: AssemblyStrategy,
    pub resource_requests: Vec<ResourceRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_address: Option<String>,
    #[serde(default)]
    pub generate_pdf: bool,
    #[serde(default)]
    pub generate_epub: bool,
    #[serde(default)]
    pub generate_docx: bool,
}

impl DocumentRequest {
    pub fn new(strategy: AssemblyStrategy, resource_requests: Vec<ResourceRequest>) -> Self {
        Self {
            assembly_strategy_kind: strategy,
            resource_requests,
            email_address: None,
            generate_pdf: false,
            generate_epub: false,
            generate_docx: false,
        }
    }

    /// Parse and validate a request from its JSON wire form.
    pub fn from_json(json: &str) -> Result<Self, RequestError> {
        let request: DocumentRequest = serde_json::from_str(json)?;
        request.validate()?;
        Ok(request)
    }

    /// Reject empty requests and resource triples with blank fields or
    /// non-canonical book ids. Unknown languages and resource types are
    /// valid here; the catalog decides whether they exist.
    pub fn validate(&self) -> Result<(), RequestError> {
        if self.resource_requests.is_empty() {
            return Err(RequestError::Empty);
        }
        for (index, r) in self.resource_requests.iter().enumerate() {
            let invalid = |reason: &str| RequestError::InvalidResource {
                index,
                reason: reason.to_string(),
            };
            if r.lang_code.trim().is_empty() {
                return Err(invalid("lang_code is empty"));
            }
            if r.resource_type.trim().is_empty() {
                return Err(invalid("resource_type is empty"));
            }
            if naming::book(&r.resource_code).is_none() {
                return Err(invalid(&format!(
                    "'{}' is not a canonical book id",
                    r.resource_code
                )));
            }
        }
        Ok(())
    }

    /// Resource requests with exact-triple duplicates removed, first
    /// occurrence wins.
    pub fn unique_requests(&self) -> Vec<ResourceRequest> {
        let mut seen = std::collections::HashSet::new();
        self.resource_requests
            .iter()
            .filter(|r| seen.insert((*r).clone()))
            .cloned()
            .collect()
    }

    /// Renderer targets toggled on in the request, in a fixed order.
    pub fn requested_formats(&self) -> Vec<OutputFormat> {
        let mut formats = Vec::new();
        if self.generate_pdf {
            formats.push(OutputFormat::Pdf);
        }
        if self.generate_epub {
            formats.push(OutputFormat::Epub);
        }
        if self.generate_docx {
            formats.push(OutputFormat::Docx);
        }
        formats
    }
}

/// Downstream rendering targets for the assembled HTML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Pdf,
    Epub,
    Docx,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Pdf => "pdf",
            OutputFormat::Epub => "epub",
            OutputFormat::Docx => "docx",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Where in the catalog an asset came from and how it is packaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetSource {
    /// A single USFM file for one book.
    Usfm,
    /// Markdown tree, usually packaged in an archive.
    Markdown,
    /// Tab-separated notes file.
    Tsv,
    /// Whole-resource archive.
    Zip,
    /// A git repository to clone.
    Git,
}

impl AssetSource {
    /// Map a catalog link `format` tag to a source kind.
    pub fn from_format(format: &str, url: &str) -> Option<Self> {
        if url.ends_with(".git") {
            return Some(AssetSource::Git);
        }
        match format.to_ascii_lowercase().as_str() {
            "usfm" => Some(AssetSource::Usfm),
            "markdown" | "md" => Some(AssetSource::Markdown),
            "tsv" => Some(AssetSource::Tsv),
            "zip" => Some(AssetSource::Zip),
            "git" => Some(AssetSource::Git),
            _ => None,
        }
    }
}

/// Result of a successful catalog lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLookupDto {
    pub url: Option<String>,
    pub source: AssetSource,
    /// Selector describing where in the catalog the link was found.
    pub jsonpath: Option<String>,
    pub lang_name: String,
    pub resource_type_name: String,
    /// Right-to-left script, from the catalog or the built-in language list.
    #[serde(default)]
    pub rtl: bool,
}
