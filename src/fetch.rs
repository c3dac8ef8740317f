//! Resource fetcher.
//!
//! Downloads the asset a [`ResourceLookupDto`] points at, unpacks it into a
//! per-request directory under `sources/`, and wraps the result in a
//! [`LocalAssetHandle`] that knows how to find a book's files inside the
//! unpacked tree.
//!
//! Downloads land in `sources/.partial/` first and are renamed into place
//! only once complete, so a cancelled run never leaves a half-written asset
//! where a later lookup could pick it up.
//!
//! ## Layouts the handle understands
//!
//! ```text
//! en_ulb/                    en_ulb/                en_tn/
//! ├── 65-3JN.usfm            └── jud/               └── jud/
//! └── 66-JUD.usfm                ├── front/             ├── front/intro.md
//!                                │   └── title.txt      └── 01/
//!    usfm_file("jud")            └── 01/                    ├── intro.md
//!                                    ├── 01.txt             └── 03.md
//!                                    └── 02.txt
//!                                                        book_dir("jud")
//!                                verse_file_tree("jud")
//! ```

use std::fs;
use std::io::{self, Cursor};
use std::path::{Component, Path, PathBuf};
use std::process::Command;

use flate2::read::GzDecoder;
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::HttpConfig;
use crate::control::{Interrupt, RunControl};
use crate::http::{HttpClient, HttpError, get_with_retry};
use crate::naming::{self, NumberedStem};
use crate::types::{AssetSource, ResourceLookupDto, ResourceRequest};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("lookup record for {0} has no url")]
    MissingUrl(String),
    #[error("empty download from {0}")]
    EmptyAsset(String),
    #[error("no supported asset file for {request} in {url}")]
    AssetUnavailable { request: String, url: String },
    #[error("git clone of {url} failed: {message}")]
    Git { url: String, message: String },
}

impl FetchError {
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Http(e) if e.is_transient())
    }

    /// The asset URL answered 404 or 410.
    pub fn is_not_found(&self) -> bool {
        matches!(self, FetchError::Http(e) if e.is_not_found())
    }

    pub fn interrupt(&self) -> Option<Interrupt> {
        match self {
            FetchError::Http(e) => e.interrupt(),
            _ => None,
        }
    }
}

// ============================================================================
// Archive detection
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    TarGz,
    Tar,
    Plain,
}

impl ArchiveKind {
    /// Content type wins when it names an archive; otherwise the URL suffix
    /// decides.
    pub fn detect(content_type: Option<&str>, url: &str) -> Self {
        match content_type {
            Some("application/zip" | "application/x-zip-compressed") => return Self::Zip,
            Some("application/gzip" | "application/x-gzip" | "application/x-compressed-tar") => {
                return Self::TarGz;
            }
            Some("application/x-tar") => return Self::Tar,
            _ => {}
        }
        let path = url_path(url).to_ascii_lowercase();
        if path.ends_with(".zip") {
            Self::Zip
        } else if path.ends_with(".tar.gz") || path.ends_with(".tgz") {
            Self::TarGz
        } else if path.ends_with(".tar") {
            Self::Tar
        } else {
            Self::Plain
        }
    }
}

/// URL without query string or fragment.
fn url_path(url: &str) -> &str {
    url.split(['?', '#']).next().unwrap_or(url)
}

/// Last path segment of a URL, safe to use as a file name.
fn file_name_from_url(url: &str) -> String {
    let segment = url_path(url)
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or("");
    let name = sanitize(segment);
    if name.is_empty() || name.starts_with('.') {
        "asset".to_string()
    } else {
        name
    }
}

fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Directory name under `sources/` for one request.
pub fn request_dir_name(request: &ResourceRequest) -> String {
    sanitize(&format!(
        "{}_{}_{}",
        request.lang_code, request.resource_type, request.resource_code
    ))
}

// ============================================================================
// Fetcher
// ============================================================================

pub struct Fetcher<'a> {
    http: &'a dyn HttpClient,
    config: &'a HttpConfig,
    sources_dir: PathBuf,
    control: RunControl,
}

impl<'a> Fetcher<'a> {
    pub fn new(http: &'a dyn HttpClient, config: &'a HttpConfig, sources_dir: &Path) -> Self {
        Self {
            http,
            config,
            sources_dir: sources_dir.to_path_buf(),
            control: RunControl::new(),
        }
    }

    /// Stop download retries when `control` interrupts the run.
    pub fn with_control(mut self, control: &RunControl) -> Self {
        self.control = control.clone();
        self
    }

    fn partial_dir(&self) -> PathBuf {
        self.sources_dir.join(".partial")
    }

    /// Download and unpack the asset for `request`.
    pub fn fetch(
        &self,
        dto: &ResourceLookupDto,
        request: &ResourceRequest,
    ) -> Result<LocalAssetHandle, FetchError> {
        let url = dto
            .url
            .as_deref()
            .ok_or_else(|| FetchError::MissingUrl(request.to_string()))?;
        let dir_name = request_dir_name(request);
        let target = self.sources_dir.join(&dir_name);

        if target.is_dir() {
            tracing::debug!(request = %request, "reusing unpacked asset");
            return self.checked_handle(&target, request, url);
        }

        let partial = self.partial_dir();
        fs::create_dir_all(&partial)?;
        let staging = partial.join(&dir_name);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }

        if dto.source == AssetSource::Git {
            tracing::info!(url, "cloning");
            clone_git(url, &staging)?;
        } else {
            let response = get_with_retry(self.http, self.config, url, &self.control)?;
            if response.body.is_empty() {
                return Err(FetchError::EmptyAsset(url.to_string()));
            }
            let kind = ArchiveKind::detect(response.content_type.as_deref(), url);
            tracing::info!(
                url,
                bytes = response.body.len(),
                kind = ?kind,
                "downloaded asset"
            );
            fs::create_dir_all(&staging)?;
            match kind {
                ArchiveKind::Zip => unpack_zip(&response.body, &staging)?,
                ArchiveKind::TarGz => {
                    unpack_tar(GzDecoder::new(Cursor::new(&response.body)), &staging)?
                }
                ArchiveKind::Tar => unpack_tar(Cursor::new(&response.body), &staging)?,
                ArchiveKind::Plain => {
                    fs::write(staging.join(file_name_from_url(url)), &response.body)?
                }
            }
        }

        fs::rename(&staging, &target)?;
        self.checked_handle(&target, request, url)
    }

    fn checked_handle(
        &self,
        root: &Path,
        request: &ResourceRequest,
        url: &str,
    ) -> Result<LocalAssetHandle, FetchError> {
        let handle = LocalAssetHandle::open(root);
        if handle.is_empty() {
            return Err(FetchError::AssetUnavailable {
                request: request.to_string(),
                url: url.to_string(),
            });
        }
        Ok(handle)
    }
}

/// A path inside an archive that stays under the unpack root.
fn is_contained(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn unpack_zip(bytes: &[u8], dest: &Path) -> Result<(), FetchError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(relative) = entry.enclosed_name().filter(|p| is_contained(p)) else {
            tracing::warn!(entry = entry.name(), "skipping archive entry outside target");
            continue;
        };
        let out = dest.join(relative);
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(&out)?;
        io::copy(&mut entry, &mut file)?;
    }
    Ok(())
}

fn unpack_tar<R: io::Read>(reader: R, dest: &Path) -> Result<(), FetchError> {
    let mut archive = tar::Archive::new(reader);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        if !is_contained(&path) {
            tracing::warn!(entry = %path.display(), "skipping archive entry outside target");
            continue;
        }
        entry.unpack_in(dest)?;
    }
    Ok(())
}

fn clone_git(url: &str, dest: &Path) -> Result<(), FetchError> {
    let output = Command::new("git")
        .args(["clone", "--depth", "1", "--quiet", url])
        .arg(dest)
        .output()?;
    if output.status.success() {
        Ok(())
    } else {
        Err(FetchError::Git {
            url: url.to_string(),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

// ============================================================================
// Local asset handle
// ============================================================================

/// An unpacked asset tree.
#[derive(Debug, Clone)]
pub struct LocalAssetHandle {
    root: PathBuf,
    /// Every regular file, sorted by path. Hidden entries are skipped.
    files: Vec<PathBuf>,
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0
        && entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.starts_with('.'))
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case(ext))
}

fn stem(path: &Path) -> &str {
    path.file_stem().and_then(|s| s.to_str()).unwrap_or("")
}

fn dir_name(path: &Path) -> &str {
    path.file_name().and_then(|s| s.to_str()).unwrap_or("")
}

impl LocalAssetHandle {
    pub fn open(root: &Path) -> Self {
        let files = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_hidden(e))
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect();
        Self {
            root: root.to_path_buf(),
            files,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn files_with_extension<'s>(&'s self, ext: &'s str) -> impl Iterator<Item = &'s PathBuf> + 's {
        self.files.iter().filter(move |p| has_extension(p, ext))
    }

    /// The USFM file for `book_id`: a `.usfm`/`.sfm` file whose stem names
    /// the book, then a lone `.usfm` file, then a `.txt` naming the book.
    pub fn usfm_file(&self, book_id: &str) -> Option<&Path> {
        let usfm: Vec<&PathBuf> = self
            .files_with_extension("usfm")
            .chain(self.files_with_extension("sfm"))
            .collect();
        if let Some(found) = usfm
            .iter()
            .copied()
            .find(|p| naming::stem_mentions_book(stem(p), book_id))
        {
            return Some(found.as_path());
        }
        if let &[only] = usfm.as_slice() {
            return Some(only.as_path());
        }
        self.files_with_extension("txt")
            .find(|p| naming::stem_mentions_book(stem(p), book_id))
            .map(PathBuf::as_path)
    }

    /// Shallowest directory named after the book.
    pub fn book_dir(&self, book_id: &str) -> Option<PathBuf> {
        WalkDir::new(&self.root)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_hidden(e))
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_dir() && dir_name(e.path()).eq_ignore_ascii_case(book_id))
            .min_by_key(|e| e.depth())
            .map(|e| e.into_path())
    }

    /// Rebuild USFM from a `{book}/{chapter}/{chunk}.txt` tree, if present.
    /// Chunk files that already carry `\v` markers are used as-is; bare
    /// ones get a `\v` for their file number.
    pub fn verse_file_tree(&self, book_id: &str) -> Option<String> {
        let book_dir = self.book_dir(book_id)?;
        let mut chapters: Vec<(u32, PathBuf)> = fs::read_dir(&book_dir)
            .ok()?
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_dir())
            .filter_map(|p| match naming::parse_numbered_stem(dir_name(&p)) {
                NumberedStem::Number(n) if n > 0 => Some((n, p)),
                _ => None,
            })
            .collect();
        if chapters.is_empty() {
            return None;
        }
        chapters.sort();

        let title = ["front", "00"]
            .iter()
            .map(|d| book_dir.join(d).join("title.txt"))
            .find_map(|p| fs::read_to_string(p).ok())
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| naming::book_name(book_id));

        let mut usfm = format!("\\id {}\n\\h {title}\n", book_id.to_ascii_uppercase());
        let mut any_verse = false;
        for (number, dir) in chapters {
            let mut chunks: Vec<(u32, PathBuf)> = fs::read_dir(&dir)
                .ok()?
                .filter_map(Result::ok)
                .map(|e| e.path())
                .filter(|p| p.is_file() && has_extension(p, "txt"))
                .filter_map(|p| match naming::parse_numbered_stem(stem(&p)) {
                    NumberedStem::Number(n) if n > 0 => Some((n, p)),
                    _ => None,
                })
                .collect();
            chunks.sort();
            usfm.push_str(&format!("\\c {number}\n\\p\n"));
            for (verse, path) in chunks {
                let Ok(text) = fs::read_to_string(&path) else {
                    continue;
                };
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                any_verse = true;
                if text.contains("\\v ") {
                    usfm.push_str(text);
                } else {
                    usfm.push_str(&format!("\\v {verse} {text}"));
                }
                usfm.push('\n');
            }
        }
        any_verse.then_some(usfm)
    }

    /// A TSV file whose stem names the book.
    pub fn tsv_file(&self, book_id: &str) -> Option<&Path> {
        self.files_with_extension("tsv")
            .find(|p| naming::stem_mentions_book(stem(p), book_id))
            .map(PathBuf::as_path)
    }

    /// Shallowest directory holding `kt/`, `names/` or `other/`.
    pub fn words_dir(&self) -> Option<PathBuf> {
        self.files_with_extension("md")
            .filter_map(|p| {
                let category = p.parent()?;
                matches!(dir_name(category), "kt" | "names" | "other")
                    .then(|| category.parent().map(Path::to_path_buf))
                    .flatten()
            })
            .min_by_key(|p| p.components().count())
    }
}
