//! Translation catalog client.
//!
//! The catalog is a JSON array of languages, each listing resource types
//! (`contents`) with asset links, optionally broken down per book
//! (`subcontents`):
//!
//! ```text
//! [{ "code": "en", "name": "English",
//!    "contents": [{ "code": "ulb-wa", "name": "Unlocked Literal Bible",
//!                   "links": [{ "format": "zip", "url": "…/en_ulb.zip" }],
//!                   "subcontents": [{ "code": "jud",
//!                                     "links": [{ "format": "usfm", "url": "…/66-JUD.usfm" }] }] }] }]
//! ```
//!
//! ## Snapshots
//!
//! A parsed catalog is an immutable [`CatalogSnapshot`]. The client holds the
//! current one behind an `RwLock<Option<Arc<_>>>`: lookups clone the `Arc`
//! under a read lock and search without holding it, and a refresh builds a
//! whole new snapshot before swapping it in under the write lock. Readers
//! never observe a partially updated catalog.
//!
//! The last fetched snapshot is also kept on disk and reused while it is
//! younger than `catalog.ttl_hours`; a missing or corrupt file is refetched.
//!
//! ## Link selection
//!
//! Candidates for `(lang, type, book)` are gathered in declaration order
//! from three places, then ranked by `catalog.format_priority`:
//!
//! 1. `contents[code=type].subcontents[code=book].links`
//! 2. `contents[code=type].links`
//! 3. `contents[*].subcontents[code=type].links`
//!
//! Ties keep declaration order. No candidate means `Ok(None)`: a resource
//! that does not exist is a normal outcome, not an error.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime};
use thiserror::Error;

use crate::config::{AssemblerConfig, CatalogConfig, HttpConfig};
use crate::control::{Interrupt, RunControl};
use crate::http::{HttpClient, HttpError, get_with_retry};
use crate::naming;
use crate::types::{AssetSource, ResourceLookupDto, ResourceRequest};

#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("catalog unavailable: {0}")]
    Http(#[from] HttpError),
    #[error("catalog is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("catalog cache IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("catalog lock poisoned")]
    LockPoisoned,
}

impl CatalogError {
    pub fn is_transient(&self) -> bool {
        matches!(self, CatalogError::Http(e) if e.is_transient())
    }

    pub fn interrupt(&self) -> Option<Interrupt> {
        match self {
            CatalogError::Http(e) => e.interrupt(),
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CatalogLanguage {
    code: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    direction: Option<String>,
    #[serde(default)]
    contents: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    code: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    links: Vec<CatalogLink>,
    #[serde(default)]
    subcontents: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogLink {
    #[serde(default)]
    format: String,
    #[serde(default)]
    url: String,
}

/// An immutable, parsed catalog.
#[derive(Debug)]
pub struct CatalogSnapshot {
    languages: Vec<CatalogLanguage>,
    /// When the catalog bytes were fetched.
    loaded_at: SystemTime,
}

struct Candidate<'a> {
    link: &'a CatalogLink,
    resource_name: Option<&'a str>,
    jsonpath: String,
}

impl CatalogSnapshot {
    pub fn from_json(bytes: &[u8]) -> Result<Self, CatalogError> {
        let languages: Vec<CatalogLanguage> = serde_json::from_slice(bytes)?;
        Ok(Self {
            languages,
            loaded_at: SystemTime::now(),
        })
    }

    /// Backdate the snapshot so its TTL counts from when it was written,
    /// not from when it was read back.
    fn aged(mut self, age: Duration) -> Self {
        if let Some(loaded_at) = SystemTime::now().checked_sub(age) {
            self.loaded_at = loaded_at;
        }
        self
    }

    pub fn language_count(&self) -> usize {
        self.languages.len()
    }

    fn age(&self) -> Duration {
        self.loaded_at.elapsed().unwrap_or_default()
    }

    /// Select the best asset link for a resource request.
    pub fn lookup(
        &self,
        request: &ResourceRequest,
        format_priority: &[String],
    ) -> Option<ResourceLookupDto> {
        let lang = self
            .languages
            .iter()
            .find(|l| l.code == request.lang_code)?;
        let lang_code = &request.lang_code;
        let type_code = &request.resource_type;
        let book = &request.resource_code;

        let mut candidates: Vec<Candidate<'_>> = Vec::new();
        for resource in lang.contents.iter().filter(|c| &c.code == type_code) {
            for book_entry in resource.subcontents.iter().filter(|s| &s.code == book) {
                for link in &book_entry.links {
                    candidates.push(Candidate {
                        link,
                        resource_name: resource.name.as_deref(),
                        jsonpath: format!(
                            "$[?code='{lang_code}'].contents[?code='{type_code}'].subcontents[?code='{book}'].links[?format='{}'].url",
                            link.format
                        ),
                    });
                }
            }
            for link in &resource.links {
                candidates.push(Candidate {
                    link,
                    resource_name: resource.name.as_deref(),
                    jsonpath: format!(
                        "$[?code='{lang_code}'].contents[?code='{type_code}'].links[?format='{}'].url",
                        link.format
                    ),
                });
            }
        }
        for parent in &lang.contents {
            for resource in parent.subcontents.iter().filter(|s| &s.code == type_code) {
                for link in &resource.links {
                    candidates.push(Candidate {
                        link,
                        resource_name: resource.name.as_deref(),
                        jsonpath: format!(
                            "$[?code='{lang_code}'].contents[*].subcontents[?code='{type_code}'].links[?format='{}'].url",
                            link.format
                        ),
                    });
                }
            }
        }

        let (_, best) = candidates
            .into_iter()
            .filter(|c| !c.link.url.trim().is_empty())
            .enumerate()
            .filter_map(|(order, c)| {
                let rank = format_priority
                    .iter()
                    .position(|f| f.eq_ignore_ascii_case(&c.link.format))?;
                let source = AssetSource::from_format(&c.link.format, &c.link.url)?;
                Some(((rank, order), (c, source)))
            })
            .min_by_key(|(rank_and_order, _)| *rank_and_order)?;
        let (best, source) = best;

        let rtl = lang
            .direction
            .as_deref()
            .map(|d| d.eq_ignore_ascii_case("rtl"))
            .unwrap_or_else(|| naming::is_rtl(lang_code));
        Some(ResourceLookupDto {
            url: Some(best.link.url.clone()),
            source,
            jsonpath: Some(best.jsonpath),
            lang_name: if lang.name.is_empty() {
                lang_code.clone()
            } else {
                lang.name.clone()
            },
            resource_type_name: best
                .resource_name
                .map(str::to_string)
                .unwrap_or_else(|| naming::resource_type_name(type_code)),
            rtl,
        })
    }
}

/// Process-wide catalog access shared by concurrent runs.
pub struct CatalogClient {
    http: Arc<dyn HttpClient>,
    http_config: HttpConfig,
    catalog_config: CatalogConfig,
    cache_path: PathBuf,
    current: RwLock<Option<Arc<CatalogSnapshot>>>,
    refresh_lock: Mutex<()>,
}

impl CatalogClient {
    pub fn new(http: Arc<dyn HttpClient>, config: &AssemblerConfig) -> Self {
        Self {
            http,
            http_config: config.http.clone(),
            catalog_config: config.catalog.clone(),
            cache_path: config.catalog_cache_path(),
            current: RwLock::new(None),
            refresh_lock: Mutex::new(()),
        }
    }

    /// Current snapshot, loading it from disk or network when absent or
    /// older than the TTL.
    pub fn snapshot(&self, control: &RunControl) -> Result<Arc<CatalogSnapshot>, CatalogError> {
        if let Some(snapshot) = self.current_if_fresh()? {
            return Ok(snapshot);
        }
        let _guard = self
            .refresh_lock
            .lock()
            .map_err(|_| CatalogError::LockPoisoned)?;
        // Another run may have loaded it while we waited.
        if let Some(snapshot) = self.current_if_fresh()? {
            return Ok(snapshot);
        }
        let snapshot = match self.load_cached() {
            Some(snapshot) => snapshot,
            None => self.fetch(control)?,
        };
        self.swap(snapshot)
    }

    /// Fetch a fresh snapshot regardless of cache age and swap it in.
    pub fn refresh(&self, control: &RunControl) -> Result<Arc<CatalogSnapshot>, CatalogError> {
        let _guard = self
            .refresh_lock
            .lock()
            .map_err(|_| CatalogError::LockPoisoned)?;
        let snapshot = self.fetch(control)?;
        self.swap(snapshot)
    }

    /// Look up a resource request in the current snapshot.
    pub fn lookup(
        &self,
        request: &ResourceRequest,
        control: &RunControl,
    ) -> Result<Option<ResourceLookupDto>, CatalogError> {
        let snapshot = self.snapshot(control)?;
        Ok(snapshot.lookup(request, &self.catalog_config.format_priority))
    }

    fn current_if_fresh(&self) -> Result<Option<Arc<CatalogSnapshot>>, CatalogError> {
        let current = self.current.read().map_err(|_| CatalogError::LockPoisoned)?;
        Ok(current
            .as_ref()
            .filter(|s| s.age() < self.catalog_config.ttl())
            .cloned())
    }

    fn swap(&self, snapshot: CatalogSnapshot) -> Result<Arc<CatalogSnapshot>, CatalogError> {
        let snapshot = Arc::new(snapshot);
        let mut current = self
            .current
            .write()
            .map_err(|_| CatalogError::LockPoisoned)?;
        *current = Some(Arc::clone(&snapshot));
        Ok(snapshot)
    }

    fn load_cached(&self) -> Option<CatalogSnapshot> {
        let age = file_age(&self.cache_path)?;
        if age >= self.catalog_config.ttl() {
            return None;
        }
        let bytes = fs::read(&self.cache_path).ok()?;
        match CatalogSnapshot::from_json(&bytes) {
            Ok(snapshot) => {
                tracing::debug!(path = %self.cache_path.display(), age_secs = age.as_secs(), "using cached catalog");
                Some(snapshot.aged(age))
            }
            Err(e) => {
                tracing::warn!(path = %self.cache_path.display(), error = %e, "ignoring corrupt catalog cache");
                None
            }
        }
    }

    fn fetch(&self, control: &RunControl) -> Result<CatalogSnapshot, CatalogError> {
        tracing::info!(url = %self.catalog_config.url, "fetching catalog");
        let response = get_with_retry(
            self.http.as_ref(),
            &self.http_config,
            &self.catalog_config.url,
            control,
        )?;
        let snapshot = CatalogSnapshot::from_json(&response.body)?;
        if let Some(parent) = self.cache_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.cache_path, &response.body)?;
        tracing::info!(languages = snapshot.language_count(), "catalog loaded");
        Ok(snapshot)
    }
}

/// Time since `path` was last modified. `None` if it does not exist.
fn file_age(path: &Path) -> Option<Duration> {
    let modified = fs::metadata(path).and_then(|m| m.modified()).ok()?;
    // A timestamp in the future counts as just written.
    Some(SystemTime::now().duration_since(modified).unwrap_or_default())
}

/// Whether `path` exists and was modified less than `max_age` ago.
pub fn file_is_fresh(path: &Path, max_age: Duration) -> bool {
    file_age(path).is_some_and(|age| age < max_age)
}
