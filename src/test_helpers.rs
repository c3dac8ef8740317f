//! Shared test utilities.
//!
//! Provides an in-memory [`HttpClient`], canned catalog JSON, archive and
//! file-tree builders, and small USFM/markdown sources shared by the module
//! tests.
//!
//! # Usage
//!
//! ```rust
//! use crate::test_helpers::*;
//!
//! let tmp = TempDir::new().unwrap();
//! let config = test_config(tmp.path());
//! let http = MockHttp::new();
//! http.serve(&config.catalog.url, sample_catalog_json().into_bytes(), None);
//! http.serve(JUDE_USFM_URL, jude_usfm().into_bytes(), None);
//! ```

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use crate::config::{AssemblerConfig, HttpConfig};
use crate::http::{HttpClient, HttpError, HttpResponse};

// =========================================================================
// Mock transport
// =========================================================================

/// Canned responses keyed by URL. Unknown URLs answer 404.
#[derive(Default)]
pub struct MockHttp {
    routes: Mutex<HashMap<String, HttpResponse>>,
    /// Remaining forced failures per URL.
    failures: Mutex<HashMap<String, (u16, usize)>>,
    calls: Mutex<HashMap<String, usize>>,
}

impl MockHttp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn serve(&self, url: &str, body: Vec<u8>, content_type: Option<&str>) {
        self.routes.lock().unwrap().insert(
            url.to_string(),
            HttpResponse {
                body,
                content_type: content_type.map(str::to_string),
            },
        );
    }

    /// Answer `status` for the next `times` calls to `url`.
    pub fn fail_times(&self, url: &str, status: u16, times: usize) {
        self.failures
            .lock()
            .unwrap()
            .insert(url.to_string(), (status, times));
    }

    pub fn calls(&self, url: &str) -> usize {
        self.calls.lock().unwrap().get(url).copied().unwrap_or(0)
    }
}

impl HttpClient for MockHttp {
    fn get(&self, url: &str) -> Result<HttpResponse, HttpError> {
        *self.calls.lock().unwrap().entry(url.to_string()).or_default() += 1;
        if let Some((status, remaining)) = self.failures.lock().unwrap().get_mut(url)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(HttpError::Status {
                url: url.to_string(),
                status: *status,
            });
        }
        self.routes
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| HttpError::Status {
                url: url.to_string(),
                status: 404,
            })
    }
}

// =========================================================================
// Configuration
// =========================================================================

pub fn fast_http_config() -> HttpConfig {
    HttpConfig {
        timeout_secs: 1,
        max_retries: 2,
        backoff_base_ms: 1,
        backoff_cap_ms: 2,
    }
}

/// Config rooted in a temp directory, pointing at a fake catalog URL.
pub fn test_config(root: &Path) -> AssemblerConfig {
    let mut config = AssemblerConfig::default();
    config.paths.working_dir = root.join("working");
    config.paths.output_dir = root.join("output");
    config.catalog.url = "https://catalog.test/translations.json".to_string();
    config.http = fast_http_config();
    config
}

// =========================================================================
// Catalog
// =========================================================================

pub const JUDE_USFM_URL: &str = "https://cdn.example.org/en_ulb/66-JUD.usfm";
pub const EN_TN_URL: &str = "https://cdn.example.org/en_tn.zip";
pub const EN_TW_URL: &str = "https://cdn.example.org/en_tw.zip";
pub const AR_JUDE_URL: &str = "https://cdn.example.org/ar_nav/66-JUD.usfm";

/// A small catalog: English ULB (book-level USFM plus a whole-resource zip),
/// English notes (zip), English words nested under another entry, and an
/// Arabic Bible without a declared direction.
pub fn sample_catalog_json() -> String {
    format!(
        r#"[
  {{
    "code": "en",
    "name": "English",
    "direction": "ltr",
    "contents": [
      {{
        "code": "ulb-wa",
        "name": "Unlocked Literal Bible",
        "links": [{{"format": "zip", "url": "https://cdn.example.org/en_ulb.zip"}}],
        "subcontents": [
          {{"code": "jud", "name": "Jude", "links": [{{"format": "usfm", "url": "{JUDE_USFM_URL}"}}]}}
        ]
      }},
      {{
        "code": "tn-wa",
        "name": "Translation Notes",
        "links": [{{"format": "zip", "url": "{EN_TN_URL}"}}]
      }},
      {{
        "code": "reg",
        "name": "Bible",
        "links": [],
        "subcontents": [
          {{"code": "tw-wa", "name": "Translation Words", "links": [{{"format": "zip", "url": "{EN_TW_URL}"}}]}}
        ]
      }}
    ]
  }},
  {{
    "code": "ar",
    "name": "العربية",
    "contents": [
      {{
        "code": "nav",
        "name": "New Arabic Version",
        "subcontents": [
          {{"code": "jud", "links": [{{"format": "usfm", "url": "{AR_JUDE_URL}"}}]}}
        ]
      }}
    ]
  }}
]"#
    )
}

// =========================================================================
// Files and archives
// =========================================================================

/// Write `(relative path, contents)` pairs under `root`.
pub fn write_files(root: &Path, files: &[(&str, &str)]) {
    for (rel, contents) in files {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }
}

/// Build an in-memory zip archive.
pub fn zip_bytes(files: &[(&str, &str)]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default();
    for (name, contents) in files {
        writer.start_file(*name, options).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

// =========================================================================
// Sources
// =========================================================================

pub fn jude_usfm() -> String {
    r"\id JUD EN_ULB
\h Jude
\toc2 Jude
\mt Jude
\c 1
\s1 Greeting
\p
\v 1 Jude, a servant of Jesus Christ and brother of James, to those who are called, loved by God.
\v 2 May mercy and peace and love be multiplied to you.
\p
\v 3 Beloved, I was making every effort to write to you about our common salvation, and of grace.
\v 4 For certain men have slipped in secretly.
"
    .to_string()
}

/// Translation-notes markdown tree for Jude as `(path, contents)` pairs.
pub fn jude_notes_tree() -> Vec<(&'static str, &'static str)> {
    vec![
        ("en_tn/jud/front/intro.md", "# Introduction to Jude\n\nJude wrote this letter."),
        ("en_tn/jud/01/intro.md", "# Jude 1 general notes\n\nStructure."),
        (
            "en_tn/jud/01/01.md",
            "# servant of Jesus Christ\n\nSee [[rc://en/tw/dict/bible/kt/grace]].\n",
        ),
        ("en_tn/jud/01/03.md", "# common salvation\n\nThe salvation we share. See [verse 1](./01.md)."),
    ]
}

/// Translation-words tree as `(path, contents)` pairs.
pub fn words_tree() -> Vec<(&'static str, &'static str)> {
    vec![
        (
            "en_tw/bible/kt/grace.md",
            "# grace, gracious\n\n## Definition:\n\nGrace is undeserved favor.\n\n## Bible References:\n\n* Jude 1:4\n\n## Examples from the Bible stories:\n\n* story\n",
        ),
        ("en_tw/bible/names/james.md", "# James\n\n## Facts:\n\nBrother of Jude.\n"),
        ("en_tw/bible/other/mercy.md", "# mercy, merciful\n\n## Definition:\n\nCompassion.\n"),
    ]
}
