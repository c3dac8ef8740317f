//! Markdown link rewriting for helps resources.
//!
//! Notes, questions and word articles link to each other and to scripture
//! with repository-relative paths and `rc://` wiki links. Inside an
//! assembled document those only make sense as in-page anchors, and only
//! when the target is part of the same assembly. [`rewrite_links`] runs
//! over the raw markdown before it is rendered:
//!
//! | Link | Target in assembly | Otherwise |
//! |------|--------------------|-----------|
//! | `[[rc://*/tw/dict/bible/kt/grace]]` | `[grace](#en-grace)` | unchanged |
//! | `[grace](../kt/grace.md)` | `[grace](#en-grace)` | unchanged |
//! | `(See: [[rc://*/ta/man/...]])` | removed | removed |
//! | `[v3](../01/03.md)`, `[v3](./03.md)` | `[v3](#jud-ch-1-v-3)` | `v3` |

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::{Captures, Regex};

use crate::model::verse_anchor;

// ── Patterns ────────────────────────────────────────────────────────────

static RE_TA_SEE_WIKI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s*\([^()\[\]]*?:?\s*\[\[rc://[^\]]*?/ta/man/[^\]]*\]\]\)").unwrap()
});

static RE_TA_WIKI: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",?\s*\[\[rc://[^\]]*?/ta/man/[^\]]*\]\]").unwrap());

static RE_TA_SEE_MARKDOWN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\s*\([^()\[\]]*?:\s*\[[^\]]*\]\s*\(rc://[^)]*?/ta/man/[^)]*\)\s*\)").unwrap()
});

static RE_TA_MARKDOWN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]]*)\]\s*\(rc://[^)]*?/ta/man/[^)]*\)").unwrap());

static RE_TW_WIKI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[rc://[^/\]]+/tw/dict/bible/(?:kt|names|other)/([^\]]+?)(?:\.md)?\]\]").unwrap()
});

static RE_TW_MARKDOWN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([^\[\]()]+)\]\((?:\.\./)+(?:kt|names|other)/([^()\[\]]+?)\.md\)").unwrap()
});

static RE_SCRIPTURE_OTHER_BOOK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([^\[\]]+)\]\(\.\./\.\./([a-z0-9]{3})/(\d+)/(\d+)\.md\)").unwrap()
});

static RE_SCRIPTURE_CHAPTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\[\]]+)\]\(\.\./(\d+)/(\d+)\.md\)").unwrap());

static RE_SCRIPTURE_VERSE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\[\]]+)\]\(\./(\d+)\.md\)").unwrap());

static RE_SCRIPTURE_RC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[([^\[\]]+)\]\(rc://[^/)]+/tn/help/([a-z0-9]{3})/(\d+)/(\d+)\)").unwrap()
});

// ── Context ─────────────────────────────────────────────────────────────

/// What the current assembly contains.
#[derive(Debug, Clone, Default)]
pub struct LinkContext {
    /// `(lang, slug)` → localized term.
    words: BTreeMap<(String, String), String>,
    /// Books with scripture in the assembly.
    books: BTreeSet<String>,
}

impl LinkContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_word(&mut self, lang: &str, slug: &str, term: &str) {
        self.words
            .insert((lang.to_string(), slug.to_string()), term.to_string());
    }

    pub fn add_book(&mut self, book_id: &str) {
        self.books.insert(book_id.to_string());
    }

    pub fn word_term(&self, lang: &str, slug: &str) -> Option<&str> {
        self.words
            .get(&(lang.to_string(), slug.to_string()))
            .map(String::as_str)
    }

    pub fn has_book(&self, book_id: &str) -> bool {
        self.books.contains(book_id)
    }
}

/// Where the markdown being rewritten lives.
#[derive(Debug, Clone, Copy)]
pub struct LinkScope<'a> {
    pub lang: &'a str,
    pub book_id: &'a str,
    /// Chapter of the file, for `./VV.md` links.
    pub chapter: Option<u32>,
}

/// Rewrite every link form in `markdown` against `ctx`.
pub fn rewrite_links(markdown: &str, ctx: &LinkContext, scope: &LinkScope<'_>) -> String {
    // Prefixed forms go first so their "(See:" text is not orphaned.
    let text = RE_TA_SEE_WIKI.replace_all(markdown, "");
    let text = RE_TA_WIKI.replace_all(&text, "");
    let text = RE_TA_SEE_MARKDOWN.replace_all(&text, "");
    let text = RE_TA_MARKDOWN.replace_all(&text, "$1");

    let text = RE_TW_WIKI.replace_all(&text, |caps: &Captures| {
        let slug = &caps[1];
        match ctx.word_term(scope.lang, slug) {
            Some(term) => format!("[{term}](#{}-{slug})", scope.lang),
            None => caps[0].to_string(),
        }
    });
    let text = RE_TW_MARKDOWN.replace_all(&text, |caps: &Captures| {
        let slug = &caps[2];
        if ctx.word_term(scope.lang, slug).is_some() {
            format!("[{}](#{}-{slug})", &caps[1], scope.lang)
        } else {
            caps[0].to_string()
        }
    });

    let scripture = |label: &str, book: &str, chapter: &str, verse: &str| -> String {
        match (chapter.parse::<u32>(), verse.parse::<u32>()) {
            (Ok(c), Ok(v)) if ctx.has_book(book) => {
                format!("[{label}](#{})", verse_anchor("", book, c, v))
            }
            _ => label.to_string(),
        }
    };
    let text = RE_SCRIPTURE_OTHER_BOOK.replace_all(&text, |caps: &Captures| {
        scripture(&caps[1], &caps[2], &caps[3], &caps[4])
    });
    let text = RE_SCRIPTURE_RC.replace_all(&text, |caps: &Captures| {
        scripture(&caps[1], &caps[2], &caps[3], &caps[4])
    });
    let text = RE_SCRIPTURE_CHAPTER.replace_all(&text, |caps: &Captures| {
        scripture(&caps[1], scope.book_id, &caps[2], &caps[3])
    });
    let text = RE_SCRIPTURE_VERSE.replace_all(&text, |caps: &Captures| match scope.chapter {
        Some(c) => scripture(&caps[1], scope.book_id, &c.to_string(), &caps[2]),
        None => caps[1].to_string(),
    });
    text.into_owned()
}
