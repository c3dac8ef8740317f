//! Translation helps parsers: notes, questions and words.
//!
//! Notes and questions become [`AuxBook`]s keyed by `(chapter, verse)`;
//! words become a glossary plus per-verse link lists.
//!
//! ## Notes and questions
//!
//! Markdown trees follow the book/chapter/verse layout:
//!
//! ```text
//! jud/
//! ├── front/intro.md     → (∅, ∅)   book intro
//! └── 01/
//!     ├── intro.md       → (1, ∅)   chapter intro
//!     ├── 01.md          → (1, 1)
//!     └── 05-06.md       → (1, 5)   headed "Jude 1:5-6"
//! ```
//!
//! Notes can also come as TSV, in either the seven-column
//! `Reference ID Tags SupportReference Quote Occurrence Note` layout or the
//! nine-column `Book Chapter Verse ID SupportReference OrigQuote Occurrence
//! GLQuote OccurrenceNote` layout. Rows sharing a reference are merged into
//! one fragment.
//!
//! ## Words
//!
//! Articles live under `kt/`, `names/` and `other/`. The first `# ` heading
//! holds the localized term (`# grace, gracious` → `grace`); every comma
//! separated form is matched, case-insensitively and on word boundaries,
//! against the plain text of a same-language scripture to find where the
//! word is used.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use maud::html;
use pulldown_cmark::{Event, HeadingLevel, Options, Parser, Tag, TagEnd, html as md_html};
use regex::RegexSet;
use thiserror::Error;

use crate::links::{LinkContext, LinkScope, rewrite_links};
use crate::model::{AuxBook, AuxFragment, AuxKind, FragmentKey, GlossaryEntry, ParsedBook, VerseRef};
use crate::naming::{self, NumberedStem};

#[derive(Error, Debug)]
pub enum HelpsError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: unrecognized TSV header {header:?}")]
    UnknownTsvLayout { path: PathBuf, header: String },
    #[error("word patterns: {0}")]
    Pattern(#[from] regex::Error),
}

fn read(path: &Path) -> Result<String, HelpsError> {
    fs::read_to_string(path).map_err(|source| HelpsError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>, HelpsError> {
    let entries = fs::read_dir(dir).map_err(|source| HelpsError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    let mut paths: Vec<PathBuf> = entries.filter_map(Result::ok).map(|e| e.path()).collect();
    paths.sort();
    Ok(paths)
}

/// Identity of the resource being parsed.
#[derive(Debug, Clone, Copy)]
pub struct HelpsSource<'a> {
    pub lang: &'a str,
    pub book_id: &'a str,
    /// Display name used in fragment headings.
    pub book_name: &'a str,
    pub links: &'a LinkContext,
}

impl HelpsSource<'_> {
    fn scope(&self, chapter: Option<u32>) -> LinkScope<'_> {
        LinkScope {
            lang: self.lang,
            book_id: self.book_id,
            chapter,
        }
    }

    fn verse_heading(&self, chapter: u32, verse_label: &str) -> String {
        html! { h4 { (self.book_name) " " (chapter) ":" (verse_label) } }.into_string()
    }
}

// ============================================================================
// Markdown rendering
// ============================================================================

/// Render markdown, demoting level-1 headings to level 5.
pub fn render_markdown(markdown: &str) -> String {
    let demote = |level: HeadingLevel| match level {
        HeadingLevel::H1 => HeadingLevel::H5,
        other => other,
    };
    let parser = Parser::new_ext(markdown, Options::ENABLE_TABLES).map(|event| match event {
        Event::Start(Tag::Heading {
            level,
            id,
            classes,
            attrs,
        }) => Event::Start(Tag::Heading {
            level: demote(level),
            id,
            classes,
            attrs,
        }),
        Event::End(TagEnd::Heading(level)) => Event::End(TagEnd::Heading(demote(level))),
        other => other,
    });
    let mut html = String::new();
    md_html::push_html(&mut html, parser);
    html
}

/// Drop a heading and everything under it up to the next heading.
fn remove_section(markdown: &str, title: &str) -> String {
    let mut out = String::with_capacity(markdown.len());
    let mut skipping = false;
    for line in markdown.lines() {
        let is_heading = line.starts_with('#');
        if is_heading {
            let text = line.trim_start_matches('#').trim();
            skipping = text.starts_with(title);
        }
        if !skipping {
            out.push_str(line);
            out.push('\n');
        }
    }
    out
}

/// `"05-06"` → `"5-6"`, `"03"` → `"3"`.
fn verse_label(stem: &str) -> String {
    stem.split('-')
        .map(|part| part.trim_start_matches('0'))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

// ============================================================================
// Notes and questions: markdown trees
// ============================================================================

/// Parse a `{book}/{chapter}/{verse}.md` tree.
pub fn parse_markdown_tree(
    book_dir: &Path,
    kind: AuxKind,
    source: &HelpsSource<'_>,
) -> Result<AuxBook, HelpsError> {
    let mut book = AuxBook::new(source.book_id);

    for intro in [book_dir.join("front/intro.md"), book_dir.join("intro.md")] {
        if intro.is_file() {
            let markdown = rewrite_links(&read(&intro)?, source.links, &source.scope(None));
            book.insert(fragment(source, None, None, render_markdown(&markdown), AuxKind::Intro));
            break;
        }
    }

    for chapter_dir in read_dir_sorted(book_dir)? {
        if !chapter_dir.is_dir() {
            continue;
        }
        let name = chapter_dir.file_name().and_then(|n| n.to_str()).unwrap_or("");
        let NumberedStem::Number(chapter) = naming::parse_numbered_stem(name) else {
            continue;
        };
        let mut verses: Vec<(u32, PathBuf)> = Vec::new();
        for file in read_dir_sorted(&chapter_dir)? {
            if file.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let stem = file.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            match naming::parse_numbered_stem(stem) {
                NumberedStem::Intro => {
                    let markdown =
                        rewrite_links(&read(&file)?, source.links, &source.scope(Some(chapter)));
                    book.insert(fragment(
                        source,
                        Some(chapter),
                        None,
                        render_markdown(&markdown),
                        AuxKind::Intro,
                    ));
                }
                NumberedStem::Number(verse) => verses.push((verse, file)),
                NumberedStem::Front | NumberedStem::Other => {}
            }
        }
        verses.sort();
        for (verse, file) in verses {
            let stem = file.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            let markdown = rewrite_links(&read(&file)?, source.links, &source.scope(Some(chapter)));
            let html = format!(
                "{}{}",
                source.verse_heading(chapter, &verse_label(stem)),
                render_markdown(&markdown)
            );
            book.insert(fragment(source, Some(chapter), Some(verse), html, kind));
        }
    }
    Ok(book)
}

fn fragment(
    source: &HelpsSource<'_>,
    chapter: Option<u32>,
    verse: Option<u32>,
    html: String,
    kind: AuxKind,
) -> AuxFragment {
    AuxFragment {
        book_id: source.book_id.to_string(),
        chapter,
        verse,
        html,
        kind,
    }
}

// ============================================================================
// Notes: TSV
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TsvLayout {
    /// Reference ID Tags SupportReference Quote Occurrence Note
    Reference,
    /// Book Chapter Verse ID SupportReference OrigQuote Occurrence GLQuote OccurrenceNote
    BookChapterVerse,
}

#[derive(Debug, PartialEq)]
struct TsvRow {
    key: FragmentKey,
    verse_label: String,
    quote: String,
    note: String,
}

/// `"3"` → `Some(Some(3))`, `"intro"`/`"front"` → `Some(None)`, junk → `None`.
fn tsv_number(field: &str) -> Option<Option<u32>> {
    let field = field.trim();
    if field.eq_ignore_ascii_case("intro") || field.eq_ignore_ascii_case("front") {
        return Some(None);
    }
    match naming::parse_numbered_stem(field) {
        NumberedStem::Number(n) => Some(Some(n)),
        _ => None,
    }
}

fn tsv_row(layout: TsvLayout, fields: &[&str], book_id: &str) -> Option<TsvRow> {
    let (chapter, verse, quote, note) = match layout {
        TsvLayout::Reference => {
            let [reference, _id, _tags, _support, quote, _occurrence, note, ..] = fields else {
                return None;
            };
            let (c, v) = reference.split_once(':')?;
            (c, v, *quote, *note)
        }
        TsvLayout::BookChapterVerse => {
            let [book, c, v, _id, _support, _orig, _occurrence, gl_quote, note, ..] = fields
            else {
                return None;
            };
            if !book.trim().eq_ignore_ascii_case(book_id) {
                return None;
            }
            (*c, *v, *gl_quote, *note)
        }
    };
    let chapter_key = tsv_number(chapter)?;
    // A front-matter chapter has no verse of its own.
    let verse_key = if chapter_key.is_none() {
        None
    } else {
        tsv_number(verse)?
    };
    Some(TsvRow {
        key: (chapter_key, verse_key),
        verse_label: verse_label(verse.trim()),
        quote: quote.trim().to_string(),
        note: note.replace("<br>", "\n").replace("\\n", "\n"),
    })
}

/// Parse a translation-notes TSV file.
pub fn parse_notes_tsv(path: &Path, source: &HelpsSource<'_>) -> Result<AuxBook, HelpsError> {
    let text = read(path)?;
    let mut lines = text.lines();
    let header = lines.next().unwrap_or("");
    let layout = match header.split('\t').next().map(str::trim) {
        Some("Reference") => TsvLayout::Reference,
        Some("Book") => TsvLayout::BookChapterVerse,
        _ => {
            return Err(HelpsError::UnknownTsvLayout {
                path: path.to_path_buf(),
                header: header.to_string(),
            });
        }
    };

    let mut grouped: BTreeMap<FragmentKey, (String, String)> = BTreeMap::new();
    for (index, line) in lines.enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        let Some(row) = tsv_row(layout, &fields, source.book_id) else {
            tracing::debug!(path = %path.display(), line = index + 2, "skipping TSV row");
            continue;
        };
        let (label, markdown) = grouped
            .entry(row.key)
            .or_insert_with(|| (row.verse_label.clone(), String::new()));
        if row.verse_label.contains('-') && !label.contains('-') {
            *label = row.verse_label.clone();
        }
        if !row.quote.is_empty() {
            markdown.push_str(&format!("### {}\n\n", row.quote));
        }
        markdown.push_str(row.note.trim());
        markdown.push_str("\n\n");
    }

    let mut book = AuxBook::new(source.book_id);
    for ((chapter, verse), (label, markdown)) in grouped {
        let markdown = rewrite_links(&markdown, source.links, &source.scope(chapter));
        let body = render_markdown(&markdown);
        let (html, kind) = match (chapter, verse) {
            (Some(c), Some(_)) => (
                format!("{}{body}", source.verse_heading(c, &label)),
                AuxKind::Note,
            ),
            _ => (body, AuxKind::Intro),
        };
        book.insert(fragment(source, chapter, verse, html, kind));
    }
    Ok(book)
}

// ============================================================================
// Words
// ============================================================================

const DROPPED_WORD_SECTIONS: &[&str] = &[
    "Examples from the Bible stories",
    "Links",
    "Picture of",
    "Pictures",
];

/// A translation-words article before rendering.
#[derive(Debug, Clone, PartialEq)]
pub struct WordArticle {
    pub slug: String,
    /// Localized headword.
    pub term: String,
    /// Every comma-separated form of the headword.
    pub forms: Vec<String>,
    /// Body markdown without the headword heading or dropped sections.
    pub markdown: String,
}

/// Split an article into headword and body.
pub fn parse_word_article(slug: &str, text: &str) -> WordArticle {
    let mut heading = None;
    let mut body = String::new();
    for line in text.lines() {
        if heading.is_none()
            && let Some(h) = line.strip_prefix("# ")
        {
            heading = Some(h.trim().to_string());
            continue;
        }
        body.push_str(line);
        body.push('\n');
    }
    for section in DROPPED_WORD_SECTIONS {
        body = remove_section(&body, section);
    }
    let forms: Vec<String> = heading
        .as_deref()
        .unwrap_or(slug)
        .split(',')
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect();
    WordArticle {
        slug: slug.to_string(),
        term: forms.first().cloned().unwrap_or_else(|| slug.to_string()),
        forms,
        markdown: body.trim().to_string(),
    }
}

/// Load every article under `words_dir/{kt,names,other}`. A slug already
/// seen in an earlier category is skipped.
pub fn load_words(words_dir: &Path) -> Result<Vec<WordArticle>, HelpsError> {
    let mut articles: Vec<WordArticle> = Vec::new();
    for category in ["kt", "names", "other"] {
        let dir = words_dir.join(category);
        if !dir.is_dir() {
            continue;
        }
        for file in read_dir_sorted(&dir)? {
            if file.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let Some(slug) = file.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if articles.iter().any(|a| a.slug == slug) {
                continue;
            }
            articles.push(parse_word_article(slug, &read(&file)?));
        }
    }
    Ok(articles)
}

/// Render articles into glossary entries, sorted by term.
pub fn render_glossary(articles: &[WordArticle], source: &HelpsSource<'_>) -> Vec<GlossaryEntry> {
    let mut entries: Vec<GlossaryEntry> = articles
        .iter()
        .map(|a| GlossaryEntry {
            lang: source.lang.to_string(),
            slug: a.slug.clone(),
            term: a.term.clone(),
            html: render_markdown(&rewrite_links(&a.markdown, source.links, &source.scope(None))),
            uses: Vec::new(),
        })
        .collect();
    sort_glossary(&mut entries);
    entries
}

pub fn sort_glossary(entries: &mut [GlossaryEntry]) {
    entries.sort_by(|a, b| {
        a.term
            .to_lowercase()
            .cmp(&b.term.to_lowercase())
            .then_with(|| a.slug.cmp(&b.slug))
    });
}

fn word_pattern(forms: &[String]) -> String {
    if forms.is_empty() {
        // Matches nothing; keeps pattern indices aligned with articles.
        return r"[^\s\S]".to_string();
    }
    let alternatives: Vec<String> = forms.iter().map(|f| regex::escape(f)).collect();
    format!(r"(?i)\b(?:{})\b", alternatives.join("|"))
}

/// Articles that survive into the glossary: those whose term occurs in
/// `scripture`, or every article when there is no scripture. Only these
/// may be link targets.
pub fn words_in_use<'a>(
    articles: &'a [WordArticle],
    scripture: Option<&ParsedBook>,
) -> Result<Vec<&'a WordArticle>, HelpsError> {
    let Some(scripture) = scripture else {
        return Ok(articles.iter().collect());
    };
    let set = RegexSet::new(articles.iter().map(|a| word_pattern(&a.forms)))?;
    let mut used = vec![false; articles.len()];
    for verse in scripture.chapters.iter().flat_map(|c| &c.verses) {
        for i in set.matches(&verse.plain_text).into_iter() {
            used[i] = true;
        }
    }
    Ok(articles
        .iter()
        .zip(used)
        .filter_map(|(a, used)| used.then_some(a))
        .collect())
}

/// Build the words resource for one book.
///
/// With a same-language scripture, each verse mentioning a term gets a
/// fragment of links to the matching entries, each entry records where it
/// was used, and unused entries are left out. Without scripture, every
/// entry is kept and no verse fragments exist.
pub fn build_words_book(
    articles: &[WordArticle],
    scripture: Option<&ParsedBook>,
    source: &HelpsSource<'_>,
) -> Result<AuxBook, HelpsError> {
    let mut book = AuxBook::new(source.book_id);
    let mut glossary = render_glossary(articles, source);
    let Some(scripture) = scripture else {
        book.glossary = glossary;
        return Ok(book);
    };

    let forms: Vec<&[String]> = glossary
        .iter()
        .map(|entry| {
            articles
                .iter()
                .find(|a| a.slug == entry.slug)
                .map(|a| a.forms.as_slice())
                .unwrap_or(&[])
        })
        .collect();
    let set = RegexSet::new(forms.iter().map(|f| word_pattern(f)))?;

    for chapter in &scripture.chapters {
        for verse in &chapter.verses {
            let matched: Vec<usize> = set.matches(&verse.plain_text).into_iter().collect();
            if matched.is_empty() {
                continue;
            }
            for &i in &matched {
                glossary[i].uses.push(VerseRef {
                    book_id: source.book_id.to_string(),
                    chapter: chapter.number,
                    verse: verse.number,
                    anchor: verse.anchor.clone(),
                });
            }
            let label = if verse.is_bridge() {
                format!("{}-{}", verse.number, verse.last)
            } else {
                verse.number.to_string()
            };
            let links = html! {
                ul.word-links {
                    @for &i in &matched {
                        li { a href=(format!("#{}", glossary[i].anchor())) { (glossary[i].term) } }
                    }
                }
            };
            let html = format!(
                "{}{}",
                source.verse_heading(chapter.number, &label),
                links.into_string()
            );
            book.insert(fragment(
                source,
                Some(chapter.number),
                Some(verse.number),
                html,
                AuxKind::Word,
            ));
        }
    }

    glossary.retain(|entry| !entry.uses.is_empty());
    book.glossary = glossary;
    Ok(book)
}
