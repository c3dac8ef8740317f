//! USFM parser.
//!
//! Turns one book of USFM into a [`ParsedBook`] in a single forward pass.
//! The source is first split into marker and text tokens, then fed through
//! a state machine:
//!
//! ```text
//!  PRE_BOOK ──\is,\ip,text──▶ BOOK_INTRO
//!     │                          │
//!     └────────────\c────────────┴──▶ CHAPTER_OPEN ──\p,\q…──▶ PARAGRAPH
//!                                          │                      │
//!                                          └─────────\v───────────┴──▶ VERSE ◀─┐
//!                                                                       │ \f  \x │
//!                                                                       ▼        │
//!                                                                 NOTE / CROSSREF
//! ```
//!
//! ## Output shape
//!
//! Every verse becomes a self-contained fragment:
//!
//! ```html
//! <div class="verse" id="jud-ch-1-v-1">
//!   <h3 class="s1">Greeting</h3>
//!   <p class="q1"><sup class="verse-num">1</sup> Jude, a servant…</p>
//!   <aside class="footnote" id="jud-ch-1-fn-1">…</aside>
//! </div>
//! ```
//!
//! A paragraph running across verses is split at the verse boundary; the
//! continuing half carries an extra `cont` class. Section headings between
//! verses travel with the verse that follows them. Character styles become
//! `<span class="{marker}">`; markers the parser does not know become
//! `<span class="usfm-{marker}">` so their text is never lost.
//!
//! ## Errors
//!
//! Structural problems that would break chapter/verse alignment are fatal
//! for the resource: a verse before any `\c`, a verse inside a note, chapter
//! or verse numbers that do not ascend. Softer problems (a `\c` before `\id`,
//! an `\id` naming another book, an unterminated note) are collected as
//! warnings.

use maud::html;
use thiserror::Error;

use crate::model::{ParsedBook, ParsedChapter, ParsedVerse, chapter_anchor, verse_anchor};
use crate::naming;

#[derive(Error, Debug, PartialEq)]
pub enum UsfmError {
    #[error("line {line}: verse marker before any chapter marker")]
    MissingChapterMarker { line: usize },
    #[error("line {line}: invalid chapter number {value:?}")]
    BadChapterNumber { line: usize, value: String },
    #[error("line {line}: invalid verse number {value:?}")]
    BadVerseNumber { line: usize, value: String },
    #[error("line {line}: chapter {chapter} does not follow chapter {previous}")]
    ChapterOutOfOrder {
        line: usize,
        chapter: u32,
        previous: u32,
    },
    #[error("line {line}: verse {verse} in chapter {chapter} does not follow verse {previous}")]
    VerseOutOfOrder {
        line: usize,
        chapter: u32,
        verse: u32,
        previous: u32,
    },
    #[error("line {line}: verse marker inside a note")]
    VerseInNote { line: usize },
}

/// Parse options.
#[derive(Debug, Clone, Default)]
pub struct UsfmOptions {
    /// Prepended to every chapter and verse anchor. Empty for the primary
    /// scripture of a book.
    pub anchor_prefix: String,
}

/// A parsed book plus non-fatal findings.
#[derive(Debug)]
pub struct UsfmDocument {
    pub book: ParsedBook,
    pub warnings: Vec<String>,
}

/// Parse a USFM source for `book_id`.
pub fn parse_usfm(
    source: &str,
    book_id: &str,
    options: &UsfmOptions,
) -> Result<UsfmDocument, UsfmError> {
    Parser::new(tokenize(source), book_id, options).run()
}

// ============================================================================
// Tokenizer
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
enum TokenKind<'a> {
    Marker { name: &'a str, closing: bool },
    Text(&'a str),
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Token<'a> {
    kind: TokenKind<'a>,
    line: usize,
}

/// Split on backslash-led markers. One whitespace character after an
/// opening marker is part of the marker; `\+nd` nesting prefixes are dropped.
fn tokenize(source: &str) -> Vec<Token<'_>> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut line = 1;
    let mut pos = 0;
    let mut text_start = 0;

    fn flush_text<'a>(tokens: &mut Vec<Token<'a>>, text: &'a str, line: &mut usize) {
        if !text.is_empty() {
            tokens.push(Token {
                kind: TokenKind::Text(text),
                line: *line,
            });
            *line += text.matches('\n').count();
        }
    }

    while pos < bytes.len() {
        if bytes[pos] != b'\\' {
            pos += 1;
            continue;
        }
        let mut name_start = pos + 1;
        if bytes.get(name_start) == Some(&b'+') {
            name_start += 1;
        }
        let mut name_end = name_start;
        while name_end < bytes.len() && bytes[name_end].is_ascii_alphanumeric() {
            name_end += 1;
        }
        if name_end == name_start {
            // A lone backslash is literal text.
            pos += 1;
            continue;
        }
        flush_text(&mut tokens, &source[text_start..pos], &mut line);
        let name = &source[name_start..name_end];
        let mut next = name_end;
        let closing = bytes.get(next) == Some(&b'*');
        if closing {
            next += 1;
        } else if bytes.get(next) == Some(&b'\r') && bytes.get(next + 1) == Some(&b'\n') {
            next += 2;
        } else if bytes.get(next).is_some_and(|b| b.is_ascii_whitespace()) {
            next += 1;
        }
        tokens.push(Token {
            kind: TokenKind::Marker { name, closing },
            line,
        });
        line += source[name_end..next].matches('\n').count();
        pos = next;
        text_start = next;
    }
    flush_text(&mut tokens, &source[text_start..], &mut line);
    tokens
}

/// `q1` → (`q`, Some(1)); `toc2` → (`toc`, Some(2)); `v` → (`v`, None).
fn split_level(name: &str) -> (&str, Option<u32>) {
    let base = name.trim_end_matches(|c: char| c.is_ascii_digit());
    let level = name[base.len()..].parse().ok();
    if base.is_empty() {
        (name, None)
    } else {
        (base, level)
    }
}

// ============================================================================
// Marker tables
// ============================================================================

const PARAGRAPH_MARKERS: &[&str] = &[
    "p", "m", "pi", "mi", "pm", "pmo", "pmc", "pmr", "pc", "pr", "cls", "li", "lim", "q", "qr",
    "qc", "qm", "qd", "po", "ph", "lh", "lf",
];

const HEADING_MARKERS: &[&str] = &["s", "ms", "mr", "r", "sr", "sp", "d", "qa"];

const INTRO_PARAGRAPH_MARKERS: &[&str] = &[
    "ip", "im", "ipi", "imi", "ipq", "imq", "ipr", "iq", "ib", "ili", "io", "iot", "iex",
];

const METADATA_LINE_MARKERS: &[&str] = &["ide", "rem", "sts", "usfm", "toca", "restore"];

const CHARACTER_MARKERS: &[&str] = &[
    "add", "bk", "dc", "k", "nd", "ord", "pn", "png", "addpn", "qt", "sig", "sls", "tl", "wj",
    "em", "bd", "it", "bdit", "no", "sc", "sup", "qs", "qac", "w", "wg", "wh", "wa", "rb", "rq",
    "fig", "jmp", "ior", "iqt", "va", "vp", "ca", "lik", "liv", "litl",
];

const NOTE_PART_MARKERS: &[&str] = &[
    "fr", "ft", "fk", "fq", "fqa", "fl", "fw", "fp", "fv", "fdc", "fm", "xo", "xk", "xq", "xt",
    "xta", "xop", "xot", "xnt", "xdc",
];

// ============================================================================
// Fragment builder
// ============================================================================

/// Accumulates one well-formed HTML fragment.
#[derive(Debug, Default)]
struct Fragment {
    html: String,
    segment_open: bool,
    at_segment_start: bool,
    /// Open spans; `true` once a `|` attribute separator was seen inside.
    spans: Vec<bool>,
    asides: Vec<String>,
    plain: String,
}

impl Fragment {
    fn is_empty(&self) -> bool {
        self.html.is_empty() && self.asides.is_empty()
    }

    fn ensure_segment(&mut self, para: &mut ParaState) {
        if !self.segment_open {
            self.html
                .push_str(&format!(r#"<p class="{}">"#, para.class_for_open()));
            self.segment_open = true;
            self.at_segment_start = true;
        }
    }

    fn close_segment(&mut self) {
        while !self.spans.is_empty() {
            self.close_span();
        }
        if self.segment_open {
            if self.html.ends_with(' ') {
                self.html.pop();
            }
            self.html.push_str("</p>");
            self.segment_open = false;
        }
    }

    /// Push already-normalized text.
    fn push_text(&mut self, text: &str, para: &mut ParaState, record_plain: bool) {
        if text.trim().is_empty() && !self.segment_open {
            return;
        }
        self.ensure_segment(para);
        let mut text = text;
        if self.at_segment_start {
            text = text.trim_start();
            if text.is_empty() {
                return;
            }
        }
        let visible = match self.spans.last_mut() {
            Some(skipping) if *skipping => return,
            Some(skipping) => match text.find('|') {
                Some(bar) => {
                    *skipping = true;
                    &text[..bar]
                }
                None => text,
            },
            None => text,
        };
        self.html.push_str(&escape(visible));
        self.at_segment_start = false;
        if record_plain {
            self.plain.push_str(visible);
        }
    }

    fn push_inline(&mut self, html: &str, para: &mut ParaState) {
        self.ensure_segment(para);
        self.html.push_str(html);
        self.at_segment_start = false;
    }

    fn open_span(&mut self, class: &str, para: &mut ParaState) {
        self.ensure_segment(para);
        self.html.push_str(&format!(r#"<span class="{class}">"#));
        self.spans.push(false);
    }

    fn close_span(&mut self) {
        if self.spans.pop().is_some() {
            self.html.push_str("</span>");
        }
    }

    fn push_block(&mut self, html: &str) {
        self.close_segment();
        self.html.push_str(html);
    }

    /// Move everything from `other` into `self` as a block.
    fn absorb(&mut self, mut other: Fragment) {
        other.close_segment();
        self.push_block(&other.html);
        self.asides.append(&mut other.asides);
        if !other.plain.is_empty() {
            self.plain.push(' ');
            self.plain.push_str(&other.plain);
        }
    }

    /// Close everything and return `(html, plain_text)`.
    fn finish(mut self) -> (String, String) {
        self.close_segment();
        let mut html = self.html;
        for aside in &self.asides {
            html.push_str(aside);
        }
        let plain = self.plain.split_whitespace().collect::<Vec<_>>().join(" ");
        (html, plain)
    }
}

/// Current paragraph style.
#[derive(Debug)]
struct ParaState {
    class: String,
    /// No text emitted since the paragraph marker.
    fresh: bool,
}

impl ParaState {
    fn new() -> Self {
        Self {
            class: "p".to_string(),
            fresh: true,
        }
    }

    fn set(&mut self, class: &str) {
        self.class = class.to_string();
        self.fresh = true;
    }

    fn class_for_open(&mut self) -> String {
        let class = if self.fresh {
            self.class.clone()
        } else {
            format!("{} cont", self.class)
        };
        self.fresh = false;
        class
    }
}

fn escape(text: &str) -> String {
    html! { (text) }.into_string()
}

/// Collapse whitespace runs to single spaces, keeping one leading and one
/// trailing space if the input had them.
fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
                in_space = true;
            }
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

/// Split text at blank lines, which act as paragraph breaks.
fn split_blank_lines(text: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut search = 0;
    while let Some(nl) = text[search..].find('\n') {
        let nl = search + nl;
        let rest = &text[nl + 1..];
        let gap = rest.len() - rest.trim_start_matches([' ', '\t', '\r']).len();
        if rest[gap..].starts_with('\n') {
            parts.push(&text[start..nl]);
            start = nl + 1 + gap + 1;
            search = start;
        } else {
            search = nl + 1;
        }
    }
    parts.push(&text[start..]);
    parts
}

fn parse_verse_number(word: &str) -> Option<(u32, u32)> {
    let leading = |s: &str| -> Option<u32> {
        let digits: String = s.trim().chars().take_while(|c| c.is_ascii_digit()).collect();
        digits.parse().ok()
    };
    let mut parts = word.split(['-', '–', '—']);
    let first = leading(parts.next()?)?;
    let last = match parts.next() {
        Some(p) => leading(p)?,
        None => first,
    };
    if first == 0 || last < first || parts.next().is_some() {
        return None;
    }
    Some((first, last))
}

// ============================================================================
// Parser
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    PreBook,
    BookIntro,
    ChapterOpen,
    Paragraph,
    Verse,
    Note,
    CrossRef,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NoteKind {
    Footnote,
    CrossRef,
}

#[derive(Debug)]
struct NoteBuilder {
    kind: NoteKind,
    return_state: State,
    html: String,
    part_open: bool,
    spans: usize,
}

impl NoteBuilder {
    fn open_part(&mut self, class: &str) {
        self.close_spans();
        if self.part_open {
            self.html.push_str("</span>");
        }
        self.html.push_str(&format!(r#"<span class="{class}">"#));
        self.part_open = true;
    }

    fn open_span(&mut self, class: &str) {
        self.html.push_str(&format!(r#"<span class="{class}">"#));
        self.spans += 1;
    }

    fn close_one(&mut self) {
        if self.spans > 0 {
            self.spans -= 1;
            self.html.push_str("</span>");
        } else if self.part_open {
            self.part_open = false;
            self.html.push_str("</span>");
        }
    }

    fn close_spans(&mut self) {
        while self.spans > 0 {
            self.spans -= 1;
            self.html.push_str("</span>");
        }
    }

    fn finish(mut self) -> String {
        self.close_spans();
        if self.part_open {
            self.html.push_str("</span>");
        }
        self.html.trim().to_string()
    }
}

#[derive(Debug)]
struct ChapterBuilder {
    number: u32,
    label: Option<String>,
    published: Option<String>,
    intro: Fragment,
    verses: Vec<ParsedVerse>,
    footnotes: u32,
    crossrefs: u32,
}

#[derive(Debug)]
struct VerseBuilder {
    number: u32,
    last: u32,
    anchor: String,
    body: Fragment,
}

struct Parser<'a> {
    tokens: Vec<Token<'a>>,
    pos: usize,
    book_id: String,
    prefix: String,
    state: State,
    seen_id: bool,
    header_name: Option<String>,
    toc_name: Option<String>,
    title_name: Option<String>,
    chapter_word: Option<String>,
    book_intro: Fragment,
    intro_footnotes: u32,
    intro_crossrefs: u32,
    in_chapter_intro: bool,
    chapters: Vec<ParsedChapter>,
    chapter: Option<ChapterBuilder>,
    pending: Fragment,
    verse: Option<VerseBuilder>,
    para: ParaState,
    note: Option<NoteBuilder>,
    warnings: Vec<String>,
}

impl<'a> Parser<'a> {
    fn new(tokens: Vec<Token<'a>>, book_id: &str, options: &UsfmOptions) -> Self {
        Self {
            tokens,
            pos: 0,
            book_id: book_id.to_string(),
            prefix: options.anchor_prefix.clone(),
            state: State::PreBook,
            seen_id: false,
            header_name: None,
            toc_name: None,
            title_name: None,
            chapter_word: None,
            book_intro: Fragment::default(),
            intro_footnotes: 0,
            intro_crossrefs: 0,
            in_chapter_intro: false,
            chapters: Vec::new(),
            chapter: None,
            pending: Fragment::default(),
            verse: None,
            para: ParaState::new(),
            note: None,
            warnings: Vec::new(),
        }
    }

    fn run(mut self) -> Result<UsfmDocument, UsfmError> {
        while self.pos < self.tokens.len() {
            let token = self.tokens[self.pos];
            self.pos += 1;
            match token.kind {
                TokenKind::Text(text) => self.on_text(text),
                TokenKind::Marker {
                    name,
                    closing: true,
                } => self.on_closing(name),
                TokenKind::Marker {
                    name,
                    closing: false,
                } => self.on_marker(name, token.line)?,
            }
        }
        self.finish()
    }

    // ------------------------------------------------------------------
    // Token helpers
    // ------------------------------------------------------------------

    /// Take the first whitespace-delimited word of the following text token.
    fn take_word(&mut self) -> Option<String> {
        let token = self.tokens.get(self.pos)?;
        let TokenKind::Text(text) = token.kind else {
            return None;
        };
        let trimmed = text.trim_start();
        let end = trimmed
            .find(char::is_whitespace)
            .unwrap_or(trimmed.len());
        let word = &trimmed[..end];
        let rest = &trimmed[end..];
        if rest.is_empty() {
            self.pos += 1;
        } else {
            self.tokens[self.pos].kind = TokenKind::Text(rest);
        }
        (!word.is_empty()).then(|| word.to_string())
    }

    /// Take text up to the end of the current line. Character markers inside
    /// the line are dropped but their text kept; any other marker ends it.
    fn take_line(&mut self) -> String {
        let mut out = String::new();
        while let Some(token) = self.tokens.get(self.pos) {
            match token.kind {
                TokenKind::Text(text) => match text.find('\n') {
                    Some(nl) => {
                        out.push_str(&text[..nl]);
                        self.tokens[self.pos].kind = TokenKind::Text(&text[nl + 1..]);
                        break;
                    }
                    None => {
                        out.push_str(text);
                        self.pos += 1;
                    }
                },
                TokenKind::Marker { name, .. } => {
                    let (base, _) = split_level(name);
                    if CHARACTER_MARKERS.contains(&base) {
                        self.pos += 1;
                    } else {
                        break;
                    }
                }
            }
        }
        collapse_whitespace(&out).trim().to_string()
    }

    // ------------------------------------------------------------------
    // Output targets
    // ------------------------------------------------------------------

    fn in_note(&self) -> bool {
        matches!(self.state, State::Note | State::CrossRef)
    }

    fn before_chapters(&self) -> bool {
        matches!(self.state, State::PreBook | State::BookIntro)
    }

    /// Run `f` on the fragment currently receiving content.
    fn with_target<R>(&mut self, f: impl FnOnce(&mut Fragment, &mut ParaState) -> R) -> R {
        if self.state == State::Verse && !self.in_chapter_intro && !self.pending.is_empty() {
            self.flush_pending();
        }
        let Parser {
            state,
            book_intro,
            pending,
            verse,
            chapter,
            para,
            in_chapter_intro,
            ..
        } = self;
        let target = match (*state, *in_chapter_intro, chapter.as_mut()) {
            (State::PreBook | State::BookIntro, _, _) => book_intro,
            (_, true, Some(ch)) => &mut ch.intro,
            (State::Verse, _, _) => match verse.as_mut() {
                Some(v) => &mut v.body,
                None => pending,
            },
            _ => pending,
        };
        f(target, para)
    }

    /// Headings and other pre-verse blocks gathered while a verse is open
    /// belong to the same verse once more of its text arrives.
    fn flush_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        if let Some(v) = self.verse.as_mut() {
            v.body.absorb(pending);
        } else {
            self.pending = pending;
        }
    }

    // ------------------------------------------------------------------
    // Token handlers
    // ------------------------------------------------------------------

    fn on_text(&mut self, text: &str) {
        if self.in_note() {
            if let Some(note) = self.note.as_mut() {
                note.html.push_str(&escape(&collapse_whitespace(text)));
            }
            return;
        }
        if text.trim().is_empty() {
            // Inter-marker whitespace matters only inside an open segment.
            let collapsed = collapse_whitespace(text);
            self.with_target(|frag, para| {
                if frag.segment_open {
                    frag.push_text(&collapsed, para, true);
                }
            });
            return;
        }
        match self.state {
            State::PreBook => self.state = State::BookIntro,
            State::ChapterOpen => self.state = State::Paragraph,
            _ => {}
        }
        let parts = split_blank_lines(text);
        let last = parts.len() - 1;
        for (i, part) in parts.into_iter().enumerate() {
            let collapsed = collapse_whitespace(part);
            self.with_target(|frag, para| {
                frag.push_text(&collapsed, para, true);
                if i < last {
                    frag.close_segment();
                    para.fresh = true;
                }
            });
        }
    }

    fn on_closing(&mut self, name: &str) {
        if self.in_note() {
            match name {
                "f" | "fe" | "ef" | "x" | "ex" => self.close_note(),
                _ => {
                    if let Some(note) = self.note.as_mut() {
                        note.close_one();
                    }
                }
            }
            return;
        }
        self.with_target(|frag, _| frag.close_span());
    }

    fn on_marker(&mut self, name: &str, line: usize) -> Result<(), UsfmError> {
        let (base, level) = split_level(name);

        if self.in_note() {
            if NOTE_PART_MARKERS.contains(&base) {
                if let Some(note) = self.note.as_mut() {
                    note.open_part(name);
                }
                return Ok(());
            }
            if base == "v" {
                return Err(UsfmError::VerseInNote { line });
            }
            if CHARACTER_MARKERS.contains(&base) {
                if let Some(note) = self.note.as_mut() {
                    note.open_span(name);
                }
                return Ok(());
            }
            self.warnings
                .push(format!("line {line}: unterminated note closed by \\{name}"));
            self.close_note();
        }

        match base {
            "id" => {
                let value = self.take_line();
                let code = value.split_whitespace().next().unwrap_or("");
                if !code.eq_ignore_ascii_case(&self.book_id) {
                    self.warnings.push(format!(
                        "line {line}: \\id {code} does not match book {}",
                        self.book_id
                    ));
                }
                self.seen_id = true;
            }
            "h" => {
                let value = self.take_line();
                if !value.is_empty() {
                    self.header_name = Some(value);
                }
            }
            "toc" => {
                let value = self.take_line();
                // \toc2 is the short name, the best fallback for a heading.
                if level == Some(2) && !value.is_empty() {
                    self.toc_name = Some(value);
                }
            }
            "mt" | "mte" => {
                let value = self.take_line();
                if self.title_name.is_none() && !value.is_empty() {
                    self.title_name = Some(value);
                }
            }
            _ if METADATA_LINE_MARKERS.contains(&base) => {
                self.take_line();
            }
            "imt" | "is" | "imte" => {
                let value = self.take_line();
                let (tag, class) = if base == "is" {
                    ("h3", name)
                } else {
                    ("h2", name)
                };
                let block = format!("<{tag} class=\"{class}\">{}</{tag}>", escape(&value));
                self.enter_intro();
                self.with_target(|frag, _| frag.push_block(&block));
            }
            _ if INTRO_PARAGRAPH_MARKERS.contains(&base) => {
                self.enter_intro();
                self.with_target(|frag, para| {
                    frag.close_segment();
                    para.set(name);
                });
            }
            "ie" => {}
            "c" => self.start_chapter(line)?,
            "cl" => {
                let value = self.take_line();
                match self.chapter.as_mut() {
                    Some(ch) => ch.label = Some(value),
                    None => self.chapter_word = Some(value),
                }
            }
            "cp" => {
                let value = self.take_word();
                if let Some(ch) = self.chapter.as_mut() {
                    ch.published = value;
                }
            }
            "cd" => {
                let value = self.take_line();
                let block = format!(r#"<p class="cd">{}</p>"#, escape(&value));
                match self.chapter.as_mut() {
                    Some(ch) => ch.intro.push_block(&block),
                    None => self.book_intro.push_block(&block),
                }
            }
            "v" => self.start_verse(line)?,
            "b" => {
                self.with_target(|frag, para| {
                    frag.close_segment();
                    para.fresh = true;
                });
            }
            "nb" => {
                self.in_chapter_intro = false;
                self.with_target(|frag, _| frag.close_segment());
            }
            _ if PARAGRAPH_MARKERS.contains(&base) => {
                self.in_chapter_intro = false;
                match self.state {
                    State::PreBook => self.state = State::BookIntro,
                    State::ChapterOpen => self.state = State::Paragraph,
                    _ => {}
                }
                self.with_target(|frag, para| {
                    frag.close_segment();
                    para.set(name);
                });
            }
            _ if HEADING_MARKERS.contains(&base) => {
                self.in_chapter_intro = false;
                let value = self.take_line();
                let block = heading_block(base, name, level, &value);
                match self.state {
                    State::PreBook | State::BookIntro => {
                        self.state = State::BookIntro;
                        self.book_intro.push_block(&block);
                    }
                    _ => self.pending.push_block(&block),
                }
            }
            "f" | "fe" | "ef" => self.open_note(NoteKind::Footnote),
            "x" | "ex" => self.open_note(NoteKind::CrossRef),
            _ if CHARACTER_MARKERS.contains(&base) => {
                if self.state == State::PreBook {
                    self.state = State::BookIntro;
                }
                self.with_target(|frag, para| frag.open_span(name, para));
            }
            _ => {
                if self.state == State::PreBook {
                    self.state = State::BookIntro;
                }
                let class = format!("usfm-{name}");
                self.with_target(|frag, para| frag.open_span(&class, para));
            }
        }
        Ok(())
    }

    fn enter_intro(&mut self) {
        if self.before_chapters() {
            self.state = State::BookIntro;
        } else if self.chapter.is_some() && self.verse.is_none() {
            self.in_chapter_intro = true;
        }
    }

    // ------------------------------------------------------------------
    // Notes
    // ------------------------------------------------------------------

    fn open_note(&mut self, kind: NoteKind) {
        // Caller: `+`, `-` or a literal character.
        let _caller = self.take_word();
        let return_state = self.state;
        self.note = Some(NoteBuilder {
            kind,
            return_state,
            html: String::new(),
            part_open: false,
            spans: 0,
        });
        self.state = match kind {
            NoteKind::Footnote => State::Note,
            NoteKind::CrossRef => State::CrossRef,
        };
    }

    fn close_note(&mut self) {
        let Some(note) = self.note.take() else {
            return;
        };
        self.state = note.return_state;
        let kind = note.kind;
        let base = match &self.chapter {
            Some(ch) => chapter_anchor(&self.prefix, &self.book_id, ch.number),
            None => format!("{}{}-intro", self.prefix, self.book_id),
        };
        let counter = match (self.chapter.as_mut(), kind) {
            (Some(ch), NoteKind::Footnote) => &mut ch.footnotes,
            (Some(ch), NoteKind::CrossRef) => &mut ch.crossrefs,
            (None, NoteKind::Footnote) => &mut self.intro_footnotes,
            (None, NoteKind::CrossRef) => &mut self.intro_crossrefs,
        };
        *counter += 1;
        let n = *counter;
        let (tag, class) = match kind {
            NoteKind::Footnote => ("fn", "footnote"),
            NoteKind::CrossRef => ("xr", "crossref"),
        };
        let id = format!("{base}-{tag}-{n}");
        let caller = format!(r##"<sup class="{class}-caller"><a href="#{id}">{n}</a></sup>"##);
        let aside = format!(
            r#"<aside class="{class}" id="{id}"><span class="note-num">{n}</span> {}</aside>"#,
            note.finish()
        );
        if self.state == State::PreBook {
            self.state = State::BookIntro;
        }
        self.with_target(|frag, para| {
            frag.push_inline(&caller, para);
            frag.asides.push(aside);
        });
    }

    // ------------------------------------------------------------------
    // Chapters and verses
    // ------------------------------------------------------------------

    fn start_chapter(&mut self, line: usize) -> Result<(), UsfmError> {
        let word = self.take_word().unwrap_or_default();
        let number = word
            .parse::<u32>()
            .ok()
            .filter(|n| *n >= 1)
            .ok_or_else(|| UsfmError::BadChapterNumber {
                line,
                value: word.clone(),
            })?;
        if !self.seen_id {
            self.warnings
                .push(format!("line {line}: chapter {number} before \\id"));
        }
        self.finish_chapter();
        if let Some(previous) = self.chapters.last().map(|c| c.number)
            && number <= previous
        {
            return Err(UsfmError::ChapterOutOfOrder {
                line,
                chapter: number,
                previous,
            });
        }
        self.chapter = Some(ChapterBuilder {
            number,
            label: None,
            published: None,
            intro: Fragment::default(),
            verses: Vec::new(),
            footnotes: 0,
            crossrefs: 0,
        });
        self.state = State::ChapterOpen;
        self.in_chapter_intro = false;
        self.para = ParaState::new();
        Ok(())
    }

    fn start_verse(&mut self, line: usize) -> Result<(), UsfmError> {
        match self.state {
            State::PreBook | State::BookIntro => {
                return Err(UsfmError::MissingChapterMarker { line });
            }
            State::Note | State::CrossRef => return Err(UsfmError::VerseInNote { line }),
            State::ChapterOpen | State::Paragraph | State::Verse => {}
        }
        let word = self.take_word().unwrap_or_default();
        let (number, last) =
            parse_verse_number(&word).ok_or_else(|| UsfmError::BadVerseNumber {
                line,
                value: word.clone(),
            })?;
        self.finish_verse();
        let Some(chapter) = self.chapter.as_ref() else {
            return Err(UsfmError::MissingChapterMarker { line });
        };
        if let Some(previous) = chapter.verses.last().map(|v| v.last)
            && number <= previous
        {
            return Err(UsfmError::VerseOutOfOrder {
                line,
                chapter: chapter.number,
                verse: number,
                previous,
            });
        }
        let anchor = verse_anchor(&self.prefix, &self.book_id, chapter.number, number);
        let mut body = Fragment::default();
        body.absorb(std::mem::take(&mut self.pending));
        let label = if last > number {
            format!("{number}-{last}")
        } else {
            number.to_string()
        };
        body.push_inline(
            &format!(r#"<sup class="verse-num">{label}</sup>"#),
            &mut self.para,
        );
        self.verse = Some(VerseBuilder {
            number,
            last,
            anchor,
            body,
        });
        self.in_chapter_intro = false;
        self.state = State::Verse;
        Ok(())
    }

    fn finish_verse(&mut self) {
        let Some(verse) = self.verse.take() else {
            return;
        };
        let (body, plain_text) = verse.body.finish();
        let html = format!(r#"<div class="verse" id="{}">{body}</div>"#, verse.anchor);
        if let Some(chapter) = self.chapter.as_mut() {
            chapter.verses.push(ParsedVerse {
                number: verse.number,
                last: verse.last,
                anchor: verse.anchor,
                html,
                plain_text,
            });
        }
    }

    fn finish_chapter(&mut self) {
        self.finish_verse();
        let Some(mut chapter) = self.chapter.take() else {
            return;
        };
        let leftover = std::mem::take(&mut self.pending);
        if !leftover.is_empty() {
            let (html, _) = leftover.finish();
            match chapter.verses.last_mut() {
                Some(last) => {
                    // Keep the fragment closed by its own </div>.
                    let close = last.html.len() - "</div>".len();
                    last.html.insert_str(close, &html);
                }
                None => chapter.intro.push_block(&html),
            }
        }
        let label = match (&chapter.label, &self.chapter_word, &chapter.published) {
            (Some(label), _, _) => label.clone(),
            (None, Some(word), published) => format!(
                "{word} {}",
                published.clone().unwrap_or_else(|| chapter.number.to_string())
            ),
            (None, None, published) => format!(
                "Chapter {}",
                published.clone().unwrap_or_else(|| chapter.number.to_string())
            ),
        };
        let (intro, _) = chapter.intro.finish();
        self.chapters.push(ParsedChapter {
            number: chapter.number,
            label,
            anchor: chapter_anchor(&self.prefix, &self.book_id, chapter.number),
            chapter_intro: (!intro.is_empty()).then_some(intro),
            verses: chapter.verses,
        });
    }

    fn finish(mut self) -> Result<UsfmDocument, UsfmError> {
        if self.note.is_some() {
            self.warnings.push("unterminated note at end of book".to_string());
            self.close_note();
        }
        self.finish_chapter();
        let (intro, _) = std::mem::take(&mut self.book_intro).finish();
        let display_name = self
            .header_name
            .or(self.toc_name)
            .or(self.title_name)
            .unwrap_or_else(|| naming::book_name(&self.book_id));
        Ok(UsfmDocument {
            book: ParsedBook {
                book_id: self.book_id,
                display_name,
                book_intro: (!intro.is_empty()).then_some(intro),
                chapters: self.chapters,
            },
            warnings: self.warnings,
        })
    }
}

fn heading_block(base: &str, name: &str, level: Option<u32>, text: &str) -> String {
    let text = escape(text);
    match base {
        "s" | "ms" => {
            let tag = match (base, level.unwrap_or(1)) {
                ("ms", _) => "h3",
                (_, 1) => "h3",
                (_, 2) => "h4",
                _ => "h5",
            };
            format!(r#"<{tag} class="{name}">{text}</{tag}>"#)
        }
        _ => format!(r#"<p class="{name}">{text}</p>"#),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ResourceContent, Slot, VerseKey};

    fn parse(src: &str) -> UsfmDocument {
        parse_usfm(src, "jud", &UsfmOptions::default()).unwrap()
    }

    const JUDE: &str = r"\id JUD EN_ULB
\ide UTF-8
\h Jude
\toc1 The Letter of Jude
\toc2 Jude
\mt Jude
\c 1
\s1 Greeting
\p
\v 1 Jude, a servant of Jesus Christ, and brother of James, to those who are called,
\v 2 May mercy and peace and love be multiplied to you.
\p
\v 3 Beloved, I was making every effort\f + \fr 1:3 \ft Some versions read \fq our\f* to write to you.
\v 4 For certain men have slipped in secretly.
";

    // =========================================================================
    // Tokenizer
    // =========================================================================

    #[test]
    fn tokenizer_splits_markers_and_text() {
        let tokens = tokenize("\\v 1 In \\nd Lord\\nd* said");
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Marker { name: "v", closing: false },
                TokenKind::Text("1 In "),
                TokenKind::Marker { name: "nd", closing: false },
                TokenKind::Text("Lord"),
                TokenKind::Marker { name: "nd", closing: true },
                TokenKind::Text(" said"),
            ]
        );
    }

    #[test]
    fn tokenizer_tracks_lines_and_nesting_prefix() {
        let tokens = tokenize("\\c 1\n\\p\n\\v 1 a \\+nd b\\+nd*");
        let v = tokens
            .iter()
            .find(|t| t.kind == TokenKind::Marker { name: "v", closing: false })
            .unwrap();
        assert_eq!(v.line, 3);
        assert!(tokens.iter().any(|t| t.kind == TokenKind::Marker { name: "nd", closing: true }));
    }

    #[test]
    fn split_level_examples() {
        assert_eq!(split_level("q1"), ("q", Some(1)));
        assert_eq!(split_level("toc2"), ("toc", Some(2)));
        assert_eq!(split_level("v"), ("v", None));
    }

    #[test]
    fn verse_numbers() {
        assert_eq!(parse_verse_number("3"), Some((3, 3)));
        assert_eq!(parse_verse_number("2-4"), Some((2, 4)));
        assert_eq!(parse_verse_number("2–4"), Some((2, 4)));
        assert_eq!(parse_verse_number("3a"), Some((3, 3)));
        assert_eq!(parse_verse_number("0"), None);
        assert_eq!(parse_verse_number("5-3"), None);
        assert_eq!(parse_verse_number("x"), None);
    }

    // =========================================================================
    // Structure
    // =========================================================================

    #[test]
    fn parses_chapters_and_verses() {
        let doc = parse(JUDE);
        let book = &doc.book;
        assert_eq!(book.book_id, "jud");
        assert_eq!(book.display_name, "Jude");
        assert_eq!(book.chapters.len(), 1);
        let ch = &book.chapters[0];
        assert_eq!(ch.number, 1);
        assert_eq!(ch.label, "Chapter 1");
        assert_eq!(ch.anchor, "jud-ch-1");
        let numbers: Vec<u32> = ch.verses.iter().map(|v| v.number).collect();
        assert_eq!(numbers, vec![1, 2, 3, 4]);
        assert!(book.is_well_ordered());
        assert!(doc.warnings.is_empty(), "{:?}", doc.warnings);
    }

    #[test]
    fn verse_fragments_carry_anchor_ids() {
        let doc = parse(JUDE);
        let v2 = &doc.book.chapters[0].verses[1];
        assert_eq!(v2.anchor, "jud-ch-1-v-2");
        assert!(v2.html.starts_with(r#"<div class="verse" id="jud-ch-1-v-2">"#));
        assert!(v2.html.ends_with("</div>"));
        assert!(v2.html.contains(r#"<sup class="verse-num">2</sup> May mercy"#));
    }

    #[test]
    fn heading_travels_with_following_verse() {
        let doc = parse(JUDE);
        let v1 = &doc.book.chapters[0].verses[0];
        assert!(v1.html.contains(r#"<h3 class="s1">Greeting</h3>"#));
        let heading = v1.html.find("Greeting").unwrap();
        let number = v1.html.find("verse-num").unwrap();
        assert!(heading < number);
    }

    #[test]
    fn paragraph_continuation_is_marked() {
        let doc = parse(JUDE);
        let verses = &doc.book.chapters[0].verses;
        assert!(verses[0].html.contains(r#"<p class="p">"#));
        assert!(verses[1].html.contains(r#"<p class="p cont">"#));
        // \p before verse 3 starts a fresh paragraph
        assert!(verses[2].html.contains(r#"<p class="p">"#));
    }

    #[test]
    fn footnote_becomes_anchored_aside() {
        let doc = parse(JUDE);
        let v3 = &doc.book.chapters[0].verses[2];
        assert!(v3.html.contains(r##"<sup class="footnote-caller"><a href="#jud-ch-1-fn-1">1</a></sup>"##));
        assert!(v3.html.contains(r#"<aside class="footnote" id="jud-ch-1-fn-1">"#));
        assert!(v3.html.contains(r#"<span class="fq">our</span>"#));
        // Note text stays out of the verse text
        assert!(!v3.plain_text.contains("Some versions"));
        assert!(v3.plain_text.contains("making every effort to write"));
    }

    #[test]
    fn crossrefs_numbered_separately() {
        let src = "\\id JUD\n\\c 1\n\\p\n\\v 1 a\\x - \\xo 1:1 \\xt Gen 1:1\\x* b\\f + \\ft note\\f*\n";
        let v1 = &parse(src).book.chapters[0].verses[0];
        assert!(v1.html.contains(r#"id="jud-ch-1-xr-1""#));
        assert!(v1.html.contains(r#"id="jud-ch-1-fn-1""#));
        assert!(v1.html.contains(r#"<aside class="crossref""#));
    }

    #[test]
    fn verse_bridge_records_range() {
        let src = "\\id JUD\n\\c 1\n\\p\n\\v 1 one\n\\v 2-4 two to four\n\\v 5 five\n";
        let book = parse(src).book;
        let verses = &book.chapters[0].verses;
        assert_eq!(verses.len(), 3);
        assert_eq!(verses[1].number, 2);
        assert_eq!(verses[1].last, 4);
        assert!(verses[1].html.contains(r#"<sup class="verse-num">2-4</sup>"#));
        assert_eq!(book.fragment(VerseKey::new(1, 3)), Slot::Covered);
        // Exactly one anchor for the bridge
        let all: String = verses.iter().map(|v| v.html.as_str()).collect();
        assert!(all.contains(r#"id="jud-ch-1-v-2""#));
        assert!(!all.contains(r#"id="jud-ch-1-v-3""#));
        assert!(!all.contains(r#"id="jud-ch-1-v-4""#));
    }

    #[test]
    fn character_styles_become_spans() {
        let src = "\\id JUD\n\\c 1\n\\p\n\\v 1 the \\nd Lord\\nd* said \\wj come\\wj*\n";
        let v1 = &parse(src).book.chapters[0].verses[0];
        assert!(v1.html.contains(r#"<span class="nd">Lord</span> said"#));
        assert!(v1.html.contains(r#"<span class="wj">come</span>"#));
        assert_eq!(v1.plain_text, "the Lord said come");
    }

    #[test]
    fn word_attributes_are_stripped() {
        let src = "\\id JUD\n\\c 1\n\\p\n\\v 1 \\w grace|strong=\"G5485\"\\w* to you\n";
        let v1 = &parse(src).book.chapters[0].verses[0];
        assert!(v1.html.contains(r#"<span class="w">grace</span>"#));
        assert!(!v1.html.contains("G5485"));
        assert_eq!(v1.plain_text, "grace to you");
    }

    #[test]
    fn unknown_markers_pass_through_as_neutral_spans() {
        let src = "\\id JUD\n\\c 1\n\\p\n\\v 1 keep \\zfancy this\\zfancy* text\n";
        let v1 = &parse(src).book.chapters[0].verses[0];
        assert!(v1.html.contains(r#"<span class="usfm-zfancy">this</span>"#));
        assert!(v1.plain_text.contains("this"));
    }

    #[test]
    fn unclosed_spans_close_at_segment_end() {
        let src = "\\id JUD\n\\c 1\n\\p\n\\v 1 open \\zz never closed\n\\v 2 next\n";
        let verses = &parse(src).book.chapters[0].verses;
        assert_eq!(verses[0].html.matches("<span").count(), verses[0].html.matches("</span>").count());
        assert!(!verses[1].html.contains("usfm-zz"));
    }

    #[test]
    fn whitespace_is_collapsed() {
        let src = "\\id JUD\n\\c 1\n\\p\n\\v 1 many    spaces\n   and\tlines\n";
        let v1 = &parse(src).book.chapters[0].verses[0];
        assert!(v1.html.contains("many spaces and lines</p>"));
    }

    #[test]
    fn blank_line_is_paragraph_break() {
        let src = "\\id JUD\n\\c 1\n\\p\n\\v 1 first part\n\nsecond part\n";
        let v1 = &parse(src).book.chapters[0].verses[0];
        assert_eq!(v1.html.matches("<p ").count(), 2);
    }

    #[test]
    fn poetry_classes() {
        let src = "\\id PSA\n\\c 1\n\\q1\n\\v 1 Blessed is the man\n\\q2 who does not walk\n";
        let doc = parse_usfm(src, "psa", &UsfmOptions::default()).unwrap();
        let v1 = &doc.book.chapters[0].verses[0];
        assert!(v1.html.contains(r#"<p class="q1">"#));
        assert!(v1.html.contains(r#"<p class="q2">who does not walk</p>"#));
    }

    // =========================================================================
    // Intros and labels
    // =========================================================================

    #[test]
    fn book_intro_is_extracted() {
        let src = "\\id JUD\n\\h Jude\n\\imt Introduction\n\\is Author\n\\ip Jude wrote this letter.\n\\c 1\n\\p\n\\v 1 text\n";
        let book = parse(src).book;
        let intro = book.book_intro.unwrap();
        assert!(intro.contains(r#"<h2 class="imt">Introduction</h2>"#));
        assert!(intro.contains(r#"<h3 class="is">Author</h3>"#));
        assert!(intro.contains(r#"<p class="ip">Jude wrote this letter.</p>"#));
    }

    #[test]
    fn no_intro_means_none() {
        assert!(parse(JUDE).book.book_intro.is_none());
    }

    #[test]
    fn chapter_description_is_chapter_intro() {
        let src = "\\id PSA\n\\c 3\n\\cd A psalm of David.\n\\q1\n\\v 1 Yahweh\n";
        let doc = parse_usfm(src, "psa", &UsfmOptions::default()).unwrap();
        let ch = &doc.book.chapters[0];
        assert_eq!(
            ch.chapter_intro.as_deref(),
            Some(r#"<p class="cd">A psalm of David.</p>"#)
        );
    }

    #[test]
    fn chapter_labels() {
        let src = "\\id PSA\n\\cl Psalm\n\\c 1\n\\p\n\\v 1 a\n\\c 2\n\\cl Second Psalm\n\\p\n\\v 1 b\n";
        let doc = parse_usfm(src, "psa", &UsfmOptions::default()).unwrap();
        assert_eq!(doc.book.chapters[0].label, "Psalm 1");
        assert_eq!(doc.book.chapters[1].label, "Second Psalm");
    }

    #[test]
    fn display_name_fallbacks() {
        let src = "\\id JUD\n\\toc2 Judas\n\\c 1\n\\p\n\\v 1 a\n";
        assert_eq!(parse(src).book.display_name, "Judas");
        let src = "\\id JUD\n\\c 1\n\\p\n\\v 1 a\n";
        assert_eq!(parse(src).book.display_name, "Jude");
    }

    #[test]
    fn anchor_prefix_applies_to_every_anchor() {
        let options = UsfmOptions {
            anchor_prefix: "fr-ulb-".to_string(),
        };
        let book = parse_usfm(JUDE, "jud", &options).unwrap().book;
        assert_eq!(book.chapters[0].anchor, "fr-ulb-jud-ch-1");
        assert_eq!(book.chapters[0].verses[0].anchor, "fr-ulb-jud-ch-1-v-1");
        assert!(book.chapters[0].verses[2].html.contains(r#"id="fr-ulb-jud-ch-1-fn-1""#));
    }

    #[test]
    fn trailing_heading_stays_in_last_verse() {
        let src = "\\id JUD\n\\c 1\n\\p\n\\v 1 a\n\\s Closing\n\\c 2\n\\p\n\\v 1 b\n";
        let book = parse(src).book;
        let v1 = &book.chapters[0].verses[0].html;
        assert!(v1.contains("Closing"));
        assert!(v1.ends_with("</div>"));
    }

    // =========================================================================
    // Failures and warnings
    // =========================================================================

    #[test]
    fn verse_before_chapter_is_missing_chapter_marker() {
        let src = "\\id JUD\n\\p\n\\v 1 orphan\n\\c 1\n";
        assert_eq!(
            parse_usfm(src, "jud", &UsfmOptions::default()).unwrap_err(),
            UsfmError::MissingChapterMarker { line: 3 }
        );
    }

    #[test]
    fn content_before_chapter_is_tolerated_as_intro() {
        let src = "\\id JUD\n\\p Some preface text.\n\\c 1\n\\p\n\\v 1 a\n";
        let book = parse(src).book;
        assert!(book.book_intro.unwrap().contains("Some preface text."));
        assert_eq!(book.chapters.len(), 1);
    }

    #[test]
    fn chapter_before_id_is_flagged() {
        let src = "\\c 1\n\\p\n\\v 1 a\n";
        let doc = parse(src);
        assert_eq!(doc.book.chapters.len(), 1);
        assert!(doc.warnings.iter().any(|w| w.contains("before \\id")));
    }

    #[test]
    fn mismatched_id_is_flagged() {
        let doc = parse("\\id REV\n\\c 1\n\\p\n\\v 1 a\n");
        assert!(doc.warnings.iter().any(|w| w.contains("REV")));
    }

    #[test]
    fn descending_chapters_are_rejected() {
        let src = "\\id JUD\n\\c 2\n\\p\n\\v 1 a\n\\c 1\n\\p\n\\v 1 b\n";
        assert!(matches!(
            parse_usfm(src, "jud", &UsfmOptions::default()),
            Err(UsfmError::ChapterOutOfOrder { chapter: 1, previous: 2, .. })
        ));
    }

    #[test]
    fn verse_inside_bridge_range_is_rejected() {
        let src = "\\id JUD\n\\c 1\n\\p\n\\v 1-3 a\n\\v 2 b\n";
        assert!(matches!(
            parse_usfm(src, "jud", &UsfmOptions::default()),
            Err(UsfmError::VerseOutOfOrder { verse: 2, previous: 3, .. })
        ));
    }

    #[test]
    fn verse_inside_note_is_rejected() {
        let src = "\\id JUD\n\\c 1\n\\p\n\\v 1 a\\f + \\ft open\n\\v 2 b\n";
        assert!(matches!(
            parse_usfm(src, "jud", &UsfmOptions::default()),
            Err(UsfmError::VerseInNote { .. })
        ));
    }

    #[test]
    fn bad_chapter_number() {
        let src = "\\id JUD\n\\c one\n";
        assert!(matches!(
            parse_usfm(src, "jud", &UsfmOptions::default()),
            Err(UsfmError::BadChapterNumber { .. })
        ));
    }

    #[test]
    fn sparse_verses_are_allowed() {
        let src = "\\id JUD\n\\c 1\n\\p\n\\v 1 a\n\\v 5 b\n\\c 3\n\\p\n\\v 2 c\n";
        let book = parse(src).book;
        assert!(book.is_well_ordered());
        assert_eq!(book.chapters.iter().map(|c| c.number).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn html_in_text_is_escaped() {
        let src = "\\id JUD\n\\c 1\n\\p\n\\v 1 a <script>x</script> & b\n";
        let v1 = &parse(src).book.chapters[0].verses[0];
        assert!(v1.html.contains("&lt;script&gt;"));
        assert!(v1.html.contains("&amp; b"));
    }

    #[test]
    fn empty_source_yields_empty_book() {
        let doc = parse("");
        assert!(doc.book.chapters.is_empty());
        assert!(doc.book.book_intro.is_none());
    }
}
