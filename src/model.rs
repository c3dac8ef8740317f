//! In-memory resource models.
//!
//! Every parsed resource becomes a [`ResourceModel`]: either a scripture
//! [`ParsedBook`] or an [`AuxBook`] of keyed helps fragments, tagged with the
//! request that produced it. The assembler never looks inside either
//! directly; it goes through [`ResourceContent`], a small capability set both
//! bodies implement.
//!
//! Keys are `(chapter, verse)` pairs. Intros live outside the key space:
//! the book intro has neither chapter nor verse, a chapter intro has only
//! a chapter.

use std::collections::BTreeMap;

use crate::naming::ResourceKind;
use crate::types::ResourceRequest;

/// A verse position within one book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VerseKey {
    pub chapter: u32,
    pub verse: u32,
}

impl VerseKey {
    pub fn new(chapter: u32, verse: u32) -> Self {
        Self { chapter, verse }
    }
}

/// Anchor id for a chapter: `{prefix}{book}-ch-{C}`.
pub fn chapter_anchor(prefix: &str, book_id: &str, chapter: u32) -> String {
    format!("{prefix}{book_id}-ch-{chapter}")
}

/// Anchor id for a verse: `{prefix}{book}-ch-{C}-v-{V}`.
pub fn verse_anchor(prefix: &str, book_id: &str, chapter: u32, verse: u32) -> String {
    format!("{prefix}{book_id}-ch-{chapter}-v-{verse}")
}

// ============================================================================
// Scripture
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedVerse {
    pub number: u32,
    /// Last verse covered. Equal to `number` unless this is a bridge.
    pub last: u32,
    pub anchor: String,
    pub html: String,
    /// Verse text with all markup and notes removed.
    pub plain_text: String,
}

impl ParsedVerse {
    pub fn is_bridge(&self) -> bool {
        self.last > self.number
    }

    /// Verse numbers this fragment answers for: `{N..=M}` for a bridge.
    pub fn id_set(&self) -> std::ops::RangeInclusive<u32> {
        self.number..=self.last
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedChapter {
    pub number: u32,
    /// Heading text, from `\cl` or `Chapter N`.
    pub label: String,
    pub anchor: String,
    pub chapter_intro: Option<String>,
    pub verses: Vec<ParsedVerse>,
}

impl ParsedChapter {
    /// Verse answering for `verse`, and whether it is the bridge start.
    fn find(&self, verse: u32) -> Option<(&ParsedVerse, bool)> {
        let idx = self.verses.partition_point(|v| v.number <= verse);
        let candidate = self.verses.get(idx.checked_sub(1)?)?;
        if candidate.number == verse {
            Some((candidate, true))
        } else if candidate.last >= verse {
            Some((candidate, false))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedBook {
    pub book_id: String,
    /// From `\h`, else the canonical English name.
    pub display_name: String,
    pub book_intro: Option<String>,
    pub chapters: Vec<ParsedChapter>,
}

impl ParsedBook {
    pub fn chapter(&self, number: u32) -> Option<&ParsedChapter> {
        self.chapters
            .binary_search_by_key(&number, |c| c.number)
            .ok()
            .map(|i| &self.chapters[i])
    }

    /// Chapters unique and ascending, verses unique and ascending within each.
    pub fn is_well_ordered(&self) -> bool {
        self.chapters.windows(2).all(|w| w[0].number < w[1].number)
            && self.chapters.iter().all(|c| {
                c.number >= 1
                    && c.verses
                        .windows(2)
                        .all(|w| w[0].last < w[1].number && w[0].number < w[1].number)
            })
    }

    pub fn verse_count(&self) -> usize {
        self.chapters.iter().map(|c| c.verses.len()).sum()
    }
}

// ============================================================================
// Auxiliary helps
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuxKind {
    Note,
    Word,
    Question,
    Intro,
}

/// Position of an aux fragment: `(None, None)` is the book intro,
/// `(Some(c), None)` a chapter intro.
pub type FragmentKey = (Option<u32>, Option<u32>);

#[derive(Debug, Clone, PartialEq)]
pub struct AuxFragment {
    pub book_id: String,
    pub chapter: Option<u32>,
    pub verse: Option<u32>,
    pub html: String,
    pub kind: AuxKind,
}

impl AuxFragment {
    pub fn key(&self) -> FragmentKey {
        (self.chapter, self.verse)
    }
}

/// A verse reference used in glossary "Uses:" lists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VerseRef {
    pub book_id: String,
    pub chapter: u32,
    pub verse: u32,
    /// Anchor of the scripture verse the reference was found in.
    pub anchor: String,
}

/// One translation-words article.
#[derive(Debug, Clone, PartialEq)]
pub struct GlossaryEntry {
    pub lang: String,
    pub slug: String,
    /// Localized headword.
    pub term: String,
    /// Rendered article body, without its heading.
    pub html: String,
    pub uses: Vec<VerseRef>,
}

impl GlossaryEntry {
    pub fn anchor(&self) -> String {
        format!("{}-{}", self.lang, self.slug)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AuxBook {
    pub book_id: String,
    pub fragments: BTreeMap<FragmentKey, AuxFragment>,
    pub glossary: Vec<GlossaryEntry>,
}

impl AuxBook {
    pub fn new(book_id: &str) -> Self {
        Self {
            book_id: book_id.to_string(),
            ..Self::default()
        }
    }

    /// Add a fragment, appending to any fragment already at the same key.
    pub fn insert(&mut self, fragment: AuxFragment) {
        match self.fragments.get_mut(&fragment.key()) {
            Some(existing) => existing.html.push_str(&fragment.html),
            None => {
                self.fragments.insert(fragment.key(), fragment);
            }
        }
    }
}

// ============================================================================
// Resource model and capabilities
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ModelBody {
    Scripture(ParsedBook),
    Aux(AuxBook),
}

/// A parsed resource plus its provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceModel {
    pub request: ResourceRequest,
    pub kind: ResourceKind,
    pub lang_name: String,
    pub resource_type_name: String,
    pub rtl: bool,
    pub body: ModelBody,
}

impl ResourceModel {
    pub fn scripture(&self) -> Option<&ParsedBook> {
        match &self.body {
            ModelBody::Scripture(book) => Some(book),
            ModelBody::Aux(_) => None,
        }
    }

    pub fn glossary(&self) -> &[GlossaryEntry] {
        match &self.body {
            ModelBody::Aux(aux) => &aux.glossary,
            ModelBody::Scripture(_) => &[],
        }
    }

    /// Human label, e.g. `Unlocked Literal Bible (English)`.
    pub fn label(&self) -> String {
        format!("{} ({})", self.resource_type_name, self.lang_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntroLevel {
    Book,
    Chapter(u32),
}

/// What a resource has at a verse key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot<'a> {
    Fragment(&'a str),
    /// Answered by a bridge that starts at an earlier verse.
    Covered,
    Missing,
}

/// Heading data for a scripture chapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChapterHeading<'a> {
    pub label: &'a str,
    pub anchor: &'a str,
}

/// Capabilities the assembler needs from any resource.
pub trait ResourceContent {
    fn book_id(&self) -> &str;
    fn intro(&self, level: IntroLevel) -> Option<&str>;
    /// Chapters with any content, ascending.
    fn chapters(&self) -> Vec<u32>;
    /// Verse keys with a fragment, ascending. Bridges contribute their start.
    fn keys(&self) -> Vec<VerseKey>;
    fn fragment(&self, key: VerseKey) -> Slot<'_>;
    fn chapter_heading(&self, chapter: u32) -> Option<ChapterHeading<'_>>;

    fn is_empty(&self) -> bool {
        self.chapters().is_empty() && self.intro(IntroLevel::Book).is_none()
    }
}

impl ResourceContent for ParsedBook {
    fn book_id(&self) -> &str {
        &self.book_id
    }

    fn intro(&self, level: IntroLevel) -> Option<&str> {
        match level {
            IntroLevel::Book => self.book_intro.as_deref(),
            IntroLevel::Chapter(c) => self.chapter(c)?.chapter_intro.as_deref(),
        }
    }

    fn chapters(&self) -> Vec<u32> {
        self.chapters.iter().map(|c| c.number).collect()
    }

    fn keys(&self) -> Vec<VerseKey> {
        self.chapters
            .iter()
            .flat_map(|c| c.verses.iter().map(|v| VerseKey::new(c.number, v.number)))
            .collect()
    }

    fn fragment(&self, key: VerseKey) -> Slot<'_> {
        match self.chapter(key.chapter).and_then(|c| c.find(key.verse)) {
            Some((verse, true)) => Slot::Fragment(&verse.html),
            Some((_, false)) => Slot::Covered,
            None => Slot::Missing,
        }
    }

    fn chapter_heading(&self, chapter: u32) -> Option<ChapterHeading<'_>> {
        self.chapter(chapter).map(|c| ChapterHeading {
            label: &c.label,
            anchor: &c.anchor,
        })
    }
}

impl ResourceContent for AuxBook {
    fn book_id(&self) -> &str {
        &self.book_id
    }

    fn intro(&self, level: IntroLevel) -> Option<&str> {
        let key = match level {
            IntroLevel::Book => (None, None),
            IntroLevel::Chapter(c) => (Some(c), None),
        };
        self.fragments.get(&key).map(|f| f.html.as_str())
    }

    fn chapters(&self) -> Vec<u32> {
        let mut chapters: Vec<u32> = self.fragments.keys().filter_map(|(c, _)| *c).collect();
        chapters.dedup();
        chapters
    }

    fn keys(&self) -> Vec<VerseKey> {
        self.fragments
            .keys()
            .filter_map(|key| match key {
                (Some(c), Some(v)) => Some(VerseKey::new(*c, *v)),
                _ => None,
            })
            .collect()
    }

    fn fragment(&self, key: VerseKey) -> Slot<'_> {
        match self.fragments.get(&(Some(key.chapter), Some(key.verse))) {
            Some(f) => Slot::Fragment(&f.html),
            None => Slot::Missing,
        }
    }

    fn chapter_heading(&self, _chapter: u32) -> Option<ChapterHeading<'_>> {
        None
    }

    fn is_empty(&self) -> bool {
        self.fragments.is_empty() && self.glossary.is_empty()
    }
}

impl ResourceContent for ResourceModel {
    fn book_id(&self) -> &str {
        self.content().book_id()
    }

    fn intro(&self, level: IntroLevel) -> Option<&str> {
        self.content().intro(level)
    }

    fn chapters(&self) -> Vec<u32> {
        self.content().chapters()
    }

    fn keys(&self) -> Vec<VerseKey> {
        self.content().keys()
    }

    fn fragment(&self, key: VerseKey) -> Slot<'_> {
        self.content().fragment(key)
    }

    fn chapter_heading(&self, chapter: u32) -> Option<ChapterHeading<'_>> {
        self.content().chapter_heading(chapter)
    }

    fn is_empty(&self) -> bool {
        self.content().is_empty()
    }
}

impl ResourceModel {
    fn content(&self) -> &dyn ResourceContent {
        match &self.body {
            ModelBody::Scripture(book) => book,
            ModelBody::Aux(aux) => aux,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verse(number: u32, last: u32) -> ParsedVerse {
        ParsedVerse {
            number,
            last,
            anchor: verse_anchor("", "jud", 1, number),
            html: format!("v{number}"),
            plain_text: String::new(),
        }
    }

    fn book() -> ParsedBook {
        ParsedBook {
            book_id: "jud".to_string(),
            display_name: "Jude".to_string(),
            book_intro: Some("intro".to_string()),
            chapters: vec![ParsedChapter {
                number: 1,
                label: "Chapter 1".to_string(),
                anchor: chapter_anchor("", "jud", 1),
                chapter_intro: None,
                verses: vec![verse(1, 1), verse(2, 4), verse(6, 6)],
            }],
        }
    }

    #[test]
    fn anchors_follow_book_chapter_verse_scheme() {
        assert_eq!(chapter_anchor("", "jud", 1), "jud-ch-1");
        assert_eq!(verse_anchor("", "jud", 1, 3), "jud-ch-1-v-3");
        assert_eq!(verse_anchor("fr-ulb-", "jud", 1, 3), "fr-ulb-jud-ch-1-v-3");
    }

    #[test]
    fn bridge_answers_for_its_range() {
        let b = book();
        assert_eq!(b.fragment(VerseKey::new(1, 2)), Slot::Fragment("v2"));
        assert_eq!(b.fragment(VerseKey::new(1, 3)), Slot::Covered);
        assert_eq!(b.fragment(VerseKey::new(1, 4)), Slot::Covered);
        assert_eq!(b.fragment(VerseKey::new(1, 5)), Slot::Missing);
        assert_eq!(b.fragment(VerseKey::new(1, 6)), Slot::Fragment("v6"));
        assert_eq!(b.fragment(VerseKey::new(2, 1)), Slot::Missing);
    }

    #[test]
    fn keys_list_bridge_start_only() {
        let keys = book().keys();
        assert_eq!(
            keys,
            vec![VerseKey::new(1, 1), VerseKey::new(1, 2), VerseKey::new(1, 6)]
        );
    }

    #[test]
    fn bridge_id_set() {
        let v = verse(2, 4);
        assert!(v.is_bridge());
        assert_eq!(v.id_set().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    fn well_ordered_detects_overlap() {
        let mut b = book();
        assert!(b.is_well_ordered());
        b.chapters[0].verses.push(verse(5, 5));
        assert!(!b.is_well_ordered());
    }

    #[test]
    fn aux_book_keys_and_intros() {
        let mut aux = AuxBook::new("jud");
        for (c, v, html) in [
            (None, None, "book intro"),
            (Some(1), None, "ch intro"),
            (Some(1), Some(3), "note 3"),
            (Some(1), Some(1), "note 1"),
        ] {
            aux.insert(AuxFragment {
                book_id: "jud".into(),
                chapter: c,
                verse: v,
                html: html.into(),
                kind: AuxKind::Note,
            });
        }
        assert_eq!(aux.intro(IntroLevel::Book), Some("book intro"));
        assert_eq!(aux.intro(IntroLevel::Chapter(1)), Some("ch intro"));
        assert_eq!(aux.chapters(), vec![1]);
        assert_eq!(aux.keys(), vec![VerseKey::new(1, 1), VerseKey::new(1, 3)]);
        assert_eq!(aux.fragment(VerseKey::new(1, 2)), Slot::Missing);
    }

    #[test]
    fn aux_insert_appends_same_key() {
        let mut aux = AuxBook::new("jud");
        for html in ["a", "b"] {
            aux.insert(AuxFragment {
                book_id: "jud".into(),
                chapter: Some(1),
                verse: Some(1),
                html: html.into(),
                kind: AuxKind::Note,
            });
        }
        assert_eq!(aux.fragment(VerseKey::new(1, 1)), Slot::Fragment("ab"));
    }

    #[test]
    fn empty_models() {
        let empty_book = ParsedBook {
            book_id: "jud".into(),
            display_name: "Jude".into(),
            book_intro: None,
            chapters: vec![],
        };
        assert!(empty_book.is_empty());
        assert!(AuxBook::new("jud").is_empty());
        assert!(!book().is_empty());
    }
}
