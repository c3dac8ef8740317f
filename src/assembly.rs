//! Interleaving engine.
//!
//! Takes the parsed models of one run, in request order, and merges them
//! into an ordered list of HTML blocks: one `<section class="book">` per
//! book (books in order of first request), then one glossary section per
//! language that has translation words.
//!
//! Inside a book every strategy emits, in this order: the book heading,
//! book intros, and then per chapter a single chapter heading, chapter
//! intros, the chapter body and an end-of-chapter marker. Strategies only
//! differ in the chapter body and in model order:
//!
//! | Strategy | Chapter body | Model order |
//! |----------|--------------|-------------|
//! | Book | each resource's whole chapter, one after another | request |
//! | Chapter | per verse key, each resource's fragment | request |
//! | Verse | per verse key, a `verse-group` of fragments | kind, then request |
//!
//! Verse keys come from the sorted union of every model's keys for the
//! chapter. A bridge answers for its whole range but is only emitted at its
//! first verse; helps keyed inside the range follow it at their own keys.

use std::collections::{BTreeMap, BTreeSet};

use maud::{Markup, PreEscaped, html};
use thiserror::Error;

use crate::control::{Interrupt, RunControl};
use crate::helps::sort_glossary;
use crate::model::{GlossaryEntry, IntroLevel, ResourceContent, ResourceModel, Slot, VerseKey};
use crate::naming::{self, ResourceKind};
use crate::types::{AssemblyStrategy, ResourceRequest};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssemblyError {
    #[error("no resource resolved to a scripture book")]
    NoBooks,
    #[error("every resolved resource is empty")]
    NoSharedResources,
    #[error(transparent)]
    Interrupted(#[from] Interrupt),
}

/// Verse keys a scripture resource lacks although another scripture
/// resource of the same book has them.
#[derive(Debug, Clone, PartialEq)]
pub struct MissingVerses {
    pub request: ResourceRequest,
    pub keys: Vec<VerseKey>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assembly {
    /// Display names of the assembled books, in emission order.
    pub book_names: Vec<String>,
    pub blocks: Vec<String>,
    pub missing: Vec<MissingVerses>,
}

impl Assembly {
    pub fn html(&self) -> String {
        self.blocks.concat()
    }
}

/// Interleave `models` under `strategy`.
pub fn assemble(
    models: &[ResourceModel],
    strategy: AssemblyStrategy,
    control: &RunControl,
) -> Result<Assembly, AssemblyError> {
    if !models.iter().any(|m| m.scripture().is_some()) {
        return Err(AssemblyError::NoBooks);
    }
    if models.iter().all(|m| m.is_empty()) {
        return Err(AssemblyError::NoSharedResources);
    }

    let mut assembly = Assembly::default();
    let mut book_names: BTreeMap<String, String> = BTreeMap::new();
    for book_id in book_order(models) {
        control.check()?;
        let group = BookGroup::new(&book_id, models, strategy);
        tracing::debug!(
            book = %book_id,
            resources = group.models.len(),
            strategy = %strategy,
            "assembling book"
        );
        assembly.missing.extend(group.missing_verses());
        let mut section = String::new();
        group.emit(strategy, control, &mut section)?;
        assembly.blocks.push(section);
        assembly.book_names.push(group.display_name.clone());
        book_names.insert(book_id.clone(), group.display_name.clone());
    }
    for glossary in merge_glossaries(models) {
        assembly
            .blocks
            .push(render_glossary(&glossary, &book_names).into_string());
    }
    Ok(assembly)
}

fn book_order(models: &[ResourceModel]) -> Vec<String> {
    let mut order: Vec<String> = Vec::new();
    for model in models {
        let id = model.book_id();
        if !order.iter().any(|b| b == id) {
            order.push(id.to_string());
        }
    }
    order
}

fn dir(model: &ResourceModel) -> &'static str {
    if model.rtl { "rtl" } else { "ltr" }
}

/// Wrap a model's content so it carries its language and direction.
fn resource_block(model: &ResourceModel, class: &str, body: Markup) -> Markup {
    html! {
        div class=(format!("{class} {}", model.kind.css_class()))
            lang=(model.request.lang_code)
            dir=(dir(model)) {
            (body)
        }
    }
}

struct BookGroup<'a> {
    book_id: &'a str,
    display_name: String,
    /// Models for this book, in emission order.
    models: Vec<&'a ResourceModel>,
}

impl<'a> BookGroup<'a> {
    fn new(book_id: &'a str, all: &'a [ResourceModel], strategy: AssemblyStrategy) -> Self {
        let mut models: Vec<&ResourceModel> =
            all.iter().filter(|m| m.book_id() == book_id).collect();
        if strategy == AssemblyStrategy::Verse {
            // Stable: request order is kept within a kind.
            models.sort_by_key(|m| m.kind);
        }
        let display_name = models
            .iter()
            .find_map(|m| m.scripture())
            .map(|b| b.display_name.clone())
            .unwrap_or_else(|| naming::book_name(book_id));
        Self {
            book_id,
            display_name,
            models,
        }
    }

    fn chapters(&self) -> Vec<u32> {
        let set: BTreeSet<u32> = self.models.iter().flat_map(|m| m.chapters()).collect();
        set.into_iter().collect()
    }

    fn missing_verses(&self) -> Vec<MissingVerses> {
        let scripture: Vec<&&ResourceModel> = self
            .models
            .iter()
            .filter(|m| m.scripture().is_some())
            .collect();
        if scripture.len() < 2 {
            return Vec::new();
        }
        let universe: BTreeSet<VerseKey> = scripture.iter().flat_map(|m| m.keys()).collect();
        scripture
            .iter()
            .filter_map(|model| {
                let keys: Vec<VerseKey> = universe
                    .iter()
                    .copied()
                    .filter(|key| model.fragment(*key) == Slot::Missing)
                    .collect();
                (!keys.is_empty()).then(|| MissingVerses {
                    request: model.request.clone(),
                    keys,
                })
            })
            .collect()
    }

    fn emit(
        &self,
        strategy: AssemblyStrategy,
        control: &RunControl,
        out: &mut String,
    ) -> Result<(), AssemblyError> {
        out.push_str(&format!(r#"<section class="book" data-book="{}">"#, self.book_id));
        out.push_str(&html! { h1.book-title { (self.display_name) } }.into_string());
        for model in &self.models {
            if let Some(intro) = model.intro(IntroLevel::Book) {
                out.push_str(&resource_block(model, "book-intro", PreEscaped(intro.to_string())).into_string());
            }
        }

        // Every key of the book, once; chapters take their slice.
        let universe: BTreeSet<VerseKey> = self.models.iter().flat_map(|m| m.keys()).collect();

        for chapter in self.chapters() {
            control.check()?;
            out.push_str(&self.chapter_heading(chapter).into_string());
            for model in &self.models {
                if let Some(intro) = model.intro(IntroLevel::Chapter(chapter)) {
                    out.push_str(
                        &resource_block(model, "chapter-intro", PreEscaped(intro.to_string()))
                            .into_string(),
                    );
                }
            }
            let keys: Vec<VerseKey> = universe
                .range(VerseKey::new(chapter, 0)..=VerseKey::new(chapter, u32::MAX))
                .copied()
                .collect();
            let body = match strategy {
                AssemblyStrategy::Book => self.chapter_by_resource(chapter),
                AssemblyStrategy::Chapter => self.chapter_by_verse(&keys, false),
                AssemblyStrategy::Verse => self.chapter_by_verse(&keys, true),
            };
            out.push_str(&body.into_string());
            out.push_str(r#"<div class="end-of-chapter"></div>"#);
        }
        out.push_str("</section>");
        Ok(())
    }

    /// The visible heading comes from the first scripture with the chapter;
    /// other scriptures contribute their chapter anchors as empty spans.
    fn chapter_heading(&self, chapter: u32) -> Markup {
        let headings: Vec<(&ResourceModel, _)> = self
            .models
            .iter()
            .filter_map(|m| m.chapter_heading(chapter).map(|h| (*m, h)))
            .collect();
        match headings.split_first() {
            Some(((model, first), rest)) => html! {
                h2.chapter-heading id=(first.anchor) lang=(model.request.lang_code) dir=(dir(model)) {
                    (first.label)
                    @for (_, other) in rest {
                        span.chapter-anchor id=(other.anchor) {}
                    }
                }
            },
            None => html! {
                h2.chapter-heading { (self.display_name) " " (chapter) }
            },
        }
    }

    fn chapter_by_resource(&self, chapter: u32) -> Markup {
        html! {
            @for model in &self.models {
                @let fragments = chapter_fragments(model, chapter);
                @if !fragments.is_empty() {
                    (resource_block(model, "resource-chapter", html! {
                        h3.resource-label { (model.label()) }
                        @for fragment in &fragments {
                            (PreEscaped(*fragment))
                        }
                    }))
                }
            }
        }
    }

    fn chapter_by_verse(&self, keys: &[VerseKey], grouped: bool) -> Markup {
        html! {
            @for key in keys {
                @let fragments = self.fragments_at(*key);
                @if grouped {
                    @if !fragments.is_empty() {
                        div.verse-group {
                            @for (model, fragment) in &fragments {
                                (resource_block(model, "fragment", PreEscaped(fragment.to_string())))
                            }
                        }
                    }
                } @else {
                    @for (model, fragment) in &fragments {
                        (resource_block(model, "fragment", PreEscaped(fragment.to_string())))
                    }
                }
            }
        }
    }

    fn fragments_at(&self, key: VerseKey) -> Vec<(&'a ResourceModel, &'a str)> {
        self.models
            .iter()
            .filter_map(|m| match m.fragment(key) {
                Slot::Fragment(html) => Some((*m, html)),
                Slot::Covered | Slot::Missing => None,
            })
            .collect()
    }
}

fn chapter_fragments(model: &ResourceModel, chapter: u32) -> Vec<&str> {
    model
        .keys()
        .into_iter()
        .filter(|key| key.chapter == chapter)
        .filter_map(|key| match model.fragment(key) {
            Slot::Fragment(html) => Some(html),
            Slot::Covered | Slot::Missing => None,
        })
        .collect()
}

// ============================================================================
// Glossary
// ============================================================================

/// Words entries of one language, merged across books by slug.
#[derive(Debug)]
struct Glossary<'a> {
    /// First words model of the language; supplies labels and direction.
    model: &'a ResourceModel,
    entries: Vec<GlossaryEntry>,
}

fn merge_glossaries(models: &[ResourceModel]) -> Vec<Glossary<'_>> {
    let mut glossaries: Vec<(Glossary<'_>, BTreeMap<String, usize>)> = Vec::new();
    for model in models.iter().filter(|m| m.kind == ResourceKind::Words) {
        let lang = &model.request.lang_code;
        let index = match glossaries
            .iter()
            .position(|(g, _)| &g.model.request.lang_code == lang)
        {
            Some(i) => i,
            None => {
                glossaries.push((
                    Glossary {
                        model,
                        entries: Vec::new(),
                    },
                    BTreeMap::new(),
                ));
                glossaries.len() - 1
            }
        };
        let (glossary, by_slug) = &mut glossaries[index];
        for entry in model.glossary() {
            match by_slug.get(&entry.slug) {
                Some(&i) => glossary.entries[i].uses.extend(entry.uses.iter().cloned()),
                None => {
                    by_slug.insert(entry.slug.clone(), glossary.entries.len());
                    glossary.entries.push(entry.clone());
                }
            }
        }
    }
    glossaries
        .into_iter()
        .map(|(mut glossary, _)| {
            for entry in &mut glossary.entries {
                entry.uses.sort();
                entry.uses.dedup();
            }
            sort_glossary(&mut glossary.entries);
            glossary
        })
        .filter(|g| !g.entries.is_empty())
        .collect()
}

fn render_glossary(glossary: &Glossary<'_>, book_names: &BTreeMap<String, String>) -> Markup {
    let model = glossary.model;
    let book_name = |id: &str| {
        book_names
            .get(id)
            .cloned()
            .unwrap_or_else(|| naming::book_name(id))
    };
    html! {
        section.glossary lang=(model.request.lang_code) dir=(dir(model)) {
            h1.glossary-title { (model.label()) }
            @for entry in &glossary.entries {
                div.glossary-entry {
                    h3 id=(entry.anchor()) { (entry.term) }
                    (PreEscaped(&entry.html))
                    @if !entry.uses.is_empty() {
                        p.uses {
                            "Uses: "
                            @for (i, used) in entry.uses.iter().enumerate() {
                                @if i > 0 { ", " }
                                a href=(format!("#{}", used.anchor)) {
                                    (book_name(&used.book_id)) " " (used.chapter) ":" (used.verse)
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AuxBook, AuxFragment, AuxKind, ModelBody, VerseRef};
    use crate::usfm::{UsfmOptions, parse_usfm};

    const JUDE: &str = "\\id JUD\n\\h Jude\n\\c 1\n\\p\n\\v 1 One.\n\\v 2 Two.\n\\v 3 Three.\n";

    fn scripture(lang: &str, rtype: &str, book: &str, usfm: &str, prefix: &str) -> ResourceModel {
        let options = UsfmOptions {
            anchor_prefix: prefix.to_string(),
        };
        ResourceModel {
            request: ResourceRequest::new(lang, rtype, book),
            kind: ResourceKind::Scripture,
            lang_name: lang.to_string(),
            resource_type_name: rtype.to_string(),
            rtl: naming::is_rtl(lang),
            body: ModelBody::Scripture(parse_usfm(usfm, book, &options).unwrap().book),
        }
    }

    fn helps(kind: ResourceKind, rtype: &str, book: &str, notes: &[(Option<u32>, Option<u32>, &str)]) -> ResourceModel {
        let mut aux = AuxBook::new(book);
        for (chapter, verse, html) in notes {
            aux.insert(AuxFragment {
                book_id: book.to_string(),
                chapter: *chapter,
                verse: *verse,
                html: html.to_string(),
                kind: if verse.is_some() { AuxKind::Note } else { AuxKind::Intro },
            });
        }
        ResourceModel {
            request: ResourceRequest::new("en", rtype, book),
            kind,
            lang_name: "English".to_string(),
            resource_type_name: rtype.to_string(),
            rtl: false,
            body: ModelBody::Aux(aux),
        }
    }

    fn notes(book: &str, notes: &[(Option<u32>, Option<u32>, &str)]) -> ResourceModel {
        helps(ResourceKind::Notes, "tn-wa", book, notes)
    }

    fn run(models: &[ResourceModel], strategy: AssemblyStrategy) -> String {
        assemble(models, strategy, &RunControl::new()).unwrap().html()
    }

    fn pos(html: &str, needle: &str) -> usize {
        html.find(needle)
            .unwrap_or_else(|| panic!("{needle:?} not found in {html}"))
    }

    // =========================================================================
    // Failures
    // =========================================================================

    #[test]
    fn helps_only_is_no_books() {
        let models = [notes("jud", &[(Some(1), Some(1), "n1")])];
        assert_eq!(
            assemble(&models, AssemblyStrategy::Verse, &RunControl::new()),
            Err(AssemblyError::NoBooks)
        );
        assert_eq!(
            assemble(&[], AssemblyStrategy::Book, &RunControl::new()),
            Err(AssemblyError::NoBooks)
        );
    }

    #[test]
    fn all_empty_is_no_shared_resources() {
        let models = [
            scripture("en", "ulb-wa", "jud", "\\id JUD\n", ""),
            notes("jud", &[]),
        ];
        assert_eq!(
            assemble(&models, AssemblyStrategy::Chapter, &RunControl::new()),
            Err(AssemblyError::NoSharedResources)
        );
    }

    #[test]
    fn cancelled_run_stops() {
        let control = RunControl::new();
        control.cancel();
        let models = [scripture("en", "ulb-wa", "jud", JUDE, "")];
        assert_eq!(
            assemble(&models, AssemblyStrategy::Book, &control),
            Err(AssemblyError::Interrupted(Interrupt::Cancelled))
        );
    }

    // =========================================================================
    // Strategies
    // =========================================================================

    #[test]
    fn book_strategy_groups_by_resource() {
        let models = [
            scripture("en", "ulb-wa", "jud", JUDE, ""),
            notes("jud", &[(Some(1), Some(1), "<p>note one</p>"), (Some(1), Some(3), "<p>note three</p>")]),
        ];
        let html = run(&models, AssemblyStrategy::Book);
        assert_eq!(html.matches("<h1 class=\"book-title\">").count(), 1);
        assert!(pos(&html, "Three.") < pos(&html, "note one"));
        assert!(pos(&html, "note one") < pos(&html, "note three"));
        assert!(html.contains(r#"<div class="end-of-chapter"></div>"#));
    }

    #[test]
    fn chapter_strategy_interleaves_in_request_order() {
        let models = [
            notes("jud", &[(Some(1), Some(2), "<p>note two</p>")]),
            scripture("en", "ulb-wa", "jud", JUDE, ""),
        ];
        let html = run(&models, AssemblyStrategy::Chapter);
        assert!(pos(&html, "One.") < pos(&html, "note two"));
        // Request order: the note precedes its verse at the same key
        assert!(pos(&html, "note two") < pos(&html, "Two."));
        assert!(pos(&html, "Two.") < pos(&html, "Three."));
    }

    #[test]
    fn verse_strategy_puts_scripture_first() {
        let models = [
            helps(ResourceKind::Questions, "tq-wa", "jud", &[(Some(1), Some(2), "<p>question two</p>")]),
            notes("jud", &[(Some(1), Some(2), "<p>note two</p>")]),
            scripture("en", "ulb-wa", "jud", JUDE, ""),
        ];
        let html = run(&models, AssemblyStrategy::Verse);
        let verse = pos(&html, "Two.");
        let note = pos(&html, "note two");
        let question = pos(&html, "question two");
        assert!(verse < note && note < question);
        assert!(question < pos(&html, "Three."));
        assert!(html.contains(r#"<div class="verse-group">"#));
    }

    #[test]
    fn verse_strategy_orders_intros_by_kind() {
        let models = [
            notes("jud", &[(None, None, "<p>notes intro</p>"), (Some(1), None, "<p>notes ch1</p>")]),
            scripture("en", "ulb-wa", "jud", "\\id JUD\n\\ip Scripture intro.\n\\c 1\n\\p\n\\v 1 One.\n", ""),
        ];
        let html = run(&models, AssemblyStrategy::Verse);
        assert!(pos(&html, "Scripture intro.") < pos(&html, "notes intro"));
        assert!(pos(&html, "notes intro") < pos(&html, "notes ch1"));
        assert!(pos(&html, "notes ch1") < pos(&html, "One."));
    }

    #[test]
    fn bridge_emitted_once_and_helps_follow_it() {
        let usfm = "\\id JUD\n\\c 1\n\\p\n\\v 1 One.\n\\v 2-3 Two and three.\n\\v 4 Four.\n";
        let models = [
            scripture("en", "ulb-wa", "jud", usfm, ""),
            notes("jud", &[(Some(1), Some(3), "<p>note three</p>")]),
        ];
        let html = run(&models, AssemblyStrategy::Verse);
        assert_eq!(html.matches(r#"id="jud-ch-1-v-2""#).count(), 1);
        assert!(!html.contains(r#"id="jud-ch-1-v-3""#));
        assert!(pos(&html, "Two and three.") < pos(&html, "note three"));
        assert!(pos(&html, "note three") < pos(&html, "Four."));
    }

    #[test]
    fn second_scripture_shares_heading_with_own_anchors() {
        let models = [
            scripture("en", "ulb-wa", "jud", JUDE, ""),
            scripture("fr", "f10", "jud", JUDE, "fr-f10-"),
        ];
        let html = run(&models, AssemblyStrategy::Chapter);
        assert_eq!(html.matches("<h2 class=\"chapter-heading\"").count(), 1);
        assert!(html.contains(r#"id="jud-ch-1""#));
        assert!(html.contains(r#"<span class="chapter-anchor" id="fr-f10-jud-ch-1"></span>"#));
        assert!(html.contains(r#"id="fr-f10-jud-ch-1-v-1""#));
        assert!(html.contains(r#"lang="fr""#));
    }

    #[test]
    fn disjoint_books_follow_request_order() {
        let tit = "\\id TIT\n\\h Titus\n\\c 1\n\\p\n\\v 1 Paul.\n";
        for strategy in [AssemblyStrategy::Book, AssemblyStrategy::Verse] {
            let models = [
                scripture("en", "ulb-wa", "tit", tit, ""),
                scripture("en", "ulb-wa", "jud", JUDE, ""),
            ];
            let assembly = assemble(&models, strategy, &RunControl::new()).unwrap();
            assert_eq!(assembly.book_names, vec!["Titus", "Jude"]);
            let html = assembly.html();
            assert!(pos(&html, "Paul.") < pos(&html, "One."));
        }
    }

    #[test]
    fn helps_without_scripture_are_standalone() {
        let models = [
            scripture("en", "ulb-wa", "jud", JUDE, ""),
            notes("tit", &[(Some(1), Some(1), "<p>titus note</p>")]),
        ];
        let assembly = assemble(&models, AssemblyStrategy::Verse, &RunControl::new()).unwrap();
        assert_eq!(assembly.book_names, vec!["Jude", "Titus"]);
        let html = assembly.html();
        assert!(html.contains("titus note"));
        assert!(html.contains("<h2 class=\"chapter-heading\">Titus 1</h2>"));
    }

    #[test]
    fn rtl_models_carry_direction() {
        let models = [scripture("ar", "nav", "jud", JUDE, "")];
        let html = run(&models, AssemblyStrategy::Chapter);
        assert!(html.contains(r#"lang="ar" dir="rtl""#));
    }

    #[test]
    fn missing_verses_reported_once_per_resource() {
        let sparse = "\\id JUD\n\\c 1\n\\p\n\\v 1 Uno.\n";
        let models = [
            scripture("en", "ulb-wa", "jud", JUDE, ""),
            scripture("es", "reg", "jud", sparse, "es-reg-"),
        ];
        let assembly = assemble(&models, AssemblyStrategy::Verse, &RunControl::new()).unwrap();
        assert_eq!(assembly.missing.len(), 1);
        assert_eq!(assembly.missing[0].request.lang_code, "es");
        assert_eq!(
            assembly.missing[0].keys,
            vec![VerseKey::new(1, 2), VerseKey::new(1, 3)]
        );
    }

    #[test]
    fn assembly_is_deterministic() {
        let models = [
            scripture("en", "ulb-wa", "jud", JUDE, ""),
            notes("jud", &[(Some(1), Some(1), "<p>n</p>")]),
        ];
        assert_eq!(
            run(&models, AssemblyStrategy::Verse),
            run(&models, AssemblyStrategy::Verse)
        );
    }

    // =========================================================================
    // Glossary
    // =========================================================================

    fn words(book: &str, entries: &[(&str, &str, &[(u32, u32)])]) -> ResourceModel {
        let mut model = helps(ResourceKind::Words, "tw-wa", book, &[]);
        let ModelBody::Aux(aux) = &mut model.body else {
            unreachable!()
        };
        aux.glossary = entries
            .iter()
            .map(|(slug, term, uses)| GlossaryEntry {
                lang: "en".to_string(),
                slug: slug.to_string(),
                term: term.to_string(),
                html: format!("<p>{term} body</p>"),
                uses: uses
                    .iter()
                    .map(|&(c, v)| VerseRef {
                        book_id: book.to_string(),
                        chapter: c,
                        verse: v,
                        anchor: format!("{book}-ch-{c}-v-{v}"),
                    })
                    .collect(),
            })
            .collect();
        model
    }

    #[test]
    fn glossary_follows_books_merged_by_slug() {
        let tit = "\\id TIT\n\\h Titus\n\\c 1\n\\p\n\\v 1 Paul.\n";
        let models = [
            scripture("en", "ulb-wa", "jud", JUDE, ""),
            words("jud", &[("grace", "grace", &[(1, 3)]), ("mercy", "mercy", &[(1, 2)])]),
            scripture("en", "ulb-wa", "tit", tit, ""),
            words("tit", &[("grace", "grace", &[(1, 4)])]),
        ];
        let html = run(&models, AssemblyStrategy::Book);
        assert_eq!(html.matches(r#"<section class="glossary""#).count(), 1);
        assert_eq!(html.matches(r#"id="en-grace""#).count(), 1);
        assert!(pos(&html, "Paul.") < pos(&html, r#"id="en-grace""#));
        assert!(pos(&html, r#"id="en-grace""#) < pos(&html, r#"id="en-mercy""#));
        assert!(html.contains(r##"<a href="#jud-ch-1-v-3">Jude 1:3</a>, <a href="#tit-ch-1-v-4">Titus 1:4</a>"##));
    }
}
