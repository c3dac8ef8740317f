//! Canonical names: books, resource types, languages and numbered files.
//!
//! Book ids are the lowercase three-letter USFM codes (`gen`, `jud`, `rev`).
//! The USFM file number is the conventional prefix seen in source archives
//! (`01-GEN.usfm`, `66-JUD.usfm`); New Testament numbering starts at 41.
//!
//! ## Resource kinds
//!
//! Resource type codes are free-form in the catalog (`ulb`, `ulb-wa`,
//! `tn-wa`, `nav`). The kind is decided from the base code, the part before
//! the first `-`:
//! - `tn`, `tn-condensed` → translation notes
//! - `tq` → translation questions
//! - `tw` → translation words
//! - anything else → scripture, parsed as USFM

/// A canonical book entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Book {
    pub id: &'static str,
    pub name: &'static str,
    /// Conventional USFM file number (`66` for Jude).
    pub usfm_number: u32,
}

const BOOKS: &[(&str, &str, u32)] = &[
    ("gen", "Genesis", 1),
    ("exo", "Exodus", 2),
    ("lev", "Leviticus", 3),
    ("num", "Numbers", 4),
    ("deu", "Deuteronomy", 5),
    ("jos", "Joshua", 6),
    ("jdg", "Judges", 7),
    ("rut", "Ruth", 8),
    ("1sa", "1 Samuel", 9),
    ("2sa", "2 Samuel", 10),
    ("1ki", "1 Kings", 11),
    ("2ki", "2 Kings", 12),
    ("1ch", "1 Chronicles", 13),
    ("2ch", "2 Chronicles", 14),
    ("ezr", "Ezra", 15),
    ("neh", "Nehemiah", 16),
    ("est", "Esther", 17),
    ("job", "Job", 18),
    ("psa", "Psalms", 19),
    ("pro", "Proverbs", 20),
    ("ecc", "Ecclesiastes", 21),
    ("sng", "Song of Solomon", 22),
    ("isa", "Isaiah", 23),
    ("jer", "Jeremiah", 24),
    ("lam", "Lamentations", 25),
    ("ezk", "Ezekiel", 26),
    ("dan", "Daniel", 27),
    ("hos", "Hosea", 28),
    ("jol", "Joel", 29),
    ("amo", "Amos", 30),
    ("oba", "Obadiah", 31),
    ("jon", "Jonah", 32),
    ("mic", "Micah", 33),
    ("nam", "Nahum", 34),
    ("hab", "Habakkuk", 35),
    ("zep", "Zephaniah", 36),
    ("hag", "Haggai", 37),
    ("zec", "Zechariah", 38),
    ("mal", "Malachi", 39),
    ("mat", "Matthew", 41),
    ("mrk", "Mark", 42),
    ("luk", "Luke", 43),
    ("jhn", "John", 44),
    ("act", "Acts", 45),
    ("rom", "Romans", 46),
    ("1co", "1 Corinthians", 47),
    ("2co", "2 Corinthians", 48),
    ("gal", "Galatians", 49),
    ("eph", "Ephesians", 50),
    ("php", "Philippians", 51),
    ("col", "Colossians", 52),
    ("1th", "1 Thessalonians", 53),
    ("2th", "2 Thessalonians", 54),
    ("1ti", "1 Timothy", 55),
    ("2ti", "2 Timothy", 56),
    ("tit", "Titus", 57),
    ("phm", "Philemon", 58),
    ("heb", "Hebrews", 59),
    ("jas", "James", 60),
    ("1pe", "1 Peter", 61),
    ("2pe", "2 Peter", 62),
    ("1jn", "1 John", 63),
    ("2jn", "2 John", 64),
    ("3jn", "3 John", 65),
    ("jud", "Jude", 66),
    ("rev", "Revelation", 67),
];

/// Look up a canonical book by its lowercase id.
pub fn book(id: &str) -> Option<Book> {
    BOOKS
        .iter()
        .find(|(book_id, _, _)| *book_id == id)
        .map(|&(id, name, usfm_number)| Book {
            id,
            name,
            usfm_number,
        })
}

/// English display name for a book id, falling back to the id itself.
pub fn book_name(id: &str) -> String {
    book(id)
        .map(|b| b.name.to_string())
        .unwrap_or_else(|| id.to_string())
}

const RESOURCE_TYPE_NAMES: &[(&str, &str)] = &[
    ("avd", "Van Dyke Bible"),
    ("ayt", "Bahasa Indonesian Bible"),
    ("blv", "Portuguese Bíblia Livre"),
    ("cuv", "新标点和合本"),
    ("f10", "French Louis Segond 1910 Bible"),
    ("nav", "New Arabic Version"),
    ("reg", "Bible"),
    ("ugnt", "unfoldingWord® Greek New Testament"),
    ("uhb", "unfoldingWord® Hebrew Bible"),
    ("ulb", "Unlocked Literal Bible"),
    ("usfm", "Bible"),
    ("tn", "Translation Notes"),
    ("tn-condensed", "Condensed Translation Notes"),
    ("tq", "Translation Questions"),
    ("tw", "Translation Words"),
];

/// Display name for a resource type code, used when the catalog has none.
///
/// Matches the full code first (`tn-condensed`), then the base code
/// (`ulb-wa` → `ulb`).
pub fn resource_type_name(code: &str) -> String {
    let lookup = |c: &str| {
        RESOURCE_TYPE_NAMES
            .iter()
            .find(|(k, _)| *k == c)
            .map(|(_, name)| name.to_string())
    };
    lookup(code)
        .or_else(|| lookup(base_type(code)))
        .unwrap_or_else(|| code.to_string())
}

fn base_type(code: &str) -> &str {
    code.split('-').next().unwrap_or(code)
}

/// What a resource contains, decided from its type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Scripture,
    Notes,
    Questions,
    Words,
}

impl ResourceKind {
    pub fn for_type(resource_type: &str) -> Self {
        match base_type(&resource_type.to_ascii_lowercase()) {
            "tn" => ResourceKind::Notes,
            "tq" => ResourceKind::Questions,
            "tw" => ResourceKind::Words,
            _ => ResourceKind::Scripture,
        }
    }

    pub fn css_class(self) -> &'static str {
        match self {
            ResourceKind::Scripture => "scripture",
            ResourceKind::Notes => "notes",
            ResourceKind::Questions => "questions",
            ResourceKind::Words => "words",
        }
    }
}

const RTL_LANGUAGES: &[&str] = &[
    "ar", "ar-x-dcv", "ary", "arz", "apd", "fa", "he", "kas", "pbt", "pes", "pnb", "prs",
    "ps", "ug", "ur",
];

/// Whether a language code is written right-to-left.
pub fn is_rtl(lang_code: &str) -> bool {
    RTL_LANGUAGES.contains(&lang_code)
}

/// A file or directory name in a chapter/verse tree, like `01.md`,
/// `05-06.txt`, `intro.md` or `front`.
#[derive(Debug, Clone, PartialEq)]
pub enum NumberedStem {
    /// Leading number, e.g. `3` from `03.md` or `03-04.md`.
    Number(u32),
    /// `intro`
    Intro,
    /// `front`, `00` or `title`: front matter outside chapter numbering.
    Front,
    Other,
}

/// Classify the stem of a chapter directory or verse file name.
///
/// - `"01"` / `"001"` → `Number(1)`
/// - `"05-06"` → `Number(5)` (the first verse of a combined file)
/// - `"intro"` → `Intro`
/// - `"front"`, `"00"`, `"title"` → `Front`
/// - anything else → `Other`
pub fn parse_numbered_stem(stem: &str) -> NumberedStem {
    let lower = stem.to_ascii_lowercase();
    match lower.as_str() {
        "intro" => return NumberedStem::Intro,
        "front" | "title" => return NumberedStem::Front,
        _ => {}
    }
    let leading: String = lower.chars().take_while(|c| c.is_ascii_digit()).collect();
    let rest = &lower[leading.len()..];
    if leading.is_empty() || !(rest.is_empty() || rest.starts_with('-')) {
        return NumberedStem::Other;
    }
    match leading.parse::<u32>() {
        Ok(0) => NumberedStem::Front,
        Ok(n) => NumberedStem::Number(n),
        Err(_) => NumberedStem::Other,
    }
}

/// Whether `stem` names `book_id` as one of its `-`/`_`/`.` separated tokens.
///
/// `66-JUD`, `en_ulb_jud` and `jud` all match `jud`; `judges` does not.
pub fn stem_mentions_book(stem: &str, book_id: &str) -> bool {
    stem.split(['-', '_', '.', ' '])
        .any(|token| token.eq_ignore_ascii_case(book_id))
}
