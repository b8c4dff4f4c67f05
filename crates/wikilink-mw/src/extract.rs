//! Intro extraction from rendered parse HTML.

/// Character cap applied to page intros before appending `...`.
pub const INTRO_CHAR_LIMIT: usize = 150;

/// Concatenated text of the top-level paragraphs in a `mw-parser-output`
/// wrapper, trimmed and capped. Returns an empty string when the markup has
/// no such paragraphs.
pub fn page_intro(html: &str, limit: usize) -> String {
    let doc = html_scraper::Html::parse_fragment(html);
    let sel = match html_scraper::Selector::parse(".mw-parser-output > p") {
        Ok(s) => s,
        Err(_) => return String::new(),
    };

    let mut text = String::new();
    for el in doc.select(&sel) {
        for piece in el.text() {
            text.push_str(piece);
        }
    }

    let trimmed = text.trim();
    let mut out: String = trimmed.chars().take(limit).collect();
    if trimmed.chars().count() > limit {
        out.push_str("...");
    }
    out
}
