//! Title parsing and URL helpers (pure, deterministic).
//!
//! Everything here is string-in/string-out with no failure modes: malformed
//! input yields an empty result, never an error.

/// Batch cap for one resolution request.
pub const MAX_TITLES_PER_QUERY: usize = 5;

/// Un-escape the HTML-entity bracket forms some chat hosts emit for `[`/`]`.
pub fn resolve_brackets(text: &str) -> String {
    text.replace("&#91;", "[").replace("&#93;", "]")
}

/// All non-overlapping `open…close` spans, each taken up to its first `|`.
///
/// Small manual scanner; mirrors the lazy-regex behavior of the upstream
/// syntax (`[[a[[b]]` yields `a[[b`).
fn scan_spans(text: &str, open: &str, close: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = text;
    while let Some(start) = rest.find(open) {
        let after = &rest[start + open.len()..];
        let Some(end) = after.find(close) else {
            break;
        };
        let inner = after[..end].split('|').next().unwrap_or("");
        if !inner.is_empty() {
            out.push(inner.to_string());
        }
        rest = &after[end + close.len()..];
    }
    out
}

fn uppercase_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

fn collapse_title_whitespace(raw: &str) -> String {
    raw.split(|c: char| c.is_whitespace() || c == '_')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// MediaWiki DB-key form: whitespace/underscore runs collapsed, trimmed,
/// spaces as underscores, first character upper-cased.
pub fn db_key(raw: &str) -> String {
    uppercase_first(&collapse_title_whitespace(raw).replace(' ', "_"))
}

/// Human-facing form of the same normalization (spaces kept).
pub fn display_title(raw: &str) -> String {
    uppercase_first(&collapse_title_whitespace(raw))
}

fn extract_titles(text: &str, open: &str, close: &str) -> Vec<String> {
    let text = resolve_brackets(text);
    let mut seen = std::collections::BTreeSet::new();
    let mut out = Vec::new();
    for inner in scan_spans(&text, open, close) {
        let key = db_key(&inner);
        if key.is_empty() {
            continue;
        }
        if seen.insert(key.clone()) {
            out.push(key);
        }
    }
    out
}

/// Unique DB-key titles from `[[…]]` wikilinks, in first-seen order.
pub fn parse_wikilinks(text: &str) -> Vec<String> {
    extract_titles(text, "[[", "]]")
}

/// Unique DB-key titles from `{{…}}` template references, in first-seen order.
pub fn parse_templates(text: &str) -> Vec<String> {
    extract_titles(text, "{{", "}}")
}

/// Percent-encode a fragment the way `encodeURI` does: unreserved and URI
/// reserved characters pass through, everything else (including each byte of
/// a multi-byte character) is `%XX`-escaped.
pub fn encode_anchor(fragment: &str) -> String {
    const KEEP: &[u8] = b"-_.!~*'();/?:@&=+$,#";
    let mut out = String::new();
    for &b in fragment.as_bytes() {
        if b.is_ascii_alphanumeric() || KEEP.contains(&b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// One user-requested title: normalized page name plus optional `#fragment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleQuery {
    /// The input as the user supplied it (trimmed).
    pub raw: String,
    /// Normalized page name sent to the API.
    pub name: String,
    /// Empty, or `#`-prefixed and percent-encoded.
    pub anchor: String,
}

impl TitleQuery {
    pub fn parse(raw: &str) -> Option<TitleQuery> {
        let trimmed = raw.trim();
        let (name_part, fragment) = match trimmed.split_once('#') {
            Some((n, f)) => (n, Some(f)),
            None => (trimmed, None),
        };
        let name = display_title(name_part);
        if name.is_empty() {
            return None;
        }
        let anchor = match fragment {
            Some(f) if !f.trim().is_empty() => format!("#{}", encode_anchor(f)),
            _ => String::new(),
        };
        Some(TitleQuery {
            raw: trimmed.to_string(),
            name,
            anchor,
        })
    }

    /// Parse, dedup by normalized name (first occurrence wins), and cap at
    /// [`MAX_TITLES_PER_QUERY`].
    pub fn parse_batch<I, S>(inputs: I) -> Vec<TitleQuery>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen = std::collections::BTreeSet::new();
        let mut out = Vec::new();
        for raw in inputs {
            if out.len() >= MAX_TITLES_PER_QUERY {
                break;
            }
            let Some(q) = TitleQuery::parse(raw.as_ref()) else {
                continue;
            };
            if seen.insert(q.name.clone()) {
                out.push(q);
            }
        }
        out
    }
}

/// Build a `…/<script>.php?…` URL next to an `api.php` endpoint, tolerant of
/// trailing slashes in the configured endpoint.
pub fn script_url(api: &str, script: &str, params: &[(&str, &str)]) -> String {
    let base = api.trim().trim_end_matches('/');
    let root = base.strip_suffix("/api.php").unwrap_or(base);
    let mut out = format!("{root}/{script}.php");
    if !params.is_empty() {
        let qs = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(params.iter().copied())
            .finish();
        out.push('?');
        out.push_str(&qs);
    }
    out
}

/// `…/index.php?…` next to the endpoint; the plugin's article/edit URL form.
pub fn index_php_url(api: &str, params: &[(&str, &str)]) -> String {
    script_url(api, "index", params)
}

/// Shape check for user-supplied endpoints: `http(s)` and a path ending in
/// `/api.php`.
pub fn is_valid_api(api: &str) -> bool {
    let Ok(url) = url::Url::parse(api.trim()) else {
        return false;
    };
    matches!(url.scheme(), "http" | "https") && url.path().ends_with("/api.php")
}
