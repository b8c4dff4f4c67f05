//! Title resolution: one batched page-info query, then per-title
//! classification into the branch the reply layer renders.
//!
//! The danger-redirect rule lives here as a pure transform: a redirect out of
//! a personal special page (`Special:Mypage`, `Special:Mytalk`, or any
//! localized alias the wiki reports) would leak the bot account's identity
//! through the target URL, so the result is overwritten with a synthetic
//! special-page entry and the redirect is suppressed.

use std::collections::BTreeSet;

use crate::gateway::{ApiGateway, PageInfo, QueryPayload, RedirectInfo};
use crate::titles::{self, TitleQuery};
use wikilink_core::Result;

/// Canonical names of special pages whose redirects must be masked.
pub const DANGER_SPECIAL_PAGES: &[&str] = &["Mypage", "Mytalk"];

/// Title comparison the way MediaWiki treats titles: case-insensitive with
/// underscores and spaces interchangeable.
fn eq_title(a: &str, b: &str) -> bool {
    let fold = |s: &str| s.trim().replace('_', " ").to_lowercase();
    fold(a) == fold(b)
}

/// The slice of site metadata the resolver needs: the localized name of the
/// special namespace and the full localized danger-page alias set.
#[derive(Debug, Clone)]
pub struct SiteMeta {
    special_namespace: String,
    danger_aliases: BTreeSet<String>,
}

impl SiteMeta {
    pub fn from_query(q: &QueryPayload, extra_danger: &[String]) -> Self {
        let special_namespace = q
            .namespaces
            .get(&-1)
            .cloned()
            .unwrap_or_else(|| "Special".to_string());

        let canonical: BTreeSet<&str> = DANGER_SPECIAL_PAGES
            .iter()
            .copied()
            .chain(extra_danger.iter().map(String::as_str))
            .collect();
        let mut danger_aliases: BTreeSet<String> =
            canonical.iter().map(|s| s.to_string()).collect();
        for entry in &q.specialpagealiases {
            if canonical.contains(entry.realname.as_str()) {
                danger_aliases.extend(entry.aliases.iter().cloned());
            }
        }

        Self {
            special_namespace,
            danger_aliases,
        }
    }

    pub fn special_namespace(&self) -> &str {
        &self.special_namespace
    }

    /// True when the first path segment of a special-page subtitle is a
    /// danger page name or alias.
    pub fn is_danger_special(&self, rest: &str) -> bool {
        let first = rest.split('/').next().unwrap_or("").trim();
        self.danger_aliases
            .iter()
            .any(|a| eq_title(a, first))
    }
}

/// Normalized view of one page-info entry, decoupled from the wire struct so
/// the danger transform can synthesize entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageResult {
    pub page_id: Option<u64>,
    pub ns: i64,
    pub title: String,
    pub missing: bool,
    pub invalid: bool,
    pub invalid_reason: Option<String>,
    pub special: bool,
    pub edit_url: Option<String>,
    pub canonical_url: Option<String>,
    pub extract: Option<String>,
}

impl From<&PageInfo> for PageResult {
    fn from(p: &PageInfo) -> Self {
        Self {
            page_id: p.pageid,
            ns: p.ns.unwrap_or(0),
            title: p.title.clone(),
            missing: p.missing,
            invalid: p.invalid,
            invalid_reason: p.invalidreason.clone(),
            special: p.special,
            edit_url: p.editurl.clone(),
            canonical_url: p.canonicalurl.clone(),
            extract: p.extract.clone(),
        }
    }
}

/// Apply the danger-redirect rule, producing a fresh result instead of
/// mutating the lookup. Returns the (possibly replaced) page and the
/// redirect that is still safe to report.
pub fn apply_danger_policy(
    page: PageResult,
    redirect: Option<RedirectInfo>,
    meta: &SiteMeta,
) -> (PageResult, Option<RedirectInfo>) {
    let Some(r) = redirect else {
        return (page, None);
    };
    let Some((ns, rest)) = r.from.split_once(':') else {
        return (page, Some(r));
    };
    if eq_title(ns, meta.special_namespace()) && meta.is_danger_special(rest) {
        let masked = PageResult {
            page_id: None,
            ns: -1,
            title: r.from.clone(),
            missing: false,
            invalid: false,
            invalid_reason: None,
            special: true,
            edit_url: None,
            canonical_url: None,
            extract: None,
        };
        return (masked, None);
    }
    (page, Some(r))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageBranch {
    /// Cross-site link; short-circuits everything else for this title.
    Interwiki { url: String },
    Invalid {
        title: String,
        reason: Option<String>,
    },
    Special {
        title: String,
        missing: bool,
    },
    Missing {
        title: String,
        edit_url: Option<String>,
    },
    Normal {
        page_id: Option<u64>,
        ns: i64,
        title: String,
        url: String,
        extract: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleOutcome {
    pub query: TitleQuery,
    /// Redirect that survived the danger policy and should be reported.
    pub redirect: Option<RedirectInfo>,
    pub branch: PageBranch,
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    pub outcomes: Vec<TitleOutcome>,
}

/// Follow the server's normalization and redirect chains from a requested
/// name to the title its page entry carries.
fn follow_chains(q: &QueryPayload, requested: &str) -> (String, Option<RedirectInfo>) {
    let mut current = requested.to_string();
    if let Some(n) = q.normalized.iter().find(|n| eq_title(&n.from, &current)) {
        current = n.to.clone();
    }
    let redirect = q
        .redirects
        .iter()
        .find(|r| eq_title(&r.from, &current))
        .cloned();
    if let Some(r) = &redirect {
        current = r.to.clone();
    }
    (current, redirect)
}

/// The normal-branch URL: the shorter of the `curid` short form and the
/// canonical URL; ties keep the curid form (stable across renames).
fn page_url(api: &str, page: &PageResult) -> String {
    let short = page
        .page_id
        .map(|id| titles::index_php_url(api, &[("curid", &id.to_string())]));
    match (short, page.canonical_url.clone()) {
        (Some(s), Some(c)) => {
            if c.len() < s.len() {
                c
            } else {
                s
            }
        }
        (Some(s), None) => s,
        (None, Some(c)) => c,
        (None, None) => titles::index_php_url(api, &[("title", &page.title)]),
    }
}

/// Classify every requested title against one query payload. Pure; the async
/// wrapper below does the fetch.
pub fn classify(q: &QueryPayload, queries: &[TitleQuery], meta: &SiteMeta, api: &str) -> Resolution {
    let mut outcomes = Vec::with_capacity(queries.len());
    for tq in queries {
        // Interwiki results take precedence over all page-info branches.
        let interwiki = q
            .interwiki
            .iter()
            .find(|iw| {
                iw.title
                    .as_deref()
                    .map(|t| eq_title(t, &tq.name) || eq_title(t, &tq.raw))
                    .unwrap_or(false)
            })
            .or_else(|| {
                if queries.len() == 1 {
                    q.interwiki.first()
                } else {
                    None
                }
            });
        if let Some(iw) = interwiki {
            outcomes.push(TitleOutcome {
                query: tq.clone(),
                redirect: None,
                branch: PageBranch::Interwiki {
                    url: iw.url.clone(),
                },
            });
            continue;
        }

        let (final_title, redirect) = follow_chains(q, &tq.name);
        let info = q
            .pages
            .iter()
            .find(|p| eq_title(&p.title, &final_title))
            .or(if queries.len() == 1 { q.pages.first() } else { None });
        let Some(info) = info else {
            outcomes.push(TitleOutcome {
                query: tq.clone(),
                redirect: None,
                branch: PageBranch::Invalid {
                    title: tq.name.clone(),
                    reason: None,
                },
            });
            continue;
        };

        let (page, redirect) = apply_danger_policy(PageResult::from(info), redirect, meta);

        let branch = if page.invalid {
            PageBranch::Invalid {
                title: page.title.clone(),
                reason: page.invalid_reason.clone(),
            }
        } else if page.special {
            PageBranch::Special {
                title: page.title.clone(),
                missing: page.missing,
            }
        } else if page.missing {
            PageBranch::Missing {
                title: page.title.clone(),
                edit_url: page.edit_url.clone(),
            }
        } else {
            PageBranch::Normal {
                page_id: page.page_id,
                ns: page.ns,
                title: page.title.clone(),
                url: page_url(api, &page),
                extract: page.extract.clone(),
            }
        };

        outcomes.push(TitleOutcome {
            query: tq.clone(),
            redirect,
            branch,
        });
    }
    Resolution { outcomes }
}

/// Resolve a batch of titles: one query request, site meta piggybacked.
pub async fn resolve(
    gateway: &ApiGateway,
    queries: &[TitleQuery],
    extra_danger: &[String],
) -> Result<Resolution> {
    if queries.is_empty() {
        return Ok(Resolution::default());
    }
    let names: Vec<String> = queries.iter().map(|q| q.name.clone()).collect();
    let payload = gateway.query_pages(&names).await?;
    let meta = SiteMeta::from_query(&payload, extra_danger);
    tracing::debug!(
        titles = names.len(),
        pages = payload.pages.len(),
        redirects = payload.redirects.len(),
        interwiki = payload.interwiki.len(),
        "resolved page info"
    );
    Ok(classify(&payload, queries, &meta, gateway.api()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{InterwikiInfo, SpecialPageAlias};

    const API: &str = "https://wiki.example/api.php";

    fn meta_with_aliases(aliases: &[&str]) -> SiteMeta {
        let mut q = QueryPayload::default();
        q.namespaces.insert(-1, "Special".to_string());
        q.specialpagealiases = vec![SpecialPageAlias {
            realname: "Mypage".to_string(),
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
        }];
        SiteMeta::from_query(&q, &[])
    }

    fn query(name: &str) -> TitleQuery {
        TitleQuery::parse(name).unwrap()
    }

    fn normal_page(title: &str, pageid: u64) -> PageInfo {
        PageInfo {
            pageid: Some(pageid),
            ns: Some(0),
            title: title.to_string(),
            canonicalurl: Some(format!(
                "https://wiki.example/{}",
                title.replace(' ', "_")
            )),
            editurl: Some(format!(
                "https://wiki.example/index.php?title={}&action=edit",
                title.replace(' ', "_")
            )),
            ..Default::default()
        }
    }

    #[test]
    fn danger_redirect_is_masked_and_suppressed() {
        let meta = meta_with_aliases(&["Mypage", "我的用户页"]);
        let page = PageResult::from(&normal_page("User:ExampleBot", 9));
        let redirect = Some(RedirectInfo {
            from: "Special:Mypage/subpage".to_string(),
            to: "User:ExampleBot".to_string(),
            tofragment: None,
        });

        let (out, surviving) = apply_danger_policy(page, redirect, &meta);
        assert!(surviving.is_none());
        assert!(out.special);
        assert!(!out.missing);
        assert_eq!(out.ns, -1);
        assert_eq!(out.title, "Special:Mypage/subpage");
    }

    #[test]
    fn localized_alias_fires_the_policy() {
        let meta = meta_with_aliases(&["我的用户页"]);
        let page = PageResult::from(&normal_page("User:ExampleBot", 9));
        let redirect = Some(RedirectInfo {
            from: "Special:我的用户页".to_string(),
            to: "User:ExampleBot".to_string(),
            tofragment: None,
        });
        let (out, surviving) = apply_danger_policy(page, redirect, &meta);
        assert!(out.special);
        assert!(surviving.is_none());
    }

    #[test]
    fn talk_namespace_redirect_is_reported_normally() {
        let meta = meta_with_aliases(&["Mypage"]);
        let page = PageResult::from(&normal_page("Bar", 4));
        let redirect = Some(RedirectInfo {
            from: "Talk:Foo".to_string(),
            to: "Bar".to_string(),
            tofragment: None,
        });
        let (out, surviving) = apply_danger_policy(page.clone(), redirect.clone(), &meta);
        assert_eq!(out, page);
        assert_eq!(surviving, redirect);
    }

    #[test]
    fn non_danger_special_redirect_is_reported_normally() {
        let meta = meta_with_aliases(&["Mypage"]);
        let page = PageResult::from(&normal_page("Wanted", 4));
        let redirect = Some(RedirectInfo {
            from: "Special:WantedPages".to_string(),
            to: "Wanted".to_string(),
            tofragment: None,
        });
        let (_, surviving) = apply_danger_policy(page, redirect.clone(), &meta);
        assert_eq!(surviving, redirect);
    }

    #[test]
    fn interwiki_short_circuits_page_info() {
        let mut payload = QueryPayload::default();
        payload.namespaces.insert(-1, "Special".to_string());
        payload.interwiki = vec![InterwikiInfo {
            title: Some("fr:Paris".to_string()),
            url: "https://fr.wikipedia.org/wiki/Paris".to_string(),
        }];
        // A page entry is present too; interwiki must still win.
        payload.pages = vec![normal_page("fr:Paris", 1)];

        let meta = SiteMeta::from_query(&payload, &[]);
        let res = classify(&payload, &[query("fr:Paris")], &meta, API);
        assert_eq!(res.outcomes.len(), 1);
        assert!(matches!(
            &res.outcomes[0].branch,
            PageBranch::Interwiki { url } if url.contains("fr.wikipedia.org")
        ));
    }

    #[test]
    fn invalid_branch_carries_server_reason() {
        let mut payload = QueryPayload::default();
        payload.pages = vec![PageInfo {
            title: "<bad>".to_string(),
            invalid: true,
            invalidreason: Some("contains invalid characters".to_string()),
            ..Default::default()
        }];
        let meta = SiteMeta::from_query(&payload, &[]);
        let res = classify(&payload, &[query("<bad>")], &meta, API);
        assert!(matches!(
            &res.outcomes[0].branch,
            PageBranch::Invalid { reason: Some(r), .. } if r.contains("invalid characters")
        ));
    }

    #[test]
    fn missing_branch_keeps_edit_url() {
        let mut payload = QueryPayload::default();
        payload.pages = vec![PageInfo {
            title: "Ghost".to_string(),
            missing: true,
            editurl: Some("https://wiki.example/index.php?title=Ghost&action=edit".to_string()),
            ..Default::default()
        }];
        let meta = SiteMeta::from_query(&payload, &[]);
        let res = classify(&payload, &[query("Ghost")], &meta, API);
        assert!(matches!(
            &res.outcomes[0].branch,
            PageBranch::Missing { edit_url: Some(u), .. } if u.contains("action=edit")
        ));
    }

    #[test]
    fn normal_branch_picks_shorter_url() {
        // canonical shorter than curid form
        let mut payload = QueryPayload::default();
        let mut p = normal_page("Main Page", 1);
        p.canonicalurl = Some("https://w.example/MP".to_string());
        payload.pages = vec![p];
        let meta = SiteMeta::from_query(&payload, &[]);
        let res = classify(&payload, &[query("Main Page")], &meta, API);
        match &res.outcomes[0].branch {
            PageBranch::Normal { url, .. } => assert_eq!(url, "https://w.example/MP"),
            other => panic!("unexpected branch {other:?}"),
        }

        // curid shorter than a long canonical
        let mut payload = QueryPayload::default();
        let mut p = normal_page("Main Page", 1);
        p.canonicalurl = Some(format!("https://w.example/{}", "x".repeat(80)));
        payload.pages = vec![p];
        let res = classify(&payload, &[query("Main Page")], &meta, API);
        match &res.outcomes[0].branch {
            PageBranch::Normal { url, .. } => {
                assert_eq!(url, "https://wiki.example/index.php?curid=1")
            }
            other => panic!("unexpected branch {other:?}"),
        }
    }

    #[test]
    fn redirect_chain_finds_target_page() {
        let mut payload = QueryPayload::default();
        payload.normalized = vec![crate::gateway::NormalizedInfo {
            from: "mp".to_string(),
            to: "Mp".to_string(),
        }];
        payload.redirects = vec![RedirectInfo {
            from: "Mp".to_string(),
            to: "Main Page".to_string(),
            tofragment: Some("History".to_string()),
        }];
        payload.pages = vec![normal_page("Main Page", 1)];
        let meta = SiteMeta::from_query(&payload, &[]);
        let res = classify(&payload, &[query("mp")], &meta, API);
        let out = &res.outcomes[0];
        assert!(matches!(&out.branch, PageBranch::Normal { title, .. } if title == "Main Page"));
        assert_eq!(
            out.redirect.as_ref().and_then(|r| r.tofragment.as_deref()),
            Some("History")
        );
    }

    #[test]
    fn colliding_titles_each_get_an_outcome() {
        let mut payload = QueryPayload::default();
        payload.normalized = vec![crate::gateway::NormalizedInfo {
            from: "Main page".to_string(),
            to: "Main Page".to_string(),
        }];
        payload.pages = vec![normal_page("Main Page", 1)];
        let meta = SiteMeta::from_query(&payload, &[]);
        let queries = [query("Main Page"), query("Main page")];
        let res = classify(&payload, &queries, &meta, API);
        assert_eq!(res.outcomes.len(), 2);
        for out in &res.outcomes {
            assert!(matches!(&out.branch, PageBranch::Normal { title, .. } if title == "Main Page"));
        }
    }
}
