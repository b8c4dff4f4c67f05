//! Pure rendering of resolution outcomes into user-facing message text.
//!
//! Everything here is deterministic string assembly; sending, quoting, and
//! the follow-up tasks (fallback search, infobox screenshot) are the command
//! layer's job.

use crate::resolve::{PageBranch, TitleOutcome};
use crate::titles;

pub const MSG_QUERY_FAILED: &str = "出现了亿点问题。";
pub const MSG_INVALID_API: &str = "输入的不是合法 api.php 网址。";
pub const MSG_SEARCH_PROMPT: &str = "要搜索什么呢？(输入空行或句号取消)";
pub const MSG_PICK_PROMPT: &str = "请输入想查看的页面编号。";
pub const MSG_DENIED: &str = "权限不足。";

/// Separator between blocks of a bundled multi-title reply.
pub const BLOCK_SEPARATOR: &str = "\n----\n";

/// Render one resolved title into its message block. `fallback_search`
/// annotates the missing branch when the command layer is about to run the
/// search flow.
pub fn render_outcome(api: &str, outcome: &TitleOutcome, fallback_search: bool) -> String {
    if let PageBranch::Interwiki { url } = &outcome.branch {
        return format!("跨语言链接：{url}{}", outcome.query.anchor);
    }

    let mut lines = Vec::new();
    let mut anchor = outcome.query.anchor.clone();

    lines.push(format!("您要的“{}”：", branch_title(&outcome.branch)));

    if let Some(r) = &outcome.redirect {
        match r.tofragment.as_deref() {
            Some(f) if !f.is_empty() => {
                lines.push(format!("重定向：[{}] → [{}#{}]", r.from, r.to, f));
                anchor = format!("#{}", titles::encode_anchor(f));
            }
            _ => lines.push(format!("重定向：[{}] → [{}]", r.from, r.to)),
        }
    }

    match &outcome.branch {
        PageBranch::Invalid { reason, .. } => {
            lines.push(format!(
                "页面名称不合法：{}",
                reason.as_deref().unwrap_or("原因未知")
            ));
        }
        PageBranch::Special { title, missing } => {
            let url = titles::index_php_url(api, &[("title", title)]);
            let tag = if *missing { "不存在的" } else { "" };
            lines.push(format!("{url}{anchor} ({tag}特殊页面)"));
        }
        PageBranch::Missing { edit_url, title } => {
            let url = edit_url
                .clone()
                .unwrap_or_else(|| titles::index_php_url(api, &[("title", title)]));
            if fallback_search {
                lines.push(format!("{url} (页面不存在，以下是搜索结果)"));
            } else {
                lines.push(format!("{url} (页面不存在)"));
            }
        }
        PageBranch::Normal { url, .. } => {
            lines.push(format!("{url}{anchor}"));
        }
        PageBranch::Interwiki { .. } => unreachable!("handled above"),
    }

    lines.join("\n")
}

fn branch_title(branch: &PageBranch) -> &str {
    match branch {
        PageBranch::Invalid { title, .. }
        | PageBranch::Special { title, .. }
        | PageBranch::Missing { title, .. }
        | PageBranch::Normal { title, .. } => title,
        PageBranch::Interwiki { .. } => "",
    }
}

/// Combine per-title blocks into the final reply body. A single block goes
/// out as-is; a bundle leads with the original input so readers can tell
/// which message triggered it.
pub fn assemble(original_input: &str, blocks: Vec<String>) -> Option<String> {
    match blocks.len() {
        0 => None,
        1 => blocks.into_iter().next(),
        _ => Some(format!(
            "{}{}{}",
            original_input.trim(),
            BLOCK_SEPARATOR,
            blocks.join(BLOCK_SEPARATOR)
        )),
    }
}

/// The numbered search-result picker, or the no-match message.
pub fn render_search_results(keyword: &str, titles: &[String]) -> String {
    if titles.is_empty() {
        return format!("关键词“{keyword}”没有匹配结果。");
    }
    let mut lines: Vec<String> = titles
        .iter()
        .enumerate()
        .map(|(i, t)| format!("{}. {}", i + 1, t))
        .collect();
    lines.push(MSG_PICK_PROMPT.to_string());
    lines.join("\n")
}
