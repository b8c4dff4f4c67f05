//! The command surface of the wikilink plugin.
//!
//! `WikiPlugin` owns the injected configuration and the binding store, and
//! exposes one method per chat command plus the message middleware. All chat
//! I/O goes through the host-agnostic [`ChatHost`] contract, so the same
//! plugin drives a real chat framework and the local CLI alike.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use wikilink_core::{
    default_infobox_definitions, BindingStore, ChatHost, ChatScope, InfoboxDefinition,
    OutgoingMessage, Result, SiteRule, WikiFlags,
};
use wikilink_mw::gateway::ApiGateway;
use wikilink_mw::resolve::{self, PageBranch};
use wikilink_mw::snapshot::{self, SnapshotTarget};
use wikilink_mw::titles::{self, TitleQuery};
use wikilink_mw::{extract, reply};

use serde::Deserialize;

/// Default endpoints used when a scope has no binding of its own.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DefaultApi {
    pub group: Option<String>,
    pub private: Option<String>,
}

/// Everything the plugin is configured with, injected at construction.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PluginConfig {
    pub cmd_auth_wiki: u16,
    pub cmd_auth_connect: u16,
    pub cmd_auth_search: u16,
    pub cmd_auth_parse: u16,
    pub default_flags: WikiFlags,
    pub default_api: DefaultApi,
    /// Per-site request overrides; later entries take priority.
    pub site_rules: Vec<SiteRule>,
    /// Infobox definitions; first host match wins.
    pub infoboxes: Vec<InfoboxDefinition>,
    /// Extra canonical danger-page names beyond Mypage/Mytalk.
    pub extra_danger_pages: Vec<String>,
    pub prompt_timeout_ms: u64,
}

impl Default for PluginConfig {
    fn default() -> Self {
        let mut huiji_headers = BTreeMap::new();
        huiji_headers.insert(
            "user-agent".to_string(),
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/114.0.0.0 Safari/537.36 Edg/114.0.1823.67".to_string(),
        );
        Self {
            cmd_auth_wiki: 1,
            cmd_auth_connect: 2,
            cmd_auth_search: 1,
            cmd_auth_parse: 3,
            default_flags: WikiFlags::default(),
            default_api: DefaultApi::default(),
            site_rules: vec![SiteRule {
                host: "huijiwiki.com".to_string(),
                headers: huiji_headers,
                proxy: None,
            }],
            infoboxes: default_infobox_definitions(),
            extra_danger_pages: Vec::new(),
            prompt_timeout_ms: 30_000,
        }
    }
}

impl PluginConfig {
    /// Drop configured defaults that fail the endpoint shape check, the same
    /// way the deployment would at startup. Invalid entries are logged, not
    /// fatal.
    fn sanitized(mut self) -> Self {
        if let Some(api) = self.default_api.private.take() {
            if titles::is_valid_api(&api) {
                self.default_api.private = Some(api);
            } else {
                tracing::warn!(%api, "default private endpoint is not a valid api.php url; ignoring");
            }
        }
        if let Some(api) = self.default_api.group.take() {
            if titles::is_valid_api(&api) {
                self.default_api.group = Some(api);
            } else {
                tracing::warn!(%api, "default group endpoint is not a valid api.php url; ignoring");
            }
        }
        self
    }
}

/// Per-invocation options of the `wiki` command. `search: None` falls back
/// to the configured default flag.
#[derive(Debug, Clone, Copy, Default)]
pub struct WikiOptions {
    pub details: bool,
    pub quiet: bool,
    pub search: Option<bool>,
}

/// In-memory binding store for the CLI and tests.
#[derive(Default)]
pub struct MemoryBindings {
    inner: tokio::sync::RwLock<BTreeMap<String, String>>,
}

#[async_trait::async_trait]
impl BindingStore for MemoryBindings {
    async fn get(&self, scope: &ChatScope) -> Result<Option<String>> {
        Ok(self.inner.read().await.get(&scope.key()).cloned())
    }

    async fn set(&self, scope: &ChatScope, api: &str) -> Result<()> {
        self.inner
            .write()
            .await
            .insert(scope.key(), api.to_string());
        Ok(())
    }

    async fn clear(&self, scope: &ChatScope) -> Result<Option<String>> {
        Ok(self.inner.write().await.remove(&scope.key()))
    }
}

pub struct WikiPlugin {
    config: PluginConfig,
    bindings: Arc<dyn BindingStore>,
}

impl WikiPlugin {
    pub fn new(config: PluginConfig, bindings: Arc<dyn BindingStore>) -> Self {
        Self {
            config: config.sanitized(),
            bindings,
        }
    }

    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    /// Bound endpoint for a scope, optionally falling back to the configured
    /// default for that scope kind.
    async fn api_for(&self, scope: &ChatScope, use_default: bool) -> Result<Option<String>> {
        if let Some(api) = self.bindings.get(scope).await? {
            if !api.is_empty() {
                return Ok(Some(api));
            }
        }
        if use_default {
            let default = if scope.is_private() {
                &self.config.default_api.private
            } else {
                &self.config.default_api.group
            };
            return Ok(default.clone());
        }
        Ok(None)
    }

    fn gateway(&self, api: &str) -> Result<ApiGateway> {
        ApiGateway::new(api, &self.config.site_rules)
    }

    fn here(scope: &ChatScope) -> &'static str {
        if scope.is_private() {
            "您的查询"
        } else {
            "本群"
        }
    }

    /// The `wiki.connect` status message; also serves as the "please connect
    /// first" hint other commands fall back to.
    async fn connect_status(&self, host: &dyn ChatHost, scope: &ChatScope) -> Result<()> {
        let here = Self::here(scope);
        let bound = self.api_for(scope, false).await?;
        let msg = if let Some(api) = bound {
            format!("{here}已与 {api} 连接。")
        } else if let Some(default) = self.api_for(scope, true).await? {
            format!("{here}已与默认站点 {default} 连接。请使用“wiki.connect <api网址>”进行连接。")
        } else {
            format!("{here}未连接到 MediaWiki 网站。请使用“wiki.connect <api网址>”进行连接。")
        };
        host.send(OutgoingMessage::text(msg)).await
    }

    /// `wiki <title>` — resolve one title and reply.
    pub async fn cmd_wiki(
        &self,
        host: &Arc<dyn ChatHost>,
        scope: &ChatScope,
        input: &str,
        opts: WikiOptions,
    ) -> Result<()> {
        if host.authority() < self.config.cmd_auth_wiki {
            if !opts.quiet {
                host.send(OutgoingMessage::text(reply::MSG_DENIED)).await?;
            }
            return Ok(());
        }
        let Some(api) = self.api_for(scope, true).await? else {
            if opts.quiet {
                return Ok(());
            }
            return self.connect_status(host.as_ref(), scope).await;
        };

        let input = titles::resolve_brackets(input.trim());
        if input.is_empty() {
            let url = titles::index_php_url(&api, &[]);
            host.send(OutgoingMessage::quoting(host.message_id(), url))
                .await?;
            return Ok(());
        }

        // `[[bracketed]]` input works here too, so forwarded chat messages
        // and the bare command behave the same.
        let links = titles::parse_wikilinks(&input);
        let queries = if links.is_empty() {
            TitleQuery::parse(&input).into_iter().collect()
        } else {
            TitleQuery::parse_batch(&links)
        };
        if queries.is_empty() {
            return Ok(());
        }
        self.run_wiki_flow(host, scope, &api, &input, queries, opts)
            .await
    }

    /// Shared resolution + reply pipeline for `wiki` and the middleware.
    async fn run_wiki_flow(
        &self,
        host: &Arc<dyn ChatHost>,
        scope: &ChatScope,
        api: &str,
        input: &str,
        queries: Vec<TitleQuery>,
        opts: WikiOptions,
    ) -> Result<()> {
        let gateway = match self.gateway(api) {
            Ok(g) => g,
            Err(e) => {
                tracing::warn!(error = %e, "gateway construction failed");
                host.send(OutgoingMessage::quoting(
                    host.message_id(),
                    reply::MSG_QUERY_FAILED,
                ))
                .await?;
                return Ok(());
            }
        };

        let resolution =
            match resolve::resolve(&gateway, &queries, &self.config.extra_danger_pages).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, "wiki query failed");
                    host.send(OutgoingMessage::quoting(
                        host.message_id(),
                        reply::MSG_QUERY_FAILED,
                    ))
                    .await?;
                    return Ok(());
                }
            };

        let single = resolution.outcomes.len() == 1;
        let search_flag = opts
            .search
            .unwrap_or(self.config.default_flags.search_non_exist);
        let details = opts.details || self.config.default_flags.show_details_by_default;

        let mut blocks = Vec::new();
        let mut fallback_keyword: Option<String> = None;
        for outcome in &resolution.outcomes {
            // Fallback search only fires for a single-title batch; with more
            // titles the bundled reply already tells the user what's missing.
            let fallback =
                single && search_flag && matches!(outcome.branch, PageBranch::Missing { .. });
            if fallback {
                fallback_keyword = Some(outcome.query.name.clone());
            }

            let mut block = reply::render_outcome(api, outcome, fallback);
            if details {
                if let PageBranch::Normal {
                    page_id: Some(id), ..
                } = &outcome.branch
                {
                    match self.page_intro(&gateway, *id).await {
                        Ok(intro) if !intro.is_empty() => {
                            block.push('\n');
                            block.push_str(&intro);
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!(error = %e, "intro fetch failed"),
                    }
                }
            }
            blocks.push(block);
        }

        if let Some(text) = reply::assemble(input, blocks) {
            host.send(OutgoingMessage::quoting(host.message_id(), text))
                .await?;
        }

        // Fire-and-continue screenshot: must never delay the reply above.
        if details && self.config.default_flags.infobox_details {
            self.spawn_infobox_followup(host, &resolution);
        }

        if let Some(keyword) = fallback_keyword {
            self.search_flow(host, scope, api, &keyword).await?;
        }
        Ok(())
    }

    async fn page_intro(&self, gateway: &ApiGateway, pageid: u64) -> Result<String> {
        let parsed = gateway.parse_page(pageid).await?;
        Ok(extract::page_intro(
            parsed.text.as_deref().unwrap_or(""),
            extract::INTRO_CHAR_LIMIT,
        ))
    }

    /// When exactly one outcome is a main-namespace page with an extract,
    /// capture its infobox in the background and append it as a follow-up
    /// message. Failures are logged, never surfaced.
    fn spawn_infobox_followup(&self, host: &Arc<dyn ChatHost>, resolution: &resolve::Resolution) {
        let eligible: Vec<String> = resolution
            .outcomes
            .iter()
            .filter_map(|o| match &o.branch {
                PageBranch::Normal {
                    ns: 0,
                    url,
                    extract: Some(_),
                    ..
                } => Some(url.clone()),
                _ => None,
            })
            .collect();
        if eligible.len() != 1 {
            return;
        }
        let url = eligible.into_iter().next().unwrap_or_default();
        let defs = self.config.infoboxes.clone();
        let host = Arc::clone(host);
        let reply_to = host.message_id();
        tokio::spawn(async move {
            match snapshot::capture_infobox(&url, &defs).await {
                Ok(Some(image)) => {
                    let mut msg = OutgoingMessage::image(image);
                    msg.reply_to = reply_to;
                    if let Err(e) = host.send(msg).await {
                        tracing::warn!(error = %e, "infobox follow-up send failed");
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "infobox capture failed"),
            }
        });
    }

    /// `wiki.search <keywords>` — keyword search with an interactive pick.
    pub async fn cmd_search(
        &self,
        host: &Arc<dyn ChatHost>,
        scope: &ChatScope,
        keywords: &str,
    ) -> Result<()> {
        if host.authority() < self.config.cmd_auth_search {
            host.send(OutgoingMessage::text(reply::MSG_DENIED)).await?;
            return Ok(());
        }
        let Some(api) = self.api_for(scope, true).await? else {
            return self.connect_status(host.as_ref(), scope).await;
        };

        let mut keywords = keywords.trim().to_string();
        if keywords.is_empty() {
            host.send(OutgoingMessage::text(reply::MSG_SEARCH_PROMPT))
                .await?;
            let answer = host
                .prompt(Duration::from_millis(self.config.prompt_timeout_ms))
                .await?;
            keywords = answer.unwrap_or_default().trim().to_string();
            if keywords.is_empty() || keywords == "." || keywords == "。" {
                return Ok(());
            }
        }
        self.search_flow(host, scope, &api, &keywords).await
    }

    /// The search leg shared by `wiki.search` and the missing-page fallback:
    /// list up to 3 candidates, prompt for a pick, then re-enter the wiki
    /// flow with details.
    async fn search_flow(
        &self,
        host: &Arc<dyn ChatHost>,
        scope: &ChatScope,
        api: &str,
        keyword: &str,
    ) -> Result<()> {
        let gateway = match self.gateway(api) {
            Ok(g) => g,
            Err(e) => {
                tracing::warn!(error = %e, "gateway construction failed");
                host.send(OutgoingMessage::text(reply::MSG_QUERY_FAILED))
                    .await?;
                return Ok(());
            }
        };
        let results = match gateway.opensearch(keyword, 3).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "search query failed");
                host.send(OutgoingMessage::text(reply::MSG_QUERY_FAILED))
                    .await?;
                return Ok(());
            }
        };

        host.send(OutgoingMessage::text(reply::render_search_results(
            keyword,
            &results.titles,
        )))
        .await?;
        if results.titles.is_empty() {
            return Ok(());
        }

        let answer = host
            .prompt(Duration::from_millis(self.config.prompt_timeout_ms))
            .await?;
        let Some(answer) = answer else {
            return Ok(());
        };
        let Ok(pick) = answer.trim().parse::<usize>() else {
            return Ok(());
        };
        if pick == 0 || pick > results.titles.len() {
            return Ok(());
        }
        let title = results.titles[pick - 1].clone();
        let Some(query) = TitleQuery::parse(&title) else {
            return Ok(());
        };
        let opts = WikiOptions {
            details: true,
            quiet: true,
            search: Some(false),
        };
        // Box the re-entry: the wiki flow and the search flow call each other.
        Box::pin(self.run_wiki_flow(host, scope, api, &title, vec![query], opts)).await
    }

    /// `wiki.connect [api|r|remove|none|null]`.
    pub async fn cmd_connect(
        &self,
        host: &Arc<dyn ChatHost>,
        scope: &ChatScope,
        api: Option<&str>,
    ) -> Result<()> {
        let arg = api.map(str::trim).filter(|s| !s.is_empty());
        let Some(arg) = arg else {
            return self.connect_status(host.as_ref(), scope).await;
        };
        if host.authority() < self.config.cmd_auth_connect {
            host.send(OutgoingMessage::text(reply::MSG_DENIED)).await?;
            return Ok(());
        }
        let here = Self::here(scope);
        if ["r", "remove", "none", "null"].contains(&arg) {
            return match self.bindings.clear(scope).await? {
                Some(old) => {
                    host.send(OutgoingMessage::text(format!(
                        "{here}已清除与 {old} 的连接"
                    )))
                    .await
                }
                None => {
                    host.send(OutgoingMessage::text(format!(
                        "{here}未连接到 MediaWiki 网站。"
                    )))
                    .await
                }
            };
        }
        if titles::is_valid_api(arg) {
            self.bindings.set(scope, arg).await?;
            self.connect_status(host.as_ref(), scope).await
        } else {
            host.send(OutgoingMessage::text(reply::MSG_INVALID_API))
                .await
        }
    }

    /// `wiki.parse <text>` — render wikitext and screenshot the preview.
    pub async fn cmd_parse(
        &self,
        host: &Arc<dyn ChatHost>,
        scope: &ChatScope,
        text: &str,
        title: Option<&str>,
        pure: bool,
    ) -> Result<()> {
        if host.authority() < self.config.cmd_auth_parse {
            host.send(OutgoingMessage::text(reply::MSG_DENIED)).await?;
            return Ok(());
        }
        let Some(api) = self.api_for(scope, true).await? else {
            return self.connect_status(host.as_ref(), scope).await;
        };
        let text = titles::resolve_brackets(text.trim());
        if text.is_empty() {
            return Ok(());
        }

        let gateway = match self.gateway(&api) {
            Ok(g) => g,
            Err(e) => {
                tracing::warn!(error = %e, "gateway construction failed");
                host.send(OutgoingMessage::text(reply::MSG_QUERY_FAILED))
                    .await?;
                return Ok(());
            }
        };
        let parsed = match gateway.parse_wikitext(&text, title).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "parse query failed");
                host.send(OutgoingMessage::text(reply::MSG_QUERY_FAILED))
                    .await?;
                return Ok(());
            }
        };
        let html = parsed.text.unwrap_or_default();

        let target = if pure {
            SnapshotTarget::RawHtml { html }
        } else {
            // Frame the fragment like the wiki would: site-relative URLs work
            // through the <base>, and the preview is visibly machine-made.
            let index = titles::index_php_url(&api, &[]);
            let base_dir = index.strip_suffix("index.php").unwrap_or(&index).to_string();
            let shell = format!(
                "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><base href=\"{base_dir}\"></head><body>{html}<p style=\"font-style: italic; color: #b00\">[注意] 这是由自动程序生成的预览图片，不代表 wiki 观点。</p></body></html>"
            );
            SnapshotTarget::RawHtml { html: shell }
        };

        match snapshot::capture(&target).await {
            Ok(Some(image)) => {
                let mut msg = OutgoingMessage::image(image);
                msg.reply_to = host.message_id();
                host.send(msg).await
            }
            Ok(None) => {
                host.send(OutgoingMessage::text("Shot failed: empty result"))
                    .await
            }
            Err(e) => host.send(OutgoingMessage::text(format!("Shot failed: {e}"))).await,
        }
    }

    /// `wiki.shot [title]` — full-page screenshot; the one place snapshot
    /// failures are surfaced explicitly.
    pub async fn cmd_shot(
        &self,
        host: &Arc<dyn ChatHost>,
        scope: &ChatScope,
        title: Option<&str>,
    ) -> Result<()> {
        let Some(api) = self.api_for(scope, true).await? else {
            return self.connect_status(host.as_ref(), scope).await;
        };
        let url = match title.map(str::trim).filter(|t| !t.is_empty()) {
            Some(t) => titles::index_php_url(&api, &[("title", t)]),
            None => titles::index_php_url(&api, &[]),
        };
        match snapshot::capture(&SnapshotTarget::FullPage { url }).await {
            Ok(Some(image)) => {
                let mut msg = OutgoingMessage::image(image);
                msg.reply_to = host.message_id();
                host.send(msg).await
            }
            Ok(None) => {
                host.send(OutgoingMessage::text("Shot failed: empty result"))
                    .await
            }
            Err(e) => host.send(OutgoingMessage::text(format!("Shot failed: {e}"))).await,
        }
    }

    /// Message middleware: pick up `[[wikilinks]]` and `{{templates}}` from
    /// ordinary chat messages.
    pub async fn on_message(
        &self,
        host: &Arc<dyn ChatHost>,
        scope: &ChatScope,
        content: &str,
    ) -> Result<()> {
        let content = titles::resolve_brackets(content);
        let links = titles::parse_wikilinks(&content);
        if !links.is_empty() {
            if let Some(api) = self.api_for(scope, true).await? {
                let queries = TitleQuery::parse_batch(&links);
                let opts = WikiOptions {
                    details: false,
                    quiet: true,
                    search: None,
                };
                self.run_wiki_flow(host, scope, &api, &content, queries, opts)
                    .await?;
            }
        }
        if let Some(template) = titles::parse_templates(&content).first() {
            let opts = WikiOptions {
                details: true,
                quiet: true,
                search: Some(false),
            };
            self.cmd_wiki(host, scope, template, opts).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_carry_the_stock_site_rule() {
        let cfg = PluginConfig::default();
        assert_eq!(cfg.cmd_auth_connect, 2);
        assert!(cfg
            .site_rules
            .iter()
            .any(|r| r.host == "huijiwiki.com" && r.headers.contains_key("user-agent")));
        assert!(!cfg.infoboxes.is_empty());
    }

    #[test]
    fn sanitize_drops_invalid_default_endpoints() {
        let cfg = PluginConfig {
            default_api: DefaultApi {
                group: Some("https://wiki.example/w/api.php".to_string()),
                private: Some("not a url".to_string()),
            },
            ..Default::default()
        }
        .sanitized();
        assert!(cfg.default_api.group.is_some());
        assert!(cfg.default_api.private.is_none());
    }

    #[test]
    fn config_deserializes_from_partial_toml() {
        let cfg: PluginConfig = toml::from_str(
            r#"
            cmd_auth_connect = 3

            [default_flags]
            search_non_exist = true

            [[site_rules]]
            host = "example.org"
            proxy = "socks5://127.0.0.1:1080"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.cmd_auth_connect, 3);
        assert!(cfg.default_flags.search_non_exist);
        assert_eq!(cfg.site_rules.len(), 1);
        assert_eq!(
            cfg.site_rules[0].proxy.as_deref(),
            Some("socks5://127.0.0.1:1080")
        );
        // Unspecified fields keep their defaults.
        assert_eq!(cfg.cmd_auth_wiki, 1);
        assert_eq!(cfg.prompt_timeout_ms, 30_000);
    }

    #[tokio::test]
    async fn memory_bindings_round_trip() {
        let store = MemoryBindings::default();
        let scope = ChatScope::Channel("7".to_string());
        assert!(store.get(&scope).await.unwrap().is_none());
        store
            .set(&scope, "https://wiki.example/api.php")
            .await
            .unwrap();
        assert_eq!(
            store.get(&scope).await.unwrap().as_deref(),
            Some("https://wiki.example/api.php")
        );
        let old = store.clear(&scope).await.unwrap();
        assert_eq!(old.as_deref(), Some("https://wiki.example/api.php"));
        assert!(store.get(&scope).await.unwrap().is_none());
    }
}
