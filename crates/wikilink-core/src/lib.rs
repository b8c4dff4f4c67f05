use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("no wiki bound for this chat")]
    NotBound,
    #[error("invalid api url: {0}")]
    InvalidApi(String),
    #[error("query failed: {0}")]
    Query(String),
    #[error("snapshot failed: {0}")]
    Snapshot(String),
    #[error("chat host failed: {0}")]
    Chat(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Which conversation a command ran in. Bindings and default endpoints are
/// keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChatScope {
    Channel(String),
    Private(String),
}

impl ChatScope {
    pub fn is_private(&self) -> bool {
        matches!(self, ChatScope::Private(_))
    }

    /// Stable storage key (`channel:<id>` / `private:<id>`).
    pub fn key(&self) -> String {
        match self {
            ChatScope::Channel(id) => format!("channel:{id}"),
            ChatScope::Private(id) => format!("private:{id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePart {
    Text(String),
    Image(Vec<u8>),
}

/// One outbound chat message. `reply_to` carries the id of the triggering
/// message when the host supports quoting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub reply_to: Option<String>,
    pub parts: Vec<MessagePart>,
}

impl OutgoingMessage {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            reply_to: None,
            parts: vec![MessagePart::Text(body.into())],
        }
    }

    pub fn image(bytes: Vec<u8>) -> Self {
        Self {
            reply_to: None,
            parts: vec![MessagePart::Image(bytes)],
        }
    }

    pub fn quoting(reply_to: Option<String>, body: impl Into<String>) -> Self {
        Self {
            reply_to,
            parts: vec![MessagePart::Text(body.into())],
        }
    }

    /// Concatenated text parts (images skipped).
    pub fn text_content(&self) -> String {
        let mut out = String::new();
        for p in &self.parts {
            if let MessagePart::Text(t) = p {
                out.push_str(t);
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.parts.iter().all(|p| match p {
            MessagePart::Text(t) => t.is_empty(),
            MessagePart::Image(b) => b.is_empty(),
        })
    }
}

/// What the plugin needs from the chat framework: send, prompt, and a little
/// metadata about the triggering message. Hosts adapt their own session
/// object to this.
#[async_trait::async_trait]
pub trait ChatHost: Send + Sync {
    async fn send(&self, message: OutgoingMessage) -> Result<()>;

    /// Wait for the next message from the same user. `None` on timeout.
    async fn prompt(&self, timeout: Duration) -> Result<Option<String>>;

    /// Id of the triggering message, if the host supports quoting.
    fn message_id(&self) -> Option<String> {
        None
    }

    /// Authority level of the sender; commands compare against configured
    /// minimums.
    fn authority(&self) -> u16 {
        1
    }
}

/// Per-chat endpoint association. One api.php URL per scope; storage is the
/// host's problem, not ours.
#[async_trait::async_trait]
pub trait BindingStore: Send + Sync {
    async fn get(&self, scope: &ChatScope) -> Result<Option<String>>;
    async fn set(&self, scope: &ChatScope, api: &str) -> Result<()>;
    /// Returns the previous endpoint, if any.
    async fn clear(&self, scope: &ChatScope) -> Result<Option<String>>;
}

fn host_matches(host: &str, pat: &str) -> bool {
    let host = host.trim().to_ascii_lowercase();
    let pat = pat.trim().to_ascii_lowercase();
    if pat.is_empty() {
        return false;
    }
    host == pat || host.ends_with(&format!(".{pat}"))
}

/// Per-site request override. Later entries in the configured list take
/// priority over earlier ones; see `wikilink_mw::gateway`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteRule {
    /// Substring matched against the full api.php URL (hostnames work, and
    /// so do path fragments for farms that share a domain).
    pub host: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub proxy: Option<String>,
}

impl SiteRule {
    pub fn matches(&self, api_url: &str) -> bool {
        !self.host.is_empty() && api_url.contains(&self.host)
    }
}

/// How to find and frame an infobox on a given wiki family. Evaluated in
/// declaration order; the first host match wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoboxDefinition {
    /// Host suffix (`fandom.com` matches `minecraft.fandom.com`).
    pub host: String,
    /// CSS selector; comma-joined alternatives are tried in document order.
    pub selector: String,
    #[serde(default)]
    pub injected_css: Option<String>,
    /// Optional `useskin=` value applied to the rendered page URL.
    #[serde(default)]
    pub skin: Option<String>,
}

impl InfoboxDefinition {
    pub fn matches(&self, url: &url::Url) -> bool {
        url.host_str()
            .map(|h| host_matches(h, &self.host))
            .unwrap_or(false)
    }
}

/// The stock definition list, covering the wiki families the original
/// deployment cared about. Embedders extend or replace it via config.
pub fn default_infobox_definitions() -> Vec<InfoboxDefinition> {
    vec![
        InfoboxDefinition {
            host: "minecraft.fandom.com".to_string(),
            selector: ".notaninfobox,.portable-infobox,.infobox,.tpl-infobox,.infoboxtable,.infotemplatebox,.skin-infobox,.arcaeabox".to_string(),
            injected_css: None,
            skin: None,
        },
        InfoboxDefinition {
            host: "fandom.com".to_string(),
            selector: "aside.portable-infobox".to_string(),
            injected_css: None,
            skin: None,
        },
        InfoboxDefinition {
            host: "huijiwiki.com".to_string(),
            selector: "table.infobox".to_string(),
            injected_css: None,
            skin: None,
        },
    ]
}

/// Default behavior toggles for the wiki command family.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WikiFlags {
    /// Fall back to keyword search when a linked page does not exist.
    #[serde(default)]
    pub search_non_exist: bool,
    /// Capture an infobox screenshot alongside details.
    #[serde(default)]
    pub infobox_details: bool,
    /// Treat every `wiki` invocation as if `--details` was passed.
    #[serde(default)]
    pub show_details_by_default: bool,
}
