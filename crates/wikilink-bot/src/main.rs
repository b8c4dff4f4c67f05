use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use wikilink_bot::{MemoryBindings, PluginConfig, WikiOptions, WikiPlugin};
use wikilink_core::{BindingStore, ChatHost, ChatScope, MessagePart, OutgoingMessage};
use wikilink_mw::titles;

#[derive(Parser, Debug)]
#[command(name = "wikilink")]
#[command(about = "MediaWiki chat plugin, driven locally", long_about = None)]
struct Cli {
    /// api.php endpoint bound for this run.
    #[arg(long, env = "WIKILINK_API", global = true)]
    api: Option<String>,
    /// TOML config file (PluginConfig shape).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve a title the way the `wiki` command would.
    Query {
        input: String,
        /// Fetch the page intro as well.
        #[arg(long)]
        details: bool,
        /// Fall back to keyword search when the page does not exist.
        #[arg(long)]
        search: bool,
        /// Treat the input as a chat message ([[wikilinks]] middleware).
        #[arg(long)]
        message: bool,
    },
    /// Keyword search with an interactive pick.
    Search { keywords: Vec<String> },
    /// Render wikitext and screenshot the preview.
    Parse {
        text: String,
        /// Page title to render under.
        #[arg(long)]
        title: Option<String>,
        /// Capture the raw fragment without the preview frame.
        #[arg(long)]
        pure: bool,
    },
    /// Full-page screenshot of a page (or the site index).
    Shot { title: Option<String> },
    /// Interactive chat loop on stdin.
    Repl,
}

/// Local stand-in for a chat framework: text goes to stdout, images to temp
/// files, prompts read the next stdin line.
struct StdioHost {
    image_dir: PathBuf,
    image_seq: AtomicU64,
}

impl StdioHost {
    fn new() -> Self {
        Self {
            image_dir: std::env::temp_dir(),
            image_seq: AtomicU64::new(0),
        }
    }
}

#[async_trait::async_trait]
impl ChatHost for StdioHost {
    async fn send(&self, message: OutgoingMessage) -> wikilink_core::Result<()> {
        for part in message.parts {
            match part {
                MessagePart::Text(t) => println!("{t}"),
                MessagePart::Image(bytes) => {
                    let n = self.image_seq.fetch_add(1, Ordering::Relaxed);
                    let path = self
                        .image_dir
                        .join(format!("wikilink-{}-{n}.jpg", std::process::id()));
                    std::fs::write(&path, &bytes)
                        .map_err(|e| wikilink_core::Error::Chat(e.to_string()))?;
                    println!("[image saved to {}]", path.display());
                }
            }
        }
        Ok(())
    }

    async fn prompt(&self, timeout: Duration) -> wikilink_core::Result<Option<String>> {
        let read = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).ok().map(|_| line)
        });
        match tokio::time::timeout(timeout, read).await {
            Ok(Ok(Some(line))) => Ok(Some(line.trim().to_string())),
            _ => Ok(None),
        }
    }

    fn authority(&self) -> u16 {
        // Local operator; every command is allowed.
        u16::MAX
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();
}

async fn dispatch_repl_line(
    plugin: &WikiPlugin,
    host: &Arc<dyn ChatHost>,
    scope: &ChatScope,
    line: &str,
) -> wikilink_core::Result<()> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(());
    }
    if let Some(rest) = line.strip_prefix("wiki.connect") {
        let arg = rest.trim();
        return plugin
            .cmd_connect(host, scope, (!arg.is_empty()).then_some(arg))
            .await;
    }
    if let Some(rest) = line.strip_prefix("wiki.search") {
        return plugin.cmd_search(host, scope, rest.trim()).await;
    }
    if let Some(rest) = line.strip_prefix("wiki.parse") {
        return plugin.cmd_parse(host, scope, rest.trim(), None, false).await;
    }
    if let Some(rest) = line.strip_prefix("wiki.shot") {
        let arg = rest.trim();
        return plugin
            .cmd_shot(host, scope, (!arg.is_empty()).then_some(arg))
            .await;
    }
    if let Some(rest) = line.strip_prefix("wiki ") {
        return plugin
            .cmd_wiki(host, scope, rest.trim(), WikiOptions::default())
            .await;
    }
    if line == "wiki" {
        return plugin.cmd_wiki(host, scope, "", WikiOptions::default()).await;
    }
    plugin.on_message(host, scope, line).await
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let config: PluginConfig = match &cli.config {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {}", path.display()))?;
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?
        }
        None => PluginConfig::default(),
    };

    let bindings = Arc::new(MemoryBindings::default());
    let scope = ChatScope::Private("local".to_string());
    if let Some(api) = &cli.api {
        if !titles::is_valid_api(api) {
            bail!("--api is not a valid api.php url: {api}");
        }
        bindings.set(&scope, api).await?;
    }

    let plugin = WikiPlugin::new(config, bindings);
    let host: Arc<dyn ChatHost> = Arc::new(StdioHost::new());

    match cli.command {
        Commands::Query {
            input,
            details,
            search,
            message,
        } => {
            if message {
                plugin.on_message(&host, &scope, &input).await?;
            } else {
                let opts = WikiOptions {
                    details,
                    quiet: false,
                    search: search.then_some(true),
                };
                plugin.cmd_wiki(&host, &scope, &input, opts).await?;
            }
        }
        Commands::Search { keywords } => {
            plugin
                .cmd_search(&host, &scope, &keywords.join(" "))
                .await?;
        }
        Commands::Parse { text, title, pure } => {
            plugin
                .cmd_parse(&host, &scope, &text, title.as_deref(), pure)
                .await?;
        }
        Commands::Shot { title } => {
            plugin.cmd_shot(&host, &scope, title.as_deref()).await?;
        }
        Commands::Repl => {
            let stdin = std::io::stdin();
            let mut line = String::new();
            loop {
                line.clear();
                if stdin.read_line(&mut line)? == 0 {
                    break;
                }
                if let Err(e) = dispatch_repl_line(&plugin, &host, &scope, &line).await {
                    tracing::warn!(error = %e, "command failed");
                }
            }
        }
    }
    Ok(())
}
