//! Infobox and page screenshots via a Node/Playwright shellout.
//!
//! The child is a small embedded script with JSON-only stdout; args go over
//! stdin to avoid argv quoting issues. A hard wall-clock timeout wraps the
//! whole child so a wedged browser can never hang a chat handler. Capture is
//! always an enhancement: callers outside the dedicated screenshot command
//! swallow every error here.

use base64::Engine;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use url::Url;
use wikilink_core::{Error, InfoboxDefinition, Result};

/// Navigation cap. Past this we only proceed if the content shell rendered.
pub const NAV_TIMEOUT_MS: u64 = 10_000;
/// Extra settle budget after `load`, racing network-idle.
pub const SETTLE_GRACE_MS: u64 = 5_000;

const MAX_IMAGE_BYTES: usize = 8_000_000;

#[derive(Debug, Clone)]
pub enum SnapshotTarget {
    /// Crop to the first element matching `selector` (comma-joined
    /// alternatives allowed).
    Element {
        url: String,
        selector: String,
        injected_css: Option<String>,
    },
    FullPage { url: String },
    /// Render raw HTML (wikitext previews) and capture the whole page.
    RawHtml { html: String },
}

fn env_truthy(k: &str) -> bool {
    matches!(
        std::env::var(k)
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase()
            .as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Pick the infobox definition for a page URL and build the URL actually
/// rendered (skin override applied). `None` when no definition matches.
pub fn infobox_target(
    page_url: &str,
    defs: &[InfoboxDefinition],
) -> Result<Option<(String, InfoboxDefinition)>> {
    let url = Url::parse(page_url).map_err(|e| Error::Snapshot(e.to_string()))?;
    let Some(def) = defs.iter().find(|d| d.matches(&url)) else {
        return Ok(None);
    };
    let mut target = url;
    if let Some(skin) = &def.skin {
        target.query_pairs_mut().append_pair("useskin", skin);
    }
    Ok(Some((target.to_string(), def.clone())))
}

/// Capture the infobox of a rendered page. `Ok(None)` when no definition
/// matches or the page has no infobox; both are normal outcomes.
pub async fn capture_infobox(
    page_url: &str,
    defs: &[InfoboxDefinition],
) -> Result<Option<Vec<u8>>> {
    let Some((url, def)) = infobox_target(page_url, defs)? else {
        return Ok(None);
    };
    capture(&SnapshotTarget::Element {
        url,
        selector: def.selector,
        injected_css: def.injected_css,
    })
    .await
}

fn node_path_candidates() -> Vec<String> {
    let mut out = Vec::new();
    if let Some(home) = std::env::var_os("HOME").map(std::path::PathBuf::from) {
        out.push(
            home.join(".npm-global")
                .join("lib")
                .join("node_modules")
                .to_string_lossy()
                .to_string(),
        );
    }
    out.push("/opt/homebrew/lib/node_modules".to_string());
    out.push("/usr/local/lib/node_modules".to_string());
    out.push("/usr/lib/node_modules".to_string());
    out
}

/// Make a global Playwright install discoverable without requiring users to
/// manage NODE_PATH themselves. Explicit override: WIKILINK_NODE_PATH.
fn detect_node_path() -> Option<String> {
    fn has_playwright(node_path: &str) -> bool {
        node_path
            .split(':')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .any(|p| std::path::Path::new(p).join("playwright").is_dir())
    }

    if let Ok(v) = std::env::var("WIKILINK_NODE_PATH") {
        let v = v.trim();
        if !v.is_empty() {
            return Some(v.to_string());
        }
    }

    let existing = std::env::var("NODE_PATH").unwrap_or_default();
    if has_playwright(&existing) {
        return None;
    }

    let npm_root = std::process::Command::new("npm")
        .args(["root", "-g"])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
        .filter(|s| !s.is_empty() && std::path::Path::new(s).join("playwright").is_dir());

    let found = npm_root.or_else(|| {
        node_path_candidates()
            .into_iter()
            .find(|root| std::path::Path::new(root).join("playwright").is_dir())
    })?;

    if existing.trim().is_empty() {
        Some(found)
    } else {
        Some(format!("{existing}:{found}"))
    }
}

const JS: &str = r#"
const fs = require('fs');

function ok(obj) { process.stdout.write(JSON.stringify(obj)); }
function bad(code, message) { ok({ ok: false, error: { code, message } }); }

async function main() {
  let arg = '';
  try { arg = fs.readFileSync(0, 'utf8'); } catch (_) {}
  let req;
  try { req = JSON.parse(arg); } catch (e) { return bad('invalid_params', 'bad JSON args'); }

  let pw;
  try { pw = require('playwright'); } catch (e) {
    return bad('not_configured', 'Playwright is not installed for Node.js (require("playwright") failed). Install it with `npm i -g playwright` and `npx playwright install chromium`.');
  }

  const mode = String(req.mode || 'page');
  const url = String(req.url || '').trim();
  const html = String(req.html || '');
  const selector = String(req.selector || '').trim();
  const css = String(req.injected_css || '');
  const navTimeoutMs = Number(req.nav_timeout_ms || 10000);
  const settleMs = Number(req.settle_ms || 5000);

  if (mode !== 'html' && !url) return bad('invalid_params', 'url must be non-empty');
  if (mode === 'element' && !selector) return bad('invalid_params', 'selector must be non-empty');

  let browser;
  let cssInjectFailed = false;
  try {
    browser = await pw.chromium.launch({ headless: true });
    const context = await browser.newContext({
      serviceWorkers: 'block',
      viewport: { width: 640, height: 480 },
      deviceScaleFactor: 1.5,
    });
    const page = await context.newPage();

    if (mode === 'html') {
      await page.setContent(html, { waitUntil: 'load', timeout: navTimeoutMs });
    } else {
      let navTimedOut = false;
      try {
        await page.goto(url, { waitUntil: 'load', timeout: navTimeoutMs });
      } catch (e) {
        navTimedOut = true;
      }
      if (navTimedOut) {
        // Slow skin tolerance: proceed only if the content shell rendered.
        const container = await page.$('#content, #mw-content-text, .mw-parser-output');
        if (!container) return ok({ ok: true, image: null, reason: 'nav_timeout' });
      } else {
        try { await page.waitForLoadState('networkidle', { timeout: settleMs }); } catch (_) {}
      }
    }

    if (css) {
      try { await page.addStyleTag({ content: css }); } catch (_) { cssInjectFailed = true; }
    }

    let buf;
    if (mode === 'element') {
      const el = await page.$(selector);
      if (!el) return ok({ ok: true, image: null, reason: 'selector_missing' });
      buf = await el.screenshot({ type: 'jpeg', quality: 80 });
    } else {
      buf = await page.screenshot({ fullPage: true, type: 'jpeg', quality: 80 });
    }
    ok({ ok: true, image: buf.toString('base64'), css_inject_failed: cssInjectFailed });
  } catch (e) {
    bad('capture_failed', String(e && e.message ? e.message : e));
  } finally {
    try { if (browser) await browser.close(); } catch (_) {}
  }
}

main().catch((e) => bad('capture_failed', String(e && e.message ? e.message : e)));
"#;

/// Run one capture. `Ok(None)` means "nothing to show" (selector missing,
/// navigation never settled); `Err` means the machinery itself failed.
pub async fn capture(target: &SnapshotTarget) -> Result<Option<Vec<u8>>> {
    // Deterministic escape hatch for tests and browserless environments.
    if env_truthy("WIKILINK_SNAPSHOT_DISABLE") {
        return Err(Error::NotConfigured(
            "snapshot backend disabled (WIKILINK_SNAPSHOT_DISABLE)".to_string(),
        ));
    }

    let args_json = match target {
        SnapshotTarget::Element {
            url,
            selector,
            injected_css,
        } => serde_json::json!({
            "mode": "element",
            "url": url,
            "selector": selector,
            "injected_css": injected_css.clone().unwrap_or_default(),
            "nav_timeout_ms": NAV_TIMEOUT_MS,
            "settle_ms": SETTLE_GRACE_MS,
        }),
        SnapshotTarget::FullPage { url } => serde_json::json!({
            "mode": "page",
            "url": url,
            "nav_timeout_ms": NAV_TIMEOUT_MS,
            "settle_ms": SETTLE_GRACE_MS,
        }),
        SnapshotTarget::RawHtml { html } => serde_json::json!({
            "mode": "html",
            "html": html,
            "nav_timeout_ms": NAV_TIMEOUT_MS,
            "settle_ms": SETTLE_GRACE_MS,
        }),
    }
    .to_string();

    // Hard wall-clock cap for the whole Node+Playwright operation; enforced
    // around `child.wait()`, not checked after the fact.
    let hard_timeout_ms = std::env::var("WIKILINK_SNAPSHOT_HARD_TIMEOUT_MS")
        .ok()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(NAV_TIMEOUT_MS + SETTLE_GRACE_MS + 15_000);

    let node_bin = std::env::var("WIKILINK_NODE").unwrap_or_else(|_| "node".to_string());
    let mut cmd = tokio::process::Command::new(node_bin);
    if let Some(node_path) = detect_node_path() {
        cmd.env("NODE_PATH", node_path);
    }
    let mut child = cmd
        .arg("-e")
        .arg(JS)
        .kill_on_drop(true)
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| {
            Error::NotConfigured(format!(
                "snapshot requires Node.js (`node`) and the Playwright npm package: {e}"
            ))
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(args_json.as_bytes()).await;
        let _ = stdin.shutdown().await;
    }

    let mut stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Snapshot("missing stdout pipe".to_string()))?;
    let mut stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Snapshot("missing stderr pipe".to_string()))?;

    let stdout_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = tokio::io::AsyncReadExt::read_to_end(&mut stdout, &mut buf).await;
        buf
    });
    let stderr_task = tokio::spawn(async move {
        let mut buf = Vec::new();
        let _ = tokio::io::AsyncReadExt::read_to_end(&mut stderr, &mut buf).await;
        buf
    });

    match tokio::time::timeout(Duration::from_millis(hard_timeout_ms), child.wait()).await {
        Ok(status) => {
            // Non-zero exits still produce JSON on stdout; fall through.
            status.map_err(|e| Error::Snapshot(e.to_string()))?;
        }
        Err(_) => {
            let _ = child.kill().await;
            let _ = child.wait().await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(Error::Snapshot(format!(
                "hard timeout after {hard_timeout_ms}ms"
            )));
        }
    }

    let out_stdout = stdout_task.await.unwrap_or_default();
    let out_stderr = stderr_task.await.unwrap_or_default();

    let stdout_s = String::from_utf8_lossy(&out_stdout).trim().to_string();
    let v: serde_json::Value = serde_json::from_str(&stdout_s).map_err(|e| {
        let stderr_s = String::from_utf8_lossy(&out_stderr).trim().to_string();
        if stderr_s.is_empty() {
            Error::Snapshot(format!("child returned invalid JSON: {e}"))
        } else {
            Error::Snapshot(format!("child returned invalid JSON: {e}. stderr: {stderr_s}"))
        }
    })?;

    if v.get("ok").and_then(|x| x.as_bool()) != Some(true) {
        let code = v
            .pointer("/error/code")
            .and_then(|x| x.as_str())
            .unwrap_or("capture_failed");
        let message = v
            .pointer("/error/message")
            .and_then(|x| x.as_str())
            .unwrap_or("snapshot failed")
            .to_string();
        return Err(match code {
            "not_configured" => Error::NotConfigured(message),
            _ => Error::Snapshot(message),
        });
    }

    if v.get("css_inject_failed").and_then(|x| x.as_bool()) == Some(true) {
        tracing::warn!("snapshot css injection failed; capturing without it");
    }

    let Some(image_b64) = v.get("image").and_then(|x| x.as_str()) else {
        let reason = v.get("reason").and_then(|x| x.as_str()).unwrap_or("empty");
        tracing::debug!(reason, "snapshot produced no image");
        return Ok(None);
    };

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(image_b64)
        .map_err(|e| Error::Snapshot(format!("bad image encoding: {e}")))?;
    if bytes.is_empty() {
        return Ok(None);
    }
    if bytes.len() > MAX_IMAGE_BYTES {
        return Err(Error::Snapshot(format!(
            "image too large ({} bytes)",
            bytes.len()
        )));
    }
    Ok(Some(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wikilink_core::default_infobox_definitions;

    struct EnvGuard {
        k: &'static str,
        prev: Option<String>,
    }

    impl EnvGuard {
        fn set(k: &'static str, v: &str) -> Self {
            let prev = std::env::var(k).ok();
            std::env::set_var(k, v);
            Self { k, prev }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(v) = self.prev.take() {
                std::env::set_var(self.k, v);
            } else {
                std::env::remove_var(self.k);
            }
        }
    }

    #[test]
    fn infobox_target_picks_first_matching_definition() {
        let defs = default_infobox_definitions();
        let hit = infobox_target("https://minecraft.fandom.com/wiki/Creeper", &defs)
            .unwrap()
            .unwrap();
        assert_eq!(hit.1.host, "minecraft.fandom.com");

        let none = infobox_target("https://en.wikipedia.org/wiki/Creeper", &defs).unwrap();
        assert!(none.is_none());
    }

    #[test]
    fn infobox_target_applies_skin_override() {
        let defs = vec![InfoboxDefinition {
            host: "huijiwiki.com".to_string(),
            selector: "table.infobox".to_string(),
            injected_css: None,
            skin: Some("vector".to_string()),
        }];
        let (url, _) = infobox_target("https://wf.huijiwiki.com/wiki/Foo", &defs)
            .unwrap()
            .unwrap();
        assert!(url.contains("useskin=vector"));
    }

    #[test]
    fn infobox_target_rejects_garbage_urls() {
        let defs = default_infobox_definitions();
        assert!(matches!(
            infobox_target("not a url", &defs),
            Err(Error::Snapshot(_))
        ));
    }

    #[tokio::test]
    async fn disabled_backend_is_deterministic() {
        let _g = EnvGuard::set("WIKILINK_SNAPSHOT_DISABLE", "1");
        let err = capture(&SnapshotTarget::FullPage {
            url: "https://wiki.example/index.php?title=X".to_string(),
        })
        .await
        .unwrap_err();
        assert!(matches!(err, Error::NotConfigured(_)), "got {err:?}");
    }
}
