//! eoka-backed page session. Implements the bridge transport, the input
//! driver and the execution target over one browser tab.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use eoka::cdp::{KeyEventType, MouseButton, MouseEventType};
use eoka::{Browser, Page};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;

use crate::annotate::PAGE_RUNTIME_JS;
use crate::bridge::{ChannelError, Envelope, Transport};
use crate::config::BrowserConfig;
use crate::executor::{InputDriver, KeyEventKind, MouseEventKind, NodeInfo, Point, Rect};
use crate::task::ExecutionTarget;
use crate::{Error, Result};

/// A launched browser with the tab tasks run against.
pub struct BrowserSession {
    browser: Mutex<Option<Browser>>,
    page: Page,
    target_id: String,
    attached: AtomicBool,
}

impl BrowserSession {
    /// Launch a browser and open a blank tab.
    pub async fn launch(config: &BrowserConfig) -> Result<Self> {
        let stealth = eoka::StealthConfig {
            headless: config.headless,
            proxy: config.proxy.clone(),
            user_agent: config.user_agent.clone(),
            viewport_width: config.viewport.as_ref().map(|v| v.width).unwrap_or(1280),
            viewport_height: config.viewport.as_ref().map(|v| v.height).unwrap_or(720),
            ..Default::default()
        };

        debug!(
            "Launching browser (headless: {}, proxy: {:?})",
            config.headless, config.proxy
        );
        let browser = Browser::launch_with_config(stealth).await?;
        let page = browser.new_page("about:blank").await?;
        let target_id = page.target_id().to_string();

        Ok(Self {
            browser: Mutex::new(Some(browser)),
            page,
            target_id,
            attached: AtomicBool::new(false),
        })
    }

    pub fn page(&self) -> &Page {
        &self.page
    }

    pub async fn goto(&self, url: &str) -> Result<()> {
        debug!("goto: {}", url);
        self.page.goto(url).await?;
        Ok(())
    }

    /// Close the browser. Later calls are no-ops.
    pub async fn close(&self) -> Result<()> {
        if let Some(browser) = self.browser.lock().await.take() {
            browser.close().await?;
        }
        Ok(())
    }

    /// Empty when the page runtime is not installed. eoka rejects a `null`
    /// evaluation result, so absence is an empty string.
    async fn dispatch(&self, payload: &str) -> Result<String> {
        let js = format!(
            "window.__autoflow ? window.__autoflow.dispatch({}) : ''",
            payload
        );
        Ok(self.page.evaluate(&js).await?)
    }

    async fn query<T: DeserializeOwned>(&self, selector: &str, body: &str) -> Result<T> {
        let js = format!(
            "(() => {{ const el = document.querySelector({}); if (!el) return ''; {} }})()",
            serde_json::to_string(selector)?,
            body
        );
        let raw: String = self.page.evaluate(&js).await?;
        decode_query(selector, &raw)
    }
}

/// CDP messages seen while a navigation replaces the page's execution context.
const CONTEXT_GONE: &[&str] = &[
    "Execution context was destroyed",
    "Cannot find context with specified id",
    "Cannot find default execution context",
    "Inspected target navigated or closed",
];

/// A lost execution context means nobody is listening yet; anything else is
/// a real failure.
fn channel_error(err: Error) -> ChannelError {
    let msg = err.to_string();
    if CONTEXT_GONE.iter().any(|sig| msg.contains(sig)) {
        debug!("bridge: page context not ready: {}", msg);
        ChannelError::NoReceiver
    } else {
        ChannelError::Failed(msg)
    }
}

fn decode_reply(raw: &str) -> std::result::Result<Option<Value>, ChannelError> {
    if raw.is_empty() {
        return Err(ChannelError::NoReceiver);
    }
    let reply: Reply =
        serde_json::from_str(raw).map_err(|e| ChannelError::Failed(e.to_string()))?;
    if let Some(err) = reply.error {
        return Err(ChannelError::Failed(err));
    }
    Ok(reply.replied.then_some(reply.value))
}

fn decode_query<T: DeserializeOwned>(selector: &str, raw: &str) -> Result<T> {
    if raw.is_empty() {
        return Err(Error::Resolution(format!("element {} not found", selector)));
    }
    Ok(serde_json::from_str(raw)?)
}

/// CDP `key` and `text` for `ch`.
fn key_event(ch: char) -> (String, Option<String>) {
    match ch {
        '\n' | '\r' => ("Enter".into(), Some("\r".into())),
        '\t' => ("Tab".into(), None),
        _ => (ch.to_string(), Some(ch.to_string())),
    }
}

#[derive(Deserialize)]
struct Reply {
    replied: bool,
    #[serde(default)]
    value: Value,
    #[serde(default)]
    error: Option<String>,
}

#[async_trait]
impl Transport for BrowserSession {
    async fn send(&self, envelope: &Envelope) -> std::result::Result<Option<Value>, ChannelError> {
        let payload = serde_json::to_string(envelope).map_err(|e| ChannelError::Failed(e.to_string()))?;

        let mut raw = self.dispatch(&payload).await.map_err(channel_error)?;
        if raw.is_empty() {
            debug!("bridge: page runtime missing, installing");
            self.page
                .execute(PAGE_RUNTIME_JS)
                .await
                .map_err(|e| channel_error(e.into()))?;
            raw = self.dispatch(&payload).await.map_err(channel_error)?;
        }
        decode_reply(&raw)
    }
}

#[derive(Deserialize)]
struct RawRect {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
}

#[derive(Deserialize)]
struct RawNode {
    node_name: String,
    attributes: Vec<String>,
}

#[async_trait]
impl InputDriver for BrowserSession {
    async fn scroll_into_view(&self, selector: &str) -> Result<()> {
        self.query::<bool>(
            selector,
            "el.scrollIntoView({block: 'center', inline: 'center'}); return 'true';",
        )
        .await?;
        Ok(())
    }

    async fn bounding_box(&self, selector: &str) -> Result<Rect> {
        let r: RawRect = self
            .query(
                selector,
                "const r = el.getBoundingClientRect(); return JSON.stringify({x: r.x, y: r.y, width: r.width, height: r.height});",
            )
            .await?;
        Ok(Rect {
            x: r.x,
            y: r.y,
            width: r.width,
            height: r.height,
        })
    }

    async fn describe(&self, selector: &str) -> Result<NodeInfo> {
        let n: RawNode = self
            .query(
                selector,
                "const attributes = []; for (const a of el.attributes) { attributes.push(a.name, a.value); } return JSON.stringify({node_name: el.nodeName, attributes});",
            )
            .await?;
        Ok(NodeInfo {
            node_name: n.node_name,
            attributes: n.attributes,
        })
    }

    async fn mouse(&self, kind: MouseEventKind, at: Point, click_count: u32) -> Result<()> {
        let event = match kind {
            MouseEventKind::Pressed => MouseEventType::MousePressed,
            MouseEventKind::Released => MouseEventType::MouseReleased,
        };
        self.page
            .session()
            .dispatch_mouse_event(
                event,
                at.x,
                at.y,
                Some(MouseButton::Left),
                Some(click_count as i32),
            )
            .await?;
        Ok(())
    }

    async fn key(&self, kind: KeyEventKind, ch: char) -> Result<()> {
        let (key, text) = key_event(ch);
        let (event, text) = match kind {
            KeyEventKind::Down => (KeyEventType::KeyDown, text),
            KeyEventKind::Up => (KeyEventType::KeyUp, None),
        };
        self.page
            .session()
            .dispatch_key_event(event, Some(&key), text.as_deref(), None)
            .await?;
        Ok(())
    }

    async fn blur_active(&self) -> Result<()> {
        self.page
            .execute("document.activeElement && document.activeElement.blur()")
            .await?;
        Ok(())
    }

    async fn draw_marker(&self, at: Point) -> Result<()> {
        let js = format!(
            r#"(() => {{
    const dot = document.createElement('div');
    dot.style.cssText = 'position:fixed;z-index:2147483647;pointer-events:none;width:10px;height:10px;'
        + 'margin:-5px 0 0 -5px;border-radius:50%;background:red;';
    dot.style.left = '{x}px';
    dot.style.top = '{y}px';
    document.documentElement.appendChild(dot);
    setTimeout(() => dot.remove(), 2000);
}})()"#,
            x = at.x,
            y = at.y
        );
        self.page.execute(&js).await?;
        Ok(())
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        Ok(self.page.screenshot().await?)
    }
}

#[async_trait]
impl ExecutionTarget for BrowserSession {
    fn id(&self) -> String {
        self.target_id.clone()
    }

    async fn acquire(&self) -> Result<()> {
        let browser = self.browser.lock().await;
        let browser = browser
            .as_ref()
            .ok_or_else(|| Error::Command("browser is closed".into()))?;
        browser.activate_tab(&self.target_id).await?;
        self.attached.store(true, Ordering::SeqCst);
        debug!("target {} attached", self.target_id);
        Ok(())
    }

    async fn release(&self) -> Result<()> {
        if self.attached.swap(false, Ordering::SeqCst) {
            debug!("target {} released", self.target_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_reply_means_runtime_missing() {
        assert_eq!(decode_reply(""), Err(ChannelError::NoReceiver));
    }

    #[test]
    fn test_reply_decoding() {
        assert_eq!(
            decode_reply(r#"{"replied":true,"value":"m-1"}"#),
            Ok(Some(Value::from("m-1")))
        );
        assert_eq!(
            decode_reply(r#"{"replied":true,"value":null}"#),
            Ok(Some(Value::Null))
        );
        assert_eq!(decode_reply(r#"{"replied":false}"#), Ok(None));
        assert_eq!(
            decode_reply(r#"{"replied":true,"error":"boom"}"#),
            Err(ChannelError::Failed("boom".into()))
        );
        assert!(matches!(decode_reply("not json"), Err(ChannelError::Failed(_))));
    }

    #[test]
    fn test_missing_element_is_resolution_error() {
        let err = decode_query::<bool>("[data-autoflow-marker=\"m-3\"]", "").unwrap_err();
        assert!(matches!(err, Error::Resolution(ref m) if m.contains("m-3")), "{err}");
        assert!(decode_query::<bool>("#x", "true").unwrap());
    }

    #[test]
    fn test_lost_context_is_not_ready() {
        for message in [
            "Execution context was destroyed.",
            "Cannot find context with specified id",
        ] {
            let err = Error::Browser(eoka::Error::Cdp {
                method: "Runtime.evaluate".into(),
                code: -32000,
                message: message.into(),
            });
            assert_eq!(channel_error(err), ChannelError::NoReceiver);
        }
    }

    #[test]
    fn test_other_browser_errors_fail() {
        let err = Error::Browser(eoka::Error::CdpSimple(
            "JavaScript error: Uncaught TypeError at 1:2".into(),
        ));
        assert!(matches!(channel_error(err), ChannelError::Failed(ref m) if m.contains("TypeError")));
    }

    #[test]
    fn test_key_events() {
        assert_eq!(key_event('a'), ("a".into(), Some("a".into())));
        assert_eq!(key_event('\n'), ("Enter".into(), Some("\r".into())));
        assert_eq!(key_event('\t'), ("Tab".into(), None));
    }
}
