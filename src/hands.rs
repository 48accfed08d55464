use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::driver::{DriverFactory, LaunchParams, UiDriver};
use crate::error::{AgentError, Result};
use crate::snapshot::RawSnapshot;
use crate::types::{Action, ActionKind};

const DEFAULT_DEBUG_URL: &str = "http://127.0.0.1:9222";

/// JavaScript injected into the page to produce the raw snapshot.
/// NON-DESTRUCTIVE apart from tagging interactive elements with `data-eid`.
///
/// The script:
///   1. Skips script, style, noscript, svg elements and anything invisible.
///   2. Walks the visible DOM tree (max depth 25).
///   3. Assigns sequential references e0, e1, ... to interactive elements and
///      filter pills via `data-eid`, reporting role, accessible name and value.
///      Pills also report the label of the filter section that holds them.
///   4. Collects short leaf text (counters, banners) as salient text.
const SNAPSHOT_JS: &str = r#"
(() => {
  const SKIP = new Set(['SCRIPT','STYLE','NOSCRIPT','SVG','LINK']);
  const PILL = /(^|[\s_-])(pill|tag|chip|token)([\s_-]|$)/i;
  let id = 0;
  const elements = [];
  const texts = [];

  function isVisible(el) {
    if (el.offsetParent === null && el.tagName !== 'BODY' && el.tagName !== 'HTML') return false;
    const s = getComputedStyle(el);
    return s.display !== 'none' && s.visibility !== 'hidden' && s.opacity !== '0';
  }

  function roleOf(el) {
    const aria = el.getAttribute('role');
    const cls = typeof el.className === 'string' ? el.className : '';
    if (el.hasAttribute('data-pill') || PILL.test(cls)) return 'pill';
    if (aria) return aria.toLowerCase();
    const tag = el.tagName.toLowerCase();
    if (tag === 'a') return 'link';
    if (tag === 'button') return 'button';
    if (tag === 'select') return 'combobox';
    if (tag === 'textarea') return 'textbox';
    if (tag === 'input') {
      const t = (el.type || 'text').toLowerCase();
      if (t === 'checkbox' || t === 'radio') return t;
      if (t === 'submit' || t === 'button') return 'button';
      return 'textbox';
    }
    return null;
  }

  function nameOf(el) {
    const labelled = el.getAttribute('aria-label') || el.getAttribute('placeholder') || el.getAttribute('title');
    if (labelled) return labelled;
    if (el.id) {
      const label = document.querySelector('label[for="' + el.id + '"]');
      if (label) return label.textContent;
    }
    if (el.tagName === 'INPUT' && el.name) return el.name;
    return el.textContent || '';
  }

  function sectionOf(el) {
    const box = el.parentElement && el.parentElement.closest(
      '[data-filter-section],[role="group"],[role="region"],fieldset,section');
    if (!box) return null;
    const named = box.getAttribute('data-filter-section') || box.getAttribute('aria-label');
    if (named) return named.trim().slice(0, 120);
    const head = box.querySelector('legend,[role="heading"],h1,h2,h3,h4,h5,h6,button');
    return head ? (head.textContent || '').trim().slice(0, 120) : null;
  }

  function walk(node, depth) {
    if (depth > 25) return;
    for (const child of node.children) {
      if (SKIP.has(child.tagName)) continue;
      if (!isVisible(child)) continue;
      const role = roleOf(child);
      if (role) {
        const ref = 'e' + (id++);
        child.setAttribute('data-eid', ref);
        let value = null;
        if (child.tagName === 'INPUT' || child.tagName === 'TEXTAREA') {
          value = child.type === 'password' ? (child.value ? '********' : '') : child.value;
        }
        const section = role === 'pill' ? sectionOf(child) : null;
        elements.push({ ref, role, name: nameOf(child).trim().slice(0, 120), value, section });
        if (role === 'pill') continue;
      } else if (child.children.length === 0) {
        const text = (child.textContent || '').trim();
        if (text.length > 1 && text.length < 200) texts.push(text);
      }
      walk(child, depth + 1);
    }
  }

  walk(document.body, 0);
  return JSON.stringify({ url: window.location.href, title: document.title, elements, texts });
})()
"#;

/// Live headless Chrome page. Closing drops the browser, which ends a process
/// this driver launched; an attached browser is left running.
pub struct ChromeDriver {
    _browser: Browser,
    tab: Arc<Tab>,
}

impl ChromeDriver {
    /// Run blocking CDP calls off the async runtime.
    async fn on_tab<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(Arc<Tab>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || f(tab))
            .await
            .map_err(|e| AgentError::Driver(format!("browser task panicked: {e}")))?
    }
}

fn driver_err(e: impl std::fmt::Display) -> AgentError {
    AgentError::Driver(e.to_string())
}

fn selector_for(action: &Action) -> Result<String> {
    let reference = action.reference.as_deref().ok_or_else(|| {
        AgentError::TargetNotFound(format!("{action} was not resolved to an element"))
    })?;
    Ok(format!("[data-eid=\"{reference}\"]"))
}

#[async_trait]
impl UiDriver for ChromeDriver {
    async fn open(&mut self, url: &str) -> Result<()> {
        let url = url.to_string();
        self.on_tab(move |tab| {
            tab.navigate_to(&url).map_err(driver_err)?;
            tab.wait_until_navigated().map_err(driver_err)?;
            Ok(())
        })
        .await
    }

    async fn snapshot(&mut self) -> Result<RawSnapshot> {
        self.on_tab(|tab| {
            let result = tab.evaluate(SNAPSHOT_JS, false).map_err(driver_err)?;
            let raw = result
                .value
                .and_then(|v| v.as_str().map(String::from))
                .ok_or_else(|| AgentError::NotReady("snapshot script returned nothing".into()))?;
            serde_json::from_str(&raw).map_err(|e| AgentError::NotReady(format!("bad snapshot: {e}")))
        })
        .await
    }

    async fn act(&mut self, action: &Action) -> Result<()> {
        let action = action.clone();
        if action.kind == ActionKind::Wait {
            let ms = action.value.as_deref().and_then(|v| v.parse().ok()).unwrap_or(1_000);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return Ok(());
        }
        debug!(%action, "chrome act");
        self.on_tab(move |tab| {
            match action.kind {
                ActionKind::Navigate => {
                    let url = action.value.as_deref().unwrap_or("about:blank");
                    tab.navigate_to(url).map_err(driver_err)?;
                    tab.wait_until_navigated().map_err(driver_err)?;
                }
                ActionKind::Click => {
                    let selector = selector_for(&action)?;
                    let el = tab
                        .find_element(&selector)
                        .map_err(|_| AgentError::StaleReference(selector.clone()))?;
                    el.click().map_err(driver_err)?;
                }
                ActionKind::Fill => {
                    let selector = selector_for(&action)?;
                    let el = tab
                        .find_element(&selector)
                        .map_err(|_| AgentError::StaleReference(selector.clone()))?;
                    el.click().map_err(driver_err)?;
                    let js_sel = selector.replace('\'', "\\'");
                    tab.evaluate(
                        &format!("document.querySelector('{js_sel}').value = ''"),
                        false,
                    )
                    .map_err(driver_err)?;
                    tab.type_str(action.value.as_deref().unwrap_or(""))
                        .map_err(driver_err)?;
                }
                ActionKind::PressKey => {
                    tab.press_key(action.value.as_deref().unwrap_or("Enter"))
                        .map_err(driver_err)?;
                }
                ActionKind::Scroll => match action.reference {
                    Some(_) => {
                        let selector = selector_for(&action)?;
                        let el = tab
                            .find_element(&selector)
                            .map_err(|_| AgentError::StaleReference(selector.clone()))?;
                        el.scroll_into_view().map_err(driver_err)?;
                    }
                    None => {
                        tab.evaluate("window.scrollBy(0, window.innerHeight * 0.8)", false)
                            .map_err(driver_err)?;
                    }
                },
                ActionKind::Wait => {}
            }
            Ok(())
        })
        .await
    }

    async fn screenshot(&mut self) -> Result<Vec<u8>> {
        self.on_tab(|tab| {
            tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
                .map_err(driver_err)
        })
        .await
    }

    async fn close(&mut self) -> Result<()> {
        if let Err(e) = self.on_tab(|tab| tab.close(true).map_err(driver_err)).await {
            warn!("Tab close failed: {}", e);
        }
        Ok(())
    }
}

/// Launches Chrome with a persistent profile, or attaches over the DevTools port.
#[derive(Debug, Default)]
pub struct ChromeFactory;

#[async_trait]
impl DriverFactory for ChromeFactory {
    async fn launch(&self, params: &LaunchParams) -> Result<Box<dyn UiDriver>> {
        let params = params.clone();
        let driver = tokio::task::spawn_blocking(move || launch_blocking(&params))
            .await
            .map_err(|e| AgentError::Driver(format!("browser launch panicked: {e}")))??;
        Ok(Box::new(driver))
    }
}

fn launch_blocking(params: &LaunchParams) -> Result<ChromeDriver> {
    if params.reuse_existing || params.attach_url.is_some() {
        let url = params
            .attach_url
            .clone()
            .unwrap_or_else(|| DEFAULT_DEBUG_URL.to_string());
        info!(url = %url, "attaching to running Chrome");
        if let Ok(browser) = Browser::connect(url.clone()) {
            let existing = browser
                .get_tabs()
                .lock()
                .ok()
                .and_then(|tabs| tabs.first().cloned());
            let tab = match existing {
                Some(tab) => tab,
                None => browser.new_tab().map_err(driver_err)?,
            };
            return Ok(ChromeDriver {
                _browser: browser,
                tab,
            });
        }
        if params.attach_url.is_some() {
            return Err(AgentError::Driver(format!("could not attach to {url}")));
        }
        warn!("No running Chrome to attach to, launching a new one");
    }

    if let Some(dir) = &params.profile_dir {
        std::fs::create_dir_all(dir).map_err(driver_err)?;
    }

    let options = LaunchOptions {
        headless: params.headless,
        path: find_chrome(),
        user_data_dir: params.profile_dir.clone(),
        args: vec![
            std::ffi::OsStr::new("--no-first-run"),
            std::ffi::OsStr::new("--no-default-browser-check"),
            std::ffi::OsStr::new("--no-sandbox"),
            std::ffi::OsStr::new("--disable-blink-features=AutomationControlled"),
            std::ffi::OsStr::new("--disable-infobars"),
            std::ffi::OsStr::new("--password-store=basic"),
        ],
        idle_browser_timeout: Duration::from_secs(15 * 60),
        ..Default::default()
    };

    info!(generation = params.generation, headless = params.headless, "launching Chrome");
    let browser = Browser::new(options).map_err(|e| {
        let msg = e.to_string();
        if msg.contains("SingletonLock") || msg.to_lowercase().contains("already running") {
            AgentError::AlreadyRunning(msg)
        } else {
            AgentError::Driver(format!("browser launch failed: {msg}"))
        }
    })?;
    let tab = browser.new_tab().map_err(driver_err)?;
    tab.navigate_to("about:blank").map_err(driver_err)?;
    Ok(ChromeDriver {
        _browser: browser,
        tab,
    })
}

/// Chrome executable from `CHROME_PATH` or a well-known install location.
/// `None` lets headless_chrome search `PATH` itself.
fn find_chrome() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("CHROME_PATH") {
        return Some(PathBuf::from(path));
    }
    let candidates = [
        "/usr/bin/google-chrome",
        "/usr/bin/chromium",
        "/usr/bin/chromium-browser",
        "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        r"C:\Program Files\Google\Chrome\Application\chrome.exe",
        r"C:\Program Files (x86)\Google\Chrome\Application\chrome.exe",
    ];
    candidates.iter().map(PathBuf::from).find(|p| p.exists())
}
