use std::{path::Path, time::Duration};

use anyhow::{anyhow, bail, Context};
use chromiumoxide::{Browser, Handler, Page};
use futures::StreamExt;
use serde::Deserialize;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub connect_ws: Option<String>,
    pub connect_port: Option<u16>,
    pub chrome_path: Option<String>,
    pub headless: bool,
    pub open_url: Option<String>,
    pub watch_pattern: String,
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            connect_ws: None,
            connect_port: Some(9222),
            chrome_path: None,
            headless: false,
            open_url: None,
            watch_pattern: "youtube.com/watch".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonVersion {
    #[serde(rename = "webSocketDebuggerUrl")]
    web_socket_debugger_url: String,
}

async fn discover_ws_via_port(port: u16) -> anyhow::Result<String> {
    let url = format!("http://127.0.0.1:{port}/json/version");
    let response = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()
        .context("Failed to build HTTP client")?
        .get(&url)
        .send()
        .await
        .context("Failed to reach browser debug endpoint")?;
    if !response.status().is_success() {
        bail!("Browser debug endpoint returned {}", response.status());
    }
    let version: JsonVersion = response
        .json()
        .await
        .context("Failed to parse browser debug endpoint response")?;
    Ok(version.web_socket_debugger_url)
}

fn find_chrome() -> anyhow::Result<String> {
    for candidate in [
        "chromium",
        "chromium-browser",
        "google-chrome",
        "google-chrome-stable",
        "chrome",
    ] {
        if let Ok(path) = which::which(candidate) {
            log::debug!("Found browser binary in PATH: {}", path.display());
            return Ok(path.to_string_lossy().to_string());
        }
    }

    let standard_paths: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
        ]
    } else {
        &[
            "/usr/bin/chromium",
            "/usr/bin/chromium-browser",
            "/usr/bin/google-chrome",
            "/usr/bin/google-chrome-stable",
            "/opt/google/chrome/google-chrome",
            "/snap/bin/chromium",
        ]
    };
    for candidate in standard_paths {
        if Path::new(candidate).exists() {
            log::debug!("Found browser binary at {candidate}");
            return Ok((*candidate).to_string());
        }
    }

    bail!("No Chrome or Chromium binary found; set browser.chrome_path in the config")
}

fn build_launch_config(
    config: &BrowserConfig,
) -> anyhow::Result<chromiumoxide::browser::BrowserConfig> {
    let chrome = match &config.chrome_path {
        Some(path) => path.clone(),
        None => find_chrome()?,
    };
    let mut builder = chromiumoxide::browser::BrowserConfig::builder()
        .chrome_executable(chrome)
        .arg("--disable-blink-features=AutomationControlled")
        .arg("--no-first-run")
        .arg("--no-default-browser-check");
    builder = if config.headless {
        builder.headless_mode(chromiumoxide::browser::HeadlessMode::New)
    } else {
        builder.with_head()
    };
    builder.build().map_err(|err| anyhow!(err))
}

/// One attached or launched browser. Attaching to a websocket or debug port
/// is preferred; launching a fresh instance is the fallback. The CDP event
/// stream is drained on a background task for the lifetime of the session.
pub struct BrowserSession {
    browser: Browser,
    event_task: JoinHandle<()>,
    launched: bool,
}

impl BrowserSession {
    pub async fn connect(config: &BrowserConfig) -> anyhow::Result<Self> {
        if let Some(ws) = &config.connect_ws {
            log::info!("Attaching to browser at {ws}");
            let (browser, handler) = Browser::connect(ws.clone())
                .await
                .context("Failed to attach to browser over websocket")?;
            return Ok(Self::start(browser, handler, false));
        }

        if let Some(port) = config.connect_port {
            match discover_ws_via_port(port).await {
                Ok(ws) => {
                    log::info!("Attaching to browser on debug port {port}");
                    let (browser, handler) = Browser::connect(ws)
                        .await
                        .context("Failed to attach to discovered browser")?;
                    return Ok(Self::start(browser, handler, false));
                }
                Err(err) => {
                    log::warn!("No browser reachable on debug port {port}: {err:#}");
                }
            }
        }

        log::info!("Launching browser instance");
        let launch_config = build_launch_config(config)?;
        let (browser, handler) = Browser::launch(launch_config)
            .await
            .context("Failed to launch browser")?;
        Ok(Self::start(browser, handler, true))
    }

    fn start(browser: Browser, mut handler: Handler, launched: bool) -> Self {
        let event_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(err) = event {
                    log::debug!("Browser event loop ended: {err}");
                    break;
                }
            }
        });
        Self {
            browser,
            event_task,
            launched,
        }
    }

    /// Returns the first open tab whose URL matches the watch pattern.
    pub async fn find_watch_page(&self, pattern: &str) -> anyhow::Result<Option<Page>> {
        let pages = self
            .browser
            .pages()
            .await
            .context("Failed to list browser pages")?;
        for page in pages {
            let url = match page.url().await {
                Ok(Some(url)) => url,
                Ok(None) => continue,
                Err(err) => {
                    log::debug!("Skipping page with unreadable URL: {err}");
                    continue;
                }
            };
            if url.contains(pattern) {
                return Ok(Some(page));
            }
        }
        Ok(None)
    }

    pub async fn open(&self, url: &str) -> anyhow::Result<Page> {
        let page = self
            .browser
            .new_page(url)
            .await
            .with_context(|| format!("Failed to open {url}"))?;
        Ok(page)
    }

    /// Shuts the session down. A browser we launched is closed; a browser we
    /// merely attached to is left running and only the connection is dropped.
    pub async fn close(mut self) -> anyhow::Result<()> {
        if self.launched {
            self.browser.close().await?;
            if let Err(err) = self.event_task.await {
                log::debug!("Browser event task ended: {err}");
            }
        } else {
            self.event_task.abort();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn should_parse_version_endpoint_response() {
        // given
        let raw = json!({
            "Browser": "Chrome/126.0.6478.55",
            "Protocol-Version": "1.3",
            "webSocketDebuggerUrl": "ws://127.0.0.1:9222/devtools/browser/abc-def"
        });

        // when
        let version: JsonVersion = serde_json::from_value(raw).unwrap();

        // then
        assert_eq!(
            version.web_socket_debugger_url,
            "ws://127.0.0.1:9222/devtools/browser/abc-def"
        );
    }
}
