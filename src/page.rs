use anyhow::{anyhow, Context};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, EnableParams as PageEnableParams, FrameId,
};
use chromiumoxide::cdp::js_protocol::runtime::{
    AddBindingParams, EnableParams as RuntimeEnableParams,
};
use chromiumoxide::Page;

use crate::config::Config;
use crate::dom::{self, DomSnapshot, REPORT_BINDING};

/// Wraps the CDP page of one watch tab. All page mutations go through here;
/// the probe and mutation scripts are rendered once up front from the config.
pub struct WatchPage {
    page: Page,
    probe_js: String,
    bootstrap_js: String,
    skip_js: String,
}

impl WatchPage {
    pub fn new(page: Page, config: &Config) -> Self {
        Self {
            page,
            probe_js: dom::probe_script(&config.detection),
            bootstrap_js: dom::bootstrap_script(&config.scheduler.mutation_needles),
            skip_js: dom::skip_script(&config.detection.skip_selectors),
        }
    }

    /// Raw CDP page handle, used to register event listeners.
    pub fn cdp(&self) -> &Page {
        &self.page
    }

    /// Enables the runtime and page domains, registers the report binding and
    /// arranges for the observer bootstrap to run in every new document as
    /// well as the current one.
    pub async fn prepare(&self) -> anyhow::Result<()> {
        self.page
            .execute(RuntimeEnableParams::default())
            .await
            .context("Failed to enable runtime domain")?;
        self.page
            .execute(PageEnableParams::default())
            .await
            .context("Failed to enable page domain")?;

        let binding = AddBindingParams::builder()
            .name(REPORT_BINDING)
            .build()
            .map_err(|err| anyhow!(err))?;
        self.page
            .execute(binding)
            .await
            .context("Failed to register report binding")?;

        self.page
            .execute(AddScriptToEvaluateOnNewDocumentParams::new(
                self.bootstrap_js.clone(),
            ))
            .await
            .context("Failed to register bootstrap for new documents")?;
        self.install_bootstrap().await?;
        Ok(())
    }

    /// Installs the mutation observer into the current document. Safe to call
    /// repeatedly; the script guards against double installs.
    pub async fn install_bootstrap(&self) -> anyhow::Result<()> {
        self.page
            .evaluate(self.bootstrap_js.clone())
            .await
            .context("Failed to install observer bootstrap")?;
        Ok(())
    }

    pub async fn snapshot(&self) -> anyhow::Result<DomSnapshot> {
        let snapshot = self
            .page
            .evaluate(self.probe_js.clone())
            .await
            .context("Failed to evaluate DOM probe")?
            .into_value()
            .context("Failed to decode DOM snapshot")?;
        Ok(snapshot)
    }

    pub async fn set_playback_rate(&self, rate: f64) -> anyhow::Result<bool> {
        let applied = self
            .page
            .evaluate(dom::set_rate_script(rate))
            .await
            .context("Failed to set playback rate")?
            .into_value()
            .context("Failed to decode playback rate result")?;
        Ok(applied)
    }

    /// Clicks the first visible, enabled skip control. Returns the selector
    /// that was activated, if any.
    pub async fn click_skip(&self) -> anyhow::Result<Option<String>> {
        let clicked = self
            .page
            .evaluate(self.skip_js.clone())
            .await
            .context("Failed to run skip attempt")?
            .into_value()
            .context("Failed to decode skip attempt result")?;
        Ok(clicked)
    }

    pub async fn show_indicator(&self, rate: f64) -> anyhow::Result<()> {
        self.page
            .evaluate(dom::show_indicator_script(rate))
            .await
            .context("Failed to show speed indicator")?;
        Ok(())
    }

    pub async fn remove_indicator(&self) -> anyhow::Result<()> {
        self.page
            .evaluate(dom::remove_indicator_script())
            .await
            .context("Failed to remove speed indicator")?;
        Ok(())
    }

    pub async fn current_url(&self) -> anyhow::Result<Option<String>> {
        let url = self.page.url().await?;
        Ok(url)
    }

    pub async fn main_frame(&self) -> anyhow::Result<Option<FrameId>> {
        let frame = self.page.mainframe().await?;
        Ok(frame)
    }
}
