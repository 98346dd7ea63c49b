use serde::Deserialize;

use crate::detector::DetectionConfig;

/// Name of the Runtime binding the in-page observer calls to reach us.
pub const REPORT_BINDING: &str = "__adwarpReport";

/// One DOM sample, produced by the probe script in a single evaluation.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DomSnapshot {
    pub url: String,
    pub media_present: bool,
    pub playback_rate: Option<f64>,
    pub sentinels: Vec<SentinelProbe>,
    pub markers: Vec<MarkerProbe>,
    pub player_ad_class: bool,
    pub skip_targets: Vec<SkipProbe>,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SentinelProbe {
    pub selector: String,
    pub present: bool,
    pub text: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MarkerProbe {
    pub selector: String,
    pub present: bool,
    pub visible: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SkipProbe {
    pub selector: String,
    pub clickable: bool,
}

/// Payload of a report binding call from the page.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BindingReport {
    pub kind: ReportKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportKind {
    Mutation,
    Visibility,
}

const PROBE_TEMPLATE: &str = r#"(() => {
  const cfg = __CFG__;
  const visible = (el) => {
    if (!el) return false;
    const rect = el.getBoundingClientRect();
    if (rect.width <= 0 || rect.height <= 0) return false;
    const style = window.getComputedStyle(el);
    return style.display !== "none" && style.visibility !== "hidden";
  };
  const video = document.querySelector("video");
  const player = document.querySelector(cfg.playerSelector);
  return {
    url: location.href,
    mediaPresent: video !== null,
    playbackRate: video ? video.playbackRate : null,
    sentinels: cfg.sentinelSelectors.map((selector) => {
      const el = document.querySelector(selector);
      return {
        selector,
        present: el !== null,
        text: el ? el.textContent.trim() : null,
      };
    }),
    markers: cfg.markerSelectors.map((selector) => {
      const el = document.querySelector(selector);
      return { selector, present: el !== null, visible: visible(el) };
    }),
    playerAdClass: player !== null && player.classList.contains(cfg.playerAdClass),
    skipTargets: cfg.skipSelectors.map((selector) => {
      const el = document.querySelector(selector);
      return { selector, clickable: visible(el) && !el.disabled };
    }),
  };
})()"#;

const BOOTSTRAP_TEMPLATE: &str = r#"(() => {
  if (window.__adwarpObserver) return;
  const needles = __NEEDLES__;
  const report = (kind) => {
    if (typeof window.__adwarpReport === "function") {
      window.__adwarpReport(JSON.stringify({ kind }));
    }
  };
  const matches = (node) => {
    if (!node || !node.getAttribute) return false;
    const haystack =
      ((node.getAttribute("class") || "") + " " + (node.id || "")).toLowerCase();
    return needles.some((needle) => haystack.includes(needle));
  };
  const observer = new MutationObserver((mutations) => {
    for (const mutation of mutations) {
      if (mutation.type === "attributes") {
        if (matches(mutation.target)) {
          report("mutation");
          return;
        }
      } else {
        for (const node of mutation.addedNodes) {
          if (matches(node)) {
            report("mutation");
            return;
          }
        }
      }
    }
  });
  observer.observe(document, {
    subtree: true,
    childList: true,
    attributes: true,
    attributeFilter: ["class", "id"],
  });
  window.__adwarpObserver = observer;
  document.addEventListener("visibilitychange", () => {
    if (document.visibilityState === "visible") report("visibility");
  });
})()"#;

const SKIP_TEMPLATE: &str = r#"(() => {
  const selectors = __SELECTORS__;
  const visible = (el) => {
    if (!el) return false;
    const rect = el.getBoundingClientRect();
    if (rect.width <= 0 || rect.height <= 0) return false;
    const style = window.getComputedStyle(el);
    return style.display !== "none" && style.visibility !== "hidden";
  };
  for (const selector of selectors) {
    const el = document.querySelector(selector);
    if (el && visible(el) && !el.disabled) {
      el.click();
      return selector;
    }
  }
  return null;
})()"#;

const SET_RATE_TEMPLATE: &str = r#"(() => {
  const video = document.querySelector("video");
  if (!video) return false;
  video.playbackRate = __RATE__;
  return true;
})()"#;

const SHOW_INDICATOR_TEMPLATE: &str = r##"(() => {
  if (document.querySelector("#ad-speed-indicator")) return;
  const indicator = document.createElement("div");
  indicator.id = "ad-speed-indicator";
  indicator.style.cssText =
    "position: fixed; top: 10px; right: 10px; background: rgba(255, 0, 0, 0.8); " +
    "color: white; padding: 5px 10px; border-radius: 5px; font-size: 12px; " +
    "z-index: 10000; font-family: Arial, sans-serif;";
  indicator.textContent = "⚡ Ad Speed: __RATE__x";
  if (document.body) document.body.appendChild(indicator);
})()"##;

const REMOVE_INDICATOR_SCRIPT: &str = r##"(() => {
  const indicator = document.querySelector("#ad-speed-indicator");
  if (indicator) indicator.remove();
})()"##;

/// Builds the expression that samples every configured selector in one pass.
pub fn probe_script(config: &DetectionConfig) -> String {
    let cfg = serde_json::json!({
        "sentinelSelectors": config.sentinel_selectors,
        "markerSelectors": config
            .markers
            .iter()
            .map(|marker| marker.selector.clone())
            .collect::<Vec<_>>(),
        "playerSelector": config.player_selector,
        "playerAdClass": config.player_ad_class,
        "skipSelectors": config.skip_selectors,
    });
    PROBE_TEMPLATE.replace("__CFG__", &cfg.to_string())
}

/// Builds the observer bootstrap installed into every new document. Reports
/// through the page binding when an ad-related mutation lands or the page
/// regains visibility. Installing twice is a no-op.
pub fn bootstrap_script(needles: &[String]) -> String {
    let needles = serde_json::json!(needles);
    BOOTSTRAP_TEMPLATE.replace("__NEEDLES__", &needles.to_string())
}

/// Builds the expression that clicks the first visible, enabled skip control.
/// Evaluates to the matched selector, or null when nothing was clickable.
pub fn skip_script(selectors: &[String]) -> String {
    let selectors = serde_json::json!(selectors);
    SKIP_TEMPLATE.replace("__SELECTORS__", &selectors.to_string())
}

pub fn set_rate_script(rate: f64) -> String {
    SET_RATE_TEMPLATE.replace("__RATE__", &rate.to_string())
}

pub fn show_indicator_script(rate: f64) -> String {
    SHOW_INDICATOR_TEMPLATE.replace("__RATE__", &rate.to_string())
}

pub fn remove_indicator_script() -> &'static str {
    REMOVE_INDICATOR_SCRIPT
}
