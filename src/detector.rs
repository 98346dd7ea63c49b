use std::time::{Duration, Instant};

use serde::Deserialize;

use crate::dom::DomSnapshot;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub sentinel_text: String,
    pub sentinel_selectors: Vec<String>,
    pub markers: Vec<MarkerRule>,
    pub player_selector: String,
    pub player_ad_class: String,
    pub skip_selectors: Vec<String>,
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct MarkerRule {
    pub selector: String,

    #[serde(default)]
    pub require_visible: bool,
}

impl MarkerRule {
    fn present(selector: &str) -> Self {
        Self {
            selector: selector.to_string(),
            require_visible: false,
        }
    }

    fn visible(selector: &str) -> Self {
        Self {
            selector: selector.to_string(),
            require_visible: true,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            sentinel_text: "Sponsored".to_string(),
            sentinel_selectors: vec![
                ".ad-simple-attributed-string.ytp-ad-badge__text--clean-player".to_string(),
                "[aria-label=\"Sponsored\"]".to_string(),
                ".ytp-ad-badge__text--clean-player".to_string(),
                ".ad-simple-attributed-string".to_string(),
            ],
            markers: vec![
                MarkerRule::visible(".ytp-ad-skip-button"),
                MarkerRule::visible(".ytp-ad-skip-button-modern"),
                MarkerRule::visible(".video-ads"),
                MarkerRule::present(".ytp-ad-text"),
                MarkerRule::present(".ytp-ad-preview-text"),
                MarkerRule::present("[class*=\"ad-showing\"]"),
                MarkerRule::visible(".ytp-ad-player-overlay"),
                MarkerRule::present(".ytp-ad-module:not([hidden])"),
            ],
            player_selector: "#movie_player".to_string(),
            player_ad_class: "ad-showing".to_string(),
            skip_selectors: vec![
                ".ytp-ad-skip-button".to_string(),
                ".ytp-ad-skip-button-modern".to_string(),
            ],
            debounce_ms: 200,
        }
    }
}

/// Outcome of one classification pass over a DOM snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub ad_playing: bool,
    pub matched: Option<String>,
}

#[derive(Debug, Clone)]
struct LastDetection {
    at: Instant,
    detection: Detection,
}

/// Classifies DOM snapshots as "ad playing" or not. The signals are an
/// ordered battery evaluated first-match-wins: the sponsored sentinel text,
/// then the structural markers, then the player container's ad class.
#[derive(Debug)]
pub struct Detector {
    config: DetectionConfig,
    last: Option<LastDetection>,
}

impl Detector {
    pub fn new(config: DetectionConfig) -> Self {
        Self { config, last: None }
    }

    /// Returns the previous detection while it is still inside the debounce
    /// window, so bursts of triggers skip the DOM roundtrip entirely.
    pub fn cached(&self, now: Instant) -> Option<&Detection> {
        let last = self.last.as_ref()?;
        let window = Duration::from_millis(self.config.debounce_ms);
        (now.duration_since(last.at) < window).then_some(&last.detection)
    }

    pub fn evaluate(&mut self, snapshot: &DomSnapshot, now: Instant) -> Detection {
        let matched = self
            .sentinel_signal(snapshot)
            .or_else(|| self.marker_signal(snapshot))
            .or_else(|| self.player_class_signal(snapshot));
        let detection = Detection {
            ad_playing: matched.is_some(),
            matched,
        };
        self.last = Some(LastDetection {
            at: now,
            detection: detection.clone(),
        });
        detection
    }

    pub fn reset(&mut self) {
        self.last = None;
    }

    fn sentinel_signal(&self, snapshot: &DomSnapshot) -> Option<String> {
        snapshot
            .sentinels
            .iter()
            .find(|probe| {
                probe.present && probe.text.as_deref() == Some(self.config.sentinel_text.as_str())
            })
            .map(|probe| probe.selector.clone())
    }

    fn marker_signal(&self, snapshot: &DomSnapshot) -> Option<String> {
        self.config.markers.iter().find_map(|rule| {
            let probe = snapshot
                .markers
                .iter()
                .find(|probe| probe.selector == rule.selector)?;
            let hit = probe.present && (!rule.require_visible || probe.visible);
            hit.then(|| rule.selector.clone())
        })
    }

    fn player_class_signal(&self, snapshot: &DomSnapshot) -> Option<String> {
        snapshot.player_ad_class.then(|| {
            format!(
                "{}.{}",
                self.config.player_selector, self.config.player_ad_class
            )
        })
    }
}
