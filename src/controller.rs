use std::time::{Duration, Instant};

use serde::Deserialize;

const RATE_EPSILON: f64 = 1e-3;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub boost_rate: f64,
    pub grace_ms: u64,
    pub click_skip: bool,
    pub indicator: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            boost_rate: 16.0,
            grace_ms: 200,
            click_skip: true,
            indicator: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControlState {
    Normal,
    Pending { since: Instant },
    Boosted { original_rate: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    None,
    Armed,
    Disarmed,
    Boosted,
    Restored,
    ExternalReset,
}

/// Page mutations requested by the controller. The caller applies them in
/// order; skips come before rate writes so a successful skip still ends the
/// ad at the boosted rate for as little time as possible.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    ClickSkip,
    SetRate(f64),
    ShowIndicator(f64),
    RemoveIndicator,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ControlUpdate {
    pub transition: Transition,
    pub commands: Vec<Command>,
}

impl ControlUpdate {
    fn none() -> Self {
        Self {
            transition: Transition::None,
            commands: Vec::new(),
        }
    }
}

fn rates_equal(a: f64, b: f64) -> bool {
    (a - b).abs() < RATE_EPSILON
}

/// State machine that boosts playback while an ad is detected and restores
/// the previous rate when it ends. The original rate is captured exactly once
/// per ad, at the commit into the boosted state, and never overwritten while
/// the boost holds.
#[derive(Debug)]
pub struct SpeedController {
    config: ControlConfig,
    state: ControlState,
    ad_count: u64,
}

impl SpeedController {
    pub fn new(config: ControlConfig) -> Self {
        Self {
            config,
            state: ControlState::Normal,
            ad_count: 0,
        }
    }

    pub fn ad_count(&self) -> u64 {
        self.ad_count
    }

    pub fn is_boosted(&self) -> bool {
        matches!(self.state, ControlState::Boosted { .. })
    }

    pub fn original_rate(&self) -> Option<f64> {
        match self.state {
            ControlState::Boosted { original_rate } => Some(original_rate),
            _ => None,
        }
    }

    pub fn boost_rate(&self) -> f64 {
        self.config.boost_rate
    }

    pub fn reset(&mut self) {
        self.state = ControlState::Normal;
        self.ad_count = 0;
    }

    /// Re-enters the boosted state after a stand-down failed to reach the
    /// page, so the restore is emitted again on the next pass. The ad counter
    /// is left alone.
    pub fn resume_boost(&mut self, original_rate: f64) {
        self.state = ControlState::Boosted { original_rate };
    }

    pub fn on_pass(&mut self, ad_detected: bool, observed_rate: f64, now: Instant) -> ControlUpdate {
        match self.state {
            // The player or another actor already put the rate back. Let go
            // instead of staying stuck in the boosted state.
            ControlState::Boosted { original_rate } if rates_equal(observed_rate, original_rate) => {
                self.state = ControlState::Normal;
                ControlUpdate {
                    transition: Transition::ExternalReset,
                    commands: self.indicator_removal(),
                }
            }
            ControlState::Normal if ad_detected => {
                self.state = ControlState::Pending { since: now };
                ControlUpdate {
                    transition: Transition::Armed,
                    commands: self.skip_attempt(),
                }
            }
            ControlState::Normal => ControlUpdate::none(),
            ControlState::Pending { .. } if !ad_detected => {
                self.state = ControlState::Normal;
                ControlUpdate {
                    transition: Transition::Disarmed,
                    commands: Vec::new(),
                }
            }
            ControlState::Pending { since }
                if now.duration_since(since) >= Duration::from_millis(self.config.grace_ms) =>
            {
                self.state = ControlState::Boosted {
                    original_rate: observed_rate,
                };
                self.ad_count += 1;
                let mut commands = self.skip_attempt();
                commands.push(Command::SetRate(self.config.boost_rate));
                if self.config.indicator {
                    commands.push(Command::ShowIndicator(self.config.boost_rate));
                }
                ControlUpdate {
                    transition: Transition::Boosted,
                    commands,
                }
            }
            ControlState::Pending { .. } => ControlUpdate {
                transition: Transition::None,
                commands: self.skip_attempt(),
            },
            ControlState::Boosted { original_rate } if !ad_detected => {
                self.state = ControlState::Normal;
                let mut commands = vec![Command::SetRate(original_rate)];
                commands.extend(self.indicator_removal());
                ControlUpdate {
                    transition: Transition::Restored,
                    commands,
                }
            }
            ControlState::Boosted { .. } => ControlUpdate {
                transition: Transition::None,
                commands: self.skip_attempt(),
            },
        }
    }

    fn skip_attempt(&self) -> Vec<Command> {
        if self.config.click_skip {
            vec![Command::ClickSkip]
        } else {
            Vec::new()
        }
    }

    fn indicator_removal(&self) -> Vec<Command> {
        if self.config.indicator {
            vec![Command::RemoveIndicator]
        } else {
            Vec::new()
        }
    }
}
