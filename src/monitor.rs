use std::{fmt, sync::Arc, time::Duration};

use anyhow::Context;
use chromiumoxide::cdp::browser_protocol::page::{
    EventFrameNavigated, EventNavigatedWithinDocument, FrameId,
};
use chromiumoxide::cdp::js_protocol::runtime::EventBindingCalled;
use futures_util::{Stream, StreamExt};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{interval, sleep_until, Instant, MissedTickBehavior},
};
use uuid::Uuid;

use crate::{
    config::Config,
    controller::{Command, ControlUpdate, SpeedController, Transition},
    detector::{Detection, Detector},
    dom::{BindingReport, DomSnapshot, ReportKind, REPORT_BINDING},
    page::WatchPage,
};

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_ms: u64,
    pub mutation_settle_ms: u64,
    pub nav_settle_ms: u64,
    pub scan_interval_ms: u64,
    pub mutation_needles: Vec<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            mutation_settle_ms: 50,
            nav_settle_ms: 1000,
            scan_interval_ms: 2000,
            mutation_needles: vec![
                "ytp-ad".to_string(),
                "ad-showing".to_string(),
                "ad-interrupting".to_string(),
                "video-ads".to_string(),
                "ad-simple".to_string(),
                "sponsored".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MonitorId(Uuid);

impl MonitorId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for MonitorId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitorStatus {
    pub id: MonitorId,
    pub page_url: Option<String>,
    pub is_monitoring: bool,
    pub ad_playing: bool,
    pub ad_count: u64,
    pub current_speed: Option<f64>,
}

/// Last-value-wins snapshot of the active monitor, readable from any task.
#[derive(Debug, Clone, Default)]
pub struct StatusBoard {
    current: Arc<RwLock<Option<MonitorStatus>>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, status: MonitorStatus) {
        *self.current.write() = Some(status);
    }

    /// Clears the board only if the stored entry belongs to `id`, so a late
    /// write from a stopped monitor cannot wipe its successor's entry.
    pub fn clear(&self, id: MonitorId) {
        let mut current = self.current.write();
        if current.as_ref().is_some_and(|status| status.id == id) {
            *current = None;
        }
    }

    pub fn current(&self) -> Option<MonitorStatus> {
        self.current.read().clone()
    }
}

#[derive(Debug)]
enum MonitorCmd {
    ForceCheck,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct MonitorHandle {
    pub id: MonitorId,
    cmd_tx: mpsc::WeakSender<MonitorCmd>,
}

impl MonitorHandle {
    /// Requests an out-of-band detection pass. Returns false when the monitor
    /// task has already ended.
    pub async fn force_check(&self) -> anyhow::Result<bool> {
        let Some(cmd_tx) = self.cmd_tx.upgrade() else {
            log::debug!("Monitor {} is gone, dropping force check", self.id);
            return Ok(false);
        };
        cmd_tx.send(MonitorCmd::ForceCheck).await?;
        Ok(true)
    }
}

#[derive(Debug)]
pub struct MonitorController {
    pub id: MonitorId,
    cmd_tx: mpsc::Sender<MonitorCmd>,
    join_handle: JoinHandle<()>,
}

impl MonitorController {
    pub fn handle(&self) -> MonitorHandle {
        MonitorHandle {
            id: self.id,
            cmd_tx: self.cmd_tx.clone().downgrade(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join_handle.is_finished()
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        // The send fails if the task already stopped on its own; joining is
        // all that is left to do then.
        let _ = self.cmd_tx.send(MonitorCmd::Shutdown).await;
        self.join_handle.await?;
        Ok(())
    }
}

/// Hands the active monitor's handle to whoever needs to reach it, currently
/// the control server. Replaced wholesale when the app attaches to a new tab.
#[derive(Debug, Clone, Default)]
pub struct MonitorRegistry {
    active: Arc<RwLock<Option<MonitorHandle>>>,
}

impl MonitorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, handle: MonitorHandle) {
        *self.active.write() = Some(handle);
    }

    pub fn clear(&self) {
        *self.active.write() = None;
    }

    pub async fn force_check(&self) -> anyhow::Result<bool> {
        let handle = self.active.read().clone();
        match handle {
            Some(handle) => handle.force_check().await,
            None => Ok(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum PassOutcome {
    NoMedia,
    Completed {
        detection: Detection,
        update: ControlUpdate,
        observed_rate: f64,
    },
}

/// One detection-and-control pass over a snapshot. Pure; all page effects are
/// returned as commands inside the outcome.
fn evaluate_pass(
    detector: &mut Detector,
    controller: &mut SpeedController,
    snapshot: &DomSnapshot,
    now: std::time::Instant,
) -> PassOutcome {
    if !snapshot.media_present {
        return PassOutcome::NoMedia;
    }
    let Some(observed_rate) = snapshot.playback_rate else {
        return PassOutcome::NoMedia;
    };
    let detection = detector.evaluate(snapshot, now);
    let update = controller.on_pass(detection.ad_playing, observed_rate, now);
    PassOutcome::Completed {
        detection,
        update,
        observed_rate,
    }
}

/// Trigger-level debounce gate: within the window the previous verdict
/// stands, so the pass neither probes the page nor emits commands.
fn pass_due(detector: &Detector, now: std::time::Instant) -> bool {
    detector.cached(now).is_none()
}

/// Rate to re-enter the boosted state with when applying a stand-down
/// update failed. The captured original must survive until a restore write
/// actually lands, or the next ad would capture the boosted rate instead.
fn stand_down_rollback(update: &ControlUpdate, observed_rate: f64) -> Option<f64> {
    match update.transition {
        Transition::Restored => update.commands.iter().find_map(|command| match command {
            Command::SetRate(rate) => Some(*rate),
            _ => None,
        }),
        Transition::ExternalReset => Some(observed_rate),
        _ => None,
    }
}

fn is_target_gone(err: &anyhow::Error) -> bool {
    let text = format!("{err:?}");
    [
        "Target closed",
        "Target crashed",
        "Session closed",
        "Session with given id not found",
        "Not attached to an active page",
        "Connection is closed",
        "sender dropped",
        "oneshot canceled",
    ]
    .iter()
    .any(|needle| text.contains(needle))
}

/// Watches one tab: polls the DOM, reacts to mutation reports and
/// navigations, and drives the speed controller. The monitor task is the only
/// writer to its page, so passes never interleave partial updates.
pub struct TabMonitor {
    id: MonitorId,
    config: Arc<Config>,
    watch: WatchPage,
    detector: Detector,
    controller: SpeedController,
    board: StatusBoard,
    cmd_rx: mpsc::Receiver<MonitorCmd>,
    current_url: Option<String>,
    main_frame: Option<FrameId>,
    running: bool,
    settle_at: Option<Instant>,
    nav_reset_at: Option<Instant>,
    pending_url: Option<String>,
}

async fn wait_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl TabMonitor {
    /// Prepares the page and spawns the monitor task for it.
    pub async fn attach(
        page: chromiumoxide::Page,
        config: Arc<Config>,
        board: StatusBoard,
    ) -> anyhow::Result<MonitorController> {
        let watch = WatchPage::new(page, &config);
        watch
            .prepare()
            .await
            .context("Failed to prepare page for monitoring")?;

        let bindings = watch
            .cdp()
            .event_listener::<EventBindingCalled>()
            .await
            .context("Failed to listen for page reports")?;
        let frame_navs = watch
            .cdp()
            .event_listener::<EventFrameNavigated>()
            .await
            .context("Failed to listen for navigations")?;
        let doc_navs = watch
            .cdp()
            .event_listener::<EventNavigatedWithinDocument>()
            .await
            .context("Failed to listen for history navigations")?;

        let current_url = watch.current_url().await.ok().flatten();
        let main_frame = watch.main_frame().await.ok().flatten();

        let (cmd_tx, cmd_rx) = mpsc::channel::<MonitorCmd>(8);
        let id = MonitorId::new();
        let detector = Detector::new(config.detection.clone());
        let controller = SpeedController::new(config.control.clone());
        let mut monitor = TabMonitor {
            id,
            config,
            watch,
            detector,
            controller,
            board,
            cmd_rx,
            current_url,
            main_frame,
            running: true,
            settle_at: None,
            nav_reset_at: None,
            pending_url: None,
        };

        let join_handle = tokio::spawn(async move {
            monitor.run(bindings, frame_navs, doc_navs).await;
        });

        Ok(MonitorController {
            id,
            cmd_tx,
            join_handle,
        })
    }

    async fn run(
        &mut self,
        mut bindings: impl Stream<Item = Arc<EventBindingCalled>> + Unpin,
        mut frame_navs: impl Stream<Item = Arc<EventFrameNavigated>> + Unpin,
        mut doc_navs: impl Stream<Item = Arc<EventNavigatedWithinDocument>> + Unpin,
    ) {
        log::info!(
            "Monitor {} attached to {}",
            self.id,
            self.current_url.as_deref().unwrap_or("unknown page")
        );
        self.board.publish(MonitorStatus {
            id: self.id,
            page_url: self.current_url.clone(),
            is_monitoring: true,
            ad_playing: false,
            ad_count: 0,
            current_speed: None,
        });
        self.tick("attach").await;

        let mut poll = interval(Duration::from_millis(
            self.config.scheduler.poll_interval_ms.max(1),
        ));
        poll.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.running {
            tokio::select! {
                _ = poll.tick() => {
                    self.tick("poll").await;
                }
                _ = wait_deadline(self.settle_at), if self.settle_at.is_some() => {
                    self.settle_at = None;
                    self.tick("mutation").await;
                }
                _ = wait_deadline(self.nav_reset_at), if self.nav_reset_at.is_some() => {
                    self.nav_reset_at = None;
                    self.finish_navigation().await;
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(MonitorCmd::ForceCheck) => self.tick("forced").await,
                        Some(MonitorCmd::Shutdown) | None => self.running = false,
                    }
                }
                event = bindings.next() => {
                    match event {
                        Some(event) => self.handle_report(&event).await,
                        None => self.halt("report stream ended"),
                    }
                }
                event = frame_navs.next() => {
                    match event {
                        Some(event) => {
                            if event.frame.parent_id.is_none() {
                                self.handle_navigation(event.frame.url.clone());
                            }
                        }
                        None => self.halt("navigation stream ended"),
                    }
                }
                event = doc_navs.next() => {
                    match event {
                        Some(event) => {
                            if self.is_main_frame(&event.frame_id) {
                                self.handle_navigation(event.url.clone());
                            }
                        }
                        None => self.halt("navigation stream ended"),
                    }
                }
            }
        }

        self.cleanup().await;
        log::info!("Monitor {} stopped", self.id);
    }

    fn halt(&mut self, reason: &str) {
        log::info!("Monitor {}: {reason}, stopping", self.id);
        self.running = false;
    }

    fn is_main_frame(&self, frame_id: &FrameId) -> bool {
        match &self.main_frame {
            Some(main) => main == frame_id,
            // Without a known main frame id, err on the side of reacting.
            None => true,
        }
    }

    async fn handle_report(&mut self, event: &EventBindingCalled) {
        if event.name != REPORT_BINDING {
            return;
        }
        let report: BindingReport = match serde_json::from_str(&event.payload) {
            Ok(report) => report,
            Err(err) => {
                log::debug!("Monitor {}: malformed page report: {err}", self.id);
                return;
            }
        };
        match report.kind {
            ReportKind::Mutation => self.schedule_settled_pass(),
            ReportKind::Visibility => {
                log::debug!("Monitor {}: page became visible again", self.id);
                if let Err(err) = self.watch.install_bootstrap().await {
                    if is_target_gone(&err) {
                        self.halt("page is gone");
                        return;
                    }
                    log::debug!("Monitor {}: failed to reinstall observer: {err:#}", self.id);
                }
                self.schedule_settled_pass();
            }
        }
    }

    /// Coalesces bursts of triggers into a single delayed pass. An already
    /// scheduled deadline is left alone so a mutation storm cannot starve it.
    fn schedule_settled_pass(&mut self) {
        if self.settle_at.is_none() {
            self.settle_at = Some(
                Instant::now() + Duration::from_millis(self.config.scheduler.mutation_settle_ms),
            );
        }
    }

    fn handle_navigation(&mut self, url: String) {
        if !url.contains(&self.config.browser.watch_pattern) {
            self.halt(&format!("page left watch ({url})"));
            return;
        }
        log::debug!("Monitor {}: navigation to {url}", self.id);
        // Latest navigation wins; the settle deadline starts over.
        self.pending_url = Some(url);
        self.nav_reset_at = Some(
            Instant::now() + Duration::from_millis(self.config.scheduler.nav_settle_ms),
        );
    }

    /// Runs after the navigation settle delay: restores any held rate, resets
    /// the per-video state and starts over against the new document.
    async fn finish_navigation(&mut self) {
        if let Some(url) = self.pending_url.take() {
            log::info!("Monitor {}: now watching {url}", self.id);
            self.current_url = Some(url);
        }
        let mut unrestored = None;
        if let Some(original) = self.controller.original_rate() {
            if let Err(err) = self.watch.set_playback_rate(original).await {
                log::debug!(
                    "Monitor {}: could not restore rate after navigation: {err:#}",
                    self.id
                );
                unrestored = Some(original);
            }
            let _ = self.watch.remove_indicator().await;
        }
        self.detector.reset();
        self.controller.reset();
        if let Some(original) = unrestored {
            // A media element that survived the navigation still runs at the
            // boosted rate; hold the boost so the next pass retries the
            // restore. The counter reset above stands.
            self.controller.resume_boost(original);
        }
        if let Err(err) = self.watch.install_bootstrap().await {
            if is_target_gone(&err) {
                self.halt("page is gone");
                return;
            }
            log::debug!("Monitor {}: failed to reinstall observer: {err:#}", self.id);
        }
        self.tick("navigation").await;
    }

    async fn tick(&mut self, trigger: &str) {
        if let Err(err) = self.run_pass().await {
            if is_target_gone(&err) {
                log::info!("Monitor {}: page is gone, stopping ({err:#})", self.id);
                self.running = false;
            } else {
                log::debug!(
                    "Monitor {}: pass failed on {trigger} trigger: {err:#}",
                    self.id
                );
            }
        }
    }

    async fn run_pass(&mut self) -> anyhow::Result<()> {
        let now = Instant::now().into_std();
        if !pass_due(&self.detector, now) {
            return Ok(());
        }
        let snapshot = self.watch.snapshot().await?;
        match evaluate_pass(&mut self.detector, &mut self.controller, &snapshot, now) {
            PassOutcome::NoMedia => Ok(()),
            PassOutcome::Completed {
                detection,
                update,
                observed_rate,
            } => {
                if let Err(err) = self.apply_commands(&update.commands, &snapshot).await {
                    if let Some(original) = stand_down_rollback(&update, observed_rate) {
                        self.controller.resume_boost(original);
                    }
                    return Err(err);
                }
                self.log_transition(update.transition, &detection);
                let written_rate = update.commands.iter().rev().find_map(|command| match command {
                    Command::SetRate(rate) => Some(*rate),
                    _ => None,
                });
                let page_url = if snapshot.url.is_empty() {
                    self.current_url.clone()
                } else {
                    Some(snapshot.url.clone())
                };
                self.board.publish(MonitorStatus {
                    id: self.id,
                    page_url,
                    is_monitoring: true,
                    ad_playing: detection.ad_playing,
                    ad_count: self.controller.ad_count(),
                    current_speed: Some(written_rate.unwrap_or(observed_rate)),
                });
                Ok(())
            }
        }
    }

    async fn apply_commands(
        &mut self,
        commands: &[Command],
        snapshot: &DomSnapshot,
    ) -> anyhow::Result<()> {
        let skip_target = snapshot.skip_targets.iter().find(|probe| probe.clickable);
        for command in commands {
            match command {
                Command::ClickSkip => {
                    let Some(target) = skip_target else {
                        continue;
                    };
                    match self.watch.click_skip().await {
                        Ok(Some(selector)) => {
                            log::info!("Monitor {}: clicked skip control {selector}", self.id)
                        }
                        Ok(None) => log::debug!(
                            "Monitor {}: skip target {} vanished before click",
                            self.id,
                            target.selector
                        ),
                        // A stale or missing button must not fail the pass.
                        Err(err) => {
                            log::debug!("Monitor {}: skip attempt failed: {err:#}", self.id)
                        }
                    }
                }
                Command::SetRate(rate) => {
                    if !self.watch.set_playback_rate(*rate).await? {
                        log::debug!("Monitor {}: no media element to set rate on", self.id);
                    }
                }
                Command::ShowIndicator(rate) => self.watch.show_indicator(*rate).await?,
                Command::RemoveIndicator => self.watch.remove_indicator().await?,
            }
        }
        Ok(())
    }

    fn log_transition(&self, transition: Transition, detection: &Detection) {
        match transition {
            Transition::Boosted => log::info!(
                "Ad #{} detected ({}) - boosting playback to {}x",
                self.controller.ad_count(),
                detection.matched.as_deref().unwrap_or("unknown signal"),
                self.controller.boost_rate(),
            ),
            Transition::Restored => log::info!("Ad ended - restoring playback speed"),
            Transition::Armed => log::debug!(
                "Monitor {}: possible ad ({})",
                self.id,
                detection.matched.as_deref().unwrap_or("unknown signal"),
            ),
            Transition::Disarmed => {
                log::debug!("Monitor {}: ad signal vanished before boost", self.id)
            }
            Transition::ExternalReset => log::debug!(
                "Monitor {}: playback rate was reset externally, standing down",
                self.id
            ),
            Transition::None => {}
        }
    }

    /// Leaves the page the way we found it before the task ends.
    async fn cleanup(&mut self) {
        if let Some(original) = self.controller.original_rate() {
            if let Err(err) = self.watch.set_playback_rate(original).await {
                log::debug!(
                    "Monitor {}: could not restore playback rate: {err:#}",
                    self.id
                );
            }
            let _ = self.watch.remove_indicator().await;
            self.controller.reset();
        }
        self.board.clear(self.id);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use crate::controller::ControlConfig;
    use crate::detector::DetectionConfig;
    use crate::dom::MarkerProbe;

    use super::*;

    fn snapshot(ad_markers: bool, rate: f64) -> DomSnapshot {
        DomSnapshot {
            url: "https://www.youtube.com/watch?v=abc123".to_string(),
            media_present: true,
            playback_rate: Some(rate),
            markers: if ad_markers {
                vec![MarkerProbe {
                    selector: ".ytp-ad-text".to_string(),
                    present: true,
                    visible: true,
                }]
            } else {
                Vec::new()
            },
            ..Default::default()
        }
    }

    fn pass_pair() -> (Detector, SpeedController) {
        (
            Detector::new(DetectionConfig::default()),
            SpeedController::new(ControlConfig::default()),
        )
    }

    #[test]
    fn should_boost_and_restore_through_full_ad_cycle() {
        // given
        let (mut detector, mut controller) = pass_pair();
        let start = std::time::Instant::now();
        let step = StdDuration::from_millis(300);

        // when
        let quiet = evaluate_pass(&mut detector, &mut controller, &snapshot(false, 1.0), start);
        let armed = evaluate_pass(
            &mut detector,
            &mut controller,
            &snapshot(true, 1.0),
            start + step,
        );
        let boosted = evaluate_pass(
            &mut detector,
            &mut controller,
            &snapshot(true, 1.0),
            start + step * 2,
        );
        let holding = evaluate_pass(
            &mut detector,
            &mut controller,
            &snapshot(true, 16.0),
            start + step * 3,
        );
        let restored = evaluate_pass(
            &mut detector,
            &mut controller,
            &snapshot(false, 16.0),
            start + step * 4,
        );

        // then
        let transitions: Vec<_> = [&quiet, &armed, &boosted, &holding, &restored]
            .iter()
            .map(|outcome| match outcome {
                PassOutcome::Completed { update, .. } => update.transition,
                PassOutcome::NoMedia => panic!("media was present"),
            })
            .collect();
        assert_eq!(
            transitions,
            vec![
                Transition::None,
                Transition::Armed,
                Transition::Boosted,
                Transition::None,
                Transition::Restored,
            ]
        );
        let PassOutcome::Completed { update, .. } = &restored else {
            panic!("media was present");
        };
        assert!(update.commands.contains(&Command::SetRate(1.0)));
        assert_eq!(controller.ad_count(), 1);
    }

    #[test]
    fn should_do_nothing_without_media_element() {
        // given
        let (mut detector, mut controller) = pass_pair();
        let mut empty = snapshot(true, 1.0);
        empty.media_present = false;
        empty.playback_rate = None;

        // when
        let outcome = evaluate_pass(
            &mut detector,
            &mut controller,
            &empty,
            std::time::Instant::now(),
        );

        // then
        assert_eq!(outcome, PassOutcome::NoMedia);
        assert_eq!(controller.ad_count(), 0);
        assert!(!controller.is_boosted());
    }

    #[test]
    fn should_gate_immediate_follow_up_passes() {
        // given
        let (mut detector, mut controller) = pass_pair();
        let start = std::time::Instant::now();
        let step = StdDuration::from_millis(300);
        evaluate_pass(&mut detector, &mut controller, &snapshot(true, 1.0), start);
        evaluate_pass(
            &mut detector,
            &mut controller,
            &snapshot(true, 1.0),
            start + step,
        );
        assert!(controller.is_boosted());

        // when, then: a forced pass right after the boost is gated, a later
        // one runs again
        assert!(!pass_due(&detector, start + step + StdDuration::from_millis(50)));
        assert!(pass_due(&detector, start + step * 2));
    }

    #[test]
    fn should_pick_rollback_rate_for_failed_stand_downs() {
        // given
        let restored = ControlUpdate {
            transition: Transition::Restored,
            commands: vec![Command::SetRate(1.5), Command::RemoveIndicator],
        };
        let external = ControlUpdate {
            transition: Transition::ExternalReset,
            commands: vec![Command::RemoveIndicator],
        };
        let boosted = ControlUpdate {
            transition: Transition::Boosted,
            commands: vec![Command::ClickSkip, Command::SetRate(16.0)],
        };

        // when, then
        assert_eq!(stand_down_rollback(&restored, 16.0), Some(1.5));
        assert_eq!(stand_down_rollback(&external, 1.25), Some(1.25));
        assert_eq!(stand_down_rollback(&boosted, 1.0), None);
    }

    #[test]
    fn should_keep_original_rate_through_failed_restore_write() {
        // given, a full ad cycle whose restore write never reaches the page
        let (mut detector, mut controller) = pass_pair();
        let start = std::time::Instant::now();
        let step = StdDuration::from_millis(300);
        evaluate_pass(&mut detector, &mut controller, &snapshot(true, 1.0), start);
        evaluate_pass(
            &mut detector,
            &mut controller,
            &snapshot(true, 1.0),
            start + step,
        );
        let ended = evaluate_pass(
            &mut detector,
            &mut controller,
            &snapshot(false, 16.0),
            start + step * 2,
        );
        let PassOutcome::Completed {
            update,
            observed_rate,
            ..
        } = ended
        else {
            panic!("media was present");
        };
        assert_eq!(update.transition, Transition::Restored);

        // when, the failed write rolls the controller back
        controller.resume_boost(stand_down_rollback(&update, observed_rate).unwrap());
        let retry = evaluate_pass(
            &mut detector,
            &mut controller,
            &snapshot(false, 16.0),
            start + step * 3,
        );

        // then, the restore is emitted again
        let PassOutcome::Completed { update: retry, .. } = retry else {
            panic!("media was present");
        };
        assert_eq!(retry.transition, Transition::Restored);
        assert!(retry.commands.contains(&Command::SetRate(1.0)));

        // and the next ad captures the true original rate, not the boost
        evaluate_pass(
            &mut detector,
            &mut controller,
            &snapshot(true, 1.0),
            start + step * 4,
        );
        evaluate_pass(
            &mut detector,
            &mut controller,
            &snapshot(true, 1.0),
            start + step * 5,
        );
        assert!(controller.is_boosted());
        assert_eq!(controller.original_rate(), Some(1.0));
        assert_eq!(controller.ad_count(), 2);
    }

    #[test]
    fn should_stand_down_after_external_rate_reset() {
        // given
        let (mut detector, mut controller) = pass_pair();
        let start = std::time::Instant::now();
        let step = StdDuration::from_millis(300);
        evaluate_pass(&mut detector, &mut controller, &snapshot(true, 1.0), start);
        evaluate_pass(
            &mut detector,
            &mut controller,
            &snapshot(true, 1.0),
            start + step,
        );
        assert!(controller.is_boosted());

        // when, markers still on screen but the rate is back at 1.0
        let outcome = evaluate_pass(
            &mut detector,
            &mut controller,
            &snapshot(true, 1.0),
            start + step * 2,
        );

        // then
        let PassOutcome::Completed { update, .. } = outcome else {
            panic!("media was present");
        };
        assert_eq!(update.transition, Transition::ExternalReset);
        assert!(!update
            .commands
            .iter()
            .any(|command| matches!(command, Command::SetRate(_))));
        assert!(!controller.is_boosted());
    }

    #[test]
    fn should_reset_counter_for_new_video_identity() {
        // given
        let (mut detector, mut controller) = pass_pair();
        let start = std::time::Instant::now();
        let step = StdDuration::from_millis(300);
        evaluate_pass(&mut detector, &mut controller, &snapshot(true, 1.0), start);
        evaluate_pass(
            &mut detector,
            &mut controller,
            &snapshot(true, 1.0),
            start + step,
        );
        assert_eq!(controller.ad_count(), 1);

        // when
        detector.reset();
        controller.reset();
        let fresh = evaluate_pass(
            &mut detector,
            &mut controller,
            &snapshot(false, 1.0),
            start + step * 2,
        );

        // then
        assert_eq!(controller.ad_count(), 0);
        let PassOutcome::Completed { update, .. } = fresh else {
            panic!("media was present");
        };
        assert_eq!(update.transition, Transition::None);
    }

    #[test]
    fn should_keep_board_entry_of_successor_on_stale_clear() {
        // given
        let board = StatusBoard::new();
        let old_id = MonitorId::new();
        let new_id = MonitorId::new();
        board.publish(MonitorStatus {
            id: new_id,
            page_url: None,
            is_monitoring: true,
            ad_playing: false,
            ad_count: 0,
            current_speed: None,
        });

        // when
        board.clear(old_id);

        // then
        assert_eq!(board.current().map(|status| status.id), Some(new_id));

        // when the owner clears it
        board.clear(new_id);

        // then
        assert_eq!(board.current(), None);
    }

    #[tokio::test]
    async fn should_report_force_check_delivery() {
        // given
        let (cmd_tx, mut cmd_rx) = mpsc::channel(8);
        let handle = MonitorHandle {
            id: MonitorId::new(),
            cmd_tx: cmd_tx.clone().downgrade(),
        };

        // when
        let delivered = handle.force_check().await.unwrap();

        // then
        assert!(delivered);
        assert!(matches!(cmd_rx.recv().await, Some(MonitorCmd::ForceCheck)));

        // when the monitor task is gone
        drop(cmd_tx);
        let delivered = handle.force_check().await.unwrap();

        // then
        assert!(!delivered);
    }

    #[tokio::test]
    async fn should_answer_force_check_without_active_monitor() {
        // given
        let registry = MonitorRegistry::new();

        // when
        let delivered = registry.force_check().await.unwrap();

        // then
        assert!(!delivered);
    }

    #[test]
    fn should_classify_target_gone_errors() {
        // given
        let gone = anyhow::anyhow!("Target closed");
        let transient = anyhow::anyhow!("Evaluation timed out");

        // when, then
        assert!(is_target_gone(&gone));
        assert!(!is_target_gone(&transient));
    }
}
