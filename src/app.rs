use std::{pin::pin, sync::Arc, time::Duration};

use anyhow::Context as _;
use clap::Parser;
use log::LevelFilter;
use tokio::time::sleep;

use crate::{
    browser::BrowserSession,
    config::Config,
    control::ControlListener,
    monitor::{MonitorController, MonitorRegistry, StatusBoard, TabMonitor},
};

#[derive(Debug, Parser)]
#[command(version, about)]
pub struct Cli {
    #[arg(
        short,
        long,
        help = "The address that the control server should listen on. This overrides the value from the config file."
    )]
    pub listen_on: Option<String>,

    #[arg(
        short,
        long,
        help = "The path to the config file. The default is `config.toml`."
    )]
    pub config: Option<String>,

    #[arg(
        short = 'p',
        long,
        help = "The DevTools port of a running browser to attach to. This overrides the value from the config file."
    )]
    pub connect_port: Option<u16>,

    #[arg(
        long,
        help = "The DevTools websocket URL of a running browser to attach to. This overrides the value from the config file."
    )]
    pub connect_ws: Option<String>,

    #[arg(short = 'u', long, help = "A page to open once the browser is ready.")]
    pub url: Option<String>,
}

pub async fn start() -> anyhow::Result<()> {
    pretty_env_logger::formatted_builder()
        .filter_level(LevelFilter::Info)
        .parse_env("ADWARP_LOG")
        .init();

    let cli = Cli::parse();
    let config = Arc::new(Config::from_cli_args(&cli)?);

    let session = BrowserSession::connect(&config.browser).await?;
    if let Some(url) = &config.browser.open_url {
        session
            .open(url)
            .await
            .context("Failed to open requested page")?;
    }

    let board = StatusBoard::new();
    let registry = MonitorRegistry::new();

    if config.server.enabled {
        let listener = ControlListener::bind(Arc::clone(&config)).await?;
        let server_registry = registry.clone();
        let server_board = board.clone();
        tokio::spawn(async move {
            listener.listen(server_registry, server_board).await;
        });
    }

    let result = watch_browser(&session, &config, &registry, &board).await;
    if let Err(err) = session.close().await {
        log::warn!("Failed to close browser session: {err:#}");
    }
    result
}

/// Keeps exactly one monitor attached to the first open watch page, replacing
/// it when it stops, until the browser goes away or the process is told to
/// shut down.
async fn watch_browser(
    session: &BrowserSession,
    config: &Arc<Config>,
    registry: &MonitorRegistry,
    board: &StatusBoard,
) -> anyhow::Result<()> {
    let scan_interval = Duration::from_millis(config.scheduler.scan_interval_ms.max(1));
    let mut active: Option<MonitorController> = None;
    let mut shutdown = pin!(tokio::signal::ctrl_c());

    let exit = loop {
        if active.as_ref().is_some_and(MonitorController::is_finished) {
            registry.clear();
            active = None;
        }
        if active.is_none() {
            match session.find_watch_page(&config.browser.watch_pattern).await {
                Ok(Some(page)) => {
                    match TabMonitor::attach(page, Arc::clone(config), board.clone()).await {
                        Ok(controller) => {
                            registry.set(controller.handle());
                            active = Some(controller);
                        }
                        Err(err) => log::warn!("Failed to attach to watch page: {err:#}"),
                    }
                }
                Ok(None) => log::debug!("No watch page open"),
                Err(err) => break Err(err).context("Browser connection lost"),
            }
        }

        tokio::select! {
            _ = sleep(scan_interval) => {}
            signal = shutdown.as_mut() => {
                log::info!("Shutting down");
                break signal.context("Failed to listen for shutdown signal");
            }
        }
    };

    if let Some(controller) = active.take() {
        registry.clear();
        if let Err(err) = controller.shutdown().await {
            log::warn!("Monitor did not stop cleanly: {err:#}");
        }
    }
    exit
}
