use std::process::ExitCode;

mod app;
mod browser;
mod config;
mod control;
mod controller;
mod detector;
mod dom;
mod messages;
mod monitor;
mod page;

#[tokio::main]
async fn main() -> ExitCode {
    let result = app::start().await;
    match result {
        Ok(..) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{err:?}");
            ExitCode::FAILURE
        }
    }
}
