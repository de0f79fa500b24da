mod config;
mod server;

use std::{
    env, process,
    str::FromStr,
    sync::{mpsc, Arc},
};

use config::{AppConfig, ConfigError, Environment};
use log::info;
use probe_service::{ProbeRunner, ProbeService, SpeedProbe};
use server::ApiServer;
use speed_store::SpeedStore;
use thiserror::Error;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        eprintln!("speedlogd failed: {err}");
        process::exit(1);
    }
}

fn run() -> Result<(), AppError> {
    let config = {
        let env = parse_environment()?;
        AppConfig::load(env)?
    };
    info!(
        "speedlogd booted in {} mode; log file at {}",
        config.env_label(),
        config.log_path.display()
    );
    info!(
        "probe: url={}, interval={:?}, duration_cap={:?}",
        config.probe.test_url, config.probe.interval, config.probe.max_test_duration
    );

    let store = Arc::new(SpeedStore::new(&config.log_path));
    let client = reqwest::Client::builder()
        .timeout(config.probe.request_timeout)
        .build()?;
    let probe = SpeedProbe::new(client, config.probe.test_url, config.probe.max_test_duration);
    let service = Arc::new(ProbeService::new(probe, Arc::clone(&store)));

    let api = ApiServer::start(Arc::clone(&store), Arc::clone(&service), config.listen_addr);
    let runner = ProbeRunner::start(Arc::clone(&service), config.probe.interval);
    info!("speedlogd is running; press Ctrl+C to shut down");

    wait_for_shutdown_signal()?;
    info!("shutdown signal received; stopping services...");
    runner.shutdown();
    api.shutdown();
    Ok(())
}

fn parse_environment() -> Result<Environment, AppError> {
    let arg = env::args().nth(1).ok_or(AppError::Usage)?;
    Environment::from_str(&arg).map_err(AppError::from)
}

#[derive(Debug, Error)]
enum AppError {
    #[error("usage: speedlogd <dev|prod>")]
    Usage,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
    #[error("failed to install signal handler: {0}")]
    Signal(#[from] ctrlc::Error),
    #[error("failed while waiting for shutdown signal: {0}")]
    ShutdownWait(#[from] mpsc::RecvError),
}

fn wait_for_shutdown_signal() -> Result<(), AppError> {
    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    rx.recv()?;
    Ok(())
}
