use clap::Parser;
use divert_rs::{cli::Cli, error::Error, services, signals::wait_for_signal};
use engine::DiversionEngine;
use flume::bounded;
use std::{
    fs::OpenOptions,
    io::{self, Write},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_log::AsTrace;
use tracing_subscriber::EnvFilter;

fn init_tracing(cli: &Cli) -> Result<(), Error> {
    let filter = EnvFilter::builder()
        .with_default_directive(cli.verbosity.log_level_filter().as_trace().into())
        .from_env_lossy();
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_level(true)
        .with_file(true)
        .with_line_number(true);

    match &cli.logfile {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| Error::LogFile {
                    path: path.clone(),
                    source,
                })?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(io::stderr).init(),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli)?;

    debug!(config = ?cli);

    let config = cli.load_config()?;
    if cli.dump_config {
        io::stdout().write_all(config.to_toml()?.as_bytes())?;
        return Ok(());
    }
    config.validate()?;

    let engine = DiversionEngine::start(config, services::system()?).await?;
    let cancel = CancellationToken::new();
    let mut running = tokio::spawn(engine.run_until(cancel.clone()));

    let (events_tx, events_rx) = bounded(8);

    loop {
        tokio::select! {
            res = &mut running => {
                res??;
                return Ok(());
            }
            err = wait_for_signal(&events_tx) => {
                tracing::error!(error = ?err, "Error while waiting for signal");
                err?;
            }
            res = events_rx.recv_async() => {
                let event = res?;
                info!(?event, "stopping diversion");
                break;
            }
        }
    }

    cancel.cancel();
    running.await??;
    Ok(())
}
