use crate::error::Error;
use flume::Sender;

/// Indefinitely listens to termination signals and sends signal events to the
/// provided channel.
#[cfg(unix)]
pub async fn wait_for_signal(signal_event: &Sender<SignalEvent>) -> Result<(), Error> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigint = signal(SignalKind::interrupt()).map_err(Error::SignalHandler)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(Error::SignalHandler)?;

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                signal_event.send_async(SignalEvent::Interrupt).await?;
            }
            _ = sigterm.recv() => {
                signal_event.send_async(SignalEvent::Terminate).await?;
            }
        }
    }
}

/// Indefinitely listens to console control events and sends signal events to
/// the provided channel.
#[cfg(windows)]
pub async fn wait_for_signal(signal_event: &Sender<SignalEvent>) -> Result<(), Error> {
    use tokio::signal::windows::{ctrl_break, ctrl_c, ctrl_close};

    let mut interrupt = ctrl_c().map_err(Error::SignalHandler)?;
    let mut brk = ctrl_break().map_err(Error::SignalHandler)?;
    let mut close = ctrl_close().map_err(Error::SignalHandler)?;

    loop {
        tokio::select! {
            _ = interrupt.recv() => {
                signal_event.send_async(SignalEvent::Interrupt).await?;
            }
            _ = brk.recv() => {
                signal_event.send_async(SignalEvent::Interrupt).await?;
            }
            _ = close.recv() => {
                signal_event.send_async(SignalEvent::Terminate).await?;
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    Interrupt,
    Terminate,
}
