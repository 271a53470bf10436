//! Signal handling for graceful node shutdown.
//!
//! Cross-platform wait for the termination signals that should drain and
//! stop the node.

use anyhow::Result;
use tokio::signal;
use tracing::info;

/// Waits for a termination signal.
///
/// Listens for SIGINT and SIGTERM on Unix, Ctrl+C on Windows, and returns
/// once one is received so the caller can run its shutdown sequence.
pub async fn setup_signal_handlers() -> Result<()> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => {
                info!("received SIGINT");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM");
            }
        }
    }

    #[cfg(windows)]
    {
        signal::ctrl_c().await?;
        info!("received Ctrl+C");
    }

    Ok(())
}
