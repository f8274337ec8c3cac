use tokio::signal;
#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal as unix_signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Resolves on SIGINT, or SIGTERM on unix, and names the signal.
pub async fn shutdown_signal() -> std::io::Result<&'static str> {
    #[cfg(unix)]
    {
        let mut sigterm = unix_signal(SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => result.map(|()| "SIGINT"),
            _ = sigterm.recv() => Ok("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.map(|()| "SIGINT")
    }
}

/// Cancels `token` when a shutdown signal arrives.
pub fn spawn_signal_listener(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            received = shutdown_signal() => match received {
                Ok(name) => {
                    info!("Received {}, initiating graceful shutdown", name);
                    token.cancel();
                }
                Err(err) => error!("Failed to listen for shutdown signals: {}", err),
            },
            () = token.cancelled() => {}
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_listener_exits_when_token_cancelled() {
        let token = CancellationToken::new();
        let listener = spawn_signal_listener(token.clone());
        token.cancel();
        assert!(listener.await.is_ok());
    }
}
