//! Signal routing
//!
//! SIGTERM and SIGINT cancel the shared job token. A handler that cannot be
//! installed is logged and skipped so the remaining signals still work.

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Spawn a task that cancels `cancel` on the first termination signal.
///
/// The task also exits quietly when the token is cancelled elsewhere.
pub fn spawn_signal_handler(cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            name = wait_for_termination() => {
                info!("Received {}, cancelling job", name);
                cancel.cancel();
            }
            _ = cancel.cancelled() => {}
        }
    })
}

#[cfg(unix)]
async fn wait_for_termination() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!("Failed to install SIGINT handler: {}", e);
            None
        }
    };

    tokio::select! {
        Some(_) = recv(&mut sigterm) => "SIGTERM",
        Some(_) = recv(&mut sigint) => "SIGINT",
        Ok(_) = tokio::signal::ctrl_c() => "SIGINT",
        else => {
            std::future::pending::<()>().await;
            "none"
        }
    }
}

#[cfg(unix)]
async fn recv(signal: &mut Option<tokio::signal::unix::Signal>) -> Option<()> {
    match signal {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() -> &'static str {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
    "ctrl-c"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_handler_exits_when_token_cancelled() {
        let cancel = CancellationToken::new();
        let handle = spawn_signal_handler(cancel.clone());
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_sigterm_cancels_token() {
        let cancel = CancellationToken::new();
        let handle = spawn_signal_handler(cancel.clone());
        // let the handler register before raising
        tokio::time::sleep(Duration::from_millis(100)).await;
        nix::sys::signal::raise(nix::sys::signal::Signal::SIGTERM).unwrap();
        tokio::time::timeout(Duration::from_secs(2), cancel.cancelled())
            .await
            .unwrap();
        handle.await.unwrap();
    }
}
