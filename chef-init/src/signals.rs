use pid1::Reaper;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::orchestrator::Event;

/// Translate process signals into orchestrator events.
///
/// `SIGTERM`/`SIGINT` request shutdown, `SIGUSR1` another chef-client run,
/// `SIGUSR2` credential cleanup followed by shutdown. The task ends once the
/// orchestrator stops listening.
pub fn spawn_event_forwarder(events: mpsc::Sender<Event>) -> JoinHandle<()> {
    // Registered before returning so no signal is lost to the default action.
    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();
    let mut sigusr1 = signal(SignalKind::user_defined1()).ok();
    let mut sigusr2 = signal(SignalKind::user_defined2()).ok();

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = recv_signal(&mut sigterm) => {
                    info!("received SIGTERM, shutting down");
                    Event::Shutdown
                }
                _ = recv_signal(&mut sigint) => {
                    info!("received SIGINT, shutting down");
                    Event::Shutdown
                }
                _ = recv_signal(&mut sigusr1) => {
                    info!("received SIGUSR1, running chef-client");
                    Event::RerunClient
                }
                _ = recv_signal(&mut sigusr2) => {
                    info!("received SIGUSR2, removing credentials and shutting down");
                    Event::ShutdownAndClean
                }
            };
            if events.send(event).await.is_err() {
                return;
            }
        }
    })
}

/// Reap exited orphans now and again whenever `SIGCHLD` arrives.
///
/// Statuses of registered children stay in the pending table for their
/// owners; only unowned orphans are discarded.
pub fn spawn_orphan_sweeper(reaper: Reaper) -> JoinHandle<()> {
    let mut sigchld = signal(SignalKind::child()).ok();
    tokio::spawn(async move {
        // Catch orphans that exited before the handler was installed.
        sweep(&reaper).await;
        loop {
            recv_signal(&mut sigchld).await;
            sweep(&reaper).await;
        }
    })
}

async fn sweep(reaper: &Reaper) {
    let reaper = reaper.clone();
    match tokio::task::spawn_blocking(move || reaper.reap_available()).await {
        Ok(0) => {}
        Ok(reaped) => debug!(reaped, "swept exited children"),
        Err(e) => debug!(error = %e, "orphan sweep failed"),
    }
}

async fn recv_signal(sig: &mut Option<Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
