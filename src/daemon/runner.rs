//! Daemon event loop

use super::{DaemonCommand, DaemonConfig, DaemonEvent};
use crate::dep::DepService;
use crate::Result;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

pub struct AssignerDaemon {
    service: Arc<DepService>,
    config: DaemonConfig,
    event_tx: broadcast::Sender<DaemonEvent>,
    command_tx: mpsc::Sender<DaemonCommand>,
    command_rx: Option<mpsc::Receiver<DaemonCommand>>,
}

impl AssignerDaemon {
    pub fn new(service: Arc<DepService>, config: DaemonConfig) -> Self {
        let (event_tx, _) = broadcast::channel(config.event_channel_capacity);
        let (command_tx, command_rx) = mpsc::channel(10);
        Self {
            service,
            config,
            event_tx,
            command_tx,
            command_rx: Some(command_rx),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.event_tx.subscribe()
    }

    pub fn command_sender(&self) -> mpsc::Sender<DaemonCommand> {
        self.command_tx.clone()
    }

    fn send_event(&self, event: DaemonEvent) {
        // No subscribers is normal
        if self.event_tx.send(event).is_err() {
            debug!("No daemon event subscribers");
        }
    }

    /// Run passes until shutdown. The first pass starts immediately.
    pub async fn run(&mut self) -> Result<()> {
        let mut command_rx = self
            .command_rx
            .take()
            .ok_or_else(|| crate::AssignerError::Config("Daemon already running".to_string()))?;

        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = shutdown_signal(self.config.handle_signals);
        tokio::pin!(shutdown);

        info!(
            interval_secs = self.config.interval.as_secs(),
            "Assigner daemon started"
        );
        self.send_event(DaemonEvent::Started);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.run_pass().await;
                }
                cmd = command_rx.recv() => match cmd {
                    Some(DaemonCommand::RunNow) => {
                        info!("Pass requested");
                        self.run_pass().await;
                        interval.reset();
                    }
                    Some(DaemonCommand::Shutdown) | None => {
                        info!("Shutdown requested");
                        break;
                    }
                },
                _ = &mut shutdown => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        self.send_event(DaemonEvent::Stopped);
        info!("Assigner daemon stopped");
        Ok(())
    }

    async fn run_pass(&self) {
        self.send_event(DaemonEvent::PassStarted);
        match self.service.run_assigner().await {
            Ok(summary) => {
                if !summary.errors.is_empty() {
                    warn!(errors = ?summary.errors, "Pass finished with errors");
                }
                self.send_event(DaemonEvent::PassCompleted(summary));
            }
            Err(e) => {
                // The next tick retries
                error!(error = %e, "Assigner pass failed");
                self.send_event(DaemonEvent::PassFailed(e.to_string()));
            }
        }
    }
}

/// Resolves on SIGINT (and SIGTERM on unix); never when disabled
async fn shutdown_signal(enabled: bool) {
    if !enabled {
        return std::future::pending().await;
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to set up SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
