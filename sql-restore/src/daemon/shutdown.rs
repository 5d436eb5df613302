//! SIGTERM/SIGINT handling for a running batch.
//!
//! A signal cancels the restore in flight and drops the jobs that have not
//! started. The in-flight job still reaches its next safe point, so no
//! database is left in single-user mode.

use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::queue::service::RestoreServiceHandle;

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    shutdown_tx: broadcast::Sender<()>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self { shutdown_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Wait for SIGINT or SIGTERM, then broadcast it.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to install Ctrl+C handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT (Ctrl+C), stopping restores"),
            _ = terminate => info!("Received SIGTERM, stopping restores"),
        }

        self.trigger();
    }

    /// Broadcast shutdown to every subscriber.
    pub fn trigger(&self) {
        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to broadcast shutdown signal: {}", e);
        }
    }

    /// Cancel the in-flight restore and clear the pending queue.
    pub async fn stop_restores(&self, service: &RestoreServiceHandle) {
        let dropped = service.delete_queue().await;
        let cancelled = service.cancel_restore().await;
        info!(dropped, cancelled, "Restore batch interrupted");
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::BackupFileDescriptor;
    use crate::db::connector::DbConnector;
    use crate::db::fake::{FakeDriver, FakeServer};
    use crate::events::RestoreEvent;
    use crate::queue::service::RestoreService;
    use crate::restore::RestoreSettings;
    use std::sync::mpsc as std_mpsc;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_shutdown_coordinator() {
        let coordinator = ShutdownCoordinator::new();
        let mut rx = coordinator.subscribe();

        let handle = tokio::spawn(async move {
            rx.recv().await.ok();
        });

        coordinator.trigger();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_restores_cancels_and_clears() {
        let server = FakeServer::with_backup("13.0", &[(1, "Sales", 12)]);
        let (started_tx, started_rx) = std_mpsc::channel::<()>();
        let (release_tx, release_rx) = std_mpsc::channel::<()>();
        let release_rx = Mutex::new(release_rx);
        server.on_statement(r"RESTORE HEADERONLY FROM DISK = N'\\backup\share\a.bak'", move || {
            let _ = started_tx.send(());
            let _ = release_rx.lock().unwrap().recv();
        });

        let dir = TempDir::new().unwrap();
        let mut settings = RestoreSettings {
            local_path: dir.path().to_string_lossy().to_string(),
            remote_path: r"\\backup\share".to_string(),
            ..Default::default()
        };
        settings.connection.driver = "tds".to_string();
        settings.connection.odbc_driver = "ODBC Driver 17 for SQL Server".to_string();
        settings.connection.server = "sql01".to_string();
        settings.connection.trusted_connection = true;

        let connector = Arc::new(DbConnector::new(Arc::new(FakeDriver::new(server.clone()))));
        let service = RestoreService::start(connector, settings).unwrap();
        let mut events = service.subscribe();

        let files = ["a.bak", "b.bak"]
            .iter()
            .map(|n| BackupFileDescriptor::new(*n, 10, false))
            .collect();
        assert_eq!(service.queue_restores(files).await, 2);
        tokio::task::spawn_blocking(move || started_rx.recv())
            .await
            .unwrap()
            .unwrap();

        ShutdownCoordinator::new().stop_restores(&service).await;
        release_tx.send(()).unwrap();

        let wait = async {
            while let Some(event) = events.recv().await {
                if let RestoreEvent::BatchComplete { outcomes } = event {
                    return outcomes;
                }
            }
            Vec::new()
        };
        let outcomes = tokio::time::timeout(Duration::from_secs(10), wait).await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].errors, vec!["Restore cancelled.".to_string()]);
        assert!(server.statements_starting_with("RESTORE DATABASE").is_empty());
    }
}
