//! Restore service: the queue actor plus its dedicated worker thread.
//!
//! The actor task owns the [`RestoreQueue`] and processes one command at a
//! time. Restores run on a separate OS thread with its own current-thread
//! runtime, so every statement of every job comes from the same thread and
//! reuses that thread's database connection.

use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use super::{DispatchedJob, RestoreQueue};
use crate::catalog::BackupFileDescriptor;
use crate::db::connector::DbConnector;
use crate::events::{EventBus, RestoreEvent};
use crate::restore::{RestoreEngine, RestoreOutcome, RestoreSettings};

const WORKER_THREAD_NAME: &str = "restore-worker";

enum ServiceCommand {
    QueueRestores {
        candidates: Vec<BackupFileDescriptor>,
        reply: oneshot::Sender<usize>,
    },
    CancelRestore {
        reply: oneshot::Sender<bool>,
    },
    DeleteQueue {
        reply: oneshot::Sender<usize>,
    },
}

/// Cloneable front door to a running restore service.
#[derive(Clone)]
pub struct RestoreServiceHandle {
    commands: mpsc::UnboundedSender<ServiceCommand>,
    events: EventBus<RestoreEvent>,
}

impl RestoreServiceHandle {
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RestoreEvent> {
        self.events.subscribe()
    }

    /// Queue a batch. Returns how many candidates were accepted; when that
    /// is 0 no batch-complete event will follow.
    pub async fn queue_restores(&self, candidates: Vec<BackupFileDescriptor>) -> usize {
        self.request(|reply| ServiceCommand::QueueRestores { candidates, reply })
            .await
            .unwrap_or(0)
    }

    /// Cancel the restore in flight. Returns whether one was running.
    pub async fn cancel_restore(&self) -> bool {
        self.request(|reply| ServiceCommand::CancelRestore { reply })
            .await
            .unwrap_or(false)
    }

    /// Drop the jobs that have not started. Returns how many were dropped.
    pub async fn delete_queue(&self) -> usize {
        self.request(|reply| ServiceCommand::DeleteQueue { reply })
            .await
            .unwrap_or(0)
    }

    async fn request<T, F>(&self, command: F) -> Option<T>
    where
        F: FnOnce(oneshot::Sender<T>) -> ServiceCommand,
    {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(command(tx)).is_err() {
            warn!("Restore service is not running");
            return None;
        }
        rx.await.ok()
    }
}

pub struct RestoreService {
    queue: RestoreQueue,
    commands: mpsc::UnboundedReceiver<ServiceCommand>,
    finished: mpsc::UnboundedReceiver<RestoreOutcome>,
}

impl RestoreService {
    /// Start the worker thread and the actor task. Must be called from
    /// within a tokio runtime.
    pub fn start(
        connector: Arc<DbConnector>,
        settings: RestoreSettings,
    ) -> std::io::Result<RestoreServiceHandle> {
        let events = EventBus::new();
        let engine = RestoreEngine::new(connector, settings, events.clone());

        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        RestoreWorker::spawn(engine, dispatch_rx, finished_tx)?;

        let service = Self {
            queue: RestoreQueue::new(events.clone(), dispatch_tx),
            commands: command_rx,
            finished: finished_rx,
        };
        tokio::spawn(service.run());

        Ok(RestoreServiceHandle {
            commands: command_tx,
            events,
        })
    }

    async fn run(mut self) {
        debug!("Restore service started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle(command),
                    None => break,
                },
                outcome = self.finished.recv() => match outcome {
                    Some(outcome) => self.queue.job_finished(outcome),
                    None => {
                        error!("Restore worker stopped unexpectedly");
                        break;
                    }
                },
            }
        }
        debug!("Restore service stopped");
    }

    fn handle(&mut self, command: ServiceCommand) {
        match command {
            ServiceCommand::QueueRestores { candidates, reply } => {
                let _ = reply.send(self.queue.queue_restores(candidates));
            }
            ServiceCommand::CancelRestore { reply } => {
                let _ = reply.send(self.queue.cancel_restore());
            }
            ServiceCommand::DeleteQueue { reply } => {
                let _ = reply.send(self.queue.delete_queue());
            }
        }
    }
}

/// Runs dispatched jobs one at a time on a dedicated thread.
pub struct RestoreWorker;

impl RestoreWorker {
    pub fn spawn(
        engine: RestoreEngine,
        jobs: mpsc::UnboundedReceiver<DispatchedJob>,
        finished: mpsc::UnboundedSender<RestoreOutcome>,
    ) -> std::io::Result<std::thread::JoinHandle<()>> {
        std::thread::Builder::new()
            .name(WORKER_THREAD_NAME.to_string())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!("Failed to start restore worker runtime: {}", e);
                        return;
                    }
                };
                runtime.block_on(Self::run(engine, jobs, finished));
            })
    }

    async fn run(
        engine: RestoreEngine,
        mut jobs: mpsc::UnboundedReceiver<DispatchedJob>,
        finished: mpsc::UnboundedSender<RestoreOutcome>,
    ) {
        info!("Restore worker started");
        while let Some(job) = jobs.recv().await {
            let outcome = engine.restore(job.descriptor, &job.cancel).await;
            if finished.send(outcome).is_err() {
                break;
            }
        }
        info!("Restore worker stopped");
    }
}
