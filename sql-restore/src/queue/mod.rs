//! FIFO restore scheduling.
//!
//! `RestoreQueue` is a plain state machine: it decides when the next job is
//! handed to the worker and keeps the batch counters. It never runs a
//! restore itself. [`service`] wires it to the worker and the outside world.
//!
//! Queueing a new batch while a job is in flight replaces the pending jobs
//! but not the running one. That job still belongs to the batch that queued
//! it: when it finishes, the superseded batch completes with the outcomes it
//! collected, and only then does the new batch start.

pub mod service;

use std::collections::VecDeque;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::catalog::BackupFileDescriptor;
use crate::events::{EventBus, RestoreEvent};
use crate::restore::RestoreOutcome;

/// A job handed to the worker, with the token that cancels only this job.
#[derive(Debug)]
pub struct DispatchedJob {
    pub descriptor: BackupFileDescriptor,
    pub cancel: CancellationToken,
}

pub struct RestoreQueue {
    batch: u64,
    in_flight_batch: Option<u64>,
    queue: VecDeque<BackupFileDescriptor>,
    jobs_total: usize,
    jobs_complete: usize,
    jobs_remaining: usize,
    jobs_current: usize,
    in_progress: bool,
    current_cancel: Option<CancellationToken>,
    outcomes: Vec<RestoreOutcome>,
    /// Outcomes of a batch replaced while its last job was running.
    superseded: Vec<RestoreOutcome>,
    events: EventBus<RestoreEvent>,
    dispatch: mpsc::UnboundedSender<DispatchedJob>,
}

impl RestoreQueue {
    pub fn new(events: EventBus<RestoreEvent>, dispatch: mpsc::UnboundedSender<DispatchedJob>) -> Self {
        Self {
            batch: 0,
            in_flight_batch: None,
            queue: VecDeque::new(),
            jobs_total: 0,
            jobs_complete: 0,
            jobs_remaining: 0,
            jobs_current: 0,
            in_progress: false,
            current_cancel: None,
            outcomes: Vec::new(),
            superseded: Vec::new(),
            events,
            dispatch,
        }
    }

    /// Replace the pending queue with the valid `candidates` and start the
    /// first one if nothing is running. Returns the number queued.
    pub fn queue_restores(&mut self, candidates: Vec<BackupFileDescriptor>) -> usize {
        if self.in_flight_batch == Some(self.batch) {
            self.superseded = std::mem::take(&mut self.outcomes);
        } else {
            self.outcomes.clear();
        }
        self.batch += 1;

        self.jobs_total = 0;
        self.jobs_complete = 0;
        self.jobs_current = 0;
        self.queue.clear();

        for candidate in candidates {
            if !candidate.is_valid() {
                debug!(file = ?candidate.filename, "Skipping invalid restore candidate");
                continue;
            }
            self.jobs_total += 1;
            self.queue.push_back(candidate);
        }

        info!(batch = self.batch, jobs = self.jobs_total, "Queued restores");
        if self.jobs_total > 1 {
            self.events.emit(RestoreEvent::ProgressAllMax(self.jobs_total));
        }

        let queued = self.jobs_total;
        self.flush_queue();
        queued
    }

    /// Start the next job when one is waiting and none is in flight.
    pub fn flush_queue(&mut self) {
        if self.jobs_remaining != 0 {
            return;
        }
        if let Some(descriptor) = self.queue.pop_front() {
            self.start(descriptor);
        }
    }

    /// Cancel the in-flight job only. Returns whether one was running.
    pub fn cancel_restore(&mut self) -> bool {
        match &self.current_cancel {
            Some(token) => {
                info!("Cancelling current restore");
                token.cancel();
                true
            }
            None => {
                debug!("No restore in flight, nothing to cancel");
                false
            }
        }
    }

    /// Drop every job that has not started yet. Returns how many were dropped.
    pub fn delete_queue(&mut self) -> usize {
        let dropped = self.queue.len();
        self.queue.clear();
        if dropped > 0 {
            info!(jobs = dropped, "Cleared restore queue");
        }
        dropped
    }

    /// Record a finished job and advance the queue.
    pub fn job_finished(&mut self, outcome: RestoreOutcome) {
        self.current_cancel = None;
        self.jobs_remaining = self.jobs_remaining.saturating_sub(1);

        let batch = self.in_flight_batch.take();
        if batch != Some(self.batch) {
            self.superseded_job_finished(batch, outcome);
            return;
        }

        self.jobs_complete += 1;

        if self.jobs_total > 1 {
            self.events.emit(RestoreEvent::ProgressAll(self.jobs_complete));
        }
        self.outcomes.push(outcome);

        if self.jobs_remaining == 0 && self.queue.is_empty() {
            self.in_progress = false;
            let outcomes = std::mem::take(&mut self.outcomes);
            let failed = outcomes.iter().filter(|o| !o.success).count();
            info!(jobs = outcomes.len(), failed, "Restore batch complete");
            self.events.emit(RestoreEvent::BatchComplete { outcomes });
        } else {
            self.flush_queue();
        }
    }

    /// Close out the batch the finished job was queued with, then start the
    /// batch that replaced it.
    fn superseded_job_finished(&mut self, batch: Option<u64>, outcome: RestoreOutcome) {
        let mut outcomes = std::mem::take(&mut self.superseded);
        outcomes.push(outcome);
        let failed = outcomes.iter().filter(|o| !o.success).count();
        info!(batch = ?batch, jobs = outcomes.len(), failed, "Superseded restore batch complete");
        self.events.emit(RestoreEvent::BatchComplete { outcomes });

        if self.queue.is_empty() {
            self.in_progress = false;
        } else {
            self.flush_queue();
        }
    }

    fn start(&mut self, descriptor: BackupFileDescriptor) {
        self.in_progress = true;
        self.in_flight_batch = Some(self.batch);
        self.jobs_remaining += 1;
        self.jobs_current += 1;

        if self.jobs_total > 1 {
            self.events.emit(RestoreEvent::HeaderAll(format!(
                "Restoring backup {} of {}.",
                self.jobs_current, self.jobs_total
            )));
        }

        let cancel = CancellationToken::new();
        self.current_cancel = Some(cancel.clone());
        let filename = descriptor.filename.clone();
        debug!(file = %filename, "Dispatching restore");

        if self.dispatch.send(DispatchedJob { descriptor, cancel }).is_err() {
            error!(file = %filename, "Restore worker is not running");
            self.job_finished(RestoreOutcome {
                filename,
                success: false,
                errors: vec!["Restore worker is not running.".to_string()],
            });
        }
    }

    pub fn jobs_total(&self) -> usize {
        self.jobs_total
    }

    pub fn jobs_complete(&self) -> usize {
        self.jobs_complete
    }

    pub fn jobs_remaining(&self) -> usize {
        self.jobs_remaining
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        queue: RestoreQueue,
        jobs: mpsc::UnboundedReceiver<DispatchedJob>,
        events: mpsc::UnboundedReceiver<RestoreEvent>,
    }

    impl Harness {
        fn new() -> Self {
            let bus = EventBus::new();
            let events = bus.subscribe();
            let (tx, jobs) = mpsc::unbounded_channel();
            Self {
                queue: RestoreQueue::new(bus, tx),
                jobs,
                events,
            }
        }

        fn next_job(&mut self) -> Option<DispatchedJob> {
            self.jobs.try_recv().ok()
        }

        fn finish(&mut self, job: &DispatchedJob, success: bool) {
            self.queue.job_finished(RestoreOutcome {
                filename: job.descriptor.filename.clone(),
                success,
                errors: if success { vec![] } else { vec!["failed".to_string()] },
            });
        }

        fn drain(&mut self) -> Vec<RestoreEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }
    }

    fn files(names: &[&str]) -> Vec<BackupFileDescriptor> {
        names
            .iter()
            .map(|n| BackupFileDescriptor::new(*n, 10, false))
            .collect()
    }

    #[test]
    fn test_jobs_run_one_at_a_time_in_fifo_order() {
        let mut h = Harness::new();
        assert_eq!(h.queue.queue_restores(files(&["a.bak", "b.bak", "c.bak"])), 3);

        let mut order = Vec::new();
        while let Some(job) = h.next_job() {
            assert_eq!(h.queue.jobs_remaining(), 1);
            // Nothing else is dispatched while a job is in flight.
            assert!(h.next_job().is_none());
            order.push(job.descriptor.filename.clone());
            h.finish(&job, true);
            assert!(h.queue.jobs_remaining() <= 1);
        }

        assert_eq!(order, vec!["a.bak", "b.bak", "c.bak"]);
        assert_eq!(h.queue.jobs_remaining(), 0);
        assert_eq!(h.queue.jobs_complete(), 3);
        assert!(!h.queue.in_progress());
    }

    #[test]
    fn test_batch_events() {
        let mut h = Harness::new();
        h.queue.queue_restores(files(&["a.bak", "b.bak"]));
        let a = h.next_job().unwrap();
        h.finish(&a, false);
        let b = h.next_job().unwrap();
        h.finish(&b, true);

        let events = h.drain();
        assert_eq!(
            events,
            vec![
                RestoreEvent::ProgressAllMax(2),
                RestoreEvent::HeaderAll("Restoring backup 1 of 2.".to_string()),
                RestoreEvent::ProgressAll(1),
                RestoreEvent::HeaderAll("Restoring backup 2 of 2.".to_string()),
                RestoreEvent::ProgressAll(2),
                RestoreEvent::BatchComplete {
                    outcomes: vec![
                        RestoreOutcome {
                            filename: "a.bak".to_string(),
                            success: false,
                            errors: vec!["failed".to_string()],
                        },
                        RestoreOutcome {
                            filename: "b.bak".to_string(),
                            success: true,
                            errors: vec![],
                        },
                    ]
                },
            ]
        );
    }

    #[test]
    fn test_single_job_emits_no_batch_progress() {
        let mut h = Harness::new();
        h.queue.queue_restores(files(&["a.bak"]));
        let a = h.next_job().unwrap();
        h.finish(&a, true);

        let events = h.drain();
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], RestoreEvent::BatchComplete { outcomes } if outcomes.len() == 1));
    }

    #[test]
    fn test_invalid_candidates_are_skipped() {
        let mut h = Harness::new();
        let queued = h.queue.queue_restores(files(&["", "a.bak", ""]));
        assert_eq!(queued, 1);
        assert_eq!(h.queue.jobs_total(), 1);
        assert_eq!(h.next_job().unwrap().descriptor.filename, "a.bak");
    }

    #[test]
    fn test_cancel_targets_only_in_flight_job() {
        let mut h = Harness::new();
        h.queue.queue_restores(files(&["a.bak", "b.bak"]));

        let a = h.next_job().unwrap();
        assert!(h.queue.cancel_restore());
        assert!(a.cancel.is_cancelled());

        h.finish(&a, false);
        let b = h.next_job().unwrap();
        assert!(!b.cancel.is_cancelled());
        h.finish(&b, true);

        // Idle: nothing to cancel.
        assert!(!h.queue.cancel_restore());
    }

    #[test]
    fn test_delete_queue_keeps_in_flight_job() {
        let mut h = Harness::new();
        h.queue.queue_restores(files(&["a.bak", "b.bak", "c.bak"]));
        let a = h.next_job().unwrap();

        assert_eq!(h.queue.delete_queue(), 2);
        assert_eq!(h.queue.pending(), 0);
        assert!(h.queue.in_progress());

        h.finish(&a, true);
        assert!(h.next_job().is_none());
        assert!(!h.queue.in_progress());
        assert!(h
            .drain()
            .iter()
            .any(|e| matches!(e, RestoreEvent::BatchComplete { outcomes } if outcomes.len() == 1)));
    }

    #[test]
    fn test_queueing_while_busy_waits_for_current_job() {
        let mut h = Harness::new();
        h.queue.queue_restores(files(&["a.bak"]));
        let a = h.next_job().unwrap();

        h.queue.queue_restores(files(&["b.bak"]));
        assert!(h.next_job().is_none());

        h.finish(&a, true);
        assert_eq!(h.next_job().unwrap().descriptor.filename, "b.bak");
    }

    fn batch_filenames(events: &[RestoreEvent]) -> Vec<Vec<String>> {
        events
            .iter()
            .filter_map(|e| match e {
                RestoreEvent::BatchComplete { outcomes } => {
                    Some(outcomes.iter().map(|o| o.filename.clone()).collect())
                }
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_new_batch_does_not_absorb_running_job() {
        let mut h = Harness::new();
        h.queue.queue_restores(files(&["a.bak"]));
        let a = h.next_job().unwrap();

        assert_eq!(h.queue.queue_restores(files(&["b.bak", "c.bak"])), 2);
        h.finish(&a, true);
        assert_eq!(h.queue.jobs_complete(), 0);

        let b = h.next_job().unwrap();
        h.finish(&b, true);
        let c = h.next_job().unwrap();
        h.finish(&c, false);
        assert!(h.next_job().is_none());
        assert_eq!(h.queue.jobs_complete(), 2);
        assert!(!h.queue.in_progress());

        let events = h.drain();
        assert_eq!(
            batch_filenames(&events),
            vec![
                vec!["a.bak".to_string()],
                vec!["b.bak".to_string(), "c.bak".to_string()],
            ]
        );

        let max = events
            .iter()
            .find_map(|e| match e {
                RestoreEvent::ProgressAllMax(n) => Some(*n),
                _ => None,
            })
            .unwrap();
        let progress: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                RestoreEvent::ProgressAll(n) => Some(*n),
                _ => None,
            })
            .collect();
        assert_eq!(max, 2);
        assert_eq!(progress, vec![1, 2]);
    }

    #[test]
    fn test_superseded_batch_keeps_its_finished_outcomes() {
        let mut h = Harness::new();
        h.queue.queue_restores(files(&["a.bak", "b.bak", "c.bak"]));
        let a = h.next_job().unwrap();
        h.finish(&a, true);
        let b = h.next_job().unwrap();

        // Replaces c.bak; b.bak is still running.
        h.queue.queue_restores(files(&["d.bak"]));
        h.finish(&b, false);

        let d = h.next_job().unwrap();
        assert_eq!(d.descriptor.filename, "d.bak");
        h.finish(&d, true);

        assert_eq!(
            batch_filenames(&h.drain()),
            vec![
                vec!["a.bak".to_string(), "b.bak".to_string()],
                vec!["d.bak".to_string()],
            ]
        );
    }

    #[test]
    fn test_empty_batch_while_busy_still_completes_running_batch() {
        let mut h = Harness::new();
        h.queue.queue_restores(files(&["a.bak"]));
        let a = h.next_job().unwrap();

        assert_eq!(h.queue.queue_restores(files(&[""])), 0);
        h.finish(&a, true);

        assert!(h.next_job().is_none());
        assert!(!h.queue.in_progress());
        assert_eq!(batch_filenames(&h.drain()), vec![vec!["a.bak".to_string()]]);
    }

    #[test]
    fn test_dead_worker_fails_jobs_without_stalling() {
        let bus = EventBus::new();
        let mut events = bus.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut queue = RestoreQueue::new(bus, tx);

        queue.queue_restores(files(&["a.bak", "b.bak"]));
        assert!(!queue.in_progress());

        let mut complete = None;
        while let Ok(event) = events.try_recv() {
            if let RestoreEvent::BatchComplete { outcomes } = event {
                complete = Some(outcomes);
            }
        }
        let outcomes = complete.unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| !o.success));
    }
}
