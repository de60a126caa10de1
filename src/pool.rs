//! A small bounded worker pool.
//!
//! Jobs are moved into worker threads over a crossbeam channel and results
//! come back over another; nothing is shared mutably. The pool is generic
//! over the job and result types so it stays testable on its own; the
//! resolver drives it with final-substitution jobs.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::errors::{ResolveError, Result};

pub struct TaskPool<J, R> {
    job_tx: Option<Sender<J>>,
    result_rx: Receiver<R>,
    workers: Vec<JoinHandle<()>>,
    outstanding: usize,
}

impl<J, R> TaskPool<J, R>
where
    J: Send + 'static,
    R: Send + 'static,
{
    /// Spawn `workers` threads, each running `work` over submitted jobs.
    pub fn new<F>(workers: usize, work: F) -> TaskPool<J, R>
    where
        F: Fn(J) -> R + Send + Sync + 'static,
    {
        let (job_tx, job_rx) = unbounded::<J>();
        let (result_tx, result_rx) = unbounded::<R>();
        let work = Arc::new(work);

        let workers = (0..workers.max(1))
            .map(|_| {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let work = Arc::clone(&work);
                thread::spawn(move || {
                    // The iterator ends when the job sender drops.
                    for job in job_rx.iter() {
                        if result_tx.send(work(job)).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();

        TaskPool {
            job_tx: Some(job_tx),
            result_rx,
            workers,
            outstanding: 0,
        }
    }

    pub fn submit(&mut self, job: J) -> Result<()> {
        let tx = self
            .job_tx
            .as_ref()
            .ok_or_else(|| ResolveError::structural("the worker pool has been closed"))?;
        tx.send(job)
            .map_err(|_| ResolveError::structural("the worker pool has shut down"))?;
        self.outstanding += 1;
        Ok(())
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    /// Wait up to `timeout` for one result. `Ok(None)` means nothing
    /// finished in time; disconnection with jobs outstanding means the
    /// workers died.
    pub fn poll(&mut self, timeout: Duration) -> Result<Option<R>> {
        if self.outstanding == 0 {
            return Ok(None);
        }
        match self.result_rx.recv_timeout(timeout) {
            Ok(result) => {
                self.outstanding -= 1;
                Ok(Some(result))
            }
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(ResolveError::structural(
                "the worker pool shut down with jobs outstanding",
            )),
        }
    }

    /// Signal that no further jobs are coming. Workers exit once the queue
    /// drains.
    pub fn close(&mut self) {
        self.job_tx = None;
    }
}

impl<J, R> Drop for TaskPool<J, R> {
    fn drop(&mut self) {
        self.job_tx = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
