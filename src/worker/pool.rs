use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use log::{debug, error, info};

use crate::error::{Error, Result};

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of threads running submitted closures.
pub struct WorkerPool {
    task_sender: Sender<Task>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

/// Receives the result of one submitted task.
pub struct TaskHandle<T> {
    receiver: Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Blocks until the task finishes. Fails if it was dropped unrun or panicked.
    pub fn wait(self) -> Result<T> {
        self.receiver.recv().map_err(|_| Error::WorkerClosed)
    }
}

impl WorkerPool {
    /// A zero count still starts one worker.
    pub fn new(worker_count: usize) -> Self {
        let worker_count = worker_count.max(1);
        let (task_sender, task_receiver) = bounded::<Task>(worker_count * 2);
        let shutdown = Arc::new(AtomicBool::new(false));

        let workers = (0..worker_count)
            .map(|worker_id| {
                let rx = task_receiver.clone();
                let shutdown_flag = Arc::clone(&shutdown);
                thread::spawn(move || run_worker(worker_id, rx, shutdown_flag))
            })
            .collect();

        info!("started {worker_count} workers");

        Self {
            task_sender,
            workers,
            shutdown,
        }
    }

    pub fn submit<T, F>(&self, f: F) -> Result<TaskHandle<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_shutdown() {
            return Err(Error::WorkerClosed);
        }

        let (result_tx, result_rx) = bounded(1);
        let task: Task = Box::new(move || {
            // the caller may have dropped its handle
            let _ = result_tx.send(f());
        });
        self.task_sender
            .send(task)
            .map_err(|_| Error::WorkerClosed)?;
        Ok(TaskHandle {
            receiver: result_rx,
        })
    }

    pub fn shutdown(&self) {
        info!("shutting down worker pool");
        self.shutdown.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Lets queued tasks drain, then joins every worker.
    pub fn wait(self) {
        drop(self.task_sender);

        for (i, worker) in self.workers.into_iter().enumerate() {
            if let Err(e) = worker.join() {
                error!("worker {i} panicked: {e:?}");
            } else {
                debug!("worker {i} finished");
            }
        }
    }
}

fn run_worker(worker_id: usize, tasks: Receiver<Task>, shutdown: Arc<AtomicBool>) {
    debug!("worker {worker_id} started");

    loop {
        if shutdown.load(Ordering::Relaxed) {
            debug!("worker {worker_id} received shutdown signal");
            break;
        }

        match tasks.recv_timeout(Duration::from_millis(100)) {
            Ok(task) => task(),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    debug!("worker {worker_id} stopped");
}
