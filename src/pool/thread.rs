//! Thread-backed worker pool.

use super::{panic_message, Job, PoolError, Task, TaskHandle, WorkerPool};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{mpsc, Arc, Mutex};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// N OS threads pulling from one queue and sharing one context.
pub struct ThreadPool<T: Task> {
    sender: Option<mpsc::Sender<Job<T>>>,
    threads: Vec<JoinHandle<()>>,
    workers: usize,
}

impl<T: Task> ThreadPool<T> {
    pub fn new(workers: usize, ctx: T::Context) -> Result<Self, PoolError> {
        if workers == 0 {
            return Err(PoolError::NoWorkers);
        }

        let (sender, receiver) = mpsc::channel::<Job<T>>();
        let receiver = Arc::new(Mutex::new(receiver));
        let ctx = Arc::new(ctx);
        let mut threads = Vec::with_capacity(workers);

        for worker_id in 0..workers {
            let receiver = Arc::clone(&receiver);
            let ctx = Arc::clone(&ctx);
            let handle = thread::Builder::new()
                .name(format!("worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &receiver, &ctx))
                .map_err(PoolError::Spawn)?;
            threads.push(handle);
        }

        debug!(workers, "Thread pool started");
        Ok(Self {
            sender: Some(sender),
            threads,
            workers,
        })
    }
}

fn worker_loop<T: Task>(worker_id: usize, receiver: &Mutex<mpsc::Receiver<Job<T>>>, ctx: &T::Context) {
    loop {
        let job = {
            let guard = match receiver.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            guard.recv()
        };

        let Ok(job) = job else {
            // Sender dropped and queue drained
            break;
        };

        let Job { task, reply } = job;
        let result = panic::catch_unwind(AssertUnwindSafe(|| task.run(ctx))).map_err(|payload| {
            let msg = panic_message(payload.as_ref());
            error!(worker = worker_id, panic = %msg, "Task panicked");
            PoolError::Panicked(msg)
        });

        // Submitter may have dropped its handle
        let _ = reply.send(result);
    }
    debug!(worker = worker_id, "Worker thread exiting");
}

impl<T: Task> WorkerPool<T> for ThreadPool<T> {
    fn submit(&self, task: T) -> Result<TaskHandle<T::Output>, PoolError> {
        let sender = self.sender.as_ref().ok_or(PoolError::Closed)?;
        let (reply, handle) = TaskHandle::channel();
        sender
            .send(Job { task, reply })
            .map_err(|_| PoolError::Closed)?;
        Ok(handle)
    }

    fn workers(&self) -> usize {
        self.workers
    }

    fn shutdown(&mut self) {
        self.sender.take();
        for handle in self.threads.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread terminated abnormally");
            }
        }
    }
}

impl<T: Task> Drop for ThreadPool<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
