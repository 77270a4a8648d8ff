//! A small owned thread pool with joinable handles for short-lived
//! administrative work (camera add/remove side effects, per-request
//! callbacks). Spec §5 / §9: "Rewrite to use an owned thread pool with
//! joinable handles and futures; never detach" — this removes the
//! use-after-free class of bugs that detached threads invite during
//! controller teardown.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Shutdown,
}

pub struct ThreadPool {
    workers: Vec<JoinHandle<()>>,
    sender: Option<mpsc::Sender<Message>>,
}

impl ThreadPool {
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "thread pool size must be positive");

        let (sender, receiver) = mpsc::channel::<Message>();
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..size)
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                thread::Builder::new()
                    .name(format!("vision-admin-{id}"))
                    .spawn(move || loop {
                        let message = {
                            let guard = receiver.lock().unwrap_or_else(|e| e.into_inner());
                            guard.recv()
                        };
                        match message {
                            Ok(Message::Run(job)) => job(),
                            Ok(Message::Shutdown) | Err(_) => break,
                        }
                    })
                    .expect("failed to spawn admin thread pool worker")
            })
            .collect();

        Self {
            workers,
            sender: Some(sender),
        }
    }

    /// Submit a fire-and-forget job. Never detaches: the thread executing
    /// it is joined by [`ThreadPool::shutdown`] / `Drop`.
    pub fn execute<F>(&self, job: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Some(sender) = &self.sender {
            let _ = sender.send(Message::Run(Box::new(job)));
        }
    }

    /// Signal all workers to stop after draining queued jobs, then join
    /// every worker thread. No thread is left detached.
    pub fn shutdown(&mut self) {
        if let Some(sender) = self.sender.take() {
            for _ in &self.workers {
                let _ = sender.send(Message::Shutdown);
            }
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn jobs_run_and_pool_joins_cleanly() {
        let pool = ThreadPool::new(4);
        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..16 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }

        drop(pool); // joins all workers, draining the queue first.
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }
}
