//! Executor
//!
//! Boundary for background work. Compaction staging and flush jobs are
//! handed over as opaque tasks so they stay off the feed path.

use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use crossbeam::sync::WaitGroup;
use parking_lot::Mutex;

use crate::error::{Result, StoreError};

/// Unit of background work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Accepts opaque units of work
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task) -> Result<()>;

    /// Block until every task submitted so far has finished
    fn sync(&self);
}

/// Runs each task on the calling thread
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    fn execute(&self, task: Task) -> Result<()> {
        task();
        Ok(())
    }

    fn sync(&self) {}
}

enum Message {
    Run(Task),
    Barrier(WaitGroup),
}

/// Fixed pool of worker threads fed by a bounded channel
///
/// `execute` blocks once `queue_depth` tasks are waiting, which bounds the
/// memory held by queued work.
pub struct ThreadPoolExecutor {
    sender: Mutex<Option<Sender<Message>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    threads: usize,
    /// Barrier rounds from concurrent `sync` calls must not interleave
    sync_lock: Mutex<()>,
}

impl ThreadPoolExecutor {
    pub fn new(threads: usize, queue_depth: usize) -> Result<Self> {
        let threads = threads.max(1);
        let (sender, receiver) = channel::bounded::<Message>(queue_depth.max(1));

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let receiver: Receiver<Message> = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("lidstore-worker-{}", index))
                .spawn(move || {
                    for message in receiver.iter() {
                        match message {
                            Message::Run(task) => task(),
                            Message::Barrier(wait_group) => wait_group.wait(),
                        }
                    }
                })
                .map_err(|e| StoreError::Executor(format!("failed to spawn worker: {}", e)))?;
            workers.push(handle);
        }

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
            threads,
            sync_lock: Mutex::new(()),
        })
    }

    /// Stop accepting work, drain the queue and join all workers
    pub fn shutdown(&self) {
        self.sender.lock().take();
        for handle in self.workers.lock().drain(..) {
            if handle.join().is_err() {
                tracing::error!("executor worker panicked");
            }
        }
    }

    fn sender(&self) -> Option<Sender<Message>> {
        self.sender.lock().clone()
    }
}

impl Executor for ThreadPoolExecutor {
    fn execute(&self, task: Task) -> Result<()> {
        let sender = self
            .sender()
            .ok_or_else(|| StoreError::Executor("executor is shut down".into()))?;
        sender
            .send(Message::Run(task))
            .map_err(|_| StoreError::Executor("executor workers are gone".into()))
    }

    fn sync(&self) {
        let _round = self.sync_lock.lock();
        let sender = match self.sender() {
            Some(s) => s,
            None => return,
        };

        // One barrier per worker. A worker parks on its barrier until every
        // worker holds one, so each barrier lands on a distinct worker that
        // has finished whatever it dequeued earlier.
        let wait_group = WaitGroup::new();
        for _ in 0..self.threads {
            if sender.send(Message::Barrier(wait_group.clone())).is_err() {
                break;
            }
        }
        wait_group.wait();
    }
}

impl Drop for ThreadPoolExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
