// Copyright (c) 2025 NaturalIO

//! Bounded worker pool: one blocking MPMC queue, a fixed set of workers.
//!
//! `submit` never blocks; a saturated queue rejects with `QueueFull` and the
//! caller backs off. Dropping the pool is an immediate shutdown: workers
//! finish the job in hand, queued jobs are dropped unrun, and every worker
//! is joined before the drop returns.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossfire::{BlockingRxTrait, BlockingTxTrait, MTx, TrySendError, mpmc};

use crate::errors::PoolError;

pub(crate) struct WorkerPool<T: Send + 'static> {
    tx: Option<MTx<mpmc::Array<T>>>,
    workers: Vec<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl<T: Send + 'static> WorkerPool<T> {
    pub fn new<F>(pool_size: usize, max_requests: usize, handler: F) -> Result<Self, PoolError>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        if pool_size == 0 || max_requests == 0 {
            return Err(PoolError::Invalid);
        }
        let (tx, rx) = mpmc::bounded_blocking::<T>(max_requests);
        let shutdown = Arc::new(AtomicBool::new(false));
        let handler = Arc::new(handler);
        let mut workers = Vec::with_capacity(pool_size);
        for i in 0..pool_size {
            let rx = rx.clone();
            let shutdown = shutdown.clone();
            let handler = handler.clone();
            let worker = std::thread::Builder::new()
                .name(format!("file-aio-{}", i))
                .spawn(move || {
                    loop {
                        match rx.recv() {
                            Ok(job) => {
                                if shutdown.load(Ordering::Acquire) {
                                    // Immediate shutdown: drained jobs are dropped, not run.
                                    drop(job);
                                    break;
                                }
                                (*handler)(job);
                            }
                            Err(_) => {
                                debug!("worker exit on queue close");
                                break;
                            }
                        }
                    }
                })
                .map_err(|_| PoolError::ThreadFailure)?;
            workers.push(worker);
        }
        Ok(Self { tx: Some(tx), workers, shutdown })
    }

    pub fn submit(&self, job: T) -> Result<(), PoolError> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(PoolError::Shutdown);
        }
        let Some(tx) = self.tx.as_ref() else {
            return Err(PoolError::Invalid);
        };
        match tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(PoolError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(PoolError::Shutdown),
        }
    }
}

impl<T: Send + 'static> Drop for WorkerPool<T> {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        drop(self.tx.take());
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("aio worker panicked");
            }
        }
    }
}
