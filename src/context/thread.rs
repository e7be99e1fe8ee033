// Copyright (c) 2025 NaturalIO

//! Worker-pool back-end: the same operations, executed as blocking
//! positional IO on a bounded pool.
//!
//! Submitters never block on IO; a saturated queue rejects and the caller
//! backs off. Workers run the syscall with no lock held, then take the
//! context-wide callback mutex to deliver the completion, so callbacks
//! never run concurrently (the stand-in for a host runtime's global lock).

use std::any::Any;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};

use nix::errno::Errno;

use crate::context::IoContext;
use crate::errors::{AioError, PoolError};
use crate::operation::{IOCallback, OpCode, Operation};
use crate::pool::WorkerPool;

const CTX_POOL_SIZE_DEFAULT: usize = 8;
const CTX_MAX_REQUESTS_DEFAULT: usize = 512;

/// Hard ceilings inherited from the classic pool implementation.
pub const MAX_THREADS: usize = 64;
pub const MAX_QUEUE: usize = 65536;

/// State the in-flight operations keep alive through their back-references.
pub(crate) struct ThreadShared {
    callback_lock: Mutex<()>,
    pool_size: usize,
    max_requests: usize,
}

fn lock_callbacks(shared: &ThreadShared) -> MutexGuard<'_, ()> {
    shared.callback_lock.lock().unwrap_or_else(|e| {
        warn!("{}", PoolError::LockFailure);
        e.into_inner()
    })
}

/// One queued request: the operation pin plus the context pin, released
/// together when the job finishes or is dropped unrun at shutdown.
pub(crate) struct Job<C: IOCallback> {
    op: Arc<Operation<C>>,
    ctx: Arc<ThreadShared>,
    ran: bool,
}

impl<C: IOCallback> Drop for Job<C> {
    fn drop(&mut self) {
        if !self.ran {
            // Dropped out of the queue without running: undo the submit.
            self.op.clear_context();
            self.op.disarm();
        }
    }
}

fn worker_body<C: IOCallback>(mut job: Job<C>) {
    job.ran = true;
    let op = job.op.clone();
    let shared = job.ctx.clone();

    if op.opcode() == OpCode::Noop {
        let _guard = lock_callbacks(&shared);
        op.complete(0);
        op.clear_context();
        return;
    }

    let fd = op.fileno();
    let offset = op.offset();
    let (buf, len) = op.buf_ptr();
    let res = unsafe {
        match op.opcode() {
            OpCode::Write => {
                libc::pwrite(fd, buf as usize as *const libc::c_void, len as usize, offset) as i64
            }
            OpCode::Read => {
                libc::pread(fd, buf as usize as *mut libc::c_void, len as usize, offset) as i64
            }
            OpCode::Fsync => libc::fsync(fd) as i64,
            OpCode::Fdsync => fdatasync(fd) as i64,
            OpCode::Noop => unreachable!(),
        }
    };
    // A failed request always carries -errno, mirroring the kernel ring.
    let res = if res < 0 { -(Errno::last_raw() as i64) } else { res };
    op.release_write_payload();
    op.complete(res);

    let _guard = lock_callbacks(&shared);
    if let Some(cb) = op.take_callback() {
        cb.call(res);
    }
    op.clear_context();
}

#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn fdatasync(fd: RawFd) -> libc::c_int {
    unsafe { libc::fdatasync(fd) }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn fdatasync(fd: RawFd) -> libc::c_int {
    unsafe { libc::fsync(fd) }
}

/// Portable back-end over a bounded worker pool.
pub struct ThreadContext<C: IOCallback> {
    shared: Arc<ThreadShared>,
    pool: WorkerPool<Job<C>>,
}

impl<C: IOCallback> ThreadContext<C> {
    /// Zero for either size selects its default (512 requests, 8 workers).
    pub fn new(max_requests: usize, pool_size: usize) -> Result<Self, AioError> {
        let pool_size = if pool_size == 0 { CTX_POOL_SIZE_DEFAULT } else { pool_size };
        let max_requests =
            if max_requests == 0 { CTX_MAX_REQUESTS_DEFAULT } else { max_requests };
        if pool_size > MAX_THREADS {
            return Err(AioError::Invalid("pool_size too large"));
        }
        if max_requests >= MAX_QUEUE {
            return Err(AioError::Invalid("max_requests too large"));
        }
        let shared =
            Arc::new(ThreadShared { callback_lock: Mutex::new(()), pool_size, max_requests });
        let pool = WorkerPool::new(pool_size, max_requests, worker_body::<C>)?;
        debug!("thread context ready: pool_size={} max_requests={}", pool_size, max_requests);
        Ok(Self { shared, pool })
    }

    /// Queue each operation not already in flight. An enqueue failure
    /// propagates immediately, with the rejected operation rolled back;
    /// returns the count newly queued.
    pub fn submit(&self, ops: &[Arc<Operation<C>>]) -> Result<usize, AioError> {
        let mut queued = 0;
        for op in ops {
            if !op.arm() {
                continue;
            }
            op.set_context(self.shared.clone() as Arc<dyn Any + Send + Sync>);
            let job = Job { op: op.clone(), ctx: self.shared.clone(), ran: false };
            if let Err(e) = self.pool.submit(job) {
                // The rejected job rolled its operation back on drop.
                return Err(e.into());
            }
            queued += 1;
        }
        Ok(queued)
    }

    /// Interface parity with the kernel back-end: a request in a worker
    /// runs to completion, so this always reports zero.
    pub fn cancel(&self, _op: &Arc<Operation<C>>) -> Result<i64, AioError> {
        Ok(0)
    }

    pub fn pool_size(&self) -> usize {
        self.shared.pool_size
    }

    pub fn max_requests(&self) -> usize {
        self.shared.max_requests
    }
}

impl<C: IOCallback> IoContext<C> for ThreadContext<C> {
    fn submit(&self, ops: &[Arc<Operation<C>>]) -> Result<usize, AioError> {
        ThreadContext::submit(self, ops)
    }

    fn cancel(&self, op: &Arc<Operation<C>>) -> Result<i64, AioError> {
        ThreadContext::cancel(self, op)
    }

    fn max_requests(&self) -> usize {
        ThreadContext::max_requests(self)
    }
}
