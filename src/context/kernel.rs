// Copyright (c) 2025 NaturalIO

//! Linux native AIO back-end.
//!
//! One host thread drives submit/cancel/harvest by convention; the kernel
//! performs the IO out of band and bumps the eventfd counter per completion
//! (`IOCB_FLAG_RESFD`). Each in-flight operation is pinned in the `pending`
//! map under its `aio_data` token until its completion is delivered, and
//! symmetrically retains the shared state through its back-reference.

use std::any::Any;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use nix::errno::Errno;

use crate::context::IoContext;
use crate::errors::{AioError, map_cancel_errno, map_submit_errno};
use crate::operation::{IOCallback, Operation};
use crate::sys::{self, aio_context_t, io_event, iocb};

const CTX_MAX_REQUESTS_DEFAULT: usize = 32;
const EV_MAX_REQUESTS_DEFAULT: usize = 512;

type Pending<C> = HashMap<u64, Arc<Operation<C>>>;

struct AioShared<C: IOCallback> {
    /// Kernel context handle; zero once destroyed.
    ctx: AtomicU64,
    /// Completion eventfd; negative once closed.
    evfd: AtomicI32,
    max_requests: usize,
    pending: Mutex<Pending<C>>,
}

impl<C: IOCallback> AioShared<C> {
    fn kernel_ctx(&self) -> Result<aio_context_t, AioError> {
        let ctx = self.ctx.load(Ordering::Acquire);
        if ctx == 0 {
            return Err(AioError::Runtime("aio context is destroyed"));
        }
        Ok(ctx)
    }

    fn lock_pending(&self) -> MutexGuard<'_, Pending<C>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Destroy the ring and close the eventfd, once. `io_destroy` cancels
    /// or waits out whatever the kernel still holds, so request buffers are
    /// quiescent when this returns.
    fn shutdown(&self) {
        let ctx = self.ctx.swap(0, Ordering::AcqRel);
        if ctx != 0 {
            if sys::io_destroy(ctx) < 0 {
                error!("io_destroy failed: {}", Errno::last());
            }
        }
        let fd = self.evfd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            let _ = unsafe { libc::close(fd) };
        }
    }

    /// Let go of every pin still outstanding, without delivering completions.
    fn release_pending(&self) {
        let drained: Vec<Arc<Operation<C>>> = {
            let mut pending = self.lock_pending();
            pending.drain().map(|(_, op)| op).collect()
        };
        if !drained.is_empty() {
            info!("released {} unharvested operations on teardown", drained.len());
        }
        for op in drained {
            op.clear_context();
        }
    }
}

impl<C: IOCallback> Drop for AioShared<C> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[inline(always)]
fn token_of<C: IOCallback>(op: &Arc<Operation<C>>) -> u64 {
    Arc::as_ptr(op) as u64
}

fn unpin<C: IOCallback>(pending: &mut Pending<C>, op: &Arc<Operation<C>>) {
    pending.remove(&token_of(op));
    op.clear_context();
    op.disarm();
}

/// Linux native AIO context. The single handle owns the kernel ring and the
/// completion eventfd; teardown destroys the ring first and then releases
/// every pin it still holds.
pub struct AioContext<C: IOCallback> {
    inner: Arc<AioShared<C>>,
}

impl<C: IOCallback> AioContext<C> {
    /// `max_requests == 0` selects the default capacity hint.
    pub fn new(max_requests: usize) -> Result<Self, AioError> {
        sys::require_kernel_aio()?;
        let max_requests =
            if max_requests == 0 { CTX_MAX_REQUESTS_DEFAULT } else { max_requests };
        let evfd = sys::eventfd().map_err(AioError::System)?;
        let mut kctx: aio_context_t = 0;
        if sys::io_setup(max_requests as libc::c_long, &mut kctx) < 0 {
            let e = Errno::last();
            let _ = unsafe { libc::close(evfd) };
            return Err(AioError::System(e));
        }
        debug!("aio context ready: max_requests={} eventfd={}", max_requests, evfd);
        Ok(Self {
            inner: Arc::new(AioShared {
                ctx: AtomicU64::new(kctx),
                evfd: AtomicI32::new(evfd),
                max_requests,
                pending: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// The completion eventfd, for registration with an outer event loop.
    pub fn fileno(&self) -> RawFd {
        self.inner.evfd.load(Ordering::Acquire)
    }

    pub fn max_requests(&self) -> usize {
        self.inner.max_requests
    }

    /// Queue a batch with one `io_submit`. Operations already in flight are
    /// skipped. The kernel accepts a prefix of the batch; the rejected
    /// suffix is unwound and the accepted count returned. A submission
    /// error unwinds the whole batch.
    pub fn submit(&self, ops: &[Arc<Operation<C>>]) -> Result<usize, AioError> {
        let inner = &self.inner;
        let kctx = inner.kernel_ctx()?;
        let evfd = inner.evfd.load(Ordering::Acquire);
        let mut iocbs: Vec<*mut iocb> = Vec::with_capacity(ops.len());
        let mut armed: Vec<Arc<Operation<C>>> = Vec::with_capacity(ops.len());
        {
            let mut pending = inner.lock_pending();
            for op in ops {
                if !op.arm() {
                    continue;
                }
                op.set_context(inner.clone() as Arc<dyn Any + Send + Sync>);
                let token = token_of(op);
                unsafe { op.fill_iocb(token, evfd) };
                pending.insert(token, op.clone());
                iocbs.push(op.iocb_ptr());
                armed.push(op.clone());
            }
        }
        if iocbs.is_empty() {
            return Ok(0);
        }
        let accepted = loop {
            let r = sys::io_submit(kctx, iocbs.len() as libc::c_long, iocbs.as_mut_ptr());
            if r >= 0 {
                break r as usize;
            }
            let e = Errno::last();
            if e == Errno::EINTR {
                continue;
            }
            let mut pending = inner.lock_pending();
            for op in &armed {
                unpin(&mut pending, op);
            }
            return Err(map_submit_errno(e));
        };
        if accepted < armed.len() {
            trace!("io_submit accepted {}/{}", accepted, armed.len());
            let mut pending = inner.lock_pending();
            for op in &armed[accepted..] {
                unpin(&mut pending, op);
            }
        }
        Ok(accepted)
    }

    /// Advisory cancel. On immediate success the kernel delivers no ring
    /// event, so the synthetic completion (and the callback, at most once)
    /// is delivered right here; otherwise the completion arrives through
    /// `process_events` as usual.
    pub fn cancel(&self, op: &Arc<Operation<C>>) -> Result<i64, AioError> {
        let inner = &self.inner;
        let kctx = inner.kernel_ctx()?;
        let mut ev = io_event::default();
        if sys::io_cancel(kctx, op.iocb_ptr(), &mut ev) < 0 {
            return Err(map_cancel_errno(Errno::last()));
        }
        debug!("io_cancel completed {:?} with res={}", op, ev.res);
        let pinned = {
            let mut pending = inner.lock_pending();
            pending.remove(&token_of(op))
        };
        // Deliver only while the pin was still ours; a harvest that raced
        // ahead has already completed the operation.
        if pinned.is_some() {
            op.complete(ev.res);
            op.clear_context();
            if let Some(cb) = op.take_callback() {
                cb.call(ev.res);
            }
        }
        Ok(ev.res)
    }

    /// Harvest up to `max_requests` ready completions (zero selects the
    /// default of 512), waiting for at least `min_requests` of them within
    /// `timeout`. Each harvested event stores its result on the operation,
    /// releases the pin and fires the callback with the raw completion
    /// code. Returns the number processed.
    pub fn process_events(
        &self, max_requests: usize, min_requests: usize, timeout: Duration,
    ) -> Result<usize, AioError> {
        let inner = &self.inner;
        let kctx = inner.kernel_ctx()?;
        let max_requests =
            if max_requests == 0 { EV_MAX_REQUESTS_DEFAULT } else { max_requests };
        if min_requests > max_requests {
            return Err(AioError::Invalid("min_requests must not exceed max_requests"));
        }
        let mut events: Vec<io_event> = vec![io_event::default(); max_requests];
        let mut ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        let got = loop {
            let r = sys::io_getevents(
                kctx,
                min_requests as libc::c_long,
                max_requests as libc::c_long,
                events.as_mut_ptr(),
                &mut ts,
            );
            if r >= 0 {
                break r as usize;
            }
            let e = Errno::last();
            if e == Errno::EINTR {
                continue;
            }
            return Err(AioError::System(e));
        };
        let mut fired: Vec<(Arc<Operation<C>>, i64)> = Vec::with_capacity(got);
        {
            let mut pending = inner.lock_pending();
            for ev in &events[..got] {
                match pending.remove(&ev.data) {
                    Some(op) => {
                        op.complete(ev.res);
                        op.clear_context();
                        fired.push((op, ev.res));
                    }
                    // A request canceled synchronously after its event was
                    // already queued lands here; its callback already ran.
                    None => warn!("completion for unknown token {:#x} dropped", ev.data),
                }
            }
        }
        let processed = fired.len();
        for (op, res) in fired {
            if let Some(cb) = op.take_callback() {
                cb.call(res);
            }
        }
        Ok(processed)
    }

    /// One 8-byte read of the eventfd: the number of completions delivered
    /// since the previous poll. A short read surfaces `WouldBlock`.
    pub fn poll(&self) -> Result<u64, AioError> {
        let fd = self.inner.evfd.load(Ordering::Acquire);
        if fd < 0 {
            return Err(AioError::Runtime("aio context is destroyed"));
        }
        let mut counter: u64 = 0;
        let n = unsafe { libc::read(fd, &mut counter as *mut u64 as *mut libc::c_void, 8) };
        if n != 8 {
            return Err(AioError::WouldBlock);
        }
        Ok(counter)
    }
}

impl<C: IOCallback> Drop for AioContext<C> {
    fn drop(&mut self) {
        // Quiesce the kernel first, then let go of every outstanding pin.
        self.inner.shutdown();
        self.inner.release_pending();
    }
}

impl<C: IOCallback> IoContext<C> for AioContext<C> {
    fn submit(&self, ops: &[Arc<Operation<C>>]) -> Result<usize, AioError> {
        AioContext::submit(self, ops)
    }

    fn cancel(&self, op: &Arc<Operation<C>>) -> Result<i64, AioError> {
        AioContext::cancel(self, op)
    }

    fn max_requests(&self) -> usize {
        AioContext::max_requests(self)
    }
}
