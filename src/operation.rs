// Copyright (c) 2025 NaturalIO

use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use io_buffer::Buffer;
use nix::errno::Errno;

use crate::errors::AioError;
use crate::sys::{self, iocb};

/// What a single request asks of the file descriptor.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum OpCode {
    Read,
    Write,
    Fsync,
    Fdsync,
    Noop,
}

impl OpCode {
    pub(crate) fn iocb_opcode(self) -> u16 {
        match self {
            OpCode::Read => sys::IOCB_CMD_PREAD,
            OpCode::Write => sys::IOCB_CMD_PWRITE,
            OpCode::Fsync => sys::IOCB_CMD_FSYNC,
            OpCode::Fdsync => sys::IOCB_CMD_FDSYNC,
            OpCode::Noop => sys::IOCB_CMD_NOOP,
        }
    }
}

/// Define your completion callback with this trait.
///
/// The callback receives the raw signed completion code: the transferred
/// byte count on success, `-errno` on failure.
pub trait IOCallback: Send + 'static {
    fn call(self, res: i64);
}

/// Closure callback for Operation.
pub struct ClosureCb(pub Box<dyn FnOnce(i64) + Send + 'static>);

impl IOCallback for ClosureCb {
    fn call(self, res: i64) {
        (self.0)(res)
    }
}

/// Completed value extracted from an Operation via `get_value`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpValue {
    /// Fresh immutable copy of the bytes a read transferred.
    Payload(Bytes),
    /// Byte count a write transferred.
    Written(usize),
    /// Sync-style operations carry no payload.
    Unit,
}

enum OpBuf {
    /// Read destination, allocated zero-filled at construction.
    Owned(Buffer),
    /// Write source, retained until completion.
    Borrowed(Bytes),
    None,
}

/// A descriptor for a single file-IO request plus its completion slot.
///
/// Handled as `Arc<Operation<C>>`: an executor that takes the operation
/// keeps a clone (the pin) until completion delivery, and the operation
/// keeps the executor alive through its back-reference for the same window.
///
/// Input fields are immutable once submitted. The completion slot
/// (`result`/`error`/`nbytes`) is written exactly once, by whoever delivers
/// the completion.
pub struct Operation<C: IOCallback> {
    opcode: OpCode,
    fd: RawFd,
    offset: i64,
    priority: u16,
    buf: UnsafeCell<OpBuf>,
    iocb: UnsafeCell<iocb>,
    nbytes: AtomicU64,
    result: AtomicI64,
    error: AtomicI32,
    in_flight: AtomicBool,
    done: AtomicBool,
    cb: Mutex<Option<C>>,
    ctx: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
}

// The UnsafeCell fields are only written by the executor that armed the
// operation, inside the submit..completion window the `in_flight` flag
// guards; everything else is atomics and mutexes.
unsafe impl<C: IOCallback> Send for Operation<C> {}
unsafe impl<C: IOCallback> Sync for Operation<C> {}

impl<C: IOCallback> fmt::Debug for Operation<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "<Operation {:?} fd={} offset={} nbytes={} result={}>",
            self.opcode,
            self.fd,
            self.offset,
            self.nbytes.load(Ordering::Relaxed),
            self.result.load(Ordering::Relaxed),
        )
    }
}

impl<C: IOCallback> Operation<C> {
    fn alloc(
        opcode: OpCode, fd: RawFd, offset: i64, priority: u16, buf: OpBuf, nbytes: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            opcode,
            fd,
            offset,
            priority,
            buf: UnsafeCell::new(buf),
            iocb: UnsafeCell::new(iocb::default()),
            nbytes: AtomicU64::new(nbytes),
            result: AtomicI64::new(0),
            error: AtomicI32::new(0),
            in_flight: AtomicBool::new(false),
            done: AtomicBool::new(false),
            cb: Mutex::new(None),
            ctx: Mutex::new(None),
        })
    }

    /// A read of `nbytes` at `offset`. The destination buffer is owned by
    /// the operation and zero-filled; allocation failure surfaces ENOMEM.
    pub fn read(nbytes: usize, fd: RawFd, offset: i64, priority: u16) -> Result<Arc<Self>, AioError> {
        let mut buf = Buffer::alloc(nbytes as i32).map_err(AioError::System)?;
        buf.zero();
        Ok(Self::alloc(OpCode::Read, fd, offset, priority, OpBuf::Owned(buf), nbytes as u64))
    }

    /// A write of `payload` at `offset`. The payload bytes are borrowed
    /// (cheaply cloned) and held until the operation completes.
    pub fn write(payload: Bytes, fd: RawFd, offset: i64, priority: u16) -> Arc<Self> {
        let nbytes = payload.len() as u64;
        Self::alloc(OpCode::Write, fd, offset, priority, OpBuf::Borrowed(payload), nbytes)
    }

    pub fn fsync(fd: RawFd, priority: u16) -> Arc<Self> {
        Self::alloc(OpCode::Fsync, fd, 0, priority, OpBuf::None, 0)
    }

    pub fn fdsync(fd: RawFd, priority: u16) -> Arc<Self> {
        Self::alloc(OpCode::Fdsync, fd, 0, priority, OpBuf::None, 0)
    }

    /// Performs no IO; the thread back-end runs it through the completion
    /// machinery without touching the fd.
    pub fn noop() -> Arc<Self> {
        Self::alloc(OpCode::Noop, 0, 0, 0, OpBuf::None, 0)
    }

    #[inline(always)]
    pub fn opcode(&self) -> OpCode {
        self.opcode
    }

    #[inline(always)]
    pub fn fileno(&self) -> RawFd {
        self.fd
    }

    #[inline(always)]
    pub fn offset(&self) -> i64 {
        self.offset
    }

    #[inline(always)]
    pub fn priority(&self) -> u16 {
        self.priority
    }

    /// Capacity before completion, transferred byte count after.
    #[inline(always)]
    pub fn nbytes(&self) -> u64 {
        self.nbytes.load(Ordering::Acquire)
    }

    /// Raw signed completion code; negative mirrors `error`.
    #[inline(always)]
    pub fn result(&self) -> i64 {
        self.result.load(Ordering::Acquire)
    }

    /// Errno of the completion, zero iff the operation succeeded.
    #[inline(always)]
    pub fn error(&self) -> i32 {
        self.error.load(Ordering::Acquire)
    }

    #[inline(always)]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Record the callback to run once after completion.
    pub fn set_callback(&self, cb: C) {
        let mut slot = self.cb.lock().unwrap_or_else(PoisonError::into_inner);
        slot.replace(cb);
    }

    /// Read-only view of the request bytes: the borrowed payload for
    /// writes, the owned region for reads. `None` while the request is in
    /// flight and for operations without a buffer.
    pub fn payload(&self) -> Option<&[u8]> {
        if self.in_flight.load(Ordering::Acquire) && !self.done.load(Ordering::Acquire) {
            return None;
        }
        match unsafe { &*self.buf.get() } {
            OpBuf::Owned(b) => Some(b.as_ref()),
            OpBuf::Borrowed(b) => Some(b.as_ref()),
            OpBuf::None => None,
        }
    }

    /// The completed value: a fresh copy of the transferred bytes for a
    /// read, the transferred count for a write, `Unit` otherwise. A failed
    /// completion surfaces its errno instead; calling while still in flight
    /// yields EINPROGRESS.
    pub fn get_value(&self) -> Result<OpValue, Errno> {
        if self.in_flight.load(Ordering::Acquire) && !self.done.load(Ordering::Acquire) {
            return Err(Errno::EINPROGRESS);
        }
        let error = self.error.load(Ordering::Acquire);
        if error != 0 {
            return Err(Errno::from_raw(error));
        }
        match self.opcode {
            OpCode::Read => {
                let buf: &[u8] = match unsafe { &*self.buf.get() } {
                    OpBuf::Owned(b) => b.as_ref(),
                    _ => &[],
                };
                let n = (self.nbytes.load(Ordering::Acquire) as usize).min(buf.len());
                Ok(OpValue::Payload(Bytes::copy_from_slice(&buf[..n])))
            }
            OpCode::Write => Ok(OpValue::Written(self.result.load(Ordering::Acquire) as usize)),
            _ => Ok(OpValue::Unit),
        }
    }

    /// Claim the in-flight window. False means the operation was already
    /// taken by a submit: it runs at most once over its lifetime.
    #[inline(always)]
    pub(crate) fn arm(&self) -> bool {
        !self.in_flight.swap(true, Ordering::AcqRel)
    }

    /// Undo a claim that never reached an executor.
    #[inline(always)]
    pub(crate) fn disarm(&self) {
        self.in_flight.store(false, Ordering::Release);
    }

    pub(crate) fn set_context(&self, ctx: Arc<dyn Any + Send + Sync>) {
        let mut slot = self.ctx.lock().unwrap_or_else(PoisonError::into_inner);
        slot.replace(ctx);
    }

    pub(crate) fn clear_context(&self) {
        let mut slot = self.ctx.lock().unwrap_or_else(PoisonError::into_inner);
        slot.take();
    }

    pub(crate) fn take_callback(&self) -> Option<C> {
        let mut slot = self.cb.lock().unwrap_or_else(PoisonError::into_inner);
        slot.take()
    }

    /// Store the completion code. Success updates the transferred count for
    /// data operations; failure records `-res` as the errno.
    pub(crate) fn complete(&self, res: i64) {
        if res >= 0 {
            self.result.store(res, Ordering::Release);
            self.error.store(0, Ordering::Release);
            match self.opcode {
                OpCode::Read | OpCode::Write => self.nbytes.store(res as u64, Ordering::Release),
                _ => {}
            }
        } else {
            self.result.store(res, Ordering::Release);
            self.error.store((-res) as i32, Ordering::Release);
        }
        self.done.store(true, Ordering::Release);
    }

    /// Raw (address, length) of the IO region for the syscall layer.
    pub(crate) fn buf_ptr(&self) -> (u64, u64) {
        match unsafe { &*self.buf.get() } {
            OpBuf::Owned(b) => (b.get_raw() as u64, b.len() as u64),
            OpBuf::Borrowed(b) => (b.as_ptr() as u64, b.len() as u64),
            OpBuf::None => (0, 0),
        }
    }

    #[inline(always)]
    pub(crate) fn iocb_ptr(&self) -> *mut iocb {
        self.iocb.get()
    }

    /// Fill the control block for kernel submission. `token` travels
    /// through `aio_data` and comes back on the harvested event.
    ///
    /// Safety: exclusive to the armed window; the caller must have won
    /// `arm()` for this operation.
    pub(crate) unsafe fn fill_iocb(&self, token: u64, resfd: RawFd) {
        log_assert!(
            self.in_flight.load(Ordering::Acquire),
            "operation must be armed before iocb setup"
        );
        let (buf, len) = self.buf_ptr();
        let cb = unsafe { &mut *self.iocb.get() };
        *cb = iocb {
            aio_data: token,
            aio_lio_opcode: self.opcode.iocb_opcode(),
            aio_reqprio: self.priority as i16,
            aio_fildes: self.fd as u32,
            aio_buf: buf,
            aio_nbytes: len,
            aio_offset: self.offset,
            aio_flags: sys::IOCB_FLAG_RESFD,
            aio_resfd: resfd as u32,
            ..Default::default()
        };
    }

    /// Let go of a write's borrowed payload. Must happen before the
    /// completion is published so readers never observe the release.
    pub(crate) fn release_write_payload(&self) {
        if self.opcode == OpCode::Write {
            unsafe {
                *self.buf.get() = OpBuf::None;
            }
        }
    }
}
