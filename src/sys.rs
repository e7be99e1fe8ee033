// Copyright (c) 2025 NaturalIO

//! Linux AIO ABI and raw syscall entry points.
//!
//! The kernel exposes native AIO through bare syscalls with no libc wrapper,
//! so the control-block layout from `<linux/aio_abi.h>` is carried here.
//! All wrappers follow the libc convention: `-1` on failure with the cause
//! in `errno`.

use std::ffi::CStr;
use std::mem::zeroed;
use std::os::fd::RawFd;

use libc::c_long;
use nix::errno::Errno;
use once_cell::sync::Lazy;

use crate::errors::AioError;

#[allow(non_camel_case_types)]
pub type aio_context_t = u64;

pub const IOCB_CMD_PREAD: u16 = 0;
pub const IOCB_CMD_PWRITE: u16 = 1;
pub const IOCB_CMD_FSYNC: u16 = 2;
pub const IOCB_CMD_FDSYNC: u16 = 3;
pub const IOCB_CMD_NOOP: u16 = 6;

/// Deliver a completion notification on `aio_resfd` (an eventfd).
pub const IOCB_FLAG_RESFD: u32 = 1 << 0;

/// Per-request input control block, little-endian field order.
#[repr(C)]
#[derive(Debug, Copy, Clone)]
#[allow(non_camel_case_types)]
pub struct iocb {
    pub aio_data: u64,
    pub aio_key: u32,
    pub aio_rw_flags: i32,
    pub aio_lio_opcode: u16,
    pub aio_reqprio: i16,
    pub aio_fildes: u32,
    pub aio_buf: u64,
    pub aio_nbytes: u64,
    pub aio_offset: i64,
    pub aio_reserved2: i64,
    pub aio_flags: u32,
    pub aio_resfd: u32,
}

impl Default for iocb {
    fn default() -> Self {
        unsafe { zeroed() }
    }
}

#[repr(C)]
#[derive(Debug, Copy, Clone)]
#[allow(non_camel_case_types)]
pub struct io_event {
    pub data: u64,
    pub obj: u64,
    pub res: i64,
    pub res2: i64,
}

impl Default for io_event {
    fn default() -> Self {
        unsafe { zeroed() }
    }
}

// See io_setup(2) for details.
#[inline(always)]
pub fn io_setup(nr: c_long, ctxp: *mut aio_context_t) -> c_long {
    unsafe { libc::syscall(libc::SYS_io_setup, nr, ctxp) }
}

// See io_destroy(2) for details.
#[inline(always)]
pub fn io_destroy(ctx: aio_context_t) -> c_long {
    unsafe { libc::syscall(libc::SYS_io_destroy, ctx) }
}

// See io_submit(2) for details.
#[inline(always)]
pub fn io_submit(ctx: aio_context_t, nr: c_long, iocbpp: *mut *mut iocb) -> c_long {
    unsafe { libc::syscall(libc::SYS_io_submit, ctx, nr, iocbpp) }
}

// See io_getevents(2) for details.
#[inline(always)]
pub fn io_getevents(
    ctx: aio_context_t, min_nr: c_long, max_nr: c_long, events: *mut io_event,
    timeout: *mut libc::timespec,
) -> c_long {
    unsafe { libc::syscall(libc::SYS_io_getevents, ctx, min_nr, max_nr, events, timeout) }
}

// See io_cancel(2) for details.
#[inline(always)]
pub fn io_cancel(ctx: aio_context_t, cb: *mut iocb, result: *mut io_event) -> c_long {
    unsafe { libc::syscall(libc::SYS_io_cancel, ctx, cb, result) }
}

/// Completion counter fd, blocking and non-semaphore.
pub fn eventfd() -> Result<RawFd, Errno> {
    let fd = unsafe { libc::eventfd(0, 0) };
    if fd < 0 {
        return Err(Errno::last());
    }
    Ok(fd)
}

static KERNEL_RELEASE: Lazy<Option<(u32, u32)>> = Lazy::new(read_kernel_release);

fn read_kernel_release() -> Option<(u32, u32)> {
    let mut name: libc::utsname = unsafe { zeroed() };
    if unsafe { libc::uname(&mut name) } != 0 {
        return None;
    }
    let release = unsafe { CStr::from_ptr(name.release.as_ptr()) };
    let release = release.to_str().ok()?;
    let mut parts = release.split('.');
    let major: u32 = parts.next()?.parse().ok()?;
    let minor: u32 = parts
        .next()?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}

/// Fsync and fdsync over `io_submit` first shipped in Linux 4.18; older
/// kernels silently complete those opcodes without syncing, so refuse them.
pub fn require_kernel_aio() -> Result<(), AioError> {
    match *KERNEL_RELEASE {
        Some((major, minor)) if major > 4 || (major == 4 && minor >= 18) => Ok(()),
        _ => Err(AioError::NotImplemented(
            "kernel aio needs linux 4.18 or newer (IOCB_CMD_FSYNC/FDSYNC)",
        )),
    }
}
