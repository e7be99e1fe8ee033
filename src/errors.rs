// Copyright (c) 2025 NaturalIO

use nix::errno::Errno;
use thiserror::Error;

/// Errors surfaced synchronously by context methods.
///
/// Per-operation completion errors are never raised from here; they stay on
/// the [`Operation`](crate::operation::Operation) and only surface from
/// `get_value()`.
#[derive(Debug, Error, PartialEq)]
pub enum AioError {
    /// Submission would exceed kernel resources (EAGAIN).
    #[error("{0}")]
    Overflow(&'static str),
    #[error("{0}")]
    Invalid(&'static str),
    #[error("{0}")]
    NotImplemented(&'static str),
    #[error("{0}")]
    Runtime(&'static str),
    /// The eventfd had no completion counter to read.
    #[error("no completion ready on eventfd")]
    WouldBlock,
    /// `io_cancel` reported the request could not be canceled (EAGAIN).
    #[error("operation not canceled")]
    NotCanceled,
    #[error("system error: {0}")]
    System(Errno),
    #[error(transparent)]
    Pool(#[from] PoolError),
}

/// Worker-pool failures, preserved from the classic pool's error codes.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    #[error("thread pool is not initialized")]
    Invalid,
    #[error("failed to lock the thread pool queue")]
    LockFailure,
    #[error("thread pool queue is full")]
    QueueFull,
    #[error("thread pool is shut down")]
    Shutdown,
    #[error("worker thread failed to start")]
    ThreadFailure,
}

/// The io_submit errno contract.
pub(crate) fn map_submit_errno(e: Errno) -> AioError {
    match e {
        Errno::EAGAIN => AioError::Overflow("insufficient resources to queue the batch"),
        Errno::EBADF => AioError::Invalid("invalid file descriptor in batch"),
        Errno::EFAULT => AioError::Invalid("invalid data pointer"),
        Errno::EINVAL => AioError::Invalid("aio context or iocb invalid"),
        other => AioError::System(other),
    }
}

/// The io_cancel errno contract.
pub(crate) fn map_cancel_errno(e: Errno) -> AioError {
    match e {
        Errno::EAGAIN => AioError::NotCanceled,
        Errno::EFAULT => AioError::Runtime("invalid completion event pointer"),
        Errno::EINVAL => AioError::Invalid("aio context or iocb invalid"),
        Errno::ENOSYS => AioError::NotImplemented("io_cancel is not supported on this platform"),
        other => AioError::System(other),
    }
}
