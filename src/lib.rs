#[macro_use]
extern crate log;
#[macro_use]
extern crate captains_log;

pub mod context;
pub mod errors;
pub mod operation;
mod pool;
pub mod sys;

pub use context::{AioContext, IoContext, MAX_QUEUE, MAX_THREADS, ThreadContext};
pub use errors::{AioError, PoolError};
pub use operation::{ClosureCb, IOCallback, OpCode, OpValue, Operation};

#[cfg(test)]
mod test;
