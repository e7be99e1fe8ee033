// Copyright (c) 2025 NaturalIO

use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use io_buffer::rand_buffer;
use nix::errno::Errno;

use crate::context::{IoContext, MAX_QUEUE, MAX_THREADS, ThreadContext};
use crate::errors::{AioError, PoolError};
use crate::operation::{ClosureCb, OpValue, Operation};
use crate::test::*;

extern crate md5;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

#[test]
fn ctor_defaults_and_ceilings() {
    setup_log();
    let ctx = ThreadContext::<ClosureCb>::new(0, 0).unwrap();
    assert_eq!(ctx.pool_size(), 8);
    assert_eq!(ctx.max_requests(), 512);
    assert!(matches!(
        ThreadContext::<ClosureCb>::new(0, MAX_THREADS + 1),
        Err(AioError::Invalid(_))
    ));
    assert!(matches!(ThreadContext::<ClosureCb>::new(MAX_QUEUE, 0), Err(AioError::Invalid(_))));
}

#[test]
fn write_then_read_round_trip() {
    setup_log();
    let temp_file = make_temp_file();
    let owned_fd = create_temp_file(temp_file.as_ref());
    let fd = owned_fd.as_raw_fd();
    let ctx = ThreadContext::<ClosureCb>::new(8, 2).unwrap();
    let (done_tx, done_rx) = channel::<i64>();

    let mut payload = vec![0u8; 4096];
    rand_buffer(&mut payload);
    let digest = md5::compute(&payload);

    let wr = Operation::write(Bytes::from(payload), fd, 0, 0);
    wr.set_callback(send_result(&done_tx));
    assert_eq!(ctx.submit(&[wr.clone()]).unwrap(), 1);
    assert_eq!(done_rx.recv_timeout(RECV_TIMEOUT).unwrap(), 4096);
    assert_eq!(wr.result(), 4096);
    assert_eq!(wr.error(), 0);
    assert_eq!(wr.get_value().unwrap(), OpValue::Written(4096));
    // The borrowed payload is released once the write completes.
    assert!(wr.payload().is_none());

    let rd = Operation::read(4096, fd, 0, 0).unwrap();
    rd.set_callback(send_result(&done_tx));
    assert_eq!(ctx.submit(&[rd.clone()]).unwrap(), 1);
    assert_eq!(done_rx.recv_timeout(RECV_TIMEOUT).unwrap(), 4096);
    match rd.get_value().unwrap() {
        OpValue::Payload(b) => {
            assert_eq!(b.len(), 4096);
            assert_eq!(md5::compute(&b), digest);
        }
        v => panic!("unexpected value {:?}", v),
    }
}

#[test]
fn concurrent_writes_fire_each_callback_once() {
    setup_log();
    let temp_file = make_temp_file();
    let owned_fd = create_temp_file(temp_file.as_ref());
    let fd = owned_fd.as_raw_fd();
    let ctx = ThreadContext::<ClosureCb>::new(4, 2).unwrap();
    let (done_tx, done_rx) = channel::<i64>();

    let mut ops = Vec::new();
    for i in 0..4u8 {
        let payload = Bytes::copy_from_slice(&[i; 8]);
        let op = Operation::write(payload, fd, i as i64 * 8, 0);
        op.set_callback(send_result(&done_tx));
        ops.push(op);
    }
    assert_eq!(ctx.submit(&ops).unwrap(), 4);
    let mut total = 0;
    for _ in 0..4 {
        total += done_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    }
    assert_eq!(total, 32);
    // No fifth callback anywhere.
    assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
    for op in &ops {
        assert_eq!(op.result(), 8);
        assert_eq!(op.error(), 0);
    }
}

#[test]
fn read_on_bad_fd_completes_with_ebadf() {
    setup_log();
    let ctx = ThreadContext::<ClosureCb>::new(0, 0).unwrap();
    let (done_tx, done_rx) = channel::<i64>();
    let op = Operation::read(16, 999_999, 0, 0).unwrap();
    op.set_callback(send_result(&done_tx));
    assert_eq!(ctx.submit(&[op.clone()]).unwrap(), 1);
    let res = done_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    assert_eq!(res, -(Errno::EBADF as i32 as i64));
    assert_eq!(op.error(), Errno::EBADF as i32);
    let err = op.get_value().unwrap_err();
    assert_eq!(err.desc(), "Bad file descriptor");
}

#[test]
fn zero_length_read_returns_empty() {
    setup_log();
    let temp_file = make_temp_file();
    let owned_fd = create_temp_file(temp_file.as_ref());
    let fd = owned_fd.as_raw_fd();
    let ctx = ThreadContext::<ClosureCb>::new(0, 0).unwrap();
    let (done_tx, done_rx) = channel::<i64>();
    let op = Operation::read(0, fd, 0, 0).unwrap();
    op.set_callback(send_result(&done_tx));
    assert_eq!(ctx.submit(&[op.clone()]).unwrap(), 1);
    assert_eq!(done_rx.recv_timeout(RECV_TIMEOUT).unwrap(), 0);
    match op.get_value().unwrap() {
        OpValue::Payload(b) => assert!(b.is_empty()),
        v => panic!("unexpected value {:?}", v),
    }
}

#[test]
fn fdsync_completes_unit() {
    setup_log();
    let temp_file = make_temp_file();
    let owned_fd = create_temp_file(temp_file.as_ref());
    let fd = owned_fd.as_raw_fd();
    let ctx = ThreadContext::<ClosureCb>::new(0, 0).unwrap();
    let (done_tx, done_rx) = channel::<i64>();
    let op = Operation::fdsync(fd, 0);
    op.set_callback(send_result(&done_tx));
    assert_eq!(ctx.submit(&[op.clone()]).unwrap(), 1);
    assert_eq!(done_rx.recv_timeout(RECV_TIMEOUT).unwrap(), 0);
    assert_eq!(op.get_value().unwrap(), OpValue::Unit);
    assert_eq!(op.error(), 0);
}

#[test]
fn cancel_is_noop_and_resubmit_is_skipped() {
    setup_log();
    let temp_file = make_temp_file();
    let owned_fd = create_temp_file(temp_file.as_ref());
    let fd = owned_fd.as_raw_fd();
    let ctx = ThreadContext::<ClosureCb>::new(0, 0).unwrap();
    let (done_tx, done_rx) = channel::<i64>();
    let op = Operation::write(Bytes::from_static(b"once"), fd, 0, 0);
    op.set_callback(send_result(&done_tx));
    // The same operation twice in one batch arms only once.
    assert_eq!(ctx.submit(&[op.clone(), op.clone()]).unwrap(), 1);
    assert_eq!(ctx.cancel(&op).unwrap(), 0);
    assert_eq!(done_rx.recv_timeout(RECV_TIMEOUT).unwrap(), 4);
    // Completed operations are never re-executed.
    assert_eq!(ctx.submit(&[op.clone()]).unwrap(), 0);
    assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn saturated_queue_rejects_and_rolls_back() {
    setup_log();
    let temp_file = make_temp_file();
    let owned_fd = create_temp_file(temp_file.as_ref());
    let fd = owned_fd.as_raw_fd();
    let ctx = ThreadContext::<ClosureCb>::new(1, 1).unwrap();

    // Park the single worker inside a callback.
    let block = Arc::new(Mutex::new(()));
    let entered = Arc::new(AtomicBool::new(false));
    let guard = block.lock().unwrap();
    let b = block.clone();
    let e = entered.clone();
    let parked = Operation::fsync(fd, 0);
    parked.set_callback(ClosureCb(Box::new(move |_res| {
        e.store(true, Ordering::SeqCst);
        let _g = b.lock();
    })));
    assert_eq!(ctx.submit(&[parked]).unwrap(), 1);
    let deadline = Instant::now() + Duration::from_secs(5);
    while !entered.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "worker never reached the callback");
        std::thread::sleep(Duration::from_millis(2));
    }

    let queued = Operation::fsync(fd, 0);
    assert_eq!(ctx.submit(&[queued]).unwrap(), 1);
    let rejected = Operation::fsync(fd, 0);
    match ctx.submit(&[rejected.clone()]) {
        Err(AioError::Pool(PoolError::QueueFull)) => {}
        other => panic!("expected queue-full, got {:?}", other),
    }
    drop(guard);

    // The rejected operation was rolled back and can be submitted again.
    let (done_tx, done_rx) = channel::<i64>();
    rejected.set_callback(send_result(&done_tx));
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match ctx.submit(&[rejected.clone()]) {
            Ok(1) => break,
            Ok(n) => panic!("unexpected submit count {}", n),
            Err(AioError::Pool(PoolError::QueueFull)) => {
                assert!(Instant::now() < deadline, "queue never drained");
                std::thread::sleep(Duration::from_millis(2));
            }
            Err(e) => panic!("unexpected error {:?}", e),
        }
    }
    assert_eq!(done_rx.recv_timeout(RECV_TIMEOUT).unwrap(), 0);
}

#[test]
fn backends_share_the_context_surface() {
    setup_log();
    let ctx = ThreadContext::<ClosureCb>::new(0, 0).unwrap();
    let ctx: &dyn IoContext<ClosureCb> = &ctx;
    assert_eq!(ctx.max_requests(), 512);
    let op = Operation::noop();
    assert_eq!(ctx.submit(&[op.clone()]).unwrap(), 1);
    assert_eq!(ctx.cancel(&op).unwrap(), 0);
}

#[test]
fn noop_releases_pins_without_callback() {
    setup_log();
    let ctx = ThreadContext::<ClosureCb>::new(0, 0).unwrap();
    let (done_tx, done_rx) = channel::<i64>();
    let op = Operation::noop();
    op.set_callback(send_result(&done_tx));
    assert_eq!(ctx.submit(&[op.clone()]).unwrap(), 1);
    let deadline = Instant::now() + Duration::from_secs(5);
    while !op.is_done() {
        assert!(Instant::now() < deadline, "noop never completed");
        std::thread::sleep(Duration::from_millis(2));
    }
    assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());
    assert_eq!(op.get_value().unwrap(), OpValue::Unit);
    let deadline = Instant::now() + Duration::from_secs(5);
    while std::sync::Arc::strong_count(&op) > 1 {
        assert!(Instant::now() < deadline, "pins were not released");
        std::thread::sleep(Duration::from_millis(2));
    }
}
