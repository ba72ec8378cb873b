//! Command Buffer Pool Tests
//!
//! Tests for:
//! - Buffers come out recording, fresh or recycled
//! - Recycled buffers are reused before new ones are allocated
//! - Deferred recycling through the reclamation queue
//! - Native cleanup when the pool is dropped

use std::sync::Arc;

use ember::backend::HeadlessBackend;
use ember::command_pool::CommandBufferPool;
use ember::reclamation::{DeferredReclamationQueue, QueueMask};

#[test]
fn every_buffer_is_handed_out_recording() {
    let backend = Arc::new(HeadlessBackend::default());
    let pool = CommandBufferPool::new(backend.clone(), 2).unwrap();
    assert_eq!(pool.queue_family(), 2);

    let fresh = pool.get().unwrap();
    assert!(backend.is_recording(fresh.handle()));
    let handle = fresh.handle();
    pool.recycle(fresh);

    let reused = pool.get().unwrap();
    assert_eq!(reused.handle(), handle);
    assert!(backend.is_recording(reused.handle()));
    pool.recycle(reused);
}

#[test]
fn steady_state_allocates_nothing_new() {
    let backend = Arc::new(HeadlessBackend::default());
    let pool = CommandBufferPool::new(backend.clone(), 0).unwrap();

    for _ in 0..10 {
        let frame: Vec<_> = (0..3).map(|_| pool.get().unwrap()).collect();
        assert_eq!(pool.outstanding(), 3);
        for buffer in frame {
            pool.recycle(buffer);
        }
    }
    assert_eq!(pool.allocated_count(), 3);
    assert_eq!(pool.retired_count(), 3);
    assert_eq!(pool.outstanding(), 0);
    assert_eq!(backend.live_command_buffer_count(), 3);
}

#[test]
fn deferred_recycle_waits_for_the_queue() {
    let backend = Arc::new(HeadlessBackend::default());
    let pool = Arc::new(CommandBufferPool::new(backend.clone(), 0).unwrap());
    let queue = DeferredReclamationQueue::new();

    let submitted = pool.get().unwrap();
    let handle = submitted.handle();
    pool.recycle_deferred(submitted, &queue, QueueMask::queue(0));
    assert_eq!(pool.outstanding(), 1);

    // Still in flight: a second request gets a new buffer
    let other = pool.get().unwrap();
    assert_ne!(other.handle(), handle);

    assert_eq!(queue.purge(QueueMask::queue(0)), 1);
    assert_eq!(pool.outstanding(), 1);
    let reused = pool.get().unwrap();
    assert_eq!(reused.handle(), handle);

    pool.recycle(other);
    pool.recycle(reused);
}

#[test]
#[should_panic(expected = "does not belong")]
fn recycling_into_the_wrong_pool_panics() {
    let backend = Arc::new(HeadlessBackend::default());
    let a = CommandBufferPool::new(backend.clone(), 0).unwrap();
    let b = CommandBufferPool::new(backend, 0).unwrap();
    let buffer = a.get().unwrap();
    b.recycle(buffer);
}

#[test]
fn drop_frees_native_objects() {
    let backend = Arc::new(HeadlessBackend::default());
    {
        let pool = CommandBufferPool::new(backend.clone(), 0).unwrap();
        let buffers: Vec<_> = (0..4).map(|_| pool.get().unwrap()).collect();
        for buffer in buffers {
            pool.recycle(buffer);
        }
        assert_eq!(backend.live_command_pool_count(), 1);
    }
    assert_eq!(backend.live_command_pool_count(), 0);
    assert_eq!(backend.live_command_buffer_count(), 0);
}
