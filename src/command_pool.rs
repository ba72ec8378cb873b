//! Command Buffer Pool
//!
//! Recyclable command buffers for one queue family. Submitted buffers come
//! back through [`CommandBufferPool::recycle`] (normally from a deferred
//! reclamation once the GPU has finished with them) and are handed out again
//! oldest first.
//!
//! ```text
//!   get():      retired.pop_front() → reset  |  allocate new
//!               → begin one-time-submit → CommandBuffer
//!   recycle(b): retired.push_back(b)
//! ```
//!
//! Buffers are never freed individually. Dropping the pool while a buffer is
//! still out is a fatal usage error.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::backend::{CommandBufferBackend, NativeHandle};
use crate::errors::Result;
use crate::reclamation::{DeferredReclamationQueue, QueueMask, Reclaimable};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// A command buffer in the recording state, owned by the caller until recycled.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "command buffers must be recycled into their pool"]
pub struct CommandBuffer {
    handle: NativeHandle,
    pool_id: u64,
}

impl CommandBuffer {
    #[inline]
    #[must_use]
    pub fn handle(&self) -> NativeHandle {
        self.handle
    }
}

struct PoolState {
    retired: VecDeque<NativeHandle>,
    outstanding: usize,
    allocated: usize,
}

pub struct CommandBufferPool {
    id: u64,
    queue_family: u32,
    native_pool: NativeHandle,
    backend: Arc<dyn CommandBufferBackend>,
    state: Mutex<PoolState>,
}

impl CommandBufferPool {
    pub fn new(backend: Arc<dyn CommandBufferBackend>, queue_family: u32) -> Result<Self> {
        let native_pool = backend.create_command_pool(queue_family)?;
        Ok(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            queue_family,
            native_pool,
            backend,
            state: Mutex::new(PoolState {
                retired: VecDeque::new(),
                outstanding: 0,
                allocated: 0,
            }),
        })
    }

    /// Returns a buffer that has begun one-time-submit recording.
    pub fn get(&self) -> Result<CommandBuffer> {
        let reused = {
            let mut state = self.state.lock();
            match state.retired.pop_front() {
                Some(handle) => match self.backend.reset_command_buffer(handle) {
                    Ok(()) => Some(handle),
                    Err(err) => {
                        state.retired.push_front(handle);
                        return Err(err);
                    }
                },
                None => None,
            }
        };

        let handle = match reused {
            Some(handle) => handle,
            None => {
                let handle = self.backend.allocate_command_buffer(self.native_pool)?;
                self.state.lock().allocated += 1;
                handle
            }
        };

        if let Err(err) = self.backend.begin_one_time_submit(handle) {
            self.state.lock().retired.push_back(handle);
            return Err(err);
        }

        self.state.lock().outstanding += 1;
        Ok(CommandBuffer {
            handle,
            pool_id: self.id,
        })
    }

    /// Takes `buffer` back for reuse.
    ///
    /// # Panics
    ///
    /// If `buffer` came from a different pool.
    pub fn recycle(&self, buffer: CommandBuffer) {
        assert_eq!(
            buffer.pool_id, self.id,
            "command buffer {:?} does not belong to this pool",
            buffer.handle
        );
        let mut state = self.state.lock();
        state.retired.push_back(buffer.handle);
        state.outstanding -= 1;
    }

    /// Recycles `buffer` once every queue in `mask` has completed.
    pub fn recycle_deferred(
        self: &Arc<Self>,
        buffer: CommandBuffer,
        queue: &DeferredReclamationQueue,
        mask: QueueMask,
    ) {
        queue.release(
            StaleCommandBuffer {
                buffer,
                pool: Arc::clone(self),
            },
            mask,
        );
    }

    #[inline]
    #[must_use]
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Buffers handed out and not yet recycled.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    #[must_use]
    pub fn retired_count(&self) -> usize {
        self.state.lock().retired.len()
    }

    /// Native buffers allocated over the pool's lifetime.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.state.lock().allocated
    }
}

impl Drop for CommandBufferPool {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if !std::thread::panicking() {
            assert_eq!(
                state.outstanding, 0,
                "command buffer pool dropped with {} buffer(s) not recycled",
                state.outstanding
            );
        }
        for handle in state.retired.drain(..) {
            self.backend.free_command_buffer(self.native_pool, handle);
        }
        self.backend.destroy_command_pool(self.native_pool);
        log::debug!(
            "Command buffer pool (queue family {}): {} buffer(s) allocated over its lifetime",
            self.queue_family,
            state.allocated
        );
    }
}

struct StaleCommandBuffer {
    buffer: CommandBuffer,
    pool: Arc<CommandBufferPool>,
}

impl Reclaimable for StaleCommandBuffer {
    fn reclaim(self: Box<Self>) {
        let Self { buffer, pool } = *self;
        pool.recycle(buffer);
    }
}
