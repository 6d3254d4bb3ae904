//! Reusable byte buffers for per-tick serialization.
//!
//! The predictive loop serializes one input batch per tick. Pooling the
//! buffers keeps that loop free of steady-state allocation.

use crate::SessionError;
use parking_lot::Mutex;
use serde::Serialize;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

#[derive(Debug, Default)]
struct PoolInner {
    free: Mutex<Vec<Vec<u8>>>,
}

/// A shared pool of byte buffers. Cloning yields another handle to the same
/// pool; buffers hand themselves back when dropped.
#[derive(Debug, Clone, Default)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a cleared buffer from the pool, allocating a fresh one if the
    /// pool is empty.
    pub fn get(&self) -> PooledBuffer {
        let buf = self.inner.free.lock().pop().unwrap_or_default();
        PooledBuffer { buf, pool: Arc::clone(&self.inner) }
    }

    /// Number of buffers currently parked in the pool.
    pub fn available(&self) -> usize {
        self.inner.free.lock().len()
    }
}

/// A byte buffer on loan from a [`BufferPool`]. Dereferences to `Vec<u8>` and
/// returns itself, cleared, to the pool on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Vec<u8>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();
        self.pool.free.lock().push(buf);
    }
}

/// Serializes `value` into a pooled buffer.
pub fn encode_pooled<T: Serialize>(
    pool: &BufferPool,
    value: &T,
) -> Result<PooledBuffer, SessionError> {
    let mut buf = pool.get();
    bincode::serialize_into(&mut *buf, value)?;
    Ok(buf)
}
