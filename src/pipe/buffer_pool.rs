//! Shared free list of the buffers a device node allocated
//!
//! Upstream producers `acquire()` buffers to build frames, downstream
//! consumers `release()` them when done, and `prepare()` draws its priming
//! buffers from here. Each index can be free at most once; a release of an
//! index that is already free or outside the pool is logged and dropped.

use crate::types::Buffer;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct PoolInner {
    free: VecDeque<Buffer>,
    is_free: Vec<bool>,
}

/// Cloneable handle to a pipe's buffer pool
#[derive(Debug, Clone)]
pub struct BufferPool {
    name: Arc<str>,
    inner: Arc<Mutex<PoolInner>>,
}

impl BufferPool {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            inner: Arc::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the pool contents with freshly allocated buffers
    pub fn fill(&self, buffers: Vec<Buffer>) {
        let size = buffers.iter().map(|b| b.index + 1).max().unwrap_or(0);
        let mut inner = self.lock();
        inner.is_free = vec![false; size];
        inner.free.clear();
        for buffer in buffers {
            inner.is_free[buffer.index] = true;
            inner.free.push_back(buffer);
        }
    }

    /// Forget every buffer
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.free.clear();
        inner.is_free.clear();
    }

    /// Number of indices in the pool
    pub fn size(&self) -> usize {
        self.lock().is_free.len()
    }

    /// Buffers currently free
    pub fn available(&self) -> usize {
        self.lock().free.len()
    }

    pub fn contains_index(&self, index: usize) -> bool {
        index < self.size()
    }

    /// Take a free buffer
    pub fn acquire(&self) -> Option<Buffer> {
        let mut inner = self.lock();
        let buffer = inner.free.pop_front()?;
        inner.is_free[buffer.index] = false;
        Some(buffer)
    }

    /// Return a buffer; returns false if it was dropped instead
    pub fn release(&self, buffer: Buffer) -> bool {
        let mut inner = self.lock();
        match inner.is_free.get(buffer.index).copied() {
            Some(false) => {
                inner.is_free[buffer.index] = true;
                inner.free.push_back(buffer);
                true
            }
            Some(true) => {
                tracing::warn!("{}: buffer {} released twice, dropped", self.name, buffer.index);
                false
            }
            None => {
                tracing::debug!(
                    "{}: buffer {} not in pool of {}, dropped",
                    self.name,
                    buffer.index,
                    inner.is_free.len()
                );
                false
            }
        }
    }
}
