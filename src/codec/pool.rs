//! Size-classed buffer pool.
//!
//! The WAL encode path and the stripe writer churn through short-lived
//! scratch buffers at high rates. [`BufPool`] recycles them: buffers are
//! size-classed to powers of two in `[32 B, 8 MiB]`, each class keeping a
//! bounded free list.
//!
//! # Contract
//!
//! - [`BufPool::get`] rounds the request up to the next class and returns
//!   a **cleared** buffer (`len == class size`, all zero).
//! - [`BufPool::release`] returns a buffer to its class. Buffers whose
//!   capacity is not an exact power of two inside the class range are
//!   rejected — accepting them would poison the pool with buffers that
//!   `get` mis-sizes.
//! - A checked-out buffer has exactly one owner. The pool itself is
//!   thread-safe.
//! - Free lists are bounded ([`MAX_FREE_PER_CLASS`]); surplus releases
//!   drop the buffer instead of growing the pool without bound.

use std::sync::Mutex;

/// Smallest buffer class (32 B).
pub const MIN_CLASS: usize = 32;

/// Largest buffer class (8 MiB).
pub const MAX_CLASS: usize = 8 * 1024 * 1024;

/// Maximum number of idle buffers retained per class.
pub const MAX_FREE_PER_CLASS: usize = 64;

/// Number of power-of-two classes in `[MIN_CLASS, MAX_CLASS]`.
const CLASS_COUNT: usize = (MAX_CLASS.ilog2() - MIN_CLASS.ilog2() + 1) as usize;

/// A thread-safe pool of power-of-two sized byte buffers.
pub struct BufPool {
    /// One bounded free list per size class, smallest class first.
    classes: Vec<Mutex<Vec<Vec<u8>>>>,
}

impl BufPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        let mut classes = Vec::with_capacity(CLASS_COUNT);
        for _ in 0..CLASS_COUNT {
            classes.push(Mutex::new(Vec::new()));
        }
        Self { classes }
    }

    /// Index of the class serving a request of `size` bytes, or `None`
    /// when `size` exceeds [`MAX_CLASS`].
    fn class_index(size: usize) -> Option<usize> {
        if size > MAX_CLASS {
            return None;
        }
        let rounded = size.max(MIN_CLASS).next_power_of_two();
        Some((rounded.ilog2() - MIN_CLASS.ilog2()) as usize)
    }

    /// Byte size of the class at `idx`.
    fn class_size(idx: usize) -> usize {
        MIN_CLASS << idx
    }

    /// Checks out a cleared buffer of at least `size` bytes.
    ///
    /// The returned buffer's length is the class size (the request rounded
    /// up to a power of two) and every byte is zero. Requests larger than
    /// [`MAX_CLASS`] are served with a one-off allocation that
    /// [`release`](Self::release) will refuse to take back.
    pub fn get(&self, size: usize) -> Vec<u8> {
        let Some(idx) = Self::class_index(size) else {
            return vec![0u8; size];
        };
        let class_size = Self::class_size(idx);

        let recycled = {
            let mut free = match self.classes[idx].lock() {
                Ok(guard) => guard,
                // A poisoned free list only loses recycling, never data.
                Err(poisoned) => poisoned.into_inner(),
            };
            free.pop()
        };

        match recycled {
            Some(mut buf) => {
                buf.clear();
                buf.resize(class_size, 0);
                buf
            }
            None => vec![0u8; class_size],
        }
    }

    /// Returns a buffer to the pool.
    ///
    /// Returns `true` if the buffer was retained. Buffers are dropped
    /// (and `false` returned) when:
    ///
    /// - capacity is not an exact power of two within
    ///   `[MIN_CLASS, MAX_CLASS]`, or
    /// - the class free list is already at [`MAX_FREE_PER_CLASS`].
    pub fn release(&self, buf: Vec<u8>) -> bool {
        let cap = buf.capacity();
        if cap < MIN_CLASS || cap > MAX_CLASS || !cap.is_power_of_two() {
            return false;
        }
        let idx = (cap.ilog2() - MIN_CLASS.ilog2()) as usize;

        let mut free = match self.classes[idx].lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if free.len() >= MAX_FREE_PER_CLASS {
            return false;
        }
        free.push(buf);
        true
    }

    /// Total number of idle buffers currently retained across all classes.
    pub fn idle_count(&self) -> usize {
        self.classes
            .iter()
            .map(|class| match class.lock() {
                Ok(guard) => guard.len(),
                Err(poisoned) => poisoned.into_inner().len(),
            })
            .sum()
    }

    /// Drops every idle buffer. Called on engine close.
    pub fn drain(&self) {
        for class in &self.classes {
            match class.lock() {
                Ok(mut guard) => guard.clear(),
                Err(poisoned) => poisoned.into_inner().clear(),
            }
        }
    }
}

impl Default for BufPool {
    fn default() -> Self {
        Self::new()
    }
}
