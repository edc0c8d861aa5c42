use crossbeam_queue::ArrayQueue;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Smallest bucket capacity handed out by the pool.
const MIN_BUCKET: usize = 16;
/// Bucket capacities double from [`MIN_BUCKET`] up to 16 << 8 = 4096 slots.
const BUCKET_COUNT: usize = 9;
/// Free-list depth per bucket; beyond this, returned buffers are dropped.
const FREE_LIST_DEPTH: usize = 64;

/// Counters for pool behaviour, all monotonic.
#[derive(Debug, Default)]
struct PoolCounters {
    rents: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    returns: AtomicU64,
}

/// Point-in-time view of pool activity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    pub rents: u64,
    pub hits: u64,
    pub misses: u64,
    pub returns: u64,
}

/// Size-bucketed free-list pool for hot-path slice storage.
///
/// Renting pops a recycled buffer from the matching power-of-two bucket
/// (tens of nanoseconds) or allocates on a miss; dropping a [`PooledBuf`]
/// clears it and pushes it back. Requests larger than the biggest bucket
/// fall through to plain allocation and are not recycled.
pub struct ArrayPool<T> {
    buckets: Vec<Bucket<T>>,
    counters: PoolCounters,
}

struct Bucket<T> {
    capacity: usize,
    free: ArrayQueue<Vec<T>>,
}

impl<T> ArrayPool<T> {
    /// Creates an empty pool.
    pub fn new() -> Arc<Self> {
        let buckets = (0..BUCKET_COUNT)
            .map(|i| Bucket {
                capacity: MIN_BUCKET << i,
                free: ArrayQueue::new(FREE_LIST_DEPTH),
            })
            .collect();
        Arc::new(Self {
            buckets,
            counters: PoolCounters::default(),
        })
    }

    /// Rents an empty buffer with capacity for at least `min_len` elements.
    pub fn rent(self: &Arc<Self>, min_len: usize) -> PooledBuf<T> {
        self.counters.rents.fetch_add(1, Ordering::Relaxed);

        let Some(bucket_idx) = self.bucket_for(min_len) else {
            // Oversized request: plain allocation, never recycled.
            self.counters.misses.fetch_add(1, Ordering::Relaxed);
            return PooledBuf {
                data: Vec::with_capacity(min_len),
                home: None,
            };
        };

        let data = match self.buckets[bucket_idx].free.pop() {
            Some(buf) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(self.buckets[bucket_idx].capacity)
            }
        };

        PooledBuf {
            data,
            home: Some((Arc::clone(self), bucket_idx)),
        }
    }

    /// Pool activity counters.
    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            rents: self.counters.rents.load(Ordering::Relaxed),
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            returns: self.counters.returns.load(Ordering::Relaxed),
        }
    }

    fn bucket_for(&self, min_len: usize) -> Option<usize> {
        self.buckets.iter().position(|b| b.capacity >= min_len)
    }

    fn give_back(&self, bucket_idx: usize, mut buf: Vec<T>) {
        buf.clear();
        self.counters.returns.fetch_add(1, Ordering::Relaxed);
        // Full free list: let the buffer drop.
        let _ = self.buckets[bucket_idx].free.push(buf);
    }
}

/// A buffer rented from an [`ArrayPool`], returned on drop.
///
/// Grows through [`push`](Self::push) during construction, then reads as a
/// plain slice. The backing storage must not be retained past the drop;
/// ownership semantics make that impossible from safe code.
pub struct PooledBuf<T> {
    data: Vec<T>,
    home: Option<(Arc<ArrayPool<T>>, usize)>,
}

impl<T: std::fmt::Debug> std::fmt::Debug for PooledBuf<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(&self.data).finish()
    }
}

impl<T> PooledBuf<T> {
    /// Appends an element.
    #[inline]
    pub fn push(&mut self, value: T) {
        self.data.push(value);
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }
}

impl<T: Clone> PooledBuf<T> {
    /// Appends a whole slice.
    pub fn extend_from_slice(&mut self, values: &[T]) {
        self.data.extend_from_slice(values);
    }
}

impl<T> Deref for PooledBuf<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.data
    }
}

impl<T> Drop for PooledBuf<T> {
    fn drop(&mut self) {
        if let Some((pool, bucket_idx)) = self.home.take() {
            pool.give_back(bucket_idx, std::mem::take(&mut self.data));
        }
    }
}

impl<T: PartialEq> PartialEq for PooledBuf<T> {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}
