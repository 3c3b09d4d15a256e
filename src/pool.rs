//! Buffer and send-event pooling.
//!
//! Two pools back the runtime:
//!
//! - [`BufferPool`] - a process-wide byte-buffer pool keyed by power-of-two
//!   size class. The reassembler rents frame buffers from it on the receive
//!   path.
//! - [`EventPool`] - a pool of per-operation [`SendEvent`] objects used on
//!   the send path. Each event owns a reusable staging buffer that a frame
//!   is serialized into before the writer task picks it up.
//!
//! Both hand out guards ([`PooledBuf`], [`PooledEvent`]) that return the
//! underlying object to the pool exactly once, on drop. That makes the
//! rent/return balance hold on every success and failure path without any
//! cooperation from callers.
//!
//! Pool types are cheap-clone handles; clones share the same storage.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use once_cell::sync::Lazy;
use parking_lot::Mutex;

/// Smallest size class handed out, in bytes.
const MIN_CLASS: usize = 64;

/// Largest pooled size class, in bytes. Rents above this allocate fresh and
/// are dropped on return rather than cached.
const MAX_CLASS: usize = 1 << 20;

/// Maximum buffers cached per size class.
const MAX_PER_CLASS: usize = 64;

static GLOBAL_POOL: Lazy<BufferPool> = Lazy::new(BufferPool::new);

/// The process-wide buffer pool.
pub fn global() -> BufferPool {
    GLOBAL_POOL.clone()
}

/// Rent/return counters, observable for tests and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Total objects handed out.
    pub rented: u64,
    /// Total objects given back.
    pub returned: u64,
}

impl PoolStats {
    /// Objects currently out of the pool.
    pub fn outstanding(&self) -> u64 {
        self.rented - self.returned
    }
}

struct BufferPoolInner {
    classes: Vec<Mutex<Vec<BytesMut>>>,
    rented: AtomicU64,
    returned: AtomicU64,
}

/// Byte-buffer pool keyed by power-of-two size class.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<BufferPoolInner>,
}

impl BufferPool {
    /// Create an empty pool covering all size classes.
    pub fn new() -> Self {
        let class_count = class_index(MAX_CLASS) + 1;
        Self {
            inner: Arc::new(BufferPoolInner {
                classes: (0..class_count).map(|_| Mutex::new(Vec::new())).collect(),
                rented: AtomicU64::new(0),
                returned: AtomicU64::new(0),
            }),
        }
    }

    /// Rent a buffer with capacity for at least `size` bytes.
    ///
    /// The buffer comes back empty (`len == 0`). It returns itself to the
    /// pool when the guard drops.
    pub fn rent(&self, size: usize) -> PooledBuf {
        self.inner.rented.fetch_add(1, Ordering::Relaxed);
        let class = size_class(size);
        let buf = if class <= MAX_CLASS {
            self.inner.classes[class_index(class)].lock().pop()
        } else {
            None
        };
        let buf = buf.unwrap_or_else(|| BytesMut::with_capacity(class.max(size)));
        PooledBuf {
            buf: Some(buf),
            pool: self.clone(),
        }
    }

    /// Counters for rent/return balance checks.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            rented: self.inner.rented.load(Ordering::Relaxed),
            returned: self.inner.returned.load(Ordering::Relaxed),
        }
    }

    fn put_back(&self, mut buf: BytesMut) {
        self.inner.returned.fetch_add(1, Ordering::Relaxed);
        let cap = buf.capacity();
        if cap < MIN_CLASS {
            return;
        }
        // file under the largest class the buffer fully covers, so a rent
        // from that class always gets at least the class capacity
        let class = floor_class(cap);
        if class > MAX_CLASS {
            return;
        }
        buf.clear();
        let mut stack = self.inner.classes[class_index(class)].lock();
        if stack.len() < MAX_PER_CLASS {
            stack.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Round `size` up to its power-of-two class, floored at [`MIN_CLASS`].
fn size_class(size: usize) -> usize {
    size.max(MIN_CLASS).next_power_of_two()
}

/// Largest power of two not exceeding `cap` (`cap` must be nonzero).
fn floor_class(cap: usize) -> usize {
    1 << (usize::BITS - 1 - cap.leading_zeros())
}

fn class_index(class: usize) -> usize {
    (class.trailing_zeros() - MIN_CLASS.trailing_zeros()) as usize
}

/// A byte buffer rented from a [`BufferPool`]; returns itself on drop.
pub struct PooledBuf {
    buf: Option<BytesMut>,
    pool: BufferPool,
}

impl Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer present until drop")
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer present until drop")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put_back(buf);
        }
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.deref().len())
            .field("capacity", &self.deref().capacity())
            .finish()
    }
}

/// One send operation's state: the staging buffer a frame is serialized
/// into before the writer task writes it out.
#[derive(Default)]
pub struct SendEvent {
    buf: BytesMut,
}

impl SendEvent {
    /// The serialized frame bytes staged so far.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Mutable access to the staging buffer.
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    /// Frame length currently staged.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn reset(&mut self) {
        self.buf.clear();
    }
}

struct EventPoolInner {
    shells: Mutex<Vec<SendEvent>>,
    cap: usize,
    rented: AtomicU64,
    returned: AtomicU64,
}

/// Pool of [`SendEvent`] objects.
///
/// Pre-populated at construction so the first rents never observe an empty
/// pool; when it does run empty, `rent` constructs a fresh event instead of
/// failing.
#[derive(Clone)]
pub struct EventPool {
    inner: Arc<EventPoolInner>,
}

impl EventPool {
    /// Create a pool pre-populated with `count` events.
    pub fn with_capacity(count: usize) -> Self {
        Self {
            inner: Arc::new(EventPoolInner {
                shells: Mutex::new((0..count).map(|_| SendEvent::default()).collect()),
                cap: count,
                rented: AtomicU64::new(0),
                returned: AtomicU64::new(0),
            }),
        }
    }

    /// Rent a send event. Constructs a fresh one when the pool is empty.
    pub fn rent(&self) -> PooledEvent {
        self.inner.rented.fetch_add(1, Ordering::Relaxed);
        let ev = self.inner.shells.lock().pop().unwrap_or_default();
        PooledEvent {
            ev: Some(ev),
            pool: self.clone(),
        }
    }

    /// Counters for rent/return balance checks.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            rented: self.inner.rented.load(Ordering::Relaxed),
            returned: self.inner.returned.load(Ordering::Relaxed),
        }
    }

    /// Events currently cached.
    pub fn idle(&self) -> usize {
        self.inner.shells.lock().len()
    }

    fn put_back(&self, mut ev: SendEvent) {
        self.inner.returned.fetch_add(1, Ordering::Relaxed);
        ev.reset();
        let mut shells = self.inner.shells.lock();
        if shells.len() < self.inner.cap {
            shells.push(ev);
        }
    }
}

/// A send event rented from an [`EventPool`]; returns itself on drop.
pub struct PooledEvent {
    ev: Option<SendEvent>,
    pool: EventPool,
}

impl Deref for PooledEvent {
    type Target = SendEvent;

    fn deref(&self) -> &SendEvent {
        self.ev.as_ref().expect("event present until drop")
    }
}

impl DerefMut for PooledEvent {
    fn deref_mut(&mut self) -> &mut SendEvent {
        self.ev.as_mut().expect("event present until drop")
    }
}

impl Drop for PooledEvent {
    fn drop(&mut self) {
        if let Some(ev) = self.ev.take() {
            self.pool.put_back(ev);
        }
    }
}
