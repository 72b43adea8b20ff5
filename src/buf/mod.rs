//! Pooled byte buffers with reader/writer cursors.
//!
//! A [`Buf`] is a view into reference-counted backing storage rented from a
//! thread-local pool of power-of-two size classes. Cheap referential slices
//! share the storage without copying; the storage returns to the pool exactly
//! once, when the last view over it is dropped. Buffers are `!Send` and stay
//! on the thread that allocated them.

pub mod queue;

pub use queue::BufQueue;

use std::cell::{Cell, RefCell, UnsafeCell};
use std::cmp;
use std::fmt;
use std::io;
use std::rc::Rc;
use std::slice;

/// Smallest size class handed out by the pool.
const MIN_CAPACITY: usize = 32;

/// Largest size class kept by the pool, 1 GiB.
const MAX_POOLED_CAPACITY: usize = 1 << 30;

const NUM_CLASSES: usize = 26;

thread_local! {
    static POOL: Pool = Pool::new();
}

struct Pool {
    classes: RefCell<Vec<Vec<Box<[u8]>>>>,
    allocated: Cell<u64>,
    reused: Cell<u64>,
    reclaimed: Cell<u64>,
}

impl Pool {
    fn new() -> Pool {
        Pool {
            classes: RefCell::new((0..NUM_CLASSES).map(|_| Vec::new()).collect()),
            allocated: Cell::new(0),
            reused: Cell::new(0),
            reclaimed: Cell::new(0),
        }
    }

    fn rent(&self, size: usize) -> Box<[u8]> {
        let capacity = size.max(MIN_CAPACITY).next_power_of_two();
        if let Some(class) = class_of(capacity) {
            if let Some(bytes) = self.classes.borrow_mut()[class].pop() {
                self.reused.set(self.reused.get() + 1);
                return bytes;
            }
        }
        self.allocated.set(self.allocated.get() + 1);
        vec![0u8; capacity].into_boxed_slice()
    }

    fn give_back(&self, bytes: Box<[u8]>) {
        if let Some(class) = class_of(bytes.len()) {
            self.reclaimed.set(self.reclaimed.get() + 1);
            self.classes.borrow_mut()[class].push(bytes);
        }
    }
}

fn class_of(capacity: usize) -> Option<usize> {
    if capacity.is_power_of_two()
        && (MIN_CAPACITY..=MAX_POOLED_CAPACITY).contains(&capacity)
    {
        Some(capacity.trailing_zeros() as usize - MIN_CAPACITY.trailing_zeros() as usize)
    } else {
        None
    }
}

/// Counters of the current thread's buffer pool, for leak checks in tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Fresh storage allocations that missed the pool.
    pub allocated: u64,
    /// Allocations served from pooled storage.
    pub reused: u64,
    /// Storage blocks returned to the pool.
    pub reclaimed: u64,
}

impl PoolStats {
    /// Number of storage blocks currently held outside the pool.
    pub fn in_flight(&self) -> i64 {
        (self.allocated + self.reused) as i64 - self.reclaimed as i64
    }
}

/// Snapshot of the current thread's pool counters.
pub fn pool_stats() -> PoolStats {
    POOL.with(|pool| PoolStats {
        allocated: pool.allocated.get(),
        reused: pool.reused.get(),
        reclaimed: pool.reclaimed.get(),
    })
}

/// Drops all pooled storage on the current thread.
pub fn clear_pool() {
    POOL.with(|pool| {
        for class in pool.classes.borrow_mut().iter_mut() {
            class.clear();
        }
    });
}

struct Storage {
    bytes: UnsafeCell<Box<[u8]>>,
}

impl Storage {
    fn capacity(&self) -> usize {
        // Safety: the box itself (pointer and length) is never replaced
        // while the storage is alive, only its bytes are written.
        unsafe { (&*self.bytes.get()).len() }
    }

    fn ptr(&self) -> *mut u8 {
        unsafe { (&mut *self.bytes.get()).as_mut_ptr() }
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        let bytes = std::mem::take(self.bytes.get_mut());
        // TLS may already be torn down during thread exit; then the
        // storage is simply freed instead of pooled.
        let _ = POOL.try_with(|pool| pool.give_back(bytes));
    }
}

/// A pooled byte buffer with independent read (`head`) and write (`tail`)
/// cursors over shared backing storage.
///
/// The readable region is `head..tail`. Appending requires either unique
/// ownership of the storage or triggers a copy into fresh storage, so the
/// bytes visible through any outstanding [`slice`](Buf::slice) are immutable.
pub struct Buf {
    storage: Rc<Storage>,
    head: usize,
    tail: usize,
}

impl Buf {
    /// Rents storage for at least `size` bytes from the thread-local pool.
    pub fn allocate(size: usize) -> Buf {
        let bytes = POOL.with(|pool| pool.rent(size));
        Buf {
            storage: Rc::new(Storage {
                bytes: UnsafeCell::new(bytes),
            }),
            head: 0,
            tail: 0,
        }
    }

    /// Allocates a buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Buf {
        let mut buf = Buf::allocate(data.len());
        buf.put(data);
        buf
    }

    /// Total capacity of the backing storage.
    pub fn capacity(&self) -> usize {
        self.storage.capacity()
    }

    /// Number of readable bytes.
    pub fn remaining(&self) -> usize {
        self.tail - self.head
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Spare capacity past the write cursor.
    pub fn write_remaining(&self) -> usize {
        self.capacity() - self.tail
    }

    /// The readable bytes.
    pub fn as_slice(&self) -> &[u8] {
        // Safety: bytes in head..tail are never mutated while any view
        // can read them; writes only land past `tail`, and extending
        // `tail` requires unique storage.
        unsafe { slice::from_raw_parts(self.storage.ptr().add(self.head), self.remaining()) }
    }

    /// The writable spare region, `tail..capacity`.
    ///
    /// Callers write into the returned slice and then [`commit`](Buf::commit)
    /// the number of bytes produced. Unshares the storage first.
    pub fn write_slice(&mut self) -> &mut [u8] {
        self.unshare(self.capacity());
        let len = self.write_remaining();
        // Safety: storage is unique after unshare and the region past
        // `tail` is invisible to readers, so no aliasing is possible.
        unsafe { slice::from_raw_parts_mut(self.storage.ptr().add(self.tail), len) }
    }

    /// Advances the write cursor over `n` bytes written via
    /// [`write_slice`](Buf::write_slice).
    pub fn commit(&mut self, n: usize) {
        debug_assert!(n <= self.write_remaining());
        debug_assert_eq!(Rc::strong_count(&self.storage), 1);
        self.tail += n;
    }

    /// Consumes `n` readable bytes.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining());
        self.head += n;
    }

    /// First readable byte, if any.
    pub fn first(&self) -> Option<u8> {
        self.as_slice().first().copied()
    }

    /// Consumes and returns one byte.
    pub fn get_byte(&mut self) -> u8 {
        debug_assert!(!self.is_empty());
        let byte = self.as_slice()[0];
        self.head += 1;
        byte
    }

    /// Appends `data`, growing through the pool when the spare capacity is
    /// insufficient or the storage is shared.
    pub fn put(&mut self, data: &[u8]) {
        self.ensure_write_remaining(data.len());
        self.write_slice()[..data.len()].copy_from_slice(data);
        self.tail += data.len();
    }

    /// Guarantees at least `n` bytes of unique spare capacity.
    pub fn ensure_write_remaining(&mut self, n: usize) {
        if self.write_remaining() < n || Rc::strong_count(&self.storage) > 1 {
            self.unshare(self.remaining() + n);
        }
    }

    /// A zero-copy view over the whole readable region.
    ///
    /// The returned buffer shares the backing storage; the storage is
    /// reclaimed once, when the last of the views is dropped.
    pub fn slice(&self) -> Buf {
        Buf {
            storage: Rc::clone(&self.storage),
            head: self.head,
            tail: self.tail,
        }
    }

    /// A zero-copy view over the first `n` readable bytes.
    pub fn slice_to(&self, n: usize) -> Buf {
        debug_assert!(n <= self.remaining());
        Buf {
            storage: Rc::clone(&self.storage),
            head: self.head,
            tail: self.head + n,
        }
    }

    /// Moves the storage to fresh unique storage of at least `min_capacity`,
    /// preserving the readable bytes at the front.
    fn unshare(&mut self, min_capacity: usize) {
        if Rc::strong_count(&self.storage) == 1 && self.capacity() >= min_capacity {
            return;
        }
        let mut fresh = Buf::allocate(min_capacity.max(self.remaining()));
        let remaining = self.remaining();
        if remaining > 0 {
            // Safety: fresh storage is unique and its spare region starts
            // at zero; the source readable region is immutable.
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.storage.ptr().add(self.head),
                    fresh.storage.ptr(),
                    remaining,
                );
            }
        }
        fresh.tail = remaining;
        *self = fresh;
    }
}

impl fmt::Debug for Buf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buf")
            .field("remaining", &self.remaining())
            .field("capacity", &self.capacity())
            .field("shared", &(Rc::strong_count(&self.storage) > 1))
            .finish()
    }
}

impl io::Write for Buf {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.put(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl io::Read for Buf {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        let n = cmp::min(dst.len(), self.remaining());
        dst[..n].copy_from_slice(&self.as_slice()[..n]);
        self.advance(n);
        Ok(n)
    }
}
