//! Bounded overwrite queue.
//!
//! Fixed-capacity ring buffer for one producer and one consumer. A `put`
//! on a full queue never fails: it overwrites the most recently written
//! element and reports the overflow. A `get` never blocks.
//!
//! # Cursor protocol
//!
//! ```text
//!   rd ──► oldest element          wr ──► next free slot
//!   overflow = true  ⇒  slot `wr` holds an extra, not yet committed element
//!
//!   used  = (n + wr - rd) % n + overflow
//!   empty = wr == rd && !overflow
//!   full  = (wr + 1) % n == rd && overflow
//! ```
//!
//! The reader owns `rd`, the writer owns `wr`. Both run lock-free except
//! when the overflow slot is involved: a write into a full queue, a write
//! while the overflow slot is still occupied, and a read of the overflow
//! slot all take the internal mutex.
//!
//! # Ordering
//!
//! ```text
//! writer fills slot, then Release-stores wr  →  reader Acquire-loads wr, then reads slot
//! reader reads slot, then Release-stores rd  →  writer Acquire-loads rd, then fills slot
//! ```

use crate::error::QueueError;
use parking_lot::Mutex;
use seq_common::consts::QUEUE_MAX_ELEMENTS;
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Fixed-capacity overwrite-on-full queue.
pub struct BoundedQueue<T> {
    slots: Box<[UnsafeCell<T>]>,
    wr: AtomicUsize,
    rd: AtomicUsize,
    overflow: AtomicBool,
    lock: Mutex<()>,
}

// SAFETY: the writer only touches slot `wr` and the reader only touches
// slot `rd`. They coincide only while `overflow` is set, and every access
// in that state happens under `lock`.
unsafe impl<T: Send> Send for BoundedQueue<T> {}
unsafe impl<T: Send> Sync for BoundedQueue<T> {}

impl<T: Default> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` elements.
    ///
    /// # Errors
    ///
    /// - `QueueError::ZeroCapacity` if `capacity` is 0
    /// - `QueueError::ZeroElementSize` if `T` is zero-sized
    /// - `QueueError::CapacityTooLarge` above [`QUEUE_MAX_ELEMENTS`]
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity == 0 {
            return Err(QueueError::ZeroCapacity);
        }
        if std::mem::size_of::<T>() == 0 {
            return Err(QueueError::ZeroElementSize);
        }
        if capacity > QUEUE_MAX_ELEMENTS {
            return Err(QueueError::CapacityTooLarge {
                requested: capacity,
                max: QUEUE_MAX_ELEMENTS,
            });
        }
        let slots = (0..capacity).map(|_| UnsafeCell::new(T::default())).collect();
        Ok(Self {
            slots,
            wr: AtomicUsize::new(0),
            rd: AtomicUsize::new(0),
            overflow: AtomicBool::new(false),
            lock: Mutex::new(()),
        })
    }

    /// Take the oldest element out. `None` if the queue is empty.
    pub fn get(&self) -> Option<T> {
        self.get_with(std::mem::take)
    }
}

impl<T> BoundedQueue<T> {
    /// Number of slots.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Size of one element in bytes.
    pub fn element_size(&self) -> usize {
        std::mem::size_of::<T>()
    }

    fn next(&self, index: usize) -> usize {
        (index + 1) % self.slots.len()
    }

    /// Write one element. Returns true if the queue was full and the most
    /// recently written element was overwritten.
    pub fn put(&self, value: T) -> bool {
        self.put_with(|slot| *slot = value)
    }

    /// Write one element in place. Same overflow semantics as [`put`](Self::put).
    pub fn put_with(&self, write: impl FnOnce(&mut T)) -> bool {
        let wr = self.wr.load(Ordering::Acquire);
        let rd = self.rd.load(Ordering::Acquire);

        if !self.overflow.load(Ordering::Acquire) && self.next(wr) != rd {
            // SAFETY: slot `wr` is outside [rd, wr) and not the overflow slot,
            // so the reader cannot be accessing it.
            write(unsafe { &mut *self.slots[wr].get() });
            self.wr.store(self.next(wr), Ordering::Release);
            return false;
        }

        let _guard = self.lock.lock();
        let mut wr = self.wr.load(Ordering::Acquire);
        let rd = self.rd.load(Ordering::Acquire);
        let mut overwritten = false;

        if self.next(wr) == rd {
            overwritten = self.overflow.load(Ordering::Acquire);
            self.overflow.store(true, Ordering::Release);
        } else if self.overflow.load(Ordering::Acquire) {
            // the reader made room: commit the overflow element
            wr = self.next(wr);
            self.wr.store(wr, Ordering::Release);
            if self.next(wr) != rd {
                self.overflow.store(false, Ordering::Release);
            }
        }

        // SAFETY: we hold the lock; the reader touches slot `wr` only under
        // the same lock (overflow set) or once `wr` has moved past it.
        write(unsafe { &mut *self.slots[wr].get() });

        if !self.overflow.load(Ordering::Acquire) {
            self.wr.store(self.next(wr), Ordering::Release);
        }
        overwritten
    }

    /// Read the oldest element in place. `None` if the queue is empty.
    pub fn get_with<R>(&self, read: impl FnOnce(&mut T) -> R) -> Option<R> {
        let rd = self.rd.load(Ordering::Acquire);
        let wr = self.wr.load(Ordering::Acquire);

        if wr != rd {
            // SAFETY: slot `rd` lies in [rd, wr), which the writer never
            // touches until `rd` moves on.
            let out = read(unsafe { &mut *self.slots[rd].get() });
            self.rd.store(self.next(rd), Ordering::Release);
            return Some(out);
        }
        if !self.overflow.load(Ordering::Acquire) {
            return None;
        }

        let _guard = self.lock.lock();
        let rd = self.rd.load(Ordering::Acquire);
        // SAFETY: with `overflow` set the writer accesses slots only under the lock.
        let out = read(unsafe { &mut *self.slots[rd].get() });
        if self.wr.load(Ordering::Acquire) == rd && self.overflow.load(Ordering::Acquire) {
            self.overflow.store(false, Ordering::Release);
        } else {
            self.rd.store(self.next(rd), Ordering::Release);
        }
        Some(out)
    }

    /// Discard all elements.
    pub fn flush(&self) {
        let _guard = self.lock.lock();
        self.rd
            .store(self.wr.load(Ordering::Acquire), Ordering::Release);
        self.overflow.store(false, Ordering::Release);
    }

    /// Number of elements currently held.
    pub fn used(&self) -> usize {
        let n = self.slots.len();
        let wr = self.wr.load(Ordering::Acquire);
        let rd = self.rd.load(Ordering::Acquire);
        (n + wr - rd) % n + usize::from(self.overflow.load(Ordering::Acquire))
    }

    /// Number of free slots.
    pub fn free(&self) -> usize {
        self.slots.len().saturating_sub(self.used())
    }

    /// True if no element is held.
    pub fn is_empty(&self) -> bool {
        self.wr.load(Ordering::Acquire) == self.rd.load(Ordering::Acquire)
            && !self.overflow.load(Ordering::Acquire)
    }

    /// True if every slot is occupied.
    pub fn is_full(&self) -> bool {
        self.next(self.wr.load(Ordering::Acquire)) == self.rd.load(Ordering::Acquire)
            && self.overflow.load(Ordering::Acquire)
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedQueue")
            .field("capacity", &self.capacity())
            .field("used", &self.used())
            .field("element_size", &self.element_size())
            .finish()
    }
}
