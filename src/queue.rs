//! Join tasks and the bounded queues that carry them from the partitioning
//! phase to the join phase.
use std::{
    cell::UnsafeCell,
    collections::VecDeque,
    mem::MaybeUninit,
    sync::atomic::{AtomicU64, Ordering},
};

use parking_lot::Mutex;

use crate::buffer::RowSpan;

/// A co-partitioned pair of sub-relations.
///
/// `tmp_r`/`tmp_s` are scratch ranges of at least the same length, used by a
/// second partitioning pass or by the histogram kernel's reordering.
#[derive(Copy, Clone)]
pub struct Task<'a> {
    pub r: RowSpan<'a>,
    pub tmp_r: RowSpan<'a>,
    pub s: RowSpan<'a>,
    pub tmp_s: RowSpan<'a>,
}

/// Bounded multi-producer multi-consumer queue.
///
/// Every pushed value is popped by exactly one consumer.
pub trait TaskQueue<T>: Send + Sync {
    fn with_capacity(capacity: usize) -> Self
    where
        Self: Sized;

    /// Enqueues `value`; a full queue hands it back.
    fn push(&self, value: T) -> Result<(), T>;

    fn pop(&self) -> Option<T>;

    fn capacity(&self) -> usize;

    /// Number of queued values. Only exact while nobody pushes or pops.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Selects the queue implementation for one join.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub enum QueueKind {
    #[default]
    LockFree,
    Mutex,
}

#[repr(transparent)]
struct Cell(AtomicU64);

impl Cell {
    /// All bits are set.
    const EMPTY: u32 = u32::MAX;

    /// Pack an index and lap counter into a single u64.
    fn pack(index: u32, counter: u32) -> u64 {
        // Counter is left-most 32 bits.
        (counter as u64) << 32 | index as u64
    }

    /// Unpack a packed cell into (index, counter).
    fn unpack(packed: u64) -> (u32, u32) {
        (packed as u32, (packed >> 32) as u32)
    }

    fn new() -> Self {
        Self(AtomicU64::new(Self::pack(Self::EMPTY, 0)))
    }

    fn load(&self, ordering: Ordering) -> u64 {
        self.0.load(ordering)
    }

    fn store(&self, value: u64, ordering: Ordering) {
        self.0.store(value, ordering)
    }
}

/// Lock-free bounded ring buffer.
///
/// Each cell carries the lap (`position / capacity`) it is ready for:
///
/// - empty for lap `n`: index = EMPTY, counter = `n`, ready for enqueue.
/// - full for lap `n`: index = slot, counter = `n`, ready for dequeue.
/// - a dequeue at lap `n` leaves index = EMPTY, counter = `n + 1`.
///
/// Producers and consumers claim a position with a CAS on `head`/`tail`,
/// then touch the slot and publish the new cell state with a `Release`
/// store that the other side picks up with an `Acquire` load.
pub struct LockFreeQueue<T> {
    cells: Box<[Cell]>,
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    /// Next position to enqueue.
    head: AtomicU64,
    /// Next position to dequeue.
    tail: AtomicU64,
    capacity: usize,
    mask: usize,
}

unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T> LockFreeQueue<T> {
    /// Panics unless `capacity` is a power of two no larger than `u32::MAX`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two());
        assert!(capacity <= u32::MAX as usize);

        let cells: Box<[Cell]> = (0..capacity).map(|_| Cell::new()).collect();
        let slots: Box<[UnsafeCell<MaybeUninit<T>>]> = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();

        Self {
            cells,
            slots,
            head: AtomicU64::new(0),
            tail: AtomicU64::new(0),
            capacity,
            mask: capacity - 1,
        }
    }

    pub fn enqueue(&self, value: T) -> Result<(), T> {
        loop {
            let pos = self.head.load(Ordering::Relaxed);
            let cell_index = pos as usize & self.mask;
            let cell = &self.cells[cell_index];

            // Must see the slot release of the previous lap's dequeue.
            let (index, counter) = Cell::unpack(cell.load(Ordering::Acquire));
            let lap = (pos / self.capacity as u64) as u32;

            if counter == lap && index == Cell::EMPTY {
                match self
                    .head
                    .compare_exchange(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                {
                    Ok(_) => {
                        unsafe {
                            (*self.slots[cell_index].get()).write(value);
                        }
                        cell.store(Cell::pack(cell_index as u32, counter), Ordering::Release);
                        return Ok(());
                    }
                    Err(_) => continue,
                }
            } else if counter < lap {
                // The consumer side has not freed this cell yet.
                return Err(value);
            }
        }
    }

    pub fn dequeue(&self) -> Option<T> {
        loop {
            let pos = self.tail.load(Ordering::Relaxed);
            let cell_index = pos as usize & self.mask;
            let cell = &self.cells[cell_index];

            // Pairs with the enqueue's `Release` store of the cell.
            let (index, counter) = Cell::unpack(cell.load(Ordering::Acquire));
            let lap = (pos / self.capacity as u64) as u32;

            if counter == lap && index != Cell::EMPTY {
                match self
                    .tail
                    .compare_exchange(pos, pos + 1, Ordering::Relaxed, Ordering::Relaxed)
                {
                    Ok(_) => {
                        let value = unsafe { (*self.slots[cell_index].get()).assume_init_read() };
                        cell.store(Cell::pack(Cell::EMPTY, counter + 1), Ordering::Release);
                        return Some(value);
                    }
                    Err(_) => continue,
                }
            } else if counter < lap || counter == lap && index == Cell::EMPTY {
                return None;
            }
        }
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        while self.dequeue().is_some() {}
    }
}

impl<T: Send> TaskQueue<T> for LockFreeQueue<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self::new(capacity.next_power_of_two())
    }

    fn push(&self, value: T) -> Result<(), T> {
        self.enqueue(value)
    }

    fn pop(&self) -> Option<T> {
        self.dequeue()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        head.saturating_sub(tail) as usize
    }
}

/// Mutex-guarded bounded FIFO.
pub struct MutexQueue<T> {
    inner: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T: Send> TaskQueue<T> for MutexQueue<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    fn push(&self, value: T) -> Result<(), T> {
        let mut q = self.inner.lock();
        if q.len() >= self.capacity {
            return Err(value);
        }
        q.push_back(value);
        Ok(())
    }

    fn pop(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn len(&self) -> usize {
        self.inner.lock().len()
    }
}
