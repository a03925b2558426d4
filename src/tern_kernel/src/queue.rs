//! Message and FIFO queues
//!
//! A bounded queue pairs two counting semaphores - `free_slots` (initially
//! the capacity) and `available_items` (initially zero) - with in-place ring
//! storage. Blocking and timed behavior comes entirely from the semaphores;
//! ring-index updates happen inside the kernel critical section so that the
//! `try_*` forms stay safe from interrupt context.
//!
//! Typed queues require `T: Copy`: elements are moved by bitwise copy, and a
//! failed `try_push` leaves the caller's value untouched.
use core::cell::UnsafeCell;
use core::fmt;
use core::mem::MaybeUninit;

use crate::error::Errno;
use crate::klock::{self, CpuLockCell};
use crate::port;
use crate::semaphore::SemaphoreCb;

/// Take the kernel lock for a ring-index update. The semaphore protocol
/// guarantees the slot exists; this guards the indices themselves.
macro_rules! ring_lock {
    () => {
        match klock::lock_cpu() {
            Ok(lock) => lock,
            Err(_) => (port::get().fatal_error)("queue ring access inside the critical section"),
        }
    };
}

/// A first-in first-out queue of `N` elements of `T`.
pub struct FifoQueueCb<T: 'static, const N: usize> {
    free_slots: SemaphoreCb,
    available_items: SemaphoreCb,
    storage: UnsafeCell<[MaybeUninit<T>; N]>,
    /// Index of the oldest element.
    head: CpuLockCell<usize>,
    /// Number of stored elements.
    len: CpuLockCell<usize>,
}

// Safety: the storage is only accessed inside the critical section, on slots
// whose exclusive use is guaranteed by the semaphore accounting.
unsafe impl<T: Send + 'static, const N: usize> Sync for FifoQueueCb<T, N> {}

impl<T: 'static, const N: usize> fmt::Debug for FifoQueueCb<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("FifoQueueCb").field(&(self as *const _)).finish()
    }
}

impl<T: Copy + Send + 'static, const N: usize> FifoQueueCb<T, N> {
    pub const fn new() -> Self {
        assert!(N > 0);
        Self {
            free_slots: SemaphoreCb::new(N, N),
            available_items: SemaphoreCb::new(0, N),
            storage: UnsafeCell::new([MaybeUninit::uninit(); N]),
            head: CpuLockCell::new(0),
            len: CpuLockCell::new(0),
        }
    }

    /// Append `value`, blocking while the queue is full.
    pub fn push(&'static self, value: T) -> Result<(), Errno> {
        self.free_slots.wait()?;
        self.write_back(value);
        self.available_items.post()
    }

    /// Append `value` only if that is possible without blocking.
    /// Interrupt-safe.
    ///
    /// # Errors
    ///
    /// - `EAGAIN` - the queue is full.
    pub fn try_push(&'static self, value: T) -> Result<(), Errno> {
        self.free_slots.try_wait()?;
        self.write_back(value);
        self.available_items.post()
    }

    /// Append `value`, giving up at the absolute tick `deadline`.
    pub fn try_push_until(&'static self, value: T, deadline: u64) -> Result<(), Errno> {
        self.free_slots.try_wait_until(deadline)?;
        self.write_back(value);
        self.available_items.post()
    }

    /// Append `value`, giving up after `ticks` ticks.
    pub fn try_push_for(&'static self, value: T, ticks: u64) -> Result<(), Errno> {
        self.free_slots.try_wait_for(ticks)?;
        self.write_back(value);
        self.available_items.post()
    }

    /// Construct an element in place once a slot is secured, blocking while
    /// the queue is full.
    pub fn emplace_with(&'static self, f: impl FnOnce() -> T) -> Result<(), Errno> {
        self.free_slots.wait()?;
        self.write_back(f());
        self.available_items.post()
    }

    /// Non-blocking [`FifoQueueCb::emplace_with`]; the closure is not
    /// invoked on failure. Interrupt-safe.
    pub fn try_emplace_with(&'static self, f: impl FnOnce() -> T) -> Result<(), Errno> {
        self.free_slots.try_wait()?;
        self.write_back(f());
        self.available_items.post()
    }

    pub fn try_emplace_with_until(
        &'static self,
        f: impl FnOnce() -> T,
        deadline: u64,
    ) -> Result<(), Errno> {
        self.free_slots.try_wait_until(deadline)?;
        self.write_back(f());
        self.available_items.post()
    }

    pub fn try_emplace_with_for(
        &'static self,
        f: impl FnOnce() -> T,
        ticks: u64,
    ) -> Result<(), Errno> {
        self.free_slots.try_wait_for(ticks)?;
        self.write_back(f());
        self.available_items.post()
    }

    /// Remove the oldest element, blocking while the queue is empty.
    pub fn pop(&'static self) -> Result<T, Errno> {
        self.available_items.wait()?;
        let value = self.take_front();
        self.free_slots.post()?;
        Ok(value)
    }

    /// Remove the oldest element only if that is possible without blocking.
    /// Interrupt-safe.
    ///
    /// # Errors
    ///
    /// - `EAGAIN` - the queue is empty.
    pub fn try_pop(&'static self) -> Result<T, Errno> {
        self.available_items.try_wait()?;
        let value = self.take_front();
        self.free_slots.post()?;
        Ok(value)
    }

    /// Remove the oldest element, giving up at the absolute tick `deadline`.
    pub fn try_pop_until(&'static self, deadline: u64) -> Result<T, Errno> {
        self.available_items.try_wait_until(deadline)?;
        let value = self.take_front();
        self.free_slots.post()?;
        Ok(value)
    }

    /// Remove the oldest element, giving up after `ticks` ticks.
    pub fn try_pop_for(&'static self, ticks: u64) -> Result<T, Errno> {
        self.available_items.try_wait_for(ticks)?;
        let value = self.take_front();
        self.free_slots.post()?;
        Ok(value)
    }

    fn write_back(&'static self, value: T) {
        let mut lock = ring_lock!();
        let head = self.head.get(&*lock);
        let len = self.len.get(&*lock);
        let index = (head + len) % N;
        // Safety: critical section held; the slot was reserved through
        // `free_slots`
        unsafe {
            (*self.storage.get())[index] = MaybeUninit::new(value);
        }
        self.len.replace(&mut *lock, len + 1);
    }

    fn take_front(&'static self) -> T {
        let mut lock = ring_lock!();
        let head = self.head.get(&*lock);
        let len = self.len.get(&*lock);
        debug_assert!(len > 0);
        // Safety: critical section held; `available_items` guarantees the
        // slot is initialized
        let value = unsafe { (*self.storage.get())[head].assume_init_read() };
        self.head.replace(&mut *lock, (head + 1) % N);
        self.len.replace(&mut *lock, len - 1);
        value
    }
}

impl<T: Copy + Send + 'static, const N: usize> Default for FifoQueueCb<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// A bounded queue whose elements carry a small unsigned priority. The ring
/// is kept priority-ordered: `pop` returns the oldest element of the highest
/// priority.
pub struct MessageQueueCb<T: 'static, const N: usize> {
    free_slots: SemaphoreCb,
    available_items: SemaphoreCb,
    storage: UnsafeCell<[MaybeUninit<(u8, T)>; N]>,
    head: CpuLockCell<usize>,
    len: CpuLockCell<usize>,
}

// Safety: as for `FifoQueueCb`
unsafe impl<T: Send + 'static, const N: usize> Sync for MessageQueueCb<T, N> {}

impl<T: 'static, const N: usize> fmt::Debug for MessageQueueCb<T, N> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("MessageQueueCb")
            .field(&(self as *const _))
            .finish()
    }
}

impl<T: Copy + Send + 'static, const N: usize> MessageQueueCb<T, N> {
    pub const fn new() -> Self {
        assert!(N > 0);
        Self {
            free_slots: SemaphoreCb::new(N, N),
            available_items: SemaphoreCb::new(0, N),
            storage: UnsafeCell::new([MaybeUninit::uninit(); N]),
            head: CpuLockCell::new(0),
            len: CpuLockCell::new(0),
        }
    }

    /// Append `value` with `priority`, blocking while the queue is full.
    pub fn push(&'static self, priority: u8, value: T) -> Result<(), Errno> {
        self.free_slots.wait()?;
        self.insert_sorted(priority, value);
        self.available_items.post()
    }

    /// Interrupt-safe non-blocking push.
    ///
    /// # Errors
    ///
    /// - `EAGAIN` - the queue is full.
    pub fn try_push(&'static self, priority: u8, value: T) -> Result<(), Errno> {
        self.free_slots.try_wait()?;
        self.insert_sorted(priority, value);
        self.available_items.post()
    }

    pub fn try_push_until(&'static self, priority: u8, value: T, deadline: u64) -> Result<(), Errno> {
        self.free_slots.try_wait_until(deadline)?;
        self.insert_sorted(priority, value);
        self.available_items.post()
    }

    pub fn try_push_for(&'static self, priority: u8, value: T, ticks: u64) -> Result<(), Errno> {
        self.free_slots.try_wait_for(ticks)?;
        self.insert_sorted(priority, value);
        self.available_items.post()
    }

    /// Remove the oldest highest-priority element, blocking while the queue
    /// is empty. Returns `(priority, value)`.
    pub fn pop(&'static self) -> Result<(u8, T), Errno> {
        self.available_items.wait()?;
        let entry = self.take_front();
        self.free_slots.post()?;
        Ok(entry)
    }

    /// Interrupt-safe non-blocking pop.
    ///
    /// # Errors
    ///
    /// - `EAGAIN` - the queue is empty.
    pub fn try_pop(&'static self) -> Result<(u8, T), Errno> {
        self.available_items.try_wait()?;
        let entry = self.take_front();
        self.free_slots.post()?;
        Ok(entry)
    }

    pub fn try_pop_until(&'static self, deadline: u64) -> Result<(u8, T), Errno> {
        self.available_items.try_wait_until(deadline)?;
        let entry = self.take_front();
        self.free_slots.post()?;
        Ok(entry)
    }

    pub fn try_pop_for(&'static self, ticks: u64) -> Result<(u8, T), Errno> {
        self.available_items.try_wait_for(ticks)?;
        let entry = self.take_front();
        self.free_slots.post()?;
        Ok(entry)
    }

    fn insert_sorted(&'static self, priority: u8, value: T) {
        let mut lock = ring_lock!();
        let head = self.head.get(&*lock);
        let len = self.len.get(&*lock);
        // Safety: critical section held; slot reserved through `free_slots`
        let storage = unsafe { &mut *self.storage.get() };

        // Logical position: after every entry with priority >= `priority`
        let mut position = len;
        for i in 0..len {
            // Safety: the first `len` logical slots are initialized
            let (p, _) = unsafe { storage[(head + i) % N].assume_init_read() };
            if p < priority {
                position = i;
                break;
            }
        }
        // Shift the tail up one slot to make room
        let mut i = len;
        while i > position {
            storage[(head + i) % N] = storage[(head + i - 1) % N];
            i -= 1;
        }
        storage[(head + position) % N] = MaybeUninit::new((priority, value));
        self.len.replace(&mut *lock, len + 1);
    }

    fn take_front(&'static self) -> (u8, T) {
        let mut lock = ring_lock!();
        let head = self.head.get(&*lock);
        let len = self.len.get(&*lock);
        debug_assert!(len > 0);
        // Safety: critical section held; `available_items` guarantees the
        // slot is initialized
        let entry = unsafe { (*self.storage.get())[head].assume_init_read() };
        self.head.replace(&mut *lock, (head + 1) % N);
        self.len.replace(&mut *lock, len - 1);
        entry
    }
}

impl<T: Copy + Send + 'static, const N: usize> Default for MessageQueueCb<T, N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Byte storage for a raw queue, supplied by the user in `'static` memory.
pub struct RawQueueStorage<const N: usize>(UnsafeCell<[MaybeUninit<u8>; N]>);

// Safety: accessed only inside the critical section of the owning queue
unsafe impl<const N: usize> Sync for RawQueueStorage<N> {}

impl<const N: usize> RawQueueStorage<N> {
    pub const fn new() -> Self {
        Self(UnsafeCell::new([MaybeUninit::uninit(); N]))
    }
}

impl<const N: usize> Default for RawQueueStorage<N> {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Copy)]
struct RawRegion {
    base: usize,
    /// Slot size in bytes (element plus any per-entry header).
    slot_size: usize,
    capacity: usize,
}

/// A FIFO queue of opaque fixed-size byte records.
///
/// The element size is chosen at construction; storage is attached
/// separately with [`RawFifoQueueCb::attach`], which is the only operation
/// that can fail with `ENOMEM`.
pub struct RawFifoQueueCb {
    free_slots: SemaphoreCb,
    available_items: SemaphoreCb,
    element_size: usize,
    region: CpuLockCell<Option<RawRegion>>,
    head: CpuLockCell<usize>,
    len: CpuLockCell<usize>,
}

impl fmt::Debug for RawFifoQueueCb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("RawFifoQueueCb")
            .field(&(self as *const _))
            .finish()
    }
}

impl RawFifoQueueCb {
    pub const fn new(element_size: usize) -> Self {
        Self {
            free_slots: SemaphoreCb::new(0, usize::MAX),
            available_items: SemaphoreCb::new(0, usize::MAX),
            element_size,
            region: CpuLockCell::new(None),
            head: CpuLockCell::new(0),
            len: CpuLockCell::new(0),
        }
    }

    /// Attach backing storage and open the queue for use.
    ///
    /// # Errors
    ///
    /// - `ENOMEM` - the storage cannot hold even one element.
    /// - `EINVAL` - storage is already attached.
    pub fn attach<const N: usize>(
        &'static self,
        storage: &'static RawQueueStorage<N>,
    ) -> Result<(), Errno> {
        let mut lock = klock::lock_cpu()?;
        if self.region.read(&*lock).is_some() {
            return Err(Errno::EINVAL);
        }
        if self.element_size == 0 || N / self.element_size == 0 {
            return Err(Errno::ENOMEM);
        }
        let capacity = N / self.element_size;
        self.region.replace(
            &mut *lock,
            Some(RawRegion {
                base: storage.0.get() as usize,
                slot_size: self.element_size,
                capacity,
            }),
        );
        self.free_slots.set_value_locked(lock.borrow_mut(), capacity);
        Ok(())
    }

    /// Append one element, blocking while the queue is full.
    ///
    /// # Errors
    ///
    /// - `EMSGSIZE` - `data` does not match the element size. Returned
    ///   immediately, before the queue is touched.
    pub fn push(&'static self, data: &[u8]) -> Result<(), Errno> {
        self.check_size(data.len())?;
        self.free_slots.wait()?;
        self.write_back(data);
        self.available_items.post()
    }

    /// Interrupt-safe non-blocking push.
    pub fn try_push(&'static self, data: &[u8]) -> Result<(), Errno> {
        self.check_size(data.len())?;
        self.free_slots.try_wait()?;
        self.write_back(data);
        self.available_items.post()
    }

    pub fn try_push_until(&'static self, data: &[u8], deadline: u64) -> Result<(), Errno> {
        self.check_size(data.len())?;
        self.free_slots.try_wait_until(deadline)?;
        self.write_back(data);
        self.available_items.post()
    }

    pub fn try_push_for(&'static self, data: &[u8], ticks: u64) -> Result<(), Errno> {
        self.check_size(data.len())?;
        self.free_slots.try_wait_for(ticks)?;
        self.write_back(data);
        self.available_items.post()
    }

    /// Remove the oldest element into `out`, blocking while the queue is
    /// empty.
    pub fn pop(&'static self, out: &mut [u8]) -> Result<(), Errno> {
        self.check_size(out.len())?;
        self.available_items.wait()?;
        self.take_front(out);
        self.free_slots.post()
    }

    /// Interrupt-safe non-blocking pop.
    pub fn try_pop(&'static self, out: &mut [u8]) -> Result<(), Errno> {
        self.check_size(out.len())?;
        self.available_items.try_wait()?;
        self.take_front(out);
        self.free_slots.post()
    }

    pub fn try_pop_until(&'static self, out: &mut [u8], deadline: u64) -> Result<(), Errno> {
        self.check_size(out.len())?;
        self.available_items.try_wait_until(deadline)?;
        self.take_front(out);
        self.free_slots.post()
    }

    pub fn try_pop_for(&'static self, out: &mut [u8], ticks: u64) -> Result<(), Errno> {
        self.check_size(out.len())?;
        self.available_items.try_wait_for(ticks)?;
        self.take_front(out);
        self.free_slots.post()
    }

    fn check_size(&self, size: usize) -> Result<(), Errno> {
        if size != self.element_size {
            return Err(Errno::EMSGSIZE);
        }
        Ok(())
    }

    fn write_back(&'static self, data: &[u8]) {
        let mut lock = ring_lock!();
        // The semaphore was opened by `attach`, so the region exists
        let region = self.region.get(&*lock).unwrap();
        let head = self.head.get(&*lock);
        let len = self.len.get(&*lock);
        let slot = (region.base + ((head + len) % region.capacity) * region.slot_size) as *mut u8;
        // Safety: critical section held; the slot was reserved through
        // `free_slots` and lies within the attached storage
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), slot, region.slot_size);
        }
        self.len.replace(&mut *lock, len + 1);
    }

    fn take_front(&'static self, out: &mut [u8]) {
        let mut lock = ring_lock!();
        let region = self.region.get(&*lock).unwrap();
        let head = self.head.get(&*lock);
        let len = self.len.get(&*lock);
        debug_assert!(len > 0);
        let slot = (region.base + head * region.slot_size) as *const u8;
        // Safety: critical section held; `available_items` guarantees the
        // slot holds an element
        unsafe {
            core::ptr::copy_nonoverlapping(slot, out.as_mut_ptr(), region.slot_size);
        }
        self.head.replace(&mut *lock, (head + 1) % region.capacity);
        self.len.replace(&mut *lock, len - 1);
    }
}

/// A raw queue whose records carry a small unsigned priority; the ring is
/// kept priority-ordered. Each slot stores one priority byte followed by the
/// element bytes.
pub struct RawMessageQueueCb {
    free_slots: SemaphoreCb,
    available_items: SemaphoreCb,
    element_size: usize,
    region: CpuLockCell<Option<RawRegion>>,
    head: CpuLockCell<usize>,
    len: CpuLockCell<usize>,
}

impl fmt::Debug for RawMessageQueueCb {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_tuple("RawMessageQueueCb")
            .field(&(self as *const _))
            .finish()
    }
}

impl RawMessageQueueCb {
    pub const fn new(element_size: usize) -> Self {
        Self {
            free_slots: SemaphoreCb::new(0, usize::MAX),
            available_items: SemaphoreCb::new(0, usize::MAX),
            element_size,
            region: CpuLockCell::new(None),
            head: CpuLockCell::new(0),
            len: CpuLockCell::new(0),
        }
    }

    /// Attach backing storage and open the queue for use. Each element
    /// consumes `element_size + 1` bytes of storage.
    ///
    /// # Errors
    ///
    /// - `ENOMEM` - the storage cannot hold even one element.
    /// - `EINVAL` - storage is already attached.
    pub fn attach<const N: usize>(
        &'static self,
        storage: &'static RawQueueStorage<N>,
    ) -> Result<(), Errno> {
        let mut lock = klock::lock_cpu()?;
        if self.region.read(&*lock).is_some() {
            return Err(Errno::EINVAL);
        }
        let slot_size = self.element_size + 1;
        if self.element_size == 0 || N / slot_size == 0 {
            return Err(Errno::ENOMEM);
        }
        let capacity = N / slot_size;
        self.region.replace(
            &mut *lock,
            Some(RawRegion {
                base: storage.0.get() as usize,
                slot_size,
                capacity,
            }),
        );
        self.free_slots.set_value_locked(lock.borrow_mut(), capacity);
        Ok(())
    }

    /// Append one element, blocking while the queue is full.
    ///
    /// # Errors
    ///
    /// - `EMSGSIZE` - `data` does not match the element size. Returned
    ///   immediately, before the queue is touched.
    pub fn push(&'static self, priority: u8, data: &[u8]) -> Result<(), Errno> {
        self.check_size(data.len())?;
        self.free_slots.wait()?;
        self.insert_sorted(priority, data);
        self.available_items.post()
    }

    /// Interrupt-safe non-blocking push.
    pub fn try_push(&'static self, priority: u8, data: &[u8]) -> Result<(), Errno> {
        self.check_size(data.len())?;
        self.free_slots.try_wait()?;
        self.insert_sorted(priority, data);
        self.available_items.post()
    }

    pub fn try_push_until(
        &'static self,
        priority: u8,
        data: &[u8],
        deadline: u64,
    ) -> Result<(), Errno> {
        self.check_size(data.len())?;
        self.free_slots.try_wait_until(deadline)?;
        self.insert_sorted(priority, data);
        self.available_items.post()
    }

    pub fn try_push_for(&'static self, priority: u8, data: &[u8], ticks: u64) -> Result<(), Errno> {
        self.check_size(data.len())?;
        self.free_slots.try_wait_for(ticks)?;
        self.insert_sorted(priority, data);
        self.available_items.post()
    }

    /// Remove the oldest highest-priority element into `out`, blocking
    /// while the queue is empty. Returns the element's priority.
    pub fn pop(&'static self, out: &mut [u8]) -> Result<u8, Errno> {
        self.check_size(out.len())?;
        self.available_items.wait()?;
        let priority = self.take_front(out);
        self.free_slots.post()?;
        Ok(priority)
    }

    /// Interrupt-safe non-blocking pop.
    pub fn try_pop(&'static self, out: &mut [u8]) -> Result<u8, Errno> {
        self.check_size(out.len())?;
        self.available_items.try_wait()?;
        let priority = self.take_front(out);
        self.free_slots.post()?;
        Ok(priority)
    }

    pub fn try_pop_until(&'static self, out: &mut [u8], deadline: u64) -> Result<u8, Errno> {
        self.check_size(out.len())?;
        self.available_items.try_wait_until(deadline)?;
        let priority = self.take_front(out);
        self.free_slots.post()?;
        Ok(priority)
    }

    pub fn try_pop_for(&'static self, out: &mut [u8], ticks: u64) -> Result<u8, Errno> {
        self.check_size(out.len())?;
        self.available_items.try_wait_for(ticks)?;
        let priority = self.take_front(out);
        self.free_slots.post()?;
        Ok(priority)
    }

    fn check_size(&self, size: usize) -> Result<(), Errno> {
        if size != self.element_size {
            return Err(Errno::EMSGSIZE);
        }
        Ok(())
    }

    fn slot_ptr(region: &RawRegion, logical: usize, head: usize) -> *mut u8 {
        (region.base + ((head + logical) % region.capacity) * region.slot_size) as *mut u8
    }

    fn insert_sorted(&'static self, priority: u8, data: &[u8]) {
        let mut lock = ring_lock!();
        let region = self.region.get(&*lock).unwrap();
        let head = self.head.get(&*lock);
        let len = self.len.get(&*lock);

        // Logical position: after every entry with priority >= `priority`
        let mut position = len;
        for i in 0..len {
            // Safety: the first `len` logical slots hold elements
            let p = unsafe { *Self::slot_ptr(&region, i, head) };
            if p < priority {
                position = i;
                break;
            }
        }
        // Shift the tail up one slot to make room
        let mut i = len;
        while i > position {
            // Safety: distinct slots within the attached storage
            unsafe {
                core::ptr::copy_nonoverlapping(
                    Self::slot_ptr(&region, i - 1, head),
                    Self::slot_ptr(&region, i, head),
                    region.slot_size,
                );
            }
            i -= 1;
        }
        let slot = Self::slot_ptr(&region, position, head);
        // Safety: critical section held; the slot was reserved through
        // `free_slots`
        unsafe {
            *slot = priority;
            core::ptr::copy_nonoverlapping(data.as_ptr(), slot.add(1), self.element_size);
        }
        self.len.replace(&mut *lock, len + 1);
    }

    fn take_front(&'static self, out: &mut [u8]) -> u8 {
        let mut lock = ring_lock!();
        let region = self.region.get(&*lock).unwrap();
        let head = self.head.get(&*lock);
        let len = self.len.get(&*lock);
        debug_assert!(len > 0);
        let slot = (region.base + head * region.slot_size) as *const u8;
        // Safety: critical section held; `available_items` guarantees the
        // slot holds an element
        let priority = unsafe {
            core::ptr::copy_nonoverlapping(slot.add(1), out.as_mut_ptr(), self.element_size);
            *slot
        };
        self.head.replace(&mut *lock, (head + 1) % region.capacity);
        self.len.replace(&mut *lock, len - 1);
        priority
    }
}
