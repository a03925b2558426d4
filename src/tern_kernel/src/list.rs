//! Intrusive doubly-linked lists of kernel control blocks.
//!
//! Each list is circular and headed by a pointer to its first element; the
//! first element's `prev` is the last element. The link node lives inside
//! the element itself, so membership costs no allocation and removal is O(1)
//! given the element. All link cells are [`CpuLockCell`]s, so lists can only
//! be mutated inside the kernel critical section.
use core::ptr;

use crate::klock::{CpuLockCell, CpuLockToken, CpuLockTokenRefMut};
use crate::thread::ThreadCb;
use crate::utils::Init;

/// Links to neighbor items.
pub(crate) struct Link<T: 'static> {
    pub(crate) prev: &'static T,
    pub(crate) next: &'static T,
}

impl<T> Clone for Link<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Link<T> {}

/// An element that carries an intrusive link node.
pub(crate) trait Node: Sized + 'static {
    fn link(&self) -> &CpuLockCell<Option<Link<Self>>>;
}

/// A circular intrusive list of `T`s.
pub(crate) struct List<T: 'static> {
    head: CpuLockCell<Option<&'static T>>,
}

impl<T: 'static> Init for List<T> {
    const INIT: Self = Self { head: CpuLockCell::new(None) };
}

impl<T: Node> List<T> {
    pub(crate) const fn new() -> Self {
        Self { head: CpuLockCell::new(None) }
    }

    pub(crate) fn front(&self, token: &CpuLockToken) -> Option<&'static T> {
        self.head.get(token)
    }

    pub(crate) fn is_empty(&self, token: &CpuLockToken) -> bool {
        self.head.read(token).is_none()
    }

    /// Insert `elem` immediately before the first element for which `before`
    /// returns `true`, or at the back if there is no such element.
    ///
    /// `elem` must not currently be a member of any list.
    pub(crate) fn insert_before(
        &self,
        mut lock: CpuLockTokenRefMut<'_>,
        elem: &'static T,
        before: impl Fn(&CpuLockToken, &'static T) -> bool,
    ) {
        debug_assert!(elem.link().read(&*lock).is_none());

        let Some(first) = self.head.get(&*lock) else {
            elem.link().replace(
                &mut *lock,
                Some(Link { prev: elem, next: elem }),
            );
            self.head.replace(&mut *lock, Some(elem));
            return;
        };

        // Find the insertion position. This phase only reads.
        let mut at = None;
        let mut cursor = first;
        loop {
            if before(&*lock, cursor) {
                at = Some(cursor);
                break;
            }
            // The cursor is linked, so the link node is present
            cursor = cursor.link().get(&*lock).unwrap().next;
            if ptr::eq(cursor, first) {
                break;
            }
        }

        // `elem` goes between `prev` and `next`
        let next = at.unwrap_or(first);
        let prev = next.link().get(&*lock).unwrap().prev;
        elem.link().replace(&mut *lock, Some(Link { prev, next }));
        {
            // `prev` and `next` may be the same element; the second read
            // observes the first update
            let mut l = prev.link().get(&*lock).unwrap();
            l.next = elem;
            prev.link().replace(&mut *lock, Some(l));
        }
        {
            let mut l = next.link().get(&*lock).unwrap();
            l.prev = elem;
            next.link().replace(&mut *lock, Some(l));
        }
        if at.is_some() && ptr::eq(next, first) {
            self.head.replace(&mut *lock, Some(elem));
        }
    }

    /// Unlink `elem`. The element must currently be a member of this list.
    pub(crate) fn remove(&self, mut lock: CpuLockTokenRefMut<'_>, elem: &'static T) {
        // The element is linked, so the link node is present
        let link = elem.link().replace(&mut *lock, None).unwrap();
        if ptr::eq(link.next, elem) {
            // `elem` was the sole element
            debug_assert!(ptr::eq(self.head.get(&*lock).unwrap(), elem));
            self.head.replace(&mut *lock, None);
            return;
        }
        {
            let mut l = link.prev.link().get(&*lock).unwrap();
            l.next = link.next;
            link.prev.link().replace(&mut *lock, Some(l));
        }
        {
            let mut l = link.next.link().get(&*lock).unwrap();
            l.prev = link.prev;
            link.next.link().replace(&mut *lock, Some(l));
        }
        if ptr::eq(self.head.get(&*lock).unwrap(), elem) {
            self.head.replace(&mut *lock, Some(link.next));
        }
    }

}

/// A list of threads keyed on (effective priority descending, insertion
/// order). Used for the runnable list, the suspended list, and every wait
/// list in the kernel.
///
/// Membership is mirrored into [`ThreadCb::current_list`] so that the
/// scheduler can unlink a thread in O(1) without knowing which list holds it.
pub(crate) struct ThreadList {
    inner: List<ThreadCb>,
}

impl Init for ThreadList {
    const INIT: Self = Self { inner: List { head: CpuLockCell::new(None) } };
}

impl ThreadList {
    pub(crate) const fn new() -> Self {
        Self { inner: List::new() }
    }

    /// Insert `tcb` at the end of its priority band.
    pub(crate) fn insert_thread(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_>,
        tcb: &'static ThreadCb,
    ) {
        debug_assert!(tcb.current_list.read(&*lock).is_none());
        let priority = tcb.effective_priority.get(&*lock);
        self.inner.insert_before(lock.borrow_mut(), tcb, move |token, other| {
            other.effective_priority.get(token) < priority
        });
        tcb.current_list.replace(&mut *lock, Some(self));
    }

    /// Unlink `tcb`. The thread must be a member of this list.
    pub(crate) fn remove_thread(
        &'static self,
        mut lock: CpuLockTokenRefMut<'_>,
        tcb: &'static ThreadCb,
    ) {
        debug_assert!(matches!(
            *tcb.current_list.read(&*lock),
            Some(list) if ptr::eq(list, self)
        ));
        self.inner.remove(lock.borrow_mut(), tcb);
        tcb.current_list.replace(&mut *lock, None);
    }

    /// The highest-priority thread, i.e. the earliest-inserted member of the
    /// topmost priority band.
    pub(crate) fn front(&self, token: &CpuLockToken) -> Option<&'static ThreadCb> {
        self.inner.front(token)
    }

    pub(crate) fn is_empty(&self, token: &CpuLockToken) -> bool {
        self.inner.is_empty(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klock;
    use crate::thread::{SchedulingPolicy, StackStorage, ThreadCb};
    use quickcheck_macros::quickcheck;

    fn leak_thread(priority: u8) -> &'static ThreadCb {
        let stack = Box::leak(Box::new(StackStorage::<256>::new()));
        fn body(_: usize) {}
        Box::leak(Box::new(ThreadCb::new(
            stack,
            body,
            0,
            priority.max(1),
            SchedulingPolicy::Fifo,
        )))
    }

    /// The list must order members by (priority descending, insertion order)
    /// no matter the insertion sequence.
    #[quickcheck]
    fn sorted_insert_matches_reference_model(priorities: Vec<u8>) -> bool {
        crate::testutil::setup();
        let mut lock = klock::lock_cpu().unwrap();
        let list: &'static ThreadList = Box::leak(Box::new(ThreadList::new()));

        // (priority, sequence number), in expected pop order
        let mut reference: Vec<(u8, usize)> = Vec::new();
        for (seq, &priority) in priorities.iter().enumerate().take(24) {
            let priority = priority.max(1);
            let tcb = leak_thread(priority);
            list.insert_thread(lock.borrow_mut(), tcb);
            let at = reference
                .iter()
                .position(|&(p, _)| p < priority)
                .unwrap_or(reference.len());
            reference.insert(at, (priority, seq));

            // tag the thread with its sequence number through the quantum
            // field, which nothing else touches in this test
            tcb.quantum.replace(&mut *lock, seq as u8);
        }

        let mut ok = true;
        for &(priority, seq) in &reference {
            let front = list.front(&lock).unwrap();
            ok &= front.effective_priority.get(&*lock) == priority;
            ok &= front.quantum.get(&*lock) == seq as u8;
            list.remove_thread(lock.borrow_mut(), front);
        }
        ok &= list.is_empty(&lock);
        ok
    }

    /// Removing an element from the middle must preserve the order of the
    /// remaining elements.
    #[quickcheck]
    fn remove_preserves_order(priorities: Vec<u8>, victim: usize) -> bool {
        crate::testutil::setup();
        if priorities.is_empty() {
            return true;
        }
        let mut lock = klock::lock_cpu().unwrap();
        let list: &'static ThreadList = Box::leak(Box::new(ThreadList::new()));

        let threads: Vec<&'static ThreadCb> = priorities
            .iter()
            .take(24)
            .map(|&p| {
                let tcb = leak_thread(p.max(1));
                list.insert_thread(lock.borrow_mut(), tcb);
                tcb
            })
            .collect();

        let victim = threads[victim % threads.len()];
        list.remove_thread(lock.borrow_mut(), victim);

        let mut last = u8::MAX;
        let mut count = 0;
        while let Some(front) = list.front(&lock) {
            let p = front.effective_priority.get(&*lock);
            if p > last {
                return false;
            }
            last = p;
            count += 1;
            list.remove_thread(lock.borrow_mut(), front);
        }
        count == threads.len() - 1
    }
}
