use std::{
    cell::{Cell, UnsafeCell},
    sync::atomic::{AtomicUsize, Ordering},
};

/// SPSC channel that only retains the last value sent
///
/// Carries parameters too large for a single atomic, such as a pan model or 3D motion, from
/// the control thread to the engine without ever exposing a half-written value.
pub(crate) struct Swap<T> {
    slots: [UnsafeCell<T>; 3],
    send: Cell<usize>,
    shared: AtomicUsize,
    recv: Cell<usize>,
}

impl<T: Clone> Swap<T> {
    /// Create a channel initially holding `x`
    pub(crate) fn new(x: T) -> Self {
        Self {
            slots: [
                UnsafeCell::new(x.clone()),
                UnsafeCell::new(x.clone()),
                UnsafeCell::new(x),
            ],
            send: Cell::new(0),
            shared: AtomicUsize::new(1),
            recv: Cell::new(2),
        }
    }
}

impl<T> Swap<T> {
    /// Publish `value`, replacing anything not yet received
    ///
    /// # Safety
    ///
    /// Must only be called by the single producer.
    pub(crate) unsafe fn send(&self, value: T) {
        *self.slots[self.send.get()].get() = value;
        self.send.set(
            self.shared
                .swap(self.send.get() | FRESH_BIT, Ordering::AcqRel)
                & INDEX_MASK,
        );
    }

    /// Update the value exposed by `received`. Returns whether new data was obtained.
    ///
    /// # Safety
    ///
    /// Must only be called by the single consumer.
    pub(crate) unsafe fn refresh(&self) -> bool {
        if self.shared.load(Ordering::Relaxed) & FRESH_BIT == 0 {
            return false;
        }
        self.recv
            .set(self.shared.swap(self.recv.get(), Ordering::AcqRel) & INDEX_MASK);
        true
    }

    /// Most recent value as of the last `refresh` call
    ///
    /// # Safety
    ///
    /// Must only be called by the single consumer.
    pub(crate) unsafe fn received(&self) -> &T {
        &*self.slots[self.recv.get()].get()
    }
}

// Sound as long as the producer and consumer roles are each confined to one thread at a time,
// which every caller upholds.
unsafe impl<T: Send> Sync for Swap<T> {}

const FRESH_BIT: usize = 0b100;
const INDEX_MASK: usize = 0b011;

#[cfg(test)]
mod tests {
    use super::Swap;
    use crate::Pan;

    #[test]
    fn latest_value_wins() {
        let s = Swap::new(Pan::Scalar(0.0));
        unsafe {
            s.send(Pan::Scalar(0.25));
            assert_eq!(*s.received(), Pan::Scalar(0.0));
            s.send(Pan::Scalar(-0.5));
            assert!(s.refresh());
            assert_eq!(*s.received(), Pan::Scalar(-0.5));
            assert!(!s.refresh());
            assert_eq!(*s.received(), Pan::Scalar(-0.5));
        }
    }

    #[test]
    fn received_is_stable_until_refresh() {
        let s = Swap::new(1u32);
        unsafe {
            s.send(2);
            assert!(s.refresh());
            s.send(3);
            assert_eq!(*s.received(), 2);
            assert!(s.refresh());
            assert_eq!(*s.received(), 3);
        }
    }
}
