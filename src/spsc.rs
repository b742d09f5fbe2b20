use std::{
    cell::UnsafeCell,
    mem::MaybeUninit,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

/// Bounded wait-free single-producer single-consumer queue
pub(crate) fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    // One slot is always left empty to distinguish full from empty
    let data = (0..capacity + 1)
        .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
        .collect();
    let shared = Arc::new(Shared {
        read: AtomicUsize::new(0),
        write: AtomicUsize::new(0),
        data,
    });
    (
        Sender {
            shared: shared.clone(),
        },
        Receiver { shared },
    )
}

pub(crate) struct Sender<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Sender<T> {
    /// Append `value`, or hand it back if the queue is full
    pub(crate) fn send(&mut self, value: T) -> Result<(), T> {
        let write = self.shared.write.load(Ordering::Relaxed);
        let read = self.shared.read.load(Ordering::Acquire);
        let next = (write + 1) % self.shared.data.len();
        if next == read {
            return Err(value);
        }
        unsafe {
            *self.shared.data[write].get() = MaybeUninit::new(value);
        }
        self.shared.write.store(next, Ordering::Release);
        Ok(())
    }
}

pub(crate) struct Receiver<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Receiver<T> {
    pub(crate) fn pop(&mut self) -> Option<T> {
        let read = self.shared.read.load(Ordering::Relaxed);
        let write = self.shared.write.load(Ordering::Acquire);
        if read == write {
            return None;
        }
        let value = unsafe { (*self.shared.data[read].get()).as_ptr().read() };
        self.shared
            .read
            .store((read + 1) % self.shared.data.len(), Ordering::Release);
        Some(value)
    }

    pub(crate) fn drain(&mut self) -> Drain<'_, T> {
        Drain { recv: self }
    }
}

struct Shared<T> {
    read: AtomicUsize,
    write: AtomicUsize,
    data: Box<[UnsafeCell<MaybeUninit<T>>]>,
}

unsafe impl<T: Send> Sync for Shared<T> {}

impl<T> Drop for Shared<T> {
    fn drop(&mut self) {
        let mut read = *self.read.get_mut();
        let write = *self.write.get_mut();
        while read != write {
            unsafe {
                self.data[read].get_mut().as_mut_ptr().drop_in_place();
            }
            read = (read + 1) % self.data.len();
        }
    }
}

pub(crate) struct Drain<'a, T> {
    recv: &'a mut Receiver<T>,
}

impl<'a, T> Iterator for Drain<'a, T> {
    type Item = T;
    fn next(&mut self) -> Option<T> {
        self.recv.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recv_empty() {
        let (_, mut recv) = channel::<u32>(4);
        assert_eq!(recv.pop(), None);
    }

    #[test]
    fn fill_and_wrap() {
        let (mut send, mut recv) = channel::<u32>(3);
        for i in 0..3 {
            send.send(i).unwrap();
        }
        assert_eq!(send.send(3), Err(3));
        assert_eq!(recv.pop(), Some(0));
        send.send(3).unwrap();
        assert_eq!(recv.drain().collect::<Vec<_>>(), [1, 2, 3]);
        assert_eq!(recv.pop(), None);
    }

    #[test]
    fn unreceived_values_are_dropped() {
        let value = Arc::new(());
        {
            let (mut send, _recv) = channel(2);
            send.send(value.clone()).unwrap();
            assert_eq!(Arc::strong_count(&value), 2);
        }
        assert_eq!(Arc::strong_count(&value), 1);
    }
}
