//! Deferred signal delivery.
//!
//! Handlers installed here do one thing: append the signal number to a
//! process-wide [`SignalQueue`]. Interpreting the signal happens later, on the
//! main loop, through [`crate::control::ProcessControl`]. Uses `sigaction`
//! with `SA_RESTART` so interrupted syscalls resume instead of failing with
//! `EINTR`.

use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

/// Pending signals a queue can hold before new ones are dropped.
pub const CAPACITY: usize = 64;

/// Signals the listener arms a handler for.
pub const LISTENER_SIGNALS: &[Signal] = &[
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGQUIT,
    Signal::SIGABRT,
    Signal::SIGALRM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
    Signal::SIGCHLD,
];

/// Signals a worker arms a handler for. Workers have no children to reap.
pub const WORKER_SIGNALS: &[Signal] = &[
    Signal::SIGINT,
    Signal::SIGTERM,
    Signal::SIGHUP,
    Signal::SIGQUIT,
    Signal::SIGABRT,
    Signal::SIGALRM,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

/// Queue shared by every handler in this process.
static PENDING: SignalQueue = SignalQueue::new();

/// Fixed-capacity FIFO of raw signal numbers.
///
/// `enqueue` is async-signal-safe: it touches only preallocated atomics, never
/// blocks and never allocates. `dequeue` must only be called from the main
/// loop. Every delivery is queued; duplicates are not coalesced.
pub struct SignalQueue {
    slots: [AtomicI32; CAPACITY],
    head: AtomicUsize,
    tail: AtomicUsize,
    dropped: AtomicUsize,
}

impl SignalQueue {
    pub const fn new() -> Self {
        Self {
            slots: [const { AtomicI32::new(0) }; CAPACITY],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
        }
    }

    /// Append a signal number. Safe to call from a signal handler.
    pub fn enqueue(&self, signal: i32) {
        // A handler for another signal may nest between the capacity check
        // and the reservation, so the slot is only taken if `tail` is unchanged.
        let mut tail = self.tail.load(Ordering::Acquire);
        loop {
            if tail.wrapping_sub(self.head.load(Ordering::Acquire)) >= CAPACITY {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
            match self.tail.compare_exchange_weak(
                tail,
                tail.wrapping_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(current) => tail = current,
            }
        }
        if let Some(slot) = self.slots.get(tail % CAPACITY) {
            slot.store(signal, Ordering::Release);
        }
    }

    /// Pop the oldest pending signal number.
    pub fn dequeue(&self) -> Option<i32> {
        let head = self.head.load(Ordering::Acquire);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }
        let slot = self.slots.get(head % CAPACITY)?;
        // A zero slot means the producer reserved it but has not stored yet.
        let signal = slot.swap(0, Ordering::AcqRel);
        if signal == 0 {
            return None;
        }
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(signal)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn len(&self) -> usize {
        self.tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.head.load(Ordering::Acquire))
    }

    /// Discard everything pending.
    pub fn clear(&self) {
        while self.dequeue().is_some() {}
    }

    /// Signals lost because the queue was full.
    pub fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for SignalQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// The queue the installed handlers feed.
pub fn pending() -> &'static SignalQueue {
    &PENDING
}

extern "C" fn enqueue_signal(signal: libc::c_int) {
    PENDING.enqueue(signal);
}

/// Route each of `signals` into [`pending()`].
pub fn install(signals: &[Signal]) -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(enqueue_signal),
        SaFlags::SA_RESTART | SaFlags::SA_NOCLDSTOP,
        SigSet::empty(),
    );
    for &sig in signals {
        // SAFETY: the handler only performs atomic stores on a static queue,
        // which is async-signal-safe.
        unsafe { signal::sigaction(sig, &action) }?;
    }
    Ok(())
}

fn signal_set(signals: &[Signal]) -> SigSet {
    let mut set = SigSet::empty();
    for &sig in signals {
        set.add(sig);
    }
    set
}

/// Hold `signals` pending on the calling thread until [`unblock`].
pub fn block(signals: &[Signal]) -> nix::Result<()> {
    signal_set(signals).thread_block()
}

/// Deliver anything held back by [`block`] to the handlers now installed.
pub fn unblock(signals: &[Signal]) -> nix::Result<()> {
    signal_set(signals).thread_unblock()
}

/// Put each of `signals` back to its default disposition.
pub fn restore(signals: &[Signal]) -> nix::Result<()> {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for &sig in signals {
        // SAFETY: installing SIG_DFL runs no user code.
        unsafe { signal::sigaction(sig, &action) }?;
    }
    Ok(())
}

/// Serialises tests that install handlers or drain the process-wide queue.
#[cfg(test)]
pub(crate) static TEST_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dequeues_in_arrival_order_without_coalescing() {
        let queue = SignalQueue::new();
        for sig in [1, 15, 1, 17] {
            queue.enqueue(sig);
        }

        assert_eq!(queue.len(), 4);
        let drained: Vec<i32> = std::iter::from_fn(|| queue.dequeue()).collect();
        assert_eq!(drained, [1, 15, 1, 17]);
        assert!(queue.is_empty());
        assert_eq!(queue.dequeue(), None);
    }

    #[test]
    fn drops_when_full() {
        let queue = SignalQueue::new();
        for _ in 0..CAPACITY + 3 {
            queue.enqueue(10);
        }

        assert_eq!(queue.len(), CAPACITY);
        assert_eq!(queue.dropped(), 3);
    }

    #[test]
    fn wraps_around_the_ring() {
        let queue = SignalQueue::new();
        for round in 0..3 {
            for i in 0..CAPACITY {
                queue.enqueue(i32::try_from(i).unwrap() + 1 + round);
            }
            for i in 0..CAPACITY {
                assert_eq!(queue.dequeue(), Some(i32::try_from(i).unwrap() + 1 + round));
            }
        }
        assert!(queue.is_empty());
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn concurrent_producers_never_exceed_capacity() {
        let queue = SignalQueue::new();
        std::thread::scope(|scope| {
            for producer in 1..=8 {
                let queue = &queue;
                scope.spawn(move || {
                    for _ in 0..16 {
                        queue.enqueue(producer);
                    }
                });
            }
        });

        assert_eq!(queue.len(), CAPACITY);
        assert_eq!(queue.dropped(), 8 * 16 - CAPACITY);
        let drained: Vec<i32> = std::iter::from_fn(|| queue.dequeue()).collect();
        assert_eq!(drained.len(), CAPACITY);
        assert!(drained.iter().all(|sig| (1..=8).contains(sig)));
    }

    #[test]
    fn clear_discards_pending() {
        let queue = SignalQueue::new();
        queue.enqueue(2);
        queue.enqueue(3);
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn installed_handler_queues_raised_signal() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        pending().clear();

        install(&[Signal::SIGUSR2]).unwrap();
        signal::raise(Signal::SIGUSR2).unwrap();
        signal::raise(Signal::SIGUSR2).unwrap();
        restore(&[Signal::SIGUSR2]).unwrap();

        assert_eq!(pending().dequeue(), Some(Signal::SIGUSR2 as i32));
        assert_eq!(pending().dequeue(), Some(Signal::SIGUSR2 as i32));
        assert!(pending().is_empty());
    }

    #[test]
    fn blocked_signal_reaches_handler_once_unblocked() {
        let _guard = TEST_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        pending().clear();

        install(&[Signal::SIGUSR1]).unwrap();
        block(&[Signal::SIGUSR1]).unwrap();
        signal::raise(Signal::SIGUSR1).unwrap();
        assert!(pending().is_empty());

        unblock(&[Signal::SIGUSR1]).unwrap();
        restore(&[Signal::SIGUSR1]).unwrap();
        assert_eq!(pending().dequeue(), Some(Signal::SIGUSR1 as i32));
        assert!(pending().is_empty());
    }
}
