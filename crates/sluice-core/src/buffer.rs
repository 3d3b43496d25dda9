//! Bounded message buffer between a producer pump and its consuming pump.
//!
//! ## Design
//!
//! - Heap-allocated ring with power-of-2 capacity and bitmask indexing
//! - Cache-padded head/tail cursors prevent false sharing
//! - Acquire/Release memory ordering, no locks on the single-writer path
//! - `write` blocks while full (spin → yield → timed park), drops silently
//!   once the buffer is closed
//! - `close` is monotone and idempotent; `done` is the consumer's
//!   termination check (closed and drained)
//! - Fan-in edges serialize writers through an internal spin lock, engaged
//!   only for buffers created with [`MessageBuffer::with_shared_writers`]
//!
//! The writer side is one pump (or several, in shared-writer mode); the
//! reader side is always exactly one pump.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crate::config::{MAX_BUFFER_SIZE, MIN_BUFFER_SIZE};
use crate::message::Message;

/// Pads a value to a cache line boundary to prevent false sharing between
/// the producer and consumer cursors.
#[repr(C, align(64))]
pub(crate) struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    pub(crate) const fn new(value: T) -> Self {
        Self { value }
    }
}

impl<T> std::ops::Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

/// A bounded FIFO buffer of messages with blocking writes.
pub struct MessageBuffer {
    /// Ring storage.
    slots: Box<[UnsafeCell<MaybeUninit<Message>>]>,

    /// Consumer cursor, cache-padded to keep it off the producer's line.
    head: CachePadded<AtomicUsize>,

    /// Producer cursor, cache-padded to keep it off the consumer's line.
    tail: CachePadded<AtomicUsize>,

    /// Monotone closed flag.
    closed: AtomicBool,

    /// Writer serialization lock, engaged only in shared-writer mode.
    /// 0 = unlocked, 1 = locked.
    write_lock: AtomicU8,

    /// Whether multiple writers may call `write` concurrently.
    shared_writers: bool,

    /// Capacity mask for fast modulo (capacity - 1).
    mask: usize,
}

// SAFETY: the ring is coordinated through the atomic cursors; slots are only
// accessed by the single reader and the (serialized) writer side.
unsafe impl Send for MessageBuffer {}
// SAFETY: see above; Message is Send + Sync.
unsafe impl Sync for MessageBuffer {}

impl MessageBuffer {
    /// Creates a buffer for a single writer.
    ///
    /// The capacity is clamped to `[MIN_BUFFER_SIZE, MAX_BUFFER_SIZE]` and
    /// rounded up to the next power of 2.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_mode(capacity, false)
    }

    /// Creates a buffer whose writer side is shared by several pumps
    /// (fan-in edges). Writes are serialized internally.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    #[must_use]
    pub fn with_shared_writers(capacity: usize) -> Self {
        Self::with_mode(capacity, true)
    }

    fn with_mode(capacity: usize, shared_writers: bool) -> Self {
        assert!(capacity > 0, "capacity must be > 0");

        let capacity = capacity
            .clamp(MIN_BUFFER_SIZE, MAX_BUFFER_SIZE)
            .next_power_of_two();

        let slots: Vec<UnsafeCell<MaybeUninit<Message>>> = (0..capacity)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect();

        Self {
            slots: slots.into_boxed_slice(),
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            closed: AtomicBool::new(false),
            write_lock: AtomicU8::new(0),
            shared_writers,
            mask: capacity - 1,
        }
    }

    /// Returns the buffer capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Returns the current number of buffered messages.
    ///
    /// This is a snapshot and may change immediately after returning.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        tail.wrapping_sub(head) & self.mask
    }

    /// Returns true if the buffer holds no messages.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        head == tail
    }

    /// Returns true if the buffer is full.
    #[inline]
    #[must_use]
    pub fn is_full(&self) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        self.next_index(tail) == head
    }

    /// Appends a message, parking the caller while the buffer is full.
    ///
    /// Once the buffer is closed, `write` becomes a silent no-op and the
    /// message is dropped; closure is driven by the consumer-side lifecycle,
    /// so dropped writes only occur during shutdown.
    pub fn write(&self, msg: Message) {
        let mut msg = msg;
        let mut spins = 0_u32;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            match self.try_write(msg) {
                Ok(()) => return,
                Err(back) => {
                    msg = back;
                    backoff(&mut spins);
                }
            }
        }
    }

    /// Appends a message without blocking.
    ///
    /// # Errors
    ///
    /// Returns the message back if the buffer is full.
    fn try_write(&self, msg: Message) -> Result<(), Message> {
        if self.shared_writers {
            self.acquire_write_lock();
            let result = self.push(msg);
            self.release_write_lock();
            result
        } else {
            self.push(msg)
        }
    }

    /// Reads up to `max` messages into `out`, returning the count.
    ///
    /// Never blocks: returns 0 immediately when the buffer is empty. Must
    /// only be called from the single consumer.
    pub fn read_into(&self, out: &mut Vec<Message>, max: usize) -> usize {
        if max == 0 {
            return 0;
        }

        let mut head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let available = tail.wrapping_sub(head) & self.mask;
        let count = available.min(max);

        for _ in 0..count {
            // SAFETY: exclusive read access: single consumer, and the
            // producer only writes slots past `tail`, which we snapshotted.
            let msg = unsafe { (*self.slots[head].get()).assume_init_read() };
            out.push(msg);
            head = self.next_index(head);
        }

        if count > 0 {
            self.head.store(head, Ordering::Release);
        }
        count
    }

    /// Marks the buffer closed. Monotone and idempotent; parked writers
    /// observe the flag on their next backoff iteration.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Returns true if the buffer has been closed.
    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Consumer termination check: true iff closed and drained.
    #[inline]
    #[must_use]
    pub fn done(&self) -> bool {
        self.is_closed() && self.is_empty()
    }

    fn push(&self, msg: Message) -> Result<(), Message> {
        let tail = self.tail.load(Ordering::Relaxed);
        let next = self.next_index(tail);

        if next == self.head.load(Ordering::Acquire) {
            return Err(msg);
        }

        // SAFETY: exclusive write access: we are the only writer (or hold
        // the writer lock), and this slot is not yet published.
        unsafe {
            (*self.slots[tail].get()).write(msg);
        }

        self.tail.store(next, Ordering::Release);
        Ok(())
    }

    fn pop(&self) -> Option<Message> {
        let head = self.head.load(Ordering::Relaxed);
        if head == self.tail.load(Ordering::Acquire) {
            return None;
        }

        // SAFETY: exclusive read access, slot published by the producer.
        let msg = unsafe { (*self.slots[head].get()).assume_init_read() };
        self.head.store(self.next_index(head), Ordering::Release);
        Some(msg)
    }

    #[inline]
    fn acquire_write_lock(&self) {
        let mut spins = 0_u32;
        while self
            .write_lock
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            backoff(&mut spins);
        }
    }

    #[inline]
    fn release_write_lock(&self) {
        self.write_lock.store(0, Ordering::Release);
    }

    #[inline]
    const fn next_index(&self, index: usize) -> usize {
        (index + 1) & self.mask
    }
}

impl Drop for MessageBuffer {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

impl std::fmt::Debug for MessageBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuffer")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .field("shared_writers", &self.shared_writers)
            .finish()
    }
}

/// Progressive wait: brief spin, then yield, then timed park.
#[inline]
pub(crate) fn backoff(spins: &mut u32) {
    *spins = spins.saturating_add(1);
    if *spins <= 64 {
        std::hint::spin_loop();
    } else if *spins <= 128 {
        thread::yield_now();
    } else {
        thread::park_timeout(Duration::from_micros(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn drain(buf: &MessageBuffer) -> Vec<i64> {
        let mut out = Vec::new();
        buf.read_into(&mut out, usize::MAX);
        out.iter().map(|m| *m.value_as::<i64>().unwrap()).collect()
    }

    #[test]
    fn test_new_buffer() {
        let buf = MessageBuffer::new(100);
        // Rounds up to 128.
        assert_eq!(buf.capacity(), 128);
        assert!(buf.is_empty());
        assert!(!buf.is_full());
        assert!(!buf.done());
    }

    #[test]
    #[should_panic(expected = "capacity must be > 0")]
    fn test_zero_capacity_panics() {
        let _ = MessageBuffer::new(0);
    }

    #[test]
    fn test_capacity_clamping() {
        let buf = MessageBuffer::new(1);
        assert!(buf.capacity() >= MIN_BUFFER_SIZE);

        let buf = MessageBuffer::new(usize::MAX / 2);
        assert!(buf.capacity() <= MAX_BUFFER_SIZE.next_power_of_two());
    }

    #[test]
    fn test_write_read_fifo() {
        let buf = MessageBuffer::new(16);
        for i in 0..10_i64 {
            buf.write(Message::of(i));
        }
        assert_eq!(buf.len(), 10);
        assert_eq!(drain(&buf), (0..10).collect::<Vec<_>>());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_read_batches() {
        let buf = MessageBuffer::new(16);
        for i in 0..10_i64 {
            buf.write(Message::of(i));
        }

        let mut out = Vec::new();
        assert_eq!(buf.read_into(&mut out, 4), 4);
        assert_eq!(buf.read_into(&mut out, 4), 4);
        assert_eq!(buf.read_into(&mut out, 4), 2);
        assert_eq!(buf.read_into(&mut out, 4), 0);
        assert_eq!(out.len(), 10);
    }

    #[test]
    fn test_wrap_around() {
        let buf = MessageBuffer::new(4);
        for round in 0..5_i64 {
            for i in 0..3 {
                buf.write(Message::of(round * 10 + i));
            }
            assert_eq!(
                drain(&buf),
                (0..3).map(|i| round * 10 + i).collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn test_close_is_idempotent() {
        let buf = MessageBuffer::new(8);
        buf.write(Message::of(1_i64));
        buf.close();
        buf.close();
        assert!(buf.is_closed());
        assert!(!buf.done());

        assert_eq!(drain(&buf), vec![1]);
        assert!(buf.done());
    }

    #[test]
    fn test_write_after_close_is_dropped() {
        let buf = MessageBuffer::new(8);
        buf.close();
        buf.write(Message::of(1_i64));
        assert!(buf.is_empty());
        assert!(buf.done());
    }

    fn fifo_under_load(capacity: usize) {
        const N: i64 = 10_000;

        let buf = Arc::new(MessageBuffer::new(capacity));
        let writer_buf = Arc::clone(&buf);

        let writer = std::thread::spawn(move || {
            for i in 0..N {
                writer_buf.write(Message::of(i));
            }
            writer_buf.close();
        });

        let mut batch = Vec::with_capacity(100);
        let mut expected = 0_i64;
        let mut read = 0_i64;
        while !buf.done() {
            batch.clear();
            let n = buf.read_into(&mut batch, 100);
            for msg in &batch[..n] {
                assert_eq!(msg.value_as::<i64>(), Some(&expected));
                expected += 1;
                read += 1;
            }
        }

        writer.join().unwrap();
        assert_eq!(read, N);
        assert!(buf.done());
    }

    #[test]
    fn test_fifo_under_load() {
        fifo_under_load(1024);
    }

    #[test]
    fn test_fifo_under_heavy_backpressure() {
        fifo_under_load(10);
    }

    #[test]
    fn test_shared_writers_interleave() {
        const PER_WRITER: i64 = 2_000;
        const WRITERS: usize = 3;

        let buf = Arc::new(MessageBuffer::with_shared_writers(64));

        let handles: Vec<_> = (0..WRITERS)
            .map(|w| {
                let buf = Arc::clone(&buf);
                std::thread::spawn(move || {
                    for i in 0..PER_WRITER {
                        #[allow(clippy::cast_possible_wrap)]
                        buf.write(Message::of(w as i64 * PER_WRITER + i));
                    }
                })
            })
            .collect();

        let mut seen: Vec<i64> = Vec::new();
        let mut batch = Vec::with_capacity(100);
        while seen.len() < WRITERS * PER_WRITER as usize {
            batch.clear();
            let n = buf.read_into(&mut batch, 100);
            if n == 0 {
                std::thread::yield_now();
                continue;
            }
            seen.extend(batch[..n].iter().map(|m| *m.value_as::<i64>().unwrap()));
        }

        for h in handles {
            h.join().unwrap();
        }

        // Per-writer FIFO is preserved even though the interleaving is free.
        for w in 0..WRITERS {
            #[allow(clippy::cast_possible_wrap)]
            let lo = w as i64 * PER_WRITER;
            let ours: Vec<i64> = seen
                .iter()
                .copied()
                .filter(|v| (lo..lo + PER_WRITER).contains(v))
                .collect();
            assert_eq!(ours, (lo..lo + PER_WRITER).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_drop_releases_buffered_messages() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        static DROPS: AtomicUsize = AtomicUsize::new(0);

        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        DROPS.store(0, Ordering::SeqCst);
        {
            let buf = MessageBuffer::new(8);
            for _ in 0..5 {
                buf.write(Message::of(Counted));
            }
            let mut out = Vec::new();
            buf.read_into(&mut out, 2);
            drop(out);
        }
        assert_eq!(DROPS.load(Ordering::SeqCst), 5);
    }
}
