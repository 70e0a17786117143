//! turbo_mpsc - Unbounded lock-free MPSC queue with elimination-combining producers
//!
//! - `send` / `send_all` : lock-free producer operations; colliding producers
//!   rendezvous in an arena and one of them inserts the combined batch
//! - `try_recv` / `peek` : operations of the single consumer
//! - two completion modes: [`optimistic`] lets a producer return as soon as
//!   another producer has taken ownership of its elements, [`linearizable`]
//!   makes it wait until the elements are visible to the consumer
//!
//! The queue is a Vyukov-style linked list with a permanent sentinel at the
//! head. Producers insert by swinging the shared tail with a compare-exchange
//! and then linking behind the previous tail; the consumer drains by walking
//! `next` pointers from the sentinel. Under producer contention the loser of
//! the tail race offers its pending chain in a small per-CPU arena, where a
//! colliding producer can absorb it and insert both batches with one tail
//! swing.
//!
//! Nodes are reclaimed through `crossbeam-epoch`: every operation runs under
//! a pinned guard and unlinked nodes are destroyed only once no thread can
//! still be reading them.

#![warn(missing_docs)]

use core::cell::{Cell, UnsafeCell};
use core::fmt;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::Duration;

use crossbeam_epoch::{self as epoch, Atomic, Guard, Owned, Shared};

/// Polls of an occupied arena slot in `transfer_or_combine` before the offer
/// is reclaimed; roughly half the cycles of a context switch, so a partner
/// that is merely stalled is waited out but an absent one is not.
const EXCHANGE_SPINS: usize = 2000;
/// Pause iterations of the completion wait in `append` before it yields. The
/// peer sets the flag a few instructions after winning the tail race, so a
/// short burst covers the common case without involving the scheduler.
const WAIT_SPINS: usize = 128;
/// Yields of the completion wait before it starts sleeping. A peer that has
/// not published after this many reschedules was preempted mid-insertion,
/// and spinning against a descheduled thread only delays it further.
const WAIT_YIELDS: usize = 512;
/// Sleep once the peer looks preempted: long enough to get off the core,
/// short enough to notice the flag promptly when the peer resumes.
const WAIT_SLEEP: Duration = Duration::from_micros(5);

/// Cache-line padded wrapper; a padded field has a line to itself, so the
/// producers hammering `tail` and the consumer advancing `head` never share
/// one.
#[repr(align(64))]
struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    const fn new(value: T) -> Self {
        CachePadded { value }
    }
}

/// Waits for a completion flag, set by the peer that took this producer's
/// chain once the combined batch is published. The wait is bounded by that
/// peer finishing its own insertion; the escalation only covers the case
/// where the peer was preempted before it could.
fn await_done(done: &AtomicBool) {
    let mut rounds = 0;
    while !done.load(Ordering::Acquire) {
        if rounds < WAIT_SPINS {
            core::hint::spin_loop();
        } else if rounds < WAIT_SPINS + WAIT_YIELDS {
            thread::yield_now();
        } else {
            thread::sleep(WAIT_SLEEP);
        }
        rounds += 1;
    }
}

fn ncpus() -> usize {
    static NCPUS: OnceLock<usize> = OnceLock::new();
    *NCPUS.get_or_init(|| {
        thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    })
}

/// Number of rendezvous slots: the smallest power of two that can host half
/// the CPUs, so probes mask cheaply and collisions stay likely enough to
/// combine.
fn arena_len() -> usize {
    ((ncpus() + 1) / 2).next_power_of_two()
}

thread_local! {
    static PROBE: Cell<u32> = const { Cell::new(0) };
}

static PROBE_SEED: AtomicU32 = AtomicU32::new(0);

/// Per-thread arena probe, fixed for the thread's lifetime so it keeps
/// colliding with the same partners. Zero means uninitialized.
fn probe() -> u32 {
    PROBE.with(|probe| {
        let mut value = probe.get();
        if value == 0 {
            let seed = PROBE_SEED
                .fetch_add(0x9e37_79b9, Ordering::Relaxed)
                .wrapping_add(0x9e37_79b9);
            value = xorshift32(seed);
            if value == 0 {
                value = 1;
            }
            probe.set(value);
        }
        value
    })
}

fn xorshift32(mut x: u32) -> u32 {
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    x
}

/// Completion strategy of a queue, chosen at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// A producer whose batch was taken by another producer returns
    /// immediately; the batch becomes visible when the taker inserts it.
    Optimistic,
    /// A producer returns only after its batch is linked into the queue and
    /// visible to a subsequent receive.
    Linearizable,
}

/// Error returned when the queue holds no visible element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvError;

impl fmt::Display for RecvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "queue is empty")
    }
}

/// Error returned by [`CursorMut::remove`] when there is no element to
/// remove: either `next` has not been called yet, or the element it returned
/// was already removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoveError;

impl fmt::Display for RemoveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no element to remove")
    }
}

struct Node<T> {
    value: UnsafeCell<Option<T>>,
    next: Atomic<Node<T>>,
    /// Set once the node is linked into the visible chain. Only consulted in
    /// linearizable mode.
    done: AtomicBool,
}

impl<T> Node<T> {
    fn new(value: T) -> Self {
        Node {
            value: UnsafeCell::new(Some(value)),
            next: Atomic::null(),
            done: AtomicBool::new(false),
        }
    }

    fn sentinel() -> Self {
        Node {
            value: UnsafeCell::new(None),
            next: Atomic::null(),
            done: AtomicBool::new(false),
        }
    }
}

/// Result of offering a pending chain in the arena.
enum Transfer<'g, T> {
    /// A colliding producer took the chain and owns its insertion.
    Taken,
    /// Nobody collided within the spin budget; the offer was reclaimed.
    Unmatched,
    /// One or more peer chains were absorbed; the value is the new last node
    /// of the combined chain.
    Absorbed(Shared<'g, Node<T>>),
}

struct Inner<T> {
    head: CachePadded<Atomic<Node<T>>>,
    tail: CachePadded<Atomic<Node<T>>>,
    arena: Box<[CachePadded<Atomic<Node<T>>>]>,
    spins: usize,
    mode: Mode,
}

// Safety: the chain is synchronized by the atomic links and the tail CAS;
// values only move between threads, so T: Send suffices.
unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> Inner<T> {
    fn new(mode: Mode) -> Self {
        let arena = (0..arena_len())
            .map(|_| CachePadded::new(Atomic::null()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let inner = Inner {
            head: CachePadded::new(Atomic::null()),
            tail: CachePadded::new(Atomic::null()),
            arena,
            spins: if ncpus() == 1 { 0 } else { EXCHANGE_SPINS },
            mode,
        };
        let sentinel = Owned::new(Node::sentinel()).into_shared(unsafe { epoch::unprotected() });
        inner.head.value.store(sentinel, Ordering::Release);
        inner.tail.value.store(sentinel, Ordering::Release);
        inner
    }

    /// Inserts the chain `first..=last` at the tail.
    ///
    /// Each round either wins the tail race, hands the chain to a colliding
    /// producer, or absorbs the colliders' chains and retries with the larger
    /// batch.
    fn append<'g>(
        &self,
        first: Shared<'g, Node<T>>,
        mut last: Shared<'g, Node<T>>,
        guard: &'g Guard,
    ) {
        loop {
            let t = self.tail.value.load(Ordering::Acquire, guard);
            if self
                .tail
                .value
                .compare_exchange(t, last, Ordering::SeqCst, Ordering::Relaxed, guard)
                .is_ok()
            {
                // Only the winner of the CAS may link behind `t`, so a plain
                // release store publishes the chain.
                unsafe { t.deref() }.next.store(first, Ordering::Release);
                if self.mode == Mode::Linearizable {
                    let mut node = first;
                    loop {
                        let n = unsafe { node.deref() };
                        n.done.store(true, Ordering::Release);
                        if node == last {
                            return;
                        }
                        node = n.next.load(Ordering::Relaxed, guard);
                    }
                }
                return;
            }
            match self.transfer_or_combine(first, last, guard) {
                Transfer::Taken => {
                    if self.mode == Mode::Linearizable {
                        await_done(&unsafe { first.deref() }.done);
                    }
                    return;
                }
                Transfer::Unmatched => {}
                Transfer::Absorbed(new_last) => last = new_last,
            }
        }
    }

    /// Offers `first..=last` in this thread's arena slot, or empties the slot
    /// of a colliding producer and absorbs its chain.
    fn transfer_or_combine<'g>(
        &self,
        first: Shared<'g, Node<T>>,
        last: Shared<'g, Node<T>>,
        guard: &'g Guard,
    ) -> Transfer<'g, T> {
        let mask = self.arena.len() - 1;
        let index = probe() as usize & mask;
        let slot = &self.arena[index];

        loop {
            let found = slot.value.load(Ordering::SeqCst, guard);
            if found.is_null() {
                if slot
                    .value
                    .compare_exchange(
                        Shared::null(),
                        first,
                        Ordering::SeqCst,
                        Ordering::Relaxed,
                        guard,
                    )
                    .is_ok()
                {
                    for _ in 0..self.spins {
                        if slot.value.load(Ordering::SeqCst, guard) != first {
                            return Transfer::Taken;
                        }
                        core::hint::spin_loop();
                    }
                    // Reclaim the offer; losing this race means a partner
                    // took the chain between the last poll and now.
                    return match slot.value.compare_exchange(
                        first,
                        Shared::null(),
                        Ordering::SeqCst,
                        Ordering::Relaxed,
                        guard,
                    ) {
                        Ok(_) => Transfer::Unmatched,
                        Err(_) => Transfer::Taken,
                    };
                }
            } else if slot
                .value
                .compare_exchange(found, Shared::null(), Ordering::SeqCst, Ordering::Relaxed, guard)
                .is_ok()
            {
                unsafe { last.deref() }.next.store(found, Ordering::Release);
                let mut last = find_last(found, guard);
                // One greedy sweep over the remaining slots caps the latency
                // of a single operation while still draining a busy arena.
                for i in 1..self.arena.len() {
                    let slot = &self.arena[(index + i) & mask];
                    let found = slot.value.load(Ordering::SeqCst, guard);
                    if !found.is_null()
                        && slot
                            .value
                            .compare_exchange(
                                found,
                                Shared::null(),
                                Ordering::SeqCst,
                                Ordering::Relaxed,
                                guard,
                            )
                            .is_ok()
                    {
                        unsafe { last.deref() }.next.store(found, Ordering::Release);
                        last = find_last(found, guard);
                    }
                }
                return Transfer::Absorbed(last);
            }
        }
    }

    /// Unlinks `cursor` from `prev`. When `cursor` is the tail and a producer
    /// swings it concurrently, the freshly linked suffix is kept attached.
    unsafe fn excise<'g>(
        &self,
        t: Shared<'g, Node<T>>,
        prev: Shared<'g, Node<T>>,
        cursor: Shared<'g, Node<T>>,
        next: Shared<'g, Node<T>>,
        guard: &'g Guard,
    ) {
        let mut next = next;
        if cursor == t
            && self
                .tail
                .value
                .compare_exchange(t, prev, Ordering::SeqCst, Ordering::Relaxed, guard)
                .is_err()
            && next.is_null()
        {
            next = cursor.deref().next.load(Ordering::Acquire, guard);
        }
        prev.deref().next.store(next, Ordering::Release);
        // Drop the element now; node destruction itself waits for the epoch.
        (*cursor.deref().value.get()).take();
        guard.defer_destroy(cursor);
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        // No other handle exists at this point, so the unprotected guard and
        // immediate destruction are fine.
        unsafe {
            let guard = epoch::unprotected();
            let mut node = self.head.value.load(Ordering::Relaxed, guard);
            while !node.is_null() {
                let next = node.deref().next.load(Ordering::Relaxed, guard);
                drop(node.into_owned());
                node = next;
            }
            // A producer that panicked between depositing and reclaiming may
            // have left a chain in its slot.
            for slot in self.arena.iter() {
                let mut node = slot.value.load(Ordering::Relaxed, guard);
                while !node.is_null() {
                    let next = node.deref().next.load(Ordering::Relaxed, guard);
                    drop(node.into_owned());
                    node = next;
                }
            }
        }
    }
}

/// Returns the last node of the chain starting at `node`.
fn find_last<'g, T>(mut node: Shared<'g, Node<T>>, guard: &'g Guard) -> Shared<'g, Node<T>> {
    loop {
        let next = unsafe { node.deref() }.next.load(Ordering::Relaxed, guard);
        if next.is_null() {
            return node;
        }
        node = next;
    }
}

/// Creates a queue with the optimistic backoff strategy: a producer whose
/// batch is handed to a colliding producer returns without waiting, so a
/// receive issued immediately after a successful send may still report empty.
pub fn optimistic<T>() -> (Producer<T>, Consumer<T>) {
    with_mode(Mode::Optimistic)
}

/// Creates a queue with the linearizable backoff strategy: every send returns
/// only once its elements are visible to the consumer.
pub fn linearizable<T>() -> (Producer<T>, Consumer<T>) {
    with_mode(Mode::Linearizable)
}

fn with_mode<T>(mode: Mode) -> (Producer<T>, Consumer<T>) {
    let inner = Arc::new(Inner::new(mode));
    (
        Producer {
            inner: Arc::clone(&inner),
        },
        Consumer { inner },
    )
}

/// Producing handle of the queue. Cheap to clone; any number of threads may
/// send through their own or a shared handle.
pub struct Producer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Producer {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Producer<T> {
    /// Inserts `value` at the tail of the queue.
    ///
    /// Never blocks in optimistic mode. In linearizable mode it returns once
    /// the element is visible to the consumer, which may involve a bounded
    /// busy-wait when the insertion was combined with another producer's.
    pub fn send(&self, value: T) {
        let guard = epoch::pin();
        let node = Owned::new(Node::new(value)).into_shared(&guard);
        self.inner.append(node, node, &guard);
    }

    /// Inserts all elements of `values` as one batch, preserving their order.
    /// Elements of concurrent batches are never interleaved. Returns `false`
    /// if `values` is empty, `true` otherwise.
    pub fn send_all<I>(&self, values: I) -> bool
    where
        I: IntoIterator<Item = T>,
    {
        let guard = epoch::pin();
        let mut values = values.into_iter();
        let first = match values.next() {
            Some(value) => Owned::new(Node::new(value)).into_shared(&guard),
            None => return false,
        };
        let mut last = first;
        for value in values {
            let node = Owned::new(Node::new(value)).into_shared(&guard);
            unsafe { last.deref() }.next.store(node, Ordering::Relaxed);
            last = node;
        }
        self.inner.append(first, last, &guard);
        true
    }

    /// Completion mode of the queue this handle belongs to.
    pub fn mode(&self) -> Mode {
        self.inner.mode
    }
}

/// Consuming handle of the queue. There is exactly one; operations that take
/// elements out need `&mut self`, so exclusive consumption is checked at
/// compile time rather than by contract.
pub struct Consumer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Consumer<T> {
    /// Removes and returns the element at the head of the queue.
    ///
    /// A producer that already swung the tail but has not linked its batch
    /// yet leaves the chain momentarily disconnected; the queue reports empty
    /// until the link lands.
    pub fn try_recv(&mut self) -> Result<T, RecvError> {
        let guard = epoch::pin();
        let head = self.inner.head.value.load(Ordering::Relaxed, &guard);
        let next = unsafe { head.deref() }.next.load(Ordering::Acquire, &guard);
        if next.is_null() {
            return Err(RecvError);
        }
        self.inner.head.value.store(next, Ordering::Release);
        // The consumed node is the new sentinel; the old one is unreachable
        // once `head` moved.
        let value = unsafe { (*next.deref().value.get()).take() };
        unsafe { guard.defer_destroy(head) };
        value.ok_or(RecvError)
    }

    /// Returns a reference to the element at the head without removing it.
    pub fn peek(&self) -> Result<&T, RecvError> {
        let guard = epoch::pin();
        let head = self.inner.head.value.load(Ordering::Relaxed, &guard);
        let next = unsafe { head.deref() }.next.load(Ordering::Acquire, &guard);
        if next.is_null() {
            return Err(RecvError);
        }
        // The shared borrow of `self` keeps every &mut operation, and with
        // them node destruction, out while the reference lives; producers
        // never unlink.
        unsafe { (*next.deref().value.get()).as_ref() }.ok_or(RecvError)
    }

    /// `true` when head and tail are the same node. A producer that committed
    /// its tail swing makes this `false` even before its batch is linked.
    pub fn is_empty(&self) -> bool {
        let guard = epoch::pin();
        let head = self.inner.head.value.load(Ordering::Acquire, &guard);
        let tail = self.inner.tail.value.load(Ordering::Acquire, &guard);
        head == tail
    }

    /// Number of visible elements. Walks the chain, so it is O(n) and may lag
    /// behind concurrent producers.
    pub fn len(&self) -> usize {
        let guard = epoch::pin();
        let head = self.inner.head.value.load(Ordering::Relaxed, &guard);
        let mut cursor = unsafe { head.deref() }.next.load(Ordering::Acquire, &guard);
        let mut len = 0;
        while let Some(node) = unsafe { cursor.as_ref() } {
            len += 1;
            cursor = node.next.load(Ordering::Acquire, &guard);
        }
        len
    }

    /// Drops every element visible at the time of the call.
    ///
    /// Pending batches of in-flight producers are not touched: whatever lands
    /// behind the snapshot of the tail becomes the new content.
    pub fn clear(&mut self) {
        let guard = epoch::pin();
        let t = self.inner.tail.value.load(Ordering::Acquire, &guard);
        let mut node = self.inner.head.value.load(Ordering::Relaxed, &guard);
        while node != t {
            let next = unsafe { node.deref() }.next.load(Ordering::Acquire, &guard);
            if next.is_null() {
                // An in-flight append owns the link behind this node; stop
                // here and let its batch become the new content.
                break;
            }
            // Drop the element now; node destruction itself waits for the
            // epoch.
            unsafe {
                (*node.deref().value.get()).take();
                guard.defer_destroy(node);
            }
            node = next;
        }
        // The node left standing turns into the sentinel and keeps no element.
        unsafe { (*node.deref().value.get()).take() };
        self.inner.head.value.store(node, Ordering::Release);
    }

    /// `true` when some element equals `value`.
    pub fn contains(&self, value: &T) -> bool
    where
        T: PartialEq,
    {
        self.iter().any(|e| e == value)
    }

    /// `true` when every element of `values` is contained in the queue.
    pub fn contains_all(&self, values: &[T]) -> bool
    where
        T: PartialEq,
    {
        values.iter().all(|v| self.contains(v))
    }

    /// Removes the first element equal to `value`. Returns `true` when one
    /// was found.
    pub fn remove(&mut self, value: &T) -> bool
    where
        T: PartialEq,
    {
        let guard = epoch::pin();
        let t = self.inner.tail.value.load(Ordering::Acquire, &guard);
        let mut prev = self.inner.head.value.load(Ordering::Relaxed, &guard);
        let mut cursor = unsafe { prev.deref() }.next.load(Ordering::Acquire, &guard);
        while !cursor.is_null() {
            let node = unsafe { cursor.deref() };
            let next = node.next.load(Ordering::Acquire, &guard);
            if unsafe { (*node.value.get()).as_ref() } == Some(value) {
                unsafe { self.inner.excise(t, prev, cursor, next, &guard) };
                return true;
            }
            prev = cursor;
            cursor = next;
        }
        false
    }

    /// Keeps only the elements for which `keep` returns `true`. Returns
    /// `true` when anything was removed.
    pub fn retain<F>(&mut self, mut keep: F) -> bool
    where
        F: FnMut(&T) -> bool,
    {
        let guard = epoch::pin();
        let t = self.inner.tail.value.load(Ordering::Acquire, &guard);
        let mut prev = self.inner.head.value.load(Ordering::Relaxed, &guard);
        let mut cursor = unsafe { prev.deref() }.next.load(Ordering::Acquire, &guard);
        let mut modified = false;
        while !cursor.is_null() {
            let node = unsafe { cursor.deref() };
            let next = node.next.load(Ordering::Acquire, &guard);
            let keep_it = unsafe { (*node.value.get()).as_ref() }.map_or(false, &mut keep);
            if keep_it {
                prev = cursor;
            } else {
                unsafe { self.inner.excise(t, prev, cursor, next, &guard) };
                modified = true;
            }
            cursor = unsafe { prev.deref() }.next.load(Ordering::Acquire, &guard);
        }
        modified
    }

    /// Removes every element contained in `values`. Returns `true` when
    /// anything was removed.
    pub fn remove_all(&mut self, values: &[T]) -> bool
    where
        T: PartialEq,
    {
        self.retain(|e| !values.contains(e))
    }

    /// Removes every element not contained in `values`. Returns `true` when
    /// anything was removed.
    pub fn retain_all(&mut self, values: &[T]) -> bool
    where
        T: PartialEq,
    {
        self.retain(|e| values.contains(e))
    }

    /// Weakly consistent iterator over the elements.
    ///
    /// The tail is snapshotted at creation: elements present then are yielded
    /// exactly once, elements inserted later are not. Concurrent sends never
    /// invalidate the iterator.
    pub fn iter(&self) -> Iter<'_, T> {
        let guard = epoch::pin();
        let head = self.inner.head.value.load(Ordering::Relaxed, &guard);
        let tail = self.inner.tail.value.load(Ordering::Acquire, &guard);
        let cursor = head.as_raw();
        let tail = tail.as_raw();
        Iter {
            cursor,
            tail,
            guard,
            _consumer: PhantomData,
        }
    }

    /// Weakly consistent cursor that can also remove the element it last
    /// returned.
    pub fn cursor(&mut self) -> CursorMut<'_, T> {
        let guard = epoch::pin();
        let head = self.inner.head.value.load(Ordering::Relaxed, &guard);
        let tail = self.inner.tail.value.load(Ordering::Acquire, &guard);
        let cursor = head.as_raw();
        let tail = tail.as_raw();
        CursorMut {
            inner: &self.inner,
            guard,
            tail,
            prev: core::ptr::null(),
            cursor,
            can_remove: false,
        }
    }

    /// Mints an additional producing handle for this queue.
    pub fn producer(&self) -> Producer<T> {
        Producer {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Completion mode of the queue this handle belongs to.
    pub fn mode(&self) -> Mode {
        self.inner.mode
    }
}

/// Weakly consistent read-only iterator, created by [`Consumer::iter`].
pub struct Iter<'a, T> {
    cursor: *const Node<T>,
    tail: *const Node<T>,
    guard: Guard,
    _consumer: PhantomData<&'a Consumer<T>>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        if core::ptr::eq(self.cursor, self.tail) {
            return None;
        }
        let next = unsafe { &(*self.cursor).next }.load(Ordering::Acquire, &self.guard);
        if next.is_null() {
            // Disconnected window of an in-flight append; nothing more is
            // visible.
            return None;
        }
        self.cursor = next.as_raw();
        // Values are only taken through &mut operations on the consumer,
        // which the shared borrow behind 'a excludes while the reference
        // lives.
        unsafe { (*(*self.cursor).value.get()).as_ref() }
    }
}

/// Traversal handle created by [`Consumer::cursor`]; like [`Iter`] but with
/// removal of the element last returned by [`next`](CursorMut::next).
pub struct CursorMut<'a, T> {
    inner: &'a Inner<T>,
    guard: Guard,
    tail: *const Node<T>,
    prev: *const Node<T>,
    cursor: *const Node<T>,
    can_remove: bool,
}

impl<'a, T> CursorMut<'a, T> {
    /// Advances to the next element and returns a reference to it, or `None`
    /// when the snapshot is exhausted.
    pub fn next(&mut self) -> Option<&T> {
        if core::ptr::eq(self.cursor, self.tail) {
            return None;
        }
        let next = unsafe { &(*self.cursor).next }.load(Ordering::Acquire, &self.guard);
        if next.is_null() {
            return None;
        }
        // `prev` trails the cursor except across a removal, so it always
        // addresses the live node in front of the current element.
        if self.prev.is_null() || self.can_remove {
            self.prev = self.cursor;
        }
        self.cursor = next.as_raw();
        self.can_remove = true;
        unsafe { (*(*self.cursor).value.get()).as_ref() }
    }

    /// Removes and returns the element last returned by
    /// [`next`](CursorMut::next).
    ///
    /// Fails when `next` has not been called yet, or when the element it
    /// returned was already removed.
    pub fn remove(&mut self) -> Result<T, RemoveError> {
        if !self.can_remove {
            return Err(RemoveError);
        }
        let guard = &self.guard;
        let t: Shared<'_, Node<T>> = Shared::from(self.tail);
        let prev: Shared<'_, Node<T>> = Shared::from(self.prev);
        let cursor: Shared<'_, Node<T>> = Shared::from(self.cursor);
        let node = unsafe { cursor.deref() };
        let value = unsafe { (*node.value.get()).take() };
        let next = node.next.load(Ordering::Acquire, guard);
        if cursor == t
            && self
                .inner
                .tail
                .value
                .compare_exchange(t, prev, Ordering::SeqCst, Ordering::Relaxed, guard)
                .is_err()
            && next.is_null()
        {
            // A producer just linked behind what the snapshot took for the
            // tail; keep that suffix attached.
            let next = node.next.load(Ordering::Acquire, guard);
            unsafe { prev.deref() }.next.store(next, Ordering::Release);
        } else {
            let next = node.next.load(Ordering::Acquire, guard);
            unsafe { prev.deref() }.next.store(next, Ordering::Release);
        }
        unsafe { guard.defer_destroy(cursor) };
        self.can_remove = false;
        value.ok_or(RemoveError)
    }
}

#[cfg(feature = "serde")]
mod persist {
    use super::{linearizable, optimistic, Consumer, Mode};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// The persisted form is the mode flag plus the in-order visible
    /// elements; the node chain and the arena have no serialized
    /// representation at all.
    #[derive(Serialize)]
    struct Snapshot<'a, T> {
        linearizable: bool,
        elements: Vec<&'a T>,
    }

    #[derive(Deserialize)]
    #[serde(rename = "Snapshot")]
    struct Restored<T> {
        linearizable: bool,
        elements: Vec<T>,
    }

    impl<T: Serialize> Serialize for Consumer<T> {
        fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
            Snapshot {
                linearizable: self.mode() == Mode::Linearizable,
                elements: self.iter().collect(),
            }
            .serialize(serializer)
        }
    }

    impl<'de, T: Deserialize<'de>> Deserialize<'de> for Consumer<T> {
        fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
            let restored = Restored::<T>::deserialize(deserializer)?;
            let (producer, consumer) = if restored.linearizable {
                linearizable()
            } else {
                optimistic()
            };
            producer.send_all(restored.elements);
            Ok(consumer)
        }
    }
}
