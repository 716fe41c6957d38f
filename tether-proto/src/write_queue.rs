use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use slab::Slab;
use tracing::trace;

/// Purpose of a write item
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum WiKind {
    /// Expects a response; failed back to the application if none arrives
    Request {
        req_id: u32,
        /// `None` waits indefinitely
        timeout: Option<Duration>,
    },
    /// Fire-and-forget; done as soon as the write completes
    Notify,
}

/// One outbound packet in flight, from `send` until release
#[derive(Debug)]
pub(crate) struct WriteItem {
    pub(crate) kind: WiKind,
    pub(crate) seq: u32,
    /// Framed packet bytes; the writer holds a refcounted clone while flushing
    pub(crate) buf: Bytes,
    pub(crate) queued_at: Instant,
    /// Remaining reconnect cycles this item may be replayed across
    pub(crate) retries_left: u32,
}

/// Handle to a write item: a preallocated pool slot or a heap (slab) entry
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) enum WiHandle {
    Slot(usize),
    Heap(usize),
}

/// Preallocated slots plus overflow storage for write items
///
/// `None` in a slot means idle; acquisition prefers slots and falls back to
/// the slab, so steady-state sends never touch the allocator.
#[derive(Debug)]
pub(crate) struct WriteStore {
    slots: Box<[Option<WriteItem>]>,
    overflow: Slab<WriteItem>,
}

impl WriteStore {
    fn new(pool_slots: usize) -> Self {
        Self {
            slots: (0..pool_slots).map(|_| None).collect(),
            overflow: Slab::new(),
        }
    }

    fn acquire(&mut self, item: WriteItem) -> WiHandle {
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(item);
                trace!(slot = i, "write item in pool slot");
                return WiHandle::Slot(i);
            }
        }
        let key = self.overflow.insert(item);
        trace!(key, "write item heap-allocated, pool exhausted");
        WiHandle::Heap(key)
    }

    fn get(&self, handle: WiHandle) -> Option<&WriteItem> {
        match handle {
            WiHandle::Slot(i) => self.slots.get(i).and_then(Option::as_ref),
            WiHandle::Heap(k) => self.overflow.get(k),
        }
    }

    fn get_mut(&mut self, handle: WiHandle) -> Option<&mut WriteItem> {
        match handle {
            WiHandle::Slot(i) => self.slots.get_mut(i).and_then(Option::as_mut),
            WiHandle::Heap(k) => self.overflow.get_mut(k),
        }
    }

    /// Take the item out, returning the slot to idle or freeing the slab entry
    fn release(&mut self, handle: WiHandle) -> Option<WriteItem> {
        match handle {
            WiHandle::Slot(i) => self.slots.get_mut(i).and_then(Option::take),
            WiHandle::Heap(k) => self.overflow.try_remove(k),
        }
    }

    fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count() + self.overflow.len()
    }
}

/// Result of failing a set of in-flight or queued items
#[derive(Debug, Default)]
pub(crate) struct SettleOutcome {
    /// Request ids that were failed back to the application
    pub(crate) failed_requests: Vec<u32>,
    /// Sequence numbers of notifications that never made it out
    pub(crate) failed_notifies: Vec<u32>,
    /// Items preserved for replay on the next connection
    pub(crate) retried: usize,
}

/// A request moved to resp-pending after its write completed
#[derive(Debug)]
pub(crate) struct RespPending {
    pub(crate) handle: WiHandle,
    pub(crate) req_id: u32,
    pub(crate) deadline: Option<Instant>,
}

/// The write-item store and the two queues shared with calling threads
///
/// Lives behind the single write-queue lock: calling threads enqueue here,
/// the I/O thread drains, releases, and requeues. The writing and
/// resp-pending queues are not here; they belong to the connection and are
/// touched by the I/O thread alone.
#[derive(Debug)]
pub(crate) struct SendQueues {
    store: WriteStore,
    /// Queued before the handshake finished; replayed in order at `Done`
    conn_pending: VecDeque<WiHandle>,
    /// Queued while `Done`, waiting for the writer to go idle
    write_wait: VecDeque<WiHandle>,
}

impl SendQueues {
    pub(crate) fn new(pool_slots: usize) -> Self {
        Self {
            store: WriteStore::new(pool_slots),
            conn_pending: VecDeque::new(),
            write_wait: VecDeque::new(),
        }
    }

    /// Store an item and append it to the queue matching the connection state
    pub(crate) fn enqueue(&mut self, item: WriteItem, connected: bool) -> WiHandle {
        let handle = self.store.acquire(item);
        if connected {
            self.write_wait.push_back(handle);
        } else {
            self.conn_pending.push_back(handle);
        }
        handle
    }

    /// Move everything queued before the handshake into the write queue,
    /// preserving order
    pub(crate) fn promote_pending(&mut self) {
        self.write_wait.extend(self.conn_pending.drain(..));
    }

    /// Drain the write queue for one batched write
    ///
    /// Items keep ownership of their buffers; the writer gets clones.
    pub(crate) fn begin_write(&mut self) -> Vec<(WiHandle, Bytes)> {
        self.write_wait
            .drain(..)
            .filter_map(|h| self.store.get(h).map(|item| (h, item.buf.clone())))
            .collect()
    }

    /// Classify written items: requests become resp-pending entries with
    /// their deadline fixed from enqueue time; notifications are released
    /// and their sequence numbers returned
    pub(crate) fn complete_written(&mut self, handles: Vec<WiHandle>) -> (Vec<RespPending>, Vec<u32>) {
        let mut pending = Vec::new();
        let mut notified = Vec::new();
        for handle in handles {
            let Some(item) = self.store.get(handle) else {
                continue;
            };
            match item.kind {
                WiKind::Request { req_id, timeout } => pending.push(RespPending {
                    handle,
                    req_id,
                    deadline: timeout.map(|t| item.queued_at + t),
                }),
                WiKind::Notify => {
                    let seq = item.seq;
                    self.store.release(handle);
                    notified.push(seq);
                }
            }
        }
        (pending, notified)
    }

    /// Release a single item (response arrived, or its deadline passed)
    pub(crate) fn release(&mut self, handle: WiHandle) -> Option<WriteItem> {
        self.store.release(handle)
    }

    /// Fail or preserve items that were written (or mid-write) when the
    /// connection dropped
    ///
    /// With `allow_retry`, items with retry budget left are pushed back to
    /// the front of conn-pending in order, ready for replay; the rest are
    /// released and reported.
    pub(crate) fn settle_inflight(&mut self, handles: Vec<WiHandle>, allow_retry: bool) -> SettleOutcome {
        let mut outcome = SettleOutcome::default();
        let mut keep = Vec::new();
        for handle in handles {
            let retry = allow_retry
                && self
                    .store
                    .get(handle)
                    .map_or(false, |item| item.retries_left > 0);
            if retry {
                if let Some(item) = self.store.get_mut(handle) {
                    item.retries_left -= 1;
                }
                keep.push(handle);
                continue;
            }
            let Some(item) = self.store.release(handle) else {
                continue;
            };
            match item.kind {
                WiKind::Request { req_id, .. } => outcome.failed_requests.push(req_id),
                WiKind::Notify => outcome.failed_notifies.push(item.seq),
            }
        }
        outcome.retried = keep.len();
        for handle in keep.into_iter().rev() {
            self.conn_pending.push_front(handle);
        }
        outcome
    }

    /// Fail everything still queued, releasing every item
    pub(crate) fn fail_queued(&mut self) -> SettleOutcome {
        let mut outcome = SettleOutcome::default();
        for handle in self.conn_pending.drain(..).chain(self.write_wait.drain(..)) {
            let Some(item) = self.store.release(handle) else {
                continue;
            };
            match item.kind {
                WiKind::Request { req_id, .. } => outcome.failed_requests.push(req_id),
                WiKind::Notify => outcome.failed_notifies.push(item.seq),
            }
        }
        outcome
    }

    pub(crate) fn has_queued(&self) -> bool {
        !self.write_wait.is_empty() || !self.conn_pending.is_empty()
    }

    /// Items currently alive in the store, for the leak accounting invariant
    #[cfg(test)]
    pub(crate) fn live_items(&self) -> usize {
        self.store.len()
    }

    #[cfg(test)]
    pub(crate) fn queued_handles(&self) -> (Vec<WiHandle>, Vec<WiHandle>) {
        (
            self.conn_pending.iter().copied().collect(),
            self.write_wait.iter().copied().collect(),
        )
    }
}
