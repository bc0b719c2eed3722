//! Fixed capacity queues of fixed size items, for handing data between tasks.
//!
//! Waiting for space or for data happens on per-queue counting semaphores,
//! so a full or empty queue never holds up any other queue.
//! The registry lock of a [`QueueContext`] is only held to look a queue up,
//! register it or unlink it.
//!
//! Removing a queue closes its semaphores, so any task blocked in
//! [`QueueContext::read`] or [`QueueContext::write`] wakes up with an error
//! instead of waiting forever.

use std::{
    collections::HashMap,
    fmt::Display,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::sync::{Semaphore, TryAcquireError};
use tracing::{debug, trace};

use crate::error::Error;

/// Handles below this value are never handed out.
pub const HANDLE_MIN: i32 = 0x10;

/// Identifies a queue within a [`QueueContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueueHandle(i32);

impl QueueHandle {
    /// The raw value of the handle.
    pub fn as_i32(&self) -> i32 {
        self.0
    }
}

impl Display for QueueHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "queue#{}", self.0)
    }
}

#[derive(Debug)]
struct Ring {
    buffer: Vec<u8>,
    item_size: usize,
    capacity: usize,
    write: usize,
    read: usize,
    count: usize,

    /// Set once the queue has been removed.
    closed: bool,
}

impl Ring {
    fn slot(&self, index: usize) -> std::ops::Range<usize> {
        let start = index * self.item_size;
        start..start + self.item_size
    }

    fn push(&mut self, item: &[u8]) {
        let slot = self.slot(self.write);
        self.buffer[slot].copy_from_slice(item);

        self.write = (self.write + 1) % self.capacity;
        self.count += 1;
    }

    fn pop(&mut self, out: Option<&mut [u8]>) {
        if let Some(out) = out {
            let slot = self.slot(self.read);
            out[..self.item_size].copy_from_slice(&self.buffer[slot]);
        }

        self.read = (self.read + 1) % self.capacity;
        self.count -= 1;
    }

    fn peek(&self, out: &mut [u8]) -> bool {
        if self.count == 0 {
            return false;
        }

        let slot = self.slot(self.read);
        out[..self.item_size].copy_from_slice(&self.buffer[slot]);

        true
    }
}

#[derive(Debug)]
struct Queue {
    handle: QueueHandle,
    item_size: usize,

    /// Free slots.
    writable: Semaphore,

    /// Items ready to be read.
    readable: Semaphore,

    /// Exclusive access to the cursors.
    /// Never held across an await.
    ring: Mutex<Ring>,
}

impl Queue {
    fn ring(&self) -> MutexGuard<'_, Ring> {
        self.ring.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_item(&self, item: &[u8]) -> Result<(), Error> {
        if item.len() == self.item_size {
            Ok(())
        } else {
            Err(Error::InvalidParameter(format!(
                "item of {} byte(s) given to {} which holds {} byte items",
                item.len(),
                self.handle,
                self.item_size
            )))
        }
    }

    fn check_out(&self, out: &Option<&mut [u8]>) -> Result<(), Error> {
        match out {
            Some(out) if out.len() < self.item_size => Err(Error::InvalidParameter(format!(
                "output of {} byte(s) is too small for {} which holds {} byte items",
                out.len(),
                self.handle,
                self.item_size
            ))),
            _ => Ok(()),
        }
    }

    fn removed(&self) -> Error {
        Error::NotFound(format!("{} was removed", self.handle))
    }

    /// Copy an item in.
    /// The caller must own a permit from `writable`.
    fn store(&self, item: &[u8]) -> Result<(), Error> {
        let mut ring = self.ring();

        if ring.closed {
            return Err(self.removed());
        }

        ring.push(item);
        self.readable.add_permits(1);

        Ok(())
    }

    /// Copy an item out, or drop it.
    /// The caller must own a permit from `readable`.
    fn take(&self, out: Option<&mut [u8]>) -> Result<(), Error> {
        let mut ring = self.ring();

        if ring.closed {
            return Err(self.removed());
        }

        ring.pop(out);
        self.writable.add_permits(1);

        Ok(())
    }
}

#[derive(Debug)]
struct Registry {
    queues: HashMap<QueueHandle, Arc<Queue>>,
    next: i32,
}

impl Registry {
    fn new() -> Self {
        Self {
            queues: HashMap::new(),
            next: HANDLE_MIN,
        }
    }

    fn next_handle(&mut self) -> QueueHandle {
        loop {
            let candidate = QueueHandle(self.next);

            self.next = if self.next == i32::MAX {
                HANDLE_MIN
            } else {
                self.next + 1
            };

            if !self.queues.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}

/// Owns a set of queues.
///
/// Cloning the context gives another reference to the same set.
/// Tests should create a fresh context each.
#[derive(Debug, Clone)]
pub struct QueueContext {
    registry: Arc<Mutex<Option<Registry>>>,
}

impl Default for QueueContext {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueContext {
    /// A new, initialised, context with no queues.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Some(Registry::new()))),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Option<Registry>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deinitialise the context.
    ///
    /// All queues are removed (waking their waiters),
    /// and creating new queues fails with [`Error::NotInitialised`].
    pub fn deinit(&self) {
        let registry = self.registry().take();

        if let Some(registry) = registry {
            debug!("Deinitialising with {} queue(s) left", registry.queues.len());

            for queue in registry.queues.into_values() {
                queue.ring().closed = true;
                queue.readable.close();
                queue.writable.close();
            }
        }
    }

    fn lookup(&self, handle: QueueHandle) -> Result<Arc<Queue>, Error> {
        self.registry()
            .as_ref()
            .ok_or(Error::NotInitialised)?
            .queues
            .get(&handle)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("no such queue: {handle}")))
    }

    /// Create a queue holding up to `max_items` items of `item_size` bytes each.
    pub fn create(&self, item_size: usize, max_items: usize) -> Result<QueueHandle, Error> {
        if item_size == 0 || max_items == 0 {
            return Err(Error::InvalidParameter(format!(
                "queues need non-zero sizes, got {item_size} byte items times {max_items}"
            )));
        }

        if max_items > Semaphore::MAX_PERMITS {
            return Err(Error::InvalidParameter(format!(
                "at most {} items per queue",
                Semaphore::MAX_PERMITS
            )));
        }

        if self.registry().is_none() {
            return Err(Error::NotInitialised);
        }

        let len = item_size.checked_mul(max_items).ok_or(Error::NoMemory)?;

        let mut buffer = Vec::new();
        buffer.try_reserve_exact(len).map_err(|_| Error::NoMemory)?;
        buffer.resize(len, 0);

        let mut registry = self.registry();
        let registry = registry.as_mut().ok_or(Error::NotInitialised)?;

        let handle = registry.next_handle();

        let queue = Queue {
            handle,
            item_size,
            writable: Semaphore::new(max_items),
            readable: Semaphore::new(0),
            ring: Mutex::new(Ring {
                buffer,
                item_size,
                capacity: max_items,
                write: 0,
                read: 0,
                count: 0,
                closed: false,
            }),
        };

        registry.queues.insert(handle, Arc::new(queue));
        debug!(%handle, item_size, max_items, "Queue created");

        Ok(handle)
    }

    /// Write an item, waiting for a free slot if the queue is full.
    pub async fn write(&self, handle: QueueHandle, item: &[u8]) -> Result<(), Error> {
        let queue = self.lookup(handle)?;
        queue.check_item(item)?;

        let slot = queue
            .writable
            .acquire()
            .await
            .map_err(|_| queue.removed())?;

        queue.store(item)?;
        slot.forget();

        trace!(%handle, "Item written");
        Ok(())
    }

    /// Write an item if there is a free slot, else fail with [`Error::Busy`].
    pub fn try_write(&self, handle: QueueHandle, item: &[u8]) -> Result<(), Error> {
        let queue = self.lookup(handle)?;
        queue.check_item(item)?;

        let slot = match queue.writable.try_acquire() {
            Ok(slot) => slot,
            Err(TryAcquireError::NoPermits) => {
                return Err(Error::Busy(format!("{handle} is full")));
            }
            Err(TryAcquireError::Closed) => return Err(queue.removed()),
        };

        queue.store(item)?;
        slot.forget();

        Ok(())
    }

    /// Read an item, waiting for one to arrive.
    ///
    /// Waits forever if `wait` is `None`.
    /// If `out` is `None` the item is discarded.
    pub async fn read(
        &self,
        handle: QueueHandle,
        out: Option<&mut [u8]>,
        wait: Option<Duration>,
    ) -> Result<(), Error> {
        let queue = self.lookup(handle)?;
        queue.check_out(&out)?;

        let acquire = queue.readable.acquire();

        let item = match wait {
            Some(wait) => tokio::time::timeout(wait, acquire)
                .await
                .map_err(|_| Error::Timeout)?,
            None => acquire.await,
        }
        .map_err(|_| queue.removed())?;

        queue.take(out)?;
        item.forget();

        trace!(%handle, "Item read");
        Ok(())
    }

    /// Copy the next item out without consuming it.
    ///
    /// Does not wait: fails with [`Error::Timeout`] if the queue is empty.
    pub fn peek(&self, handle: QueueHandle, out: &mut [u8]) -> Result<(), Error> {
        let queue = self.lookup(handle)?;
        queue.check_out(&Some(&mut *out))?;

        let ring = queue.ring();

        if ring.closed {
            return Err(queue.removed());
        }

        if ring.peek(out) {
            Ok(())
        } else {
            Err(Error::Timeout)
        }
    }

    /// How many more items the queue can take right now.
    pub fn free_count(&self, handle: QueueHandle) -> Result<usize, Error> {
        let queue = self.lookup(handle)?;
        let ring = queue.ring();

        if ring.closed {
            return Err(queue.removed());
        }

        Ok(ring.capacity - ring.count)
    }

    /// Remove a queue.
    ///
    /// Anything blocked reading or writing it wakes up with [`Error::NotFound`].
    pub fn remove(&self, handle: QueueHandle) -> Result<(), Error> {
        let queue = self.lookup(handle)?;

        {
            let mut ring = queue.ring();

            if ring.closed {
                return Err(queue.removed());
            }

            ring.closed = true;
        }

        queue.readable.close();
        queue.writable.close();

        if let Some(registry) = self.registry().as_mut() {
            registry.queues.remove(&handle);
        }

        debug!(%handle, "Queue removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn reads_come_out_in_write_order() {
        let ctx = QueueContext::new();
        let q = ctx.create(4, 8).unwrap();

        for i in 0u32..8 {
            ctx.write(q, &i.to_le_bytes()).await.unwrap();
        }

        for i in 0u32..8 {
            let mut out = [0u8; 4];
            ctx.read(q, Some(&mut out), None).await.unwrap();
            assert_eq!(u32::from_le_bytes(out), i);
        }
    }

    #[tokio::test]
    async fn cursors_wrap_around() {
        let ctx = QueueContext::new();
        let q = ctx.create(1, 3).unwrap();

        for round in 0u8..10 {
            ctx.write(q, &[round]).await.unwrap();
            ctx.write(q, &[round + 100]).await.unwrap();

            let mut out = [0u8];
            ctx.read(q, Some(&mut out), None).await.unwrap();
            assert_eq!(out[0], round);
            ctx.read(q, Some(&mut out), None).await.unwrap();
            assert_eq!(out[0], round + 100);
        }

        assert_eq!(ctx.free_count(q).unwrap(), 3);
    }

    #[tokio::test]
    async fn free_count_tracks_writes_and_reads() {
        let ctx = QueueContext::new();
        let q = ctx.create(2, 5).unwrap();

        assert_eq!(ctx.free_count(q).unwrap(), 5);

        for k in 1..=5 {
            ctx.write(q, &[0, 0]).await.unwrap();
            assert_eq!(ctx.free_count(q).unwrap(), 5 - k);
        }

        ctx.read(q, None, Some(Duration::ZERO)).await.unwrap();
        assert_eq!(ctx.free_count(q).unwrap(), 1);
    }

    #[tokio::test]
    async fn write_to_full_queue_waits() {
        let ctx = QueueContext::new();
        let q = ctx.create(1, 1).unwrap();

        ctx.write(q, &[1]).await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), ctx.write(q, &[2])).await;
        assert!(blocked.is_err());

        assert!(matches!(ctx.try_write(q, &[2]), Err(Error::Busy(_))));

        ctx.read(q, None, None).await.unwrap();
        ctx.try_write(q, &[2]).unwrap();
    }

    #[tokio::test]
    async fn read_from_empty_queue_times_out() {
        let ctx = QueueContext::new();
        let q = ctx.create(1, 1).unwrap();

        let result = ctx.read(q, None, Some(Duration::from_millis(20))).await;
        assert_eq!(result, Err(Error::Timeout));
    }

    #[tokio::test]
    async fn peek_does_not_consume() {
        let ctx = QueueContext::new();
        let q = ctx.create(1, 2).unwrap();

        let mut out = [0u8];
        assert_eq!(ctx.peek(q, &mut out), Err(Error::Timeout));

        ctx.write(q, &[7]).await.unwrap();

        ctx.peek(q, &mut out).unwrap();
        assert_eq!(out[0], 7);
        ctx.peek(q, &mut out).unwrap();
        assert_eq!(out[0], 7);
        assert_eq!(ctx.free_count(q).unwrap(), 1);

        let mut read = [0u8];
        ctx.read(q, Some(&mut read), None).await.unwrap();
        assert_eq!(read[0], 7);
        assert_eq!(ctx.peek(q, &mut out), Err(Error::Timeout));
    }

    #[tokio::test]
    async fn wrong_item_sizes_are_refused() {
        let ctx = QueueContext::new();
        let q = ctx.create(4, 1).unwrap();

        assert!(matches!(
            ctx.write(q, &[1, 2]).await,
            Err(Error::InvalidParameter(_))
        ));

        ctx.write(q, &[1, 2, 3, 4]).await.unwrap();

        let mut small = [0u8; 2];
        assert!(matches!(
            ctx.read(q, Some(&mut small), None).await,
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn zero_sizes_are_refused() {
        let ctx = QueueContext::new();

        assert!(matches!(ctx.create(0, 1), Err(Error::InvalidParameter(_))));
        assert!(matches!(ctx.create(1, 0), Err(Error::InvalidParameter(_))));
    }

    #[test]
    fn unknown_handle_is_not_found() {
        let ctx = QueueContext::new();
        let other = QueueContext::new();

        let q = other.create(1, 1).unwrap();

        assert!(matches!(ctx.free_count(q), Err(Error::NotFound(_))));
        assert!(matches!(ctx.remove(q), Err(Error::NotFound(_))));
    }

    #[test]
    fn deinit_refuses_new_queues() {
        let ctx = QueueContext::new();
        let q = ctx.create(1, 1).unwrap();

        ctx.deinit();

        assert_eq!(ctx.create(1, 1), Err(Error::NotInitialised));
        assert_eq!(ctx.free_count(q), Err(Error::NotInitialised));
    }

    #[test]
    fn handles_skip_reserved_values_when_wrapping() {
        let ctx = QueueContext::new();

        let first = ctx.create(1, 1).unwrap();
        assert_eq!(first.as_i32(), HANDLE_MIN);

        ctx.registry().as_mut().unwrap().next = i32::MAX;

        let last = ctx.create(1, 1).unwrap();
        assert_eq!(last.as_i32(), i32::MAX);

        // HANDLE_MIN is still in use, so it is skipped.
        let wrapped = ctx.create(1, 1).unwrap();
        assert_eq!(wrapped.as_i32(), HANDLE_MIN + 1);
    }

    #[tokio::test]
    async fn remove_wakes_blocked_reader() {
        let ctx = QueueContext::new();
        let q = ctx.create(1, 1).unwrap();

        let reader = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.read(q, None, None).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.remove(q).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("Reader should wake up")
            .unwrap();

        assert!(matches!(result, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn remove_wakes_blocked_writer() {
        let ctx = QueueContext::new();
        let q = ctx.create(1, 1).unwrap();
        ctx.write(q, &[0]).await.unwrap();

        let writer = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.write(q, &[1]).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.remove(q).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), writer)
            .await
            .expect("Writer should wake up")
            .unwrap();

        assert!(matches!(result, Err(Error::NotFound(_))));
    }
}
