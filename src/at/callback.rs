//! Deferred work for an AT client.
//!
//! URC handlers must not block the receive task, so anything which needs to
//! talk to the module in response to a URC is queued here and run by a
//! dedicated task.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard, PoisonError, Weak,
    },
};

use futures::future::BoxFuture;
use tracing::{debug, trace};

use crate::{
    at::client::{AtClient, Inner},
    error::Error,
    queue::{QueueContext, QueueHandle},
};

/// Queue items are callback ids.
const ITEM_SIZE: usize = std::mem::size_of::<u64>();

pub(crate) type Callback = Box<dyn FnOnce(AtClient) -> BoxFuture<'static, ()> + Send>;

pub(crate) struct CallbackQueue {
    ctx: QueueContext,
    handle: QueueHandle,
    pending: Mutex<HashMap<u64, Callback>>,
    next_id: AtomicU64,
}

impl CallbackQueue {
    pub(crate) fn new(ctx: &QueueContext, depth: usize) -> Result<Self, Error> {
        let handle = ctx.create(ITEM_SIZE, depth)?;

        Ok(Self {
            ctx: ctx.clone(),
            handle,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        })
    }

    pub(crate) fn handle(&self) -> QueueHandle {
        self.handle
    }

    pub(crate) fn context(&self) -> QueueContext {
        self.ctx.clone()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<u64, Callback>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a callback without waiting.
    /// Fails with [`Error::Busy`] if the queue is full.
    pub(crate) fn push(&self, callback: Callback) -> Result<(), Error> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.pending().insert(id, callback);

        if let Err(e) = self.ctx.try_write(self.handle, &id.to_le_bytes()) {
            self.pending().remove(&id);
            return Err(e);
        }

        trace!(id, "Callback queued");
        Ok(())
    }

    fn take(&self, id: u64) -> Option<Callback> {
        self.pending().remove(&id)
    }

    /// Drop queued callbacks and wake the task running them, which then exits.
    pub(crate) fn close(&self) {
        let _ = self.ctx.remove(self.handle);
        self.pending().clear();
    }
}

impl Drop for CallbackQueue {
    fn drop(&mut self) {
        self.close();
    }
}

/// Run callbacks, in the order they were queued, until the queue is removed
/// or the client is gone.
pub(crate) async fn run(ctx: QueueContext, handle: QueueHandle, client: Weak<Inner>) {
    let mut item = [0; ITEM_SIZE];

    loop {
        if let Err(e) = ctx.read(handle, Some(&mut item), None).await {
            debug!("Callback queue closed ({e}), exiting");
            break;
        }

        let Some(inner) = client.upgrade() else {
            debug!("Client gone, exiting");
            break;
        };

        let id = u64::from_le_bytes(item);
        let callback = inner.callbacks.take(id);

        match callback {
            Some(callback) => {
                trace!(id, "Running callback");
                callback(AtClient::from_inner(inner)).await;
            }
            None => debug!(id, "Callback was dropped before it could run"),
        }
    }
}
