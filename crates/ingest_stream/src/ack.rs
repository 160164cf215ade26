use std::{
    collections::BTreeMap,
    future::{Future, IntoFuture},
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, OnceLock,
    },
};

use tokio::sync::Notify;

use crate::{
    error::{IngestError, IngestResult},
    lock,
};

/// Identifier assigned to each admitted record; strictly increasing for the stream's lifetime.
pub type AckId = u64;

/// Logical offset the service assigned to a durably accepted record.
pub type Offset = i64;

pub type AckOutcome = Result<Offset, IngestError>;

/// Single-assignment cell shared by the table entry and every clone of the handle.
#[derive(Debug, Default)]
struct AckCell {
    outcome: OnceLock<AckOutcome>,
    notify: Notify,
}

impl AckCell {
    fn complete(&self, outcome: AckOutcome) -> bool {
        let stored = self.outcome.set(outcome).is_ok();
        if stored {
            self.notify.notify_waiters();
        }
        stored
    }

    fn get(&self) -> Option<&AckOutcome> {
        self.outcome.get()
    }

    async fn wait(&self) -> AckOutcome {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(outcome) = self.outcome.get() {
                return outcome.clone();
            }
            notified.await;
        }
    }
}

/// Outcome of one submitted record.
///
/// Waiting and polling observe the same final state; once resolved, every call returns the
/// cached outcome. `handle.await` is shorthand for [`AckHandle::wait`].
#[derive(Clone, Debug)]
pub struct AckHandle {
    id: AckId,
    cell: Arc<AckCell>,
}

impl AckHandle {
    pub fn id(&self) -> AckId {
        self.id
    }

    pub async fn wait(&self) -> AckOutcome {
        self.cell.wait().await
    }

    /// Non-blocking poll; `None` while the record is still pending.
    pub fn try_get(&self) -> Option<AckOutcome> {
        self.cell.get().cloned()
    }

    pub fn is_ready(&self) -> bool {
        self.cell.get().is_some()
    }
}

impl IntoFuture for AckHandle {
    type Output = AckOutcome;
    type IntoFuture = Pin<Box<dyn Future<Output = AckOutcome> + Send>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.cell.wait().await })
    }
}

#[derive(Debug, Default)]
struct TableInner {
    pending: BTreeMap<AckId, Arc<AckCell>>,
    sealed: Option<IngestError>,
}

/// Pending acknowledgments keyed by ack id.
///
/// Entries are pruned as soon as they resolve; the handle keeps the cached outcome. Once sealed,
/// the table refuses new registrations with the sealing error.
#[derive(Debug)]
pub struct AckTable {
    next_id: AtomicU64,
    inner: Mutex<TableInner>,
}

impl Default for AckTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AckTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            inner: Mutex::new(TableInner::default()),
        }
    }

    pub fn allocate(&self) -> AckId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Creates a pending entry for `id`. Registering an id twice returns the existing handle.
    pub fn register(&self, id: AckId) -> IngestResult<AckHandle> {
        let mut inner = lock(&self.inner);
        if let Some(err) = &inner.sealed {
            return Err(err.clone());
        }
        let cell = inner.pending.entry(id).or_default().clone();
        Ok(AckHandle { id, cell })
    }

    /// Allocates, registers, and hands the id to `enqueue` under one lock so ids reach the
    /// send queue in allocation order.
    pub(crate) fn admit<F>(&self, enqueue: F) -> IngestResult<AckHandle>
    where
        F: FnOnce(AckId) -> IngestResult<()>,
    {
        let mut inner = lock(&self.inner);
        if let Some(err) = &inner.sealed {
            return Err(err.clone());
        }
        let id = self.allocate();
        let cell = Arc::new(AckCell::default());
        inner.pending.insert(id, cell.clone());
        if let Err(err) = enqueue(id) {
            inner.pending.remove(&id);
            return Err(err);
        }
        Ok(AckHandle { id, cell })
    }

    /// Returns `true` if `id` was pending and is now resolved.
    pub fn resolve(&self, id: AckId, offset: Offset) -> bool {
        self.complete(id, Ok(offset))
    }

    /// Returns `true` if `id` was pending and is now failed.
    pub fn fail(&self, id: AckId, error: IngestError) -> bool {
        self.complete(id, Err(error))
    }

    pub(crate) fn complete(&self, id: AckId, outcome: AckOutcome) -> bool {
        let cell = lock(&self.inner).pending.remove(&id);
        match cell {
            Some(cell) => cell.complete(outcome),
            None => false,
        }
    }

    /// Waits on a pending entry. Ids that were never issued or already pruned report
    /// [`IngestError::UnknownAck`]; hold the [`AckHandle`] to read a settled outcome.
    pub async fn wait(&self, id: AckId) -> AckOutcome {
        let cell = lock(&self.inner).pending.get(&id).cloned();
        match cell {
            Some(cell) => cell.wait().await,
            None => Err(IngestError::UnknownAck(id)),
        }
    }

    pub fn try_get(&self, id: AckId) -> Option<AckOutcome> {
        let inner = lock(&self.inner);
        match inner.pending.get(&id) {
            Some(cell) => cell.get().cloned(),
            None => Some(Err(IngestError::UnknownAck(id))),
        }
    }

    /// Fails every pending entry with `error`; returns how many were failed.
    pub fn fail_all_pending(&self, error: IngestError) -> usize {
        let drained = std::mem::take(&mut lock(&self.inner).pending);
        drained
            .into_values()
            .filter(|cell| cell.complete(Err(error.clone())))
            .count()
    }

    /// Stops admission. The first seal wins; returns whether this call sealed the table.
    pub fn seal(&self, error: IngestError) -> bool {
        let mut inner = lock(&self.inner);
        if inner.sealed.is_some() {
            return false;
        }
        inner.sealed = Some(error);
        true
    }

    pub fn sealed(&self) -> Option<IngestError> {
        lock(&self.inner).sealed.clone()
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.inner).pending.len()
    }

    /// Handles for every pending entry, in ack id order.
    pub fn pending_handles(&self) -> Vec<AckHandle> {
        lock(&self.inner)
            .pending
            .iter()
            .map(|(id, cell)| AckHandle {
                id: *id,
                cell: cell.clone(),
            })
            .collect()
    }
}
