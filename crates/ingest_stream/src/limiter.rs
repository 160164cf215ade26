use tokio::sync::{Semaphore, SemaphorePermit};

use crate::error::{IngestError, IngestResult};

/// Counting admission gate bounding the number of unacknowledged records.
///
/// A permit is taken before a record is admitted and handed back only when its acknowledgment
/// settles. Closing the gate wakes every blocked caller with [`IngestError::StreamClosed`].
#[derive(Debug)]
pub struct InflightLimiter {
    semaphore: Semaphore,
    capacity: usize,
}

/// A permit that returns to the gate on drop unless [`InflightPermit::commit`] is called.
#[derive(Debug)]
pub struct InflightPermit<'a> {
    permit: SemaphorePermit<'a>,
}

impl InflightPermit<'_> {
    /// Keeps the permit held past this guard; [`InflightLimiter::release`] returns it later.
    pub fn commit(self) {
        self.permit.forget();
    }
}

impl InflightLimiter {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Semaphore::new(capacity),
            capacity,
        }
    }

    pub async fn acquire(&self) -> IngestResult<InflightPermit<'_>> {
        self.semaphore
            .acquire()
            .await
            .map(|permit| InflightPermit { permit })
            .map_err(|_| IngestError::StreamClosed)
    }

    pub fn release(&self) {
        self.release_many(1);
    }

    pub fn release_many(&self, count: usize) {
        if count > 0 {
            self.semaphore.add_permits(count);
        }
    }

    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }
}
