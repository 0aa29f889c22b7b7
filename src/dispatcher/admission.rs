//! The bounded gate on concurrent deliveries.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// A fixed number of delivery slots, shared by every in-flight delivery.
///
/// A slot is held by the [`Slot`] guard returned from [`AdmissionPool::acquire`]
/// and released when the guard is dropped, whichever way the holder exits.
#[derive(Clone, Debug)]
pub struct AdmissionPool {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

/// One admitted delivery. Dropping it frees the slot.
#[derive(Debug)]
pub struct Slot {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionPool {
    /// Creates a pool with `capacity` slots. A capacity of zero is raised to
    /// one so acquisition can never wait forever.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots not currently held.
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.capacity - self.available()
    }

    /// Waits until a slot is free and takes it.
    pub async fn acquire(&self) -> Slot {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            // The semaphore is owned here and never closed.
            .unwrap_or_else(|_| unreachable!("admission semaphore closed"));
        Slot { _permit: permit }
    }

    /// Takes a slot only if one is free right now.
    pub fn try_acquire(&self) -> Option<Slot> {
        self.semaphore
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| Slot { _permit: permit })
    }
}
