//! Single-writer leases keyed by session id.
//!
//! A lease is an explicit token: whoever holds a [`WriterLease`] for a
//! session is the only actor allowed to mutate it. Callers pick the
//! contention policy per operation: [`LeaseTable::try_acquire`] fails fast,
//! [`LeaseTable::acquire`] queues behind the current holder up to a deadline.

use crate::error::{Result, StoreError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug)]
struct LeaseSlot {
    permit: Arc<Semaphore>,
    holder: Mutex<Option<String>>,
}

impl LeaseSlot {
    fn new() -> Self {
        LeaseSlot {
            permit: Arc::new(Semaphore::new(1)),
            holder: Mutex::new(None),
        }
    }

    fn holder_name(&self) -> String {
        self.holder
            .lock()
            .clone()
            .unwrap_or_else(|| "another writer".to_string())
    }
}

/// Proof of exclusive write access to one session. Released on drop.
#[derive(Debug)]
pub struct WriterLease {
    session_id: String,
    holder: String,
    slot: Arc<LeaseSlot>,
    _permit: OwnedSemaphorePermit,
}

impl WriterLease {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }
}

impl Drop for WriterLease {
    fn drop(&mut self) {
        *self.slot.holder.lock() = None;
    }
}

/// Table of writer leases, one slot per session.
#[derive(Debug, Default)]
pub struct LeaseTable {
    slots: Mutex<HashMap<String, Arc<LeaseSlot>>>,
}

impl LeaseTable {
    pub fn new() -> Self {
        LeaseTable {
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, session_id: &str) -> Arc<LeaseSlot> {
        self.slots
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(LeaseSlot::new()))
            .clone()
    }

    fn grant(
        session_id: &str,
        holder: &str,
        slot: Arc<LeaseSlot>,
        permit: OwnedSemaphorePermit,
    ) -> WriterLease {
        *slot.holder.lock() = Some(holder.to_string());
        WriterLease {
            session_id: session_id.to_string(),
            holder: holder.to_string(),
            slot,
            _permit: permit,
        }
    }

    /// Take the lease now or fail with `SessionLocked`.
    pub fn try_acquire(&self, session_id: &str, holder: &str) -> Result<WriterLease> {
        let slot = self.slot(session_id);
        match slot.permit.clone().try_acquire_owned() {
            Ok(permit) => Ok(Self::grant(session_id, holder, slot, permit)),
            Err(_) => Err(StoreError::SessionLocked {
                session_id: session_id.to_string(),
                holder: slot.holder_name(),
            }),
        }
    }

    /// Wait for the lease, giving up with `SessionLocked` after `wait`.
    pub async fn acquire(
        &self,
        session_id: &str,
        holder: &str,
        wait: Duration,
    ) -> Result<WriterLease> {
        let slot = self.slot(session_id);
        let locked = || StoreError::SessionLocked {
            session_id: session_id.to_string(),
            holder: slot.holder_name(),
        };

        match tokio::time::timeout(wait, slot.permit.clone().acquire_owned()).await {
            Ok(Ok(permit)) => Ok(Self::grant(session_id, holder, slot.clone(), permit)),
            // The semaphore is never closed, so only the timeout lands here.
            Ok(Err(_)) | Err(_) => Err(locked()),
        }
    }

    /// Name of the current holder, if the lease is taken.
    pub fn holder(&self, session_id: &str) -> Option<String> {
        self.slots
            .lock()
            .get(session_id)
            .and_then(|slot| slot.holder.lock().clone())
    }

    /// Release `lease` and forget its session's slot, unless other writers
    /// are still queued on it.
    pub fn retire(&self, lease: WriterLease) {
        let mut slots = self.slots.lock();
        let unshared = slots
            .get(&lease.session_id)
            .is_some_and(|slot| Arc::ptr_eq(slot, &lease.slot) && Arc::strong_count(slot) == 2);
        if unshared {
            slots.remove(&lease.session_id);
        }
        drop(slots);
        drop(lease);
    }

    /// Number of sessions with a slot.
    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    pub fn is_held(&self, session_id: &str) -> bool {
        self.slots
            .lock()
            .get(session_id)
            .map(|slot| slot.permit.available_permits() == 0)
            .unwrap_or(false)
    }
}
