//! Per-session execution slots.
//!
//! Each session owns a one-permit semaphore. Tokio semaphores hand out
//! permits in FIFO order, so queued requests for a session run in arrival
//! order while other sessions proceed in parallel.

use routewise_config::BusyPolicy;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Why a slot could not be acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotError {
    /// Rejected immediately, or the bounded wait ran out.
    Busy,
}

pub struct SessionSlots {
    policy: BusyPolicy,
    slots: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl SessionSlots {
    pub fn new(policy: BusyPolicy) -> Self {
        Self {
            policy,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn semaphore(&self, session_id: &str) -> Arc<Semaphore> {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    /// Take the session's slot according to the busy policy. With
    /// [`BusyPolicy::Queue`] the wait is bounded by `max_wait`.
    pub async fn acquire(&self, session_id: &str, max_wait: Duration) -> Result<OwnedSemaphorePermit, SlotError> {
        let semaphore = self.semaphore(session_id);
        match self.policy {
            BusyPolicy::Reject => semaphore.try_acquire_owned().map_err(|_| SlotError::Busy),
            BusyPolicy::Queue => match tokio::time::timeout(max_wait, semaphore.acquire_owned()).await {
                Ok(Ok(permit)) => Ok(permit),
                _ => Err(SlotError::Busy),
            },
        }
    }

    /// Wait for the session's slot regardless of the busy policy.
    pub async fn acquire_waiting(&self, session_id: &str) -> Result<OwnedSemaphorePermit, SlotError> {
        self.semaphore(session_id)
            .acquire_owned()
            .await
            .map_err(|_| SlotError::Busy)
    }

    /// Whether nothing (including background reflection) holds the slot.
    pub fn is_idle(&self, session_id: &str) -> bool {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .is_none_or(|s| s.available_permits() == 1)
    }

    /// Resolve once the session is idle.
    pub async fn wait_idle(&self, session_id: &str) {
        if let Ok(permit) = self.acquire_waiting(session_id).await {
            drop(permit);
        }
    }
}
