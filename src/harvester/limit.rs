// SPDX-License-Identifier: Apache-2.0

//! Process-wide cap on concurrently open harvesters.
//!
//! A deferred start is the caller's problem: the crawler keeps the file in
//! its FIFO retry queue and asks again next scan, so capacity freed by any
//! closing harvester is handed out in discovery order.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Counting limiter shared by every input. A limit of 0 means unlimited.
#[derive(Clone)]
pub struct HarvesterLimiter {
    semaphore: Option<Arc<Semaphore>>,
}

/// Held for the lifetime of one harvester; dropping it frees the slot.
pub struct HarvesterTicket {
    _permit: Option<OwnedSemaphorePermit>,
}

impl HarvesterLimiter {
    pub fn new(limit: usize) -> Self {
        Self {
            semaphore: (limit > 0).then(|| Arc::new(Semaphore::new(limit))),
        }
    }

    /// Claim a slot without waiting. None means the limit is reached and the
    /// start must be deferred to a later scan.
    pub fn try_start(&self) -> Option<HarvesterTicket> {
        match &self.semaphore {
            None => Some(HarvesterTicket { _permit: None }),
            Some(sem) => sem
                .clone()
                .try_acquire_owned()
                .ok()
                .map(|permit| HarvesterTicket {
                    _permit: Some(permit),
                }),
        }
    }

    /// Slots currently available, for diagnostics. None when unlimited.
    pub fn available(&self) -> Option<usize> {
        self.semaphore.as_ref().map(|s| s.available_permits())
    }
}
