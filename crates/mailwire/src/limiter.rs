use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Caps the number of concurrently served connections.
/// Admission is decided at accept time and never waits.
#[derive(Debug, Clone)]
pub struct ConnectionLimiter {
    semaphore: Option<Arc<Semaphore>>,
}

/// Held for the lifetime of an admitted connection.
#[derive(Debug)]
pub struct ConnectionPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

impl ConnectionLimiter {
    /// `max_connections` of 0 means unbounded.
    pub fn new(max_connections: usize) -> Self {
        Self {
            semaphore: (max_connections > 0).then(|| Arc::new(Semaphore::new(max_connections))),
        }
    }

    /// Returns None if the connection must be turned away.
    pub fn try_admit(&self) -> Option<ConnectionPermit> {
        match &self.semaphore {
            None => Some(ConnectionPermit { _permit: None }),
            Some(sema) => sema
                .clone()
                .try_acquire_owned()
                .ok()
                .map(|permit| ConnectionPermit {
                    _permit: Some(permit),
                }),
        }
    }
}
