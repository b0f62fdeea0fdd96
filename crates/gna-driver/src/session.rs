//! Application sessions: one per open handle on the device.

use crate::config::RegistryScope;
use crate::memory::{MemoryContext, MemoryId};
use crate::registry::MemoryRegistry;
use crate::request::{RequestStatus, ScoreRequest, SessionId};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// One application's view of the device.
pub struct Session {
    id: SessionId,
    registry: Mutex<MemoryRegistry>,
    notify: Mutex<Option<ScoreRequest>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("mapped", &self.registry().len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Session {
    pub(crate) fn new(id: SessionId, scope: RegistryScope) -> Self {
        Self {
            id,
            registry: Mutex::new(MemoryRegistry::new(scope)),
            notify: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Session identifier
    pub const fn id(&self) -> SessionId {
        self.id
    }

    /// `true` once the session has been closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Memory context mapped under `id`
    pub fn memory(&self, id: MemoryId) -> Option<Arc<MemoryContext>> {
        self.registry().get(id)
    }

    /// Number of mapped contexts
    pub fn mapped_count(&self) -> usize {
        self.registry().len()
    }

    pub(crate) fn registry(&self) -> MutexGuard<'_, MemoryRegistry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a notify request, completing any previous one as cancelled
    pub(crate) fn arm_notify(&self, request: ScoreRequest) {
        let previous = self.slot().replace(request);
        if let Some(previous) = previous {
            previous.complete(RequestStatus::Cancelled, None);
        }
    }

    /// Complete the parked notify request, if any
    pub(crate) fn fire_notify(&self, status: RequestStatus) -> bool {
        let parked = self.slot().take();
        let Some(request) = parked else {
            return false;
        };
        request.complete(status, None);
        true
    }

    /// Mark closed. Returns `false` if it already was.
    pub(crate) fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    fn slot(&self) -> MutexGuard<'_, Option<ScoreRequest>> {
        self.notify.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn rearming_cancels_the_previous_notify() {
        let session = Arc::new(Session::new(9, RegistryScope::default()));
        let (first, first_handle) = ScoreRequest::new(1, Arc::clone(&session), Bytes::new());
        let (second, second_handle) = ScoreRequest::new(2, Arc::clone(&session), Bytes::new());

        session.arm_notify(first);
        session.arm_notify(second);
        assert_eq!(first_handle.wait().status, RequestStatus::Cancelled);

        assert!(session.fire_notify(RequestStatus::MemoryReleased(4)));
        assert_eq!(second_handle.wait().status, RequestStatus::MemoryReleased(4));
        assert!(!session.fire_notify(RequestStatus::Cancelled));
    }

    #[test]
    fn close_happens_once() {
        let session = Session::new(1, RegistryScope::Single);
        assert!(session.close());
        assert!(!session.close());
        assert!(session.is_closed());
    }
}
