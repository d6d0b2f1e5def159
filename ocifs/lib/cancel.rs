//! Cancellation of in-flight pulls.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use crate::{OcifsError, OcifsResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A cloneable cancellation flag.
///
/// Pull operations observe the flag at blob boundaries and between tar
/// records; filesystem operations are never cancellable once dispatched.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl CancelToken {
    /// Creates a token in the not-cancelled state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; observers stop at their next checkpoint.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns `Err(Cancelled)` when cancellation was requested.
    pub fn check(&self) -> OcifsResult<()> {
        if self.is_cancelled() {
            Err(OcifsError::Cancelled)
        } else {
            Ok(())
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
