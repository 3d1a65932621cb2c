//! Process-wide termination and suspend flags
//!
//! Both flags are owned by whoever drives the bridge (usually a signal
//! handler) and only observed by the forwarder and the rendezvous retry
//! loops. Reads are relaxed: the flags are level-triggered, so a late
//! observation just costs one more tick.

use crate::transport::TransportError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared termination / suspend flags
#[derive(Debug, Clone, Default)]
pub struct ControlFlags {
    terminate: Arc<AtomicBool>,
    suspend: Arc<AtomicBool>,
}

impl ControlFlags {
    /// Create a fresh pair of cleared flags
    pub fn new() -> Self {
        Self::default()
    }

    /// Request every loop observing these flags to exit
    pub fn terminate(&self) {
        self.terminate.store(true, Ordering::Relaxed);
    }

    /// Check if termination was requested
    pub fn is_terminated(&self) -> bool {
        self.terminate.load(Ordering::Relaxed)
    }

    /// Pause forwarding without dropping the transport
    pub fn suspend(&self) {
        self.suspend.store(true, Ordering::Relaxed);
    }

    /// Resume forwarding after [`suspend`](Self::suspend)
    pub fn resume(&self) {
        self.suspend.store(false, Ordering::Relaxed);
    }

    /// Check if forwarding is suspended
    pub fn is_suspended(&self) -> bool {
        self.suspend.load(Ordering::Relaxed)
    }

    /// Fail with [`TransportError::Killed`] once termination was requested
    pub fn check(&self) -> Result<(), TransportError> {
        if self.is_terminated() {
            Err(TransportError::Killed)
        } else {
            Ok(())
        }
    }
}
