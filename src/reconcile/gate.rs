//! Single-flight gate and edit suppression window.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::transcript::MessageId;

/// At most one generation/merge cycle runs at a time.
///
/// [`GenerationGate::try_acquire`] never waits: a second caller gets `None`
/// and is expected to drop its trigger.
#[derive(Debug, Default)]
pub struct GenerationGate {
    busy: AtomicBool,
    holder: Mutex<Option<MessageId>>,
}

impl GenerationGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the gate for `id`, or `None` if it is already held.
    pub fn try_acquire(&self, id: MessageId) -> Option<GateGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner) = Some(id);
        Some(GateGuard { gate: self })
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Message the current cycle is working on.
    pub fn holder(&self) -> Option<MessageId> {
        *self.holder.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the gate on drop, including on early return and panic.
#[derive(Debug)]
pub struct GateGuard<'a> {
    gate: &'a GenerationGate,
}

impl GateGuard<'_> {
    pub fn message_id(&self) -> Option<MessageId> {
        self.gate.holder()
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        *self
            .gate
            .holder
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.gate.busy.store(false, Ordering::Release);
    }
}

/// Window after a programmatic re-render during which edit notifications
/// are treated as echoes and ignored.
#[derive(Debug, Default)]
pub struct SuppressionWindow {
    until: Mutex<Option<Instant>>,
}

impl SuppressionWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open (or extend) the window for `duration` from now.
    pub fn open(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut until = self.until.lock().unwrap_or_else(PoisonError::into_inner);
        if until.is_none_or(|current| current < deadline) {
            *until = Some(deadline);
        }
    }

    pub fn is_open(&self) -> bool {
        self.until
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some_and(|deadline| Instant::now() < deadline)
    }
}
