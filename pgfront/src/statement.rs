//! Statements registered against a connection.
use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, Ordering},
};

/// Handle of a statement owned by the caller.
///
/// The connection only keeps a weak reference, it never waits on a handle. When the
/// connection is torn down every live handle reads invalid.
#[derive(Debug)]
pub struct StatementHandle {
    slot: Arc<Slot>,
}

#[derive(Debug)]
struct Slot {
    id: u32,
    valid: AtomicBool,
}

impl StatementHandle {
    pub fn id(&self) -> u32 {
        self.slot.id
    }

    /// Name for a server side prepared plan of this statement.
    pub fn plan_name(&self) -> String {
        format!("p{:05}", self.slot.id)
    }

    /// Whether the connection is still the same session that created this handle.
    pub fn is_valid(&self) -> bool {
        self.slot.valid.load(Ordering::Acquire)
    }
}

/// Weak back references from a connection to its statements.
#[derive(Debug, Default)]
pub(crate) struct StatementRegistry {
    next: u32,
    slots: Vec<Weak<Slot>>,
}

impl StatementRegistry {
    pub fn register(&mut self) -> StatementHandle {
        self.slots.retain(|e| e.strong_count() > 0);
        let slot = Arc::new(Slot { id: self.next, valid: AtomicBool::new(true) });
        self.next = self.next.wrapping_add(1);
        self.slots.push(Arc::downgrade(&slot));
        StatementHandle { slot }
    }

    /// Number of handles still alive.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|e| e.strong_count() > 0).count()
    }

    pub fn invalidate_all(&mut self) {
        for slot in self.slots.drain(..).filter_map(|e| e.upgrade()) {
            slot.valid.store(false, Ordering::Release);
        }
    }
}
