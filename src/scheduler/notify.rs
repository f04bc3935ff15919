//! Delivery of settled batches to the parties that react to them.

use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use tracing::{error, trace};

use crate::classfile::UnitId;

/// A loaded unit that was redefined, with both binary forms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedUnit {
    /// Identity of the redefined unit
    pub id: UnitId,
    /// Binary form before the redefinition
    pub previous: Arc<[u8]>,
    /// Binary form the host was handed
    pub current: Arc<[u8]>,
}

/// A unit that appeared for the first time while a batch was open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewUnit {
    /// Identity of the new unit
    pub id: UnitId,
}

/// Reacts to a settled batch of redefinitions.
///
/// Called from the scheduler's timer thread; implementations should return quickly or hand
/// the work off.
pub trait ChangeListener: Send + Sync {
    /// Receives every unit redefined and introduced since the previous notification.
    fn after_change(&self, changed: &[ChangedUnit], added: &[NewUnit]);
}

/// Fan-out over every registered listener.
///
/// Listeners are only ever appended.
#[derive(Default)]
pub struct ChangeNotifier {
    listeners: boxcar::Vec<Arc<dyn ChangeListener>>,
}

impl ChangeNotifier {
    /// Creates a notifier without listeners.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `listener` for all later batches.
    pub fn add_listener(&self, listener: Arc<dyn ChangeListener>) {
        self.listeners.push(listener);
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.count()
    }

    /// Returns `true` if no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.count() == 0
    }

    /// Delivers one batch to every listener.
    ///
    /// A listener that panics is logged and skipped; the remaining listeners still run.
    pub fn notify(&self, changed: &[ChangedUnit], added: &[NewUnit]) {
        trace!(changed = changed.len(), added = added.len(), "delivering batch");
        for (index, listener) in self.listeners.iter() {
            let delivered = catch_unwind(AssertUnwindSafe(|| listener.after_change(changed, added)));
            if delivered.is_err() {
                error!(listener = index, "change listener panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classfile::LoaderId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting(AtomicUsize);

    impl ChangeListener for Counting {
        fn after_change(&self, changed: &[ChangedUnit], _added: &[NewUnit]) {
            self.0.fetch_add(changed.len(), Ordering::SeqCst);
        }
    }

    struct Exploding;

    impl ChangeListener for Exploding {
        fn after_change(&self, _changed: &[ChangedUnit], _added: &[NewUnit]) {
            panic!("listener failure");
        }
    }

    #[test]
    fn panicking_listener_does_not_stop_delivery() {
        let notifier = ChangeNotifier::new();
        let counting = Arc::new(Counting::default());
        notifier.add_listener(Arc::new(Exploding));
        notifier.add_listener(counting.clone());
        assert_eq!(notifier.len(), 2);

        let unit = ChangedUnit {
            id: UnitId::new("a.B", LoaderId(1)),
            previous: Arc::from(&b"old"[..]),
            current: Arc::from(&b"new"[..]),
        };
        notifier.notify(&[unit], &[]);
        assert_eq!(counting.0.load(Ordering::SeqCst), 1);
    }
}
