use std::collections::BTreeMap;
use std::sync::Arc;

use super::task::ExecutorHandle;

/// Ready executors ordered by virtual runtime, ties broken by handle ID.
///
/// An executor's runtime never changes while it sits here, so the key taken
/// at insertion time stays valid until it is popped.
#[derive(Debug, Default)]
pub(super) struct RunQueue {
    ready: BTreeMap<(u64, u64), Arc<ExecutorHandle>>,
    /// Lower bound on the runtime given to anything joining the queue.
    pub(super) minimum_runtime: u64,
}

impl RunQueue {
    pub(super) fn insert(&mut self, handle: Arc<ExecutorHandle>) {
        let key = (handle.virtual_runtime(), handle.id());
        self.ready.insert(key, handle);
    }

    pub(super) fn pop_first(&mut self) -> Option<Arc<ExecutorHandle>> {
        self.ready.pop_first().map(|(_, handle)| handle)
    }

    pub(super) fn first_runtime(&self) -> Option<u64> {
        self.ready.keys().next().map(|(runtime, _)| *runtime)
    }

    pub(super) fn len(&self) -> usize {
        self.ready.len()
    }
}

/// Virtual runtime for an executor joining the queue.
///
/// Brand-new executors (runtime 0) are charged `penalty` on top of the
/// minimum so they don't jump ahead of everything already running. Returning
/// executors get `credit` knocked off, so having slept isn't punished.
pub(super) fn enqueue_runtime(current: u64, minimum: u64, penalty: u64, credit: u64) -> u64 {
    let target = if current == 0 {
        minimum.saturating_add(penalty)
    } else {
        minimum.saturating_sub(credit)
    };
    target.max(current)
}
