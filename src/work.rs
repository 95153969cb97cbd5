//! Single-outstanding-operation work queue
//!
//! All mutating link operations (frequency change, TX power change,
//! channel scan, ...) are serialized through a queue with capacity one:
//! while an operation is pending or executing, further requests are
//! rejected with `LinkError::Busy` instead of being buffered. The worker
//! thread drains the slot, callers get immediate backpressure.

use std::fmt;
use std::sync::Mutex;
use std::time::Instant;

use crate::{LinkError, Result};

/// A deferred link operation. The closure runs on the worker thread, never
/// on the caller's thread.
pub struct WorkItem {
    tag: String,
    work: Box<dyn FnOnce() + Send>,
    earliest_execution: Instant,
}

impl WorkItem {
    pub fn new(tag: &str, work: impl FnOnce() + Send + 'static, earliest_execution: Instant) -> Self {
        Self { tag: tag.to_string(), work: Box::new(work), earliest_execution }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn ready_to_be_executed(&self, now: Instant) -> bool {
        now >= self.earliest_execution
    }

    /// Consume the item and run its work.
    pub fn execute(self) {
        (self.work)();
    }
}

impl fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkItem").field("tag", &self.tag).finish()
    }
}

/// Capacity-1 slot for the next work item.
#[derive(Default)]
pub struct WorkQueue {
    slot: Mutex<Option<WorkItem>>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to enqueue a work item. Fails with `LinkError::Busy` if another
    /// item is still pending.
    pub fn try_enqueue(&self, item: WorkItem) -> Result<()> {
        let mut slot = self.slot.lock().unwrap();
        if slot.is_some() {
            log::debug!("rejecting work item {:?}, queue busy", item.tag());
            return Err(LinkError::Busy);
        }
        log::debug!("enqueued work item {:?}", item.tag());
        *slot = Some(item);
        Ok(())
    }

    /// Remove and return the pending item if it is ready to run. An item
    /// whose earliest execution time has not been reached stays in the slot
    /// (and keeps the queue busy).
    pub fn take_ready(&self, now: Instant) -> Option<WorkItem> {
        let mut slot = self.slot.lock().unwrap();
        if slot.as_ref().is_some_and(|item| item.ready_to_be_executed(now)) {
            return slot.take();
        }
        None
    }

    pub fn is_busy(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_enqueue_take_execute() {
        let queue = WorkQueue::new();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let now = Instant::now();
        queue
            .try_enqueue(WorkItem::new("test", move || ran2.store(true, Ordering::SeqCst), now))
            .unwrap();
        assert!(queue.is_busy());
        let item = queue.take_ready(now).unwrap();
        assert!(!queue.is_busy());
        item.execute();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn test_second_enqueue_rejected_while_busy() {
        let queue = WorkQueue::new();
        queue.try_enqueue(WorkItem::new("first", || {}, Instant::now())).unwrap();
        let result = queue.try_enqueue(WorkItem::new("second", || {}, Instant::now()));
        assert!(matches!(result, Err(LinkError::Busy)));
        // draining the slot frees the queue again
        queue.take_ready(Instant::now()).unwrap();
        queue.try_enqueue(WorkItem::new("third", || {}, Instant::now())).unwrap();
    }

    #[test]
    fn test_delayed_item_not_taken_early() {
        let queue = WorkQueue::new();
        let now = Instant::now();
        let later = now + Duration::from_secs(10);
        queue.try_enqueue(WorkItem::new("delayed", || {}, later)).unwrap();
        assert!(queue.take_ready(now).is_none());
        // a delayed item still occupies the slot
        assert!(queue.is_busy());
        assert!(queue.take_ready(later).is_some());
    }
}
