//! Request bookkeeping shared by the parallel managers
//!
//! Tracks the one request a manager serves at a time: its work queue, the
//! units in flight, the aggregator and any stop the caller asked for.
//! Every method runs under the owning manager's lock.

use std::sync::Arc;

use super::work::{WorkItem, WorkQueue};

/// How the caller asked a request to stop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum StopRequest {
    Abort,
    Cancel,
}

/// Accounting result for one finished unit
pub(crate) struct UnitCompletion<P> {
    /// Next unit for the proxy that just finished
    pub next: Option<(P, WorkItem)>,
    /// Nothing is left in flight; the request must be reported now
    pub finished: bool,
}

pub(crate) struct RequestTracker<C, A> {
    last_id: u64,
    current: Option<(u64, Arc<C>)>,
    queue: WorkQueue,
    aggregator: A,
    in_flight: usize,
    abort_requested: bool,
    cancel_requested: bool,
    closed: bool,
}

impl<C, A: Default> Default for RequestTracker<C, A> {
    fn default() -> Self {
        Self {
            last_id: 0,
            current: None,
            queue: WorkQueue::default(),
            aggregator: A::default(),
            in_flight: 0,
            abort_requested: false,
            cancel_requested: false,
            closed: false,
        }
    }
}

impl<C, A: Default> RequestTracker<C, A> {
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns true only for the first call
    pub fn close(&mut self) -> bool {
        !std::mem::replace(&mut self.closed, true)
    }

    pub fn is_in_progress(&self) -> bool {
        self.current.is_some()
    }

    pub fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    pub fn is_current(&self, id: u64) -> bool {
        matches!(&self.current, Some((current, _)) if *current == id)
    }

    pub fn context(&self, id: u64) -> Option<Arc<C>> {
        match &self.current {
            Some((current, context)) if *current == id => Some(Arc::clone(context)),
            _ => None,
        }
    }

    /// Start serving `context`; returns the first unit for each proxy
    pub fn begin<P>(
        &mut self,
        id: u64,
        context: Arc<C>,
        items: impl IntoIterator<Item = WorkItem>,
        proxies: Vec<P>,
    ) -> Vec<(P, WorkItem)> {
        self.current = Some((id, context));
        self.queue = WorkQueue::new(items);
        self.aggregator = A::default();
        self.abort_requested = false;
        self.cancel_requested = false;

        let mut batch = Vec::new();
        for proxy in proxies {
            match self.queue.dequeue() {
                Some(item) => batch.push((proxy, item)),
                None => break,
            }
        }
        self.in_flight = batch.len();
        batch
    }

    /// Record a stop; false when no request is being served
    pub fn request_stop(&mut self, stop: StopRequest) -> bool {
        if self.current.is_none() {
            return false;
        }
        match stop {
            StopRequest::Abort => self.abort_requested = true,
            StopRequest::Cancel => self.cancel_requested = true,
        }
        true
    }

    /// Stop a unit that was just accepted for request `id` still has to honour
    pub fn pending_stop(&self, id: u64) -> Option<StopRequest> {
        if !self.is_current(id) {
            None
        } else if self.abort_requested {
            Some(StopRequest::Abort)
        } else if self.cancel_requested {
            Some(StopRequest::Cancel)
        } else {
            None
        }
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_requested
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }

    fn stop_requested(&self) -> bool {
        self.abort_requested || self.cancel_requested
    }

    /// Units that were never handed out
    pub fn has_pending(&self) -> bool {
        !self.queue.is_empty()
    }

    pub fn aggregator_mut(&mut self) -> &mut A {
        &mut self.aggregator
    }

    /// Account for one finished unit of the current request
    pub fn complete_unit<P>(&mut self, next_proxy: Option<P>) -> UnitCompletion<P> {
        self.in_flight = self.in_flight.saturating_sub(1);
        let next = match next_proxy {
            Some(proxy) if !self.stop_requested() => {
                self.queue.dequeue().map(|item| (proxy, item))
            }
            _ => None,
        };
        if next.is_some() {
            self.in_flight += 1;
        }
        UnitCompletion {
            finished: self.in_flight == 0,
            next,
        }
    }

    /// Hand a refused unit to `replacement` while its retry budget lasts
    pub fn retry<P: Clone>(
        &mut self,
        item: WorkItem,
        limit: usize,
        replacement: Option<&P>,
    ) -> Option<(P, WorkItem)> {
        let replacement = replacement.filter(|_| !self.stop_requested())?;
        if !self.queue.requeue(item, limit) {
            return None;
        }
        self.queue
            .dequeue()
            .map(|next| (replacement.clone(), next))
    }

    /// End the current request
    pub fn finish(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Tracker = RequestTracker<&'static str, Vec<i64>>;

    fn items(n: usize) -> Vec<WorkItem> {
        (0..n).map(|i| WorkItem::Source(format!("{i}.dll"))).collect()
    }

    #[test]
    fn test_begin_hands_out_one_unit_per_proxy() {
        let mut tracker = Tracker::default();
        let id = tracker.next_id();
        let batch = tracker.begin(id, Arc::new("request"), items(3), vec!['a', 'b', 'c', 'd']);

        assert_eq!(batch.len(), 3);
        assert!(tracker.is_current(id));
        assert!(!tracker.has_pending());
        assert_eq!(tracker.context(id).as_deref(), Some(&"request"));
        assert!(tracker.context(id + 1).is_none());
    }

    #[test]
    fn test_units_drain_until_finished() {
        let mut tracker = Tracker::default();
        let id = tracker.next_id();
        tracker.begin(id, Arc::new("request"), items(3), vec!['a']);

        let unit = tracker.complete_unit(Some('a'));
        assert_eq!(unit.next.map(|(_, item)| item), Some(WorkItem::Source("1.dll".into())));
        assert!(!unit.finished);
        tracker.complete_unit(Some('a'));
        let unit = tracker.complete_unit(Some('a'));
        assert!(unit.next.is_none());
        assert!(unit.finished);
    }

    #[test]
    fn test_stop_halts_dispatch_and_is_reported_once_accepted() {
        let mut tracker = Tracker::default();
        assert!(!tracker.request_stop(StopRequest::Abort));

        let id = tracker.next_id();
        tracker.begin(id, Arc::new("request"), items(3), vec!['a']);
        assert_eq!(tracker.pending_stop(id), None);

        assert!(tracker.request_stop(StopRequest::Cancel));
        assert_eq!(tracker.pending_stop(id), Some(StopRequest::Cancel));
        assert!(tracker.request_stop(StopRequest::Abort));
        assert_eq!(tracker.pending_stop(id), Some(StopRequest::Abort));
        assert_eq!(tracker.pending_stop(id + 1), None);

        let unit = tracker.complete_unit(Some('a'));
        assert!(unit.next.is_none());
        assert!(unit.finished);
        assert!(tracker.has_pending());
    }

    #[test]
    fn test_retry_respects_budget() {
        let mut tracker = Tracker::default();
        let id = tracker.next_id();
        let batch = tracker.begin(id, Arc::new("request"), items(2), vec!['a']);
        let (_, item) = batch.into_iter().next().unwrap();

        let retried = tracker.retry(item.clone(), 1, Some(&'b'));
        assert_eq!(retried, Some(('b', item.clone())));
        assert!(tracker.retry(item.clone(), 1, Some(&'c')).is_none());
        assert!(tracker.retry(item, 1, None::<&char>).is_none());
    }

    #[test]
    fn test_close_once() {
        let mut tracker = Tracker::default();
        assert!(tracker.close());
        assert!(!tracker.close());
        assert!(tracker.is_closed());
    }
}
