//! Pending units of parallel work

use std::collections::{HashMap, VecDeque};

use crate::models::TestCase;

/// One unit handed to a single proxy
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkItem {
    Source(String),
    Tests { source: String, tests: Vec<TestCase> },
}

impl WorkItem {
    pub fn source(&self) -> &str {
        match self {
            WorkItem::Source(source) => source,
            WorkItem::Tests { source, .. } => source,
        }
    }
}

/// FIFO of work items with a per-source dispatch attempt count
#[derive(Debug, Default)]
pub struct WorkQueue {
    items: VecDeque<WorkItem>,
    attempts: HashMap<String, usize>,
    total: usize,
}

impl WorkQueue {
    pub fn new(items: impl IntoIterator<Item = WorkItem>) -> Self {
        let items: VecDeque<WorkItem> = items.into_iter().collect();
        let total = items.len();
        Self {
            items,
            attempts: HashMap::new(),
            total,
        }
    }

    pub fn dequeue(&mut self) -> Option<WorkItem> {
        self.items.pop_front()
    }

    /// Put a refused item back at the front
    ///
    /// Returns false once the item has been retried `limit` times.
    pub fn requeue(&mut self, item: WorkItem, limit: usize) -> bool {
        let attempts = self.attempts.entry(item.source().to_string()).or_insert(0);
        if *attempts >= limit {
            return false;
        }
        *attempts += 1;
        if !self.items.contains(&item) {
            self.items.push_front(item);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Items the queue was created with
    pub fn total(&self) -> usize {
        self.total
    }
}
