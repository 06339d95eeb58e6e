use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, PoisonError};

use crate::prometheus::report_duplicate_event;

/// Remembers every event id admitted into the pipeline.
///
/// `admit` is a single test-and-set under one lock, so two producers racing
/// with the same id can't both get through. When built with a capacity, the
/// oldest ids are forgotten first once the set is full.
pub struct Deduper {
    seen: Mutex<SeenIds>,
}

struct SeenIds {
    ids: HashSet<String>,
    // Admission order, only tracked when bounded
    order: VecDeque<String>,
    capacity: Option<usize>,
}

impl Deduper {
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            seen: Mutex::new(SeenIds {
                ids: HashSet::new(),
                order: VecDeque::new(),
                capacity: capacity.filter(|c| *c > 0),
            }),
        }
    }

    pub fn unbounded() -> Self {
        Self::new(None)
    }

    /// Returns true the first time `id` is seen, false afterwards.
    pub fn admit(&self, id: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        if seen.ids.contains(id) {
            report_duplicate_event();
            return false;
        }

        if let Some(capacity) = seen.capacity {
            while seen.ids.len() >= capacity {
                match seen.order.pop_front() {
                    Some(oldest) => {
                        seen.ids.remove(&oldest);
                    }
                    None => break,
                }
            }
            seen.order.push_back(id.to_owned());
        }
        seen.ids.insert(id.to_owned())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ids
            .contains(id)
    }

    pub fn len(&self) -> usize {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .ids
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Un-admits `id`, for records that were admitted but never reached the scheduler.
    pub fn forget(&self, id: &str) {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        if seen.ids.remove(id) && seen.capacity.is_some() {
            seen.order.retain(|seen_id| seen_id != id);
        }
    }

    /// Drops every remembered id.
    pub fn forget_all(&self) {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        seen.ids.clear();
        seen.order.clear();
    }
}

impl Default for Deduper {
    fn default() -> Self {
        Self::unbounded()
    }
}
