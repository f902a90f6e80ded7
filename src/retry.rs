// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Retry Store
//!
//! In-memory FIFO of work that could not reach the broker. Drains pop from the
//! front and, when an attempt fails again, put the entry back at the front so
//! the original order is preserved across partial drains.

use std::collections::VecDeque;
use std::sync::Mutex;

pub(crate) struct RetryStore<T> {
    entries: Mutex<VecDeque<T>>,
}

impl<T> RetryStore<T> {
    pub(crate) fn new() -> RetryStore<T> {
        RetryStore {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub(crate) fn push_back(&self, entry: T) {
        self.entries.lock().unwrap().push_back(entry);
    }

    pub(crate) fn push_front(&self, entry: T) {
        self.entries.lock().unwrap().push_front(entry);
    }

    pub(crate) fn pop_front(&self) -> Option<T> {
        self.entries.lock().unwrap().pop_front()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_arrival_order() {
        let store = RetryStore::new();
        store.push_back("first");
        store.push_back("second");
        store.push_back("third");

        assert_eq!(store.len(), 3);
        assert_eq!(store.pop_front(), Some("first"));
        assert_eq!(store.pop_front(), Some("second"));
        assert_eq!(store.pop_front(), Some("third"));
        assert_eq!(store.pop_front(), None);
    }

    #[test]
    fn push_front_restores_a_failed_entry_to_the_head() {
        let store = RetryStore::new();
        store.push_back("first");
        store.push_back("second");

        let failed = store.pop_front().unwrap();
        store.push_front(failed);

        assert_eq!(store.pop_front(), Some("first"));
        assert_eq!(store.pop_front(), Some("second"));
        assert!(store.is_empty());
    }
}
