// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! A push-only lock-free stack.
//!
//! Any number of producers may [`LfStack::push`] concurrently: a push is a single successful
//! compare-and-swap of the head pointer. The consumer detaches the whole list at once with
//! [`LfStack::take_all`]. Since nodes are never popped one by one, there is no ABA problem and a
//! detached node can never be reached by a producer again.

#![allow(unsafe_code)]

use crate::sync::atomic::{AtomicPtr, Ordering};
use std::fmt::Debug;
use std::ptr;

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

pub struct LfStack<T> {
    head: AtomicPtr<Node<T>>,
}

// SAFETY: nodes are owned by the stack until detached by `take_all`, which hands ownership of the
// values to the caller. Sending or sharing the stack only ever moves `T` values across threads.
unsafe impl<T: Send> Send for LfStack<T> {}
// SAFETY: see above; concurrent access goes through the atomic head only.
unsafe impl<T: Send> Sync for LfStack<T> {}

impl<T> Debug for LfStack<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LfStack")
            .field("empty", &self.is_empty())
            .finish()
    }
}

impl<T> Default for LfStack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LfStack<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub fn push(&self, value: T) {
        let node = Box::into_raw(Box::new(Node {
            value,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: `node` is not yet published, we are its only user.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::Release, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => head = current,
            }
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }

    /// Detach every pushed value, returned in push order.
    pub fn take_all(&self) -> Vec<T> {
        let mut current = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        let mut values = Vec::new();
        while !current.is_null() {
            // SAFETY: the list was detached by the swap above; every node was created by
            // `Box::into_raw` in `push` and is now exclusively ours.
            let node = unsafe { Box::from_raw(current) };
            current = node.next;
            values.push(node.value);
        }
        values.reverse();
        values
    }
}

impl<T> Drop for LfStack<T> {
    fn drop(&mut self) {
        drop(self.take_all());
    }
}

#[cfg(all(test, not(feature = "shuttle")))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn push_and_take_in_order() {
        let stack = LfStack::new();
        assert!(stack.is_empty());
        for i in 0..5 {
            stack.push(i);
        }
        assert!(!stack.is_empty());
        assert_eq!(stack.take_all(), vec![0, 1, 2, 3, 4]);
        assert!(stack.is_empty());
        assert!(stack.take_all().is_empty());
    }

    #[test]
    fn concurrent_pushes_are_all_collected() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 1000;
        let stack = Arc::new(LfStack::new());
        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let stack = stack.clone();
                thread::spawn(move || {
                    for i in 0..PER_THREAD {
                        stack.push(t * PER_THREAD + i);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let mut values = stack.take_all();
        values.sort_unstable();
        assert_eq!(values, (0..THREADS * PER_THREAD).collect::<Vec<_>>());
    }

    #[test]
    fn drop_releases_pending_values() {
        let marker = Arc::new(());
        let stack = LfStack::new();
        stack.push(marker.clone());
        stack.push(marker.clone());
        assert_eq!(Arc::strong_count(&marker), 3);
        drop(stack);
        assert_eq!(Arc::strong_count(&marker), 1);
    }
}

#[cfg(all(test, feature = "shuttle"))]
mod tests_shuttle {
    use super::*;
    use shuttle::sync::Arc;
    use shuttle::thread;

    #[test]
    fn concurrent_push_and_drain() {
        shuttle::check_random(
            || {
                let stack = Arc::new(LfStack::new());
                let producers: Vec<_> = (0..3)
                    .map(|t| {
                        let stack = stack.clone();
                        thread::spawn(move || {
                            stack.push(t * 2);
                            stack.push(t * 2 + 1);
                        })
                    })
                    .collect();
                let mut drained = stack.take_all();
                for producer in producers {
                    producer.join().unwrap();
                }
                drained.extend(stack.take_all());
                drained.sort_unstable();
                assert_eq!(drained, vec![0, 1, 2, 3, 4, 5]);
            },
            200,
        );
    }
}
