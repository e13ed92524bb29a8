// SPDX-License-Identifier: MPL-2.0

//! A small wait/wake primitive shaped like `ostd::sync::WaitQueue`.
//!
//! `aster-block` blocks callers on an OS-kernel wait queue serviced by the
//! scheduler of the same address space. Outside a kernel there is no such
//! primitive to borrow, so this reimplements the same `wait_until`/`wake_*`
//! shape on top of `std::sync::{Mutex, Condvar}` — the ordinary way to build
//! a park/notify point in user-space Rust.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// A wait queue: callers block in [`WaitQueue::wait_until`] until a
/// condition closure returns `Some`, and are released by [`WaitQueue::wake_all`]
/// or [`WaitQueue::wake_one`].
pub struct WaitQueue {
    gate: Mutex<()>,
    condvar: Condvar,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            gate: Mutex::new(()),
            condvar: Condvar::new(),
        }
    }

    /// Blocks the caller until `cond` returns `Some(value)`, then returns
    /// `value`. `cond` is re-evaluated every time the queue is woken.
    pub fn wait_until<T>(&self, mut cond: impl FnMut() -> Option<T>) -> T {
        if let Some(v) = cond() {
            return v;
        }
        let mut guard = self.gate.lock().unwrap();
        loop {
            if let Some(v) = cond() {
                return v;
            }
            guard = self.condvar.wait(guard).unwrap();
        }
    }

    /// Like [`WaitQueue::wait_until`], but gives up and returns `None` if
    /// `timeout` elapses first without `cond` becoming satisfied. Used by
    /// the worker's periodic waker (spec.md §4.4's `COMMIT_PERIOD` tick).
    pub fn wait_until_or_timeout<T>(
        &self,
        mut cond: impl FnMut() -> Option<T>,
        timeout: Duration,
    ) -> Option<T> {
        if let Some(v) = cond() {
            return Some(v);
        }
        let mut result = None;
        let guard = self.gate.lock().unwrap();
        let _ = self
            .condvar
            .wait_timeout_while(guard, timeout, |_| {
                result = cond();
                result.is_none()
            })
            .unwrap();
        result
    }

    pub fn wake_all(&self) {
        let _guard = self.gate.lock().unwrap();
        self.condvar.notify_all();
    }

    pub fn wake_one(&self) {
        let _guard = self.gate.lock().unwrap();
        self.condvar.notify_one();
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}
