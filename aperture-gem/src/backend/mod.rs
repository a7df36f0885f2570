// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command-processor backend abstraction.
//!
//! A backend owns the ring the buffer manager writes instructions into, the
//! hardware status page holding the last completed sequence number, the
//! completion interrupt, and the aperture page-table entries. Only a software
//! implementation exists today.

pub mod soft_backend;

use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use aperture_common::{GttOffset, Result};

pub use soft_backend::SoftBackend;

/// Aperture page-table entries installed for one bound object.
#[derive(Debug, PartialEq, Eq)]
pub struct GttMapping {
    pub offset: GttOffset,
    pub page_count: usize,
}

/// Trait for command-processor backends.
pub trait RingBackend: Send + Sync {
    fn name(&self) -> &str;

    /// Append instruction words to the ring.
    fn emit(&self, words: &[u32]) -> Result<()>;

    /// Last sequence number written to the status page.
    fn hws_seqno(&self) -> u32;

    /// Enable the completion interrupt (reference counted).
    fn user_irq_on(&self);

    /// Drop one completion-interrupt reference.
    fn user_irq_off(&self);

    /// Wait queue woken by the completion interrupt.
    fn irq_queue(&self) -> &IrqWaitQueue;

    /// Flush chipset write buffers so CPU writes reach memory.
    fn chipset_flush(&self) {}

    /// Install page-table entries for `page_count` pages at `offset`.
    fn bind_pages(&self, offset: GttOffset, page_count: usize) -> Result<GttMapping>;

    /// Remove the entries installed by `bind_pages`.
    fn unbind_pages(&self, mapping: GttMapping);
}

#[derive(Debug, Default)]
struct IrqState {
    generation: u64,
    /// Bumped by every interrupt that reached at least one waiter.
    interrupt_epoch: u64,
    waiters: usize,
}

/// Wait queue for completion interrupts and caller-level interruption.
///
/// Waiters snapshot [`generation`](Self::generation), re-check their
/// condition, then sleep until the generation moves or the poll interval
/// passes. Waking and interrupting never touch the device lock.
///
/// An interruption only aborts waits registered through
/// [`register`](Self::register) when it is raised; with nobody waiting it is
/// dropped.
#[derive(Debug, Default)]
pub struct IrqWaitQueue {
    state: Mutex<IrqState>,
    cond: Condvar,
}

impl IrqWaitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    /// Number of currently registered waiters.
    pub fn waiters(&self) -> usize {
        self.state.lock().waiters
    }

    /// Wake every waiter so it re-checks its condition.
    pub fn wake_all(&self) {
        let mut state = self.state.lock();
        state.generation = state.generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Abort every registered wait. Returns false if nobody was waiting.
    pub fn interrupt(&self) -> bool {
        let mut state = self.state.lock();
        if state.waiters == 0 {
            return false;
        }
        state.interrupt_epoch = state.interrupt_epoch.wrapping_add(1);
        state.generation = state.generation.wrapping_add(1);
        self.cond.notify_all();
        true
    }

    /// Register a wait. Interruptions raised while the returned guard lives
    /// are visible through [`IrqWaiter::is_interrupted`].
    pub fn register(&self) -> IrqWaiter<'_> {
        let mut state = self.state.lock();
        state.waiters += 1;
        IrqWaiter {
            queue: self,
            epoch: state.interrupt_epoch,
        }
    }

    /// Sleep until the generation differs from `seen` or `timeout` elapses.
    /// Returns the generation observed on return.
    pub fn wait_since(&self, seen: u64, timeout: Duration) -> u64 {
        let mut state = self.state.lock();
        if state.generation == seen {
            let _ = self.cond.wait_for(&mut state, timeout);
        }
        state.generation
    }
}

/// Registration of one wait on an [`IrqWaitQueue`].
#[derive(Debug)]
pub struct IrqWaiter<'a> {
    queue: &'a IrqWaitQueue,
    epoch: u64,
}

impl IrqWaiter<'_> {
    pub fn is_interrupted(&self) -> bool {
        self.queue.state.lock().interrupt_epoch != self.epoch
    }
}

impl Drop for IrqWaiter<'_> {
    fn drop(&mut self) {
        self.queue.state.lock().waiters -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_wait_since_returns_on_wake() {
        let queue = Arc::new(IrqWaitQueue::new());
        let seen = queue.generation();

        let waker = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                queue.wake_all();
            })
        };

        let now = queue.wait_since(seen, Duration::from_secs(5));
        assert_ne!(now, seen);
        waker.join().unwrap();
    }

    #[test]
    fn test_stale_generation_does_not_block() {
        let queue = IrqWaitQueue::new();
        let seen = queue.generation();
        queue.wake_all();
        let start = std::time::Instant::now();
        queue.wait_since(seen, Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_interrupt_reaches_registered_waiter_only() {
        let queue = IrqWaitQueue::new();
        assert!(!queue.interrupt());

        let waiter = queue.register();
        assert!(!waiter.is_interrupted());
        assert!(queue.interrupt());
        assert!(waiter.is_interrupted());
        drop(waiter);
        assert_eq!(queue.waiters(), 0);

        // A later wait does not see the earlier interruption.
        let next = queue.register();
        assert!(!next.is_interrupted());
    }
}
