// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Periodic background retirement.
//!
//! The first request queued on an idle device arms the schedule. The worker
//! then sleeps one interval, runs its tick (which retires passed requests and
//! disarms the schedule once nothing is outstanding), and repeats while armed.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct ScheduleState {
    armed: bool,
    shutdown: bool,
}

#[derive(Debug, Default)]
pub struct RetireSchedule {
    state: Mutex<ScheduleState>,
    cond: Condvar,
}

impl RetireSchedule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self) {
        let mut state = self.state.lock();
        if !state.armed {
            state.armed = true;
            self.cond.notify_all();
        }
    }

    /// Must be called under the same lock that serializes `arm`.
    pub fn disarm(&self) {
        self.state.lock().armed = false;
    }

    pub fn is_armed(&self) -> bool {
        self.state.lock().armed
    }

    fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.cond.notify_all();
    }

    /// Block until armed. Returns `false` on shutdown.
    fn wait_armed(&self) -> bool {
        let mut state = self.state.lock();
        while !state.armed && !state.shutdown {
            self.cond.wait(&mut state);
        }
        !state.shutdown
    }

    /// Sleep for `interval`. Returns `false` on shutdown.
    fn sleep(&self, interval: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.shutdown {
            let _ = self.cond.wait_for(&mut state, interval);
        }
        !state.shutdown
    }
}

/// Background thread driving a [`RetireSchedule`].
pub struct RetireWorker {
    schedule: Arc<RetireSchedule>,
    thread: Option<JoinHandle<()>>,
}

impl RetireWorker {
    pub fn spawn<F>(schedule: Arc<RetireSchedule>, interval: Duration, mut tick: F) -> std::io::Result<Self>
    where
        F: FnMut() + Send + 'static,
    {
        let worker_schedule = schedule.clone();
        let thread = std::thread::Builder::new()
            .name("aperture-retire".into())
            .spawn(move || {
                log::debug!("retire worker started ({:?} interval)", interval);
                while worker_schedule.wait_armed() && worker_schedule.sleep(interval) {
                    // Arming only ever races with a shutdown here.
                    if worker_schedule.is_armed() {
                        tick();
                    }
                }
                log::debug!("retire worker stopped");
            })?;

        Ok(Self {
            schedule,
            thread: Some(thread),
        })
    }

    pub fn schedule(&self) -> &Arc<RetireSchedule> {
        &self.schedule
    }
}

impl Drop for RetireWorker {
    fn drop(&mut self) {
        self.schedule.shutdown();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("retire worker panicked");
            }
        }
    }
}
