// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Request and fence tracking.
//!
//! Each submission ends with a `STORE_SEQNO` + `USER_INTERRUPT` pair carrying
//! a 32-bit sequence number. Sequence numbers increase monotonically, wrap,
//! and skip zero, which stands for "no fence". Outstanding requests sit in a
//! FIFO ordered by sequence number; retirement pops them as the status page
//! passes them.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use aperture_common::{GemError, Result, NO_SEQNO};

use crate::backend::RingBackend;
use crate::command::{encode_all, Command};
use crate::domain::Domains;

/// True when `a` is at or after `b`, allowing for wraparound.
#[inline]
pub fn seqno_passed(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) >= 0
}

/// One emitted fence.
#[derive(Debug, Clone, Copy)]
pub struct Request {
    pub seqno: u32,
    /// Domains flushed by the commands ahead of this fence.
    pub flush_domains: Domains,
    pub emitted_at: Instant,
}

#[derive(Debug)]
pub struct FenceTracker {
    next_seqno: u32,
    requests: VecDeque<Request>,
    /// Sequence number the current waiter sleeps on, `NO_SEQNO` if none.
    waiting_seqno: u32,
}

impl FenceTracker {
    /// Continue numbering after `hws`, the value already on the status page.
    pub fn new(hws: u32) -> Self {
        Self {
            next_seqno: Self::advance(hws),
            requests: VecDeque::new(),
            waiting_seqno: NO_SEQNO,
        }
    }

    fn advance(seqno: u32) -> u32 {
        match seqno.wrapping_add(1) {
            NO_SEQNO => 1,
            next => next,
        }
    }

    /// Write a fence into the ring and queue its request. Returns the new
    /// sequence number and whether the queue was empty beforehand.
    pub fn emit(&mut self, backend: &dyn RingBackend, flush_domains: Domains) -> Result<(u32, bool)> {
        let seqno = self.next_seqno;
        backend.emit(&encode_all(&[
            Command::StoreSeqno(seqno),
            Command::UserInterrupt,
        ]))?;
        self.next_seqno = Self::advance(seqno);

        let was_empty = self.requests.is_empty();
        self.requests.push_back(Request {
            seqno,
            flush_domains,
            emitted_at: Instant::now(),
        });
        log::debug!("fence {} emitted (flush {})", seqno, flush_domains);
        Ok((seqno, was_empty))
    }

    /// Pop the oldest request if the status page has passed it.
    pub fn pop_passed(&mut self, hws: u32) -> Option<Request> {
        let head = self.requests.front()?;
        if !seqno_passed(hws, head.seqno) {
            return None;
        }
        let req = self.requests.pop_front()?;
        log::debug!(
            "fence {} retired after {:?}",
            req.seqno,
            req.emitted_at.elapsed()
        );
        Some(req)
    }

    /// Pop the oldest request whether or not it has passed.
    pub fn pop_oldest(&mut self) -> Option<Request> {
        self.requests.pop_front()
    }

    pub fn oldest(&self) -> Option<&Request> {
        self.requests.front()
    }

    pub fn outstanding(&self) -> usize {
        self.requests.len()
    }

    pub fn is_idle(&self) -> bool {
        self.requests.is_empty()
    }

    /// Sequence number the next `emit` will use.
    pub fn next_seqno(&self) -> u32 {
        self.next_seqno
    }

    pub fn waiting_seqno(&self) -> u32 {
        self.waiting_seqno
    }

    /// Block until the status page passes `seqno`.
    ///
    /// The completion interrupt is held on for the duration; every wakeup
    /// (interrupt, poll timeout or spurious) re-reads the status page. An
    /// interruption raised while this wait is registered ends it with
    /// [`GemError::Interrupted`]; earlier ones are not seen.
    pub fn wait(
        &mut self,
        backend: &dyn RingBackend,
        seqno: u32,
        poll_interval: Duration,
    ) -> Result<()> {
        if seqno == NO_SEQNO {
            return Err(GemError::invalid("wait on reserved sequence number 0"));
        }
        if seqno_passed(backend.hws_seqno(), seqno) {
            return Ok(());
        }

        let queue = backend.irq_queue();
        let waiter = queue.register();
        let mut seen = queue.generation();
        self.waiting_seqno = seqno;
        backend.user_irq_on();

        let result = loop {
            if seqno_passed(backend.hws_seqno(), seqno) {
                break Ok(());
            }
            if waiter.is_interrupted() {
                log::debug!("wait for fence {} interrupted", seqno);
                break Err(GemError::Interrupted);
            }
            seen = queue.wait_since(seen, poll_interval);
        };

        drop(waiter);
        backend.user_irq_off();
        self.waiting_seqno = NO_SEQNO;
        result
    }
}

/// Poll the status page until it passes `seqno`, without sleeping on the
/// interrupt. Fails once `timeout` elapses with no movement of the status
/// page; any forward progress restarts the deadline.
pub fn poll_passed(
    backend: &dyn RingBackend,
    seqno: u32,
    quantum: Duration,
    timeout: Duration,
) -> Result<()> {
    let mut last_seen = backend.hws_seqno();
    let mut deadline = Instant::now() + timeout;

    loop {
        let hws = backend.hws_seqno();
        if seqno_passed(hws, seqno) {
            return Ok(());
        }
        let now = Instant::now();
        if hws != last_seen {
            last_seen = hws;
            deadline = now + timeout;
        } else if now >= deadline {
            log::error!(
                "device unresponsive: waiting for fence {} but status page stuck at {}",
                seqno,
                hws
            );
            return Err(GemError::DeviceUnresponsive {
                seqno,
                last_seen: hws,
            });
        }
        std::thread::sleep(quantum);
    }
}
