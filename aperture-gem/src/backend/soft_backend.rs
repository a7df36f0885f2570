// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Software command processor.
//!
//! Emitted words are queued and later decoded and executed in order:
//! `STORE_SEQNO` updates the status page, `USER_INTERRUPT` wakes the irq
//! queue, and flushes, dispatches and clip rectangles are recorded so tests
//! can inspect what the buffer manager asked for. When the queue runs is
//! decided by the [`BackendMode`].

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

use aperture_common::settings::BackendMode;
use aperture_common::{GemError, GttOffset, Result, PAGE_SIZE_U64};

use super::{GttMapping, IrqWaitQueue, RingBackend};
use crate::command::{decode_stream, ClipRect, Command};
use crate::domain::Domains;

/// A FLUSH as executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushRecord {
    pub invalidate: Domains,
    pub flush: Domains,
    pub barrier: bool,
}

/// A BATCH_START as executed, with the clip rectangle in effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchRecord {
    pub address: u32,
    pub length: u32,
    pub cliprect: Option<ClipRect>,
}

#[derive(Default)]
struct Inner {
    pending: Vec<u32>,
    irq_refs: u32,
    /// Bound aperture ranges: offset -> page count.
    bound: BTreeMap<GttOffset, usize>,
    executed: Vec<Command>,
    flushes: Vec<FlushRecord>,
    dispatches: Vec<DispatchRecord>,
    cliprect: Option<ClipRect>,
}

pub struct SoftBackend {
    mode: BackendMode,
    inner: Mutex<Inner>,
    hws: AtomicU32,
    irq: IrqWaitQueue,
    chipset_flushes: AtomicU64,
}

impl SoftBackend {
    pub fn new(mode: BackendMode) -> Self {
        Self::with_seqno(mode, 0)
    }

    /// Start with `seqno` already on the status page.
    pub fn with_seqno(mode: BackendMode, seqno: u32) -> Self {
        Self {
            mode,
            inner: Mutex::new(Inner::default()),
            hws: AtomicU32::new(seqno),
            irq: IrqWaitQueue::new(),
            chipset_flushes: AtomicU64::new(0),
        }
    }

    pub fn mode(&self) -> BackendMode {
        self.mode
    }

    /// Execute everything queued so far, whatever the mode.
    pub fn run_pending(&self) {
        let mut inner = self.inner.lock();
        self.execute(&mut inner);
    }

    fn execute(&self, inner: &mut Inner) {
        if inner.pending.is_empty() {
            return;
        }
        let words = std::mem::take(&mut inner.pending);
        let cmds = match decode_stream(&words) {
            Ok(cmds) => cmds,
            Err(e) => {
                log::error!("soft backend: dropping {} ring words: {}", words.len(), e);
                return;
            }
        };

        let mut wake = false;
        for cmd in cmds {
            match cmd {
                Command::Noop => {}
                Command::Flush {
                    invalidate,
                    flush,
                    barrier,
                } => inner.flushes.push(FlushRecord {
                    invalidate,
                    flush,
                    barrier,
                }),
                Command::StoreSeqno(seqno) => {
                    log::trace!("soft backend: status page <- {}", seqno);
                    self.hws.store(seqno, Ordering::Release);
                }
                Command::UserInterrupt => wake = true,
                Command::ClipRect(rect) => inner.cliprect = Some(rect),
                Command::BatchStart { address, length } => {
                    if !Self::range_bound(&inner.bound, address as u64, length as u64) {
                        log::warn!(
                            "soft backend: batch [{:#X}+{:#X}) outside any bound range",
                            address,
                            length
                        );
                    }
                    let cliprect = inner.cliprect.take();
                    inner.dispatches.push(DispatchRecord {
                        address,
                        length,
                        cliprect,
                    });
                }
            }
            inner.executed.push(cmd);
        }

        if wake {
            self.irq.wake_all();
        }
    }

    fn range_bound(bound: &BTreeMap<GttOffset, usize>, addr: u64, len: u64) -> bool {
        bound
            .range(..=addr)
            .next_back()
            .is_some_and(|(&start, &pages)| addr + len <= start + pages as u64 * PAGE_SIZE_U64)
    }

    // -- Inspection ---------------------------------------------------------

    pub fn executed(&self) -> Vec<Command> {
        self.inner.lock().executed.clone()
    }

    pub fn flushes(&self) -> Vec<FlushRecord> {
        self.inner.lock().flushes.clone()
    }

    pub fn dispatches(&self) -> Vec<DispatchRecord> {
        self.inner.lock().dispatches.clone()
    }

    pub fn pending_words(&self) -> usize {
        self.inner.lock().pending.len()
    }

    pub fn bound_ranges(&self) -> Vec<(GttOffset, usize)> {
        self.inner
            .lock()
            .bound
            .iter()
            .map(|(&offset, &pages)| (offset, pages))
            .collect()
    }

    pub fn irq_enabled(&self) -> bool {
        self.inner.lock().irq_refs > 0
    }

    pub fn chipset_flush_count(&self) -> u64 {
        self.chipset_flushes.load(Ordering::Relaxed)
    }
}

impl RingBackend for SoftBackend {
    fn name(&self) -> &str {
        "soft"
    }

    fn emit(&self, words: &[u32]) -> Result<()> {
        decode_stream(words)?;
        let mut inner = self.inner.lock();
        inner.pending.extend_from_slice(words);
        let run = match self.mode {
            BackendMode::Immediate => true,
            BackendMode::Deferred => inner.irq_refs > 0,
            BackendMode::Stalled => false,
        };
        if run {
            self.execute(&mut inner);
        }
        Ok(())
    }

    fn hws_seqno(&self) -> u32 {
        self.hws.load(Ordering::Acquire)
    }

    fn user_irq_on(&self) {
        let mut inner = self.inner.lock();
        inner.irq_refs += 1;
        if self.mode == BackendMode::Deferred {
            self.execute(&mut inner);
        }
    }

    fn user_irq_off(&self) {
        let mut inner = self.inner.lock();
        assert!(inner.irq_refs > 0, "completion interrupt disabled more often than enabled");
        inner.irq_refs -= 1;
    }

    fn irq_queue(&self) -> &IrqWaitQueue {
        &self.irq
    }

    fn chipset_flush(&self) {
        self.chipset_flushes.fetch_add(1, Ordering::Relaxed);
    }

    fn bind_pages(&self, offset: GttOffset, page_count: usize) -> Result<GttMapping> {
        let mut inner = self.inner.lock();
        let end = offset + page_count as u64 * PAGE_SIZE_U64;
        let overlaps = inner
            .bound
            .range(..end)
            .next_back()
            .is_some_and(|(&start, &pages)| start + pages as u64 * PAGE_SIZE_U64 > offset);
        if overlaps {
            return Err(GemError::invalid(format!(
                "aperture range [{offset:#X}..{end:#X}) already mapped"
            )));
        }
        inner.bound.insert(offset, page_count);
        log::trace!("soft backend: mapped {} pages at {:#X}", page_count, offset);
        Ok(GttMapping { offset, page_count })
    }

    fn unbind_pages(&self, mapping: GttMapping) {
        let removed = self.inner.lock().bound.remove(&mapping.offset);
        assert_eq!(
            removed,
            Some(mapping.page_count),
            "unmapping aperture range {:#X} that was not mapped",
            mapping.offset
        );
    }
}
