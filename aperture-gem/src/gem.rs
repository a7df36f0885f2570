// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Device-wide buffer-object state.
//!
//! [`GemState`] owns the object arena, the aperture allocator, the three
//! residency lists and the fence queue. Every method expects to run under the
//! device lock. Residency rules:
//!
//! * inactive: bound, unpinned, idle, no device write domain.
//! * active: bound, busy, tagged with the fence of its last submission.
//! * flushing: bound, holding a device write domain awaiting a flush.
//! * unlisted: unbound, or bound and pinned while idle.
//!
//! An object lives while it has client handles or is busy. Objects losing
//! their last owner during retirement are queued and destroyed once the
//! retirement pass completes.

use std::collections::BTreeMap;
use std::sync::Arc;

use aperture_common::{
    align_up, is_page_aligned, GemError, GemSettings, GttOffset, Result, PAGE_MASK,
    PAGE_SIZE_U64,
};

use crate::backend::RingBackend;
use crate::backing_store::{BackingStore, ObjectMapping};
use crate::command::{encode_all, Command};
use crate::domain::{DomainAccumulator, DomainTransition, Domains};
use crate::fence::{self, FenceTracker, Request};
use crate::lru::{LruList, LruLists};
use crate::object::{Binding, GemObject, ObjectId, ObjectInfo};
use crate::range_allocator::{Block, RangeAllocator};
use crate::retire::RetireSchedule;

/// Aperture addresses are patched into 32-bit command words.
const APERTURE_LIMIT: u64 = 1 << 32;

/// Snapshot of device counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GemStats {
    pub object_count: usize,
    pub gtt_count: usize,
    pub gtt_memory: u64,
    pub pin_count: usize,
    pub pin_memory: u64,
    pub gtt_total: u64,
    pub gtt_free: u64,
    pub active: usize,
    pub flushing: usize,
    pub inactive: usize,
    pub outstanding_requests: usize,
    pub pinned_pages: usize,
    pub writeback_pages: u64,
    pub clflushed_pages: u64,
}

pub struct GemState {
    settings: GemSettings,
    backend: Arc<dyn RingBackend>,
    aperture: Option<RangeAllocator>,
    store: BackingStore,
    objects: BTreeMap<ObjectId, GemObject>,
    next_id: u64,
    lists: LruLists,
    fences: FenceTracker,
    reap_queue: Vec<ObjectId>,
    reaping: bool,
    suspended: bool,
    retire_schedule: Option<Arc<RetireSchedule>>,
}

impl GemState {
    pub fn new(settings: GemSettings, backend: Arc<dyn RingBackend>) -> Self {
        let fences = FenceTracker::new(backend.hws_seqno());
        let store = BackingStore::new(settings.pinned_page_limit);
        Self {
            settings,
            backend,
            aperture: None,
            store,
            objects: BTreeMap::new(),
            next_id: 1,
            lists: LruLists::new(),
            fences,
            reap_queue: Vec::new(),
            reaping: false,
            suspended: false,
            retire_schedule: None,
        }
    }

    pub fn settings(&self) -> &GemSettings {
        &self.settings
    }

    pub fn backend(&self) -> &Arc<dyn RingBackend> {
        &self.backend
    }

    pub(crate) fn set_retire_schedule(&mut self, schedule: Arc<RetireSchedule>) {
        self.retire_schedule = Some(schedule);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    // ---- Arena -------------------------------------------------------------

    pub(crate) fn obj(&self, id: ObjectId) -> &GemObject {
        match self.objects.get(&id) {
            Some(obj) => obj,
            None => panic!("{id} is not in the object arena"),
        }
    }

    pub(crate) fn obj_mut(&mut self, id: ObjectId) -> &mut GemObject {
        match self.objects.get_mut(&id) {
            Some(obj) => obj,
            None => panic!("{id} is not in the object arena"),
        }
    }

    pub fn object(&self, id: ObjectId) -> Option<&GemObject> {
        self.objects.get(&id)
    }

    pub fn object_info(&self, id: ObjectId) -> Option<ObjectInfo> {
        self.objects.get(&id).map(ObjectInfo::from)
    }

    /// Allocate an object of at least `size` bytes with no owners yet.
    pub fn create_object(&mut self, size: u64) -> Result<ObjectId> {
        if size == 0 {
            return Err(GemError::invalid("object size must be non-zero"));
        }
        let size = size
            .checked_add(PAGE_MASK)
            .map(|_| align_up(size, PAGE_SIZE_U64))
            .filter(|&s| usize::try_from(s).is_ok())
            .ok_or_else(|| GemError::invalid(format!("object size {size:#X} too large")))?;

        let id = ObjectId(self.next_id);
        self.next_id += 1;
        self.objects.insert(id, GemObject::new(id, size));
        log::trace!("{id}: created ({size:#X} bytes)");
        Ok(id)
    }

    pub fn add_handle(&mut self, id: ObjectId) {
        self.obj_mut(id).handle_count += 1;
    }

    /// Drop one client handle; the object is destroyed once idle.
    pub fn drop_handle(&mut self, id: ObjectId) {
        let obj = self.obj_mut(id);
        assert!(obj.handle_count > 0, "{id}: handle count underflow");
        obj.handle_count -= 1;
        if obj.is_orphan() {
            self.reap_queue.push(id);
            self.reap_pending();
        }
    }

    pub(crate) fn reap_pending(&mut self) {
        if self.reaping {
            return;
        }
        self.reaping = true;
        while let Some(id) = self.reap_queue.pop() {
            if self.objects.get(&id).is_some_and(GemObject::is_orphan) {
                self.free_object(id);
            }
        }
        self.reaping = false;
    }

    /// Destroy an object nobody owns: drop every pin, unbind, release storage.
    fn free_object(&mut self, id: ObjectId) {
        while self.obj(id).is_pinned() {
            self.unpin(id);
        }
        if let Err(e) = self.unbind(id) {
            // A failed unbind leaves the object busy; retirement requeues it.
            log::warn!("{id}: unbind on destroy failed: {e}");
            return;
        }
        let obj = self.obj(id);
        if !obj.is_orphan() {
            return;
        }
        assert!(obj.lru.is_none() && !obj.is_bound(), "{id} destroyed while resident");
        self.objects.remove(&id);
        log::trace!("{id}: destroyed");
    }

    // ---- Aperture ----------------------------------------------------------

    /// Manage `[start, end)` of the device aperture.
    pub fn init_aperture(&mut self, start: u64, end: u64) -> Result<()> {
        if end > APERTURE_LIMIT {
            return Err(GemError::Config(format!(
                "aperture end {end:#X} beyond the 32-bit address space"
            )));
        }
        if self.objects.values().any(GemObject::is_bound) {
            return Err(GemError::Busy);
        }
        let allocator = RangeAllocator::new(start, end.saturating_sub(start))?;
        log::info!(
            "aperture: [{:#X}..{:#X}) ({} KiB)",
            start,
            end,
            allocator.total() / 1024
        );
        self.aperture = Some(allocator);
        Ok(())
    }

    fn aperture(&self) -> Result<&RangeAllocator> {
        self.aperture
            .as_ref()
            .ok_or_else(|| GemError::Config("aperture not initialized".into()))
    }

    // ---- Flushes and fences ------------------------------------------------

    /// Emit a flush: CPU flushes go to the chipset, anything else to the ring.
    pub(crate) fn flush(&mut self, invalidate: Domains, flush: Domains) -> Result<()> {
        if flush.contains(Domains::CPU) {
            self.backend.chipset_flush();
        }
        if !(invalidate | flush).gpu().is_empty() {
            log::trace!("flush: invalidate {} flush {}", invalidate, flush);
            self.backend.emit(&encode_all(&[Command::Flush {
                invalidate,
                flush,
                barrier: false,
            }]))?;
        }
        Ok(())
    }

    /// Emit the coalesced flush for `acc` and return the domains it flushed.
    pub(crate) fn emit_accumulated(&mut self, acc: &DomainAccumulator) -> Result<Domains> {
        if !acc.is_empty() {
            self.flush(acc.invalidate, acc.flush)?;
        }
        Ok(acc.flush)
    }

    /// Barrier so the batch finishes before the completion signal. Returns the
    /// domains the barrier flushes implicitly.
    pub(crate) fn retire_commands(&mut self) -> Result<Domains> {
        self.backend.emit(&encode_all(&[Command::Flush {
            invalidate: Domains::empty(),
            flush: Domains::empty(),
            barrier: true,
        }]))?;
        Ok(if self.settings.sampler_always_flushed {
            Domains::SAMPLER
        } else {
            Domains::empty()
        })
    }

    /// Emit a fence tagged with `flush_domains`.
    pub(crate) fn add_request(&mut self, flush_domains: Domains) -> Result<u32> {
        let (seqno, was_empty) = self.fences.emit(self.backend.as_ref(), flush_domains)?;
        if was_empty {
            if let Some(schedule) = &self.retire_schedule {
                schedule.arm();
            }
        }
        Ok(seqno)
    }

    pub fn current_seqno(&self) -> u32 {
        self.backend.hws_seqno()
    }

    pub fn outstanding_requests(&self) -> usize {
        self.fences.outstanding()
    }

    /// Wait for `seqno`, then retire everything that has passed.
    pub fn wait_request(&mut self, seqno: u32) -> Result<()> {
        self.fences
            .wait(self.backend.as_ref(), seqno, self.settings.poll_interval)?;
        self.retire_requests();
        Ok(())
    }

    /// Retire every request the status page has passed.
    pub fn retire_requests(&mut self) {
        let hws = self.backend.hws_seqno();
        while let Some(request) = self.fences.pop_passed(hws) {
            self.retire_request(&request);
        }
        self.reap_pending();
        self.check_lists();
    }

    fn retire_request(&mut self, request: &Request) {
        if !request.flush_domains.is_empty() {
            let flushed: Vec<ObjectId> = self
                .lists
                .iter(LruList::Flushing)
                .filter(|&id| self.obj(id).write_domain.intersects(request.flush_domains))
                .collect();
            for id in flushed {
                self.obj_mut(id).write_domain = Domains::empty();
                self.move_to_inactive(id);
            }

            // Idle pinned objects sit on no list.
            let pinned: Vec<ObjectId> = self
                .objects
                .iter()
                .filter(|(_, o)| {
                    o.is_pinned()
                        && !o.busy
                        && o.lru.is_none()
                        && o.write_domain.intersects(request.flush_domains)
                })
                .map(|(&id, _)| id)
                .collect();
            for id in pinned {
                log::trace!("{id}: pinned write flushed by {}", request.seqno);
                self.obj_mut(id).write_domain = Domains::empty();
            }
        }

        // Active objects are queued in fence order: stop at the first newer one.
        while let Some(id) = self.lists.head(LruList::Active) {
            let obj = self.obj(id);
            if obj.last_rendering_seqno != request.seqno {
                break;
            }
            if obj.has_gpu_write() {
                log::trace!("{id}: retired {} -> flushing", request.seqno);
                self.relink(id, LruList::Flushing);
            } else {
                log::trace!("{id}: retired {} -> inactive", request.seqno);
                self.move_to_inactive(id);
            }
        }
    }

    // ---- List moves --------------------------------------------------------

    fn relink(&mut self, id: ObjectId, list: LruList) {
        self.unlink(id);
        let link = self.lists.push_tail(list, id);
        self.obj_mut(id).lru = Some(link);
    }

    fn unlink(&mut self, id: ObjectId) {
        if let Some(link) = self.obj_mut(id).lru.take() {
            self.lists.remove(link);
        }
    }

    pub(crate) fn move_to_active(&mut self, id: ObjectId, seqno: u32) {
        let obj = self.obj_mut(id);
        obj.busy = true;
        obj.last_rendering_seqno = seqno;
        self.relink(id, LruList::Active);
    }

    fn move_to_inactive(&mut self, id: ObjectId) {
        if self.obj(id).is_pinned() {
            self.unlink(id);
        } else {
            self.relink(id, LruList::Inactive);
        }
        let obj = self.obj_mut(id);
        if obj.busy {
            obj.busy = false;
            if obj.is_orphan() {
                self.reap_queue.push(id);
            }
        }
    }

    /// Put an object on the list matching its state after a domain change
    /// outside a submission. `fence` is the request emitted for the flush.
    fn relist(&mut self, id: ObjectId, fence: Option<u32>) {
        let obj = self.obj(id);
        if !obj.is_bound() {
            return;
        }
        let gpu_write = obj.has_gpu_write();
        match (obj.busy, obj.is_pinned(), obj.list()) {
            (true, _, Some(LruList::Flushing)) if !gpu_write => {
                if let Some(seqno) = fence {
                    self.move_to_active(id, seqno);
                }
            }
            (true, _, _) => {}
            (false, false, _) => {
                let list = if gpu_write {
                    LruList::Flushing
                } else {
                    LruList::Inactive
                };
                self.relink(id, list);
            }
            (false, true, Some(_)) if !gpu_write => self.unlink(id),
            (false, true, _) => {}
        }
    }

    /// Residency and fence state of every list, oldest first.
    pub fn lru_snapshot(&self, list: LruList) -> Vec<ObjectId> {
        self.lists.ids(list)
    }

    // ---- Domains -----------------------------------------------------------

    pub(crate) fn clflush_object(&mut self, id: ObjectId) {
        // Unbound objects are flushed again when bound.
        if let Some(binding) = self.objects.get(&id).and_then(|o| o.binding.as_ref()) {
            self.store.clflush(&binding.pages);
        }
    }

    /// Move `id` to `(read, write)`, merging the required flush and
    /// invalidate operations into `acc` without emitting them.
    pub(crate) fn object_set_domain(
        &mut self,
        id: ObjectId,
        read: Domains,
        write: Domains,
        acc: &mut DomainAccumulator,
    ) -> Result<()> {
        if !write.is_single() {
            return Err(GemError::invalid(format!("write domain {write} has more than one bit")));
        }
        let obj = self.obj(id);
        let t = DomainTransition::compute(obj.read_domains, obj.write_domain, read, write);
        log::trace!(
            "{id}: ({}, {}) -> ({}, {}) invalidate {} flush {}",
            obj.read_domains,
            obj.write_domain,
            t.read_domains,
            t.write_domain.unwrap_or(obj.write_domain),
            t.invalidate,
            t.flush
        );

        if t.dirties {
            self.obj_mut(id).dirty = true;
        }
        if t.touches_cpu() {
            if t.needs_rendering_barrier() {
                self.wait_rendering(id)?;
            }
            self.clflush_object(id);
        }

        let obj = self.obj_mut(id);
        if let Some(write_domain) = t.write_domain {
            obj.write_domain = write_domain;
        }
        obj.read_domains = t.read_domains;
        acc.merge(&t);
        Ok(())
    }

    /// Domain change outside a submission: emit the flush right away and
    /// fence any device caches it flushed.
    fn domain_sync(&mut self, id: ObjectId, read: Domains, write: Domains) -> Result<()> {
        let mut acc = DomainAccumulator::new();
        self.object_set_domain(id, read, write, &mut acc)?;
        let flushed = self.emit_accumulated(&acc)?;
        let fence = if flushed.gpu().is_empty() {
            None
        } else {
            Some(self.add_request(flushed)?)
        };
        self.relist(id, fence);
        Ok(())
    }

    /// Client-requested domain change.
    pub fn set_domain(&mut self, id: ObjectId, read: Domains, write: Domains) -> Result<()> {
        let obj = self.obj(id);
        if !obj.is_bound() && !(read | write).gpu().is_empty() {
            return Err(GemError::invalid(format!(
                "{id} is not bound and cannot enter device domains ({read}, {write})"
            )));
        }
        self.domain_sync(id, read, write)?;
        self.check_lists();
        Ok(())
    }

    /// Flush pending device writes of `id` and wait for its rendering.
    pub(crate) fn wait_rendering(&mut self, id: ObjectId) -> Result<()> {
        let obj = self.obj(id);
        if obj.has_gpu_write() {
            let write_domain = obj.write_domain;
            log::trace!("{id}: flushing write domain {write_domain} before wait");
            self.flush(Domains::empty(), write_domain)?;
            self.obj_mut(id).write_domain = Domains::empty();
            let seqno = self.add_request(write_domain)?;
            self.move_to_active(id, seqno);
        }

        let obj = self.obj(id);
        if obj.busy {
            let seqno = obj.last_rendering_seqno;
            self.wait_request(seqno)?;
        }
        Ok(())
    }

    // ---- Binding -----------------------------------------------------------

    fn bind_to_gtt(&mut self, id: ObjectId, alignment: u64) -> Result<()> {
        let alignment = if alignment == 0 { PAGE_SIZE_U64 } else { alignment };
        if alignment & PAGE_MASK != 0 {
            return Err(GemError::invalid(format!(
                "alignment {alignment:#X} is not a multiple of the page size"
            )));
        }

        let size = self.obj(id).size;
        if size > self.aperture()?.total() {
            log::warn!("{id}: {size:#X} bytes can never fit the aperture");
            return Err(GemError::NoSpace);
        }

        let mut evictions = 0;
        let block = loop {
            if let Some(block) = self.aperture.as_mut().and_then(|a| a.allocate(size, alignment)) {
                break block;
            }
            if evictions >= self.settings.max_eviction_attempts {
                log::error!("{id}: no aperture space after {evictions} evictions");
                return Err(GemError::NoSpace);
            }
            if [LruList::Inactive, LruList::Flushing, LruList::Active]
                .iter()
                .all(|&list| self.lists.is_empty(list))
            {
                log::error!("{id}: aperture full but nothing resident is evictable");
                return Err(GemError::NoSpace);
            }
            log::trace!("{id}: aperture full, evicting");
            self.evict_something()?;
            evictions += 1;
        };

        let offset = block.start();
        let obj = match self.objects.get_mut(&id) {
            Some(obj) => obj,
            None => panic!("{id} vanished while binding"),
        };
        fn release_block(aperture: &mut Option<RangeAllocator>, block: Block) {
            if let Some(aperture) = aperture.as_mut() {
                aperture.release(block);
            }
        }

        let pages = match self.store.acquire_pages(&mut obj.shadow) {
            Ok(pages) => pages,
            Err(e) => {
                release_block(&mut self.aperture, block);
                return Err(e);
            }
        };
        let mapping = match self.backend.bind_pages(offset, pages.page_count()) {
            Ok(mapping) => mapping,
            Err(e) => {
                self.store.release_pages(pages, false);
                release_block(&mut self.aperture, block);
                return Err(e);
            }
        };

        // Not resident, so no device cache can hold it.
        assert!(
            (obj.read_domains | obj.write_domain).gpu().is_empty(),
            "{id} entered the aperture in device domains ({}, {})",
            obj.read_domains,
            obj.write_domain
        );
        obj.binding = Some(Binding {
            block,
            pages,
            mapping,
        });
        log::debug!("{id}: bound {size:#X} bytes at {offset:#X}");
        Ok(())
    }

    /// Remove `id` from the aperture. Fails while pinned.
    pub fn unbind(&mut self, id: ObjectId) -> Result<()> {
        let obj = self.obj(id);
        if !obj.is_bound() {
            return Ok(());
        }
        if obj.is_pinned() {
            log::error!("{id}: attempt to unbind pinned object");
            return Err(GemError::invalid(format!("{id} is pinned")));
        }

        self.wait_rendering(id)?;
        // Any CPU write while unbound is then flushed on the next bind.
        self.domain_sync(id, Domains::CPU, Domains::CPU)?;

        let obj = self.obj_mut(id);
        assert!(!obj.busy, "{id} still busy after waiting for rendering");
        let Some(binding) = obj.binding.take() else {
            return Ok(());
        };
        let dirty = std::mem::take(&mut obj.dirty);
        let offset = binding.block.start();

        self.backend.unbind_pages(binding.mapping);
        self.store.release_pages(binding.pages, dirty);
        if let Some(aperture) = self.aperture.as_mut() {
            aperture.release(binding.block);
        }
        self.unlink(id);
        log::debug!("{id}: unbound from {offset:#X}");
        Ok(())
    }

    /// Free aperture space: evict an idle object, else wait for the oldest
    /// request, else flush a pending write so a later wait makes progress.
    pub fn evict_something(&mut self) -> Result<()> {
        loop {
            if let Some(id) = self.lists.head(LruList::Inactive) {
                let obj = self.obj(id);
                assert!(
                    !obj.is_pinned() && !obj.busy,
                    "{id} on the inactive list is pinned or busy"
                );
                log::trace!("evicting {id}");
                return self.unbind(id);
            }

            if let Some(seqno) = self.fences.oldest().map(|r| r.seqno) {
                self.wait_request(seqno)?;
                if !self.lists.is_empty(LruList::Inactive) {
                    continue;
                }
                // Retirement may have destroyed an orphan and freed space.
                return Ok(());
            }

            if let Some(id) = self.lists.head(LruList::Flushing) {
                let write_domain = self.obj(id).write_domain;
                self.flush(write_domain, write_domain)?;
                self.add_request(write_domain)?;
                continue;
            }

            log::error!(
                "nothing to evict: inactive {} requests {} flushing {}",
                self.lists.len(LruList::Inactive),
                self.fences.outstanding(),
                self.lists.len(LruList::Flushing)
            );
            return Err(GemError::NoSpace);
        }
    }

    /// Bind if needed and take a pin. `alignment` 0 means page alignment.
    pub fn pin(&mut self, id: ObjectId, alignment: u64) -> Result<()> {
        if let Some(offset) = self.obj(id).gtt_offset() {
            if alignment > PAGE_SIZE_U64 && offset % alignment != 0 {
                if self.obj(id).is_pinned() {
                    return Err(GemError::invalid(format!(
                        "{id} pinned at {offset:#X}, not {alignment:#X}-aligned"
                    )));
                }
                self.unbind(id)?;
            }
        }
        if !self.obj(id).is_bound() {
            self.bind_to_gtt(id, alignment)?;
        }

        let obj = self.obj_mut(id);
        obj.pin_count += 1;
        if obj.pin_count == 1 && !obj.busy && !obj.has_gpu_write() {
            self.unlink(id);
        }
        self.check_lists();
        Ok(())
    }

    /// Drop one pin.
    ///
    /// # Panics
    ///
    /// If the object is not pinned.
    pub fn unpin(&mut self, id: ObjectId) {
        let obj = self.obj_mut(id);
        assert!(obj.pin_count > 0, "{id}: unpin without pin");
        assert!(obj.is_bound(), "{id}: pinned but not bound");
        obj.pin_count -= 1;
        if obj.pin_count == 0 && !obj.busy {
            let list = if obj.has_gpu_write() {
                LruList::Flushing
            } else {
                LruList::Inactive
            };
            self.relink(id, list);
        }
        self.check_lists();
    }

    // ---- CPU access --------------------------------------------------------

    pub fn pread(&mut self, id: ObjectId, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_cpu_range(id, offset, buf.len())?;
        self.domain_sync(id, Domains::CPU, Domains::empty())?;
        self.obj(id).shadow.read(offset, buf)
    }

    pub fn pwrite(&mut self, id: ObjectId, offset: u64, data: &[u8]) -> Result<()> {
        self.check_cpu_range(id, offset, data.len())?;
        self.domain_sync(id, Domains::CPU, Domains::CPU)?;
        self.obj_mut(id).shadow.write(offset, data)
    }

    /// Map `[offset, offset + len)` of the object for direct CPU access. The
    /// object moves to the CPU domain for reading and writing first; later
    /// writes through the mapping are not tracked.
    pub fn mmap(&mut self, id: ObjectId, offset: u64, len: usize) -> Result<ObjectMapping> {
        if !is_page_aligned(offset) {
            return Err(GemError::invalid(format!(
                "{id}: mapping offset {offset:#X} not page aligned"
            )));
        }
        self.check_cpu_range(id, offset, len)?;
        self.domain_sync(id, Domains::CPU, Domains::CPU)?;
        self.obj_mut(id).shadow.mapping(offset, len)
    }

    fn check_cpu_range(&self, id: ObjectId, offset: u64, len: usize) -> Result<()> {
        let size = self.obj(id).size;
        match offset.checked_add(len as u64) {
            Some(end) if end <= size => Ok(()),
            _ => Err(GemError::invalid(format!(
                "{id}: access [{offset:#X}+{len:#X}) beyond {size:#X} bytes"
            ))),
        }
    }

    /// CPU writes to a pinned object (a scanout buffer) are made visible.
    pub fn sw_finish(&mut self, id: ObjectId) {
        let obj = self.obj(id);
        if obj.write_domain.contains(Domains::CPU) && obj.is_pinned() {
            self.clflush_object(id);
            self.backend.chipset_flush();
        }
    }

    /// Pin on behalf of a client that does not manage domains: pending CPU
    /// writes are flushed so the device sees them.
    pub fn pin_for_client(&mut self, id: ObjectId, alignment: u64) -> Result<GttOffset> {
        self.pin(id, alignment)?;
        if self.obj(id).write_domain.contains(Domains::CPU) {
            self.clflush_object(id);
            self.backend.chipset_flush();
            self.obj_mut(id).write_domain = Domains::empty();
        }
        self.obj(id)
            .gtt_offset()
            .ok_or_else(|| GemError::invalid(format!("{id} lost its binding")))
    }

    pub fn is_busy(&self, id: ObjectId) -> bool {
        self.obj(id).busy
    }

    // ---- Suspend / resume --------------------------------------------------

    /// Quiesce the device: flush every device domain, wait for the ring to
    /// drain and evict every idle object. Submissions are refused until
    /// [`resume`](Self::resume).
    ///
    /// If the status page stops moving for `idle_timeout` the device is
    /// assumed wedged: outstanding requests are retired regardless and
    /// [`GemError::DeviceUnresponsive`] is returned after eviction.
    pub fn idle(&mut self) -> Result<()> {
        if self.suspended {
            return Ok(());
        }
        self.suspended = true;

        self.flush(Domains::GPU, Domains::GPU)?;
        let seqno = self.add_request(Domains::GPU)?;

        self.backend.user_irq_on();
        let drained = fence::poll_passed(
            self.backend.as_ref(),
            seqno,
            self.settings.idle_poll_quantum,
            self.settings.idle_timeout,
        );
        self.backend.user_irq_off();

        self.retire_requests();
        if drained.is_err() {
            while let Some(request) = self.fences.pop_oldest() {
                log::warn!("forcing retirement of fence {}", request.seqno);
                self.retire_request(&request);
            }
            self.reap_pending();
        }

        assert!(self.lists.is_empty(LruList::Active), "active objects after idle");
        assert!(self.lists.is_empty(LruList::Flushing), "flushing objects after idle");
        assert!(self.fences.is_idle(), "requests outstanding after idle");

        while let Some(id) = self.lists.head(LruList::Inactive) {
            self.unbind(id)?;
        }
        log::info!("device idle ({} objects still pinned)", self.pinned_count());
        drained
    }

    /// Accept submissions again after [`idle`](Self::idle).
    pub fn resume(&mut self) {
        if self.suspended {
            self.suspended = false;
            log::info!("device resumed");
        }
    }

    fn pinned_count(&self) -> usize {
        self.objects.values().filter(|o| o.is_pinned()).count()
    }

    // ---- Consistency -------------------------------------------------------

    pub(crate) fn check_lists(&self) {
        if self.settings.verify_lists {
            self.verify_lists();
        }
    }

    /// Assert that list membership matches every object's state.
    pub fn verify_lists(&self) {
        for id in self.lists.iter(LruList::Inactive) {
            let o = self.obj(id);
            assert!(
                o.is_bound() && !o.is_pinned() && !o.busy && !o.has_gpu_write(),
                "{id} on inactive list: bound {} pin {} busy {} write {}",
                o.is_bound(),
                o.pin_count,
                o.busy,
                o.write_domain
            );
        }
        for id in self.lists.iter(LruList::Active) {
            let o = self.obj(id);
            assert!(
                o.is_bound() && o.busy && o.last_rendering_seqno != 0,
                "{id} on active list: bound {} busy {} seqno {}",
                o.is_bound(),
                o.busy,
                o.last_rendering_seqno
            );
        }
        for id in self.lists.iter(LruList::Flushing) {
            let o = self.obj(id);
            assert!(
                o.is_bound() && o.has_gpu_write(),
                "{id} on flushing list: bound {} write {}",
                o.is_bound(),
                o.write_domain
            );
        }
        for (id, o) in &self.objects {
            if o.lru.is_some() {
                continue;
            }
            if o.is_bound() {
                assert!(
                    o.is_pinned() && !o.busy,
                    "{id} bound but unlisted: pin {} busy {}",
                    o.pin_count,
                    o.busy
                );
            } else {
                assert!(
                    !o.is_pinned() && !o.busy,
                    "{id} unbound but pin {} busy {}",
                    o.pin_count,
                    o.busy
                );
            }
        }
    }

    pub fn stats(&self) -> GemStats {
        let mut stats = GemStats {
            object_count: self.objects.len(),
            active: self.lists.len(LruList::Active),
            flushing: self.lists.len(LruList::Flushing),
            inactive: self.lists.len(LruList::Inactive),
            outstanding_requests: self.fences.outstanding(),
            pinned_pages: self.store.pinned_pages(),
            writeback_pages: self.store.writeback_pages(),
            clflushed_pages: self.store.clflushed_pages(),
            ..Default::default()
        };
        if let Some(aperture) = &self.aperture {
            stats.gtt_total = aperture.total();
            stats.gtt_free = aperture.free_bytes();
        }
        for obj in self.objects.values().filter(|o| o.is_bound()) {
            stats.gtt_count += 1;
            stats.gtt_memory += obj.size;
            if obj.is_pinned() {
                stats.pin_count += 1;
                stats.pin_memory += obj.size;
            }
        }
        stats
    }
}
