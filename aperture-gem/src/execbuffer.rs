// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command submission.
//!
//! A submission names a list of buffers, the last of which is the batch.
//! Every buffer is pinned into the aperture in order and its relocations are
//! applied; relocation targets must appear earlier in the list. Once every
//! buffer is resident the staged domains are committed, one coalesced flush
//! is emitted, the batch is dispatched and a fence is published. Every
//! buffer pinned by the submission is unpinned on the way out, whether it
//! succeeded or not.

use aperture_common::{GemError, GttOffset, Handle, Result};

use crate::command::{encode_all, ClipRect, Command};
use crate::domain::{DomainAccumulator, Domains};
use crate::gem::GemState;
use crate::handle_table::HandleTable;
use crate::object::ObjectId;

/// Batch start offset and length granularity.
const BATCH_ALIGN: u32 = 8;

/// Patch request: write the address of `target_handle` plus `delta` at byte
/// `offset` of the referencing buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub target_handle: Handle,
    pub offset: u64,
    pub delta: u32,
    pub read_domains: Domains,
    pub write_domain: Domains,
    /// Address the client last saw for the target. Updated on return.
    pub presumed_offset: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecObject {
    pub handle: Handle,
    pub relocs: Vec<Relocation>,
    /// Required aperture alignment, 0 for page alignment.
    pub alignment: u64,
    /// Aperture offset the buffer was executed at. Output.
    pub offset: GttOffset,
}

impl ExecObject {
    pub fn new(handle: Handle) -> Self {
        Self {
            handle,
            relocs: Vec::new(),
            alignment: 0,
            offset: 0,
        }
    }

    pub fn with_relocs(handle: Handle, relocs: Vec<Relocation>) -> Self {
        Self {
            relocs,
            ..Self::new(handle)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecBuffer {
    pub objects: Vec<ExecObject>,
    pub batch_start_offset: u32,
    pub batch_len: u32,
    /// One dispatch per rectangle; a single unclipped dispatch when empty.
    pub cliprects: Vec<ClipRect>,
}

impl ExecBuffer {
    fn validate(&self) -> Result<()> {
        if self.objects.is_empty() {
            return Err(GemError::invalid("submission with no buffers"));
        }
        if (self.batch_start_offset | self.batch_len) % BATCH_ALIGN != 0 {
            return Err(GemError::invalid(format!(
                "batch start {:#X} / length {:#X} not {}-byte aligned",
                self.batch_start_offset, self.batch_len, BATCH_ALIGN
            )));
        }
        if self.batch_len == 0 {
            return Err(GemError::invalid("empty batch"));
        }
        if let Some(rect) = self.cliprects.iter().find(|r| r.is_empty()) {
            return Err(GemError::invalid(format!("degenerate clip rectangle {rect:?}")));
        }
        Ok(())
    }
}

impl GemState {
    /// Run one submission for the client owning `handles`. Returns the fence
    /// of the dispatched batch.
    pub fn execbuffer(&mut self, handles: &HandleTable, exec: &mut ExecBuffer) -> Result<u32> {
        if self.is_suspended() {
            log::error!("execbuffer while suspended");
            return Err(GemError::Busy);
        }
        exec.validate()?;

        let ids = exec
            .objects
            .iter()
            .map(|entry| handles.get(entry.handle))
            .collect::<Result<Vec<ObjectId>>>()
            .inspect_err(|e| log::error!("execbuffer: {e}"))?;

        let mut pinned = 0;
        let result = self.submit(handles, &ids, exec, &mut pinned);

        for &id in &ids[..pinned] {
            self.unpin(id);
        }
        self.reap_pending();
        self.check_lists();

        if let Err(e) = &result {
            log::warn!(
                "execbuffer failed with {}/{} buffers pinned: {}",
                pinned,
                ids.len(),
                e
            );
        }
        result
    }

    fn submit(
        &mut self,
        handles: &HandleTable,
        ids: &[ObjectId],
        exec: &mut ExecBuffer,
        pinned: &mut usize,
    ) -> Result<u32> {
        for (entry, &id) in exec.objects.iter_mut().zip(ids) {
            let obj = self.obj_mut(id);
            obj.pending_read_domains = Domains::empty();
            obj.pending_write_domain = Domains::empty();

            self.pin(id, entry.alignment)?;
            *pinned += 1;
            entry.offset = self.bound_offset(id)?;

            for reloc in &mut entry.relocs {
                let target = handles.get(reloc.target_handle)?;
                self.relocate(id, target, reloc)?;
            }
        }

        let (batch_entry, batch) = match (exec.objects.last(), ids.last()) {
            (Some(entry), Some(&id)) => (entry, id),
            _ => return Err(GemError::invalid("submission with no buffers")),
        };
        let batch_obj = self.obj_mut(batch);
        batch_obj.pending_read_domains = Domains::COMMAND;
        batch_obj.pending_write_domain = Domains::empty();
        let exec_start = self.batch_address(batch, batch_entry.offset, exec)?;

        let mut acc = DomainAccumulator::new();
        for &id in ids {
            let obj = self.obj(id);
            if !obj.is_bound() {
                // Evicted while pinning a later buffer.
                log::error!("{id} lost its aperture binding during validation");
                return Err(GemError::OutOfMemory);
            }
            let (read, write) = (obj.pending_read_domains, obj.pending_write_domain);
            self.object_set_domain(id, read, write, &mut acc)?;
        }

        let mut flush_domains = self.emit_accumulated(&acc)?;
        self.dispatch(exec_start, exec)?;
        flush_domains |= self.retire_commands()?;

        let seqno = self.add_request(flush_domains)?;
        for &id in ids {
            self.move_to_active(id, seqno);
        }
        log::debug!(
            "execbuffer: {} buffers, batch at {:#X}, fence {}",
            ids.len(),
            exec_start,
            seqno
        );
        Ok(seqno)
    }

    fn bound_offset(&self, id: ObjectId) -> Result<GttOffset> {
        self.obj(id)
            .gtt_offset()
            .ok_or_else(|| GemError::invalid(format!("{id} is not bound")))
    }

    /// Apply one relocation of `id` against `target`.
    fn relocate(&mut self, id: ObjectId, target: ObjectId, reloc: &mut Relocation) -> Result<()> {
        // Targets precede their users in the buffer list.
        let Some(target_offset) = self.obj(target).gtt_offset() else {
            log::error!("relocation target {} of {id} is not bound", reloc.target_handle);
            return Err(GemError::invalid(format!(
                "relocation target {} not bound",
                reloc.target_handle
            )));
        };

        let size = self.obj(id).size;
        if reloc.offset > size - 4 || reloc.offset & 3 != 0 {
            log::error!(
                "{id}: bad relocation offset {:#X} (size {:#X})",
                reloc.offset,
                size
            );
            return Err(GemError::invalid(format!(
                "relocation offset {:#X} invalid for {size:#X}-byte object",
                reloc.offset
            )));
        }
        if !reloc.write_domain.is_single() {
            return Err(GemError::invalid(format!(
                "relocation write domain {} has more than one bit",
                reloc.write_domain
            )));
        }
        if (reloc.read_domains | reloc.write_domain).contains(Domains::CPU) {
            return Err(GemError::invalid("relocation names the CPU domain"));
        }

        let target_obj = self.obj_mut(target);
        if !reloc.write_domain.is_empty()
            && !target_obj.pending_write_domain.is_empty()
            && reloc.write_domain != target_obj.pending_write_domain
        {
            log::error!(
                "{target}: write domain conflict, new {} old {}",
                reloc.write_domain,
                target_obj.pending_write_domain
            );
            return Err(GemError::invalid(format!(
                "conflicting write domains {} and {} for relocation target {}",
                reloc.write_domain, target_obj.pending_write_domain, reloc.target_handle
            )));
        }
        target_obj.pending_read_domains |= reloc.read_domains;
        target_obj.pending_write_domain |= reloc.write_domain;

        if target_offset == reloc.presumed_offset {
            return Ok(());
        }

        // The patched word must not be in use by the device or stuck in the
        // CPU cache.
        self.wait_rendering(id)?;
        if self.obj(id).write_domain.contains(Domains::CPU) {
            self.clflush_object(id);
            self.backend().chipset_flush();
            self.obj_mut(id).write_domain = Domains::empty();
        }

        let value = (target_offset + u64::from(reloc.delta)) as u32;
        log::trace!(
            "{id}: reloc @{:#X} -> {:#X} (target {} presumed {:#X})",
            reloc.offset,
            value,
            reloc.target_handle,
            reloc.presumed_offset
        );
        let obj = self.obj_mut(id);
        obj.shadow.write_u32(reloc.offset, value)?;
        obj.dirty = true;
        reloc.presumed_offset = target_offset;
        Ok(())
    }

    /// Device address the batch starts at.
    fn batch_address(&self, batch: ObjectId, offset: GttOffset, exec: &ExecBuffer) -> Result<u32> {
        let size = self.obj(batch).size;
        let end = u64::from(exec.batch_start_offset) + u64::from(exec.batch_len);
        if end > size {
            return Err(GemError::invalid(format!(
                "batch [{:#X}+{:#X}) beyond {size:#X}-byte buffer",
                exec.batch_start_offset, exec.batch_len
            )));
        }
        let start = offset + u64::from(exec.batch_start_offset);
        match u32::try_from(start) {
            Ok(0) | Err(_) => Err(GemError::invalid(format!("batch address {start:#X} unusable"))),
            Ok(start) => Ok(start),
        }
    }

    fn dispatch(&mut self, exec_start: u32, exec: &ExecBuffer) -> Result<()> {
        let batch = Command::BatchStart {
            address: exec_start,
            length: exec.batch_len,
        };
        let mut cmds = Vec::with_capacity(exec.cliprects.len() * 2 + 1);
        if exec.cliprects.is_empty() {
            cmds.push(batch);
        }
        for &rect in &exec.cliprects {
            cmds.push(Command::ClipRect(rect));
            cmds.push(batch);
        }
        self.backend().emit(&encode_all(&cmds))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::RingBackend;
    use crate::gem::tests::make_state;
    use crate::lru::LruList;
    use aperture_common::settings::BackendMode;
    use aperture_common::PAGE_SIZE_U64;

    const PAGE: u64 = PAGE_SIZE_U64;

    fn new_handle(state: &mut GemState, handles: &mut HandleTable, size: u64) -> (Handle, ObjectId) {
        let id = state.create_object(size).unwrap();
        state.add_handle(id);
        (handles.add(id).unwrap(), id)
    }

    fn reloc(target: Handle, offset: u64, write: Domains) -> Relocation {
        Relocation {
            target_handle: target,
            offset,
            delta: 0x10,
            read_domains: Domains::RENDER,
            write_domain: write,
            presumed_offset: u64::MAX,
        }
    }

    fn exec(objects: Vec<ExecObject>) -> ExecBuffer {
        ExecBuffer {
            objects,
            batch_start_offset: 0,
            batch_len: 64,
            cliprects: Vec::new(),
        }
    }

    #[test]
    fn test_submit_patches_and_publishes_fence() {
        let (mut state, backend) = make_state(BackendMode::Deferred, 16);
        let mut handles = HandleTable::new();
        let (target_h, target) = new_handle(&mut state, &mut handles, PAGE);
        let (batch_h, batch) = new_handle(&mut state, &mut handles, PAGE);

        let mut eb = exec(vec![
            ExecObject::new(target_h),
            ExecObject::with_relocs(batch_h, vec![reloc(target_h, 8, Domains::RENDER)]),
        ]);
        let seqno = state.execbuffer(&handles, &mut eb).unwrap();

        let target_offset = eb.objects[0].offset;
        assert_eq!(eb.objects[0].relocs.len(), 0);
        assert_eq!(eb.objects[1].relocs[0].presumed_offset, target_offset);
        let word = state.object(batch).unwrap().shadow.read_u32(8).unwrap();
        assert_eq!(u64::from(word), target_offset + 0x10);

        let t = state.object_info(target).unwrap();
        assert_eq!(t.write_domain, Domains::RENDER);
        assert!(t.busy);
        assert_eq!(t.last_rendering_seqno, seqno);
        assert_eq!(t.list, Some(LruList::Active));
        assert_eq!(t.pin_count, 0);
        let b = state.object_info(batch).unwrap();
        assert!(b.read_domains.contains(Domains::COMMAND));

        backend.run_pending();
        let dispatch = backend.dispatches();
        assert_eq!(dispatch.len(), 1);
        assert_eq!(u64::from(dispatch[0].address), eb.objects[1].offset);
        assert_eq!(dispatch[0].length, 64);
    }

    #[test]
    fn test_presumed_match_skips_patch_and_wait() {
        let (mut state, backend) = make_state(BackendMode::Deferred, 16);
        let mut handles = HandleTable::new();
        let (target_h, _) = new_handle(&mut state, &mut handles, PAGE);
        let (batch_h, batch) = new_handle(&mut state, &mut handles, PAGE);

        let mut first = exec(vec![ExecObject::new(target_h), ExecObject::new(batch_h)]);
        state.execbuffer(&handles, &mut first).unwrap();
        assert!(state.is_busy(batch));
        let offset = first.objects[0].offset;

        let mut r = reloc(target_h, 16, Domains::empty());
        r.presumed_offset = offset;
        let mut second = exec(vec![
            ExecObject::new(target_h),
            ExecObject::with_relocs(batch_h, vec![r]),
        ]);
        state.execbuffer(&handles, &mut second).unwrap();

        // A wait would have run the deferred ring.
        assert_eq!(backend.hws_seqno(), 0);
        assert_eq!(state.object(batch).unwrap().shadow.read_u32(16).unwrap(), 0);
        assert_eq!(second.objects[1].relocs[0].presumed_offset, offset);
    }

    #[test]
    fn test_failed_relocation_rolls_back_pins() {
        let (mut state, _) = make_state(BackendMode::Immediate, 16);
        let mut handles = HandleTable::new();
        let (a_h, a) = new_handle(&mut state, &mut handles, PAGE);
        let (b_h, b) = new_handle(&mut state, &mut handles, PAGE);
        let (batch_h, batch) = new_handle(&mut state, &mut handles, PAGE);
        let domains = |state: &GemState| -> Vec<(Domains, Domains)> {
            [a, b, batch]
                .iter()
                .map(|&id| state.object_info(id).unwrap())
                .map(|i| (i.read_domains, i.write_domain))
                .collect()
        };
        let before = domains(&state);

        let mut to_a = reloc(a_h, 0, Domains::RENDER);
        // `a` is bound first, at the bottom of the aperture.
        to_a.presumed_offset = 0;
        let mut eb = exec(vec![
            ExecObject::new(a_h),
            ExecObject::with_relocs(b_h, vec![to_a]),
            // Misaligned relocation on the third buffer.
            ExecObject::with_relocs(batch_h, vec![reloc(a_h, 6, Domains::empty())]),
        ]);
        let err = state.execbuffer(&handles, &mut eb).unwrap_err();
        assert!(matches!(err, GemError::InvalidArgument(_)));

        for id in [a, b, batch] {
            let info = state.object_info(id).unwrap();
            assert_eq!(info.pin_count, 0);
            assert!(!info.busy);
            assert_eq!(info.list, Some(LruList::Inactive));
        }
        assert_eq!(domains(&state), before);
        assert_eq!(state.outstanding_requests(), 0);
    }

    #[test]
    fn test_unknown_handle_rejected() {
        let (mut state, _) = make_state(BackendMode::Immediate, 4);
        let mut handles = HandleTable::new();
        let (h, id) = new_handle(&mut state, &mut handles, PAGE);
        let mut eb = exec(vec![ExecObject::new(h), ExecObject::new(99)]);
        assert!(matches!(
            state.execbuffer(&handles, &mut eb),
            Err(GemError::UnknownHandle(99))
        ));
        assert_eq!(state.object_info(id).unwrap().pin_count, 0);
        assert!(!state.object(id).unwrap().is_bound());
    }

    #[test]
    fn test_write_domain_conflict() {
        let (mut state, _) = make_state(BackendMode::Immediate, 8);
        let mut handles = HandleTable::new();
        let (t_h, _) = new_handle(&mut state, &mut handles, PAGE);
        let (batch_h, _) = new_handle(&mut state, &mut handles, PAGE);
        let mut eb = exec(vec![
            ExecObject::new(t_h),
            ExecObject::with_relocs(
                batch_h,
                vec![reloc(t_h, 0, Domains::RENDER), reloc(t_h, 4, Domains::SAMPLER)],
            ),
        ]);
        assert!(matches!(
            state.execbuffer(&handles, &mut eb),
            Err(GemError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_target_must_precede_user() {
        let (mut state, _) = make_state(BackendMode::Immediate, 8);
        let mut handles = HandleTable::new();
        let (t_h, _) = new_handle(&mut state, &mut handles, PAGE);
        let (batch_h, _) = new_handle(&mut state, &mut handles, PAGE);
        let mut eb = exec(vec![
            ExecObject::with_relocs(batch_h, vec![reloc(t_h, 0, Domains::empty())]),
            ExecObject::new(t_h),
        ]);
        assert!(state.execbuffer(&handles, &mut eb).is_err());
    }

    #[test]
    fn test_batch_validation() {
        let (mut state, _) = make_state(BackendMode::Immediate, 8);
        let mut handles = HandleTable::new();
        let (pad_h, _) = new_handle(&mut state, &mut handles, PAGE);
        let (batch_h, _) = new_handle(&mut state, &mut handles, PAGE);

        let mut eb = exec(vec![ExecObject::new(pad_h), ExecObject::new(batch_h)]);
        eb.batch_len = 12;
        assert!(state.execbuffer(&handles, &mut eb).is_err());

        eb.batch_len = 0;
        assert!(state.execbuffer(&handles, &mut eb).is_err());

        eb.batch_len = 8;
        eb.batch_start_offset = PAGE as u32;
        assert!(state.execbuffer(&handles, &mut eb).is_err());

        eb.batch_start_offset = 0;
        eb.cliprects = vec![ClipRect { x1: 4, y1: 0, x2: 4, y2: 8 }];
        assert!(state.execbuffer(&handles, &mut eb).is_err());

        assert!(matches!(
            state.execbuffer(&handles, &mut ExecBuffer::default()),
            Err(GemError::InvalidArgument(_))
        ));
        assert_eq!(state.outstanding_requests(), 0);
    }

    #[test]
    fn test_batch_at_address_zero_rejected() {
        let (mut state, _) = make_state(BackendMode::Immediate, 4);
        let mut handles = HandleTable::new();
        let (batch_h, batch) = new_handle(&mut state, &mut handles, PAGE);
        let mut eb = exec(vec![ExecObject::new(batch_h)]);
        assert!(state.execbuffer(&handles, &mut eb).is_err());
        assert_eq!(state.object_info(batch).unwrap().pin_count, 0);

        // Offset into the buffer moves the start off zero.
        eb.batch_start_offset = 8;
        assert!(state.execbuffer(&handles, &mut eb).is_ok());
    }

    #[test]
    fn test_cliprects_dispatch_per_rect() {
        let (mut state, backend) = make_state(BackendMode::Immediate, 8);
        let mut handles = HandleTable::new();
        let (pad_h, _) = new_handle(&mut state, &mut handles, PAGE);
        let (batch_h, _) = new_handle(&mut state, &mut handles, PAGE);
        let mut eb = exec(vec![ExecObject::new(pad_h), ExecObject::new(batch_h)]);
        let rects = vec![
            ClipRect { x1: 0, y1: 0, x2: 8, y2: 8 },
            ClipRect { x1: 8, y1: 8, x2: 16, y2: 16 },
        ];
        eb.cliprects = rects.clone();
        state.execbuffer(&handles, &mut eb).unwrap();

        let dispatches = backend.dispatches();
        assert_eq!(dispatches.len(), 2);
        assert_eq!(dispatches[0].cliprect, Some(rects[0]));
        assert_eq!(dispatches[1].cliprect, Some(rects[1]));
        let barriers = backend.flushes().iter().filter(|f| f.barrier).count();
        assert_eq!(barriers, 1);
    }

    #[test]
    fn test_refused_while_suspended() {
        let (mut state, _) = make_state(BackendMode::Immediate, 8);
        let mut handles = HandleTable::new();
        let (pad_h, _) = new_handle(&mut state, &mut handles, PAGE);
        let (batch_h, _) = new_handle(&mut state, &mut handles, PAGE);
        state.idle().unwrap();
        let mut eb = exec(vec![ExecObject::new(pad_h), ExecObject::new(batch_h)]);
        assert!(matches!(state.execbuffer(&handles, &mut eb), Err(GemError::Busy)));
        state.resume();
        assert!(state.execbuffer(&handles, &mut eb).is_ok());
    }

    #[test]
    fn test_completed_submission_retires_to_lists() {
        let (mut state, _) = make_state(BackendMode::Deferred, 8);
        let mut handles = HandleTable::new();
        let (target_h, target) = new_handle(&mut state, &mut handles, PAGE);
        let (batch_h, batch) = new_handle(&mut state, &mut handles, PAGE);
        let mut eb = exec(vec![
            ExecObject::new(target_h),
            ExecObject::with_relocs(batch_h, vec![reloc(target_h, 0, Domains::RENDER)]),
        ]);
        let seqno = state.execbuffer(&handles, &mut eb).unwrap();
        assert_eq!(state.lru_snapshot(LruList::Active), vec![target, batch]);

        state.wait_request(seqno).unwrap();
        assert!(state.lru_snapshot(LruList::Active).is_empty());
        assert_eq!(state.lru_snapshot(LruList::Flushing), vec![target]);
        assert_eq!(state.lru_snapshot(LruList::Inactive), vec![batch]);
    }
}
