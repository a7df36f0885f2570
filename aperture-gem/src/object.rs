// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

use aperture_common::GttOffset;

use crate::backend::GttMapping;
use crate::backing_store::{PageList, ShadowStore};
use crate::domain::Domains;
use crate::lru::{LruLink, LruList};
use crate::range_allocator::Block;

/// Arena key of a buffer object. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub u64);

impl std::fmt::Display for ObjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

/// Everything a bound object holds in the aperture.
#[derive(Debug)]
pub struct Binding {
    pub block: Block,
    pub pages: PageList,
    pub mapping: GttMapping,
}

/// A buffer object.
#[derive(Debug)]
pub struct GemObject {
    pub id: ObjectId,
    /// Byte size, a whole number of pages.
    pub size: u64,
    pub shadow: ShadowStore,

    pub read_domains: Domains,
    pub write_domain: Domains,
    /// Staged by a submission, committed once every buffer is validated.
    pub pending_read_domains: Domains,
    pub pending_write_domain: Domains,

    pub binding: Option<Binding>,
    pub pin_count: u32,

    /// Referenced by commands whose fence has not passed, or waiting for a
    /// flush of device writes. Keeps the object alive without handles.
    pub busy: bool,
    pub last_rendering_seqno: u32,
    pub lru: Option<LruLink>,

    /// Open client handles across all clients.
    pub handle_count: u32,
    /// Pages hold data not yet written back.
    pub dirty: bool,
}

impl GemObject {
    /// A fresh object, zero-filled by the CPU.
    pub fn new(id: ObjectId, size: u64) -> Self {
        Self {
            id,
            size,
            shadow: ShadowStore::new(size as usize),
            read_domains: Domains::CPU,
            write_domain: Domains::CPU,
            pending_read_domains: Domains::empty(),
            pending_write_domain: Domains::empty(),
            binding: None,
            pin_count: 0,
            busy: false,
            last_rendering_seqno: 0,
            lru: None,
            handle_count: 0,
            dirty: false,
        }
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }

    pub fn gtt_offset(&self) -> Option<GttOffset> {
        self.binding.as_ref().map(|b| b.block.start())
    }

    pub fn list(&self) -> Option<LruList> {
        self.lru.map(|link| link.list)
    }

    /// Holds a device-side write that has not been flushed.
    pub fn has_gpu_write(&self) -> bool {
        !self.write_domain.gpu().is_empty()
    }

    /// No remaining owner.
    pub fn is_orphan(&self) -> bool {
        self.handle_count == 0 && !self.busy
    }
}

/// Read-only view of an object for callers outside the device lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub id: ObjectId,
    pub size: u64,
    pub read_domains: Domains,
    pub write_domain: Domains,
    pub gtt_offset: Option<GttOffset>,
    pub pin_count: u32,
    pub busy: bool,
    pub last_rendering_seqno: u32,
    pub list: Option<LruList>,
}

impl From<&GemObject> for ObjectInfo {
    fn from(obj: &GemObject) -> Self {
        Self {
            id: obj.id,
            size: obj.size,
            read_domains: obj.read_domains,
            write_domain: obj.write_domain,
            gtt_offset: obj.gtt_offset(),
            pin_count: obj.pin_count,
            busy: obj.busy,
            last_rendering_seqno: obj.last_rendering_seqno,
            list: obj.list(),
        }
    }
}
