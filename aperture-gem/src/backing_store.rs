// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Page-granular backing storage for buffer objects.
//!
//! Each object owns a [`ShadowStore`]: an anonymous mapping created the first
//! time its contents are touched and kept until the object is destroyed, so
//! data survives unbind/rebind cycles. Binding pins the object's pages through
//! the device-wide [`BackingStore`], which enforces an optional pinned-page
//! budget and counts writebacks of dirty pages.

use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use memmap2::MmapMut;
use parking_lot::Mutex;

use aperture_common::{page_count, GemError, Result, PAGE_SIZE};

// ---------------------------------------------------------------------------
// Shadow store
// ---------------------------------------------------------------------------

/// Persistent contents of one object. Reads of a never-populated store
/// return zeros without creating the mapping.
pub struct ShadowStore {
    map: Option<Arc<Mutex<MmapMut>>>,
    len: usize,
}

impl ShadowStore {
    pub fn new(len: usize) -> Self {
        Self { map: None, len }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether the mapping has been created.
    pub fn is_populated(&self) -> bool {
        self.map.is_some()
    }

    fn populate(&mut self) -> Result<&Arc<Mutex<MmapMut>>> {
        if self.map.is_none() {
            let map = MmapMut::map_anon(self.len).map_err(|e| {
                log::warn!("shadow store: map_anon({:#X}) failed: {}", self.len, e);
                GemError::OutOfMemory
            })?;
            self.map = Some(Arc::new(Mutex::new(map)));
        }
        self.map.as_ref().ok_or(GemError::OutOfMemory)
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<usize> {
        check_range(offset, len, self.len)
    }

    /// Copy `buf.len()` bytes starting at `offset` into `buf`.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = self.check_range(offset, buf.len())?;
        match &self.map {
            Some(map) => buf.copy_from_slice(&map.lock()[start..start + buf.len()]),
            None => buf.fill(0),
        }
        Ok(())
    }

    /// Copy `data` into the store at `offset`.
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let start = self.check_range(offset, data.len())?;
        let map = self.populate()?;
        map.lock()[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        let mut word = [0u8; 4];
        self.read(offset, &mut word)?;
        Ok(LittleEndian::read_u32(&word))
    }

    pub fn write_u32(&mut self, offset: u64, value: u32) -> Result<()> {
        let mut word = [0u8; 4];
        LittleEndian::write_u32(&mut word, value);
        self.write(offset, &word)
    }

    /// A CPU view of `[offset, offset + len)` sharing this store's pages.
    pub fn mapping(&mut self, offset: u64, len: usize) -> Result<ObjectMapping> {
        let start = self.check_range(offset, len)?;
        let contents = self.populate()?.clone();
        Ok(ObjectMapping {
            contents,
            start,
            len,
        })
    }
}

fn check_range(offset: u64, len: usize, size: usize) -> Result<usize> {
    let start = usize::try_from(offset)
        .map_err(|_| GemError::invalid(format!("offset {offset:#X} out of range")))?;
    match start.checked_add(len) {
        Some(end) if end <= size => Ok(start),
        _ => Err(GemError::invalid(format!(
            "access [{offset:#X}+{len:#X}) exceeds size {size:#X}"
        ))),
    }
}

/// CPU mapping of part of an object's contents.
///
/// The mapping keeps the contents alive, not the object: it stays valid after
/// the last handle is closed.
#[derive(Clone)]
pub struct ObjectMapping {
    contents: Arc<Mutex<MmapMut>>,
    start: usize,
    len: usize,
}

impl ObjectMapping {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read at `offset` within the mapping.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let at = self.start + check_range(offset, buf.len(), self.len)?;
        buf.copy_from_slice(&self.contents.lock()[at..at + buf.len()]);
        Ok(())
    }

    /// Write at `offset` within the mapping.
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        let at = self.start + check_range(offset, data.len(), self.len)?;
        self.contents.lock()[at..at + data.len()].copy_from_slice(data);
        Ok(())
    }
}

impl std::fmt::Debug for ObjectMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectMapping")
            .field("start", &self.start)
            .field("len", &self.len)
            .finish()
    }
}

impl std::fmt::Debug for ShadowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowStore")
            .field("len", &self.len)
            .field("populated", &self.is_populated())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Page pinning
// ---------------------------------------------------------------------------

/// Pages pinned for one bound object. Only [`BackingStore::release_pages`]
/// gives them back.
#[derive(Debug, PartialEq, Eq)]
pub struct PageList {
    count: usize,
}

impl PageList {
    pub fn page_count(&self) -> usize {
        self.count
    }

    pub fn byte_len(&self) -> usize {
        self.count * PAGE_SIZE
    }
}

/// Device-wide page accounting.
#[derive(Debug, Default)]
pub struct BackingStore {
    limit: Option<usize>,
    pinned: usize,
    writeback_pages: u64,
    clflushed_pages: u64,
}

impl BackingStore {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    fn pin_one(&mut self) -> bool {
        if self.limit.is_some_and(|limit| self.pinned >= limit) {
            return false;
        }
        self.pinned += 1;
        true
    }

    /// Pin every page of `shadow`. Either all pages are pinned or none are.
    pub fn acquire_pages(&mut self, shadow: &mut ShadowStore) -> Result<PageList> {
        let count = page_count(shadow.len() as u64);

        for acquired in 0..count {
            if !self.pin_one() {
                self.pinned -= acquired;
                log::debug!(
                    "backing store: pinned-page budget exhausted after {}/{} pages",
                    acquired,
                    count
                );
                return Err(GemError::OutOfMemory);
            }
        }

        if let Err(e) = shadow.populate() {
            self.pinned -= count;
            return Err(e);
        }

        Ok(PageList { count })
    }

    /// Unpin `pages`. Dirty pages are queued for writeback.
    pub fn release_pages(&mut self, pages: PageList, dirty: bool) {
        assert!(
            self.pinned >= pages.count,
            "releasing {} pages with only {} pinned",
            pages.count,
            self.pinned
        );
        self.pinned -= pages.count;
        if dirty {
            self.writeback_pages += pages.count as u64;
        }
    }

    /// Flush the CPU cache lines covering `pages`.
    pub fn clflush(&mut self, pages: &PageList) {
        self.clflushed_pages += pages.count as u64;
    }

    pub fn pinned_pages(&self) -> usize {
        self.pinned
    }

    pub fn writeback_pages(&self) -> u64 {
        self.writeback_pages
    }

    pub fn clflushed_pages(&self) -> u64 {
        self.clflushed_pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unpopulated_reads_zero() {
        let shadow = ShadowStore::new(PAGE_SIZE);
        let mut buf = [0xAAu8; 16];
        shadow.read(8, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 16]);
        assert!(!shadow.is_populated());
    }

    #[test]
    fn test_content_survives_repin() {
        let mut store = BackingStore::new(None);
        let mut shadow = ShadowStore::new(PAGE_SIZE * 2);

        let pages = store.acquire_pages(&mut shadow).unwrap();
        shadow.write_u32(PAGE_SIZE as u64 + 4, 0xDEAD_BEEF).unwrap();
        store.release_pages(pages, true);

        let pages = store.acquire_pages(&mut shadow).unwrap();
        assert_eq!(shadow.read_u32(PAGE_SIZE as u64 + 4).unwrap(), 0xDEAD_BEEF);
        assert_eq!(pages.page_count(), 2);
        store.release_pages(pages, false);
        assert_eq!(store.writeback_pages(), 2);
    }

    #[test]
    fn test_out_of_bounds_access() {
        let mut shadow = ShadowStore::new(PAGE_SIZE);
        assert!(matches!(
            shadow.write_u32(PAGE_SIZE as u64 - 2, 1),
            Err(GemError::InvalidArgument(_))
        ));
        let mut buf = [0u8; 2];
        assert!(shadow.read(u64::MAX, &mut buf).is_err());
    }

    #[test]
    fn test_budget_is_all_or_nothing() {
        let mut store = BackingStore::new(Some(3));
        let mut small = ShadowStore::new(PAGE_SIZE * 2);
        let mut big = ShadowStore::new(PAGE_SIZE * 2);

        let pages = store.acquire_pages(&mut small).unwrap();
        assert_eq!(store.pinned_pages(), 2);

        assert!(matches!(
            store.acquire_pages(&mut big),
            Err(GemError::OutOfMemory)
        ));
        assert_eq!(store.pinned_pages(), 2);
        assert!(!big.is_populated());

        store.release_pages(pages, false);
        assert!(store.acquire_pages(&mut big).is_ok());
    }

    #[test]
    fn test_mapping_aliases_contents() {
        let mut shadow = ShadowStore::new(PAGE_SIZE * 2);
        let map = shadow.mapping(PAGE_SIZE as u64, PAGE_SIZE).unwrap();
        assert_eq!(map.len(), PAGE_SIZE);

        map.write(8, &[1, 2, 3, 4]).unwrap();
        let mut buf = [0u8; 4];
        shadow.read(PAGE_SIZE as u64 + 8, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);

        shadow.write_u32(PAGE_SIZE as u64 + 16, 0x0A0B_0C0D).unwrap();
        map.read(16, &mut buf).unwrap();
        assert_eq!(LittleEndian::read_u32(&buf), 0x0A0B_0C0D);

        assert!(map.write(PAGE_SIZE as u64 - 2, &[0; 4]).is_err());
        assert!(shadow.mapping(PAGE_SIZE as u64, PAGE_SIZE + 1).is_err());
    }

    #[test]
    fn test_mapping_outlives_store() {
        let mut shadow = ShadowStore::new(PAGE_SIZE);
        let map = shadow.mapping(0, PAGE_SIZE).unwrap();
        shadow.write(0, b"kept").unwrap();
        drop(shadow);
        let mut buf = [0u8; 4];
        map.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"kept");
    }

    #[test]
    fn test_clflush_counts_pages() {
        let mut store = BackingStore::new(None);
        let mut shadow = ShadowStore::new(PAGE_SIZE * 3);
        let pages = store.acquire_pages(&mut shadow).unwrap();
        store.clflush(&pages);
        assert_eq!(store.clflushed_pages(), 3);
        store.release_pages(pages, false);
        assert_eq!(store.pinned_pages(), 0);
    }
}
