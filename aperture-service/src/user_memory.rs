// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Caller address space seen by the ioctl layer.

use crate::error::{ServiceError, ServiceResult};

/// Copy-in/copy-out access to the caller's memory.
pub trait UserMemory {
    fn copy_from_user(&self, addr: u64, buf: &mut [u8]) -> ServiceResult<()>;
    fn copy_to_user(&mut self, addr: u64, data: &[u8]) -> ServiceResult<()>;
}

/// Base of the address range a [`UserBuffer`] hands out. Address 0 always
/// faults.
const USER_BASE: u64 = 0x1_0000;

/// Flat, growable user address space with bump allocation.
#[derive(Debug, Default)]
pub struct UserBuffer {
    bytes: Vec<u8>,
}

impl UserBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `len` zeroed bytes, 8-byte aligned. Returns their address.
    pub fn alloc(&mut self, len: usize) -> u64 {
        let start = self.bytes.len().next_multiple_of(8);
        self.bytes.resize(start + len, 0);
        USER_BASE + start as u64
    }

    /// Place `data` in fresh memory and return its address.
    pub fn push(&mut self, data: &[u8]) -> u64 {
        let addr = self.alloc(data.len());
        let start = (addr - USER_BASE) as usize;
        self.bytes[start..start + data.len()].copy_from_slice(data);
        addr
    }

    pub fn read(&self, addr: u64, len: usize) -> ServiceResult<Vec<u8>> {
        let mut buf = vec![0; len];
        self.copy_from_user(addr, &mut buf)?;
        Ok(buf)
    }

    fn range(&self, addr: u64, len: usize) -> ServiceResult<std::ops::Range<usize>> {
        addr.checked_sub(USER_BASE)
            .and_then(|off| usize::try_from(off).ok())
            .and_then(|start| Some(start..start.checked_add(len)?))
            .filter(|range| range.end <= self.bytes.len())
            .ok_or(ServiceError::Fault { addr, len })
    }
}

impl UserMemory for UserBuffer {
    fn copy_from_user(&self, addr: u64, buf: &mut [u8]) -> ServiceResult<()> {
        let range = self.range(addr, buf.len())?;
        buf.copy_from_slice(&self.bytes[range]);
        Ok(())
    }

    fn copy_to_user(&mut self, addr: u64, data: &[u8]) -> ServiceResult<()> {
        let range = self.range(addr, data.len())?;
        self.bytes[range].copy_from_slice(data);
        Ok(())
    }
}
