// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! ioctl-style entry points over [`Device`].
//!
//! Each call takes the command number, an argument record that is decoded on
//! entry and re-encoded on return, and the caller's memory for any pointers
//! the record carries. The result is `0` or a negative errno.

use std::collections::BTreeMap;
use std::sync::Arc;

use aperture_common::{align_up, GemError, PAGE_SIZE_U64};
use aperture_gem::command::ClipRect;
use aperture_gem::{ClientId, Device, Domains, ExecBuffer, ExecObject, ObjectMapping, Relocation};
use parking_lot::Mutex;

use crate::error::{ServiceError, ServiceResult};
use crate::records::{
    CreateArgs, ExecBufferArgs, ExecObjectRecord, HandleArgs, InitArgs, MmapArgs, PinArgs,
    Record, RelocationRecord, RwArgs, SetDomainArgs,
};
use crate::user_memory::UserMemory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GemIoctl {
    Close,
    Init,
    Execbuffer,
    Pin,
    Unpin,
    Busy,
    Throttle,
    EnterVt,
    LeaveVt,
    Create,
    Pread,
    Pwrite,
    Mmap,
    SetDomain,
    SwFinish,
}

impl GemIoctl {
    pub fn from_raw(cmd: u32) -> Option<Self> {
        Some(match cmd {
            0x09 => Self::Close,
            0x13 => Self::Init,
            0x14 => Self::Execbuffer,
            0x15 => Self::Pin,
            0x16 => Self::Unpin,
            0x17 => Self::Busy,
            0x18 => Self::Throttle,
            0x19 => Self::EnterVt,
            0x1A => Self::LeaveVt,
            0x1B => Self::Create,
            0x1C => Self::Pread,
            0x1D => Self::Pwrite,
            0x1E => Self::Mmap,
            0x1F => Self::SetDomain,
            0x20 => Self::SwFinish,
            _ => return None,
        })
    }

    pub fn raw(self) -> u32 {
        match self {
            Self::Close => 0x09,
            Self::Init => 0x13,
            Self::Execbuffer => 0x14,
            Self::Pin => 0x15,
            Self::Unpin => 0x16,
            Self::Busy => 0x17,
            Self::Throttle => 0x18,
            Self::EnterVt => 0x19,
            Self::LeaveVt => 0x1A,
            Self::Create => 0x1B,
            Self::Pread => 0x1C,
            Self::Pwrite => 0x1D,
            Self::Mmap => 0x1E,
            Self::SetDomain => 0x1F,
            Self::SwFinish => 0x20,
        }
    }
}

fn domains(raw: u32) -> ServiceResult<Domains> {
    Domains::from_raw(raw)
        .ok_or_else(|| GemError::invalid(format!("unknown domain bits {raw:#X}")).into())
}

fn read_record<R: Record>(mem: &dyn UserMemory, addr: u64) -> ServiceResult<R> {
    let mut buf = vec![0; R::SIZE];
    mem.copy_from_user(addr, &mut buf)?;
    Ok(R::decode(&buf)?)
}

fn write_record<R: Record>(mem: &mut dyn UserMemory, addr: u64, record: &R) -> ServiceResult<()> {
    mem.copy_to_user(addr, &record.to_bytes()?)
}

/// Address of entry `index` in a user array of `R`.
fn element_addr<R: Record>(base: u64, index: usize) -> ServiceResult<u64> {
    (index as u64)
        .checked_mul(R::SIZE as u64)
        .and_then(|off| base.checked_add(off))
        .ok_or(ServiceError::Fault { addr: base, len: R::SIZE })
}

/// Submission decoded from user memory, with the record addresses needed to
/// copy results back.
struct DecodedExec {
    exec: ExecBuffer,
    object_addrs: Vec<u64>,
    reloc_addrs: Vec<Vec<u64>>,
}

/// Base of the window that CPU mappings are handed out from.
const MAP_BASE: u64 = 0x7F00_0000_0000;

/// Mappings handed out by `Mmap`, keyed by the address returned to the
/// client. Addresses are never reused.
struct MappingTable {
    next: u64,
    maps: BTreeMap<u64, ObjectMapping>,
}

impl MappingTable {
    fn insert(&mut self, map: ObjectMapping) -> u64 {
        let addr = self.next;
        // One unmapped guard page between mappings.
        self.next += align_up(map.len() as u64, PAGE_SIZE_U64) + PAGE_SIZE_U64;
        self.maps.insert(addr, map);
        addr
    }
}

pub struct GemService {
    device: Arc<Device>,
    mappings: Mutex<MappingTable>,
}

impl GemService {
    pub fn new(device: Arc<Device>) -> Self {
        Self {
            device,
            mappings: Mutex::new(MappingTable {
                next: MAP_BASE,
                maps: BTreeMap::new(),
            }),
        }
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    /// The mapping returned by `Mmap` at `addr`.
    pub fn mapping(&self, addr: u64) -> Option<ObjectMapping> {
        self.mappings.lock().maps.get(&addr).cloned()
    }

    /// Drop the mapping at `addr`. Returns whether one existed.
    pub fn unmap(&self, addr: u64) -> bool {
        self.mappings.lock().maps.remove(&addr).is_some()
    }

    /// Run command `cmd` for `client`. Outputs are written back into `args`.
    pub fn ioctl(
        &self,
        client: ClientId,
        cmd: u32,
        args: &mut [u8],
        mem: &mut dyn UserMemory,
    ) -> i32 {
        match self.dispatch(client, cmd, args, mem) {
            Ok(()) => 0,
            Err(e) => {
                let retryable = matches!(&e, ServiceError::Gem(g) if g.is_retryable());
                if retryable {
                    log::debug!("{client}: ioctl {cmd:#X} interrupted: {e}");
                } else {
                    log::warn!("{client}: ioctl {cmd:#X} failed: {e}");
                }
                -e.errno()
            }
        }
    }

    fn dispatch(
        &self,
        client: ClientId,
        cmd: u32,
        args: &mut [u8],
        mem: &mut dyn UserMemory,
    ) -> ServiceResult<()> {
        let Some(ioctl) = GemIoctl::from_raw(cmd) else {
            return Err(ServiceError::UnknownIoctl(cmd));
        };
        log::trace!("{client}: {ioctl:?}");

        match ioctl {
            GemIoctl::Init => {
                let a = InitArgs::decode(args)?;
                self.device.init_aperture(a.gtt_start, a.gtt_end)?;
            }
            GemIoctl::Create => {
                let mut a = CreateArgs::decode(args)?;
                a.handle = self.device.create_object(client, a.size)?;
                a.encode(args)?;
            }
            GemIoctl::Close => {
                let a = HandleArgs::decode(args)?;
                self.device.close_handle(client, a.handle)?;
            }
            GemIoctl::Pread => {
                let a = RwArgs::decode(args)?;
                let len = self.checked_rw_len(client, &a)?;
                let mut buf = vec![0; len];
                self.device.pread(client, a.handle, a.offset, &mut buf)?;
                mem.copy_to_user(a.data_ptr, &buf)?;
            }
            GemIoctl::Pwrite => {
                let a = RwArgs::decode(args)?;
                let len = self.checked_rw_len(client, &a)?;
                let mut buf = vec![0; len];
                mem.copy_from_user(a.data_ptr, &mut buf)?;
                self.device.pwrite(client, a.handle, a.offset, &buf)?;
            }
            GemIoctl::Mmap => {
                let mut a = MmapArgs::decode(args)?;
                if a.size == 0 {
                    return Err(GemError::invalid("empty mapping").into());
                }
                let map = self.device.mmap(client, a.handle, a.offset, a.size)?;
                a.addr_ptr = self.mappings.lock().insert(map);
                log::debug!(
                    "{client}: mapped handle {} [{:#X}+{:#X}) at {:#X}",
                    a.handle,
                    a.offset,
                    a.size,
                    a.addr_ptr
                );
                a.encode(args)?;
            }
            GemIoctl::SetDomain => {
                let a = SetDomainArgs::decode(args)?;
                let read = domains(a.read_domains)?;
                let write = domains(a.write_domain)?;
                self.device.set_domain(client, a.handle, read, write)?;
            }
            GemIoctl::SwFinish => {
                let a = HandleArgs::decode(args)?;
                self.device.sw_finish(client, a.handle)?;
            }
            GemIoctl::Pin => {
                let mut a = PinArgs::decode(args)?;
                a.offset = self.device.pin(client, a.handle, a.alignment)?;
                a.encode(args)?;
            }
            GemIoctl::Unpin => {
                let a = PinArgs::decode(args)?;
                self.device.unpin(client, a.handle)?;
            }
            GemIoctl::Busy => {
                let mut a = HandleArgs::decode(args)?;
                a.value = u32::from(self.device.busy(client, a.handle)?);
                a.encode(args)?;
            }
            GemIoctl::Throttle => self.device.throttle(client)?,
            GemIoctl::EnterVt => self.device.resume(),
            GemIoctl::LeaveVt => self.device.idle()?,
            GemIoctl::Execbuffer => {
                let a = ExecBufferArgs::decode(args)?;
                self.execbuffer(client, &a, mem)?;
            }
        }
        Ok(())
    }

    /// Validate a pread/pwrite range against the object before any copy.
    fn checked_rw_len(&self, client: ClientId, a: &RwArgs) -> ServiceResult<usize> {
        let info = self.device.object_info(client, a.handle)?;
        let in_range = a.offset.checked_add(a.size).is_some_and(|end| end <= info.size);
        if !in_range {
            return Err(GemError::invalid(format!(
                "range {:#X}+{:#X} outside object of {:#X} bytes",
                a.offset, a.size, info.size
            ))
            .into());
        }
        usize::try_from(a.size).map_err(|_| GemError::invalid("size overflows usize").into())
    }

    fn execbuffer(
        &self,
        client: ClientId,
        args: &ExecBufferArgs,
        mem: &mut dyn UserMemory,
    ) -> ServiceResult<()> {
        let mut decoded = Self::read_exec(args, mem)?;
        let result = self.device.execbuffer(client, &mut decoded.exec);

        // Presumed offsets go back whether or not the submission ran.
        for (obj, addrs) in decoded.exec.objects.iter().zip(&decoded.reloc_addrs) {
            for (reloc, &addr) in obj.relocs.iter().zip(addrs) {
                let mut rec: RelocationRecord = read_record(mem, addr)?;
                rec.presumed_offset = reloc.presumed_offset;
                write_record(mem, addr, &rec)?;
            }
        }

        let seqno = result?;
        for (obj, &addr) in decoded.exec.objects.iter().zip(&decoded.object_addrs) {
            let mut rec: ExecObjectRecord = read_record(mem, addr)?;
            rec.offset = obj.offset;
            write_record(mem, addr, &rec)?;
        }
        log::debug!(
            "{client}: execbuffer of {} buffers -> seqno {seqno}",
            decoded.exec.objects.len()
        );
        Ok(())
    }

    fn read_exec(args: &ExecBufferArgs, mem: &dyn UserMemory) -> ServiceResult<DecodedExec> {
        let count = args.buffer_count as usize;
        let mut exec = ExecBuffer {
            objects: Vec::new(),
            batch_start_offset: args.batch_start_offset,
            batch_len: args.batch_len,
            cliprects: Vec::new(),
        };
        let mut object_addrs = Vec::new();
        let mut reloc_addrs = Vec::new();

        for i in 0..count {
            let addr = element_addr::<ExecObjectRecord>(args.buffers_ptr, i)?;
            let rec: ExecObjectRecord = read_record(mem, addr)?;

            let mut relocs = Vec::new();
            let mut addrs = Vec::new();
            for j in 0..rec.relocation_count as usize {
                let reloc_addr = element_addr::<RelocationRecord>(rec.relocs_ptr, j)?;
                let r: RelocationRecord = read_record(mem, reloc_addr)?;
                relocs.push(Relocation {
                    target_handle: r.target_handle,
                    offset: r.offset,
                    delta: r.delta,
                    read_domains: domains(r.read_domains)?,
                    write_domain: domains(r.write_domain)?,
                    presumed_offset: r.presumed_offset,
                });
                addrs.push(reloc_addr);
            }

            exec.objects.push(ExecObject {
                handle: rec.handle,
                relocs,
                alignment: rec.alignment,
                offset: rec.offset,
            });
            object_addrs.push(addr);
            reloc_addrs.push(addrs);
        }

        for i in 0..args.num_cliprects as usize {
            let addr = element_addr::<ClipRect>(args.cliprects_ptr, i)?;
            exec.cliprects.push(read_record(mem, addr)?);
        }

        Ok(DecodedExec {
            exec,
            object_addrs,
            reloc_addrs,
        })
    }
}
