// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Fixed-size little-endian argument records.

use std::io::{self, Cursor};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use aperture_gem::command::ClipRect;

/// A record with a fixed wire size.
pub trait Record: Sized {
    const SIZE: usize;

    fn read_from(cur: &mut Cursor<&[u8]>) -> io::Result<Self>;
    fn write_to(&self, cur: &mut Cursor<&mut [u8]>) -> io::Result<()>;

    fn decode(buf: &[u8]) -> io::Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("record needs {} bytes, got {}", Self::SIZE, buf.len()),
            ));
        }
        Self::read_from(&mut Cursor::new(buf))
    }

    fn encode(&self, buf: &mut [u8]) -> io::Result<()> {
        self.write_to(&mut Cursor::new(buf))
    }

    fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut buf = vec![0; Self::SIZE];
        self.encode(&mut buf)?;
        Ok(buf)
    }
}

/// Per-buffer entry of a submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecObjectRecord {
    pub handle: u32,
    pub relocation_count: u32,
    pub relocs_ptr: u64,
    pub alignment: u64,
    /// Output: aperture offset the buffer executed at.
    pub offset: u64,
}

impl Record for ExecObjectRecord {
    const SIZE: usize = 32;

    fn read_from(cur: &mut Cursor<&[u8]>) -> io::Result<Self> {
        Ok(Self {
            handle: cur.read_u32::<LittleEndian>()?,
            relocation_count: cur.read_u32::<LittleEndian>()?,
            relocs_ptr: cur.read_u64::<LittleEndian>()?,
            alignment: cur.read_u64::<LittleEndian>()?,
            offset: cur.read_u64::<LittleEndian>()?,
        })
    }

    fn write_to(&self, cur: &mut Cursor<&mut [u8]>) -> io::Result<()> {
        cur.write_u32::<LittleEndian>(self.handle)?;
        cur.write_u32::<LittleEndian>(self.relocation_count)?;
        cur.write_u64::<LittleEndian>(self.relocs_ptr)?;
        cur.write_u64::<LittleEndian>(self.alignment)?;
        cur.write_u64::<LittleEndian>(self.offset)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelocationRecord {
    pub target_handle: u32,
    pub delta: u32,
    pub offset: u64,
    pub presumed_offset: u64,
    pub read_domains: u32,
    pub write_domain: u32,
}

impl Record for RelocationRecord {
    const SIZE: usize = 32;

    fn read_from(cur: &mut Cursor<&[u8]>) -> io::Result<Self> {
        Ok(Self {
            target_handle: cur.read_u32::<LittleEndian>()?,
            delta: cur.read_u32::<LittleEndian>()?,
            offset: cur.read_u64::<LittleEndian>()?,
            presumed_offset: cur.read_u64::<LittleEndian>()?,
            read_domains: cur.read_u32::<LittleEndian>()?,
            write_domain: cur.read_u32::<LittleEndian>()?,
        })
    }

    fn write_to(&self, cur: &mut Cursor<&mut [u8]>) -> io::Result<()> {
        cur.write_u32::<LittleEndian>(self.target_handle)?;
        cur.write_u32::<LittleEndian>(self.delta)?;
        cur.write_u64::<LittleEndian>(self.offset)?;
        cur.write_u64::<LittleEndian>(self.presumed_offset)?;
        cur.write_u32::<LittleEndian>(self.read_domains)?;
        cur.write_u32::<LittleEndian>(self.write_domain)
    }
}

/// Submission arguments. `dr1`/`dr4` are drawing-rectangle state carried
/// for compatibility and not interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecBufferArgs {
    pub buffers_ptr: u64,
    pub buffer_count: u32,
    pub batch_start_offset: u32,
    pub batch_len: u32,
    pub dr1: u32,
    pub dr4: u32,
    pub num_cliprects: u32,
    pub cliprects_ptr: u64,
}

impl Record for ExecBufferArgs {
    const SIZE: usize = 40;

    fn read_from(cur: &mut Cursor<&[u8]>) -> io::Result<Self> {
        Ok(Self {
            buffers_ptr: cur.read_u64::<LittleEndian>()?,
            buffer_count: cur.read_u32::<LittleEndian>()?,
            batch_start_offset: cur.read_u32::<LittleEndian>()?,
            batch_len: cur.read_u32::<LittleEndian>()?,
            dr1: cur.read_u32::<LittleEndian>()?,
            dr4: cur.read_u32::<LittleEndian>()?,
            num_cliprects: cur.read_u32::<LittleEndian>()?,
            cliprects_ptr: cur.read_u64::<LittleEndian>()?,
        })
    }

    fn write_to(&self, cur: &mut Cursor<&mut [u8]>) -> io::Result<()> {
        cur.write_u64::<LittleEndian>(self.buffers_ptr)?;
        cur.write_u32::<LittleEndian>(self.buffer_count)?;
        cur.write_u32::<LittleEndian>(self.batch_start_offset)?;
        cur.write_u32::<LittleEndian>(self.batch_len)?;
        cur.write_u32::<LittleEndian>(self.dr1)?;
        cur.write_u32::<LittleEndian>(self.dr4)?;
        cur.write_u32::<LittleEndian>(self.num_cliprects)?;
        cur.write_u64::<LittleEndian>(self.cliprects_ptr)
    }
}

impl Record for ClipRect {
    const SIZE: usize = 8;

    fn read_from(cur: &mut Cursor<&[u8]>) -> io::Result<Self> {
        Ok(Self {
            x1: cur.read_u16::<LittleEndian>()?,
            y1: cur.read_u16::<LittleEndian>()?,
            x2: cur.read_u16::<LittleEndian>()?,
            y2: cur.read_u16::<LittleEndian>()?,
        })
    }

    fn write_to(&self, cur: &mut Cursor<&mut [u8]>) -> io::Result<()> {
        cur.write_u16::<LittleEndian>(self.x1)?;
        cur.write_u16::<LittleEndian>(self.y1)?;
        cur.write_u16::<LittleEndian>(self.x2)?;
        cur.write_u16::<LittleEndian>(self.y2)
    }
}

/// `{gtt_start u64, gtt_end u64}`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitArgs {
    pub gtt_start: u64,
    pub gtt_end: u64,
}

impl Record for InitArgs {
    const SIZE: usize = 16;

    fn read_from(cur: &mut Cursor<&[u8]>) -> io::Result<Self> {
        Ok(Self {
            gtt_start: cur.read_u64::<LittleEndian>()?,
            gtt_end: cur.read_u64::<LittleEndian>()?,
        })
    }

    fn write_to(&self, cur: &mut Cursor<&mut [u8]>) -> io::Result<()> {
        cur.write_u64::<LittleEndian>(self.gtt_start)?;
        cur.write_u64::<LittleEndian>(self.gtt_end)
    }
}

/// `{size u64, handle u32, pad u32}`; `handle` is an output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CreateArgs {
    pub size: u64,
    pub handle: u32,
}

impl Record for CreateArgs {
    const SIZE: usize = 16;

    fn read_from(cur: &mut Cursor<&[u8]>) -> io::Result<Self> {
        let size = cur.read_u64::<LittleEndian>()?;
        let handle = cur.read_u32::<LittleEndian>()?;
        cur.read_u32::<LittleEndian>()?;
        Ok(Self { size, handle })
    }

    fn write_to(&self, cur: &mut Cursor<&mut [u8]>) -> io::Result<()> {
        cur.write_u64::<LittleEndian>(self.size)?;
        cur.write_u32::<LittleEndian>(self.handle)?;
        cur.write_u32::<LittleEndian>(0)
    }
}

/// pread/pwrite: `{handle u32, pad u32, offset u64, size u64, data_ptr u64}`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RwArgs {
    pub handle: u32,
    pub offset: u64,
    pub size: u64,
    pub data_ptr: u64,
}

impl Record for RwArgs {
    const SIZE: usize = 32;

    fn read_from(cur: &mut Cursor<&[u8]>) -> io::Result<Self> {
        let handle = cur.read_u32::<LittleEndian>()?;
        cur.read_u32::<LittleEndian>()?;
        Ok(Self {
            handle,
            offset: cur.read_u64::<LittleEndian>()?,
            size: cur.read_u64::<LittleEndian>()?,
            data_ptr: cur.read_u64::<LittleEndian>()?,
        })
    }

    fn write_to(&self, cur: &mut Cursor<&mut [u8]>) -> io::Result<()> {
        cur.write_u32::<LittleEndian>(self.handle)?;
        cur.write_u32::<LittleEndian>(0)?;
        cur.write_u64::<LittleEndian>(self.offset)?;
        cur.write_u64::<LittleEndian>(self.size)?;
        cur.write_u64::<LittleEndian>(self.data_ptr)
    }
}

/// mmap: `{handle u32, pad u32, offset u64, size u64, addr_ptr u64}`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MmapArgs {
    pub handle: u32,
    pub offset: u64,
    pub size: u64,
    pub addr_ptr: u64,
}

impl Record for MmapArgs {
    const SIZE: usize = 32;

    fn read_from(cur: &mut Cursor<&[u8]>) -> io::Result<Self> {
        let handle = cur.read_u32::<LittleEndian>()?;
        cur.read_u32::<LittleEndian>()?;
        Ok(Self {
            handle,
            offset: cur.read_u64::<LittleEndian>()?,
            size: cur.read_u64::<LittleEndian>()?,
            addr_ptr: cur.read_u64::<LittleEndian>()?,
        })
    }

    fn write_to(&self, cur: &mut Cursor<&mut [u8]>) -> io::Result<()> {
        cur.write_u32::<LittleEndian>(self.handle)?;
        cur.write_u32::<LittleEndian>(0)?;
        cur.write_u64::<LittleEndian>(self.offset)?;
        cur.write_u64::<LittleEndian>(self.size)?;
        cur.write_u64::<LittleEndian>(self.addr_ptr)
    }
}

/// `{handle u32, read_domains u32, write_domain u32}`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SetDomainArgs {
    pub handle: u32,
    pub read_domains: u32,
    pub write_domain: u32,
}

impl Record for SetDomainArgs {
    const SIZE: usize = 12;

    fn read_from(cur: &mut Cursor<&[u8]>) -> io::Result<Self> {
        Ok(Self {
            handle: cur.read_u32::<LittleEndian>()?,
            read_domains: cur.read_u32::<LittleEndian>()?,
            write_domain: cur.read_u32::<LittleEndian>()?,
        })
    }

    fn write_to(&self, cur: &mut Cursor<&mut [u8]>) -> io::Result<()> {
        cur.write_u32::<LittleEndian>(self.handle)?;
        cur.write_u32::<LittleEndian>(self.read_domains)?;
        cur.write_u32::<LittleEndian>(self.write_domain)
    }
}

/// pin/unpin: `{handle u32, pad u32, alignment u64, offset u64}`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PinArgs {
    pub handle: u32,
    pub alignment: u64,
    /// Output of pin.
    pub offset: u64,
}

impl Record for PinArgs {
    const SIZE: usize = 24;

    fn read_from(cur: &mut Cursor<&[u8]>) -> io::Result<Self> {
        let handle = cur.read_u32::<LittleEndian>()?;
        cur.read_u32::<LittleEndian>()?;
        Ok(Self {
            handle,
            alignment: cur.read_u64::<LittleEndian>()?,
            offset: cur.read_u64::<LittleEndian>()?,
        })
    }

    fn write_to(&self, cur: &mut Cursor<&mut [u8]>) -> io::Result<()> {
        cur.write_u32::<LittleEndian>(self.handle)?;
        cur.write_u32::<LittleEndian>(0)?;
        cur.write_u64::<LittleEndian>(self.alignment)?;
        cur.write_u64::<LittleEndian>(self.offset)
    }
}

/// busy, close and sw_finish: `{handle u32, value u32}`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleArgs {
    pub handle: u32,
    /// Busy flag on output of busy; unused otherwise.
    pub value: u32,
}

impl Record for HandleArgs {
    const SIZE: usize = 8;

    fn read_from(cur: &mut Cursor<&[u8]>) -> io::Result<Self> {
        Ok(Self {
            handle: cur.read_u32::<LittleEndian>()?,
            value: cur.read_u32::<LittleEndian>()?,
        })
    }

    fn write_to(&self, cur: &mut Cursor<&mut [u8]>) -> io::Result<()> {
        cur.write_u32::<LittleEndian>(self.handle)?;
        cur.write_u32::<LittleEndian>(self.value)
    }
}
