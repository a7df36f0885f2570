// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Command-stream instruction encoding.
//!
//! ## Header Word (32 bits)
//!
//! | Bits    | Field                         |
//! |---------|-------------------------------|
//! | 31:24   | Opcode                        |
//! | 16      | Barrier (FLUSH only)          |
//! | 15:8    | Invalidate domains (FLUSH)    |
//! | 7:0     | Flush domains (FLUSH)         |
//!
//! ## Instructions
//!
//! | Opcode | Name           | Payload words                       |
//! |--------|----------------|-------------------------------------|
//! | 0x00   | NOOP           | -                                   |
//! | 0x02   | USER_INTERRUPT | -                                   |
//! | 0x04   | FLUSH          | -                                   |
//! | 0x21   | STORE_SEQNO    | seqno                               |
//! | 0x31   | BATCH_START    | address, length                     |
//! | 0x7D   | CLIP_RECT      | x1 \| y1 << 16, x2 \| y2 << 16       |

use aperture_common::{GemError, Result};

use crate::domain::Domains;

/// Instruction opcode from header bits [31:24].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Noop = 0x00,
    UserInterrupt = 0x02,
    Flush = 0x04,
    StoreSeqno = 0x21,
    BatchStart = 0x31,
    ClipRect = 0x7D,
}

impl Opcode {
    fn from_raw(v: u32) -> Option<Self> {
        match v {
            0x00 => Some(Self::Noop),
            0x02 => Some(Self::UserInterrupt),
            0x04 => Some(Self::Flush),
            0x21 => Some(Self::StoreSeqno),
            0x31 => Some(Self::BatchStart),
            0x7D => Some(Self::ClipRect),
            _ => None,
        }
    }

    /// Payload words following the header.
    pub fn payload_len(self) -> usize {
        match self {
            Self::Noop | Self::UserInterrupt | Self::Flush => 0,
            Self::StoreSeqno => 1,
            Self::BatchStart | Self::ClipRect => 2,
        }
    }
}

const BARRIER_BIT: u32 = 1 << 16;

/// A raw header word.
#[derive(Debug, Clone, Copy)]
pub struct CommandHeader(u32);

impl CommandHeader {
    pub fn new(raw: u32) -> Self {
        Self(raw)
    }

    fn with_opcode(op: Opcode) -> Self {
        Self((op as u32) << 24)
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    pub fn opcode(&self) -> Option<Opcode> {
        Opcode::from_raw(self.0 >> 24)
    }

    /// Invalidate mask (bits [15:8]).
    pub fn invalidate_domains(&self) -> Domains {
        Domains::from_bits_truncate((self.0 >> 8) & 0xFF)
    }

    /// Flush mask (bits [7:0]).
    pub fn flush_domains(&self) -> Domains {
        Domains::from_bits_truncate(self.0 & 0xFF)
    }

    pub fn is_barrier(&self) -> bool {
        self.0 & BARRIER_BIT != 0
    }
}

/// Clip rectangle applied to a batch dispatch; the end corner is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClipRect {
    pub x1: u16,
    pub y1: u16,
    pub x2: u16,
    pub y2: u16,
}

impl ClipRect {
    pub fn is_empty(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }
}

/// A decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Noop,
    UserInterrupt,
    Flush {
        invalidate: Domains,
        flush: Domains,
        barrier: bool,
    },
    StoreSeqno(u32),
    BatchStart { address: u32, length: u32 },
    ClipRect(ClipRect),
}

impl Command {
    /// Append the encoded words to `out`.
    pub fn encode(&self, out: &mut Vec<u32>) {
        match *self {
            Command::Noop => out.push(CommandHeader::with_opcode(Opcode::Noop).raw()),
            Command::UserInterrupt => {
                out.push(CommandHeader::with_opcode(Opcode::UserInterrupt).raw())
            }
            Command::Flush {
                invalidate,
                flush,
                barrier,
            } => {
                let mut word = CommandHeader::with_opcode(Opcode::Flush).raw();
                word |= (invalidate.bits() & 0xFF) << 8;
                word |= flush.bits() & 0xFF;
                if barrier {
                    word |= BARRIER_BIT;
                }
                out.push(word);
            }
            Command::StoreSeqno(seqno) => {
                out.push(CommandHeader::with_opcode(Opcode::StoreSeqno).raw());
                out.push(seqno);
            }
            Command::BatchStart { address, length } => {
                out.push(CommandHeader::with_opcode(Opcode::BatchStart).raw());
                out.push(address);
                out.push(length);
            }
            Command::ClipRect(rect) => {
                out.push(CommandHeader::with_opcode(Opcode::ClipRect).raw());
                out.push(rect.x1 as u32 | (rect.y1 as u32) << 16);
                out.push(rect.x2 as u32 | (rect.y2 as u32) << 16);
            }
        }
    }

    /// Decode one instruction from the front of `words`, returning it and the
    /// number of words consumed.
    pub fn decode(words: &[u32]) -> Result<(Command, usize)> {
        let Some(&raw) = words.first() else {
            return Err(GemError::invalid("empty command stream"));
        };
        let header = CommandHeader::new(raw);
        let op = header
            .opcode()
            .ok_or_else(|| GemError::invalid(format!("unknown opcode in header {raw:#010X}")))?;
        let len = 1 + op.payload_len();
        if words.len() < len {
            return Err(GemError::invalid(format!(
                "truncated {op:?}: need {len} words, have {}",
                words.len()
            )));
        }

        let cmd = match op {
            Opcode::Noop => Command::Noop,
            Opcode::UserInterrupt => Command::UserInterrupt,
            Opcode::Flush => Command::Flush {
                invalidate: header.invalidate_domains(),
                flush: header.flush_domains(),
                barrier: header.is_barrier(),
            },
            Opcode::StoreSeqno => Command::StoreSeqno(words[1]),
            Opcode::BatchStart => Command::BatchStart {
                address: words[1],
                length: words[2],
            },
            Opcode::ClipRect => Command::ClipRect(ClipRect {
                x1: (words[1] & 0xFFFF) as u16,
                y1: (words[1] >> 16) as u16,
                x2: (words[2] & 0xFFFF) as u16,
                y2: (words[2] >> 16) as u16,
            }),
        };
        Ok((cmd, len))
    }
}

/// Decode a whole stream.
pub fn decode_stream(mut words: &[u32]) -> Result<Vec<Command>> {
    let mut cmds = Vec::new();
    while !words.is_empty() {
        let (cmd, used) = Command::decode(words)?;
        cmds.push(cmd);
        words = &words[used..];
    }
    Ok(cmds)
}

/// Encode a sequence of commands.
pub fn encode_all(cmds: &[Command]) -> Vec<u32> {
    let mut out = Vec::with_capacity(cmds.len() * 3);
    for cmd in cmds {
        cmd.encode(&mut out);
    }
    out
}
