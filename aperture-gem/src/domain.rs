// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Cache-domain coherency tracking.
//!
//! Every object carries a `(read_domains, write_domain)` pair describing which
//! agents may hold a valid copy of its contents and which one (at most one) is
//! allowed to dirty it. Moving an object to new domains computes the caches
//! that must be flushed (stale writes pushed to memory) and invalidated (stale
//! reads discarded). Nothing is emitted here: transitions are merged into a
//! [`DomainAccumulator`] so a whole submission produces a single flush.
//!
//! Examples, written as `(read, write)`:
//!
//! | step                         | before       | after              | flush | invalidate |
//! |------------------------------|--------------|--------------------|-------|------------|
//! | batch read by command stream | (CPU, CPU)   | (CPU+COMMAND, 0)   | CPU   | COMMAND    |
//! | render target drawn to       | (CPU, CPU)   | (RENDER, RENDER)   | CPU   | RENDER     |
//! | render target read back      | (RENDER, RENDER) | (CPU, CPU)     | RENDER| CPU        |

use bitflags::bitflags;

bitflags! {
    /// Cache domains an object can be read through or written from.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Domains: u32 {
        const CPU         = 0x01;
        const RENDER      = 0x02;
        const SAMPLER     = 0x04;
        const COMMAND     = 0x08;
        const INSTRUCTION = 0x10;
        const VERTEX      = 0x20;

        /// Every device-side domain.
        const GPU = Self::RENDER.bits()
            | Self::SAMPLER.bits()
            | Self::COMMAND.bits()
            | Self::INSTRUCTION.bits()
            | Self::VERTEX.bits();
    }
}

impl Domains {
    /// True when at most one domain bit is set (the write-domain invariant).
    #[inline]
    pub fn is_single(self) -> bool {
        self.bits().count_ones() <= 1
    }

    /// The device-side part of this set.
    #[inline]
    pub fn gpu(self) -> Domains {
        self & Domains::GPU
    }

    /// Parse a raw mask, rejecting unknown bits.
    pub fn from_raw(raw: u32) -> Option<Domains> {
        Domains::from_bits(raw)
    }
}

impl std::fmt::Display for Domains {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "-");
        }
        let names = [
            (Self::CPU, "cpu"),
            (Self::RENDER, "render"),
            (Self::SAMPLER, "sampler"),
            (Self::COMMAND, "command"),
            (Self::INSTRUCTION, "instruction"),
            (Self::VERTEX, "vertex"),
        ];
        let mut first = true;
        for (bit, name) in names {
            if self.contains(bit) {
                if !first {
                    write!(f, "+")?;
                }
                write!(f, "{name}")?;
                first = false;
            }
        }
        Ok(())
    }
}

/// Outcome of moving one object to a new `(read, write)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainTransition {
    /// Read set to commit.
    pub read_domains: Domains,
    /// Write domain to commit, or `None` to keep the current annotation.
    pub write_domain: Option<Domains>,
    /// Caches holding stale data for the new readers.
    pub invalidate: Domains,
    /// Caches holding writes the new readers must see.
    pub flush: Domains,
    /// The object is being written and its pages must be written back.
    pub dirties: bool,
}

impl DomainTransition {
    /// Compute the transition from `(cur_read, cur_write)` to `(read, write)`.
    pub fn compute(cur_read: Domains, cur_write: Domains, read: Domains, write: Domains) -> Self {
        debug_assert!(cur_write.is_single());
        debug_assert!(write.is_single());

        // Readers may coexist; only a new writer narrows the read set.
        let dirties = !write.is_empty();
        let read = if dirties { read } else { read | cur_read };

        let mut flush = Domains::empty();
        let mut invalidate = Domains::empty();

        if !cur_write.is_empty() && cur_write != read {
            flush |= cur_write;
            invalidate |= read & !cur_write;
        }
        invalidate |= read & !cur_read;

        let write_domain = if !(write | flush).is_empty() {
            Some(write)
        } else {
            None
        };

        Self {
            read_domains: read,
            write_domain,
            invalidate,
            flush,
            dirties,
        }
    }

    /// Whether the CPU caches of the object must be flushed before commit.
    #[inline]
    pub fn touches_cpu(&self) -> bool {
        (self.flush | self.invalidate).contains(Domains::CPU)
    }

    /// Invalidating the CPU while a device cache still holds writes: the
    /// device must finish and flush before the CPU cache is invalidated.
    #[inline]
    pub fn needs_rendering_barrier(&self) -> bool {
        self.invalidate.contains(Domains::CPU) && !self.flush.gpu().is_empty()
    }
}

/// Invalidate/flush sets collected across every object touched by one
/// operation, emitted once at the end.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DomainAccumulator {
    pub invalidate: Domains,
    pub flush: Domains,
}

impl DomainAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, transition: &DomainTransition) {
        self.invalidate |= transition.invalidate;
        self.flush |= transition.flush;
    }

    pub fn is_empty(&self) -> bool {
        self.invalidate.is_empty() && self.flush.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CPU: Domains = Domains::CPU;
    const RENDER: Domains = Domains::RENDER;
    const COMMAND: Domains = Domains::COMMAND;
    const NONE: Domains = Domains::empty();

    #[test]
    fn test_batch_buffer_read_by_command_stream() {
        let t = DomainTransition::compute(CPU, CPU, COMMAND, NONE);
        assert_eq!(t.read_domains, CPU | COMMAND);
        assert_eq!(t.flush, CPU);
        assert_eq!(t.invalidate, COMMAND);
        assert_eq!(t.write_domain, Some(NONE));
        assert!(t.touches_cpu());
        assert!(!t.needs_rendering_barrier());
        assert!(!t.dirties);
    }

    #[test]
    fn test_render_target_round_trip() {
        let to_gpu = DomainTransition::compute(CPU, CPU, RENDER, RENDER);
        assert_eq!(to_gpu.read_domains, RENDER);
        assert_eq!(to_gpu.write_domain, Some(RENDER));
        assert_eq!(to_gpu.flush, CPU);
        assert_eq!(to_gpu.invalidate, RENDER);
        assert!(to_gpu.dirties);

        let to_cpu = DomainTransition::compute(RENDER, RENDER, CPU, CPU);
        assert_eq!(to_cpu.flush, RENDER);
        assert_eq!(to_cpu.invalidate, CPU);
        assert!(to_cpu.needs_rendering_barrier());
    }

    #[test]
    fn test_constant_buffer_rewritten_by_cpu() {
        // (CPU+RENDER, 0) -> (CPU, CPU): no previous writer, no new readers.
        let t = DomainTransition::compute(CPU | RENDER, NONE, CPU, CPU);
        assert!(t.flush.is_empty());
        assert!(t.invalidate.is_empty());
        assert_eq!(t.write_domain, Some(CPU));
        assert_eq!(t.read_domains, CPU);
    }

    #[test]
    fn test_read_only_transition_keeps_write_annotation() {
        // Already readable by the CPU with no writer: nothing to do.
        let t = DomainTransition::compute(CPU, NONE, CPU, NONE);
        assert_eq!(t.write_domain, None);
        assert!(t.flush.is_empty());
        assert!(t.invalidate.is_empty());
    }

    #[test]
    fn test_same_domain_write_is_noop() {
        let t = DomainTransition::compute(CPU, CPU, CPU, CPU);
        assert!(t.flush.is_empty());
        assert!(t.invalidate.is_empty());
        assert!(!t.touches_cpu());
    }

    #[test]
    fn test_write_domain_stays_single() {
        let singles = [
            NONE,
            Domains::CPU,
            Domains::RENDER,
            Domains::SAMPLER,
            Domains::COMMAND,
            Domains::INSTRUCTION,
            Domains::VERTEX,
        ];
        let mut read = CPU;
        let mut write = CPU;
        for step in 0..200usize {
            let w = singles[step % singles.len()];
            let r = Domains::from_bits_truncate((step as u32 * 7) & 0x3F) | w;
            let t = DomainTransition::compute(read, write, r, w);
            if let Some(nw) = t.write_domain {
                write = nw;
            }
            read = t.read_domains;
            assert!(write.is_single(), "step {step}: write {write:?}");
        }
    }

    #[test]
    fn test_accumulator_merges() {
        let mut acc = DomainAccumulator::new();
        assert!(acc.is_empty());
        acc.merge(&DomainTransition::compute(CPU, CPU, COMMAND, NONE));
        acc.merge(&DomainTransition::compute(CPU, CPU, RENDER, RENDER));
        assert_eq!(acc.flush, CPU);
        assert_eq!(acc.invalidate, COMMAND | RENDER);
    }

    #[test]
    fn test_display() {
        assert_eq!((CPU | RENDER).to_string(), "cpu+render");
        assert_eq!(NONE.to_string(), "-");
    }
}
