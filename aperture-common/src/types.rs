// SPDX-FileCopyrightText: 2025 aperture contributors
// SPDX-License-Identifier: GPL-3.0-or-later

/// Client-visible object handle.
pub type Handle = u32;

/// Offset into the device aperture.
pub type GttOffset = u64;

/// Backing-store page size (4 KiB).
pub const PAGE_SIZE: usize = 0x1000;

/// Page size as u64 for address math.
pub const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

/// Page shift (log2 of PAGE_SIZE).
pub const PAGE_SHIFT: u32 = 12;

/// Page mask for alignment checks.
pub const PAGE_MASK: u64 = PAGE_SIZE_U64 - 1;

/// Invalid handle sentinel.
pub const INVALID_HANDLE: Handle = 0;

/// Reserved "no fence" sequence number.
pub const NO_SEQNO: u32 = 0;

/// Align a value up to the given power-of-two alignment.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

/// Align a value down to the given power-of-two alignment.
#[inline]
pub const fn align_down(value: u64, alignment: u64) -> u64 {
    value & !(alignment - 1)
}

/// Round a value up to a multiple of `multiple`, which need not be a power of two.
#[inline]
pub const fn round_up(value: u64, multiple: u64) -> u64 {
    value.div_ceil(multiple) * multiple
}

/// Check if a value is page-aligned.
#[inline]
pub const fn is_page_aligned(value: u64) -> bool {
    value & PAGE_MASK == 0
}

/// Number of pages covering `size` bytes.
#[inline]
pub const fn page_count(size: u64) -> usize {
    (align_up(size, PAGE_SIZE_U64) >> PAGE_SHIFT) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, PAGE_SIZE_U64), 0);
        assert_eq!(align_up(1, PAGE_SIZE_U64), PAGE_SIZE_U64);
        assert_eq!(align_up(PAGE_SIZE_U64, PAGE_SIZE_U64), PAGE_SIZE_U64);
        assert_eq!(
            align_up(PAGE_SIZE_U64 + 1, PAGE_SIZE_U64),
            PAGE_SIZE_U64 * 2
        );
    }

    #[test]
    fn test_align_down() {
        assert_eq!(align_down(1, PAGE_SIZE_U64), 0);
        assert_eq!(
            align_down(PAGE_SIZE_U64 + 1, PAGE_SIZE_U64),
            PAGE_SIZE_U64
        );
    }

    #[test]
    fn test_round_up_non_power_of_two() {
        assert_eq!(round_up(0x1000, 0x3000), 0x3000);
        assert_eq!(round_up(0x3000, 0x3000), 0x3000);
        assert_eq!(round_up(0x3001, 0x3000), 0x6000);
    }

    #[test]
    fn test_page_count() {
        assert_eq!(page_count(0), 0);
        assert_eq!(page_count(1), 1);
        assert_eq!(page_count(PAGE_SIZE_U64 * 3), 3);
    }

    #[test]
    fn test_is_page_aligned() {
        assert!(is_page_aligned(0));
        assert!(is_page_aligned(PAGE_SIZE_U64 * 100));
        assert!(!is_page_aligned(PAGE_SIZE_U64 + 1));
    }
}
